//! In-process transport for tests and demos.
//!
//! A [`MemoryNetwork`] stands in for the SSH engine and the TCP network
//! beneath it: rendezvous endpoints are bound under a name, dialers
//! authenticate against the endpoint's [`AccessPolicy`], remote binds get a
//! port from a shared table, and inbound connections are
//! [`tokio::io::duplex`] pipes. Faults can be injected with
//! [`MemoryNetwork::fail_next_dials`] and [`MemoryNetwork::sever`].

use crate::error::{RsshError, RsshResult};
use crate::keys::AuthMethods;
use crate::transport::{
    bound_port, AccessPolicy, Channel, ClientSession, Dialer, Endpoint, LivenessProbe,
    NewChannel, RejectReason, RemoteListener, ServerConnection,
};
use ssh_key::PublicKey;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// First port handed out for `port 0` binds.
pub const FIRST_DYNAMIC_PORT: u16 = 40000;

const STREAM_BUFFER: usize = 64 * 1024;

type ChannelReply = Result<CancellationToken, (RejectReason, String)>;

/// Shared in-process network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

struct NetworkState {
    endpoints: HashMap<String, EndpointEntry>,
    ports: HashMap<u16, PortEntry>,
    next_port: u16,
    next_id: u64,
    failing_dials: u32,
    dial_count: u64,
}

impl Default for NetworkState {
    fn default() -> Self {
        Self {
            endpoints: HashMap::new(),
            ports: HashMap::new(),
            next_port: FIRST_DYNAMIC_PORT,
            next_id: 1,
            failing_dials: 0,
            dial_count: 0,
        }
    }
}

impl NetworkState {
    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn port_in_use(&self, port: u16) -> bool {
        self.ports
            .get(&port)
            .is_some_and(|entry| !entry.closed.is_cancelled())
    }

    fn allocate_port(&mut self) -> u16 {
        loop {
            let port = self.next_port;
            self.next_port = if port == u16::MAX {
                FIRST_DYNAMIC_PORT
            } else {
                port + 1
            };
            if !self.port_in_use(port) {
                return port;
            }
        }
    }
}

struct EndpointEntry {
    id: u64,
    policy: Arc<dyn AccessPolicy>,
    incoming: mpsc::UnboundedSender<MemoryConnection>,
    closed: CancellationToken,
}

struct PortEntry {
    listener_id: u64,
    inbound: mpsc::UnboundedSender<(DuplexStream, String)>,
    /// Cancelled when the listener closes (child of the session token).
    closed: CancellationToken,
    link: Arc<Link>,
}

/// Connection state shared by the two ends of one dialed session.
struct Link {
    closed: CancellationToken,
    reset: AtomicBool,
}

impl Link {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            closed: CancellationToken::new(),
            reset: AtomicBool::new(false),
        })
    }
}

fn refused(addr: &str) -> RsshError {
    RsshError::Dial(format!("dial tcp {addr}: connection refused"))
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start accepting dial-home sessions at `addr`.
    pub fn bind(&self, addr: &str, policy: Arc<dyn AccessPolicy>) -> RsshResult<MemoryEndpoint> {
        let mut state = self.lock();
        if state
            .endpoints
            .get(addr)
            .is_some_and(|entry| !entry.closed.is_cancelled())
        {
            return Err(RsshError::Bind(format!("{addr}: address already in use")));
        }
        let id = state.next_id();
        let (incoming, rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();
        state.endpoints.insert(
            addr.to_string(),
            EndpointEntry {
                id,
                policy,
                incoming,
                closed: closed.clone(),
            },
        );
        Ok(MemoryEndpoint {
            id,
            addr: addr.to_string(),
            network: self.clone(),
            incoming: AsyncMutex::new(rx),
            closed,
        })
    }

    pub fn dialer(&self) -> MemoryDialer {
        MemoryDialer {
            network: self.clone(),
        }
    }

    /// Make the next `n` dials fail as if the host were unreachable.
    pub fn fail_next_dials(&self, n: u32) {
        self.lock().failing_dials = n;
    }

    /// Total dial attempts seen, failed ones included.
    pub fn dial_count(&self) -> u64 {
        self.lock().dial_count
    }

    /// Connect to a reverse-bound port. Only the port of `addr` is used.
    pub fn connect(&self, addr: &str) -> RsshResult<DuplexStream> {
        let port = bound_port(addr).map_err(|_| refused(addr))?;
        let mut state = self.lock();
        let origin = format!("memory-peer-{}", state.next_id());
        let entry = match state.ports.get(&port) {
            Some(entry) if !entry.closed.is_cancelled() => entry,
            Some(_) => {
                state.ports.remove(&port);
                return Err(refused(addr));
            }
            None => return Err(refused(addr)),
        };
        let (local, remote) = tokio::io::duplex(STREAM_BUFFER);
        entry
            .inbound
            .send((remote, origin))
            .map_err(|_| refused(addr))?;
        Ok(local)
    }

    /// Whether a live listener currently owns `port`.
    pub fn is_bound(&self, port: u16) -> bool {
        self.lock().port_in_use(port)
    }

    /// Simulate the network dropping the session that owns `port`.
    ///
    /// Both ends observe an abnormal close. Returns `false` if nothing was
    /// bound there.
    pub fn sever(&self, port: u16) -> bool {
        let state = self.lock();
        match state.ports.get(&port) {
            Some(entry) if !entry.closed.is_cancelled() => {
                entry.link.reset.store(true, Ordering::SeqCst);
                entry.link.closed.cancel();
                debug!(port, "severed memory session");
                true
            }
            _ => false,
        }
    }

    fn release_port(&self, port: u16, listener_id: u64) {
        let mut state = self.lock();
        if state
            .ports
            .get(&port)
            .is_some_and(|entry| entry.listener_id == listener_id)
        {
            state.ports.remove(&port);
        }
    }

    fn unbind(&self, addr: &str, endpoint_id: u64) {
        let mut state = self.lock();
        if state
            .endpoints
            .get(addr)
            .is_some_and(|entry| entry.id == endpoint_id)
        {
            state.endpoints.remove(addr);
        }
    }
}

impl LivenessProbe for MemoryNetwork {
    async fn probe(&self, addr: &str, _timeout: Duration) -> bool {
        self.connect(addr).is_ok()
    }
}

// ── Client half ───────────────────────────────────────────────────────

/// Dials endpoints bound on a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryDialer {
    network: MemoryNetwork,
}

impl Dialer for MemoryDialer {
    type Session = MemorySession;

    async fn dial(&self, addr: &str, user: &str, auth: &AuthMethods) -> RsshResult<MemorySession> {
        let (policy, incoming, id) = {
            let mut state = self.network.lock();
            state.dial_count += 1;
            if state.failing_dials > 0 {
                state.failing_dials -= 1;
                return Err(refused(addr));
            }
            let (policy, incoming) = match state.endpoints.get(addr) {
                Some(entry) if !entry.closed.is_cancelled() => {
                    (entry.policy.clone(), entry.incoming.clone())
                }
                _ => return Err(refused(addr)),
            };
            (policy, incoming, state.next_id())
        };

        let remote = format!("memory-client-{id}");
        let by_key = policy.authenticate_public_key(user, &remote, auth.public_key.public_key());
        if !by_key && !policy.authenticate_password(user, &remote, &auth.password) {
            return Err(RsshError::Dial(
                "ssh: handshake failed: unable to authenticate".into(),
            ));
        }

        let link = Link::new();
        let (channels, channel_rx) = mpsc::unbounded_channel();
        let connection = MemoryConnection {
            remote_addr: remote,
            user: user.to_string(),
            channels: AsyncMutex::new(channel_rx),
            link: link.clone(),
        };
        incoming.send(connection).map_err(|_| refused(addr))?;

        Ok(MemorySession {
            network: self.network.clone(),
            policy,
            channels,
            link,
        })
    }
}

/// Client end of a dialed session. Dropping it closes the session.
pub struct MemorySession {
    network: MemoryNetwork,
    policy: Arc<dyn AccessPolicy>,
    channels: mpsc::UnboundedSender<MemoryNewChannel>,
    link: Arc<Link>,
}

impl ClientSession for MemorySession {
    type Listener = MemoryListener;
    type Channel = MemoryChannel;

    async fn listen(&self, bind_spec: &str) -> RsshResult<MemoryListener> {
        if self.link.closed.is_cancelled() {
            return Err(RsshError::ConnectionClosed);
        }
        let (host, requested) = bind_spec
            .rsplit_once(':')
            .and_then(|(host, port)| port.parse::<u16>().ok().map(|p| (host.to_string(), p)))
            .ok_or_else(|| RsshError::Bind(format!("invalid bind spec {bind_spec:?}")))?;

        if !self
            .policy
            .allow_reverse_forward(&host, u32::from(requested))
        {
            return Err(RsshError::PermissionDenied(format!(
                "tcpip-forward {bind_spec} refused by peer"
            )));
        }

        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let closed = self.link.closed.child_token();
        let mut state = self.network.lock();
        let port = if requested == 0 {
            state.allocate_port()
        } else if state.port_in_use(requested) {
            return Err(RsshError::Bind(format!("{bind_spec}: address already in use")));
        } else {
            requested
        };
        let listener_id = state.next_id();
        state.ports.insert(
            port,
            PortEntry {
                listener_id,
                inbound,
                closed: closed.clone(),
                link: self.link.clone(),
            },
        );

        Ok(MemoryListener {
            network: self.network.clone(),
            addr: format!("{host}:{port}"),
            port,
            listener_id,
            inbound: inbound_rx,
            closed,
        })
    }

    async fn open_channel(&self, name: &str, extra_data: &[u8]) -> RsshResult<MemoryChannel> {
        if self.link.closed.is_cancelled() {
            return Err(RsshError::ConnectionClosed);
        }
        let (reply, reply_rx) = oneshot::channel();
        self.channels
            .send(MemoryNewChannel {
                channel_type: name.to_string(),
                extra_data: extra_data.to_vec(),
                reply,
            })
            .map_err(|_| RsshError::ConnectionClosed)?;

        tokio::select! {
            answer = reply_rx => match answer {
                Ok(Ok(closed)) => Ok(MemoryChannel { closed }),
                Ok(Err((reason, message))) => Err(RsshError::ChannelRejected { reason, message }),
                Err(_) => Err(RsshError::Transport(format!("peer dropped {name} channel request"))),
            },
            _ = self.link.closed.cancelled() => Err(RsshError::ConnectionClosed),
        }
    }

    fn close(&self) {
        self.link.closed.cancel();
    }

    async fn closed(&self) {
        self.link.closed.cancelled().await;
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.link.closed.cancel();
    }
}

/// Client end of an accepted channel.
pub struct MemoryChannel {
    closed: CancellationToken,
}

impl Channel for MemoryChannel {
    async fn close(self) -> RsshResult<()> {
        self.closed.cancel();
        Ok(())
    }
}

/// Remote bind owned by a [`MemorySession`]. Dropping it releases the port.
pub struct MemoryListener {
    network: MemoryNetwork,
    addr: String,
    port: u16,
    listener_id: u64,
    inbound: mpsc::UnboundedReceiver<(DuplexStream, String)>,
    closed: CancellationToken,
}

impl MemoryListener {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl RemoteListener for MemoryListener {
    type Stream = DuplexStream;

    fn local_addr(&self) -> String {
        self.addr.clone()
    }

    async fn accept(&mut self) -> RsshResult<Option<(DuplexStream, String)>> {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Ok(None),
            next = self.inbound.recv() => Ok(next),
        }
    }

    fn close(&mut self) {
        self.closed.cancel();
        self.network.release_port(self.port, self.listener_id);
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        RemoteListener::close(self);
    }
}

// ── Server half ───────────────────────────────────────────────────────

/// Rendezvous endpoint bound on a [`MemoryNetwork`]. Dropping it unbinds.
pub struct MemoryEndpoint {
    id: u64,
    addr: String,
    network: MemoryNetwork,
    incoming: AsyncMutex<mpsc::UnboundedReceiver<MemoryConnection>>,
    closed: CancellationToken,
}

impl MemoryEndpoint {
    pub fn close(&self) {
        self.closed.cancel();
        self.network.unbind(&self.addr, self.id);
    }
}

impl Endpoint for MemoryEndpoint {
    type Connection = MemoryConnection;

    fn local_addr(&self) -> String {
        self.addr.clone()
    }

    async fn accept(&self) -> RsshResult<Option<MemoryConnection>> {
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Ok(None),
            next = incoming.recv() => Ok(next),
        }
    }
}

impl Drop for MemoryEndpoint {
    fn drop(&mut self) {
        self.close();
    }
}

/// Server end of a dialed session.
pub struct MemoryConnection {
    remote_addr: String,
    user: String,
    channels: AsyncMutex<mpsc::UnboundedReceiver<MemoryNewChannel>>,
    link: Arc<Link>,
}

impl ServerConnection for MemoryConnection {
    type NewChannel = MemoryNewChannel;

    fn remote_addr(&self) -> String {
        self.remote_addr.clone()
    }

    fn user(&self) -> String {
        self.user.clone()
    }

    async fn next_channel(&self) -> Option<MemoryNewChannel> {
        let mut channels = self.channels.lock().await;
        tokio::select! {
            biased;
            _ = self.link.closed.cancelled() => None,
            next = channels.recv() => next,
        }
    }

    async fn wait(&self) -> RsshResult<()> {
        self.link.closed.cancelled().await;
        if self.link.reset.load(Ordering::SeqCst) {
            Err(RsshError::Transport("connection reset by peer".into()))
        } else {
            Ok(())
        }
    }

    fn close(&self) {
        self.link.closed.cancel();
    }
}

/// Pending channel-open request on a [`MemoryConnection`].
pub struct MemoryNewChannel {
    channel_type: String,
    extra_data: Vec<u8>,
    reply: oneshot::Sender<ChannelReply>,
}

impl MemoryNewChannel {
    /// Accept the channel instead of rejecting it.
    pub fn accept(self) -> RsshResult<AcceptedChannel> {
        let closed = CancellationToken::new();
        self.reply
            .send(Ok(closed.clone()))
            .map_err(|_| RsshError::ConnectionClosed)?;
        Ok(AcceptedChannel { closed })
    }
}

impl NewChannel for MemoryNewChannel {
    fn channel_type(&self) -> &str {
        &self.channel_type
    }

    fn extra_data(&self) -> &[u8] {
        &self.extra_data
    }

    async fn reject(self, reason: RejectReason, message: &str) -> RsshResult<()> {
        self.reply
            .send(Err((reason, message.to_string())))
            .map_err(|_| RsshError::ConnectionClosed)
    }
}

/// Server view of a channel accepted via [`MemoryNewChannel::accept`].
pub struct AcceptedChannel {
    closed: CancellationToken,
}

impl AcceptedChannel {
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }
}

/// Policy that grants everything. Only meant for tests and demos.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn authenticate_password(&self, _user: &str, _remote: &str, _password: &str) -> bool {
        true
    }

    fn authenticate_public_key(&self, _user: &str, _remote: &str, _key: &PublicKey) -> bool {
        true
    }

    fn allow_local_forward(&self, _host: &str, _port: u32) -> bool {
        true
    }

    fn allow_reverse_forward(&self, _host: &str, _port: u32) -> bool {
        true
    }

    fn allow_session(&self, _request_type: &str) -> bool {
        true
    }
}
