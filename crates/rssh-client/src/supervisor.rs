//! Reconnection supervisor.
//!
//! Probes the reverse-bound port on a fixed period and relaunches the whole
//! dial, bind, announce, serve cycle when the port stops answering. At most
//! one relaunch is in flight at any time: the `reconnecting` flag is raised
//! before every launch and only cleared once the new binding exists.

use crate::backoff::{CeilingMode, RetryState};
use crate::connector::RealizedBinding;
use crate::reverse::{ConnectionHandler, ReversePipeline, ServeExit, StreamOf};
use rssh_core::{join_host_port, Dialer, LivenessProbe, RsshError, RsshResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const PROBE_INTERVAL: Duration = Duration::from_secs(60);
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Whether probing continues after a reconnection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum MonitorPolicy {
    /// Keep probing after every reconnection.
    #[default]
    #[serde(rename = "rearm")]
    Rearm,
    /// Stop the ticker once the first reconnection is launched, as deployed
    /// peers do.
    #[serde(rename = "once")]
    StopAfterFirstReconnect,
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub monitor: MonitorPolicy,
    /// Relaunch after a terminal pipeline failure instead of returning it.
    /// Invalid key material is returned regardless.
    pub restart_on_failure: bool,
    /// Ceiling behaviour of the delay between failed relaunches.
    pub restart_ceiling: CeilingMode,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            probe_interval: PROBE_INTERVAL,
            probe_timeout: PROBE_TIMEOUT,
            monitor: MonitorPolicy::default(),
            restart_on_failure: false,
            restart_ceiling: CeilingMode::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorState {
    /// First launch, no binding yet.
    Connecting,
    Connected,
    Reconnecting,
    Stopped,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SupervisorState::Connecting => "connecting",
            SupervisorState::Connected => "connected",
            SupervisorState::Reconnecting => "reconnecting",
            SupervisorState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// State shared between the probe loop and pipeline instances.
struct Shared {
    reconnecting: AtomicBool,
    /// Generation of the instance allowed to publish a binding.
    generation: Mutex<u64>,
    launches: AtomicU64,
    state: watch::Sender<SupervisorState>,
    binding: watch::Sender<Option<RealizedBinding>>,
}

impl Shared {
    fn new() -> Self {
        let (state, _) = watch::channel(SupervisorState::Connecting);
        let (binding, _) = watch::channel(None);
        Self {
            reconnecting: AtomicBool::new(false),
            generation: Mutex::new(0),
            launches: AtomicU64::new(0),
            state,
            binding,
        }
    }

    fn begin_launch(&self) -> u64 {
        let mut generation = self.generation.lock().unwrap_or_else(PoisonError::into_inner);
        *generation += 1;
        self.reconnecting.store(true, Ordering::SeqCst);
        self.launches.fetch_add(1, Ordering::SeqCst);
        self.state.send_replace(if *generation == 1 {
            SupervisorState::Connecting
        } else {
            SupervisorState::Reconnecting
        });
        *generation
    }

    fn established(&self, generation: u64, binding: &RealizedBinding) {
        let current = self.generation.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != generation {
            debug!(generation, current = *current, "ignoring binding from replaced instance");
            return;
        }
        info!(
            port = binding.actual_port,
            address = %binding.listening_address,
            generation,
            "reverse binding established"
        );
        self.binding.send_replace(Some(binding.clone()));
        self.reconnecting.store(false, Ordering::SeqCst);
        self.state.send_replace(SupervisorState::Connected);
    }

    fn is_current(&self, generation: u64) -> bool {
        *self.generation.lock().unwrap_or_else(PoisonError::into_inner) == generation
    }
}

/// Read-only view of a running [`Supervisor`].
#[derive(Clone)]
pub struct SupervisorStatus {
    shared: Arc<Shared>,
}

impl SupervisorStatus {
    pub fn state(&self) -> SupervisorState {
        *self.shared.state.borrow()
    }

    pub fn is_reconnecting(&self) -> bool {
        self.shared.reconnecting.load(Ordering::SeqCst)
    }

    /// Most recent binding, kept across a reconnection until replaced.
    pub fn binding(&self) -> Option<RealizedBinding> {
        self.shared.binding.borrow().clone()
    }

    /// Pipeline launches so far, the initial one included.
    pub fn launches(&self) -> u64 {
        self.shared.launches.load(Ordering::SeqCst)
    }

    pub fn watch_binding(&self) -> watch::Receiver<Option<RealizedBinding>> {
        self.shared.binding.subscribe()
    }

    /// Wait until the supervisor reaches `state`.
    pub async fn wait_for(&self, state: SupervisorState) {
        let mut rx = self.shared.state.subscribe();
        let _ = rx.wait_for(|s| *s == state).await;
    }
}

type InstanceEvent = (u64, RsshResult<ServeExit>);

struct Instance {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Keeps a reverse binding alive.
pub struct Supervisor<D, H, P> {
    pipeline: Arc<ReversePipeline<D, H>>,
    probe: P,
    home_host: String,
    config: SupervisorConfig,
    shared: Arc<Shared>,
}

impl<D, H, P> Supervisor<D, H, P>
where
    D: Dialer,
    H: ConnectionHandler<StreamOf<D>>,
    P: LivenessProbe,
{
    pub fn new(pipeline: ReversePipeline<D, H>, probe: P, config: SupervisorConfig) -> Self {
        let home_host = pipeline.target().home_host.clone();
        Self {
            pipeline: Arc::new(pipeline),
            probe,
            home_host,
            config,
            shared: Arc::new(Shared::new()),
        }
    }

    pub fn status(&self) -> SupervisorStatus {
        SupervisorStatus {
            shared: self.shared.clone(),
        }
    }

    /// Launch the pipeline and keep it alive until `cancel` fires.
    ///
    /// Returns `Ok(())` on cancellation. A terminal pipeline failure, or one
    /// that happens while a launch is still in flight, is returned unless
    /// `restart_on_failure` is set. Restarts are paced like dial retries
    /// and the delay resets once a binding is established. Invalid key
    /// material is always returned.
    pub async fn run(&self, cancel: &CancellationToken) -> RsshResult<()> {
        let (events_tx, mut events) = mpsc::unbounded_channel::<InstanceEvent>();
        let mut bindings = self.shared.binding.subscribe();
        let mut instance = self.launch(cancel, &events_tx);

        let period = self.config.probe_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut monitoring = true;

        let mut restarts = RetryState::new(-1, self.config.restart_ceiling);
        let restart_delay = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(restart_delay);
        let mut restart_pending = false;

        let outcome = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                Some((generation, result)) = events.recv() => {
                    if !self.shared.is_current(generation) {
                        continue;
                    }
                    match result {
                        Ok(exit) => debug!(?exit, "reverse instance ended, waiting for probe"),
                        Err(e) if e.is_cancelled() => {}
                        Err(e @ RsshError::InvalidKeyMaterial(_)) => {
                            error!(error = %e, "reverse pipeline failed");
                            break Err(e);
                        }
                        Err(e) if e.is_terminal() || self.shared.reconnecting.load(Ordering::SeqCst) => {
                            error!(error = %e, "reverse pipeline failed");
                            if !self.config.restart_on_failure {
                                break Err(e);
                            }
                            instance.cancel.cancel();
                            let delay = restarts.timeout();
                            warn!(?delay, attempt = restarts.fail_count() + 1, "restarting reverse pipeline");
                            restart_delay.as_mut().reset(Instant::now() + delay);
                            restart_pending = true;
                        }
                        Err(e) => warn!(error = %e, "reverse server failed, waiting for probe"),
                    }
                }
                () = &mut restart_delay, if restart_pending => {
                    restart_pending = false;
                    restarts.record_failure();
                    instance = self.launch(cancel, &events_tx);
                }
                Ok(()) = bindings.changed() => {
                    restarts = RetryState::new(-1, self.config.restart_ceiling);
                }
                _ = ticker.tick(), if monitoring => {
                    if self.shared.reconnecting.load(Ordering::SeqCst) {
                        debug!("reconnect in flight, skipping probe");
                        continue;
                    }
                    let current = self.shared.binding.borrow().clone();
                    let Some(binding) = current else {
                        continue;
                    };
                    let aim = join_host_port(&self.home_host, binding.actual_port);
                    debug!(addr = %aim, "probing reverse port");

                    let timeout = self.config.probe_timeout;
                    let probe = tokio::time::timeout(timeout, self.probe.probe(&aim, timeout));
                    let alive = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        alive = probe => Some(alive.unwrap_or(false)),
                    };
                    match alive {
                        None => break Ok(()),
                        Some(true) => continue,
                        Some(false) => {}
                    }

                    warn!(addr = %aim, "reverse port unreachable, reconnecting");
                    instance.cancel.cancel();
                    instance = self.launch(cancel, &events_tx);
                    if self.config.monitor == MonitorPolicy::StopAfterFirstReconnect {
                        monitoring = false;
                        info!("liveness monitoring stopped after reconnect");
                    }
                }
            }
        };

        instance.cancel.cancel();
        if let Err(e) = instance.task.await {
            if e.is_panic() {
                error!(error = %e, "reverse instance panicked");
            }
        }
        self.shared.state.send_replace(SupervisorState::Stopped);
        outcome
    }

    fn launch(
        &self,
        cancel: &CancellationToken,
        events: &mpsc::UnboundedSender<InstanceEvent>,
    ) -> Instance {
        let generation = self.shared.begin_launch();
        info!(
            generation,
            home = %self.pipeline.target().address(),
            "dialling home via ssh"
        );

        let token = cancel.child_token();
        let pipeline = self.pipeline.clone();
        let shared = self.shared.clone();
        let events = events.clone();
        let instance = token.clone();
        let task = tokio::spawn(async move {
            let established = move |binding: &RealizedBinding| shared.established(generation, binding);
            let result = pipeline.run(established, &instance).await;
            let _ = events.send((generation, result));
        });

        Instance {
            cancel: token,
            task,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{Connector, DialTarget};
    use crate::testing::{auth, spawn_home, target, Discard, HOME};
    use rssh_core::memory::{MemoryDialer, MemoryNetwork, MemorySession, FIRST_DYNAMIC_PORT};
    use rssh_core::{AuthMethods, ClientSession, Credentials};
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Semaphore;

    /// Each dial consumes one permit.
    #[derive(Clone)]
    struct GatedDialer {
        inner: MemoryDialer,
        gate: Arc<Semaphore>,
    }

    impl Dialer for GatedDialer {
        type Session = MemorySession;

        async fn dial(&self, addr: &str, user: &str, auth: &AuthMethods) -> RsshResult<MemorySession> {
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
            self.inner.dial(addr, user, auth).await
        }
    }

    /// Answers from a script, then reports alive.
    #[derive(Clone, Default)]
    struct ScriptedProbe {
        script: Arc<Mutex<VecDeque<bool>>>,
        calls: Arc<AtomicUsize>,
    }

    impl ScriptedProbe {
        fn new(answers: impl IntoIterator<Item = bool>) -> Self {
            Self {
                script: Arc::new(Mutex::new(answers.into_iter().collect())),
                calls: Arc::default(),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl LivenessProbe for ScriptedProbe {
        async fn probe(&self, _addr: &str, _timeout: Duration) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script.lock().unwrap().pop_front().unwrap_or(true)
        }
    }

    fn pipeline<D: Dialer>(dialer: D, target: DialTarget) -> ReversePipeline<D, Discard>
    where
        Discard: ConnectionHandler<StreamOf<D>>,
    {
        ReversePipeline::new(Connector::new(dialer), target, Arc::new(Discard))
    }

    fn spawn_run<D, H, P>(
        sup: Supervisor<D, H, P>,
        cancel: &CancellationToken,
    ) -> JoinHandle<RsshResult<()>>
    where
        D: Dialer,
        H: ConnectionHandler<StreamOf<D>>,
        P: LivenessProbe,
    {
        let cancel = cancel.clone();
        tokio::spawn(async move { sup.run(&cancel).await })
    }

    #[tokio::test(start_paused = true)]
    async fn one_failed_probe_relaunches_exactly_once() {
        let net = MemoryNetwork::new();
        let home = spawn_home(&net);
        let gate = Arc::new(Semaphore::new(1));
        let dialer = GatedDialer {
            inner: net.dialer(),
            gate: gate.clone(),
        };
        let probe = ScriptedProbe::new([false]);
        let sup = Supervisor::new(
            pipeline(dialer, target()),
            probe.clone(),
            SupervisorConfig::default(),
        );
        let status = sup.status();
        let cancel = CancellationToken::new();
        let run = spawn_run(sup, &cancel);

        status.wait_for(SupervisorState::Connected).await;
        assert_eq!(status.launches(), 1);
        assert_eq!(status.binding().unwrap().actual_port, FIRST_DYNAMIC_PORT);

        // First tick fails the probe; the relaunch blocks on the gate.
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(probe.calls(), 1);
        assert_eq!(status.state(), SupervisorState::Reconnecting);
        assert!(status.is_reconnecting());
        assert_eq!(status.launches(), 2);

        // Ticks while the relaunch is in flight neither probe nor launch.
        tokio::time::sleep(Duration::from_secs(180)).await;
        assert_eq!(probe.calls(), 1);
        assert_eq!(status.launches(), 2);

        gate.add_permits(1);
        status.wait_for(SupervisorState::Connected).await;
        assert!(!status.is_reconnecting());
        assert_eq!(status.binding().unwrap().actual_port, FIRST_DYNAMIC_PORT + 1);

        // Monitoring continues and healthy probes change nothing.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(probe.calls() >= 3);
        assert_eq!(status.launches(), 2);
        assert_eq!(home.announced().len(), 2);

        cancel.cancel();
        run.await.unwrap().unwrap();
        assert_eq!(status.state(), SupervisorState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn severed_tunnel_is_repaired_repeatedly() {
        let net = MemoryNetwork::new();
        let _home = spawn_home(&net);
        let sup = Supervisor::new(
            pipeline(net.dialer(), target()),
            net.clone(),
            SupervisorConfig::default(),
        );
        let status = sup.status();
        let cancel = CancellationToken::new();
        let run = spawn_run(sup, &cancel);

        let mut last_port = 0;
        for round in 1..=3u64 {
            status.wait_for(SupervisorState::Connected).await;
            assert_eq!(status.launches(), round);
            let port = status.binding().unwrap().actual_port;
            assert_ne!(port, last_port);
            assert!(net.is_bound(port));
            last_port = port;

            assert!(net.sever(port));
            status.wait_for(SupervisorState::Reconnecting).await;
        }
        status.wait_for(SupervisorState::Connected).await;
        assert_eq!(status.launches(), 4);

        cancel.cancel();
        run.await.unwrap().unwrap();
        let port = status.binding().unwrap().actual_port;
        assert!(!net.is_bound(port));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_after_first_reconnect_leaves_tunnel_unmonitored() {
        let net = MemoryNetwork::new();
        let _home = spawn_home(&net);
        let config = SupervisorConfig {
            monitor: MonitorPolicy::StopAfterFirstReconnect,
            ..Default::default()
        };
        let sup = Supervisor::new(pipeline(net.dialer(), target()), net.clone(), config);
        let status = sup.status();
        let cancel = CancellationToken::new();
        let run = spawn_run(sup, &cancel);

        status.wait_for(SupervisorState::Connected).await;
        net.sever(status.binding().unwrap().actual_port);
        status.wait_for(SupervisorState::Reconnecting).await;
        status.wait_for(SupervisorState::Connected).await;
        assert_eq!(status.launches(), 2);

        let port = status.binding().unwrap().actual_port;
        net.sever(port);
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(status.launches(), 2);
        assert!(!net.is_bound(port));

        cancel.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_failure_is_returned() {
        let net = MemoryNetwork::new();
        let _home = spawn_home(&net);
        let mut t = target();
        t.credentials = Credentials::new("garbage", "pw");
        let sup = Supervisor::new(
            pipeline(net.dialer(), t),
            ScriptedProbe::default(),
            SupervisorConfig::default(),
        );
        let status = sup.status();

        let err = sup.run(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, RsshError::InvalidKeyMaterial(_)));
        assert_eq!(status.state(), SupervisorState::Stopped);
        assert_eq!(status.launches(), 1);
        assert_eq!(net.dial_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_on_failure_relaunches_the_cycle() {
        let net = MemoryNetwork::new();
        let _home = spawn_home(&net);
        net.fail_next_dials(1);
        let config = SupervisorConfig {
            restart_on_failure: true,
            ..Default::default()
        };
        let pipeline = ReversePipeline::new(
            Connector::new(net.dialer()).with_max_attempts(0),
            target(),
            Arc::new(Discard),
        );
        let sup = Supervisor::new(pipeline, ScriptedProbe::default(), config);
        let status = sup.status();
        let cancel = CancellationToken::new();
        let started = Instant::now();
        let run = spawn_run(sup, &cancel);

        status.wait_for(SupervisorState::Connected).await;
        assert_eq!(status.launches(), 2);
        assert_eq!(net.dial_count(), 2);
        assert_eq!(started.elapsed(), Duration::from_secs(10));

        cancel.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn refused_bind_restarts_are_paced() {
        let net = MemoryNetwork::new();
        let _home = spawn_home(&net);
        let squatter = net.dialer().dial(HOME, "rssh", &auth()).await.unwrap();
        let _held = squatter.listen("0.0.0.0:2222").await.unwrap();

        let mut t = target();
        t.bind_port = 2222;
        let config = SupervisorConfig {
            restart_on_failure: true,
            ..Default::default()
        };
        let sup = Supervisor::new(pipeline(net.dialer(), t), ScriptedProbe::default(), config);
        let status = sup.status();
        let cancel = CancellationToken::new();
        let run = spawn_run(sup, &cancel);

        // Launches at 0s, 10s, 30s and 70s; the next one is due at 150s.
        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(status.launches(), 4);
        assert_eq!(net.dial_count(), 5);
        assert!(status.binding().is_none());
        assert!(status.is_reconnecting());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(status.launches(), 5);

        cancel.cancel();
        run.await.unwrap().unwrap();
        assert_eq!(status.state(), SupervisorState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_delay_resets_after_binding() {
        let net = MemoryNetwork::new();
        let _home = spawn_home(&net);
        net.fail_next_dials(1);
        let config = SupervisorConfig {
            restart_on_failure: true,
            ..Default::default()
        };
        let pipeline = ReversePipeline::new(
            Connector::new(net.dialer()).with_max_attempts(0),
            target(),
            Arc::new(Discard),
        );
        let sup = Supervisor::new(pipeline, net.clone(), config);
        let status = sup.status();
        let cancel = CancellationToken::new();
        let started = Instant::now();
        let run = spawn_run(sup, &cancel);

        status.wait_for(SupervisorState::Connected).await;
        assert_eq!(started.elapsed(), Duration::from_secs(10));

        // The relaunch after the 60s probe fails once more; a fresh 10s
        // delay applies rather than the doubled 20s.
        net.fail_next_dials(1);
        assert!(net.sever(status.binding().unwrap().actual_port));
        status.wait_for(SupervisorState::Reconnecting).await;
        status.wait_for(SupervisorState::Connected).await;
        assert_eq!(started.elapsed(), Duration::from_secs(70));
        assert_eq!(status.launches(), 4);

        cancel.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_key_is_returned_even_with_restarts() {
        let net = MemoryNetwork::new();
        let _home = spawn_home(&net);
        let mut t = target();
        t.credentials = Credentials::new("garbage", "pw");
        let config = SupervisorConfig {
            restart_on_failure: true,
            ..Default::default()
        };
        let sup = Supervisor::new(pipeline(net.dialer(), t), ScriptedProbe::default(), config);
        let status = sup.status();

        let err = sup.run(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, RsshError::InvalidKeyMaterial(_)));
        assert_eq!(status.launches(), 1);
        assert_eq!(net.dial_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_initial_dial() {
        let net = MemoryNetwork::new();
        net.fail_next_dials(u32::MAX);
        let sup = Supervisor::new(
            pipeline(net.dialer(), target()),
            ScriptedProbe::default(),
            SupervisorConfig::default(),
        );
        let status = sup.status();
        let cancel = CancellationToken::new();
        let run = spawn_run(sup, &cancel);

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(status.state(), SupervisorState::Connecting);
        assert!(status.binding().is_none());

        cancel.cancel();
        run.await.unwrap().unwrap();
        assert_eq!(status.state(), SupervisorState::Stopped);
    }

    #[test]
    fn monitor_policy_names() {
        #[derive(Deserialize)]
        struct Wrap {
            policy: MonitorPolicy,
        }
        let w: Wrap = toml::from_str("policy = \"once\"").unwrap();
        assert_eq!(w.policy, MonitorPolicy::StopAfterFirstReconnect);
        let w: Wrap = toml::from_str("policy = \"rearm\"").unwrap();
        assert_eq!(w.policy, MonitorPolicy::Rearm);
        assert_eq!(SupervisorState::Reconnecting.to_string(), "reconnecting");
    }
}
