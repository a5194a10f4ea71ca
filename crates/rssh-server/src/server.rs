//! Rendezvous server: accept dial-home sessions and dispatch their channels.

use crate::receiver::InfoReceiver;
use crate::registry::PeerRegistry;
use rssh_core::{
    Endpoint, NewChannel, RejectReason, RsshResult, ServerConnection, INFO_CHANNEL,
};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Handles channel-open requests of one type.
pub trait ChannelHandler<C: ServerConnection>: Send + Sync + 'static {
    fn handle<'a>(&'a self, conn: &'a Arc<C>, channel: C::NewChannel) -> BoxFuture<'a, ()>;
}

type HandlerMap<C> = HashMap<String, Arc<dyn ChannelHandler<C>>>;

/// Listen-mode server.
pub struct RendezvousServer<C: ServerConnection> {
    handlers: Arc<HandlerMap<C>>,
    registry: PeerRegistry<Arc<C>>,
}

impl<C: ServerConnection> Default for RendezvousServer<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: ServerConnection> RendezvousServer<C> {
    /// Server with the `rs-info` handler registered.
    pub fn new() -> Self {
        let registry = PeerRegistry::new();
        let mut handlers: HandlerMap<C> = HashMap::new();
        handlers.insert(
            INFO_CHANNEL.to_string(),
            Arc::new(InfoReceiver::new(registry.clone())),
        );
        Self {
            handlers: Arc::new(handlers),
            registry,
        }
    }

    pub fn registry(&self) -> &PeerRegistry<Arc<C>> {
        &self.registry
    }

    /// Route channels of type `name` to `handler`, replacing any previous one.
    ///
    /// Only effective before [`run`](Self::run) is called.
    pub fn register_channel_handler(&mut self, name: &str, handler: Arc<dyn ChannelHandler<C>>) {
        Arc::make_mut(&mut self.handlers).insert(name.to_string(), handler);
    }

    /// Serve connections from `endpoint` until it closes or `cancel` fires.
    pub async fn run<E>(&self, endpoint: E, cancel: &CancellationToken) -> RsshResult<()>
    where
        E: Endpoint<Connection = C>,
    {
        info!(addr = %endpoint.local_addr(), "success: listening");
        let mut sessions = JoinSet::new();
        let result = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                accepted = endpoint.accept() => match accepted {
                    Ok(Some(conn)) => {
                        let handlers = self.handlers.clone();
                        let cancel = cancel.clone();
                        sessions.spawn(serve_connection(handlers, Arc::new(conn), cancel));
                    }
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e),
                },
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            }
        };
        sessions.shutdown().await;
        info!("rendezvous server stopped");
        result
    }
}

async fn serve_connection<C: ServerConnection>(
    handlers: Arc<HandlerMap<C>>,
    conn: Arc<C>,
    cancel: CancellationToken,
) {
    let remote = conn.remote_addr();
    debug!(%remote, user = %conn.user(), "session opened");
    let mut channels = JoinSet::new();
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                conn.close();
                break;
            }
            next = conn.next_channel() => {
                let Some(channel) = next else { break };
                match handlers.get(channel.channel_type()) {
                    Some(handler) => {
                        let handler = handler.clone();
                        let conn = conn.clone();
                        channels.spawn(async move { handler.handle(&conn, channel).await });
                    }
                    None => {
                        let kind = channel.channel_type().to_string();
                        debug!(%remote, %kind, "rejecting unknown channel type");
                        let message = format!("unknown channel type: {kind}");
                        if let Err(e) = channel.reject(RejectReason::UnknownChannelType, &message).await {
                            warn!(%remote, error = %e, "channel reject failed");
                        }
                    }
                }
            }
            Some(_) = channels.join_next(), if !channels.is_empty() => {}
        }
    }
    // Close watchers are detached and outlive this.
    channels.shutdown().await;
    debug!(%remote, "session closed");
}
