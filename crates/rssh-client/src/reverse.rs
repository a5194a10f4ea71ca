//! Reverse server loop and the dial, bind, announce, serve pipeline.

use crate::announcer::announce;
use crate::connector::{Connected, Connector, DialTarget, RealizedBinding};
use rssh_core::{ClientSession, Dialer, RemoteListener, RsshResult};
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Byte stream of one forwarded connection for dialer `D`.
pub type StreamOf<D> =
    <<<D as Dialer>::Session as ClientSession>::Listener as RemoteListener>::Stream;

/// Serves one connection that arrived on the reverse listener.
///
/// This is where shell, exec and forwarding handling plugs in.
pub trait ConnectionHandler<S>: Send + Sync + 'static {
    fn handle(&self, stream: S, origin: String) -> impl Future<Output = ()> + Send;
}

/// Why [`serve`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeExit {
    ListenerClosed,
    SessionClosed,
    Cancelled,
}

/// Accept connections on `listener` until it or `session` closes, or until
/// `cancel` fires. In-flight handlers are aborted on return.
pub async fn serve<S, H>(
    session: &S,
    mut listener: S::Listener,
    handler: Arc<H>,
    cancel: &CancellationToken,
) -> RsshResult<ServeExit>
where
    S: ClientSession,
    H: ConnectionHandler<<S::Listener as RemoteListener>::Stream>,
{
    let mut handlers = JoinSet::new();
    let result = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break Ok(ServeExit::Cancelled),
            _ = session.closed() => break Ok(ServeExit::SessionClosed),
            accepted = listener.accept() => match accepted {
                Ok(Some((stream, origin))) => {
                    debug!(%origin, "accepted reverse connection");
                    let handler = handler.clone();
                    handlers.spawn(async move { handler.handle(stream, origin).await });
                }
                Ok(None) => break Ok(ServeExit::ListenerClosed),
                Err(e) => break Err(e),
            },
            Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        warn!(error = %e, "connection handler panicked");
                    }
                }
            }
        }
    };
    listener.close();
    handlers.shutdown().await;
    result
}

/// One dial-home cycle: connect, bind, announce, serve.
pub struct ReversePipeline<D, H> {
    connector: Connector<D>,
    target: DialTarget,
    handler: Arc<H>,
}

impl<D, H> ReversePipeline<D, H>
where
    D: Dialer,
    H: ConnectionHandler<StreamOf<D>>,
{
    pub fn new(connector: Connector<D>, target: DialTarget, handler: Arc<H>) -> Self {
        Self {
            connector,
            target,
            handler,
        }
    }

    pub fn target(&self) -> &DialTarget {
        &self.target
    }

    /// Run the cycle once.
    ///
    /// `on_established` fires after the remote bind succeeded and the
    /// metadata was announced, before the first inbound connection is
    /// served. Connector failures are returned; the announcement never
    /// fails the cycle.
    pub async fn run<F>(&self, on_established: F, cancel: &CancellationToken) -> RsshResult<ServeExit>
    where
        F: FnOnce(&RealizedBinding) + Send,
    {
        let Connected {
            session,
            listener,
            binding,
        } = self.connector.connect(&self.target, cancel).await?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                session.close();
                return Ok(ServeExit::Cancelled);
            }
            _ = announce(&session, &binding.listening_address) => {}
        }
        on_established(&binding);

        let exit = serve(&session, listener, self.handler.clone(), cancel).await;
        session.close();
        match &exit {
            Ok(reason) => info!(port = binding.actual_port, ?reason, "reverse server stopped"),
            Err(e) => warn!(port = binding.actual_port, error = %e, "reverse server failed"),
        }
        exit
    }
}
