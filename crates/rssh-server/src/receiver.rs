//! Receiving side of the `rs-info` side channel.

use crate::registry::PeerRegistry;
use crate::server::{BoxFuture, ChannelHandler};
use rssh_core::{NewChannel, PeerMetadata, RejectReason, ServerConnection, ACK_SENTINEL};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Decodes peer announcements and tracks the announcing connection until
/// it closes.
pub struct InfoReceiver<C> {
    registry: PeerRegistry<Arc<C>>,
}

impl<C: ServerConnection> InfoReceiver<C> {
    pub fn new(registry: PeerRegistry<Arc<C>>) -> Self {
        Self { registry }
    }

    /// Handle one `rs-info` channel-open.
    ///
    /// The request is always refused with [`ACK_SENTINEL`], after the peer
    /// was registered. Returns the close watcher if the payload decoded.
    pub async fn receive(&self, conn: &Arc<C>, channel: C::NewChannel) -> Option<JoinHandle<()>> {
        let remote = conn.remote_addr();
        let registered = match PeerMetadata::decode(channel.extra_data()) {
            Ok(metadata) => {
                info!(
                    %remote,
                    user = %metadata.current_user,
                    hostname = %metadata.hostname,
                    address = %metadata.listening_address,
                    "new reverse peer"
                );
                let registration = self
                    .registry
                    .insert(metadata.clone(), remote.clone(), conn.clone())
                    .await;
                Some((metadata, registration))
            }
            Err(e) => {
                warn!(%remote, error = %e, "could not parse extra info");
                None
            }
        };

        if let Err(e) = channel
            .reject(RejectReason::AdministrativelyProhibited, ACK_SENTINEL)
            .await
        {
            debug!(%remote, error = %e, "could not acknowledge extra info");
        }

        let (metadata, registration) = registered?;
        let registry = self.registry.clone();
        let conn = conn.clone();
        Some(tokio::spawn(async move {
            let closed = conn.wait().await;
            registry.remove(&registration).await;
            info!(
                %remote,
                user = %metadata.current_user,
                hostname = %metadata.hostname,
                ?closed,
                "reverse peer disconnected"
            );
        }))
    }
}

impl<C: ServerConnection> ChannelHandler<C> for InfoReceiver<C> {
    fn handle<'a>(&'a self, conn: &'a Arc<C>, channel: C::NewChannel) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.receive(conn, channel).await;
        })
    }
}
