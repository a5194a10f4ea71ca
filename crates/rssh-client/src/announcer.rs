//! Side-channel announcer: tell the rendezvous host who we are.
//!
//! The metadata rides as the payload of an `rs-info` channel-open request.
//! The peer refuses that request with [`ACK_SENTINEL`], and the refusal is
//! the acknowledgement.

use rssh_core::{
    Channel, ClientSession, PeerMetadata, RsshError, ACK_SENTINEL, INFO_CHANNEL,
};
use std::time::Duration;
use tracing::{debug, warn};

/// Upper bound on waiting for the peer to answer the channel-open.
pub const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of one announcement. Never aborts the reverse session.
#[derive(Debug)]
pub enum AnnounceOutcome {
    /// Refused with the sentinel, as expected.
    Acknowledged,
    /// The peer opened the channel anyway; it was closed again.
    Accepted,
    /// Delivery could not be confirmed.
    Failed(RsshError),
}

impl AnnounceOutcome {
    pub fn is_acknowledged(&self) -> bool {
        matches!(self, AnnounceOutcome::Acknowledged)
    }
}

/// Announce this host as reachable via `listening_address`.
pub async fn announce<S: ClientSession>(session: &S, listening_address: &str) -> AnnounceOutcome {
    let metadata = PeerMetadata::for_local_host(listening_address);
    announce_metadata(session, &metadata).await
}

/// Send `metadata` over the `rs-info` side channel.
pub async fn announce_metadata<S: ClientSession>(
    session: &S,
    metadata: &PeerMetadata,
) -> AnnounceOutcome {
    let payload = metadata.encode();
    let opened = tokio::time::timeout(ANNOUNCE_TIMEOUT, session.open_channel(INFO_CHANNEL, &payload))
        .await
        .unwrap_or(Err(RsshError::Timeout));

    match opened {
        Err(e) if is_ack(&e) => {
            debug!(address = %metadata.listening_address, "peer metadata acknowledged");
            AnnounceOutcome::Acknowledged
        }
        Ok(channel) => {
            if let Err(e) = channel.close().await {
                debug!(error = %e, "closing accepted info channel failed");
            }
            AnnounceOutcome::Accepted
        }
        Err(e) => {
            warn!(error = %e, "could not create info channel");
            AnnounceOutcome::Failed(e)
        }
    }
}

fn is_ack(err: &RsshError) -> bool {
    matches!(err, RsshError::ChannelRejected { message, .. } if message.contains(ACK_SENTINEL))
}
