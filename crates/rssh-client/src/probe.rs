//! TCP liveness probe for the reverse-bound port.

use rssh_core::LivenessProbe;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Probes by opening (and immediately dropping) a plain TCP connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProbe;

impl LivenessProbe for TcpProbe {
    async fn probe(&self, addr: &str, timeout: Duration) -> bool {
        debug!(%addr, "dialling");
        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(%addr, error = %e, "probe failed");
                false
            }
            Err(_) => {
                debug!(%addr, ?timeout, "probe timed out");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn open_port_is_alive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        assert!(TcpProbe.probe(&addr, Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn closed_port_is_dead() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        assert!(!TcpProbe.probe(&addr, Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn unparseable_address_is_dead() {
        assert!(!TcpProbe.probe("not an address", Duration::from_secs(1)).await);
    }
}
