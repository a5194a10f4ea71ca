//! Dial-home connector: dial the rendezvous host with backoff, then ask it
//! to bind a reverse listener.

use crate::backoff::{CeilingMode, RetryState};
use rssh_core::{
    bound_port, join_host_port, ClientSession, ConnectionParameters, Credentials, Dialer,
    RemoteListener, RsshError, RsshResult,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Where and as whom to dial home.
#[derive(Debug, Clone)]
pub struct DialTarget {
    pub home_host: String,
    pub home_port: u16,
    pub user: String,
    /// Port requested for the remote bind; 0 lets the peer pick.
    pub bind_port: u16,
    pub credentials: Credentials,
}

impl DialTarget {
    pub fn new(params: &ConnectionParameters, credentials: Credentials) -> Self {
        Self {
            home_host: params.home_host.clone(),
            home_port: params.home_port,
            user: params.user.clone(),
            bind_port: params.bind_port,
            credentials,
        }
    }

    pub fn address(&self) -> String {
        join_host_port(&self.home_host, self.home_port)
    }

    pub fn bind_spec(&self) -> String {
        format!("0.0.0.0:{}", self.bind_port)
    }
}

/// The remote bind as the rendezvous host realized it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RealizedBinding {
    /// Address the peer reports for the bound listener.
    pub listening_address: String,
    pub actual_port: u16,
}

/// A live dial-home session with its reverse listener.
pub struct Connected<S: ClientSession> {
    pub session: S,
    pub listener: S::Listener,
    pub binding: RealizedBinding,
}

/// Dials home through a [`Dialer`], retrying with exponential backoff.
pub struct Connector<D> {
    dialer: D,
    max_attempts: i64,
    ceiling: CeilingMode,
}

impl<D: Dialer> Connector<D> {
    /// Connector that retries forever.
    pub fn new(dialer: D) -> Self {
        Self {
            dialer,
            max_attempts: -1,
            ceiling: CeilingMode::default(),
        }
    }

    /// Retry budget after the first attempt; negative means unlimited.
    pub fn with_max_attempts(mut self, max_attempts: i64) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_ceiling_mode(mut self, ceiling: CeilingMode) -> Self {
        self.ceiling = ceiling;
        self
    }

    pub fn dialer(&self) -> &D {
        &self.dialer
    }

    /// Dial home, then bind `0.0.0.0:<bind_port>` on the peer.
    ///
    /// Makes at most `max_attempts + 1` dial attempts. Malformed key
    /// material fails before the first one. Cancelling `cancel` interrupts
    /// both a backoff sleep and an in-flight dial.
    pub async fn connect(
        &self,
        target: &DialTarget,
        cancel: &CancellationToken,
    ) -> RsshResult<Connected<D::Session>> {
        let auth = target.credentials.auth_methods()?;
        let address = target.address();
        let mut retry = RetryState::new(self.max_attempts, self.ceiling);

        info!(home = %address, user = %target.user, "dialling home");
        let session = loop {
            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RsshError::Cancelled),
                result = self.dialer.dial(&address, &target.user, &auth) => result,
            };
            match attempt {
                Ok(session) => break session,
                Err(e) if retry.can_retry() => {
                    let backoff = retry.timeout();
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(RsshError::Cancelled),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    warn!(
                        error = %e,
                        attempt = retry.fail_count(),
                        max_attempts = retry.max_attempts(),
                        ?backoff,
                        "dial home failed, retrying"
                    );
                    retry.record_failure();
                }
                Err(e) => {
                    return Err(RsshError::RetriesExhausted {
                        attempts: retry.fail_count() + 1,
                        last: Box::new(e),
                    })
                }
            }
        };

        let listener = match session.listen(&target.bind_spec()).await {
            Ok(listener) => listener,
            Err(e) => {
                session.close();
                return Err(e);
            }
        };
        let listening_address = listener.local_addr();
        let actual_port = match bound_port(&listening_address) {
            Ok(port) => port,
            Err(e) => {
                session.close();
                return Err(e);
            }
        };

        info!(port = actual_port, address = %listening_address, "success: up on {actual_port}");
        Ok(Connected {
            session,
            listener,
            binding: RealizedBinding {
                listening_address,
                actual_port,
            },
        })
    }
}
