//! Access decisions for the rendezvous SSH service.

use rssh_core::keys::{fingerprint, keys_match};
use rssh_core::AccessPolicy;
use ssh_key::PublicKey;
use tracing::{info, warn};

/// Capability set configured once at startup.
#[derive(Debug, Clone)]
pub struct ServerPolicy {
    /// `None` disables password authentication.
    password: Option<String>,
    /// `None` disables public-key authentication.
    authorized_key: Option<PublicKey>,
    /// Refuse shell, exec, subsystem and local forwarding requests.
    no_shell: bool,
}

impl ServerPolicy {
    pub fn new(password: Option<String>, authorized_key: Option<PublicKey>, no_shell: bool) -> Self {
        Self {
            password,
            authorized_key,
            no_shell,
        }
    }

    pub fn no_shell(&self) -> bool {
        self.no_shell
    }
}

impl AccessPolicy for ServerPolicy {
    fn authenticate_password(&self, user: &str, remote: &str, password: &str) -> bool {
        let Some(expected) = &self.password else {
            return false;
        };
        let passed = password == expected;
        if passed {
            info!(%user, %remote, "successful authentication with password");
        } else {
            warn!(%user, %remote, "invalid password");
        }
        passed
    }

    fn authenticate_public_key(&self, user: &str, remote: &str, key: &PublicKey) -> bool {
        let Some(authorized) = &self.authorized_key else {
            return false;
        };
        let passed = keys_match(key, authorized);
        if passed {
            info!(%user, %remote, "successful authentication with ssh key");
        } else {
            warn!(%user, %remote, fingerprint = %fingerprint(key), "invalid ssh key");
        }
        passed
    }

    fn allow_local_forward(&self, host: &str, port: u32) -> bool {
        if self.no_shell {
            info!("denying local port forwarding request {host}:{port}");
            return false;
        }
        info!("accepted forward to {host}:{port}");
        true
    }

    fn allow_reverse_forward(&self, host: &str, port: u32) -> bool {
        info!("attempt to bind at {host}:{port} granted");
        true
    }

    fn allow_session(&self, request_type: &str) -> bool {
        if self.no_shell {
            info!(%request_type, "denying shell/exec/subsystem request");
            return false;
        }
        true
    }
}
