//! Startup parameters shared by both operating modes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which side of the reverse connection this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Rendezvous host: accept dial-home sessions and track peers.
    Listen,
    /// Behind-NAT host: dial home and serve through a remote bind.
    Reverse,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Listen => write!(f, "listen"),
            Mode::Reverse => write!(f, "reverse"),
        }
    }
}

/// Immutable connection parameters, resolved once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParameters {
    /// User name presented to the rendezvous host.
    pub user: String,
    /// Rendezvous host to dial.
    pub home_host: String,
    /// Rendezvous SSH port (also the listen port in listen mode).
    pub home_port: u16,
    /// Port requested for the remote bind; 0 lets the peer pick.
    pub bind_port: u16,
    pub mode: Mode,
    /// Shell spawned for interactive sessions.
    pub shell: String,
    pub no_shell: bool,
}

impl Default for ConnectionParameters {
    fn default() -> Self {
        Self {
            user: "rssh".to_string(),
            home_host: String::new(),
            home_port: 7000,
            bind_port: 0,
            mode: Mode::Reverse,
            shell: "/bin/bash".to_string(),
            no_shell: false,
        }
    }
}

impl ConnectionParameters {
    /// `host:port` of the rendezvous SSH service.
    pub fn home_address(&self) -> String {
        join_host_port(&self.home_host, self.home_port)
    }

    /// Spec for the remote bind request.
    pub fn bind_spec(&self) -> String {
        format!("0.0.0.0:{}", self.bind_port)
    }

    /// Whether shell, exec and local forwarding requests must be refused.
    ///
    /// A rendezvous host refuses them unless `no_shell` was given, which
    /// flips its meaning to "allow".
    pub fn effective_no_shell(&self) -> bool {
        match self.mode {
            Mode::Listen => !self.no_shell,
            Mode::Reverse => self.no_shell,
        }
    }
}

/// Join host and port, bracketing IPv6 literals.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
