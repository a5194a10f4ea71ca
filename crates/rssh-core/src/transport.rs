//! Abstract SSH transport traits for rssh.
//!
//! The SSH engine (handshake, encryption, channel multiplexing) is an
//! external collaborator. These traits are the surface rssh consumes from
//! it: dialing out with public-key/password auth, asking the peer for a
//! remote bind, opening and rejecting channels, and observing closure.
//! Host keys are not verified on dial.

use crate::error::{RsshError, RsshResult};
use crate::keys::AuthMethods;
use ssh_key::PublicKey;
use std::fmt;
use std::future::Future;
use std::time::Duration;

/// Channel-open failure reasons (RFC 4254 §5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    AdministrativelyProhibited,
    ConnectFailed,
    UnknownChannelType,
    ResourceShortage,
}

impl RejectReason {
    pub fn code(self) -> u32 {
        match self {
            RejectReason::AdministrativelyProhibited => 1,
            RejectReason::ConnectFailed => 2,
            RejectReason::UnknownChannelType => 3,
            RejectReason::ResourceShortage => 4,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(RejectReason::AdministrativelyProhibited),
            2 => Some(RejectReason::ConnectFailed),
            3 => Some(RejectReason::UnknownChannelType),
            4 => Some(RejectReason::ResourceShortage),
            _ => None,
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RejectReason::AdministrativelyProhibited => "administratively prohibited",
            RejectReason::ConnectFailed => "connect failed",
            RejectReason::UnknownChannelType => "unknown channel type",
            RejectReason::ResourceShortage => "resource shortage",
        };
        f.write_str(text)
    }
}

// ── Client half ───────────────────────────────────────────────────────

/// Opens outbound SSH sessions.
pub trait Dialer: Send + Sync + 'static {
    type Session: ClientSession;

    /// Dial `addr` as `user`, offering every method in `auth`.
    fn dial(
        &self,
        addr: &str,
        user: &str,
        auth: &AuthMethods,
    ) -> impl Future<Output = RsshResult<Self::Session>> + Send;
}

/// An established outbound session.
pub trait ClientSession: Send + Sync + 'static {
    type Listener: RemoteListener;
    type Channel: Channel;

    /// Ask the peer to listen on `bind_spec` (`host:port`, port 0 = any)
    /// and forward inbound connections back through this session.
    fn listen(&self, bind_spec: &str) -> impl Future<Output = RsshResult<Self::Listener>> + Send;

    /// Open a channel of type `name` with `extra_data` as the open payload.
    ///
    /// A refusal surfaces as [`RsshError::ChannelRejected`].
    fn open_channel(
        &self,
        name: &str,
        extra_data: &[u8],
    ) -> impl Future<Output = RsshResult<Self::Channel>> + Send;

    /// Tear the session down.
    fn close(&self);

    /// Resolves once the session is closed, from either side.
    fn closed(&self) -> impl Future<Output = ()> + Send;
}

/// A channel the peer accepted.
pub trait Channel: Send + 'static {
    fn close(self) -> impl Future<Output = RsshResult<()>> + Send;
}

/// A listener bound on the peer by [`ClientSession::listen`].
pub trait RemoteListener: Send + 'static {
    /// Byte stream for one forwarded inbound connection.
    type Stream: Send + 'static;

    /// Address the peer actually bound, e.g. `0.0.0.0:40001`.
    fn local_addr(&self) -> String;

    /// Next forwarded connection and its origin address, or `None` once the
    /// listener or its session is closed.
    fn accept(&mut self) -> impl Future<Output = RsshResult<Option<(Self::Stream, String)>>> + Send;

    fn close(&mut self);
}

/// Extract the port from a bound address (text after the last `:`).
pub fn bound_port(addr: &str) -> RsshResult<u16> {
    addr.rsplit_once(':')
        .and_then(|(_, port)| port.parse().ok())
        .ok_or_else(|| RsshError::Bind(format!("cannot parse bound address {addr:?}")))
}

// ── Server half ───────────────────────────────────────────────────────

/// Accepts authenticated inbound SSH connections.
pub trait Endpoint: Send + Sync + 'static {
    type Connection: ServerConnection;

    fn local_addr(&self) -> String;

    /// Next connection, or `None` once the endpoint is closed.
    fn accept(&self) -> impl Future<Output = RsshResult<Option<Self::Connection>>> + Send;
}

/// One authenticated inbound connection.
pub trait ServerConnection: Send + Sync + 'static {
    type NewChannel: NewChannel;

    fn remote_addr(&self) -> String;

    fn user(&self) -> String;

    /// Next channel-open request, or `None` once the connection is closed.
    fn next_channel(&self) -> impl Future<Output = Option<Self::NewChannel>> + Send;

    /// Resolves when the connection closes. `Err` carries an abnormal cause.
    fn wait(&self) -> impl Future<Output = RsshResult<()>> + Send;

    fn close(&self);
}

/// A pending channel-open request.
pub trait NewChannel: Send + 'static {
    fn channel_type(&self) -> &str;

    fn extra_data(&self) -> &[u8];

    fn reject(
        self,
        reason: RejectReason,
        message: &str,
    ) -> impl Future<Output = RsshResult<()>> + Send;
}

// ── Policy and probing ────────────────────────────────────────────────

/// Decisions the SSH server half delegates to rssh.
pub trait AccessPolicy: Send + Sync + 'static {
    fn authenticate_password(&self, user: &str, remote: &str, password: &str) -> bool;

    fn authenticate_public_key(&self, user: &str, remote: &str, key: &PublicKey) -> bool;

    /// `direct-tcpip` to `host:port`.
    fn allow_local_forward(&self, host: &str, port: u32) -> bool;

    /// `tcpip-forward` on `host:port`.
    fn allow_reverse_forward(&self, host: &str, port: u32) -> bool;

    /// Shell, exec or subsystem request.
    fn allow_session(&self, request_type: &str) -> bool;
}

/// Checks whether a reverse-bound port still answers.
pub trait LivenessProbe: Send + Sync + 'static {
    fn probe(&self, addr: &str, timeout: Duration) -> impl Future<Output = bool> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reject_codes_round_trip() {
        for reason in [
            RejectReason::AdministrativelyProhibited,
            RejectReason::ConnectFailed,
            RejectReason::UnknownChannelType,
            RejectReason::ResourceShortage,
        ] {
            assert_eq!(RejectReason::from_code(reason.code()), Some(reason));
        }
        assert_eq!(RejectReason::from_code(0), None);
    }

    #[test]
    fn bound_port_parsing() {
        assert_eq!(bound_port("0.0.0.0:40001").unwrap(), 40001);
        assert_eq!(bound_port("[::]:2222").unwrap(), 2222);
        assert!(bound_port("no-port").is_err());
        assert!(bound_port("host:http").is_err());
    }
}
