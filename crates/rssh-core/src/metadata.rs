//! Peer metadata carried by the `rs-info` side channel.
//!
//! Wire format is the SSH `string` encoding of three fields in order:
//! `[4-byte BE len][currentUser][4-byte BE len][hostname][4-byte BE len][listeningAddress]`
//!
//! The payload rides as the extra data of a channel-open request that the
//! rendezvous side always rejects with [`ACK_SENTINEL`]; that rejection is the
//! acknowledgement.

use crate::error::{RsshError, RsshResult};
use serde::{Deserialize, Serialize};

/// Channel type used to smuggle metadata to the rendezvous host.
pub const INFO_CHANNEL: &str = "rs-info";

/// Rejection message that acknowledges a metadata announcement.
pub const ACK_SENTINEL: &str = "th4nkz";

/// Placeholder for a field that could not be resolved locally.
pub const UNRESOLVED: &str = "ERROR";

/// Identity of a reverse peer, announced once per reverse session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerMetadata {
    pub current_user: String,
    pub hostname: String,
    pub listening_address: String,
}

impl PeerMetadata {
    pub fn new(
        current_user: impl Into<String>,
        hostname: impl Into<String>,
        listening_address: impl Into<String>,
    ) -> Self {
        Self {
            current_user: current_user.into(),
            hostname: hostname.into(),
            listening_address: listening_address.into(),
        }
    }

    /// Describe this host, reachable via `listening_address`.
    ///
    /// Either field that cannot be resolved becomes [`UNRESOLVED`].
    pub fn for_local_host(listening_address: impl Into<String>) -> Self {
        Self::new(current_user(), local_hostname(), listening_address)
    }

    /// Encode into the SSH wire representation.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            12 + self.current_user.len() + self.hostname.len() + self.listening_address.len(),
        );
        put_string(&mut out, &self.current_user);
        put_string(&mut out, &self.hostname);
        put_string(&mut out, &self.listening_address);
        out
    }

    /// Decode from the SSH wire representation. Trailing bytes are rejected.
    pub fn decode(data: &[u8]) -> RsshResult<Self> {
        let mut rest = data;
        let current_user = take_string(&mut rest, "current user")?;
        let hostname = take_string(&mut rest, "hostname")?;
        let listening_address = take_string(&mut rest, "listening address")?;
        if !rest.is_empty() {
            return Err(RsshError::MetadataDecode(format!(
                "{} trailing bytes after listening address",
                rest.len()
            )));
        }
        Ok(Self {
            current_user,
            hostname,
            listening_address,
        })
    }
}

fn put_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn take_string(rest: &mut &[u8], field: &str) -> RsshResult<String> {
    if rest.len() < 4 {
        return Err(RsshError::MetadataDecode(format!(
            "truncated length prefix for {field}"
        )));
    }
    let len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
    let body = &rest[4..];
    if body.len() < len {
        return Err(RsshError::MetadataDecode(format!(
            "{field} claims {len} bytes, {} available",
            body.len()
        )));
    }
    // Peers send raw bytes; keep whatever is decodable.
    let value = String::from_utf8_lossy(&body[..len]).into_owned();
    *rest = &body[len..];
    Ok(value)
}

/// Current OS user name, or [`UNRESOLVED`].
fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .ok()
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| UNRESOLVED.to_string())
}

/// Local host name, or [`UNRESOLVED`].
fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| UNRESOLVED.to_string())
}
