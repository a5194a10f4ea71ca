//! rssh-core: Shared protocol library for reverse shells.
//!
//! Provides the `rs-info` peer metadata codec, credential loading,
//! connection parameters, and the abstract transport traits that the
//! client (dial-home) and server (rendezvous) halves are written against.

pub mod error;
pub mod keys;
#[cfg(any(test, feature = "memory"))]
pub mod memory;
pub mod metadata;
pub mod params;
pub mod transport;

// Re-export commonly used items at crate root.
pub use error::{RsshError, RsshResult};
pub use keys::{AuthMethods, Credentials};
pub use metadata::{PeerMetadata, ACK_SENTINEL, INFO_CHANNEL, UNRESOLVED};
pub use params::{join_host_port, ConnectionParameters, Mode};
pub use transport::{
    bound_port, AccessPolicy, Channel, ClientSession, Dialer, Endpoint, LivenessProbe,
    NewChannel, RejectReason, RemoteListener, ServerConnection,
};
