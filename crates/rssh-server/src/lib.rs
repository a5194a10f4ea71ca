//! rssh-server: the rendezvous side of a reverse shell.
//!
//! Accepts dial-home sessions, acknowledges their `rs-info` announcements
//! and keeps a [`PeerRegistry`] of who is currently reachable through which
//! reverse-bound address.

pub mod config;
pub mod policy;
pub mod receiver;
pub mod registry;
pub mod server;

pub use config::ServerConfig;
pub use policy::ServerPolicy;
pub use receiver::InfoReceiver;
pub use registry::{PeerRegistry, PeerSnapshot, RegistryEntry, Registration};
pub use server::{BoxFuture, ChannelHandler, RendezvousServer};

pub use rssh_core::{RsshError, RsshResult};
