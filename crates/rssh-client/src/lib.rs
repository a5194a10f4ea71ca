//! rssh-client: the dial-home side of a reverse shell.
//!
//! A host behind NAT dials the rendezvous host, asks it to bind a listener
//! that forwards back through the session, announces who it is over the
//! `rs-info` side channel, and serves whatever arrives on that listener.
//! The [`Supervisor`] probes the bound port and rebuilds the whole cycle
//! when it goes dark.
//!
//! [`TcpProbe`] is the probe for transports whose remote binds are real TCP
//! listeners; an in-process transport can answer liveness itself.
//!
//! # Quick Start
//!
//! ```ignore
//! use rssh_client::{ClientConfig, ConfigOverrides, ReversePipeline, Supervisor, TcpProbe};
//!
//! let cfg = ClientConfig::load(Some(path), ConfigOverrides::default())?;
//! let pipeline = ReversePipeline::new(
//!     cfg.connector(dialer),
//!     cfg.target(cfg.credentials()?),
//!     Arc::new(handler),
//! );
//! Supervisor::new(pipeline, TcpProbe, cfg.supervisor.clone())
//!     .run(&cancel)
//!     .await?;
//! ```

pub mod announcer;
pub mod backoff;
pub mod config;
pub mod connector;
pub mod probe;
pub mod reverse;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod testing;

pub use announcer::{announce, announce_metadata, AnnounceOutcome};
pub use backoff::{CeilingMode, RetryState};
pub use config::{ClientConfig, ConfigOverrides};
pub use connector::{Connected, Connector, DialTarget, RealizedBinding};
pub use probe::TcpProbe;
pub use reverse::{serve, ConnectionHandler, ReversePipeline, ServeExit, StreamOf};
pub use supervisor::{
    MonitorPolicy, Supervisor, SupervisorConfig, SupervisorState, SupervisorStatus,
};

pub use rssh_core::{RsshError, RsshResult};
