use crate::transport::RejectReason;
use thiserror::Error;

/// Errors produced by the rssh protocol layer.
#[derive(Debug, Error)]
pub enum RsshError {
    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),

    #[error("dial failed: {0}")]
    Dial(String),

    #[error("gave up after {attempts} dial attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<RsshError>,
    },

    #[error("channel open rejected ({reason}): {message}")]
    ChannelRejected {
        reason: RejectReason,
        message: String,
    },

    #[error("metadata decode error: {0}")]
    MetadataDecode(String),

    #[error("bind failed: {0}")]
    Bind(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("timeout")]
    Timeout,

    #[error("cancelled")]
    Cancelled,

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl RsshError {
    /// Whether the dial-home cycle should stop instead of retrying.
    ///
    /// Key material problems and exhausted retries are never retried; a
    /// refused remote bind means the peer will keep refusing it.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RsshError::InvalidKeyMaterial(_)
                | RsshError::RetriesExhausted { .. }
                | RsshError::Bind(_)
                | RsshError::PermissionDenied(_)
        )
    }

    /// Whether this error came from a cancellation token rather than a fault.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RsshError::Cancelled)
    }
}

impl From<ssh_key::Error> for RsshError {
    fn from(e: ssh_key::Error) -> Self {
        RsshError::InvalidKeyMaterial(e.to_string())
    }
}

pub type RsshResult<T> = Result<T, RsshError>;
