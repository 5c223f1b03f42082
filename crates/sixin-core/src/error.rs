use thiserror::Error;

use crate::crypto::CryptoError;

/// Errors produced by the sixin realtime core.
#[derive(Debug, Error)]
pub enum SixinError {
    /// Bad, missing or expired bearer token. The connection is never registered.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Malformed payload, missing argument, or an event that references
    /// state which does not exist (e.g. an answer with no prior offer).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Peer-connection creation or session description application failed.
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("store error: {0}")]
    Store(String),

    #[error("timeout")]
    Timeout,

    #[error("codec error: {0}")]
    Codec(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl SixinError {
    /// Text sent to the originating connection inside an `error` event.
    ///
    /// Internal details of transport and io failures are not echoed back.
    pub fn client_message(&self) -> String {
        match self {
            SixinError::Transport(_) | SixinError::Io(_) | SixinError::Other(_) => {
                "internal server error".to_string()
            }
            other => other.to_string(),
        }
    }

    /// Whether this error counts against a connection's malformed-traffic budget.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, SixinError::Protocol(_) | SixinError::Codec(_))
    }
}

impl From<serde_json::Error> for SixinError {
    fn from(e: serde_json::Error) -> Self {
        SixinError::Codec(e.to_string())
    }
}

pub type SixinResult<T> = Result<T, SixinError>;
