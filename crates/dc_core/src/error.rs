//! Error taxonomy.
//!
//! | Kind        | Effect                                              |
//! |-------------|-----------------------------------------------------|
//! | Transport   | connection closed, session → `Closed`               |
//! | Framing     | connection closed, session → `Closed`               |
//! | Protocol    | frame dropped and logged, connection stays up       |
//! | Domain      | structured value for the caller, nothing closes     |
//! | Storage     | propagated to the caller                            |

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use dc_crypto::CryptoError;
use dc_proto::{FrameError, ProtocolError};
use dc_store::StoreError;

/// What the presentation layer should offer after a domain failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SuggestedAction {
    #[default]
    Continue,
    ReturnToLogin,
    ReturnToRegister,
    LookupRecipient,
    Retry,
}

impl SuggestedAction {
    pub fn label(self) -> &'static str {
        match self {
            SuggestedAction::Continue => "continue",
            SuggestedAction::ReturnToLogin => "return to login",
            SuggestedAction::ReturnToRegister => "return to register",
            SuggestedAction::LookupRecipient => "look up the recipient",
            SuggestedAction::Retry => "retry",
        }
    }
}

/// A recoverable, user-facing failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainError {
    pub message: String,
    pub suggested_action: SuggestedAction,
}

impl DomainError {
    pub fn new(message: impl Into<String>, suggested_action: SuggestedAction) -> Self {
        Self { message: message.into(), suggested_action }
    }

    pub fn return_to_login(message: impl Into<String>) -> Self {
        Self::new(message, SuggestedAction::ReturnToLogin)
    }
}

impl fmt::Display for DomainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.suggested_action.label())
    }
}

impl std::error::Error for DomainError {}

#[derive(Debug, Error)]
pub enum CourierError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Framing error: {0}")]
    Framing(FrameError),

    #[error("Connection closed")]
    Closed,

    #[error("Timed out waiting to {0}")]
    Timeout(&'static str),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("{0}")]
    Domain(#[from] DomainError),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Key file error: {0}")]
    KeyFile(String),
}

impl From<FrameError> for CourierError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Closed => CourierError::Closed,
            FrameError::Io(e) => CourierError::Transport(e.to_string()),
            other => CourierError::Framing(other),
        }
    }
}

impl From<std::io::Error> for CourierError {
    fn from(err: std::io::Error) -> Self {
        CourierError::Transport(err.to_string())
    }
}

impl CourierError {
    /// Only transport-level failures end a connection.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            CourierError::Transport(_)
                | CourierError::Framing(_)
                | CourierError::Closed
                | CourierError::Timeout(_)
                | CourierError::Tls(_)
        )
    }
}

/// Collapse any error into something the presentation layer can show.
impl From<CourierError> for DomainError {
    fn from(err: CourierError) -> Self {
        match err {
            CourierError::Domain(d) => d,
            other => DomainError::new(other.to_string(), SuggestedAction::Retry),
        }
    }
}

pub type Result<T> = std::result::Result<T, CourierError>;
