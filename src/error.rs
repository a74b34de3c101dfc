//! Error taxonomy for the session engine.

use thiserror::Error;

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by the transport, correlation table, subscriptions,
/// session and trade cycle controller.
///
/// `Clone` so that a single authentication outcome can be handed to every
/// caller waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("not connected")]
    NotConnected,

    #[error("connection failed: {0}")]
    ConnectFailed(String),

    #[error("correlation id {0} is already outstanding")]
    DuplicateCorrelation(u64),

    #[error("request {0} timed out")]
    RequestTimeout(u64),

    /// Error object carried by an otherwise matching response.
    #[error("remote error {code}: {message}")]
    Remote { code: String, message: String },

    #[error("authentication failed: {reason}")]
    AuthenticationFailed { reason: String },

    #[error("purchase failed: {reason}")]
    PurchaseFailed { reason: String },

    #[error("subscription for {key} failed: {reason}")]
    SubscriptionFailed { key: String, reason: String },

    #[error("session disposed")]
    SessionDisposed,

    #[error("malformed message: {0}")]
    Protocol(String),
}

impl EngineError {
    /// Human-readable reason, preferring the remote message when there is one.
    pub fn reason(&self) -> String {
        match self {
            EngineError::Remote { message, code } if message.is_empty() => code.clone(),
            EngineError::Remote { message, .. } => message.clone(),
            EngineError::AuthenticationFailed { reason }
            | EngineError::PurchaseFailed { reason }
            | EngineError::SubscriptionFailed { reason, .. } => reason.clone(),
            other => other.to_string(),
        }
    }

    pub fn purchase(reason: impl Into<String>) -> Self {
        EngineError::PurchaseFailed {
            reason: reason.into(),
        }
    }

    /// True when the session is gone and retrying on it is pointless.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EngineError::SessionDisposed | EngineError::NotConnected)
    }
}
