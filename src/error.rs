//! Session error taxonomy
//!
//! Every failure that can cross the session API is translated into one of
//! these variants before it reaches a caller; raw transport errors are kept
//! as sources for logging but never shown to the user.

use std::time::Duration;

/// Errors produced by the session core
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SessionError {
    /// Bad identifier or password; user-correctable, never retried automatically
    #[error("Invalid identifier or password")]
    InvalidCredentials,

    /// Remote throttling (HTTP 429); `retry_after` is the server hint, if any
    #[error("Too many attempts, please try again later")]
    RateLimited {
        /// Server-provided Retry-After, when present
        retry_after: Option<Duration>,
    },

    /// Transient network/IO failure; safe to retry, never destroys session state
    #[error("Could not reach the service")]
    ConnectionFailed(#[source] Option<reqwest::Error>),

    /// The remote rejected the refresh token; unrecoverable for that credential
    #[error("Session expired, please log in again")]
    RefreshRejected,

    /// Local credential storage is unreadable/unwritable this launch
    #[error("Credential storage unavailable")]
    StoreUnavailable(#[source] std::io::Error),

    /// Persisted credentials could not be decrypted or parsed
    #[error("Credential storage is corrupt")]
    CorruptStore,

    /// DID not present in the account registry; a caller bug, not fatal
    #[error("Unknown account: {did}")]
    UnknownAccount {
        /// The DID that was requested
        did: String,
    },
}

impl SessionError {
    /// Whether retrying the same operation may succeed without user action
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_) | Self::RateLimited { .. } | Self::StoreUnavailable(_)
        )
    }
}
