//! Error types.
//!
//! [`RotatorError`] is the caller-facing error; [`TransportError`] is
//! the transport-level failure shape the classifier inspects.

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced to callers of the rotator.
///
/// Classified transient and permanent outcomes are absorbed inside the
/// request loop; callers only ever see construction-time problems,
/// total exhaustion, or argument validation failures.
#[derive(Error, Debug)]
pub enum RotatorError {
    /// No API keys were supplied at construction.
    #[error("at least one API key is required")]
    NoKeys,

    /// Every key/attempt combination was tried and failed.
    #[error("all {keys} keys exhausted after {attempts} attempts for {url}")]
    AllKeysExhausted {
        /// Number of keys in the pool when the request started.
        keys: usize,
        /// Total attempts consumed.
        attempts: u32,
        /// The URL that could not be served.
        url: String,
    },

    /// A caller-supplied argument was invalid (e.g. an empty URL).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The transport failed and no retry budget remained.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Failed to read or write the config store.
    #[error("config store error at '{path}': {source}")]
    Store {
        /// Path of the store file.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to serialize or deserialize JSON.
    #[error("failed to serialize JSON: {0}")]
    JsonSerialize(#[from] serde_json::Error),

    /// A secret provider failed to produce keys.
    #[error("secret provider error: {0}")]
    Provider(String),
}

/// A transport-level failure, shaped so the classifier can tell
/// connect/timeout problems apart from everything else.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Connection could not be established.
    #[error("connection error: {0}")]
    Connect(String),

    /// The request exceeded its timeout.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// Any other transport failure.
    #[error("request failed: {0}")]
    Other(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(e.to_string())
        } else if e.is_connect() {
            Self::Connect(e.to_string())
        } else {
            Self::Other(e.to_string())
        }
    }
}

/// Result type alias for keyrotor operations.
pub type Result<T> = std::result::Result<T, RotatorError>;
