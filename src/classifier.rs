//! Response and exception classification.
//!
//! Maps a response status or a transport error to an [`ErrorKind`] that
//! the rotator loop switches on. Pure function of its inputs; no state
//! is kept between calls.

use crate::error::TransportError;
use reqwest::StatusCode;

/// Actionable category for a failed (or succeeded) attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The key is throttled; rotate away from it.
    RateLimit,
    /// Transient server-side problem; retry, key-agnostic.
    Temporary,
    /// The key itself is unusable going forward; evict it.
    Permanent,
    /// Connect/timeout-class transport problem.
    Network,
    /// Anything else; treated as non-retryable unless a caller
    /// predicate says otherwise.
    Unknown,
}

/// Classifies responses and transport errors.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    treat_client_errors_as_permanent: bool,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self {
            treat_client_errors_as_permanent: true,
        }
    }
}

impl ErrorClassifier {
    /// Create a classifier.
    ///
    /// `treat_client_errors_as_permanent` controls whether 4xx statuses
    /// other than 401/403/429 count as key-level `Permanent` failures.
    /// That conflates "bad key" with "bad request" (a malformed query on
    /// a valid key evicts a healthy key), but it is the historical
    /// default of this library, so it stays on unless disabled.
    pub fn new(treat_client_errors_as_permanent: bool) -> Self {
        Self {
            treat_client_errors_as_permanent,
        }
    }

    /// Classify an attempt outcome.
    ///
    /// Exactly one of `status` / `error` is expected; if neither is
    /// supplied the result is [`ErrorKind::Unknown`]. Transport errors
    /// take priority over any status.
    pub fn classify(&self, status: Option<StatusCode>, error: Option<&TransportError>) -> ErrorKind {
        if let Some(err) = error {
            return match err {
                TransportError::Connect(_) | TransportError::Timeout(_) => ErrorKind::Network,
                TransportError::Other(_) => ErrorKind::Unknown,
            };
        }

        let Some(status) = status else {
            return ErrorKind::Unknown;
        };

        match status.as_u16() {
            429 => ErrorKind::RateLimit,
            500 | 502 | 503 | 504 => ErrorKind::Temporary,
            401 | 403 => ErrorKind::Permanent,
            400..=499 if self.treat_client_errors_as_permanent => ErrorKind::Permanent,
            _ => ErrorKind::Unknown,
        }
    }

    /// Whether an attempt with this classification counts as a success
    /// for key-health purposes. Only [`ErrorKind::Unknown`] qualifies:
    /// no failure category matched.
    pub fn is_success(&self, kind: ErrorKind) -> bool {
        !matches!(
            kind,
            ErrorKind::RateLimit
                | ErrorKind::Temporary
                | ErrorKind::Permanent
                | ErrorKind::Network
        )
    }
}
