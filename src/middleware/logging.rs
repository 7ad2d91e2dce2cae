//! Request/response logging middleware.
//!
//! Emits structured `tracing` events for each lifecycle point, masking
//! keys and redacting sensitive header values. Never claims errors as
//! handled, so it can be registered ahead of handling middleware to
//! observe everything.

use crate::context::{ErrorContext, RequestContext, ResponseContext};
use crate::middleware::Middleware;
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use tracing::{debug, info, warn};

const SENSITIVE_HEADERS: [&str; 4] = ["authorization", "x-api-key", "cookie", "set-cookie"];

/// Logs requests, responses, and errors with credentials masked.
pub struct LoggingMiddleware {
    verbose: bool,
}

impl LoggingMiddleware {
    /// Create a logging middleware. `verbose` additionally logs
    /// redacted headers at debug level.
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }

    fn mask_key(key: &str) -> String {
        // Char-based prefix: keys are opaque strings and may hold
        // multibyte characters.
        let prefix: String = key.chars().take(4).collect();
        format!("{prefix}****")
    }

    fn redacted_headers(headers: &HeaderMap) -> Vec<(String, String)> {
        headers
            .iter()
            .map(|(name, value)| {
                let value = if SENSITIVE_HEADERS.contains(&name.as_str()) {
                    "****".to_string()
                } else {
                    String::from_utf8_lossy(value.as_bytes()).into_owned()
                };
                (name.as_str().to_string(), value)
            })
            .collect()
    }
}

impl Default for LoggingMiddleware {
    fn default() -> Self {
        Self::new(false)
    }
}

#[async_trait]
impl Middleware for LoggingMiddleware {
    async fn before_request(&self, ctx: &mut RequestContext) -> Option<ResponseContext> {
        info!(
            method = %ctx.method,
            url = %ctx.url,
            key = %Self::mask_key(&ctx.key),
            attempt = ctx.attempt,
            "sending request"
        );
        if self.verbose {
            debug!(headers = ?Self::redacted_headers(&ctx.headers), "request headers");
        }
        None
    }

    async fn after_request(&self, ctx: &mut ResponseContext) {
        info!(
            method = %ctx.request.method,
            url = %ctx.request.url,
            status = ctx.status.as_u16(),
            bytes = ctx.body.len(),
            "received response"
        );
        if self.verbose {
            debug!(headers = ?Self::redacted_headers(&ctx.headers), "response headers");
        }
    }

    async fn on_error(&self, ctx: &ErrorContext<'_>) -> bool {
        warn!(
            method = %ctx.request.method,
            url = %ctx.request.url,
            key = %Self::mask_key(&ctx.request.key),
            status = ?ctx.status().map(|s| s.as_u16()),
            error = ?ctx.error.map(|e| e.to_string()),
            "request attempt failed"
        );
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};

    #[test]
    fn test_key_masking() {
        assert_eq!(LoggingMiddleware::mask_key("sk-abcdef"), "sk-a****");
        assert_eq!(LoggingMiddleware::mask_key("ab"), "ab****");
    }

    #[test]
    fn test_key_masking_with_multibyte_characters() {
        assert_eq!(LoggingMiddleware::mask_key("ab€cdef"), "ab€c****");
        assert_eq!(LoggingMiddleware::mask_key("€€"), "€€****");
    }

    #[test]
    fn test_sensitive_headers_redacted() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer sk-secret"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let redacted = LoggingMiddleware::redacted_headers(&headers);
        let auth = redacted.iter().find(|(n, _)| n == "authorization").unwrap();
        let content = redacted.iter().find(|(n, _)| n == "content-type").unwrap();
        assert_eq!(auth.1, "****");
        assert_eq!(content.1, "application/json");
    }
}
