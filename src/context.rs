//! Request, response, and error envelopes.
//!
//! These are the shapes middleware operate on: a [`RequestContext`] is
//! created fresh per attempt and mutated in place by `before_request`
//! hooks; a [`ResponseContext`] carries the response plus a back
//! reference to the request that produced it; an [`ErrorContext`] wraps
//! a failed attempt for `on_error` hooks.

use crate::error::TransportError;
use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::time::Duration;

/// A request body in one of the supported encodings.
#[derive(Debug, Clone)]
pub enum RequestBody {
    /// JSON payload, sent with `Content-Type: application/json`.
    Json(serde_json::Value),
    /// Plain text payload.
    Text(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
}

impl RequestBody {
    /// Canonical string form, stable across semantically equal bodies.
    ///
    /// JSON maps serialize with sorted keys, so two JSON bodies that
    /// differ only in key order produce the same string. Non-UTF-8
    /// byte bodies fall back to a lossy rendering.
    pub fn canonical_string(&self) -> String {
        match self {
            Self::Json(value) => value.to_string(),
            Self::Text(text) => text.clone(),
            Self::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        }
    }

    /// Approximate byte size of the payload.
    pub fn len(&self) -> usize {
        match self {
            Self::Json(value) => value.to_string().len(),
            Self::Text(text) => text.len(),
            Self::Bytes(bytes) => bytes.len(),
        }
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Caller-supplied per-request options.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Extra headers merged into every attempt.
    pub headers: HeaderMap,
    /// Cookies sent with every attempt.
    pub cookies: HashMap<String, String>,
    /// Request body, if any.
    pub body: Option<RequestBody>,
    /// Overrides the rotator's default transport timeout.
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    /// Empty options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the request body to a JSON value.
    pub fn json(mut self, value: serde_json::Value) -> Self {
        self.body = Some(RequestBody::Json(value));
        self
    }

    /// Merge extra headers.
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers.extend(headers);
        self
    }

    /// Override the transport timeout for this request.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// One attempt's request state, mutable by `before_request` middleware
/// and read-only to the transport.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// HTTP method.
    pub method: Method,
    /// Full request URL.
    pub url: String,
    /// Headers for this attempt (case-insensitive lookups via
    /// `HeaderMap`).
    pub headers: HeaderMap,
    /// Cookies for this attempt.
    pub cookies: HashMap<String, String>,
    /// The key selected for this attempt.
    pub key: String,
    /// Zero-based attempt index within the request loop.
    pub attempt: u32,
    /// Request body, if any.
    pub body: Option<RequestBody>,
    /// Effective transport timeout for this attempt.
    pub timeout: Duration,
    /// Proxy URL for this attempt, if rotation is configured.
    pub proxy: Option<String>,
}

/// A received response, mutable by `after_request` middleware.
#[derive(Debug, Clone)]
pub struct ResponseContext {
    /// HTTP status code.
    pub status: StatusCode,
    /// Response headers.
    pub headers: HeaderMap,
    /// Response body bytes. Empty when the transport had no body.
    pub body: Bytes,
    /// The request that produced this response.
    pub request: RequestContext,
}

impl ResponseContext {
    /// Body decoded as UTF-8 (lossy).
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Body deserialized as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> crate::Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Whether the status is in the 2xx range.
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Approximate in-memory footprint: body plus a rough header cost.
    /// Used by the caching middleware's byte budget.
    pub fn approx_size(&self) -> usize {
        let header_bytes: usize = self
            .headers
            .iter()
            .map(|(name, value)| name.as_str().len() + value.as_bytes().len())
            .sum();
        self.body.len() + header_bytes
    }
}

/// A failed attempt, passed through `on_error` middleware.
///
/// `error` is present for transport-level failures; `response` is
/// present when the failure derives from a received-but-unacceptable
/// response (e.g. a 429).
#[derive(Debug)]
pub struct ErrorContext<'a> {
    /// The transport error, if the attempt failed before a response.
    pub error: Option<&'a TransportError>,
    /// The request that failed.
    pub request: &'a RequestContext,
    /// The offending response, when one was received.
    pub response: Option<&'a ResponseContext>,
}

impl ErrorContext<'_> {
    /// Status code of the offending response, if any.
    pub fn status(&self) -> Option<StatusCode> {
        self.response.map(|r| r.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_body_canonical_form_is_key_order_independent() {
        let a = RequestBody::Json(json!({"b": 1, "a": 2}));
        let b = RequestBody::Json(json!({"a": 2, "b": 1}));
        assert_eq!(a.canonical_string(), b.canonical_string());
    }

    #[test]
    fn test_response_json_decoding() {
        let ctx = ResponseContext {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"{\"ok\": true}"),
            request: RequestContext {
                method: Method::GET,
                url: "http://example.test".to_string(),
                headers: HeaderMap::new(),
                cookies: HashMap::new(),
                key: "k".to_string(),
                attempt: 0,
                body: None,
                timeout: Duration::from_secs(10),
                proxy: None,
            },
        };

        let value: serde_json::Value = ctx.json().unwrap();
        assert_eq!(value["ok"], true);
        assert!(ctx.is_success());
    }
}
