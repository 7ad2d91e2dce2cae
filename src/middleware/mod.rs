//! Middleware pipeline.
//!
//! Middleware intercept the request lifecycle at three points:
//! `before_request` (mutate the outgoing request, or serve a response
//! without touching the transport), `after_request` (mutate the
//! received response), and `on_error` (observe or absorb a failed
//! attempt). All three have safe defaults, so implementations only
//! override what they need.

mod cache;
mod logging;
mod rate_limit;
mod retry;

pub use cache::{CacheConfig, CacheStats, CachingMiddleware};
pub use logging::LoggingMiddleware;
pub use rate_limit::{RateLimitConfig, RateLimitMiddleware};
pub use retry::{RetryMiddleware, RetryMiddlewareConfig};

use crate::context::{ErrorContext, RequestContext, ResponseContext};
use async_trait::async_trait;
use std::sync::Arc;

/// A unit intercepting request/response/error lifecycle events.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Called before the transport sends the request. May mutate the
    /// context in place. Returning `Some(response)` short-circuits the
    /// attempt: the transport is never invoked and the response is
    /// returned to the caller (this is how a cache hit is served).
    async fn before_request(&self, _ctx: &mut RequestContext) -> Option<ResponseContext> {
        None
    }

    /// Called after the transport returns a response. May mutate the
    /// response in place.
    async fn after_request(&self, _ctx: &mut ResponseContext) {}

    /// Called when an attempt fails. Returning `true` claims the error
    /// as handled: the rotator retries without consuming an attempt
    /// and later middleware never see the error.
    async fn on_error(&self, _ctx: &ErrorContext<'_>) -> bool {
        false
    }
}

/// Ordered middleware set.
///
/// `before_request` and `after_request` run in registration order;
/// `on_error` stops at the first middleware that reports handled
/// (short-circuit OR). Ordering matters: a logging middleware placed
/// after a handling middleware will not observe handled errors.
#[derive(Clone, Default)]
pub struct Pipeline {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl Pipeline {
    /// Pipeline over `middlewares`, executed in the given order.
    pub fn new(middlewares: Vec<Arc<dyn Middleware>>) -> Self {
        Self { middlewares }
    }

    /// Number of registered middleware.
    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    /// Whether the pipeline has no middleware.
    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Run the `before_request` chain in registration order. The first
    /// short-circuit response wins and the rest of the chain is
    /// skipped.
    pub async fn before_request(&self, ctx: &mut RequestContext) -> Option<ResponseContext> {
        for middleware in &self.middlewares {
            if let Some(response) = middleware.before_request(ctx).await {
                return Some(response);
            }
        }
        None
    }

    /// Run the `after_request` chain in registration order.
    pub async fn after_request(&self, ctx: &mut ResponseContext) {
        for middleware in &self.middlewares {
            middleware.after_request(ctx).await;
        }
    }

    /// Run the `on_error` chain, stopping at the first handler.
    pub async fn on_error(&self, ctx: &ErrorContext<'_>) -> bool {
        for middleware in &self.middlewares {
            if middleware.on_error(ctx).await {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderMap;
    use reqwest::Method;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn request_ctx() -> RequestContext {
        RequestContext {
            method: Method::GET,
            url: "http://example.test/data".to_string(),
            headers: HeaderMap::new(),
            cookies: HashMap::new(),
            key: "key-1".to_string(),
            attempt: 0,
            body: None,
            timeout: Duration::from_secs(10),
            proxy: None,
        }
    }

    struct Tagger(&'static str);

    #[async_trait]
    impl Middleware for Tagger {
        async fn before_request(&self, ctx: &mut RequestContext) -> Option<ResponseContext> {
            let tagged = format!("{}{}", ctx.url, self.0);
            ctx.url = tagged;
            None
        }
    }

    struct Handler {
        handles: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Middleware for Handler {
        async fn on_error(&self, _ctx: &ErrorContext<'_>) -> bool {
            self.calls.fetch_add(1, Ordering::Relaxed);
            self.handles
        }
    }

    #[tokio::test]
    async fn test_before_request_runs_in_registration_order() {
        let pipeline = Pipeline::new(vec![Arc::new(Tagger("|first")), Arc::new(Tagger("|second"))]);
        let mut ctx = request_ctx();
        assert!(pipeline.before_request(&mut ctx).await.is_none());
        assert!(ctx.url.ends_with("|first|second"));
    }

    #[tokio::test]
    async fn test_on_error_stops_at_first_handler() {
        let observer = Arc::new(Handler {
            handles: false,
            calls: AtomicUsize::new(0),
        });
        let handler = Arc::new(Handler {
            handles: true,
            calls: AtomicUsize::new(0),
        });
        let unreached = Arc::new(Handler {
            handles: true,
            calls: AtomicUsize::new(0),
        });

        let pipeline = Pipeline::new(vec![observer.clone(), handler.clone(), unreached.clone()]);
        let ctx = request_ctx();
        let error = crate::error::TransportError::Connect("refused".into());
        let error_ctx = ErrorContext {
            error: Some(&error),
            request: &ctx,
            response: None,
        };

        assert!(pipeline.on_error(&error_ctx).await);
        assert_eq!(observer.calls.load(Ordering::Relaxed), 1);
        assert_eq!(handler.calls.load(Ordering::Relaxed), 1);
        assert_eq!(unreached.calls.load(Ordering::Relaxed), 0);
    }
}
