//! Resilient HTTP client that rotates across a pool of API keys.
//!
//! Failures are classified into actionable categories (rate limited,
//! temporary, permanent, network) and drive the loop: permanently
//! rejected keys are evicted, throttled keys are rotated away from,
//! transient failures retry with exponential backoff. A middleware
//! pipeline wraps every attempt with caching, rate-limit pacing,
//! per-URL retries, and logging; rotation order is pluggable via
//! [`StrategyKind`].
//!
//! ```no_run
//! use keyrotor::{RequestOptions, Rotator, StrategyKind};
//!
//! # async fn run() -> keyrotor::Result<()> {
//! let rotator = Rotator::builder()
//!     .keys(vec!["sk-first".into(), "sk-second".into()])
//!     .strategy(StrategyKind::LeastRecentlyUsed)
//!     .build()
//!     .await?;
//!
//! let response = rotator
//!     .get("https://api.example.com/v1/items", RequestOptions::new())
//!     .await?;
//! println!("{}", response.text());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod blocking;
pub mod classifier;
pub mod config;
pub mod context;
pub mod error;
pub mod metrics;
pub mod middleware;
pub mod provider;
pub mod rotator;
pub mod store;
pub mod strategy;
pub mod transport;

pub use classifier::{ErrorClassifier, ErrorKind};
pub use config::{DelayRange, RotatorConfig};
pub use context::{RequestBody, RequestContext, RequestOptions, ResponseContext};
pub use error::{Result, RotatorError, TransportError};
pub use metrics::{KeyMetrics, KeyStats};
pub use middleware::{
    CacheConfig, CachingMiddleware, LoggingMiddleware, Middleware, Pipeline, RateLimitConfig,
    RateLimitMiddleware, RetryMiddleware, RetryMiddlewareConfig,
};
pub use provider::{EnvSecretProvider, FileSecretProvider, SecretProvider};
pub use rotator::{HeaderCallback, RetryPredicate, Rotator, RotatorBuilder};
pub use store::{ConfigStore, DomainHeaders, JsonFileStore};
pub use strategy::{RotationStrategy, StrategyKind};
pub use transport::{HttpTransport, Transport};

/// Crate version, as published.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
