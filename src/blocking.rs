//! Synchronous facade over the async rotator.
//!
//! Owns a private Tokio runtime and blocks on the async
//! implementation, so callers without an async context get the same
//! rotation semantics. Must not be used from within an async runtime;
//! `block_on` would panic there.

use crate::context::{RequestOptions, ResponseContext};
use crate::error::{Result, RotatorError};
use crate::rotator::RotatorBuilder;
use reqwest::Method;
use std::collections::HashMap;
use tokio::runtime::Runtime;

/// Blocking wrapper around [`crate::Rotator`].
pub struct Rotator {
    inner: crate::Rotator,
    runtime: Runtime,
}

impl Rotator {
    /// Blocking rotator over `keys` with default configuration.
    pub fn new(keys: Vec<String>) -> Result<Self> {
        Self::from_builder(crate::Rotator::builder().keys(keys))
    }

    /// Build from a configured [`RotatorBuilder`].
    pub fn from_builder(builder: RotatorBuilder) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .map_err(|e| RotatorError::InvalidConfig(format!("cannot start runtime: {e}")))?;
        let inner = runtime.block_on(builder.build())?;
        Ok(Self { inner, runtime })
    }

    /// Blocking equivalent of [`crate::Rotator::request`].
    pub fn request(
        &self,
        method: Method,
        url: &str,
        options: RequestOptions,
    ) -> Result<ResponseContext> {
        self.runtime.block_on(self.inner.request(method, url, options))
    }

    /// Blocking GET.
    pub fn get(&self, url: &str, options: RequestOptions) -> Result<ResponseContext> {
        self.request(Method::GET, url, options)
    }

    /// Blocking POST.
    pub fn post(&self, url: &str, options: RequestOptions) -> Result<ResponseContext> {
        self.request(Method::POST, url, options)
    }

    /// Blocking PUT.
    pub fn put(&self, url: &str, options: RequestOptions) -> Result<ResponseContext> {
        self.request(Method::PUT, url, options)
    }

    /// Blocking DELETE.
    pub fn delete(&self, url: &str, options: RequestOptions) -> Result<ResponseContext> {
        self.request(Method::DELETE, url, options)
    }

    /// Blocking equivalent of [`crate::Rotator::refresh_keys`].
    pub fn refresh_keys(&self) -> Result<usize> {
        self.runtime.block_on(self.inner.refresh_keys())
    }

    /// Metrics snapshot for every live key.
    pub fn key_statistics(&self) -> HashMap<String, crate::metrics::KeyStats> {
        self.inner.key_statistics()
    }

    /// Number of keys currently in the pool.
    pub fn key_count(&self) -> usize {
        self.inner.key_count()
    }
}
