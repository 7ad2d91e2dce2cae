//! Retry middleware.
//!
//! Tracks a failure counter per URL (not per key) and absorbs errors
//! with an exponential backoff until the per-URL cap is reached, at
//! which point tracking is cleared and the error propagates.

use crate::context::{ErrorContext, ResponseContext};
use crate::middleware::Middleware;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Retry middleware configuration.
#[derive(Debug, Clone)]
pub struct RetryMiddlewareConfig {
    /// Maximum retries per URL before the error propagates.
    pub max_retries: u32,
    /// Backoff base: the nth retry sleeps `backoff_factor^n` seconds.
    pub backoff_factor: f64,
    /// Maximum number of tracked URLs.
    pub max_tracked_urls: usize,
}

impl Default for RetryMiddlewareConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_factor: 2.0,
            max_tracked_urls: 1000,
        }
    }
}

/// Per-URL retry tracker.
pub struct RetryMiddleware {
    config: RetryMiddlewareConfig,
    counts: Mutex<HashMap<String, u32>>,
}

impl RetryMiddleware {
    /// Create a tracker with the given configuration.
    pub fn new(config: RetryMiddlewareConfig) -> Self {
        Self {
            config: RetryMiddlewareConfig {
                max_retries: config.max_retries.max(1),
                backoff_factor: config.backoff_factor.max(1.0),
                max_tracked_urls: config.max_tracked_urls.max(1),
            },
            counts: Mutex::new(HashMap::new()),
        }
    }

    /// Delay before the retry following `failures` prior failures.
    /// Strictly increasing while `backoff_factor > 1`.
    pub fn backoff_delay(&self, failures: u32) -> Duration {
        Duration::from_secs_f64(self.config.backoff_factor.powi(failures as i32))
    }

    /// Number of URLs currently tracked.
    pub fn tracked_urls(&self) -> usize {
        self.counts.lock().len()
    }

    /// Forget every tracked URL.
    pub fn clear(&self) {
        self.counts.lock().clear();
    }

    /// Drop the 10% of entries with the lowest counters.
    fn evict_oldest(counts: &mut HashMap<String, u32>) {
        let mut by_count: Vec<(String, u32)> = counts
            .iter()
            .map(|(url, count)| (url.clone(), *count))
            .collect();
        by_count.sort_by_key(|(_, count)| *count);

        let to_remove = (by_count.len() / 10).max(1);
        for (url, _) in by_count.into_iter().take(to_remove) {
            counts.remove(&url);
        }
        debug!(to_remove, "evicted oldest retry entries");
    }
}

#[async_trait]
impl Middleware for RetryMiddleware {
    async fn after_request(&self, ctx: &mut ResponseContext) {
        if !ctx.status.is_success() {
            return;
        }
        let mut counts = self.counts.lock();
        if let Some(retries) = counts.remove(&ctx.request.url) {
            if retries > 0 {
                debug!(url = %ctx.request.url, retries, "request succeeded after retries");
            }
        }
    }

    async fn on_error(&self, ctx: &ErrorContext<'_>) -> bool {
        let url = &ctx.request.url;

        let wait = {
            let mut counts = self.counts.lock();
            let count = counts.get(url).copied().unwrap_or(0);

            if count >= self.config.max_retries {
                counts.remove(url);
                error!(url = %url, max = self.config.max_retries, "retries exhausted");
                return false;
            }

            if !counts.contains_key(url) {
                while counts.len() >= self.config.max_tracked_urls {
                    Self::evict_oldest(&mut counts);
                }
            }
            counts.insert(url.clone(), count + 1);

            let wait = self.backoff_delay(count);
            warn!(
                url = %url,
                retry = count + 1,
                max = self.config.max_retries,
                wait_s = wait.as_secs_f64(),
                "retrying after backoff"
            );
            wait
        };

        // Sleep with the lock released.
        tokio::time::sleep(wait).await;
        true
    }
}
