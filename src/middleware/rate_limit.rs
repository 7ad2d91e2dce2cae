//! Rate-limit tracking middleware.
//!
//! Tracks per-key rate-limit windows parsed from standard response
//! headers (`X-RateLimit-*`, `Retry-After`) and optionally pauses an
//! attempt until the key's window resets. A 429 error is claimed as
//! handled so the rotator treats it as a rotation signal rather than a
//! fatal outcome.

use crate::context::{ErrorContext, RequestContext, ResponseContext};
use crate::middleware::Middleware;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Fallback reset window for a 429 without `Retry-After`.
const DEFAULT_RESET_WINDOW: Duration = Duration::from_secs(60);

/// Run the expired-entry cleanup every this many requests.
const CLEANUP_EVERY: u64 = 50;

/// Tracked windows older than this past their reset are dropped.
const STALE_AFTER: Duration = Duration::from_secs(3600);

/// Rate-limit middleware configuration.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Pause an attempt until the key's reset time when it is in the
    /// future. Disabled, the middleware only records windows.
    pub pause_on_limit: bool,
    /// Longest single pause; a reset further away than this is waited
    /// for only up to the cap (bounded wait, not indefinite).
    pub max_pause: Duration,
    /// Maximum number of tracked keys.
    pub max_tracked_keys: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            pause_on_limit: true,
            max_pause: Duration::from_secs(120),
            max_tracked_keys: 1000,
        }
    }
}

#[derive(Debug, Default, Clone)]
struct WindowInfo {
    limit: Option<u64>,
    remaining: Option<u64>,
    reset_at: Option<SystemTime>,
}

#[derive(Default)]
struct TrackerState {
    windows: HashMap<String, WindowInfo>,
    request_count: u64,
}

impl TrackerState {
    fn cleanup_expired(&mut self) {
        let cutoff = SystemTime::now() - STALE_AFTER;
        let before = self.windows.len();
        self.windows
            .retain(|_, info| info.reset_at.map_or(true, |reset| reset > cutoff));
        let removed = before - self.windows.len();
        if removed > 0 {
            debug!(removed, "cleaned up stale rate-limit windows");
        }
    }

    /// Drop the 10% of entries with the oldest reset times.
    fn evict_oldest(&mut self) {
        let mut by_reset: Vec<(String, Option<SystemTime>)> = self
            .windows
            .iter()
            .map(|(key, info)| (key.clone(), info.reset_at))
            .collect();
        by_reset.sort_by_key(|(_, reset)| *reset);

        let to_remove = (by_reset.len() / 10).max(1);
        for (key, _) in by_reset.into_iter().take(to_remove) {
            self.windows.remove(&key);
        }
        debug!(to_remove, "evicted oldest rate-limit windows");
    }
}

/// Per-key rate-limit tracker.
pub struct RateLimitMiddleware {
    config: RateLimitConfig,
    state: Mutex<TrackerState>,
}

impl RateLimitMiddleware {
    /// Create a tracker with the given configuration.
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: Mutex::new(TrackerState::default()),
        }
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.state.lock().windows.len()
    }

    /// Number of keys whose reset time is still in the future.
    pub fn active_limits(&self) -> usize {
        let now = SystemTime::now();
        self.state
            .lock()
            .windows
            .values()
            .filter(|info| info.reset_at.map_or(false, |reset| reset > now))
            .count()
    }

    /// Forget every tracked window.
    pub fn clear(&self) {
        self.state.lock().windows.clear();
    }

    fn record_window(&self, key: &str, info: WindowInfo) {
        let mut state = self.state.lock();
        if state.windows.len() >= self.config.max_tracked_keys
            && !state.windows.contains_key(key)
        {
            state.evict_oldest();
        }
        debug!(key = %mask(key), remaining = ?info.remaining, "updated rate-limit window");
        state.windows.insert(key.to_string(), info);
    }

    fn parse_headers(headers: &reqwest::header::HeaderMap) -> WindowInfo {
        let header_u64 = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
        };

        let mut info = WindowInfo {
            limit: header_u64("x-ratelimit-limit"),
            remaining: header_u64("x-ratelimit-remaining"),
            reset_at: header_u64("x-ratelimit-reset")
                .map(|epoch| UNIX_EPOCH + Duration::from_secs(epoch)),
        };

        if let Some(retry_after) = headers
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
        {
            info.reset_at = parse_retry_after(retry_after).or(info.reset_at);
        }

        info
    }
}

/// `Retry-After` is either delay seconds or an HTTP-date.
fn parse_retry_after(value: &str) -> Option<SystemTime> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(SystemTime::now() + Duration::from_secs(seconds));
    }
    chrono::DateTime::parse_from_rfc2822(value)
        .ok()
        .and_then(|date| {
            let epoch = date.timestamp();
            (epoch >= 0).then(|| UNIX_EPOCH + Duration::from_secs(epoch as u64))
        })
}

fn mask(key: &str) -> String {
    let prefix: String = key.chars().take(4).collect();
    format!("{prefix}****")
}

#[async_trait]
impl Middleware for RateLimitMiddleware {
    async fn before_request(&self, ctx: &mut RequestContext) -> Option<ResponseContext> {
        // Compute the wait under the lock, sleep outside it, so one
        // throttled key never blocks requests for other keys.
        let wait = {
            let mut state = self.state.lock();
            state.request_count += 1;
            if state.request_count % CLEANUP_EVERY == 0 {
                state.cleanup_expired();
                if state.windows.len() >= self.config.max_tracked_keys {
                    state.evict_oldest();
                }
            }

            if !self.config.pause_on_limit {
                None
            } else {
                state.windows.get(&ctx.key).and_then(|info| {
                    info.reset_at
                        .and_then(|reset| reset.duration_since(SystemTime::now()).ok())
                })
            }
        };

        if let Some(wait) = wait {
            let wait = wait.min(self.config.max_pause);
            warn!(key = %mask(&ctx.key), wait_s = wait.as_secs_f64(), "pausing for rate-limit window");
            tokio::time::sleep(wait).await;
        }

        None
    }

    async fn after_request(&self, ctx: &mut ResponseContext) {
        let info = Self::parse_headers(&ctx.headers);
        if info.limit.is_some() || info.remaining.is_some() || info.reset_at.is_some() {
            self.record_window(&ctx.request.key, info);
        }
    }

    async fn on_error(&self, ctx: &ErrorContext<'_>) -> bool {
        let Some(response) = ctx.response else {
            return false;
        };
        if response.status != reqwest::StatusCode::TOO_MANY_REQUESTS {
            return false;
        }

        let key = &ctx.request.key;
        warn!(key = %mask(key), "rate limit (429) hit");

        let reset_at = response
            .headers
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after)
            .unwrap_or_else(|| SystemTime::now() + DEFAULT_RESET_WINDOW);

        self.record_window(
            key,
            WindowInfo {
                limit: None,
                remaining: Some(0),
                reset_at: Some(reset_at),
            },
        );

        true
    }
}
