//! Response caching middleware.
//!
//! Avoids re-issuing idempotent requests whose prior successful
//! response is still fresh. Entries are bounded three ways: by TTL, by
//! entry count, and by total byte footprint, with least-recently-used
//! eviction when a budget is exceeded.

use crate::context::{RequestContext, ResponseContext};
use crate::middleware::Middleware;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Request headers that never participate in the cache key.
const KEY_EXCLUDED_HEADERS: [&str; 4] = ["authorization", "x-api-key", "user-agent", "cookie"];

/// Content types that must never be cached (streaming responses).
const STREAMING_CONTENT_TYPES: [&str; 2] = ["text/event-stream", "multipart/x-mixed-replace"];

/// URL substrings that mark a response as too sensitive to cache.
const SENSITIVE_URL_PATTERNS: [&str; 5] = ["/login", "/auth", "/password", "/token", "/session"];

/// Run the expired-entry sweep every this many lookups.
const SWEEP_EVERY: u64 = 100;

/// Caching middleware configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// How long an entry stays fresh.
    pub ttl: Duration,
    /// Cache only GET requests (default). When disabled, request
    /// bodies participate in the cache key for POST/PUT/PATCH.
    pub get_only: bool,
    /// Maximum number of entries.
    pub max_entries: usize,
    /// Maximum total byte footprint across all entries.
    pub max_total_bytes: usize,
    /// Maximum byte size of a single cacheable response.
    pub max_response_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            get_only: true,
            max_entries: 1000,
            max_total_bytes: 100 * 1024 * 1024,
            max_response_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Cache statistics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    /// Live entry count.
    pub entries: usize,
    /// Total byte footprint of live entries.
    pub total_bytes: usize,
    /// Lookup hits since creation or the last `clear`.
    pub hits: u64,
    /// Lookup misses since creation or the last `clear`.
    pub misses: u64,
    /// `hits / (hits + misses)`, 0.0 when no lookups happened.
    pub hit_rate: f64,
}

struct CacheEntry {
    response: ResponseContext,
    size: usize,
    inserted_at: Instant,
    last_access: u64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    total_bytes: usize,
    access_seq: u64,
    hits: u64,
    misses: u64,
}

impl CacheState {
    fn next_seq(&mut self) -> u64 {
        self.access_seq += 1;
        self.access_seq
    }

    fn remove(&mut self, key: &str) {
        if let Some(entry) = self.entries.remove(key) {
            self.total_bytes -= entry.size;
        }
    }

    /// Evict the least-recently-used entry, if any.
    fn evict_lru(&mut self) {
        let victim = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_access)
            .map(|(key, _)| key.clone());
        if let Some(key) = victim {
            debug!(key = %&key[..16.min(key.len())], "cache LRU eviction");
            self.remove(&key);
        }
    }

    fn evict_expired(&mut self, ttl: Duration) {
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.inserted_at.elapsed() >= ttl)
            .map(|(key, _)| key.clone())
            .collect();
        let evicted = stale.len();
        for key in stale {
            self.remove(&key);
        }
        if evicted > 0 {
            debug!(evicted, "swept expired cache entries");
        }
    }
}

/// TTL + LRU + byte-budget response cache.
pub struct CachingMiddleware {
    config: CacheConfig,
    state: Mutex<CacheState>,
}

impl CachingMiddleware {
    /// Create a cache with the given configuration.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Stable hash identifying a request for caching purposes.
    ///
    /// Covers the uppercased method, the URL, the sorted non-sensitive
    /// request headers, and (for body-carrying methods) the canonical
    /// body serialization. Credentials never participate, so requests
    /// that differ only by key share an entry.
    fn cache_key(&self, ctx: &RequestContext) -> String {
        let mut hasher = Sha256::new();
        hasher.update(ctx.method.as_str().to_uppercase());
        hasher.update(b"|");
        hasher.update(&ctx.url);

        let mut header_parts: Vec<String> = ctx
            .headers
            .iter()
            .filter(|(name, _)| !KEY_EXCLUDED_HEADERS.contains(&name.as_str()))
            .map(|(name, value)| {
                format!("{}:{}", name.as_str(), String::from_utf8_lossy(value.as_bytes()))
            })
            .collect();
        header_parts.sort();
        for part in header_parts {
            hasher.update(b"|");
            hasher.update(&part);
        }

        if matches!(ctx.method.as_str(), "POST" | "PUT" | "PATCH") {
            if let Some(body) = &ctx.body {
                hasher.update(b"|");
                hasher.update(body.canonical_string());
            }
        }

        format!("{:x}", hasher.finalize())
    }

    /// Whether a successful response may be stored without risking
    /// cache poisoning or credential leakage. Failing any check skips
    /// caching silently.
    fn is_safe_to_cache(&self, response: &ResponseContext) -> bool {
        if response.headers.contains_key(reqwest::header::SET_COOKIE) {
            debug!("not caching: response sets cookies");
            return false;
        }

        if let Some(content_type) = response.headers.get(reqwest::header::CONTENT_TYPE) {
            let content_type = String::from_utf8_lossy(content_type.as_bytes()).to_lowercase();
            if STREAMING_CONTENT_TYPES.iter().any(|t| content_type.contains(t)) {
                debug!(%content_type, "not caching: streaming content type");
                return false;
            }
        }

        if let Some(cache_control) = response.headers.get(reqwest::header::CACHE_CONTROL) {
            let cache_control = String::from_utf8_lossy(cache_control.as_bytes()).to_lowercase();
            if cache_control.contains("no-store") || cache_control.contains("private") {
                debug!(%cache_control, "not caching: forbidden by Cache-Control");
                return false;
            }
        }

        let size = response.approx_size();
        if size > self.config.max_response_bytes {
            warn!(
                size,
                limit = self.config.max_response_bytes,
                "not caching: response too large"
            );
            return false;
        }

        let url = response.request.url.to_lowercase();
        if SENSITIVE_URL_PATTERNS.iter().any(|p| url.contains(p)) {
            debug!("not caching: sensitive URL");
            return false;
        }

        true
    }

    /// Clear the cache and reset the hit/miss counters atomically.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        *state = CacheState::default();
        debug!("cache cleared");
    }

    /// Current statistics.
    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        let lookups = state.hits + state.misses;
        CacheStats {
            entries: state.entries.len(),
            total_bytes: state.total_bytes,
            hits: state.hits,
            misses: state.misses,
            hit_rate: if lookups > 0 {
                state.hits as f64 / lookups as f64
            } else {
                0.0
            },
        }
    }
}

#[async_trait]
impl Middleware for CachingMiddleware {
    async fn before_request(&self, ctx: &mut RequestContext) -> Option<ResponseContext> {
        if self.config.get_only && ctx.method != reqwest::Method::GET {
            return None;
        }

        let key = self.cache_key(ctx);
        let mut state = self.state.lock();

        // Opportunistic sweep so entries that are never looked up
        // again cannot accumulate forever.
        if (state.hits + state.misses) % SWEEP_EVERY == 0 {
            state.evict_expired(self.config.ttl);
        }

        let fresh = state
            .entries
            .get(&key)
            .map(|entry| entry.inserted_at.elapsed() < self.config.ttl);

        match fresh {
            Some(true) => {
                state.hits += 1;
                let seq = state.next_seq();
                let hits = state.hits;
                let misses = state.misses;
                state.entries.get_mut(&key).map(|entry| {
                    entry.last_access = seq;
                    debug!(
                        method = %ctx.method,
                        url = %ctx.url,
                        hit_rate = hits as f64 / (hits + misses) as f64,
                        "cache hit"
                    );
                    entry.response.clone()
                })
            }
            Some(false) => {
                // Stale hit counts as a miss and is evicted now.
                state.remove(&key);
                state.misses += 1;
                None
            }
            None => {
                state.misses += 1;
                debug!(method = %ctx.method, url = %ctx.url, "cache miss");
                None
            }
        }
    }

    async fn after_request(&self, ctx: &mut ResponseContext) {
        if self.config.get_only && ctx.request.method != reqwest::Method::GET {
            return;
        }
        if !ctx.status.is_success() {
            return;
        }
        if !self.is_safe_to_cache(ctx) {
            return;
        }

        let size = ctx.approx_size();
        // A response that alone exceeds the byte budget is never
        // cached; evicting the whole cache for it would be pointless.
        if size > self.config.max_total_bytes {
            warn!(size, budget = self.config.max_total_bytes, "response exceeds cache budget");
            return;
        }

        let key = self.cache_key(&ctx.request);
        let mut state = self.state.lock();

        if !state.entries.contains_key(&key) {
            while state.entries.len() >= self.config.max_entries {
                state.evict_lru();
            }
            while state.total_bytes + size > self.config.max_total_bytes {
                state.evict_lru();
            }
        } else {
            // Refreshing an existing entry replaces it in place; the
            // budgets already account for it.
            state.remove(&key);
        }

        let seq = state.next_seq();
        state.total_bytes += size;
        state.entries.insert(
            key,
            CacheEntry {
                response: ctx.clone(),
                size,
                inserted_at: Instant::now(),
                last_access: seq,
            },
        );

        debug!(
            url = %ctx.request.url,
            size,
            entries = state.entries.len(),
            total_bytes = state.total_bytes,
            "cached response"
        );
    }
}
