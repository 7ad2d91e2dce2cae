//! The request orchestrator.
//!
//! [`Rotator`] owns the key pool, drives the rotation strategy, runs
//! the middleware pipeline around every attempt, classifies outcomes,
//! and retries with exponential backoff until the attempt budget is
//! spent. Built via [`RotatorBuilder`].

use crate::classifier::{ErrorClassifier, ErrorKind};
use crate::config::RotatorConfig;
use crate::context::{ErrorContext, RequestContext, RequestOptions, ResponseContext};
use crate::error::{Result, RotatorError};
use crate::metrics::{KeyMetrics, KeyStats};
use crate::middleware::{Middleware, Pipeline};
use crate::provider::SecretProvider;
use crate::store::{ConfigStore, DomainHeaders};
use crate::strategy::StrategyKind;
use crate::transport::{HttpTransport, Transport};
use parking_lot::Mutex;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, USER_AGENT};
use reqwest::Method;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};
use url::Url;

/// Headers never persisted into the per-domain header store.
const UNSAVED_HEADERS: [&str; 4] = ["authorization", "x-api-key", "cookie", "set-cookie"];

/// Customizes the credential headers attached for a key. Receives the
/// selected key and the attempt's header map to mutate. When unset,
/// headers are inferred from the key's shape.
pub type HeaderCallback = Arc<dyn Fn(&str, &mut HeaderMap) + Send + Sync>;

/// Caller predicate forcing a retry of an otherwise-successful
/// response (e.g. a 200 whose body carries an application error).
pub type RetryPredicate = Arc<dyn Fn(&ResponseContext) -> bool + Send + Sync>;

/// What the loop does with a classified attempt.
enum Outcome {
    /// Hand the response to the caller.
    Return,
    /// Evict the key and rotate; consumes no attempt.
    EvictAndContinue,
    /// A middleware absorbed the failure; rotate without consuming an
    /// attempt.
    ContinueUnconsumed,
    /// Consume an attempt and back off before the next one.
    RetryBackoff,
}

/// Pool membership plus the strategy instance built for it. Guarded by
/// one mutex so selection and eviction see a consistent pair.
struct KeyPool {
    keys: Vec<String>,
    strategy: Box<dyn crate::strategy::RotationStrategy>,
    kind: StrategyKind,
}

/// Resilient HTTP client rotating across a pool of API keys.
///
/// Cheap to share: wrap in an [`Arc`] and clone across tasks. All
/// internal state is mutex-guarded; no lock is held across an await
/// point, so concurrent requests interleave freely.
pub struct Rotator {
    pool: Mutex<KeyPool>,
    metrics: Mutex<HashMap<String, KeyMetrics>>,
    domain_headers: Mutex<DomainHeaders>,
    config: RotatorConfig,
    classifier: ErrorClassifier,
    pipeline: Pipeline,
    transport: Arc<dyn Transport>,
    provider: Option<Arc<dyn SecretProvider>>,
    store: Option<Arc<dyn ConfigStore>>,
    header_callback: Option<HeaderCallback>,
    should_retry: Option<RetryPredicate>,
    ua_cursor: AtomicUsize,
    proxy_cursor: AtomicUsize,
}

impl Rotator {
    /// Rotator over `keys` with default configuration, round-robin
    /// rotation, an empty pipeline, and the production HTTP transport.
    pub fn new(keys: Vec<String>) -> Result<Self> {
        RotatorBuilder::default()
            .keys(keys)
            .assemble(None, DomainHeaders::new())
    }

    /// Start building a rotator.
    pub fn builder() -> RotatorBuilder {
        RotatorBuilder::default()
    }

    /// Perform a request, rotating keys and retrying until it succeeds
    /// or the attempt budget (`pool size × max_retries`, taken at call
    /// entry) is spent.
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        options: RequestOptions,
    ) -> Result<ResponseContext> {
        if url.trim().is_empty() {
            return Err(RotatorError::InvalidArgument(
                "url must not be empty".to_string(),
            ));
        }
        let parsed =
            Url::parse(url).map_err(|e| RotatorError::InvalidArgument(format!("invalid url: {e}")))?;

        let initial_keys = self.pool.lock().keys.len();
        if initial_keys == 0 {
            return Err(RotatorError::NoKeys);
        }
        let budget = initial_keys as u32 * self.config.max_retries;
        let mut attempt: u32 = 0;

        while attempt < budget {
            let Some(key) = self.select_key() else {
                // Every key was evicted mid-flight.
                break;
            };

            if let Some(range) = &self.config.random_delay {
                let pace = rand::rng().random_range(range.min..=range.max);
                tokio::time::sleep(pace).await;
            }

            let mut ctx = self.prepare_context(&method, url, &parsed, &key, attempt, &options)?;

            if let Some(response) = self.pipeline.before_request(&mut ctx).await {
                // Served without touching the transport; consumes no
                // budget and records no metrics.
                return Ok(response);
            }

            let started = Instant::now();
            match self.transport.send(&ctx).await {
                Ok(mut response) => {
                    self.pipeline.after_request(&mut response).await;
                    let kind = self.classifier.classify(Some(response.status), None);

                    let outcome = if self.classifier.is_success(kind) {
                        if self
                            .should_retry
                            .as_ref()
                            .is_some_and(|pred| pred(&response))
                        {
                            self.record(&key, false, started.elapsed(), false);
                            Outcome::RetryBackoff
                        } else {
                            Outcome::Return
                        }
                    } else {
                        match kind {
                            ErrorKind::Permanent => {
                                debug!(
                                    key = %mask(&key),
                                    status = response.status.as_u16(),
                                    "permanent failure, evicting key"
                                );
                                self.record(&key, false, started.elapsed(), false);
                                Outcome::EvictAndContinue
                            }
                            _ => {
                                self.record(
                                    &key,
                                    false,
                                    started.elapsed(),
                                    kind == ErrorKind::RateLimit,
                                );
                                let error_ctx = ErrorContext {
                                    error: None,
                                    request: &ctx,
                                    response: Some(&response),
                                };
                                if self.pipeline.on_error(&error_ctx).await {
                                    Outcome::ContinueUnconsumed
                                } else {
                                    Outcome::RetryBackoff
                                }
                            }
                        }
                    };

                    match outcome {
                        Outcome::Return => {
                            self.record(&key, true, started.elapsed(), false);
                            self.absorb_rate_limit_headers(&key, &response.headers);
                            if response.is_success() {
                                self.persist_domain_headers(&parsed, &ctx.headers).await;
                            }
                            return Ok(response);
                        }
                        Outcome::EvictAndContinue => {
                            // Eviction rotates to another key without
                            // consuming an attempt.
                            if self.evict_key(&key) == 0 {
                                return Err(RotatorError::AllKeysExhausted {
                                    keys: initial_keys,
                                    attempts: attempt,
                                    url: url.to_string(),
                                });
                            }
                        }
                        Outcome::ContinueUnconsumed => {}
                        Outcome::RetryBackoff => {
                            attempt += 1;
                            if attempt < budget {
                                self.backoff(attempt).await;
                            }
                        }
                    }
                }
                Err(transport_err) => {
                    self.record(&key, false, started.elapsed(), false);
                    let error_ctx = ErrorContext {
                        error: Some(&transport_err),
                        request: &ctx,
                        response: None,
                    };
                    if !self.pipeline.on_error(&error_ctx).await {
                        attempt += 1;
                        if attempt < budget {
                            self.backoff(attempt).await;
                        }
                    }
                }
            }
        }

        Err(RotatorError::AllKeysExhausted {
            keys: initial_keys,
            attempts: attempt,
            url: url.to_string(),
        })
    }

    /// GET convenience wrapper.
    pub async fn get(&self, url: &str, options: RequestOptions) -> Result<ResponseContext> {
        self.request(Method::GET, url, options).await
    }

    /// POST convenience wrapper.
    pub async fn post(&self, url: &str, options: RequestOptions) -> Result<ResponseContext> {
        self.request(Method::POST, url, options).await
    }

    /// PUT convenience wrapper.
    pub async fn put(&self, url: &str, options: RequestOptions) -> Result<ResponseContext> {
        self.request(Method::PUT, url, options).await
    }

    /// DELETE convenience wrapper.
    pub async fn delete(&self, url: &str, options: RequestOptions) -> Result<ResponseContext> {
        self.request(Method::DELETE, url, options).await
    }

    /// Replace the key pool from the configured secret provider. The
    /// strategy is rebuilt and every key starts with fresh metrics. On
    /// provider failure or an empty refreshed list, the current pool is
    /// kept.
    pub async fn refresh_keys(&self) -> Result<usize> {
        let provider = self
            .provider
            .as_ref()
            .ok_or_else(|| RotatorError::Provider("no secret provider configured".to_string()))?;
        let keys = dedup_keys(provider.refresh_keys().await?);
        if keys.is_empty() {
            return Err(RotatorError::NoKeys);
        }

        let count = keys.len();
        let mut pool = self.pool.lock();
        let mut metrics = self.metrics.lock();
        *metrics = keys
            .iter()
            .map(|k| (k.clone(), KeyMetrics::new(self.config.failure_threshold)))
            .collect();
        pool.strategy = pool.kind.build();
        pool.keys = keys;
        Ok(count)
    }

    /// Point-in-time metrics snapshot for every live key.
    pub fn key_statistics(&self) -> HashMap<String, KeyStats> {
        self.metrics
            .lock()
            .iter()
            .map(|(k, m)| (k.clone(), m.snapshot()))
            .collect()
    }

    /// Restore a key to a healthy state. Returns `false` if the key is
    /// not in the pool.
    pub fn reset_key_health(&self, key: &str) -> bool {
        match self.metrics.lock().get_mut(key) {
            Some(m) => {
                m.reset_health();
                true
            }
            None => false,
        }
    }

    /// Number of keys currently in the pool.
    pub fn key_count(&self) -> usize {
        self.pool.lock().keys.len()
    }

    fn select_key(&self) -> Option<String> {
        let mut pool = self.pool.lock();
        let mut metrics = self.metrics.lock();
        let pool = &mut *pool;
        let key = pool.strategy.select(&pool.keys, &mut metrics)?;
        if let Some(m) = metrics.get_mut(&key) {
            m.touch();
        }
        Some(key)
    }

    fn evict_key(&self, key: &str) -> usize {
        let mut pool = self.pool.lock();
        let mut metrics = self.metrics.lock();
        pool.keys.retain(|k| k != key);
        metrics.remove(key);
        pool.strategy = pool.kind.build();
        pool.keys.len()
    }

    fn record(&self, key: &str, success: bool, elapsed: Duration, rate_limited: bool) {
        if let Some(m) = self.metrics.lock().get_mut(key) {
            m.record(success, elapsed, rate_limited);
        }
    }

    fn prepare_context(
        &self,
        method: &Method,
        url: &str,
        parsed: &Url,
        key: &str,
        attempt: u32,
        options: &RequestOptions,
    ) -> Result<RequestContext> {
        let mut headers = options.headers.clone();

        // Merge order: caller headers, then domain-remembered headers,
        // then callback/inference, later wins. Credentials are never
        // persisted, so the overlay cannot clobber a caller credential.
        if let Some(host) = parsed.host_str() {
            let saved = self.domain_headers.lock().get(host).cloned();
            if let Some(saved) = saved {
                for (name, value) in &saved {
                    if let (Ok(name), Ok(value)) = (
                        HeaderName::from_bytes(name.as_bytes()),
                        HeaderValue::from_str(value),
                    ) {
                        headers.insert(name, value);
                    }
                }
            }
        }

        if !self.config.user_agents.is_empty() && !headers.contains_key(USER_AGENT) {
            let idx = self.ua_cursor.fetch_add(1, Ordering::Relaxed) % self.config.user_agents.len();
            headers.insert(
                USER_AGENT,
                HeaderValue::from_str(&self.config.user_agents[idx]).map_err(|_| {
                    RotatorError::InvalidConfig("user agent is not a valid header value".to_string())
                })?,
            );
        }

        match &self.header_callback {
            Some(callback) => callback(key, &mut headers),
            None => infer_key_headers(key, &mut headers)?,
        }

        let proxy = if self.config.proxies.is_empty() {
            None
        } else {
            let idx =
                self.proxy_cursor.fetch_add(1, Ordering::Relaxed) % self.config.proxies.len();
            Some(self.config.proxies[idx].clone())
        };

        Ok(RequestContext {
            method: method.clone(),
            url: url.to_string(),
            headers,
            cookies: options.cookies.clone(),
            key: key.to_string(),
            attempt,
            body: options.body.clone(),
            timeout: options.timeout.unwrap_or(self.config.timeout),
            proxy,
        })
    }

    /// Exponential backoff with up to 10% jitter, capped at
    /// `max_backoff`. `attempt` is the number of consumed attempts, so
    /// the first wait equals `base_delay`.
    async fn backoff(&self, attempt: u32) {
        let exp = self.config.base_delay.as_secs_f64()
            * 2f64.powi(attempt.saturating_sub(1).min(31) as i32);
        let jitter = exp * rand::rng().random_range(0.0..0.1);
        let delay = Duration::from_secs_f64(exp + jitter).min(self.config.max_backoff);
        debug!(attempt, delay_ms = delay.as_millis() as u64, "backing off");
        tokio::time::sleep(delay).await;
    }

    /// Fold standard rate-limit headers of a successful response into
    /// the key's metrics.
    fn absorb_rate_limit_headers(&self, key: &str, headers: &HeaderMap) {
        let remaining = header_u64(headers, "x-ratelimit-remaining");
        let reset = header_u64(headers, "x-ratelimit-reset").and_then(|epoch| {
            let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?;
            let until = Duration::from_secs(epoch).checked_sub(now)?;
            Some(Instant::now() + until)
        });

        if remaining.is_none() && reset.is_none() {
            return;
        }
        if let Some(m) = self.metrics.lock().get_mut(key) {
            if remaining.is_some() {
                m.requests_remaining = remaining;
            }
            if reset.is_some() {
                m.rate_limit_reset = reset;
            }
        }
    }

    /// Remember the non-sensitive headers of the first clean success
    /// per domain so later requests to that domain start from them.
    /// Domains already remembered are left untouched. A store failure
    /// is logged and otherwise ignored.
    async fn persist_domain_headers(&self, parsed: &Url, sent: &HeaderMap) {
        if !self.config.save_domain_headers {
            return;
        }
        let Some(store) = &self.store else {
            return;
        };
        let Some(host) = parsed.host_str() else {
            return;
        };

        let plain: HashMap<String, String> = sent
            .iter()
            .filter(|(name, _)| !UNSAVED_HEADERS.contains(&name.as_str()))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let snapshot = {
            let mut all = self.domain_headers.lock();
            if all.contains_key(host) {
                return;
            }
            all.insert(host.to_string(), plain);
            all.clone()
        };

        if let Err(e) = store.save(&snapshot).await {
            warn!(error = %e, "failed to persist domain headers");
        }
    }
}

/// Attach credential headers inferred from the key's shape: `sk-`/`pk-`
/// prefixes get a bearer token, 32-character keys get `X-API-Key`, and
/// everything else gets `Authorization: Key <key>`. Inference only
/// fills a gap; a credential header the caller already set is kept.
fn infer_key_headers(key: &str, headers: &mut HeaderMap) -> Result<()> {
    if headers.contains_key(AUTHORIZATION) || headers.contains_key("x-api-key") {
        return Ok(());
    }

    let invalid =
        || RotatorError::InvalidArgument("key is not a valid header value".to_string());

    if key.starts_with("sk-") || key.starts_with("pk-") {
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {key}")).map_err(|_| invalid())?,
        );
    } else if key.len() == 32 {
        headers.insert(
            HeaderName::from_static("x-api-key"),
            HeaderValue::from_str(key).map_err(|_| invalid())?,
        );
    } else {
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Key {key}")).map_err(|_| invalid())?,
        );
    }
    Ok(())
}

/// Drop duplicate keys, keeping first-seen (insertion) order.
fn dedup_keys(keys: Vec<String>) -> Vec<String> {
    let mut unique = Vec::with_capacity(keys.len());
    for key in keys {
        if !unique.contains(&key) {
            unique.push(key);
        }
    }
    unique
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

fn mask(key: &str) -> String {
    let prefix: String = key.chars().take(4).collect();
    format!("{prefix}****")
}

/// Builder for [`Rotator`].
#[derive(Default)]
pub struct RotatorBuilder {
    keys: Vec<String>,
    config: RotatorConfig,
    strategy: StrategyKind,
    middlewares: Vec<Arc<dyn Middleware>>,
    transport: Option<Arc<dyn Transport>>,
    provider: Option<Arc<dyn SecretProvider>>,
    store: Option<Arc<dyn ConfigStore>>,
    header_callback: Option<HeaderCallback>,
    should_retry: Option<RetryPredicate>,
}

impl RotatorBuilder {
    /// Explicit key pool. Takes precedence over a secret provider.
    pub fn keys(mut self, keys: Vec<String>) -> Self {
        self.keys = keys;
        self
    }

    /// Rotator configuration.
    pub fn config(mut self, config: RotatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Rotation strategy. Defaults to round-robin.
    pub fn strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = strategy;
        self
    }

    /// Append a middleware. Registration order is execution order for
    /// `before_request`/`after_request` and priority order for
    /// `on_error`.
    pub fn middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    /// Replace the transport. Defaults to the pooled HTTP transport.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Source keys from a provider when no explicit keys are given.
    pub fn provider(mut self, provider: Arc<dyn SecretProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Persist per-domain headers to this store (only used when
    /// `save_domain_headers` is enabled).
    pub fn store(mut self, store: Arc<dyn ConfigStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Custom credential-header callback, replacing shape inference.
    pub fn header_callback(
        mut self,
        callback: impl Fn(&str, &mut HeaderMap) + Send + Sync + 'static,
    ) -> Self {
        self.header_callback = Some(Arc::new(callback));
        self
    }

    /// Predicate forcing retries of otherwise-successful responses.
    pub fn should_retry(
        mut self,
        predicate: impl Fn(&ResponseContext) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.should_retry = Some(Arc::new(predicate));
        self
    }

    /// Build the rotator, fetching keys from the provider if none were
    /// given explicitly and loading stored domain headers if a store is
    /// configured.
    pub async fn build(self) -> Result<Rotator> {
        self.config.validate()?;

        let keys = if !self.keys.is_empty() {
            self.keys.clone()
        } else if let Some(provider) = &self.provider {
            provider.get_keys().await?
        } else {
            Vec::new()
        };

        let domain_headers = match (&self.store, self.config.save_domain_headers) {
            (Some(store), true) => store.load().await?,
            _ => DomainHeaders::new(),
        };

        self.assemble(Some(keys), domain_headers)
    }

    fn assemble(self, keys: Option<Vec<String>>, domain_headers: DomainHeaders) -> Result<Rotator> {
        self.config.validate()?;
        let keys = dedup_keys(keys.unwrap_or(self.keys));
        if keys.is_empty() {
            return Err(RotatorError::NoKeys);
        }

        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new()?),
        };

        let metrics = keys
            .iter()
            .map(|k| (k.clone(), KeyMetrics::new(self.config.failure_threshold)))
            .collect();

        Ok(Rotator {
            pool: Mutex::new(KeyPool {
                strategy: self.strategy.build(),
                kind: self.strategy,
                keys,
            }),
            metrics: Mutex::new(metrics),
            domain_headers: Mutex::new(domain_headers),
            classifier: ErrorClassifier::new(self.config.treat_client_errors_as_permanent),
            pipeline: Pipeline::new(self.middlewares),
            transport,
            provider: self.provider,
            store: self.store,
            header_callback: self.header_callback,
            should_retry: self.should_retry,
            ua_cursor: AtomicUsize::new(0),
            proxy_cursor: AtomicUsize::new(0),
            config: self.config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{CacheConfig, CachingMiddleware};
    use async_trait::async_trait;
    use bytes::Bytes;
    use reqwest::StatusCode;
    use std::collections::VecDeque;

    type Scripted = std::result::Result<(u16, &'static str), crate::error::TransportError>;

    /// Transport replaying a scripted response sequence and recording
    /// every request it receives. Replies 200/empty once the script
    /// runs out.
    struct MockTransport {
        script: Mutex<VecDeque<Scripted>>,
        seen: Mutex<Vec<RequestContext>>,
    }

    impl MockTransport {
        fn new(script: Vec<Scripted>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn seen_keys(&self) -> Vec<String> {
            self.seen.lock().iter().map(|ctx| ctx.key.clone()).collect()
        }

        fn calls(&self) -> usize {
            self.seen.lock().len()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(
            &self,
            ctx: &RequestContext,
        ) -> std::result::Result<ResponseContext, crate::error::TransportError> {
            self.seen.lock().push(ctx.clone());
            let next = self.script.lock().pop_front().unwrap_or(Ok((200, "")));
            let (status, body) = next?;
            Ok(ResponseContext {
                status: StatusCode::from_u16(status).unwrap(),
                headers: HeaderMap::new(),
                body: Bytes::from_static(body.as_bytes()),
                request: ctx.clone(),
            })
        }
    }

    fn fast_config() -> RotatorConfig {
        RotatorConfig {
            base_delay: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            ..Default::default()
        }
    }

    async fn rotator_with(
        keys: &[&str],
        config: RotatorConfig,
        transport: Arc<MockTransport>,
    ) -> Rotator {
        Rotator::builder()
            .keys(keys.iter().map(|k| k.to_string()).collect())
            .config(config)
            .transport(transport)
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_single_key_success() {
        let transport = MockTransport::new(vec![Ok((200, "ok"))]);
        let rotator = rotator_with(&["sk-test"], fast_config(), transport.clone()).await;

        let response = rotator
            .get("http://api.test/data", RequestOptions::new())
            .await
            .unwrap();
        assert_eq!(response.text(), "ok");

        let sent = &transport.seen.lock()[0];
        assert_eq!(sent.headers[AUTHORIZATION], "Bearer sk-test");
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_rotates_to_next_key() {
        let transport = MockTransport::new(vec![Ok((429, "")), Ok((200, "fine"))]);
        let rotator = rotator_with(&["first", "second"], fast_config(), transport.clone()).await;

        let response = rotator
            .get("http://api.test/data", RequestOptions::new())
            .await
            .unwrap();
        assert_eq!(response.text(), "fine");
        assert_eq!(transport.seen_keys(), ["first", "second"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhaustion() {
        let transport = MockTransport::new(vec![Ok((429, "")), Ok((429, ""))]);
        let config = RotatorConfig {
            max_retries: 1,
            ..fast_config()
        };
        let rotator = rotator_with(&["first", "second"], config, transport.clone()).await;

        let err = rotator
            .get("http://api.test/data", RequestOptions::new())
            .await
            .unwrap_err();
        match err {
            RotatorError::AllKeysExhausted { keys, attempts, .. } => {
                assert_eq!(keys, 2);
                assert_eq!(attempts, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_evicts_without_consuming_budget() {
        let transport = MockTransport::new(vec![Ok((401, "")), Ok((200, "good"))]);
        let config = RotatorConfig {
            max_retries: 1,
            ..fast_config()
        };
        let rotator = rotator_with(&["revoked", "valid"], config, transport.clone()).await;

        let response = rotator
            .get("http://api.test/data", RequestOptions::new())
            .await
            .unwrap();
        assert_eq!(response.text(), "good");
        assert_eq!(rotator.key_count(), 1);
        assert_eq!(transport.seen_keys(), ["revoked", "valid"]);
    }

    #[tokio::test]
    async fn test_last_key_evicted_is_exhaustion() {
        let transport = MockTransport::new(vec![Ok((401, ""))]);
        let rotator = rotator_with(&["only"], fast_config(), transport).await;

        let err = rotator
            .get("http://api.test/data", RequestOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RotatorError::AllKeysExhausted { keys: 1, .. }));
        assert_eq!(rotator.key_count(), 0);
    }

    struct Absorb429;

    #[async_trait]
    impl Middleware for Absorb429 {
        async fn on_error(&self, ctx: &ErrorContext<'_>) -> bool {
            ctx.status().is_some_and(|s| s.as_u16() == 429)
        }
    }

    #[tokio::test]
    async fn test_handled_error_consumes_no_budget() {
        let transport = MockTransport::new(vec![Ok((429, "")), Ok((200, "ok"))]);
        let config = RotatorConfig {
            max_retries: 1,
            ..fast_config()
        };
        // Budget is a single attempt; the absorbed 429 must not spend it.
        let rotator = Rotator::builder()
            .keys(vec!["only".to_string()])
            .config(config)
            .middleware(Arc::new(Absorb429))
            .transport(transport.clone())
            .build()
            .await
            .unwrap();

        let response = rotator
            .get("http://api.test/data", RequestOptions::new())
            .await
            .unwrap();
        assert_eq!(response.text(), "ok");
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_transport() {
        let transport = MockTransport::new(vec![Ok((200, "cached body"))]);
        let rotator = Rotator::builder()
            .keys(vec!["sk-test".to_string()])
            .config(fast_config())
            .middleware(Arc::new(CachingMiddleware::new(CacheConfig::default())))
            .transport(transport.clone())
            .build()
            .await
            .unwrap();

        let first = rotator
            .get("http://api.test/data", RequestOptions::new())
            .await
            .unwrap();
        let second = rotator
            .get("http://api.test/data", RequestOptions::new())
            .await
            .unwrap();

        assert_eq!(first.text(), "cached body");
        assert_eq!(second.text(), "cached body");
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_should_retry_predicate_forces_retry() {
        let transport = MockTransport::new(vec![Ok((200, "again")), Ok((200, "done"))]);
        let rotator = Rotator::builder()
            .keys(vec!["sk-test".to_string()])
            .config(fast_config())
            .should_retry(|response| response.text() == "again")
            .transport(transport.clone())
            .build()
            .await
            .unwrap();

        let response = rotator
            .get("http://api.test/data", RequestOptions::new())
            .await
            .unwrap();
        assert_eq!(response.text(), "done");
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_retries_then_succeeds() {
        let transport = MockTransport::new(vec![
            Err(crate::error::TransportError::Connect("refused".into())),
            Ok((200, "up")),
        ]);
        let rotator = rotator_with(&["first", "second"], fast_config(), transport.clone()).await;

        let response = rotator
            .get("http://api.test/data", RequestOptions::new())
            .await
            .unwrap();
        assert_eq!(response.text(), "up");
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_invalid_urls_rejected() {
        let transport = MockTransport::new(vec![]);
        let rotator = rotator_with(&["sk-test"], fast_config(), transport.clone()).await;

        assert!(matches!(
            rotator.get("", RequestOptions::new()).await,
            Err(RotatorError::InvalidArgument(_))
        ));
        assert!(matches!(
            rotator.get("not a url", RequestOptions::new()).await,
            Err(RotatorError::InvalidArgument(_))
        ));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_custom_header_callback_replaces_inference() {
        let transport = MockTransport::new(vec![Ok((200, ""))]);
        let rotator = Rotator::builder()
            .keys(vec!["sk-test".to_string()])
            .config(fast_config())
            .header_callback(|key, headers| {
                headers.insert(
                    HeaderName::from_static("x-custom-auth"),
                    HeaderValue::from_str(key).unwrap(),
                );
            })
            .transport(transport.clone())
            .build()
            .await
            .unwrap();

        rotator
            .get("http://api.test/data", RequestOptions::new())
            .await
            .unwrap();

        let sent = &transport.seen.lock()[0];
        assert_eq!(sent.headers["x-custom-auth"], "sk-test");
        assert!(sent.headers.get(AUTHORIZATION).is_none());
    }

    #[tokio::test]
    async fn test_caller_authorization_survives_inference() {
        let transport = MockTransport::new(vec![Ok((200, ""))]);
        let rotator = rotator_with(&["plain-token"], fast_config(), transport.clone()).await;

        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_static("Bearer caller-supplied"),
        );
        rotator
            .get("http://api.test/data", RequestOptions::new().headers(headers))
            .await
            .unwrap();

        let sent = &transport.seen.lock()[0];
        assert_eq!(sent.headers[AUTHORIZATION], "Bearer caller-supplied");
    }

    #[tokio::test]
    async fn test_caller_api_key_header_survives_inference() {
        let transport = MockTransport::new(vec![Ok((200, ""))]);
        let rotator = rotator_with(&["plain-token"], fast_config(), transport.clone()).await;

        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("x-api-key"),
            HeaderValue::from_static("caller-key"),
        );
        rotator
            .get("http://api.test/data", RequestOptions::new().headers(headers))
            .await
            .unwrap();

        let sent = &transport.seen.lock()[0];
        assert_eq!(sent.headers["x-api-key"], "caller-key");
        assert!(sent.headers.get(AUTHORIZATION).is_none());
    }

    #[tokio::test]
    async fn test_caller_user_agent_not_rotated_over() {
        let transport = MockTransport::new(vec![Ok((200, ""))]);
        let config = RotatorConfig {
            user_agents: vec!["rotated/1.0".to_string()],
            ..fast_config()
        };
        let rotator = rotator_with(&["sk-test"], config, transport.clone()).await;

        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("mine/2.0"));
        rotator
            .get("http://api.test/data", RequestOptions::new().headers(headers))
            .await
            .unwrap();

        let sent = &transport.seen.lock()[0];
        assert_eq!(sent.headers[USER_AGENT], "mine/2.0");
    }

    struct RecordingStore {
        initial: DomainHeaders,
        saves: AtomicUsize,
    }

    #[async_trait]
    impl ConfigStore for RecordingStore {
        async fn load(&self) -> Result<DomainHeaders> {
            Ok(self.initial.clone())
        }

        async fn save(&self, _headers: &DomainHeaders) -> Result<()> {
            self.saves.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_domain_headers_saved_on_first_success_only() {
        let store = Arc::new(RecordingStore {
            initial: DomainHeaders::new(),
            saves: AtomicUsize::new(0),
        });
        let transport = MockTransport::new(vec![]);
        let rotator = Rotator::builder()
            .keys(vec!["sk-test".to_string()])
            .config(RotatorConfig {
                save_domain_headers: true,
                ..fast_config()
            })
            .store(store.clone())
            .transport(transport)
            .build()
            .await
            .unwrap();

        rotator
            .get("http://api.test/a", RequestOptions::new())
            .await
            .unwrap();
        rotator
            .get("http://api.test/b", RequestOptions::new())
            .await
            .unwrap();
        assert_eq!(store.saves.load(Ordering::Relaxed), 1);

        // A new domain gets its own first-success save.
        rotator
            .get("http://other.test/a", RequestOptions::new())
            .await
            .unwrap();
        assert_eq!(store.saves.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_saved_domain_headers_override_caller_headers() {
        let mut initial = DomainHeaders::new();
        initial.insert(
            "api.test".to_string(),
            HashMap::from([("accept".to_string(), "application/json".to_string())]),
        );
        let store = Arc::new(RecordingStore {
            initial,
            saves: AtomicUsize::new(0),
        });
        let transport = MockTransport::new(vec![Ok((200, ""))]);
        let rotator = Rotator::builder()
            .keys(vec!["sk-test".to_string()])
            .config(RotatorConfig {
                save_domain_headers: true,
                ..fast_config()
            })
            .store(store)
            .transport(transport.clone())
            .build()
            .await
            .unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_static("text/plain"),
        );
        rotator
            .get("http://api.test/data", RequestOptions::new().headers(headers))
            .await
            .unwrap();

        let sent = &transport.seen.lock()[0];
        assert_eq!(sent.headers[reqwest::header::ACCEPT], "application/json");
    }

    #[test]
    fn test_mask_survives_multibyte_keys() {
        assert_eq!(mask("ab€cdef"), "ab€c****");
        assert_eq!(mask("ab"), "ab****");
    }

    struct StaticProvider(Vec<String>);

    #[async_trait]
    impl SecretProvider for StaticProvider {
        async fn get_keys(&self) -> Result<Vec<String>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_refresh_keys_replaces_pool() {
        let transport = MockTransport::new(vec![]);
        let rotator = Rotator::builder()
            .keys(vec!["stale".to_string()])
            .config(fast_config())
            .provider(Arc::new(StaticProvider(vec![
                "fresh-1".to_string(),
                "fresh-2".to_string(),
            ])))
            .transport(transport)
            .build()
            .await
            .unwrap();

        assert_eq!(rotator.refresh_keys().await.unwrap(), 2);
        assert_eq!(rotator.key_count(), 2);

        let stats = rotator.key_statistics();
        assert!(stats.contains_key("fresh-1"));
        assert!(!stats.contains_key("stale"));
    }

    #[tokio::test]
    async fn test_reset_key_health() {
        let transport = MockTransport::new(vec![]);
        let rotator = rotator_with(&["sk-test"], fast_config(), transport).await;
        assert!(rotator.reset_key_health("sk-test"));
        assert!(!rotator.reset_key_health("absent"));
    }

    #[tokio::test]
    async fn test_duplicate_keys_collapsed() {
        let transport = MockTransport::new(vec![]);
        let rotator = rotator_with(&["sk-a", "sk-b", "sk-a"], fast_config(), transport).await;
        assert_eq!(rotator.key_count(), 2);
    }

    #[test]
    fn test_no_keys_rejected_at_build() {
        assert!(matches!(
            Rotator::new(Vec::new()),
            Err(RotatorError::NoKeys)
        ));
    }

    #[test]
    fn test_key_header_inference() {
        let mut headers = HeaderMap::new();
        infer_key_headers("sk-secret", &mut headers).unwrap();
        assert_eq!(headers[AUTHORIZATION], "Bearer sk-secret");

        let mut headers = HeaderMap::new();
        infer_key_headers("pk-public", &mut headers).unwrap();
        assert_eq!(headers[AUTHORIZATION], "Bearer pk-public");

        let mut headers = HeaderMap::new();
        let hex32 = "0123456789abcdef0123456789abcdef";
        infer_key_headers(hex32, &mut headers).unwrap();
        assert_eq!(headers["x-api-key"], hex32);
        assert!(headers.get(AUTHORIZATION).is_none());

        let mut headers = HeaderMap::new();
        infer_key_headers("plain-token", &mut headers).unwrap();
        assert_eq!(headers[AUTHORIZATION], "Key plain-token");
    }
}
