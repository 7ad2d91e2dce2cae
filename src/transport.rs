//! HTTP transport abstraction.
//!
//! The rotator drives a [`Transport`], not reqwest directly, so tests
//! can script responses and alternative transports can be dropped in.
//! [`HttpTransport`] is the production implementation with connection
//! pooling tuned for high request volume.

use crate::context::{RequestBody, RequestContext, ResponseContext};
use crate::error::TransportError;
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::header::{HeaderValue, COOKIE};
use reqwest::{Client, Proxy};
use std::collections::HashMap;
use std::time::Duration;
use tracing::trace;

/// Sends one prepared request and returns the raw response.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform the request described by `ctx`. Timeouts are reported
    /// as [`TransportError::Timeout`] so the classifier maps them to
    /// network-class failures.
    async fn send(&self, ctx: &RequestContext) -> Result<ResponseContext, TransportError>;
}

/// reqwest-backed transport with connection pooling.
///
/// Proxy selection is per attempt: since reqwest fixes proxies at
/// client construction, a small client table is built lazily, one
/// client per distinct proxy URL.
pub struct HttpTransport {
    client: Client,
    proxy_clients: Mutex<HashMap<String, Client>>,
}

impl HttpTransport {
    /// Build the transport with the default pool tuning.
    pub fn new() -> Result<Self, TransportError> {
        Ok(Self {
            client: Self::build_client(None)?,
            proxy_clients: Mutex::new(HashMap::new()),
        })
    }

    fn build_client(proxy: Option<&str>) -> Result<Client, TransportError> {
        let mut builder = Client::builder()
            .pool_max_idle_per_host(50)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .tcp_nodelay(true)
            .gzip(true)
            .brotli(true);

        if let Some(proxy) = proxy {
            builder = builder.proxy(Proxy::all(proxy).map_err(TransportError::from)?);
        }

        builder.build().map_err(TransportError::from)
    }

    fn client_for(&self, proxy: Option<&str>) -> Result<Client, TransportError> {
        let Some(proxy) = proxy else {
            return Ok(self.client.clone());
        };

        let mut clients = self.proxy_clients.lock();
        if let Some(client) = clients.get(proxy) {
            return Ok(client.clone());
        }
        let client = Self::build_client(Some(proxy))?;
        clients.insert(proxy.to_string(), client.clone());
        Ok(client)
    }

    fn cookie_header(cookies: &HashMap<String, String>) -> Option<HeaderValue> {
        if cookies.is_empty() {
            return None;
        }
        let joined = cookies
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ");
        HeaderValue::from_str(&joined).ok()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, ctx: &RequestContext) -> Result<ResponseContext, TransportError> {
        let client = self.client_for(ctx.proxy.as_deref())?;

        let mut request = client
            .request(ctx.method.clone(), &ctx.url)
            .headers(ctx.headers.clone())
            .timeout(ctx.timeout);

        if let Some(cookie) = Self::cookie_header(&ctx.cookies) {
            request = request.header(COOKIE, cookie);
        }

        request = match &ctx.body {
            Some(RequestBody::Json(value)) => request.json(value),
            Some(RequestBody::Text(text)) => request.body(text.clone()),
            Some(RequestBody::Bytes(bytes)) => request.body(bytes.clone()),
            None => request,
        };

        trace!(method = %ctx.method, url = %ctx.url, "sending request");
        let response = request.send().await.map_err(TransportError::from)?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(TransportError::from)?;

        Ok(ResponseContext {
            status,
            headers,
            body,
            request: ctx.clone(),
        })
    }
}
