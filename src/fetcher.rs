use std::time::Duration;

use async_trait::async_trait;

use crate::data_models::ProxyEndpoint;
use crate::error::{NavigationError, PageError};
use crate::headers::HeaderSet;

/// Produces page contexts that share no cookies or state with each other.
#[async_trait]
pub trait IsolatedContextFactory: Send + Sync {
    async fn create(
        &self,
        proxy: Option<&ProxyEndpoint>,
        headers: &HeaderSet,
    ) -> Result<Box<dyn PageContext>, NavigationError>;
}

/// One open page. The evaluator always calls `close`, whatever happened before.
#[async_trait]
pub trait PageContext: Send {
    /// Resolves once the document is ready, not when every resource loaded.
    async fn navigate(&mut self, url: &str, timeout: Duration) -> Result<(), NavigationError>;

    async fn content(&mut self) -> Result<String, PageError>;

    /// PNG of the page, each side clamped to the given maximum.
    async fn snapshot(&mut self, max_width: u32, max_height: u32) -> Result<Vec<u8>, PageError>;

    async fn close(self: Box<Self>) -> Result<(), PageError>;
}

/// One side of a snapshot clip: at least one pixel, at most `max` (treated as 1 when 0).
pub fn clamp_snapshot_side(measured: f64, max: u32) -> f64 {
    let measured = if measured.is_finite() { measured } else { 1.0 };
    measured.min(f64::from(max.max(1))).max(1.0)
}

/// Plain HTTP contexts: a fresh client (own cookie jar, own proxy) per context.
pub struct HttpContextFactory {
    accept_invalid_certs_via_proxy: bool,
}

impl HttpContextFactory {
    pub fn new() -> Self {
        Self {
            accept_invalid_certs_via_proxy: true,
        }
    }

    pub fn strict_tls(mut self) -> Self {
        self.accept_invalid_certs_via_proxy = false;
        self
    }
}

impl Default for HttpContextFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IsolatedContextFactory for HttpContextFactory {
    async fn create(
        &self,
        proxy: Option<&ProxyEndpoint>,
        headers: &HeaderSet,
    ) -> Result<Box<dyn PageContext>, NavigationError> {
        let mut builder = reqwest::Client::builder()
            .default_headers(headers.to_header_map())
            .cookie_store(true);

        if let Some(proxy) = proxy {
            let proxy = reqwest::Proxy::all(proxy.url())
                .map_err(|e| NavigationError::Context(format!("invalid proxy {proxy}: {e}")))?;
            builder = builder.proxy(proxy);
            // Public proxies routinely break certificate chains.
            if self.accept_invalid_certs_via_proxy {
                builder = builder.danger_accept_invalid_certs(true);
            }
        }

        let client = builder
            .build()
            .map_err(|e| NavigationError::Context(e.to_string()))?;
        Ok(Box::new(HttpPage { client, body: None }))
    }
}

struct HttpPage {
    client: reqwest::Client,
    body: Option<String>,
}

#[async_trait]
impl PageContext for HttpPage {
    async fn navigate(&mut self, url: &str, timeout: Duration) -> Result<(), NavigationError> {
        let failed = |e: reqwest::Error| {
            if e.is_timeout() {
                NavigationError::Timeout {
                    url: url.to_string(),
                    after_ms: timeout.as_millis() as u64,
                }
            } else {
                NavigationError::Failed {
                    url: url.to_string(),
                    reason: e.to_string(),
                }
            }
        };

        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(failed)?;
        if !response.status().is_success() {
            log::debug!("{url} answered {}", response.status());
        }
        let body = response.text().await.map_err(failed)?;
        self.body = Some(body);
        Ok(())
    }

    async fn content(&mut self) -> Result<String, PageError> {
        self.body
            .clone()
            .ok_or_else(|| PageError::Content("page was never loaded".to_string()))
    }

    async fn snapshot(&mut self, _max_width: u32, _max_height: u32) -> Result<Vec<u8>, PageError> {
        Err(PageError::SnapshotUnsupported("http"))
    }

    async fn close(self: Box<Self>) -> Result<(), PageError> {
        Ok(())
    }
}
