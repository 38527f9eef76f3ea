//! Headless Chromium page contexts.
//!
//! Proxied tasks get their own browser context (separate cookie jar and
//! proxy). Unproxied tasks open a page in the default context.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::page::{CaptureScreenshotFormat, Viewport};
use chromiumoxide::cdp::browser_protocol::target::{
    BrowserContextId, CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
};
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use serde::Deserialize;

use crate::data_models::ProxyEndpoint;
use crate::error::{NavigationError, PageError};
use crate::fetcher::{IsolatedContextFactory, PageContext, clamp_snapshot_side};
use crate::headers::HeaderSet;

const PAGE_DIMENSIONS_JS: &str = "({ width: document.documentElement.scrollWidth, height: document.documentElement.scrollHeight })";

pub struct ChromiumContextFactory {
    browser: Arc<Browser>,
}

impl ChromiumContextFactory {
    /// Connects to `ws_url` when given, otherwise launches a local headless Chromium.
    pub async fn start(ws_url: Option<&str>) -> anyhow::Result<Self> {
        let (browser, mut handler) = match ws_url {
            Some(url) => {
                log::info!("connecting to Chromium at {url}");
                Browser::connect(url).await?
            }
            None => {
                let config = BrowserConfig::builder()
                    .no_sandbox()
                    .arg("--disable-gpu")
                    .arg("--disable-dev-shm-usage")
                    .build()
                    .map_err(|e| anyhow::anyhow!(e))?;
                Browser::launch(config).await?
            }
        };

        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            browser: Arc::new(browser),
        })
    }
}

#[async_trait]
impl IsolatedContextFactory for ChromiumContextFactory {
    async fn create(
        &self,
        proxy: Option<&ProxyEndpoint>,
        headers: &HeaderSet,
    ) -> Result<Box<dyn PageContext>, NavigationError> {
        let context_id = match proxy {
            Some(proxy) => {
                let mut params = CreateBrowserContextParams::default();
                params.proxy_server = Some(proxy.url());
                params.dispose_on_detach = Some(true);
                let created = self
                    .browser
                    .execute(params)
                    .await
                    .map_err(|e| NavigationError::Context(e.to_string()))?;
                Some(created.result.browser_context_id)
            }
            None => None,
        };

        let mut target = CreateTargetParams::new("about:blank");
        target.browser_context_id = context_id.clone();
        let page = match self.browser.new_page(target).await {
            Ok(page) => page,
            Err(e) => {
                dispose(&self.browser, context_id).await;
                return Err(NavigationError::Context(e.to_string()));
            }
        };

        if let Err(e) = page.set_user_agent(headers.user_agent.as_str()).await {
            log::debug!("could not set user agent: {e}");
        }

        Ok(Box::new(ChromiumPage {
            browser: self.browser.clone(),
            page,
            context_id,
        }))
    }
}

async fn dispose(browser: &Browser, context_id: Option<BrowserContextId>) {
    if let Some(id) = context_id {
        if let Err(e) = browser.execute(DisposeBrowserContextParams::new(id)).await {
            log::warn!("failed to dispose browser context: {e}");
        }
    }
}

#[derive(Deserialize)]
struct PageDimensions {
    width: f64,
    height: f64,
}

struct ChromiumPage {
    browser: Arc<Browser>,
    page: Page,
    context_id: Option<BrowserContextId>,
}

#[async_trait]
impl PageContext for ChromiumPage {
    async fn navigate(&mut self, url: &str, timeout: Duration) -> Result<(), NavigationError> {
        match tokio::time::timeout(timeout, self.page.goto(url)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(NavigationError::Failed {
                url: url.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(NavigationError::Timeout {
                url: url.to_string(),
                after_ms: timeout.as_millis() as u64,
            }),
        }
    }

    async fn content(&mut self) -> Result<String, PageError> {
        self.page
            .content()
            .await
            .map_err(|e| PageError::Content(e.to_string()))
    }

    async fn snapshot(&mut self, max_width: u32, max_height: u32) -> Result<Vec<u8>, PageError> {
        let dims: PageDimensions = self
            .page
            .evaluate(PAGE_DIMENSIONS_JS)
            .await
            .map_err(|e| PageError::Snapshot(e.to_string()))?
            .into_value()
            .map_err(|e| PageError::Snapshot(e.to_string()))?;

        let clip = Viewport {
            x: 0.0,
            y: 0.0,
            width: clamp_snapshot_side(dims.width, max_width),
            height: clamp_snapshot_side(dims.height, max_height),
            scale: 1.0,
        };
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .clip(clip)
            .capture_beyond_viewport(true)
            .build();

        self.page
            .screenshot(params)
            .await
            .map_err(|e| PageError::Snapshot(e.to_string()))
    }

    async fn close(self: Box<Self>) -> Result<(), PageError> {
        let ChromiumPage {
            browser,
            page,
            context_id,
        } = *self;
        let closed = page.close().await.map_err(|e| PageError::Close(e.to_string()));
        dispose(&browser, context_id).await;
        closed
    }
}
