use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use scraper::{Html, Selector};
use url::Url;

use crate::data_models::SearchCandidate;
use crate::error::SearchError;
use crate::headers::HeaderProfileProvider;

const GOOGLE_BASE_URL: &str = "https://www.google.com";

/// One raw row from a results page. Rows without a title are not genuine results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSearchResult {
    pub title: Option<String>,
    pub url: String,
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn fetch_results_page(
        &self,
        query: &str,
        page_size: usize,
        offset: usize,
    ) -> Result<Vec<RawSearchResult>, SearchError>;
}

/// Scrapes Google's HTML results page.
pub struct GoogleSearchProvider {
    client: reqwest::Client,
    base_url: String,
    headers: Arc<dyn HeaderProfileProvider>,
}

impl GoogleSearchProvider {
    pub fn new(headers: Arc<dyn HeaderProfileProvider>) -> Result<Self, SearchError> {
        Self::with_base_url(GOOGLE_BASE_URL, headers)
    }

    pub fn with_base_url(
        base_url: &str,
        headers: Arc<dyn HeaderProfileProvider>,
    ) -> Result<Self, SearchError> {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| SearchError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            headers,
        })
    }

    /// Every `<a>` on the page, titled by its `<h3>` when it has one.
    pub fn parse_results(html: &str) -> Result<Vec<RawSearchResult>, SearchError> {
        let document = Html::parse_document(html);
        let anchor_selector =
            Selector::parse("a").map_err(|e| SearchError::Parse(format!("{e:?}")))?;
        let heading_selector =
            Selector::parse("h3").map_err(|e| SearchError::Parse(format!("{e:?}")))?;

        let mut results = Vec::new();
        for anchor in document.select(&anchor_selector) {
            let Some(href) = anchor.value().attr("href") else {
                continue;
            };
            let Some(url) = resolve_result_url(href) else {
                continue;
            };
            let title = anchor
                .select(&heading_selector)
                .next()
                .map(|h| normalize_title(&h.text().collect::<String>()))
                .filter(|t| !t.is_empty());
            results.push(RawSearchResult { title, url });
        }
        Ok(results)
    }
}

#[async_trait]
impl SearchProvider for GoogleSearchProvider {
    async fn fetch_results_page(
        &self,
        query: &str,
        page_size: usize,
        offset: usize,
    ) -> Result<Vec<RawSearchResult>, SearchError> {
        let response = self
            .client
            .get(format!("{}/search", self.base_url))
            .query(&[
                ("q", query.to_string()),
                ("num", page_size.to_string()),
                ("start", offset.to_string()),
            ])
            .headers(self.headers.next().to_header_map())
            .send()
            .await
            .map_err(|e| SearchError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SearchError::Status(response.status().as_u16()));
        }

        let html = response
            .text()
            .await
            .map_err(|e| SearchError::Transport(e.to_string()))?;
        Self::parse_results(&html)
    }
}

fn normalize_title(raw: &str) -> String {
    raw.trim().replace(['\r', '\n'], " ")
}

/// Unwraps `/url?q=` redirects; keeps only absolute http(s) links off Google itself.
fn resolve_result_url(href: &str) -> Option<String> {
    let base = Url::parse(GOOGLE_BASE_URL).ok()?;
    let parsed = base.join(href).ok()?;

    let target = if parsed.path() == "/url" && is_google_host(&parsed) {
        let inner = parsed
            .query_pairs()
            .find(|(k, _)| k == "q" || k == "url")
            .map(|(_, v)| v.into_owned())?;
        Url::parse(&inner).ok()?
    } else {
        parsed
    };

    if target.scheme() != "http" && target.scheme() != "https" {
        return None;
    }
    if is_google_host(&target) {
        return None;
    }
    Some(target.to_string())
}

fn is_google_host(url: &Url) -> bool {
    url.host_str()
        .map(|h| h == "google.com" || h.ends_with(".google.com"))
        .unwrap_or(false)
}

/// Pagination bookkeeping, owned by a single harvester and never shared.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HarvestState {
    /// Raw result pages requested so far.
    pub page: usize,
    /// Position inside the current page.
    pub page_cursor: usize,
    pub total_dequeued: usize,
}

/// Walks result pages lazily until `total_target` candidates are handed out
/// or a page brings nothing new.
pub struct PaginationHarvester {
    provider: Arc<dyn SearchProvider>,
    query: String,
    results_per_page: usize,
    total_target: usize,
    page_delay: Duration,
    state: HarvestState,
    current_page: VecDeque<SearchCandidate>,
    seen_urls: HashSet<String>,
    exhausted: bool,
}

impl PaginationHarvester {
    pub fn new(
        provider: Arc<dyn SearchProvider>,
        query: impl Into<String>,
        results_per_page: usize,
        total_target: usize,
    ) -> Self {
        Self {
            provider,
            query: query.into(),
            results_per_page: results_per_page.max(1),
            total_target,
            page_delay: Duration::ZERO,
            state: HarvestState::default(),
            current_page: VecDeque::new(),
            seen_urls: HashSet::new(),
            exhausted: false,
        }
    }

    /// Pause between consecutive results-page requests.
    pub fn with_page_delay(mut self, delay: Duration) -> Self {
        self.page_delay = delay;
        self
    }

    pub fn state(&self) -> &HarvestState {
        &self.state
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub async fn next_candidate(&mut self) -> Option<SearchCandidate> {
        if self.state.total_dequeued >= self.total_target || self.exhausted {
            return None;
        }

        if self.current_page.is_empty() && !self.load_next_page().await {
            self.exhausted = true;
            log::warn!(
                "harvest ended early after {} page(s): {} of {} candidates for {:?}",
                self.state.page,
                self.state.total_dequeued,
                self.total_target,
                self.query
            );
            return None;
        }

        let candidate = self.current_page.pop_front()?;
        self.state.page_cursor += 1;
        self.state.total_dequeued += 1;
        Some(candidate)
    }

    /// Returns false when the page brought zero new candidates.
    async fn load_next_page(&mut self) -> bool {
        if self.state.page > 0 && !self.page_delay.is_zero() {
            tokio::time::sleep(self.page_delay).await;
        }

        let offset = self.state.page * self.results_per_page;
        self.state.page += 1;
        self.state.page_cursor = 0;
        log::info!(
            "requesting results page {} (offset {offset}) for {:?}",
            self.state.page,
            self.query
        );

        let rows = match self
            .provider
            .fetch_results_page(&self.query, self.results_per_page, offset)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                log::error!("results page {} failed: {:#}", self.state.page, e);
                return false;
            }
        };

        let raw_count = rows.len();
        for row in rows {
            let Some(title) = row.title.filter(|t| !t.trim().is_empty()) else {
                continue;
            };
            if !self.seen_urls.insert(row.url.clone()) {
                continue;
            }
            self.current_page
                .push_back(SearchCandidate::new(title, row.url));
        }

        log::debug!(
            "results page {}: {} rows, {} new candidates",
            self.state.page,
            raw_count,
            self.current_page.len()
        );
        !self.current_page.is_empty()
    }

    /// Lazy candidate sequence. Each call to `harvest` starts again from page 1.
    pub fn into_stream(self) -> impl Stream<Item = SearchCandidate> + Send {
        futures::stream::unfold(self, |mut harvester| async move {
            harvester
                .next_candidate()
                .await
                .map(|candidate| (candidate, harvester))
        })
    }
}

/// Convenience entry point matching `harvest(query, resultsPerPage, totalTarget)`.
pub fn harvest(
    provider: Arc<dyn SearchProvider>,
    query: &str,
    results_per_page: usize,
    total_target: usize,
) -> impl Stream<Item = SearchCandidate> + Send {
    PaginationHarvester::new(provider, query, results_per_page, total_target).into_stream()
}
