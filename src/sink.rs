use std::collections::HashSet;
use std::path::Path;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{PersistError, SinkError};

static NO_FETCH_DOMAINS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "www.linkedin.com",
        "www.threads.net",
        "www.documentcloud.org",
        "www.woot.com",
        "www.facebook.com",
        "x.com",
        "nodejs.org",
        "rstyle.me",
        "www.thrillist.com",
        "zdcs.link",
        "news.ycombinator.com",
        "www.msn.com",
        "ycharts.com",
        "docs.github.com",
        "stockcharts.com",
        "web.archive.org",
        "twitter.com",
        "bscscan.com",
        "substackcdn.com",
        "orcid.org",
        "www.ncbi.nlm.nih.gov",
        "doi.org",
        "www.slashgear.com",
        "www.mdpi.com",
        "www.youtube.com",
        "cooking.nytimes.com",
        "www.instagram.com",
        "www.producthunt.com",
        "www.tiktok.com",
        "scholar.google.com",
        "www.google.com",
        "www.amazon.com",
        "amazon.com",
        "www.amazon.co.uk",
        "amzn.to",
        "www.reddit.com",
        "reddit.com",
        "www.stackoverflow.com",
        "stackoverflow.com",
        "apps.apple.com",
        "docs.google.com",
        "etherscan.io",
        "store.steampowered.com",
        "t.me",
        "www.etsy.com",
        "www.pinterest.com",
        "www.ebay.com",
        "pypi.org",
        "github.com",
        "www.news18.com",
        "knowyourmeme.com",
        "t.co",
        "www.goodreads.com",
        "www.barnesandnoble.com",
        "en.wiktionary.org",
    ]
    .into_iter()
    .collect()
});

const NO_INDEX_PREFIXES: &[&str] = &[
    "https://support.",
    "https://docs.",
    "https://www.dailymail.co.uk/tvshowbiz",
    "https://www.foxnews.com/video/",
    "https://www.dailymail.co.uk/femail/",
    "https://www.dailymail.co.uk/sport/",
    "https://www.dailymail.co.uk/video/",
    "https://www.cnbc.com/quotes/",
    "https://apnews.com/hub/",
    "https://www.nytimes.com/by/",
    "https://www.wsj.com/coupons/",
    "https://www.wsj.com/livecoverage/",
    "https://www.reuters.com/markets/companies/",
    "https://www.wsj.com/news/",
    "https://www.youtube.com/channel",
    "https://www.coindesk.com/price/",
    "https://en.wikipedia.org/wiki/User_talk:",
    "https://en.wikipedia.org/wiki/User:",
];

const NO_FETCH_PATH_PREFIXES: &[&str] = &[
    "/register",
    "/login",
    "/signin",
    "/chat",
    "/signup",
    "/subscribe",
    "/join",
    "/donate",
    "/tag/",
    "/tags/",
    "/category/",
    "/categories/",
];

const NO_FETCH_EXTENSIONS: &[&str] = &[".gz", ".mp4", ".tgz", ".pkg", ".zip", ".tar", ".xz"];

/// Whether the downstream writer should be handed this URL at all.
/// Unparseable URLs are never worth fetching.
pub fn should_fetch(url: &str) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    let host = parsed.host_str().unwrap_or_default().to_lowercase();
    if NO_FETCH_DOMAINS.contains(host.as_str()) {
        return false;
    }
    if NO_INDEX_PREFIXES.iter().any(|prefix| url.starts_with(prefix)) {
        return false;
    }
    let path = parsed.path();
    if NO_FETCH_PATH_PREFIXES.iter().any(|prefix| path.starts_with(prefix)) {
        return false;
    }
    !NO_FETCH_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

#[derive(Serialize)]
struct PublishRequest<'a> {
    urls: &'a [String],
}

/// Posts relevant URLs to a story-writing endpoint.
pub struct UrlSink {
    endpoint: String,
    client: reqwest::Client,
}

impl UrlSink {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Filters with [`should_fetch`] first; returns the response body.
    pub async fn publish(&self, urls: &[String]) -> Result<serde_json::Value, SinkError> {
        let urls: Vec<String> = urls.iter().filter(|u| should_fetch(u)).cloned().collect();
        log::info!("publishing {} urls to {}", urls.len(), self.endpoint);

        let response = self
            .client
            .post(&self.endpoint)
            .json(&PublishRequest { urls: &urls })
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        let body = response.text().await?;
        Ok(serde_json::from_str(&body).unwrap_or(serde_json::Value::String(body)))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum UrlEntry {
    Plain(String),
    Item { url: String },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum UrlFile {
    List(Vec<UrlEntry>),
    Batch { outcomes: Vec<UrlEntry> },
}

/// Reads URLs from a saved file: a list of strings, a list of objects with
/// a `url` field, or a whole result batch.
pub async fn load_urls(path: &Path) -> Result<Vec<String>, PersistError> {
    let raw = tokio::fs::read(path).await.map_err(|source| PersistError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let entries = match serde_json::from_slice::<UrlFile>(&raw)? {
        UrlFile::List(entries) => entries,
        UrlFile::Batch { outcomes } => outcomes,
    };
    Ok(entries
        .into_iter()
        .map(|entry| match entry {
            UrlEntry::Plain(url) | UrlEntry::Item { url } => url,
        })
        .collect())
}
