use std::path::PathBuf;

use thiserror::Error;

/// Fatal problems detected before any evaluation task starts.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("proxying is enabled but the validated proxy pool is empty")]
    NoValidatedProxies,

    #[error("missing required environment variable: {0}")]
    MissingEnv(String),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },

    #[error("failed to load proxy list from {path}: {reason}")]
    ProxyList { path: PathBuf, reason: String },

    #[error("the browser fetcher requires building with the `browser` feature")]
    BrowserUnavailable,
}

impl ConfigurationError {
    pub fn invalid(key: &str, reason: impl Into<String>) -> Self {
        ConfigurationError::Invalid {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

/// The page could not be reached. The candidate is dropped from the batch.
#[derive(Debug, Error)]
pub enum NavigationError {
    #[error("navigation to {url} timed out after {after_ms}ms")]
    Timeout { url: String, after_ms: u64 },

    #[error("navigation to {url} failed: {reason}")]
    Failed { url: String, reason: String },

    #[error("could not open a page context: {0}")]
    Context(String),
}

/// Failures after the page was reached.
#[derive(Debug, Error)]
pub enum PageError {
    #[error("reading page content failed: {0}")]
    Content(String),

    #[error("capturing snapshot failed: {0}")]
    Snapshot(String),

    #[error("snapshots are not supported by the {0} fetcher")]
    SnapshotUnsupported(&'static str),

    #[error("closing page context failed: {0}")]
    Close(String),
}

#[derive(Debug, Error)]
pub enum ScoringError {
    #[error("scoring transport error: {0}")]
    Transport(String),

    #[error("scoring service returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("malformed scoring payload: {0}")]
    Malformed(String),

    #[error("scoring request has neither text nor image")]
    EmptyRequest,
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("search request failed: {0}")]
    Transport(String),

    #[error("search provider returned status {0}")]
    Status(u16),

    #[error("could not parse search results: {0}")]
    Parse(String),
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("i/o error writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not serialize batch: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("sink returned {status}: {body}")]
    Rejected { status: u16, body: String },
}
