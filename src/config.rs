use dotenvy::dotenv;
use once_cell::sync::Lazy;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::data_models::{ScoringMode, Verdict, VerdictScale};
use crate::error::ConfigurationError;
use crate::scoring::{ANTHROPIC_MESSAGES_URL, DEFAULT_MODEL};

pub static CONFIG: Lazy<Config> = Lazy::new(|| {
    dotenv().ok(); // Load .env file if present
    Config::from_env()
});

#[derive(Debug, Clone)]
pub struct Config {
    pub anthropic_api_key: Option<String>,
    pub anthropic_model: String,
    pub anthropic_api_url: String,
    pub output_dir: PathBuf,
    pub proxy_list: Option<PathBuf>,
    pub sink_url: Option<String>,
    pub chrome_ws_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Config {
        Config {
            anthropic_api_key: get_env_opt("ANTHROPIC_API_KEY"),
            anthropic_model: get_env_or_default("ANTHROPIC_MODEL", DEFAULT_MODEL),
            anthropic_api_url: get_env_or_default("ANTHROPIC_API_URL", ANTHROPIC_MESSAGES_URL),
            output_dir: get_env_or_default("HARVEST_OUTPUT_DIR", "results").into(),
            proxy_list: get_env_opt("HARVEST_PROXY_LIST").map(PathBuf::from),
            sink_url: get_env_opt("HARVEST_SINK_URL"),
            chrome_ws_url: get_env_opt("CHROME_WS_URL"),
        }
    }

    pub fn require_api_key(&self) -> Result<&str, ConfigurationError> {
        self.anthropic_api_key
            .as_deref()
            .ok_or_else(|| ConfigurationError::MissingEnv("ANTHROPIC_API_KEY".to_string()))
    }
}

fn get_env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn get_env_or_default(key: &str, default: &str) -> String {
    get_env_opt(key).unwrap_or_else(|| default.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum FetcherKind {
    #[default]
    Http,
    Browser,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ExtractorKind {
    #[default]
    Readable,
    Plain,
}

/// Parameters of one harvest-and-evaluate run.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub query: String,
    pub per_page: usize,
    pub target: usize,
    pub concurrency: usize,
    pub navigation_timeout: Duration,
    pub mode: ScoringMode,
    pub scale: VerdictScale,
    pub threshold: Option<String>,
    pub use_proxies: bool,
    pub proxy_seed: Option<u64>,
    pub fetcher: FetcherKind,
    pub extractor: ExtractorKind,
    pub publish: bool,
    pub output_dir: PathBuf,
    pub page_delay: Duration,
    pub max_text_chars: usize,
}

impl RunSettings {
    pub fn new(query: impl Into<String>) -> RunSettings {
        RunSettings {
            query: query.into(),
            per_page: 10,
            target: 10,
            concurrency: 4,
            navigation_timeout: Duration::from_millis(20_000),
            mode: ScoringMode::default(),
            scale: VerdictScale::default(),
            threshold: None,
            use_proxies: false,
            proxy_seed: None,
            fetcher: FetcherKind::default(),
            extractor: ExtractorKind::default(),
            publish: false,
            output_dir: PathBuf::from("results"),
            page_delay: Duration::ZERO,
            max_text_chars: 100_000,
        }
    }

    /// The verdict a result must equal to count as relevant.
    pub fn threshold_verdict(&self) -> Result<Verdict, ConfigurationError> {
        match &self.threshold {
            None => Ok(self.scale.top()),
            Some(raw) => self.scale.parse(raw).ok_or_else(|| {
                ConfigurationError::invalid(
                    "threshold",
                    format!("{raw:?} is not on the scale ({})", self.scale.describe()),
                )
            }),
        }
    }

    pub fn validate(&self, config: &Config) -> Result<(), ConfigurationError> {
        if self.query.trim().is_empty() {
            return Err(ConfigurationError::invalid("query", "must not be empty"));
        }
        if self.per_page == 0 {
            return Err(ConfigurationError::invalid("per-page", "must be at least 1"));
        }
        if self.target == 0 {
            return Err(ConfigurationError::invalid("target", "must be at least 1"));
        }
        if self.concurrency == 0 {
            return Err(ConfigurationError::invalid("concurrency", "must be at least 1"));
        }
        if self.navigation_timeout.is_zero() {
            return Err(ConfigurationError::invalid("timeout-ms", "must be positive"));
        }
        if self.mode.uses_text() && self.max_text_chars == 0 {
            return Err(ConfigurationError::invalid("max-text-chars", "must be at least 1"));
        }
        self.threshold_verdict()?;
        config.require_api_key()?;
        if self.fetcher == FetcherKind::Browser && !cfg!(feature = "browser") {
            return Err(ConfigurationError::BrowserUnavailable);
        }
        if self.publish && config.sink_url.is_none() {
            return Err(ConfigurationError::MissingEnv("HARVEST_SINK_URL".to_string()));
        }
        Ok(())
    }
}
