//! One harvest-and-evaluate run, from query to persisted batch.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use crate::aggregator::ResultAggregator;
use crate::config::{Config, ExtractorKind, FetcherKind, RunSettings};
use crate::data_models::Verdict;
use crate::evaluator::{EvaluationWorkerPool, EvaluatorSettings};
use crate::extractor::{ContentExtractor, PlainTextExtractor, ReadableExtractor};
use crate::fetcher::{HttpContextFactory, IsolatedContextFactory};
use crate::headers::{HeaderProfileProvider, RandomHeaderProfiles};
use crate::proxy::ProxyRegistry;
use crate::scoring::{AnthropicConfig, AnthropicScorer, InstructionTemplate, ScoringClient};
use crate::search::{GoogleSearchProvider, PaginationHarvester, SearchProvider};
use crate::sink::UrlSink;

/// The swappable collaborators of a run.
pub struct Components {
    pub search: Arc<dyn SearchProvider>,
    pub contexts: Arc<dyn IsolatedContextFactory>,
    pub extractor: Arc<dyn ContentExtractor>,
    pub scorer: Arc<dyn ScoringClient>,
    pub proxies: Arc<ProxyRegistry>,
    pub headers: Arc<dyn HeaderProfileProvider>,
    pub sink: Option<UrlSink>,
}

impl Components {
    /// Production wiring: Google, Anthropic and the configured fetcher.
    pub async fn from_config(settings: &RunSettings, config: &Config) -> anyhow::Result<Components> {
        let headers: Arc<dyn HeaderProfileProvider> = Arc::new(RandomHeaderProfiles::new());

        let endpoints = match (&config.proxy_list, settings.use_proxies) {
            (Some(path), true) => ProxyRegistry::load(path)?,
            _ => Vec::new(),
        };
        let mut proxies = ProxyRegistry::new(endpoints, settings.use_proxies)?;
        if let Some(seed) = settings.proxy_seed {
            proxies = proxies.with_seed(seed);
        }
        if proxies.is_enabled() {
            log::info!("proxying through {} validated endpoints", proxies.len());
        }

        let mut anthropic = AnthropicConfig::new(config.require_api_key()?);
        anthropic.endpoint = config.anthropic_api_url.clone();
        anthropic.model = config.anthropic_model.clone();
        let scorer = AnthropicScorer::new(anthropic).context("building scoring client")?;

        let search = GoogleSearchProvider::new(headers.clone()).context("building search client")?;

        let extractor: Arc<dyn ContentExtractor> = match settings.extractor {
            ExtractorKind::Readable => Arc::new(ReadableExtractor),
            ExtractorKind::Plain => Arc::new(PlainTextExtractor::default()),
        };

        let contexts = build_contexts(settings.fetcher, config).await?;

        let sink = if settings.publish {
            config.sink_url.as_deref().map(UrlSink::new)
        } else {
            None
        };

        Ok(Components {
            search: Arc::new(search),
            contexts,
            extractor,
            scorer: Arc::new(scorer),
            proxies: Arc::new(proxies),
            headers,
            sink,
        })
    }
}

#[cfg(feature = "browser")]
async fn build_contexts(kind: FetcherKind, config: &Config) -> anyhow::Result<Arc<dyn IsolatedContextFactory>> {
    match kind {
        FetcherKind::Http => Ok(Arc::new(HttpContextFactory::new())),
        FetcherKind::Browser => {
            let factory =
                crate::browser::ChromiumContextFactory::start(config.chrome_ws_url.as_deref()).await?;
            Ok(Arc::new(factory))
        }
    }
}

#[cfg(not(feature = "browser"))]
async fn build_contexts(kind: FetcherKind, _config: &Config) -> anyhow::Result<Arc<dyn IsolatedContextFactory>> {
    match kind {
        FetcherKind::Http => Ok(Arc::new(HttpContextFactory::new())),
        FetcherKind::Browser => Err(crate::error::ConfigurationError::BrowserUnavailable.into()),
    }
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: String,
    pub batch_path: PathBuf,
    pub relevant_path: PathBuf,
    pub dequeued: usize,
    pub evaluated: usize,
    pub dropped: usize,
    pub unknown: usize,
    pub threshold: Verdict,
    pub relevant_urls: Vec<String>,
    pub published: bool,
    pub cancelled: bool,
}

pub struct HarvestPipeline {
    settings: RunSettings,
    components: Components,
    cancel: CancellationToken,
}

impl HarvestPipeline {
    pub fn new(settings: RunSettings, components: Components) -> HarvestPipeline {
        HarvestPipeline {
            settings,
            components,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> HarvestPipeline {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(self) -> anyhow::Result<RunSummary> {
        let HarvestPipeline {
            settings,
            components,
            cancel,
        } = self;
        let threshold = settings.threshold_verdict()?;

        log::info!(
            "harvesting {} candidates for {:?} ({} per page, {} workers, {:?} mode)",
            settings.target,
            settings.query,
            settings.per_page,
            settings.concurrency,
            settings.mode
        );

        let candidates = PaginationHarvester::new(
            components.search.clone(),
            settings.query.as_str(),
            settings.per_page,
            settings.target,
        )
        .with_page_delay(settings.page_delay)
        .into_stream();

        let pool = Arc::new(
            EvaluationWorkerPool::new(
                components.contexts.clone(),
                components.extractor.clone(),
                components.scorer.clone(),
                components.proxies.clone(),
                components.headers.clone(),
                InstructionTemplate::new(settings.query.as_str(), settings.scale.clone()),
                EvaluatorSettings {
                    navigation_timeout: settings.navigation_timeout,
                    scoring_mode: settings.mode,
                    max_text_chars: settings.max_text_chars,
                    ..Default::default()
                },
            )
            .with_cancellation(cancel.clone()),
        );
        let report = pool.evaluate(candidates, settings.concurrency).await;

        let aggregator = ResultAggregator::new(settings.query.as_str(), settings.output_dir.clone());
        let batch = aggregator.aggregate(report.outcomes);
        let batch_path = aggregator
            .persist(&batch)
            .await
            .context("persisting result batch")?;
        let relevant_path = aggregator
            .persist_relevant(&batch, &threshold)
            .await
            .context("persisting relevant urls")?;
        let relevant_urls = batch.matching_urls(&threshold);

        let mut published = false;
        if let Some(sink) = &components.sink {
            if cancel.is_cancelled() {
                log::warn!("run was cancelled; not publishing");
            } else {
                match sink.publish(&relevant_urls).await {
                    Ok(response) => {
                        published = true;
                        log::info!("sink accepted urls: {response}");
                    }
                    Err(e) => log::error!("publishing relevant urls failed: {e}"),
                }
            }
        }

        let summary = RunSummary {
            run_id: batch.run_id.clone(),
            batch_path,
            relevant_path,
            dequeued: report.dequeued.len(),
            evaluated: batch.total(),
            dropped: report.dropped.len(),
            unknown: batch.unknown_count(),
            threshold,
            relevant_urls,
            published,
            cancelled: cancel.is_cancelled(),
        };
        log::info!(
            "run {}: {} dequeued, {} evaluated, {} unknown, {} dropped, {} at {}; batch at {}",
            summary.run_id,
            summary.dequeued,
            summary.evaluated,
            summary.unknown,
            summary.dropped,
            summary.relevant_urls.len(),
            summary.threshold,
            summary.batch_path.display()
        );
        Ok(summary)
    }
}
