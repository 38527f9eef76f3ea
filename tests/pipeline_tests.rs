use anyhow::Result;
use std::sync::Arc;

use relevance_harvest::aggregator::{ResultAggregator, load_batch};
use relevance_harvest::config::RunSettings;
use relevance_harvest::data_models::{
    EvaluationOutcome, Relevance, ScoringMode, SearchCandidate, Verdict,
};
use relevance_harvest::extractor::ReadableExtractor;
use relevance_harvest::headers::RoundRobinHeaderProfiles;
use relevance_harvest::pipeline::{Components, HarvestPipeline};
use relevance_harvest::proxy::ProxyRegistry;
use relevance_harvest::sink::load_urls;

mod test_helpers {
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::time::Duration;

    use relevance_harvest::data_models::ProxyEndpoint;
    use relevance_harvest::error::{NavigationError, PageError, ScoringError, SearchError};
    use relevance_harvest::fetcher::{IsolatedContextFactory, PageContext};
    use relevance_harvest::headers::HeaderSet;
    use relevance_harvest::scoring::{ScoringClient, ScoringRequest};
    use relevance_harvest::search::{RawSearchResult, SearchProvider};

    pub struct OnePageProvider(pub Vec<(&'static str, &'static str)>);

    #[async_trait]
    impl SearchProvider for OnePageProvider {
        async fn fetch_results_page(
            &self,
            _query: &str,
            _page_size: usize,
            offset: usize,
        ) -> Result<Vec<RawSearchResult>, SearchError> {
            if offset > 0 {
                return Ok(Vec::new());
            }
            Ok(self
                .0
                .iter()
                .map(|(title, url)| RawSearchResult {
                    title: Some(title.to_string()),
                    url: url.to_string(),
                })
                .collect())
        }
    }

    pub struct StaticSites(pub HashMap<&'static str, &'static str>);

    #[async_trait]
    impl IsolatedContextFactory for StaticSites {
        async fn create(
            &self,
            _proxy: Option<&ProxyEndpoint>,
            _headers: &HeaderSet,
        ) -> Result<Box<dyn PageContext>, NavigationError> {
            Ok(Box::new(StaticPage {
                sites: self.0.clone(),
                html: None,
            }))
        }
    }

    struct StaticPage {
        sites: HashMap<&'static str, &'static str>,
        html: Option<String>,
    }

    #[async_trait]
    impl PageContext for StaticPage {
        async fn navigate(&mut self, url: &str, _timeout: Duration) -> Result<(), NavigationError> {
            let html = self.sites.get(url).ok_or_else(|| NavigationError::Failed {
                url: url.to_string(),
                reason: "no such site".into(),
            })?;
            self.html = Some(html.to_string());
            Ok(())
        }

        async fn content(&mut self) -> Result<String, PageError> {
            self.html
                .clone()
                .ok_or_else(|| PageError::Content("not loaded".into()))
        }

        async fn snapshot(&mut self, _max_width: u32, _max_height: u32) -> Result<Vec<u8>, PageError> {
            Ok(vec![0x89, b'P', b'N', b'G'])
        }

        async fn close(self: Box<Self>) -> Result<(), PageError> {
            Ok(())
        }
    }

    /// Keyed by body text; image-only requests get `image_only`.
    pub struct TableScorer {
        pub by_text: HashMap<&'static str, &'static str>,
        pub image_only: &'static str,
    }

    #[async_trait]
    impl ScoringClient for TableScorer {
        async fn score(&self, request: ScoringRequest) -> Result<String, ScoringError> {
            match request.body_text.as_deref() {
                Some(text) => self
                    .by_text
                    .get(text)
                    .map(|t| t.to_string())
                    .ok_or_else(|| ScoringError::Malformed(format!("unexpected text {text:?}"))),
                None => Ok(self.image_only.to_string()),
            }
        }
    }
}

use test_helpers::*;

fn scenario_components() -> Components {
    Components {
        search: Arc::new(OnePageProvider(vec![
            ("Alpha", "https://a.example/"),
            ("Beta", "https://b.example/"),
            ("Blank", "https://blank.example/"),
        ])),
        contexts: Arc::new(StaticSites(
            [
                ("https://a.example/", "<article><p>alpha</p></article>"),
                ("https://b.example/", "<article><p>beta</p></article>"),
                ("https://blank.example/", "<html><body></body></html>"),
            ]
            .into_iter()
            .collect(),
        )),
        extractor: Arc::new(ReadableExtractor),
        scorer: Arc::new(TableScorer {
            by_text: [("alpha", "5"), ("beta", "1")].into_iter().collect(),
            image_only: "Relevance: high",
        }),
        proxies: Arc::new(ProxyRegistry::disabled()),
        headers: Arc::new(RoundRobinHeaderProfiles::new(vec!["stub-agent".into()])),
        sink: None,
    }
}

fn scenario_settings(output_dir: &std::path::Path) -> RunSettings {
    let mut settings = RunSettings::new("test");
    settings.target = 3;
    settings.concurrency = 2;
    settings.mode = ScoringMode::TextAndImage;
    settings.output_dir = output_dir.to_path_buf();
    settings
}

fn relevance_of(outcomes: &[EvaluationOutcome], url: &str) -> Relevance {
    outcomes
        .iter()
        .find(|o| o.url() == url)
        .map(|o| o.relevance.clone())
        .unwrap_or_else(|| panic!("no outcome for {url}"))
}

#[tokio::test]
async fn end_to_end_run_persists_scored_batch() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let summary = HarvestPipeline::new(scenario_settings(dir.path()), scenario_components())
        .run()
        .await?;

    assert_eq!(summary.dequeued, 3);
    assert_eq!(summary.evaluated, 3);
    assert_eq!(summary.unknown, 1);
    assert_eq!(summary.threshold, Verdict::Score(5));
    assert_eq!(summary.relevant_urls, vec!["https://a.example/".to_string()]);
    assert!(!summary.cancelled);

    let batch = load_batch(&summary.batch_path).await?;
    assert_eq!(batch.query, "test");
    assert_eq!(batch.run_id, summary.run_id);
    assert_eq!(batch.total(), 3);
    assert_eq!(
        relevance_of(&batch.outcomes, "https://a.example/"),
        Relevance::Verdict(Verdict::Score(5))
    );
    assert_eq!(
        relevance_of(&batch.outcomes, "https://b.example/"),
        Relevance::Verdict(Verdict::Score(1))
    );
    assert_eq!(relevance_of(&batch.outcomes, "https://blank.example/"), Relevance::Unknown);
    assert_eq!(batch.matching_urls(&Verdict::Score(5)).len(), 1);

    let relevant = load_urls(&summary.relevant_path).await?;
    assert_eq!(relevant, vec!["https://a.example/".to_string()]);
    Ok(())
}

#[tokio::test]
async fn batch_file_uses_the_wire_format() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let aggregator = ResultAggregator::new("Astera Labs Q2 Earnings 2024", dir.path().join("nested"));
    let batch = aggregator.aggregate(vec![
        EvaluationOutcome::scored(
            SearchCandidate::new("Q2 results", "https://ir.example/q2"),
            Verdict::Score(4),
        ),
        EvaluationOutcome::unknown(
            SearchCandidate::new("Paywalled", "https://paywall.example/"),
            Some("scoring transport error: timeout".into()),
        ),
    ]);

    let path = aggregator.persist(&batch).await?;
    assert!(path.starts_with(dir.path().join("nested")));
    let name = path.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.ends_with("Z.json"));
    assert!(!name.contains(':'));

    let raw: serde_json::Value = serde_json::from_slice(&tokio::fs::read(&path).await?)?;
    assert_eq!(raw["query"], "Astera Labs Q2 Earnings 2024");
    assert!(raw["runId"].is_string());
    assert!(raw["generatedAt"].is_string());
    assert_eq!(raw["outcomes"][0]["title"], "Q2 results");
    assert_eq!(raw["outcomes"][0]["relevance"], "4");
    assert!(raw["outcomes"][0].get("error").is_none());
    assert_eq!(raw["outcomes"][1]["relevance"], "UNKNOWN");
    assert_eq!(raw["outcomes"][1]["error"], "scoring transport error: timeout");

    // No temporary file is left behind.
    let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("nested"))?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty());
    Ok(())
}

#[tokio::test]
async fn empty_runs_still_write_a_batch() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut components = scenario_components();
    components.search = Arc::new(OnePageProvider(vec![]));

    let summary = HarvestPipeline::new(scenario_settings(dir.path()), components)
        .run()
        .await?;

    assert_eq!(summary.evaluated, 0);
    let batch = load_batch(&summary.batch_path).await?;
    assert!(batch.outcomes.is_empty());
    Ok(())
}

#[tokio::test]
async fn categorical_scale_threshold_uses_the_first_label() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut components = scenario_components();
    components.scorer = Arc::new(TableScorer {
        by_text: [("alpha", "High"), ("beta", "low")].into_iter().collect(),
        image_only: "medium",
    });
    let mut settings = scenario_settings(dir.path());
    settings.scale = "high,medium,low".parse()?;

    let summary = HarvestPipeline::new(settings, components).run().await?;

    assert_eq!(summary.threshold, Verdict::Label("high".into()));
    assert_eq!(summary.relevant_urls, vec!["https://a.example/".to_string()]);
    assert_eq!(summary.unknown, 0);
    Ok(())
}
