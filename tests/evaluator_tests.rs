use anyhow::Result;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use relevance_harvest::data_models::{
    ProxyEndpoint, ProxyProtocol, Relevance, ScoringMode, Verdict,
};
use relevance_harvest::evaluator::PoolReport;
use relevance_harvest::proxy::ProxyRegistry;

mod test_helpers {
    use async_trait::async_trait;
    use futures::stream;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use relevance_harvest::data_models::{ProxyEndpoint, ScoringMode, SearchCandidate, VerdictScale};
    use relevance_harvest::error::{NavigationError, PageError, ScoringError};
    use relevance_harvest::evaluator::{EvaluationWorkerPool, EvaluatorSettings, PoolReport};
    use relevance_harvest::extractor::ReadableExtractor;
    use relevance_harvest::fetcher::{IsolatedContextFactory, PageContext};
    use relevance_harvest::headers::{HeaderSet, RoundRobinHeaderProfiles};
    use relevance_harvest::proxy::ProxyRegistry;
    use relevance_harvest::scoring::{InstructionTemplate, ScoringClient, ScoringRequest};
    use tokio_util::sync::CancellationToken;

    #[derive(Clone)]
    pub enum Site {
        Html(&'static str),
        Slow(Duration, &'static str),
        Unreachable,
        Hang,
    }

    /// Counts open contexts; `peak` is the most ever open at once.
    #[derive(Default)]
    pub struct Gauge {
        pub open: AtomicUsize,
        pub peak: AtomicUsize,
        pub created: AtomicUsize,
        pub closed: AtomicUsize,
        pub visits: Mutex<Vec<(String, Option<String>)>>,
    }

    impl Gauge {
        pub fn sorted_visits(&self) -> Vec<(String, Option<String>)> {
            let mut visits = self.visits.lock().unwrap().clone();
            visits.sort();
            visits
        }
    }

    pub struct StubContexts {
        pub sites: Arc<HashMap<String, Site>>,
        pub gauge: Arc<Gauge>,
    }

    impl StubContexts {
        pub fn new(sites: Vec<(&str, Site)>) -> Self {
            Self {
                sites: Arc::new(sites.into_iter().map(|(u, s)| (u.to_string(), s)).collect()),
                gauge: Arc::new(Gauge::default()),
            }
        }
    }

    #[async_trait]
    impl IsolatedContextFactory for StubContexts {
        async fn create(
            &self,
            proxy: Option<&ProxyEndpoint>,
            _headers: &HeaderSet,
        ) -> Result<Box<dyn PageContext>, NavigationError> {
            let now = self.gauge.open.fetch_add(1, Ordering::SeqCst) + 1;
            self.gauge.peak.fetch_max(now, Ordering::SeqCst);
            self.gauge.created.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(StubPage {
                sites: self.sites.clone(),
                gauge: self.gauge.clone(),
                proxy: proxy.map(|p| p.to_string()),
                html: None,
            }))
        }
    }

    struct StubPage {
        sites: Arc<HashMap<String, Site>>,
        gauge: Arc<Gauge>,
        proxy: Option<String>,
        html: Option<String>,
    }

    #[async_trait]
    impl PageContext for StubPage {
        async fn navigate(&mut self, url: &str, _timeout: Duration) -> Result<(), NavigationError> {
            self.gauge
                .visits
                .lock()
                .unwrap()
                .push((url.to_string(), self.proxy.clone()));
            let failed = || NavigationError::Failed {
                url: url.to_string(),
                reason: "connection refused".into(),
            };
            match self.sites.get(url).cloned() {
                Some(Site::Html(html)) => self.html = Some(html.to_string()),
                Some(Site::Slow(delay, html)) => {
                    tokio::time::sleep(delay).await;
                    self.html = Some(html.to_string());
                }
                Some(Site::Hang) => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    return Err(failed());
                }
                Some(Site::Unreachable) | None => return Err(failed()),
            }
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
            self.gauge.open.fetch_sub(1, Ordering::SeqCst);
            self.gauge.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Clone, Copy)]
    pub enum Answer {
        Token(&'static str),
        Fail,
    }

    /// Answers by the extracted body text; `otherwise` covers image-only requests.
    pub struct StubScorer {
        answers: HashMap<&'static str, Answer>,
        otherwise: Answer,
        pub requests: Mutex<Vec<ScoringRequest>>,
    }

    impl StubScorer {
        pub fn new(answers: Vec<(&'static str, Answer)>, otherwise: Answer) -> Self {
            Self {
                answers: answers.into_iter().collect(),
                otherwise,
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ScoringClient for StubScorer {
        async fn score(&self, request: ScoringRequest) -> Result<String, ScoringError> {
            let answer = request
                .body_text
                .as_deref()
                .and_then(|text| self.answers.get(text).copied())
                .unwrap_or(self.otherwise);
            self.requests.lock().unwrap().push(request);
            match answer {
                Answer::Token(token) => Ok(token.to_string()),
                Answer::Fail => Err(ScoringError::Transport("connection reset".into())),
            }
        }
    }

    pub fn candidates(urls: &[&str]) -> Vec<SearchCandidate> {
        urls.iter()
            .enumerate()
            .map(|(i, url)| SearchCandidate::new(format!("Result {i}"), *url))
            .collect()
    }

    pub struct PoolBuilder {
        pub mode: ScoringMode,
        pub timeout: Duration,
        pub proxies: ProxyRegistry,
        pub cancel: CancellationToken,
    }

    impl Default for PoolBuilder {
        fn default() -> Self {
            Self {
                mode: ScoringMode::TextOnly,
                timeout: Duration::from_secs(5),
                proxies: ProxyRegistry::disabled(),
                cancel: CancellationToken::new(),
            }
        }
    }

    impl PoolBuilder {
        pub async fn run(
            self,
            contexts: &StubContexts,
            scorer: Arc<StubScorer>,
            candidates: Vec<SearchCandidate>,
            limit: usize,
        ) -> PoolReport {
            let contexts = Arc::new(StubContexts {
                sites: contexts.sites.clone(),
                gauge: contexts.gauge.clone(),
            });
            let pool = EvaluationWorkerPool::new(
                contexts,
                Arc::new(ReadableExtractor),
                scorer,
                Arc::new(self.proxies),
                Arc::new(RoundRobinHeaderProfiles::new(vec!["stub-agent".into()])),
                InstructionTemplate::new("test", VerdictScale::default()),
                EvaluatorSettings {
                    navigation_timeout: self.timeout,
                    scoring_mode: self.mode,
                    ..Default::default()
                },
            )
            .with_cancellation(self.cancel);
            Arc::new(pool).evaluate(stream::iter(candidates), limit).await
        }
    }
}

use test_helpers::*;

fn verdict_of<'a>(report: &'a PoolReport, url: &str) -> Option<&'a Relevance> {
    report
        .outcomes
        .iter()
        .find(|o| o.url() == url)
        .map(|o| &o.relevance)
}

#[tokio::test]
async fn in_flight_tasks_never_exceed_the_limit() -> Result<()> {
    let urls: Vec<String> = (0..9).map(|i| format!("https://slow.example/{i}")).collect();
    let contexts = StubContexts::new(
        urls.iter()
            .map(|u| (u.as_str(), Site::Slow(Duration::from_millis(40), "<p>alpha</p>")))
            .collect(),
    );
    let scorer = Arc::new(StubScorer::new(vec![], Answer::Token("3")));
    let url_refs: Vec<&str> = urls.iter().map(String::as_str).collect();

    let report = PoolBuilder::default()
        .run(&contexts, scorer, candidates(&url_refs), 3)
        .await;

    let gauge = &contexts.gauge;
    assert_eq!(report.outcomes.len(), 9);
    assert!(gauge.peak.load(Ordering::SeqCst) <= 3);
    assert!(gauge.peak.load(Ordering::SeqCst) >= 2);
    assert_eq!(gauge.open.load(Ordering::SeqCst), 0);
    assert_eq!(gauge.created.load(Ordering::SeqCst), gauge.closed.load(Ordering::SeqCst));
    Ok(())
}

#[tokio::test]
async fn unreachable_pages_produce_no_outcome() -> Result<()> {
    let contexts = StubContexts::new(vec![
        ("https://ok.example/", Site::Html("<p>alpha</p>")),
        ("https://down.example/", Site::Unreachable),
        ("https://hang.example/", Site::Hang),
    ]);
    let scorer = Arc::new(StubScorer::new(vec![("alpha", Answer::Token("4"))], Answer::Fail));

    let report = PoolBuilder {
        timeout: Duration::from_millis(50),
        ..Default::default()
    }
    .run(
        &contexts,
        scorer,
        candidates(&["https://ok.example/", "https://down.example/", "https://hang.example/"]),
        3,
    )
    .await;

    assert_eq!(report.outcomes.len(), 1);
    assert_eq!(report.outcomes[0].url(), "https://ok.example/");
    let dropped: HashSet<_> = report.dropped.iter().map(String::as_str).collect();
    assert_eq!(dropped, HashSet::from(["https://down.example/", "https://hang.example/"]));
    // Contexts are closed even when navigation fails.
    assert_eq!(contexts.gauge.closed.load(Ordering::SeqCst), 3);
    Ok(())
}

#[tokio::test]
async fn malformed_tokens_and_scorer_failures_become_unknown() -> Result<()> {
    let contexts = StubContexts::new(vec![
        ("https://a.example/", Site::Html("<p>alpha</p>")),
        ("https://b.example/", Site::Html("<p>beta</p>")),
        ("https://c.example/", Site::Html("<p>gamma</p>")),
    ]);
    let scorer = Arc::new(StubScorer::new(
        vec![
            ("alpha", Answer::Token("5")),
            ("beta", Answer::Token("I'd say 4 out of 5")),
            ("gamma", Answer::Fail),
        ],
        Answer::Fail,
    ));

    let report = PoolBuilder::default()
        .run(
            &contexts,
            scorer,
            candidates(&["https://a.example/", "https://b.example/", "https://c.example/"]),
            2,
        )
        .await;

    assert_eq!(report.outcomes.len(), 3);
    assert_eq!(
        verdict_of(&report, "https://a.example/"),
        Some(&Relevance::Verdict(Verdict::Score(5)))
    );
    for url in ["https://b.example/", "https://c.example/"] {
        let outcome = report.outcomes.iter().find(|o| o.url() == url).unwrap();
        assert!(outcome.relevance.is_unknown(), "{url} should be UNKNOWN");
        assert!(outcome.error.as_deref().is_some_and(|e| !e.is_empty()));
    }
    let malformed = report
        .outcomes
        .iter()
        .find(|o| o.url() == "https://b.example/")
        .and_then(|o| o.error.clone())
        .unwrap();
    assert!(malformed.contains("malformed verdict"));
    Ok(())
}

#[tokio::test]
async fn text_mode_skips_scoring_when_nothing_was_extracted() -> Result<()> {
    let contexts = StubContexts::new(vec![(
        "https://empty.example/",
        Site::Html("<html><body><script>app()</script></body></html>"),
    )]);
    let scorer = Arc::new(StubScorer::new(vec![], Answer::Token("5")));

    let report = PoolBuilder::default()
        .run(&contexts, scorer.clone(), candidates(&["https://empty.example/"]), 1)
        .await;

    assert_eq!(report.outcomes.len(), 1);
    assert!(report.outcomes[0].relevance.is_unknown());
    assert_eq!(report.outcomes[0].error, None);
    assert_eq!(scorer.calls(), 0);
    Ok(())
}

#[tokio::test]
async fn image_modes_attach_a_snapshot() -> Result<()> {
    let contexts = StubContexts::new(vec![
        ("https://a.example/", Site::Html("<p>alpha</p>")),
        ("https://blank.example/", Site::Html("<html></html>")),
    ]);
    let scorer = Arc::new(StubScorer::new(vec![("alpha", Answer::Token("2"))], Answer::Token("1")));

    let report = PoolBuilder {
        mode: ScoringMode::TextAndImage,
        ..Default::default()
    }
    .run(
        &contexts,
        scorer.clone(),
        candidates(&["https://a.example/", "https://blank.example/"]),
        1,
    )
    .await;

    assert_eq!(report.outcomes.len(), 2);
    let requests = scorer.requests.lock().unwrap();
    assert_eq!(requests.len(), 2);
    assert!(requests.iter().all(|r| r.image.is_some()));
    // The blank page falls back to image-only scoring.
    let image_only = requests.iter().find(|r| r.body_text.is_none()).unwrap();
    assert!(image_only.instruction.contains("screenshot"));
    assert!(!image_only.instruction.contains("extracted text"));
    assert_eq!(
        verdict_of(&report, "https://blank.example/"),
        Some(&Relevance::Verdict(Verdict::Score(1)))
    );
    Ok(())
}

#[tokio::test]
async fn outcomes_come_from_dequeued_candidates_once_each() -> Result<()> {
    let contexts = StubContexts::new(vec![
        ("https://a.example/", Site::Html("<p>alpha</p>")),
        ("https://b.example/", Site::Html("<p>beta</p>")),
    ]);
    let scorer = Arc::new(StubScorer::new(vec![], Answer::Token("3")));

    let report = PoolBuilder::default()
        .run(
            &contexts,
            scorer,
            candidates(&["https://a.example/", "https://b.example/", "https://a.example/"]),
            2,
        )
        .await;

    assert_eq!(report.dequeued.len(), 2);
    assert!(report.outcomes.len() <= report.dequeued.len());
    let dequeued: HashSet<&str> = report.dequeued.iter().map(|c| c.url.as_str()).collect();
    assert!(report.outcomes.iter().all(|o| dequeued.contains(o.url())));
    assert_eq!(contexts.gauge.created.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test]
async fn same_inputs_and_seed_give_the_same_outcomes() -> Result<()> {
    let sites = || {
        vec![
            ("https://a.example/", Site::Html("<p>alpha</p>")),
            ("https://b.example/", Site::Html("<p>beta</p>")),
            ("https://c.example/", Site::Unreachable),
            ("https://d.example/", Site::Html("<p>delta</p>")),
        ]
    };
    let endpoints = vec![
        ProxyEndpoint::new(ProxyProtocol::Socks5, "10.0.0.1", 1080),
        ProxyEndpoint::new(ProxyProtocol::Http, "10.0.0.2", 8080),
        ProxyEndpoint::new(ProxyProtocol::Https, "10.0.0.3", 8443),
    ];
    let urls = [
        "https://a.example/",
        "https://b.example/",
        "https://c.example/",
        "https://d.example/",
    ];

    let mut runs = Vec::new();
    for _ in 0..2 {
        let contexts = StubContexts::new(sites());
        let scorer = Arc::new(StubScorer::new(
            vec![("alpha", Answer::Token("5")), ("beta", Answer::Token("nope"))],
            Answer::Token("2"),
        ));
        let mut report = PoolBuilder {
            proxies: ProxyRegistry::new(endpoints.clone(), true)?.with_seed(7),
            ..Default::default()
        }
        .run(&contexts, scorer, candidates(&urls), 3)
        .await;
        report.outcomes.sort_by(|a, b| a.url().cmp(b.url()));
        runs.push((report.outcomes, contexts.gauge.sorted_visits()));
    }

    assert_eq!(runs[0].0, runs[1].0);
    assert_eq!(runs[0].1, runs[1].1);
    assert!(runs[0].1.iter().all(|(_, proxy)| proxy.is_some()));
    Ok(())
}

#[tokio::test]
async fn cancelled_runs_admit_nothing_new() -> Result<()> {
    let contexts = StubContexts::new(vec![("https://a.example/", Site::Html("<p>alpha</p>"))]);
    let scorer = Arc::new(StubScorer::new(vec![], Answer::Token("5")));
    let builder = PoolBuilder::default();
    builder.cancel.cancel();

    let report = builder
        .run(&contexts, scorer.clone(), candidates(&["https://a.example/"]), 2)
        .await;

    assert!(report.dequeued.is_empty());
    assert!(report.outcomes.is_empty());
    assert_eq!(scorer.calls(), 0);
    Ok(())
}
