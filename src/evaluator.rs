use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::data_models::{EvaluationOutcome, EvaluationTask, ScoringMode, SearchCandidate};
use crate::error::NavigationError;
use crate::extractor::ContentExtractor;
use crate::fetcher::{IsolatedContextFactory, PageContext};
use crate::headers::HeaderProfileProvider;
use crate::proxy::ProxyRegistry;
use crate::scoring::{ImageAttachment, InstructionTemplate, ScoringClient, ScoringRequest};

pub const DEFAULT_NAVIGATION_TIMEOUT: Duration = Duration::from_millis(20_000);
pub const DEFAULT_SNAPSHOT_MAX_SIDE: u32 = 4000;
pub const DEFAULT_MAX_TEXT_CHARS: usize = 100_000;

#[derive(Debug, Clone)]
pub struct EvaluatorSettings {
    pub navigation_timeout: Duration,
    pub scoring_mode: ScoringMode,
    pub snapshot_max_width: u32,
    pub snapshot_max_height: u32,
    pub max_text_chars: usize,
}

impl Default for EvaluatorSettings {
    fn default() -> Self {
        Self {
            navigation_timeout: DEFAULT_NAVIGATION_TIMEOUT,
            scoring_mode: ScoringMode::default(),
            snapshot_max_width: DEFAULT_SNAPSHOT_MAX_SIDE,
            snapshot_max_height: DEFAULT_SNAPSHOT_MAX_SIDE,
            max_text_chars: DEFAULT_MAX_TEXT_CHARS,
        }
    }
}

/// What one `evaluate` call produced.
#[derive(Debug, Default)]
pub struct PoolReport {
    /// In settlement order.
    pub outcomes: Vec<EvaluationOutcome>,
    /// Every candidate handed to a worker, in admission order.
    pub dequeued: Vec<SearchCandidate>,
    /// URLs that settled without an outcome (never reached, or skipped on cancellation).
    pub dropped: Vec<String>,
}

enum Settled {
    Outcome(EvaluationOutcome),
    Dropped(String),
}

/// Fixed-width pool: one producer feeds a bounded task queue, `limit`
/// workers drain it, and each worker runs at most one task at a time.
pub struct EvaluationWorkerPool {
    contexts: Arc<dyn IsolatedContextFactory>,
    extractor: Arc<dyn ContentExtractor>,
    scorer: Arc<dyn ScoringClient>,
    proxies: Arc<ProxyRegistry>,
    headers: Arc<dyn HeaderProfileProvider>,
    template: InstructionTemplate,
    settings: EvaluatorSettings,
    cancel: CancellationToken,
}

impl EvaluationWorkerPool {
    pub fn new(
        contexts: Arc<dyn IsolatedContextFactory>,
        extractor: Arc<dyn ContentExtractor>,
        scorer: Arc<dyn ScoringClient>,
        proxies: Arc<ProxyRegistry>,
        headers: Arc<dyn HeaderProfileProvider>,
        template: InstructionTemplate,
        settings: EvaluatorSettings,
    ) -> EvaluationWorkerPool {
        EvaluationWorkerPool {
            contexts,
            extractor,
            scorer,
            proxies,
            headers,
            template,
            settings,
            cancel: CancellationToken::new(),
        }
    }

    /// Cancelling the token stops admission; tasks already running still settle.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> EvaluationWorkerPool {
        self.cancel = cancel;
        self
    }

    pub fn settings(&self) -> &EvaluatorSettings {
        &self.settings
    }

    pub async fn evaluate<S>(self: Arc<Self>, candidates: S, concurrency_limit: usize) -> PoolReport
    where
        S: Stream<Item = SearchCandidate> + Send,
    {
        let limit = concurrency_limit.max(1);
        let (task_tx, task_rx) = mpsc::channel::<EvaluationTask>(limit);
        let task_rx = Arc::new(Mutex::new(task_rx));
        let (settled_tx, mut settled_rx) = mpsc::unbounded_channel::<Settled>();

        let mut workers = JoinSet::new();
        for worker_id in 0..limit {
            workers.spawn(
                self.clone()
                    .worker(worker_id, task_rx.clone(), settled_tx.clone()),
            );
        }
        drop(settled_tx);

        let dequeued = self.admit(candidates, task_tx).await;

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                log::error!("evaluation worker stopped abnormally: {e}");
            }
        }

        let mut report = PoolReport {
            dequeued,
            ..Default::default()
        };
        while let Some(settled) = settled_rx.recv().await {
            match settled {
                Settled::Outcome(outcome) => report.outcomes.push(outcome),
                Settled::Dropped(url) => report.dropped.push(url),
            }
        }
        log::info!(
            "evaluation finished: {} dequeued, {} outcomes, {} dropped",
            report.dequeued.len(),
            report.outcomes.len(),
            report.dropped.len()
        );
        report
    }

    /// The single producer. Drops `task_tx` on return, which lets idle workers exit.
    async fn admit<S>(
        &self,
        candidates: S,
        task_tx: mpsc::Sender<EvaluationTask>,
    ) -> Vec<SearchCandidate>
    where
        S: Stream<Item = SearchCandidate> + Send,
    {
        let mut candidates = std::pin::pin!(candidates);
        let mut admitted_urls = HashSet::new();
        let mut dequeued = Vec::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    log::warn!("run cancelled; no further candidates admitted");
                    break;
                }
                next = candidates.next() => next,
            };
            let Some(candidate) = next else {
                break;
            };
            if !admitted_urls.insert(candidate.url.clone()) {
                log::debug!("skipping duplicate candidate {}", candidate.url);
                continue;
            }

            let task = EvaluationTask {
                candidate: candidate.clone(),
                proxy: self.proxies.select_proxy(),
                timeout: self.settings.navigation_timeout,
            };
            dequeued.push(candidate);

            if task_tx.send(task).await.is_err() {
                log::error!("no evaluation workers left to accept tasks");
                break;
            }
        }
        dequeued
    }

    async fn worker(
        self: Arc<Self>,
        worker_id: usize,
        tasks: Arc<Mutex<mpsc::Receiver<EvaluationTask>>>,
        settled: mpsc::UnboundedSender<Settled>,
    ) {
        loop {
            let task = {
                let mut rx = tasks.lock().await;
                rx.recv().await
            };
            let Some(task) = task else {
                break;
            };
            let url = task.candidate.url.clone();

            let result = if self.cancel.is_cancelled() {
                log::info!("[worker {worker_id}] skipping {url}: run cancelled");
                Settled::Dropped(url)
            } else {
                // Own task per candidate so a panic only loses this candidate.
                let pool = self.clone();
                match tokio::spawn(async move { pool.run_task(task).await }).await {
                    Ok(Some(outcome)) => Settled::Outcome(outcome),
                    Ok(None) => Settled::Dropped(url),
                    Err(e) => {
                        log::error!("[worker {worker_id}] task for {url} aborted: {e}");
                        Settled::Dropped(url)
                    }
                }
            };

            if settled.send(result).is_err() {
                break;
            }
        }
    }

    /// Per-candidate pipeline. `None` means the page was never reached.
    async fn run_task(&self, task: EvaluationTask) -> Option<EvaluationOutcome> {
        let EvaluationTask {
            candidate,
            proxy,
            timeout,
        } = task;
        let url = candidate.url.clone();
        let via = proxy
            .as_ref()
            .map(|p| format!(" via {p}"))
            .unwrap_or_default();
        log::info!("evaluating {url}{via}");

        let headers = self.headers.next();
        let mut page = match self.contexts.create(proxy.as_ref(), &headers).await {
            Ok(page) => page,
            Err(e) => {
                log::warn!("[context] {url}{via}: {e}");
                return None;
            }
        };

        let navigated = match tokio::time::timeout(timeout, page.navigate(&url, timeout)).await {
            Ok(result) => result,
            Err(_) => Err(NavigationError::Timeout {
                url: url.clone(),
                after_ms: timeout.as_millis() as u64,
            }),
        };
        if let Err(e) = navigated {
            log::warn!("[navigate] {url}{via}: {e}");
            close_page(page, &url).await;
            return None;
        }

        let outcome = self.assess(page.as_mut(), candidate).await;
        close_page(page, &url).await;
        Some(outcome)
    }

    async fn assess(&self, page: &mut dyn PageContext, candidate: SearchCandidate) -> EvaluationOutcome {
        let mode = self.settings.scoring_mode;
        let url = candidate.url.clone();

        let text = if mode.uses_text() {
            match page.content().await {
                Ok(html) => self
                    .extractor
                    .extract(&html, &url)
                    .map(|text| truncate_chars(text, self.settings.max_text_chars)),
                Err(e) => {
                    log::warn!("[content] {url}: {e}");
                    return EvaluationOutcome::unknown(candidate, Some(e.to_string()));
                }
            }
        } else {
            None
        };

        if mode.uses_text() && text.is_none() {
            log::info!("no extractable content at {url}");
            if mode.requires_text() {
                return EvaluationOutcome::unknown(candidate, None);
            }
        }

        let image = if mode.uses_image() {
            match page
                .snapshot(self.settings.snapshot_max_width, self.settings.snapshot_max_height)
                .await
            {
                Ok(png) => Some(ImageAttachment::png(png)),
                Err(e) if text.is_some() => {
                    log::warn!("[snapshot] {url}: {e}; scoring text only");
                    None
                }
                Err(e) => {
                    log::warn!("[snapshot] {url}: {e}");
                    return EvaluationOutcome::unknown(candidate, Some(e.to_string()));
                }
            }
        } else {
            None
        };

        if text.is_none() && image.is_none() {
            return EvaluationOutcome::unknown(candidate, None);
        }

        let request = ScoringRequest {
            instruction: self.template.render(text.is_some(), image.is_some()),
            body_text: text,
            image,
        };
        let token = match self.scorer.score(request).await {
            Ok(token) => token,
            Err(e) => {
                log::warn!("[score] {url}: {e}");
                return EvaluationOutcome::unknown(candidate, Some(e.to_string()));
            }
        };

        match self.template.scale().parse(&token) {
            Some(verdict) => {
                log::info!("{url} scored {verdict}");
                EvaluationOutcome::scored(candidate, verdict)
            }
            None => {
                log::warn!("[parse] {url}: malformed verdict {token:?}");
                EvaluationOutcome::unknown(candidate, Some(format!("malformed verdict token: {token:?}")))
            }
        }
    }
}

async fn close_page(page: Box<dyn PageContext>, url: &str) {
    if let Err(e) = page.close().await {
        log::warn!("[close] {url}: {e}");
    }
}

fn truncate_chars(mut text: String, max_chars: usize) -> String {
    if let Some((idx, _)) = text.char_indices().nth(max_chars) {
        text.truncate(idx);
    }
    text
}
