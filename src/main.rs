use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use relevance_harvest::aggregator::load_batch;
use relevance_harvest::config::{CONFIG, ExtractorKind, FetcherKind, RunSettings};
use relevance_harvest::data_models::{ScoringMode, VerdictScale};
use relevance_harvest::pipeline::{Components, HarvestPipeline};
use relevance_harvest::sink::{UrlSink, load_urls};

#[derive(Parser)]
#[command(name = "relevance-harvest")]
#[command(about = "Harvest search results and have a model judge their relevance")]
#[command(version)]
struct Cli {
    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Search, evaluate every candidate and save the batch
    Run(RunArgs),

    /// Send the URLs in a saved file to the configured sink
    Publish {
        /// A `.relevant.json` list or a whole batch file
        path: PathBuf,

        /// Only outcomes with this verdict; needs a batch file
        #[arg(long)]
        threshold: Option<String>,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Search query, also used in the scoring instruction
    query: String,

    #[arg(long, default_value_t = 10)]
    per_page: usize,

    /// Number of candidates to harvest
    #[arg(long, default_value_t = 10)]
    target: usize,

    /// Pages evaluated at once
    #[arg(short, long, default_value_t = 4)]
    concurrency: usize,

    #[arg(long, default_value_t = 20_000)]
    timeout_ms: u64,

    #[arg(long, value_enum, default_value_t = ScoringMode::TextOnly)]
    mode: ScoringMode,

    /// `1-5` for a numeric range, or labels most relevant first: `high,medium,low`
    #[arg(long, default_value = "1-5")]
    scale: VerdictScale,

    /// Verdict that counts as relevant; defaults to the top of the scale
    #[arg(long)]
    threshold: Option<String>,

    /// Route page loads through the validated proxy list
    #[arg(long)]
    proxies: bool,

    #[arg(long)]
    proxy_seed: Option<u64>,

    #[arg(long, value_enum, default_value_t = FetcherKind::Http)]
    fetcher: FetcherKind,

    #[arg(long, value_enum, default_value_t = ExtractorKind::Readable)]
    extractor: ExtractorKind,

    /// Send relevant URLs to the sink after the run
    #[arg(long)]
    publish: bool,

    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Pause between search result pages
    #[arg(long, default_value_t = 0)]
    page_delay_ms: u64,

    #[arg(long, default_value_t = 100_000)]
    max_text_chars: usize,
}

impl RunArgs {
    fn into_settings(self, default_output_dir: PathBuf) -> RunSettings {
        RunSettings {
            per_page: self.per_page,
            target: self.target,
            concurrency: self.concurrency,
            navigation_timeout: Duration::from_millis(self.timeout_ms),
            mode: self.mode,
            scale: self.scale,
            threshold: self.threshold,
            use_proxies: self.proxies,
            proxy_seed: self.proxy_seed,
            fetcher: self.fetcher,
            extractor: self.extractor,
            publish: self.publish,
            output_dir: self.output_dir.unwrap_or(default_output_dir),
            page_delay: Duration::from_millis(self.page_delay_ms),
            max_text_chars: self.max_text_chars,
            ..RunSettings::new(self.query)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Also picks up log:: records through the tracing-log bridge
    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .with_target(true)
        .init();

    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Publish { path, threshold } => publish(path, threshold).await,
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let config = &*CONFIG;
    let settings = args.into_settings(config.output_dir.clone());
    settings.validate(config)?;

    let components = Components::from_config(&settings, config).await?;
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("interrupt received; finishing in-flight pages");
            on_signal.cancel();
        }
    });

    let summary = HarvestPipeline::new(settings, components)
        .with_cancellation(cancel)
        .run()
        .await?;

    println!("{}", summary.batch_path.display());
    for url in &summary.relevant_urls {
        println!("{url}");
    }
    Ok(())
}

async fn publish(path: PathBuf, threshold: Option<String>) -> anyhow::Result<()> {
    let endpoint = CONFIG
        .sink_url
        .as_deref()
        .context("HARVEST_SINK_URL is not set")?;
    let urls = match threshold {
        Some(raw) => {
            let batch = load_batch(&path)
                .await
                .with_context(|| format!("{} is not a result batch", path.display()))?;
            batch.urls_with_relevance(&raw)
        }
        None => load_urls(&path).await?,
    };
    let response = UrlSink::new(endpoint).publish(&urls).await?;
    println!("{response}");
    Ok(())
}
