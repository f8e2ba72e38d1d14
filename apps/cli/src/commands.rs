//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use recordfill_cache::PostalCache;
use recordfill_core::{
    BatchProgress, PostalRequest, Resolver, RunSummary, Sources, run_batch,
};
use recordfill_shared::{
    AppConfig, RecordStatus, ResolvedRecord, ResolverConfig, expand_home, init_config,
    load_config, load_config_from, validate_config,
};
use recordfill_sources::{
    BrowserOptions, BrowserSession, HttpFetcher, OllamaClient, RoutedFetcher, SearxClient,
    UrlFilter, ViaCepClient,
};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// recordfill: resolve missing record attributes from the web.
#[derive(Parser)]
#[command(
    name = "recordfill",
    version,
    about = "Fill missing addresses, phones, emails, and postal codes in tabular records.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (defaults to ~/.recordfill/recordfill.toml).
    #[arg(long, global = true, env = "RECORDFILL_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Resolve every row of an input table into an output table.
    Run {
        /// Input CSV file.
        input: PathBuf,

        /// Output CSV file. Rows already present are skipped.
        output: PathBuf,

        /// Number of parallel workers.
        #[arg(short, long)]
        workers: Option<usize>,

        /// Disable every browser-backed source.
        #[arg(long)]
        no_browser: bool,

        /// Disable the LLM pass.
        #[arg(long)]
        no_llm: bool,

        /// Disable search backends.
        #[arg(long)]
        no_search: bool,
    },

    /// Resolve one postal code through the cascade.
    Cep {
        street: String,
        city: String,
        /// Two-letter region code.
        region: String,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "recordfill=info",
        1 => "recordfill=debug",
        _ => "recordfill=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Command::Run {
            input,
            output,
            workers,
            no_browser,
            no_llm,
            no_search,
        } => {
            let mut config = read_config(config_path)?;
            if let Some(workers) = workers {
                config.batch.workers = workers;
            }
            if no_browser {
                config.sources.browser_search = false;
                config.sources.browser_fetch = false;
                config.sources.postal_portal = false;
            }
            if no_llm {
                config.llm.enabled = false;
            }
            if no_search {
                config.sources.search_aggregator = false;
                config.sources.browser_search = false;
            }
            cmd_run(&config, &input, &output).await
        }
        Command::Cep {
            street,
            city,
            region,
        } => cmd_cep(&read_config(config_path)?, &street, &city, &region).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show(config_path).await,
        },
    }
}

fn read_config(path: Option<&Path>) -> Result<AppConfig> {
    let config = match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    validate_config(&config)?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// Source wiring
// ---------------------------------------------------------------------------

/// Clients for one worker. Each worker gets its own browser session.
fn build_sources(config: &AppConfig, runtime: &ResolverConfig) -> recordfill_shared::Result<Sources> {
    let endpoints = &config.endpoints;
    let timeouts = &config.timeouts;
    let filter = UrlFilter::new(&config.filters);
    let secs = Duration::from_secs;

    let browser = if runtime.use_browser {
        let options = BrowserOptions {
            recycle_after: runtime.browser_recycle,
            user_agents: config.filters.user_agents.clone(),
            ..BrowserOptions::new(
                &endpoints.webdriver_url,
                &endpoints.browser_search_url,
                &endpoints.portal_url,
                secs(timeouts.browser_secs),
            )
        };
        Some(Arc::new(BrowserSession::new(options, filter.clone())?))
    } else {
        None
    };

    let mut sources = Sources::default();

    if config.sources.page_fetch || config.sources.browser_fetch {
        let http = HttpFetcher::new(
            secs(timeouts.fetch_secs),
            config.filters.user_agents.clone(),
            filter.clone(),
        )?;
        sources.fetch = Some(Arc::new(RoutedFetcher::new(http, browser.clone())));
    }
    if config.sources.search_aggregator {
        sources.search.push(Arc::new(SearxClient::new(
            &endpoints.search_url,
            &endpoints.search_engines,
            &endpoints.search_language,
            secs(timeouts.search_secs),
            filter.clone(),
        )?));
    }
    if config.llm.enabled {
        sources.llm = Some(Arc::new(OllamaClient::new(
            &endpoints.llm_url,
            &endpoints.llm_model,
            secs(timeouts.llm_secs),
        )?));
    }
    if config.sources.postal_api {
        sources.postal_api = Some(Arc::new(ViaCepClient::new(
            &endpoints.postal_api_url,
            secs(timeouts.postal_secs),
        )?));
    }
    if let Some(browser) = browser {
        if config.sources.browser_search {
            sources.search.push(browser.clone());
        }
        if config.sources.postal_portal {
            sources.portal = Some(browser.clone());
        }
        sources.session = Some(browser);
    }

    Ok(sources)
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(config: &AppConfig, input: &Path, output: &Path) -> Result<()> {
    let runtime = ResolverConfig::from(config);
    let cache_path = expand_home(&config.cache.path)?;
    let cache = PostalCache::open(&cache_path).await?;

    info!(
        input = %input.display(),
        output = %output.display(),
        workers = runtime.workers,
        cache = %cache_path.display(),
        "starting batch"
    );

    let factory = |_worker: usize| build_sources(config, &runtime);
    let progress = Arc::new(CliProgress::new());
    let summary = run_batch(
        &runtime,
        &config.columns,
        input,
        output,
        cache,
        &factory,
        progress,
    )
    .await?;

    print_summary(&summary);
    Ok(())
}

async fn cmd_cep(config: &AppConfig, street: &str, city: &str, region: &str) -> Result<()> {
    let runtime = ResolverConfig::from(config);
    let cache = PostalCache::open(&expand_home(&config.cache.path)?).await?;
    let sources = build_sources(config, &runtime)?;
    let resolver = Resolver::new(runtime, sources, cache.clone());

    let request = PostalRequest {
        street: street.to_string(),
        city: city.to_string(),
        region: region.to_uppercase(),
        ..PostalRequest::default()
    };
    let outcome = resolver.postal_code(&request).await;
    resolver.release().await;
    cache.save().await?;

    match outcome? {
        Some(outcome) => {
            println!("{}", serde_json::to_string_pretty(&outcome.payload)?);
            println!(
                "source: {}{}",
                outcome.provenance,
                if outcome.from_cache { " (cached)" } else { "" }
            );
            Ok(())
        }
        None => Err(eyre!("no postal code found for '{street}, {city}/{region}'")),
    }
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!("  Processed: {}", summary.processed);
    println!("  Skipped:   {} (already in output)", summary.skipped);
    println!("  Failed:    {}", summary.fatal);
    for (status, count) in &summary.by_status {
        println!("    {status:<10} {count}");
    }
    if !summary.per_field.is_empty() {
        println!("  Resolved attributes:");
        for (field, count) in &summary.per_field {
            println!("    {:<12} {count}", field.as_str());
        }
    }
    println!("  Time:      {:.1}s", summary.elapsed.as_secs_f64());
    println!();
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif bar.
struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
        bar.set_style(style);
        bar.enable_steady_tick(Duration::from_millis(120));
        Self { bar }
    }
}

impl BatchProgress for CliProgress {
    fn started(&self, pending: usize, skipped: usize) {
        self.bar.set_length(pending as u64);
        if skipped > 0 {
            self.bar.println(format!("  resuming: {skipped} rows already done"));
        }
    }

    fn record_done(&self, record: &ResolvedRecord, _done: usize, _total: usize) {
        self.bar.inc(1);
        if record.status == RecordStatus::Failed {
            self.bar
                .println(format!("  row {} failed: {}", record.input.row + 1, record.input.name));
        }
        self.bar.set_message(record.input.name.clone());
    }

    fn finished(&self, _summary: &RunSummary) {
        self.bar.finish_and_clear();
    }
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(path: Option<&Path>) -> Result<()> {
    let config = read_config(path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
