//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::Result;
use feedingest_core::{
    CancelSignal, Pipeline, ProcessExecutor, ProgressReporter, Publisher, RunReport,
    SilentProgress, SiteReport, StageRequest, ValidationReport, latest_run_dir, publish_sites,
    validate_run_dir,
};
use feedingest_discovery::{Catalog, Selection, Selector};
use feedingest_shared::{
    AppConfig, IngestError, RunConfig, RunTimestamp, SiteId, Stage, init_config, load_config,
    load_config_from, publish_api_key,
};
use feedingest_storage::{ArtifactStore, open_store};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// feedingest: run per-site ingestion stages and publish the results.
#[derive(Parser)]
#[command(
    name = "feedingest",
    version,
    about = "Run per-site fetch/parse/normalize runners and publish normalized records.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file to use instead of ~/.feedingest/feedingest.toml.
    #[arg(long, global = true, env = "FEEDINGEST_CONFIG")]
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

/// Which sites a command applies to.
#[derive(Args, Debug, Default)]
pub(crate) struct SelectArgs {
    /// Restrict to one region (e.g. `ca`).
    #[arg(long, visible_alias = "state")]
    pub region: Option<String>,

    /// Sites as `region/site`, or bare site names with --region.
    pub sites: Vec<String>,

    /// Root of the runner tree.
    #[arg(long, env = "FEEDINGEST_RUNNERS_DIR")]
    pub runners_dir: Option<PathBuf>,

    /// Output root: a local path or a gs:// URI.
    #[arg(long, env = "FEEDINGEST_OUTPUT_DIR")]
    pub output_dir: Option<String>,
}

/// Options for a pipeline run.
#[derive(Args, Debug, Default)]
pub(crate) struct RunArgs {
    #[command(flatten)]
    pub select: SelectArgs,

    /// Number of sites processed at once.
    #[arg(short = 'j', long)]
    pub concurrency: Option<usize>,

    /// Per-stage timeout in seconds.
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Print the run report as JSON instead of a table.
    #[arg(long)]
    pub json: bool,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// List discovered runners and the stages they implement.
    AvailableSites {
        /// Restrict to one region.
        #[arg(long, visible_alias = "state")]
        region: Option<String>,

        /// Root of the runner tree.
        #[arg(long, env = "FEEDINGEST_RUNNERS_DIR")]
        runners_dir: Option<PathBuf>,
    },

    /// Run the fetch stage.
    Fetch(RunArgs),

    /// Run the parse stage against the latest fetch output.
    Parse(RunArgs),

    /// Run the normalize stage against the latest parse output.
    Normalize(RunArgs),

    /// Run fetch, parse and normalize in order.
    AllStages(RunArgs),

    /// Validate the latest normalize output of each site.
    Validate {
        #[command(flatten)]
        select: SelectArgs,

        /// Print findings as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Load the latest normalized records into the record service.
    Publish {
        #[command(flatten)]
        select: SelectArgs,

        /// Read and batch records without sending anything.
        #[arg(long)]
        dry_run: bool,
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
        0 => "feedingest=info",
        1 => "feedingest=debug",
        _ => "feedingest=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

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

/// Run the CLI command and return the process exit code.
pub(crate) async fn run(cli: Cli) -> Result<i32> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Command::AvailableSites {
            region,
            runners_dir,
        } => cmd_available_sites(config_path, region.as_deref(), runners_dir).await,
        Command::Fetch(args) => cmd_run(config_path, StageRequest::Single(Stage::Fetch), args).await,
        Command::Parse(args) => cmd_run(config_path, StageRequest::Single(Stage::Parse), args).await,
        Command::Normalize(args) => {
            cmd_run(config_path, StageRequest::Single(Stage::Normalize), args).await
        }
        Command::AllStages(args) => cmd_run(config_path, StageRequest::All, args).await,
        Command::Validate { select, json } => cmd_validate(config_path, &select, json).await,
        Command::Publish { select, dry_run } => cmd_publish(config_path, &select, dry_run).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(config_path).await,
            ConfigAction::Show => cmd_config_show(config_path).await,
        },
    }
}

fn load(config_path: Option<&Path>) -> Result<AppConfig> {
    let config = match config_path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    Ok(config)
}

/// Merge config file defaults with command-line overrides.
fn resolve_run_config(
    config: &AppConfig,
    select: &SelectArgs,
    concurrency: Option<usize>,
    timeout: Option<u64>,
) -> Result<RunConfig> {
    let mut run_config = RunConfig::from(config);
    if let Some(dir) = &select.runners_dir {
        run_config.runners_dir = dir.clone();
    }
    if let Some(dir) = &select.output_dir {
        run_config.output_dir = dir.clone();
    }
    if let Some(n) = concurrency {
        run_config.concurrency = n;
    }
    if let Some(secs) = timeout {
        run_config.stage_timeout = Duration::from_secs(secs);
    }
    run_config.validate()?;
    Ok(run_config)
}

/// Cancel the run on the first Ctrl-C.
fn cancel_on_interrupt() -> CancelSignal {
    let cancel = CancelSignal::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            signal.cancel();
        }
    });
    cancel
}

/// Resolve a selection to runners that implement `stage`.
///
/// Unknown sites and sites without `stage` are logged and reported back as
/// skipped.
fn select_sites(catalog: &Catalog, selector: &Selector, stage: Stage) -> (Vec<SiteId>, usize) {
    let mut sites = Vec::new();
    let mut skipped = 0;
    for selection in catalog.select(selector) {
        match selection {
            Selection::Found(runner) if runner.implements(stage) => sites.push(runner.site.clone()),
            Selection::Found(runner) => {
                warn!(site = %runner.site, "{}", IngestError::StageNotImplemented {
                    site: runner.site.to_string(),
                    stage: stage.to_string(),
                });
                skipped += 1;
            }
            Selection::NotFound(site) => {
                warn!(site = %site, "no runner for site");
                skipped += 1;
            }
        }
    }
    (sites, skipped)
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_available_sites(
    config_path: Option<&Path>,
    region: Option<&str>,
    runners_dir: Option<PathBuf>,
) -> Result<i32> {
    let config = load(config_path)?;
    let root = runners_dir.unwrap_or_else(|| PathBuf::from(&config.defaults.runners_dir));
    let catalog = Catalog::scan(&root)?;

    let selector = match region {
        Some(region) => Selector::Region(region.to_string()),
        None => Selector::All,
    };
    for selection in catalog.select(&selector) {
        if let Selection::Found(runner) = selection {
            println!("{}", runner.describe());
        }
    }
    for problem in catalog.problems() {
        eprintln!("  skipped: {problem}");
    }
    Ok(0)
}

async fn cmd_run(config_path: Option<&Path>, request: StageRequest, args: RunArgs) -> Result<i32> {
    let config = load(config_path)?;
    let run_config = resolve_run_config(&config, &args.select, args.concurrency, args.timeout)?;
    let selector = Selector::from_args(args.select.region.as_deref(), &args.select.sites)?;
    let catalog = Catalog::scan(&run_config.runners_dir)?;
    let store = open_store(&run_config.output_dir, &config.storage)?;

    info!(
        request = %request,
        runners = catalog.len(),
        output = %store.root(),
        concurrency = run_config.concurrency,
        "starting run"
    );

    let cancel = cancel_on_interrupt();
    let pipeline = Pipeline::new(store, Arc::new(ProcessExecutor), &run_config, cancel);
    let progress: Arc<dyn ProgressReporter> = if args.json {
        Arc::new(SilentProgress)
    } else {
        Arc::new(CliProgress::new())
    };

    let report = pipeline.run(&catalog, &selector, request, progress).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!();
        print!("{}", report.render_summary());
        println!();
    }
    Ok(report.exit_code())
}

async fn cmd_validate(config_path: Option<&Path>, select: &SelectArgs, json: bool) -> Result<i32> {
    let config = load(config_path)?;
    let run_config = resolve_run_config(&config, select, None, None)?;
    let selector = Selector::from_args(select.region.as_deref(), &select.sites)?;
    let catalog = Catalog::scan(&run_config.runners_dir)?;
    let store = open_store(&run_config.output_dir, &config.storage)?;
    store.probe().await?;

    let (sites, mut failed) = select_sites(&catalog, &selector, Stage::Normalize);
    let mut reports: Vec<(SiteId, String, ValidationReport)> = Vec::new();
    for site in sites {
        let Some(dir) = latest_run_dir(store.as_ref(), &site, Stage::Normalize).await? else {
            warn!(site = %site, "no normalize output to validate");
            failed += 1;
            continue;
        };
        let report = validate_run_dir(store.as_ref(), Stage::Normalize, &dir).await;
        if !report.is_clean() {
            failed += 1;
        }
        reports.push((site, dir, report));
    }

    if json {
        let value: Vec<_> = reports
            .iter()
            .map(|(site, dir, report)| {
                serde_json::json!({ "site": site, "run_dir": dir, "validation": report })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        for (site, dir, report) in &reports {
            println!(
                "{site:<28} {:>6} records {:>4} invalid  {}",
                report.records,
                report.invalid_records,
                dir,
            );
            for finding in &report.findings {
                println!("    {finding}");
            }
        }
    }
    Ok(if failed == 0 { 0 } else { 1 })
}

async fn cmd_publish(config_path: Option<&Path>, select: &SelectArgs, dry_run: bool) -> Result<i32> {
    let config = load(config_path)?;
    let run_config = resolve_run_config(&config, select, None, None)?;
    let selector = Selector::from_args(select.region.as_deref(), &select.sites)?;
    let catalog = Catalog::scan(&run_config.runners_dir)?;
    let store: Arc<dyn ArtifactStore> = open_store(&run_config.output_dir, &config.storage)?;
    store.probe().await?;

    let (sites, skipped) = select_sites(&catalog, &selector, Stage::Normalize);
    let publisher = if dry_run {
        None
    } else {
        Some(Publisher::new(&config.publish, publish_api_key(&config)?)?)
    };

    let summary = publish_sites(
        store.as_ref(),
        &sites,
        publisher.as_ref(),
        config.publish.batch_size,
    )
    .await?;

    println!();
    if summary.dry_run {
        println!("  Dry run: nothing was sent.");
    } else if let Some(id) = &summary.import_run_id {
        println!("  Import run: {id}");
    }
    for site in &summary.sites {
        let state = match &site.error {
            Some(err) => format!("failed: {err}"),
            None => format!("{} batches", site.batches),
        };
        println!(
            "  {:<28} {:>6} records {:>4} skipped  {state}",
            site.site.to_string(),
            site.records,
            site.skipped,
        );
    }
    println!("  Total: {} records", summary.records());
    println!();

    Ok(if summary.failed_sites() == 0 && skipped == 0 { 0 } else { 1 })
}

async fn cmd_config_init(config_path: Option<&Path>) -> Result<i32> {
    let path = init_config(config_path)?;
    println!("Config initialized at: {}", path.display());
    Ok(0)
}

async fn cmd_config_show(config_path: Option<&Path>) -> Result<i32> {
    let config: AppConfig = load(config_path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(0)
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
        let style = ProgressStyle::with_template("{spinner:.cyan} [{pos}/{len}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        bar.set_style(style);
        bar.enable_steady_tick(Duration::from_millis(80));
        Self { bar }
    }
}

impl ProgressReporter for CliProgress {
    fn run_started(&self, run: &RunTimestamp, sites: usize) {
        self.bar.set_length(sites as u64);
        self.bar.set_message(format!("run {run}"));
    }

    fn stage_started(&self, site: &SiteId, stage: Stage) {
        self.bar.set_message(format!("{site} {stage}"));
    }

    fn site_finished(&self, report: &SiteReport) {
        self.bar.inc(1);
        self.bar.println(format!("  {:<28} {}", report.site.to_string(), report.outcome));
    }

    fn done(&self, _report: &RunReport) {
        self.bar.finish_and_clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_stage_command_with_overrides() {
        let cli = Cli::try_parse_from([
            "feedingest",
            "all-stages",
            "--state",
            "ca",
            "sf_gov",
            "-j",
            "4",
            "--timeout",
            "60",
            "--output-dir",
            "gs://bucket/out",
        ])
        .unwrap();
        let Command::AllStages(args) = cli.command else {
            panic!("expected all-stages");
        };
        assert_eq!(args.select.region.as_deref(), Some("ca"));
        assert_eq!(args.select.sites, vec!["sf_gov".to_string()]);
        assert_eq!(args.concurrency, Some(4));

        let run_config =
            resolve_run_config(&AppConfig::default(), &args.select, args.concurrency, args.timeout)
                .unwrap();
        assert_eq!(run_config.concurrency, 4);
        assert_eq!(run_config.stage_timeout, Duration::from_secs(60));
        assert_eq!(run_config.output_dir, "gs://bucket/out");
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let select = SelectArgs::default();
        let err = resolve_run_config(&AppConfig::default(), &select, Some(0), None).unwrap_err();
        assert!(err.to_string().contains("concurrency"));
    }

    #[test]
    fn select_sites_skips_missing_stage_and_unknown_site() {
        use feedingest_discovery::{Runner, StageCommand};
        use std::collections::BTreeMap;

        let mut full = BTreeMap::new();
        for stage in Stage::ALL {
            full.insert(stage, StageCommand::Executable { path: PathBuf::from("/bin/true") });
        }
        let mut fetch_only = BTreeMap::new();
        fetch_only.insert(Stage::Fetch, StageCommand::Executable { path: PathBuf::from("/bin/true") });

        let catalog = Catalog::from_runners(
            "/runners",
            [
                Runner::new(SiteId::new("ca", "full"), "/runners/ca/full", full),
                Runner::new(SiteId::new("ca", "partial"), "/runners/ca/partial", fetch_only),
            ],
        );
        let selector = Selector::Sites(vec![
            SiteId::new("ca", "full"),
            SiteId::new("ca", "partial"),
            SiteId::new("ca", "missing"),
        ]);

        let (sites, skipped) = select_sites(&catalog, &selector, Stage::Normalize);
        assert_eq!(sites, vec![SiteId::new("ca", "full")]);
        assert_eq!(skipped, 2);
    }
}
