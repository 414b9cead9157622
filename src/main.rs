use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::io::{BufWriter, IsTerminal, Write};
use std::path::PathBuf;

use config::OnStorageError;
use locate::{GeohashAggregator, LocateMethod, LocateOptions, VisitClusterer};
use normalize::Normalizer;
use pipeline::{IngestReport, Ingester, PipelineOptions};
use regions::{GeoJsonRegions, RegionLookup};
use repository::{Repository, SqliteRepository};
use source::SourceEnumerator;
use utils::{NumberFormatOptions, format_number, format_share};

mod config;
mod error;
mod locate;
mod normalize;
mod parser;
mod pipeline;
mod regions;
mod repository;
mod source;
mod types;
mod utils;

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "homeloc")]
#[command(version)]
#[command(disable_help_subcommand = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// SQLite database (defaults to the configured path)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Use comma-separated number formatting
    #[arg(long, global = true)]
    number_comma: bool,

    /// Use human-readable number formatting (k, m, b, t)
    #[arg(short = 'H', long, global = true)]
    number_human: bool,

    /// Locale for number formatting (en, de, fr, es, it)
    #[arg(long, global = true)]
    locale: Option<String>,

    /// Number of decimal places for human-readable formatting
    #[arg(long, global = true)]
    decimal_places: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    /// Load user exports into the database
    Ingest(IngestArgs),
    /// Estimate each user's home location from stored activity
    Locate(LocateArgs),
    /// Report estimated users per region, or export one region's activity
    Regions(RegionsArgs),
    /// Manage configuration
    Config(ConfigArgs),
}

#[derive(Args)]
struct IngestArgs {
    /// Directory of exports, searched recursively
    #[arg(long, conflicts_with = "archive", required_unless_present = "archive")]
    dir: Option<PathBuf>,

    /// Tar archive of exports
    #[arg(long)]
    archive: Option<PathBuf>,

    /// File name pattern of exports
    #[arg(long)]
    pattern: Option<String>,

    #[arg(long)]
    workers: Option<usize>,

    /// Parsed payloads held in memory at once
    #[arg(long)]
    queue_capacity: Option<usize>,

    /// Users per storage transaction
    #[arg(long)]
    batch_users: Option<usize>,

    /// What to do when a batch fails to commit
    #[arg(long, value_enum)]
    on_storage_error: Option<OnStorageError>,
}

#[derive(Args)]
struct LocateArgs {
    /// Name the estimates are stored under
    #[arg(long)]
    name: String,

    #[arg(long, value_enum)]
    method: Option<LocateMethod>,

    /// SQL condition selecting the activity to use; "" selects all
    #[arg(long)]
    filter: Option<String>,

    #[arg(long)]
    radius_km: Option<f64>,

    #[arg(long)]
    min_points: Option<usize>,

    #[arg(long)]
    precision: Option<usize>,

    #[arg(long)]
    threshold: Option<f64>,
}

#[derive(Args)]
struct RegionsArgs {
    /// GeoJSON FeatureCollection of region boundaries
    #[arg(long)]
    shapes: PathBuf,

    /// Location calc to report on
    #[arg(long)]
    name: String,

    /// Feature property holding the region name
    #[arg(long)]
    property: Option<String>,

    /// Export the activity of users located in this region as JSON lines
    #[arg(long)]
    region: Option<String>,

    /// Output file for --region (stdout when omitted)
    #[arg(long, requires = "region")]
    output: Option<PathBuf>,
}

#[derive(Args)]
struct ConfigArgs {
    #[command(subcommand)]
    subcommand: ConfigSubcommands,
}

#[derive(Subcommand)]
enum ConfigSubcommands {
    /// Create default configuration file
    Init {
        #[arg(long, default_value_t = false)]
        overwrite: bool,
    },
    /// Show current configuration
    Show,
    /// Set configuration value
    Set {
        /// Configuration key (database-path, workers, queue-capacity, batch-users, locate-method, ...)
        key: String,
        /// Configuration value
        value: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Load config file to get defaults
    let mut config = match config::Config::load() {
        Ok(config) => config.unwrap_or_default(),
        Err(e) => {
            eprintln!("Config error: {e:#}");
            std::process::exit(1);
        }
    };
    if let Some(db) = cli.db {
        config.database.path = db;
    }

    // Create format options merging config defaults with CLI overrides
    let mut format_options = config.formatting.number_options();
    format_options.use_comma |= cli.number_comma;
    format_options.use_human |= cli.number_human;
    if let Some(locale) = cli.locale {
        format_options.locale = locale;
    }
    if let Some(places) = cli.decimal_places {
        format_options.decimal_places = places;
    }

    match cli.command {
        Commands::Ingest(args) => {
            if let Err(e) = run_ingest(args, config, &format_options).await {
                eprintln!("Ingest failed: {e:#}");
                std::process::exit(1);
            }
        }
        Commands::Locate(args) => {
            if let Err(e) = run_locate(args, config, &format_options).await {
                eprintln!("Locate failed: {e:#}");
                std::process::exit(1);
            }
        }
        Commands::Regions(args) => {
            if let Err(e) = run_regions(args, config, &format_options).await {
                eprintln!("Region report failed: {e:#}");
                std::process::exit(1);
            }
        }
        Commands::Config(config_args) => {
            handle_config_subcommand(config_args);
        }
    }
}

fn open_repository(config: &config::Config) -> Result<SqliteRepository> {
    let path = &config.database.path;
    let repository = SqliteRepository::open(path)
        .with_context(|| format!("Failed to open database {}", path.display()))?;
    repository
        .create_tables()
        .context("Failed to prepare database schema")?;
    Ok(repository)
}

async fn run_ingest(
    args: IngestArgs,
    mut config: config::Config,
    format_options: &NumberFormatOptions,
) -> Result<()> {
    if let Some(pattern) = args.pattern {
        config.ingest.file_pattern = pattern;
    }
    if let Some(workers) = args.workers {
        config.ingest.workers = workers;
    }
    if let Some(capacity) = args.queue_capacity {
        config.ingest.queue_capacity = capacity;
    }
    if let Some(batch) = args.batch_users {
        config.ingest.batch_users = batch;
    }
    if let Some(policy) = args.on_storage_error {
        config.storage.on_error = policy;
    }

    let enumerator = SourceEnumerator::new(&config.ingest.file_pattern)?;
    let input = args
        .dir
        .or(args.archive)
        .context("Pass --dir or --archive")?;
    let sources = enumerator.open(&input)?;
    let groups = source::group_by_user(sources);

    let repository = open_repository(&config)?;
    let options = PipelineOptions {
        queue_capacity: config.ingest.queue_capacity,
        workers: config.ingest.workers,
        batch_users: config.ingest.batch_users,
        progress_every: config.ingest.progress_every,
        storage_policy: config.storage.policy(),
    };
    let ingester = Ingester::new(options, Normalizer::default());
    let ticker = std::io::stderr().is_terminal().then(|| {
        let mut progress = ingester.progress();
        let total = groups.len();
        tokio::spawn(async move {
            while progress.changed().await.is_ok() {
                let done = *progress.borrow_and_update();
                eprint!("\r   {done}/{total} groups");
            }
            eprintln!();
        })
    });
    let result = ingester.run(groups, repository).await;
    drop(ingester);
    if let Some(ticker) = ticker {
        let _ = ticker.await;
    }
    let report = result?;

    print_ingest_report(&report, format_options);
    Ok(())
}

fn print_ingest_report(report: &IngestReport, format_options: &NumberFormatOptions) {
    let n = |v: u64| format_number(v, format_options);
    let summary = &report.summary;
    println!("Ingest complete");
    println!(
        "   Groups:      {} parsed of {}",
        n(report.groups_parsed),
        format_number(report.groups_total, format_options)
    );
    println!("   Records:     {}", n(summary.records));
    println!("   Unique:      {}", n(summary.unique));
    println!("   Duplicates:  {}", n(summary.duplicates));
    println!("   Geotagged:   {}", n(summary.geotagged));
    println!("   Malformed:   {}", n(summary.malformed));
    println!(
        "   Stored:      {} users in {} batches",
        n(report.users_stored),
        n(report.batches_flushed)
    );
    if !report.skipped.is_empty() {
        println!("   Skipped groups ({}):", report.skipped.len());
        for skipped in &report.skipped {
            println!(
                "      {} [{}]: {}",
                skipped.user_key,
                skipped.sources.join(", "),
                skipped.reason
            );
        }
    }
}

async fn run_locate(
    args: LocateArgs,
    config: config::Config,
    format_options: &NumberFormatOptions,
) -> Result<()> {
    let options = LocateOptions {
        method: args.method.unwrap_or(config.locate.method),
        clusterer: VisitClusterer::new(
            args.radius_km.unwrap_or(config.cluster.radius_km),
            args.min_points.unwrap_or(config.cluster.min_points),
        ),
        aggregator: GeohashAggregator::new(
            args.precision.unwrap_or(config.geohash.precision),
            args.threshold
                .unwrap_or(config.geohash.confidence_threshold),
        ),
        min_usable_length: config.geohash.min_usable_length,
    };
    let filter = args.filter.unwrap_or(config.locate.filter.clone());
    let name = args.name;

    let mut repository = open_repository(&config)?;
    let report = tokio::task::spawn_blocking(move || {
        locate::run_calc(&mut repository, &name, &filter, &options)
    })
    .await??;

    let n = |v: usize| format_number(v, format_options);
    println!("Locate complete");
    println!("   Users:        {}", n(report.users));
    println!("   Estimated:    {}", n(report.estimated));
    for (method, count) in &report.by_method {
        println!("      {method}: {}", n(*count));
    }
    println!("   No estimate:  {}", n(report.no_estimate));
    println!("   Discarded:    {}", n(report.discarded));
    if report.users > 0 {
        println!(
            "   Coverage:     {}",
            format_share(report.estimated as f64 / report.users as f64, format_options)
        );
    }
    Ok(())
}

async fn run_regions(
    args: RegionsArgs,
    config: config::Config,
    format_options: &NumberFormatOptions,
) -> Result<()> {
    let property = args.property.unwrap_or(config.regions.name_property.clone());
    let shapes = GeoJsonRegions::load(&args.shapes, &property)?;
    let repository = open_repository(&config)?;
    let estimates = repository.list_estimates(&args.name)?;
    if estimates.is_empty() {
        anyhow::bail!("No estimates stored under {:?}; run `homeloc locate` first", args.name);
    }

    let Some(region) = args.region else {
        let (counts, outside) = regions::count_by_region(&shapes, &estimates);
        println!("Users per region ({})", args.name);
        for (region, count) in counts.iter().filter(|(_, c)| **c > 0) {
            println!("   {region}: {}", format_number(*count, format_options));
        }
        println!("   (outside all regions): {}", format_number(outside, format_options));
        return Ok(());
    };

    if !shapes.regions().contains(&region) {
        anyhow::bail!("Unknown region {region:?}");
    }
    let mut users: Vec<_> = regions::users_in_region(&shapes, &region, &estimates)
        .into_iter()
        .collect();
    users.sort_unstable();

    let activities = if users.is_empty() {
        Vec::new()
    } else {
        let ids: Vec<String> = users.iter().map(|id| id.to_string()).collect();
        repository.list_activities(&format!("user_id IN ({})", ids.join(",")))?
    };

    let mut out: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(BufWriter::new(
            std::fs::File::create(path)
                .with_context(|| format!("Failed to create {}", path.display()))?,
        )),
        None => Box::new(BufWriter::new(std::io::stdout().lock())),
    };
    for activity in &activities {
        let line = simd_json::to_string(activity)?;
        writeln!(out, "{line}")?;
    }
    out.flush()?;

    eprintln!(
        "Wrote {} activities of {} users in {region}",
        format_number(activities.len(), format_options),
        format_number(users.len(), format_options)
    );
    Ok(())
}

fn handle_config_subcommand(config_args: ConfigArgs) {
    match config_args.subcommand {
        ConfigSubcommands::Init { overwrite } => {
            if let Err(e) = config::create_default_config(overwrite) {
                eprintln!("Error creating config: {e}");
                std::process::exit(1);
            }
        }
        ConfigSubcommands::Show => {
            if let Err(e) = config::show_config() {
                eprintln!("Error showing config: {e}");
                std::process::exit(1);
            }
        }
        ConfigSubcommands::Set { key, value } => {
            if let Err(e) = config::set_config_value(&key, &value) {
                eprintln!("Error setting config: {e}");
                std::process::exit(1);
            }
        }
    }
}
