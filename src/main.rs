//! # OCA Harvest CLI (`oca`)
//!
//! The `oca` binary drives the harvest pipeline: it initializes the
//! database, runs harvests against the three upstream sources, maintains
//! the raw and curated search indices, administers transformation scripts,
//! computes indicators, and serves the HTTP gateway.
//!
//! ## Usage
//!
//! ```bash
//! oca --config ./config/oca.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `oca init` | Create the SQLite database and run schema migrations |
//! | `oca sources` | List harvest sources and search engine health |
//! | `oca harvest <source>` | Harvest preprints (OAI-PMH), books (CouchDB), or datasets (Dataverse) |
//! | `oca retry-failed <source>` | Re-harvest every failed record |
//! | `oca index failed\|all <source>` | Re-project records into the raw index |
//! | `oca indices create-raw\|create` | Create search indices |
//! | `oca script ...` | Manage transformation scripts |
//! | `oca records failed\|resolve` | Inspect and resolve harvest errors |
//! | `oca indicator <spec.json>` | Compute an indicator and its chart payload |
//! | `oca stats` | Per-source record counts |
//! | `oca serve` | Start the HTTP gateway |
//!
//! ## Examples
//!
//! ```bash
//! oca init
//! oca indices create-raw
//! oca harvest preprints --from 2024-01-01
//! oca harvest books --since 0
//! oca records failed books
//! oca serve
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use oca_harvest::config;
use oca_harvest::harvest::{self, HarvestOptions};
use oca_harvest::indexing::{create_index_from_file, IndexSummary};
use oca_harvest::indicator::{IndicatorEngine, IndicatorSpec};
use oca_harvest::migrate;
use oca_harvest::models::{HarvestModel, RecordSource};
use oca_harvest::pipeline::Pipeline;
use oca_harvest::progress::ProgressMode;
use oca_harvest::search_backend;
use oca_harvest::server;
use oca_harvest::sources;
use oca_harvest::stats;
use oca_harvest::stats::format_ts_relative;
use oca_harvest::store::NewScript;

/// OCA Harvest CLI: harvests scholarly records from preprint, book, and
/// dataset repositories and projects them into a search engine.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/oca.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "oca",
    about = "OCA Harvest: scholarly record harvesting, indexing, and indicators",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/oca.toml")]
    config: PathBuf,

    /// Harvest progress on stderr. Defaults to `human` on a TTY, `off` otherwise.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// List harvest sources and whether the search engine is reachable.
    Sources,

    /// Harvest records from one upstream source.
    Harvest {
        #[command(subcommand)]
        target: HarvestTarget,
    },

    /// Re-harvest every record whose last attempt failed.
    RetryFailed {
        /// `preprints`, `books`, or `datasets`.
        source: RecordSource,
    },

    /// Re-project stored records into their raw index.
    Index {
        #[command(subcommand)]
        action: IndexCommand,
    },

    /// Create search indices.
    Indices {
        #[command(subcommand)]
        action: IndicesCommand,
    },

    /// Manage transformation scripts.
    Script {
        #[command(subcommand)]
        action: ScriptCommand,
    },

    /// Inspect and resolve harvest errors.
    Records {
        #[command(subcommand)]
        action: RecordsCommand,
    },

    /// Compute an indicator from a JSON spec file and print results and chart.
    Indicator {
        /// Path to the indicator spec (JSON).
        spec: PathBuf,
    },

    /// Show per-source record counts.
    Stats,

    /// Start the HTTP gateway.
    ///
    /// Binds to the address configured in `[server].bind`.
    Serve,
}

#[derive(Subcommand)]
enum HarvestTarget {
    /// OAI-PMH ListRecords against the preprint server.
    Preprints {
        /// Lower datestamp bound (YYYY-MM-DD). Defaults to the latest successful datestamp.
        #[arg(long)]
        from: Option<String>,

        /// Upper datestamp bound (YYYY-MM-DD).
        #[arg(long)]
        until: Option<String>,
    },

    /// CouchDB `_changes` feed of the books database.
    Books {
        /// Change sequence to start after. Defaults to the highest stored sequence.
        #[arg(long)]
        since: Option<i64>,
    },

    /// Dataverse search API (datasets and dataverses).
    Datasets {
        /// Search offset. Defaults to the stored record count rounded down to a page.
        #[arg(long)]
        start: Option<u64>,

        /// Stop after this many pages.
        #[arg(long)]
        max_pages: Option<u32>,
    },
}

impl HarvestTarget {
    fn into_parts(self) -> (RecordSource, HarvestOptions) {
        match self {
            HarvestTarget::Preprints { from, until } => (
                RecordSource::Preprint,
                HarvestOptions {
                    from,
                    until,
                    ..HarvestOptions::default()
                },
            ),
            HarvestTarget::Books { since } => (
                RecordSource::Book,
                HarvestOptions {
                    since,
                    ..HarvestOptions::default()
                },
            ),
            HarvestTarget::Datasets { start, max_pages } => (
                RecordSource::Dataset,
                HarvestOptions {
                    start,
                    max_pages,
                    ..HarvestOptions::default()
                },
            ),
        }
    }
}

#[derive(Subcommand)]
enum IndexCommand {
    /// Re-project records whose last projection failed.
    Failed { source: RecordSource },

    /// Project every stored record of a source.
    All {
        source: RecordSource,

        /// Skip records whose harvest did not succeed.
        #[arg(long)]
        only_success: bool,
    },
}

#[derive(Subcommand)]
enum IndicesCommand {
    /// Create the raw index of every harvest model.
    CreateRaw {
        /// Drop and recreate indices that already exist.
        #[arg(long)]
        force: bool,
    },

    /// Create a curated index from a mapping file.
    Create {
        name: String,

        /// JSON file with `{settings, mappings}` or a bare mappings object.
        #[arg(long)]
        mapping: PathBuf,

        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum ScriptCommand {
    /// Register a transformation script.
    Add {
        name: String,

        /// Harvest model discriminator, e.g. `HarvestedPreprint`.
        #[arg(long)]
        model: HarvestModel,

        /// Destination (curated) index.
        #[arg(long)]
        dest_index: String,

        /// Painless source file.
        #[arg(long)]
        transform: PathBuf,

        /// Source index. Defaults to the model's raw index.
        #[arg(long)]
        source_index: Option<String>,

        /// Query template file with an `{{identifier}}` placeholder.
        #[arg(long)]
        query: Option<PathBuf>,

        #[arg(long)]
        description: Option<String>,

        /// Make this the model's active script.
        #[arg(long)]
        active: bool,
    },

    /// List registered scripts.
    List,

    /// Make a script the active one for its model.
    Activate { id: i64 },

    /// Deactivate a script.
    Deactivate { id: i64 },

    /// Run a script now, for the whole source index or one identifier.
    Run {
        id: i64,

        #[arg(long)]
        identifier: Option<String>,
    },
}

#[derive(Subcommand)]
enum RecordsCommand {
    /// List failed records with the errors of their latest attempt.
    Failed { source: RecordSource },

    /// Mark an error log as resolved.
    Resolve { log_id: i64 },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    let progress = cli
        .progress
        .unwrap_or_else(ProgressMode::default_for_tty)
        .reporter();

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Sources => {
            let backend = search_backend::connect(&cfg)?;
            sources::list_sources(&cfg, backend.as_ref()).await?;
        }
        Commands::Harvest { target } => {
            let (source, options) = target.into_parts();
            let pipeline = Pipeline::open(&cfg).await?;
            let summary =
                harvest::run_harvest(&pipeline, source, &options, progress.as_ref()).await?;
            summary.print("harvest");
            pipeline.close().await;
        }
        Commands::RetryFailed { source } => {
            let pipeline = Pipeline::open(&cfg).await?;
            let summary = harvest::run_retry_failed(&pipeline, source, progress.as_ref()).await?;
            summary.print("retry-failed");
            pipeline.close().await;
        }
        Commands::Index { action } => {
            let pipeline = Pipeline::open(&cfg).await?;
            let (label, summary) = match action {
                IndexCommand::Failed { source } => (
                    source,
                    pipeline
                        .projector()
                        .reindex_failed(pipeline.store(), source)
                        .await?,
                ),
                IndexCommand::All {
                    source,
                    only_success,
                } => (
                    source,
                    pipeline
                        .projector()
                        .index_all(pipeline.store(), source, only_success)
                        .await?,
                ),
            };
            print_index_summary(label, &summary);
            pipeline.close().await;
        }
        Commands::Indices { action } => match action {
            IndicesCommand::CreateRaw { force } => {
                let pipeline = Pipeline::open(&cfg).await?;
                for (name, action) in pipeline.projector().create_raw_indices(force).await? {
                    println!("{:<36} {:?}", name, action);
                }
                pipeline.close().await;
            }
            IndicesCommand::Create {
                name,
                mapping,
                force,
            } => {
                let backend = search_backend::connect(&cfg)?;
                let action = create_index_from_file(backend.as_ref(), &name, &mapping, force).await?;
                println!("{:<36} {:?}", name, action);
            }
        },
        Commands::Script { action } => run_script_command(&cfg, action).await?,
        Commands::Records { action } => {
            let pipeline = Pipeline::open(&cfg).await?;
            match action {
                RecordsCommand::Failed { source } => {
                    let records = harvest::failed_records(pipeline.store(), source).await?;
                    if records.is_empty() {
                        println!("No failed {} records.", source);
                    }
                    for failed in &records {
                        let attempt = failed
                            .record
                            .last_harvest_attempt
                            .map(format_ts_relative)
                            .unwrap_or_else(|| "never".to_string());
                        println!("{}  ({})", failed.record.identifier, attempt);
                        for log in &failed.errors {
                            println!(
                                "  [{}] {}: {} ({})",
                                log.id, log.field_name, log.message, log.exception_type
                            );
                        }
                    }
                }
                RecordsCommand::Resolve { log_id } => {
                    if pipeline.store().resolve_error_log(log_id).await? {
                        println!("Resolved error log {}.", log_id);
                    } else {
                        anyhow::bail!("error log {} not found or already resolved", log_id);
                    }
                }
            }
            pipeline.close().await;
        }
        Commands::Indicator { spec } => {
            let content = std::fs::read_to_string(&spec)
                .with_context(|| format!("Failed to read indicator spec: {}", spec.display()))?;
            let spec: IndicatorSpec = serde_json::from_str(&content)
                .with_context(|| format!("Invalid indicator spec: {}", spec.display()))?;
            let backend = search_backend::connect(&cfg)?;
            let engine = IndicatorEngine::new(backend, std::sync::Arc::new(cfg));
            let result = engine.generate(&spec).await?;
            let output = serde_json::json!({
                "title": result.title,
                "results": result.to_output(),
                "chart": result.to_chart(),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Commands::Stats => {
            let pipeline = Pipeline::open(&cfg).await?;
            stats::run_stats(pipeline.store(), &cfg.db.path).await?;
            pipeline.close().await;
        }
        Commands::Serve => {
            let pipeline = Pipeline::open(&cfg).await?;
            server::run_server(pipeline).await?;
        }
    }

    Ok(())
}

fn print_index_summary(source: RecordSource, summary: &IndexSummary) {
    println!("index {}", source);
    println!("  attempted: {}", summary.attempted);
    println!("  indexed: {}", summary.indexed);
    println!("  failed: {}", summary.failed);
    println!("  skipped: {}", summary.skipped);
    println!("ok");
}

async fn run_script_command(cfg: &config::Config, action: ScriptCommand) -> anyhow::Result<()> {
    let pipeline = Pipeline::open(cfg).await?;
    let store = pipeline.store();
    match action {
        ScriptCommand::Add {
            name,
            model,
            dest_index,
            transform,
            source_index,
            query,
            description,
            active,
        } => {
            let transform_script = std::fs::read_to_string(&transform)
                .with_context(|| format!("Failed to read script: {}", transform.display()))?;
            let query_script = match query {
                Some(path) => Some(
                    std::fs::read_to_string(&path)
                        .with_context(|| format!("Failed to read query: {}", path.display()))?,
                ),
                None => None,
            };
            let script = NewScript {
                name,
                description,
                harvest_model: model,
                source_index: source_index
                    .unwrap_or_else(|| cfg.indices.raw_index_for(model).to_string()),
                dest_index,
                query_script,
                transform_script,
                is_active: active,
            };
            let id = store.create_script(&script).await?;
            println!("Created script {} ({}).", id, script.name);
        }
        ScriptCommand::List => {
            let scripts = store.list_scripts().await?;
            if scripts.is_empty() {
                println!("No transformation scripts.");
            }
            for s in scripts {
                println!(
                    "{:>4} {} {:<32} {:<30} {} -> {}",
                    s.id,
                    if s.is_active { "*" } else { " " },
                    s.name,
                    s.harvest_model.as_str(),
                    s.source_index,
                    s.dest_index
                );
            }
        }
        ScriptCommand::Activate { id } => {
            if !store.set_script_active(id, true).await? {
                anyhow::bail!("transformation script {} not found", id);
            }
            println!("Script {} is now active.", id);
        }
        ScriptCommand::Deactivate { id } => {
            if !store.set_script_active(id, false).await? {
                anyhow::bail!("transformation script {} not found", id);
            }
            println!("Script {} deactivated.", id);
        }
        ScriptCommand::Run { id, identifier } => {
            let outcome = pipeline
                .transformer()
                .transform_by_id(store, id, identifier.as_deref())
                .await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if !outcome.is_success() {
                anyhow::bail!("transformation script {} failed", id);
            }
        }
    }
    pipeline.close().await;
    Ok(())
}
