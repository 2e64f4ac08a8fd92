//! # bibmirror CLI (`bibm`)
//!
//! The `bibm` binary drives the synchronization pipeline and the query
//! surface. Failures are reported via non-zero exit status and structured
//! log lines; the HTTP server always serves the last committed index
//! generation regardless of sync outcomes.
//!
//! ## Usage
//!
//! ```bash
//! bibm --config ./bibmirror.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `bibm init` | Create the cache database and run schema migrations |
//! | `bibm sync all [--full]` | Cache sync, index rebuild, attachment reconciliation |
//! | `bibm sync cache [--full]` | Cache sync only |
//! | `bibm sync index` | Index rebuild only (skipped when cache unchanged) |
//! | `bibm sync attachments` | Attachment reconciliation only |
//! | `bibm search "<query>"` | Search the live index generation |
//! | `bibm stats` | Show cache/index/attachment statistics |
//! | `bibm clean <scope>` | Delete cache, index, attachments, or everything |
//! | `bibm serve` | Start the HTTP query/monitoring server |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bibmirror::clean::{self, CleanScope};
use bibmirror::config;
use bibmirror::error::SyncError;
use bibmirror::pipeline;
use bibmirror::progress::ProgressMode;
use bibmirror::query::{self, QueryRequest};
use bibmirror::server;
use bibmirror::stats;

/// bibmirror CLI — a faceted-search mirror for remotely hosted
/// bibliographic libraries.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/bibmirror.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "bibm",
    about = "bibmirror — a faceted-search mirror for remotely hosted bibliographic libraries",
    version,
    long_about = "bibmirror keeps a local, queryable copy of a remote bibliographic library \
    through a three-stage pipeline: incremental cache sync, deterministic index rebuild with \
    atomic generation swap, and MD5-based attachment reconciliation. Each stage is \
    independently invocable."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./bibmirror.toml")]
    config: PathBuf,

    /// Progress reporting on stderr: auto, off, human, or json.
    #[arg(long, global = true, default_value = "auto")]
    progress: String,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the cache database.
    ///
    /// Creates the data directory and cache schema. Idempotent.
    Init,

    /// Run synchronization stages.
    ///
    /// Stages always run in pipeline order: cache before index before
    /// attachments. At most one sync run executes at a time; a second
    /// invocation refuses to start while the run lock is held.
    Sync {
        #[command(subcommand)]
        stage: SyncStage,
    },

    /// Search the live index generation.
    Search {
        /// The search query string. Empty browses everything.
        query: String,

        /// Search scope: `all`, `title`, `creator`, or `fulltext`.
        #[arg(long, default_value = "all")]
        scope: String,

        /// Sort: `relevance`, `date_desc`, `date_asc`, `title`, `author`.
        /// Relevance requires query terms.
        #[arg(long, default_value = "relevance")]
        sort: String,

        /// Facet filter as `facet=value` (repeatable), e.g.
        /// `--facet item_type=book --facet tag=optics`.
        #[arg(long = "facet", value_parser = parse_key_val)]
        facets: Vec<(String, String)>,

        /// Page number (1-based).
        #[arg(long, default_value_t = 1)]
        page: u32,

        /// Results per page (defaults to the configured page length).
        #[arg(long)]
        page_len: Option<u32>,
    },

    /// Show cache, index, and attachment statistics.
    Stats,

    /// Delete persisted state.
    Clean {
        /// Scope: `cache`, `index`, `attachments`, or `everything`.
        scope: String,
    },

    /// Start the HTTP query and monitoring server.
    Serve,
}

/// Sync stage selection.
#[derive(Subcommand)]
enum SyncStage {
    /// All three stages in order.
    All {
        /// Force a full cache sweep from version 0.
        #[arg(long)]
        full: bool,
    },
    /// Cache sync only.
    Cache {
        /// Force a full cache sweep from version 0.
        #[arg(long)]
        full: bool,
    },
    /// Index rebuild only. Skipped when the cache is unchanged since the
    /// live generation was built.
    Index,
    /// Attachment reconciliation only, against the live generation's
    /// manifest.
    Attachments,
}

/// Parse a `key=value` pair for `--facet` arguments.
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{}'", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

fn progress_mode(flag: &str) -> ProgressMode {
    match flag {
        "off" => ProgressMode::Off,
        "human" => ProgressMode::Human,
        "json" => ProgressMode::Json,
        _ => ProgressMode::default_for_tty(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Configuration errors are fatal before any command logic runs.
    let cfg = config::load_config(&cli.config)?;
    let progress = progress_mode(&cli.progress).reporter();

    // Ctrl-c flips the cancellation flag; the synchronizer observes it
    // between entity batches.
    let cancel: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("cancellation requested, stopping at the next batch boundary");
                cancel.store(true, Ordering::Relaxed);
            }
        });
    }

    match cli.command {
        Commands::Init => {
            let pool = bibmirror::cache::connect(&cfg).await?;
            bibmirror::cache::run_migrations(&pool).await?;
            pool.close().await;
            println!("Cache database initialized successfully.");
        }
        Commands::Sync { stage } => match stage {
            SyncStage::All { full } => {
                let outcome = pipeline::run_all(&cfg, full, progress.as_ref(), &cancel).await?;
                if let Some(cache) = &outcome.cache {
                    println!("sync cache");
                    println!("  collections fetched: {}", cache.collections_fetched);
                    println!("  items fetched: {}", cache.items_fetched);
                    println!("  children dropped: {}", cache.children_dropped);
                    println!("  deleted: {}", cache.deleted);
                }
                if let Some(index) = &outcome.index {
                    println!("sync index");
                    if index.built {
                        println!("  documents: {}", index.documents);
                        println!("  skipped: {}", index.skipped_documents);
                    } else {
                        println!("  unchanged, skipped");
                    }
                }
                if let Some(att) = &outcome.attachments {
                    println!("sync attachments");
                    println!("  checked: {}", att.checked);
                    println!("  downloaded: {}", att.downloaded);
                    println!("  deleted: {}", att.deleted);
                    println!("  failed: {}", att.failed);
                }
                println!("ok");
            }
            SyncStage::Cache { full } => {
                let outcome = pipeline::run_cache_only(&cfg, full, progress.as_ref(), &cancel).await?;
                println!("sync cache");
                println!("  collections fetched: {}", outcome.collections_fetched);
                println!("  items fetched: {}", outcome.items_fetched);
                println!("  children dropped: {}", outcome.children_dropped);
                println!("  deleted: {}", outcome.deleted);
                println!("ok");
            }
            SyncStage::Index => {
                let outcome = pipeline::run_index_only(&cfg, progress.as_ref()).await?;
                println!("sync index");
                if outcome.built {
                    println!("  documents: {}", outcome.documents);
                    println!("  skipped: {}", outcome.skipped_documents);
                } else {
                    println!("  unchanged, skipped");
                }
                println!("ok");
            }
            SyncStage::Attachments => {
                let outcome = pipeline::run_attachments_only(&cfg, progress.as_ref()).await?;
                println!("sync attachments");
                println!("  checked: {}", outcome.checked);
                println!("  downloaded: {}", outcome.downloaded);
                println!("  deleted: {}", outcome.deleted);
                println!("  failed: {}", outcome.failed);
                println!("ok");
            }
        },
        Commands::Search {
            query: terms,
            scope,
            sort,
            facets,
            page,
            page_len,
        } => {
            // Bare `bibm search ""` browses with the first non-relevance
            // sort instead of failing.
            let sort = if terms.trim().is_empty() && sort == "relevance" {
                cfg.search
                    .sorts
                    .iter()
                    .find(|s| *s != "relevance")
                    .cloned()
                    .unwrap_or(sort)
            } else {
                sort
            };
            let request = QueryRequest {
                terms,
                scope,
                sort,
                facet_filters: facets,
                page,
                page_len,
            };
            query::run_search(&cfg, &request).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Clean { scope } => {
            let scope = match scope.as_str() {
                "cache" => CleanScope::Cache,
                "index" => CleanScope::Index,
                "attachments" => CleanScope::Attachments,
                "everything" => CleanScope::Everything,
                other => {
                    return Err(SyncError::Configuration(format!(
                        "unknown clean scope '{}'; use cache, index, attachments, or everything",
                        other
                    ))
                    .into())
                }
            };
            clean::run_clean(&cfg, scope)?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
