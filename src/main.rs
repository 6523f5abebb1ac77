//! # Feedback Harness CLI (`fbx`)
//!
//! ## Usage
//!
//! ```bash
//! fbx --config ./config/fbx.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `fbx init` | Create the SQLite database and record the dedup settings |
//! | `fbx ingest <file>` | Deduplicate analyzer output (JSON Lines) into the knowledge base |
//! | `fbx search [query]` | Ranked search with category/severity/frequency/status filters |
//! | `fbx get <id>` | Show one opportunity and its provenance |
//! | `fbx items` | List ingested content items |
//! | `fbx status <id> <status>` | Move an opportunity through the workflow |
//! | `fbx comment <id> <text>` | Replace an opportunity's comments |
//! | `fbx stats` | Totals and breakdowns |
//! | `fbx history` | Recent ingestion runs |
//! | `fbx serve` | Start the JSON HTTP API |

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use feedback_harness::ingest::{self, IngestOptions};
use feedback_harness::kb::KnowledgeBase;
use feedback_harness::search::{self, SearchOptions};
use feedback_harness::sqlite_store::ContentItemFilter;
use feedback_harness::{config, embedding, get, items, logging, migrate, server, stats};
use feedback_harness_core::models::{Category, ContentType, Severity, Status};
use feedback_harness_core::store::parse_time_bound;
use feedback_harness_core::KbError;

/// Feedback Harness: deduplicate and search AI-extracted customer
/// feedback opportunities.
#[derive(Parser)]
#[command(name = "fbx", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/fbx.toml")]
    config: PathBuf,

    /// Only log errors.
    #[arg(long, short, global = true)]
    quiet: bool,

    /// Log debug output (merge decisions) to stderr.
    #[arg(long, short, global = true, conflicts_with = "quiet")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema and record the dedup settings.
    ///
    /// Idempotent; re-running updates the settings record.
    Init,

    /// Ingest a JSON Lines file of analyzer output.
    ///
    /// Each line is `{"item": {...}, "opportunities": [...]}`.
    Ingest {
        /// Path to the `.jsonl` file.
        file: PathBuf,

        /// Parse and validate without writing to the database.
        #[arg(long)]
        dry_run: bool,

        /// Ingest candidates even if they were ingested before.
        #[arg(long)]
        reingest: bool,
    },

    /// Search canonical opportunities.
    ///
    /// Results are ordered by severity, then frequency, then text match.
    Search {
        /// Free-text query; omit to list everything.
        #[arg(default_value = "")]
        query: String,

        /// pain_point, improvement_opportunity, or feature_request.
        #[arg(long)]
        category: Option<Category>,

        /// low, medium, high, or critical.
        #[arg(long)]
        min_severity: Option<Severity>,

        #[arg(long)]
        min_frequency: Option<u32>,

        /// new, in_progress, blocked, solved, or discarded.
        #[arg(long)]
        status: Option<Status>,

        /// Still reported on or after this date (YYYY-MM-DD or RFC 3339).
        #[arg(long, value_parser = parse_since)]
        since: Option<DateTime<Utc>>,

        /// First reported on or before this date (YYYY-MM-DD or RFC 3339).
        #[arg(long, value_parser = parse_until)]
        until: Option<DateTime<Utc>>,

        #[arg(long)]
        limit: Option<usize>,

        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// List ingested content items, most recently recorded first.
    Items {
        /// conversation, ticket, or suggestion.
        #[arg(long = "type")]
        content_type: Option<ContentType>,

        #[arg(long)]
        customer: Option<String>,

        #[arg(long)]
        source_file: Option<String>,

        #[arg(long)]
        limit: Option<i64>,

        #[arg(long)]
        json: bool,
    },

    /// Show one opportunity with its provenance.
    Get {
        id: String,

        #[arg(long)]
        json: bool,
    },

    /// Set the workflow status of an opportunity.
    Status {
        id: String,
        /// new, in_progress, blocked, solved, or discarded.
        status: String,
    },

    /// Replace the comments on an opportunity.
    Comment { id: String, text: String },

    /// Show knowledge base statistics.
    Stats {
        #[arg(long)]
        json: bool,
    },

    /// Show recent ingestion runs.
    History {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },

    /// Start the HTTP API on `[server].bind`.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.quiet, cli.verbose)?;

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            let kb = KnowledgeBase::open(&cfg).await?;
            let result = kb
                .record_settings(
                    cfg.dedup.max_opportunities_per_input,
                    &embedding_model_label(&cfg.embedding),
                )
                .await;
            kb.close().await;
            result?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest {
            file,
            dry_run,
            reingest,
        } => {
            ingest::run_ingest(&cfg, &file, IngestOptions { dry_run, reingest }).await?;
        }
        Commands::Search {
            query,
            category,
            min_severity,
            min_frequency,
            status,
            since,
            until,
            limit,
            json,
        } => {
            let opts = SearchOptions {
                category,
                min_severity,
                min_frequency,
                status,
                since,
                until,
                limit,
                json,
            };
            search::run_search(&cfg, &query, &opts).await?;
        }
        Commands::Items {
            content_type,
            customer,
            source_file,
            limit,
            json,
        } => {
            let filter = ContentItemFilter {
                content_type,
                customer_id: customer,
                source_file,
                limit,
            };
            items::run_items(&cfg, &filter, json).await?;
        }
        Commands::Get { id, json } => {
            get::run_get(&cfg, &id, json).await?;
        }
        Commands::Status { id, status } => {
            get::run_set_status(&cfg, &id, &status).await?;
        }
        Commands::Comment { id, text } => {
            get::run_set_comments(&cfg, &id, &text).await?;
        }
        Commands::Stats { json } => {
            stats::run_stats(&cfg, json).await?;
        }
        Commands::History { limit } => {
            stats::run_history(&cfg, limit).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}

fn parse_since(value: &str) -> Result<DateTime<Utc>, KbError> {
    parse_time_bound(value, false)
}

fn parse_until(value: &str) -> Result<DateTime<Utc>, KbError> {
    parse_time_bound(value, true)
}

/// Model name recorded in `kb_settings`.
fn embedding_model_label(cfg: &config::EmbeddingConfig) -> String {
    match (cfg.provider.as_str(), &cfg.model) {
        (_, Some(model)) => model.clone(),
        ("local", None) => embedding::local_model_name(cfg),
        (provider, None) => provider.to_string(),
    }
}
