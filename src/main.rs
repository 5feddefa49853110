//! # fometa CLI
//!
//! The `fometa` binary is the primary interface to the metadata cache. It
//! provides commands for database initialization, one-shot synchronization,
//! ranked search, record retrieval, and starting the HTTP tool server with
//! background sync.
//!
//! ## Usage
//!
//! ```bash
//! fometa --config ./config/fometa.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `fometa init` | Create the SQLite cache and run schema migrations |
//! | `fometa sync` | Fetch and parse `$metadata` once, in the foreground |
//! | `fometa search <pattern>` | Ranked name search over cached records |
//! | `fometa get <kind> <name>` | Print one record as JSON |
//! | `fometa status` | Cache counts and last successful sync |
//! | `fometa serve` | Start background sync and the HTTP tool server |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use fometa::auth::{ClientCredentialsExchange, TokenManager};
use fometa::client::{DocumentSource, ResilientClient};
use fometa::config;
use fometa::models::RecordKind;
use fometa::server;
use fometa::store::MetadataStore;
use fometa::sync::{self, SyncScheduler};

/// fometa — a local-first metadata cache and tool server for Dynamics 365
/// Finance & Operations.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/fometa.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "fometa",
    about = "fometa — local-first metadata cache and tool server for Dynamics 365 F&O",
    version,
    long_about = "fometa pulls the OData $metadata document from a Dynamics 365 Finance & \
    Operations instance, normalizes it into a local SQLite cache, and serves ranked entity, \
    field, relationship, and enumeration lookups via a CLI and a JSON HTTP tool API."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/fometa.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the cache database schema.
    ///
    /// Creates the SQLite file and all required tables. Idempotent.
    Init,

    /// Fetch and parse the metadata document once, in the foreground.
    ///
    /// Performs a full sync cycle (authenticate, download `$metadata`,
    /// parse, store) and prints a summary. Exits non-zero if the cycle
    /// fails.
    Sync,

    /// Search cached records by name.
    ///
    /// Exact name matches rank first, then name prefixes, then name
    /// substrings, then label substrings.
    Search {
        /// The search pattern.
        pattern: String,

        /// Record kind: `entity`, `field`, `relationship`, or `enum`.
        #[arg(long, default_value = "entity")]
        kind: String,

        /// Maximum number of results to return.
        #[arg(long, default_value_t = 25)]
        limit: i64,

        /// Number of results to skip, for paging.
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },

    /// Print one cached record as JSON.
    ///
    /// Field and relationship names are qualified: `CustGroup.PaymentTerm`,
    /// `CustGroup.Customers`.
    Get {
        /// Record kind: `entity`, `field`, `relationship`, or `enum`.
        kind: String,

        /// Record name.
        name: String,
    },

    /// Show cache counts and the last successful sync time.
    Status,

    /// Start the background sync scheduler and the HTTP tool server.
    ///
    /// The first sync cycle begins immediately; the server answers from the
    /// cache and returns `not_ready` until the cache holds data.
    Serve,
}

fn parse_kind(s: &str) -> anyhow::Result<RecordKind> {
    RecordKind::parse(s)
        .ok_or_else(|| anyhow::anyhow!("unknown record kind: {} (expected entity, field, relationship, or enum)", s))
}

fn document_source(cfg: &config::Config) -> anyhow::Result<ResilientClient> {
    let exchange = Arc::new(ClientCredentialsExchange::from_config(cfg)?);
    let tokens = Arc::new(TokenManager::new(exchange));
    ResilientClient::new(cfg, tokens)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("fometa=info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let store = MetadataStore::open(&cfg).await?;
            store.close().await;
            println!("Cache database initialized successfully.");
        }
        Commands::Sync => {
            let store = MetadataStore::open(&cfg).await?;
            let client = document_source(&cfg)?;

            let summary = sync::run_once(&client, &store, cfg.cache.batch_size).await?;
            println!(
                "Synced {} entities, {} fields, {} relationships, {} enums in {} batches.",
                summary.entities,
                summary.fields,
                summary.relationships,
                summary.enums,
                summary.batches
            );
            for warning in &summary.warnings {
                println!("  warning: {}: {}", warning.context, warning.reason);
            }
            store.close().await;
        }
        Commands::Search {
            pattern,
            kind,
            limit,
            offset,
        } => {
            let store = MetadataStore::open(&cfg).await?;
            let page = store.search(parse_kind(&kind)?, &pattern, limit, offset).await?;

            if page.hits.is_empty() {
                println!("No results.");
            } else {
                for (i, hit) in page.hits.iter().enumerate() {
                    match &hit.label {
                        Some(label) => println!(
                            "{:>3}. {:<44} {}",
                            offset + i as i64 + 1,
                            hit.name,
                            label
                        ),
                        None => println!("{:>3}. {}", offset + i as i64 + 1, hit.name),
                    }
                }
                println!(
                    "Showing {}-{} of {} matches.",
                    offset + 1,
                    offset + page.hits.len() as i64,
                    page.total
                );
            }
            store.close().await;
        }
        Commands::Get { kind, name } => {
            let store = MetadataStore::open(&cfg).await?;
            match store.get(parse_kind(&kind)?, &name).await? {
                Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
                None => anyhow::bail!("no {} named {}", kind, name),
            }
            store.close().await;
        }
        Commands::Status => {
            let store = MetadataStore::open(&cfg).await?;
            let counts = store.counts().await?;
            println!("Entities:      {}", counts.entities);
            println!("Fields:        {}", counts.fields);
            println!("Relationships: {}", counts.relationships);
            println!("Enums:         {}", counts.enums);
            match store.last_successful_sync().await? {
                Some(at) => println!("Last sync:     {}", at.to_rfc3339()),
                None => println!("Last sync:     never"),
            }
            store.close().await;
        }
        Commands::Serve => {
            let store = Arc::new(MetadataStore::open(&cfg).await?);
            let client: Arc<dyn DocumentSource> = Arc::new(document_source(&cfg)?);

            let scheduler = Arc::new(SyncScheduler::spawn(
                client,
                store.clone(),
                cfg.cache.batch_size,
                cfg.sync.clone(),
            ));

            server::run_server(&cfg, store, scheduler).await?;
        }
    }

    Ok(())
}
