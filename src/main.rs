//! # Telemikiya CLI (`telemikiya`)
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `telemikiya db migrate` | Create or update the PostgreSQL schema |
//! | `telemikiya ingest` | Record JSON-lines chat events |
//! | `telemikiya index` | Embed pending messages until interrupted |
//! | `telemikiya run` | Ingest and index together |
//! | `telemikiya search <keywords>` | Hybrid search over recorded messages |
//!
//! ## Examples
//!
//! ```bash
//! # Change embedding dimensions; existing embeddings are discarded
//! telemikiya db migrate --allow-clear-embedding
//!
//! # Search one dialog within a time range
//! telemikiya search deploy failed --dialog-id -1001234567890 \
//!     --start-time "2024-01-01 00:00:00" --end-time "2024-02-01 00:00:00"
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use telemikiya::config::{self, Config};
use telemikiya::embedding::{verify_dimensions, ProviderRegistry};
use telemikiya::indexer::{Indexer, IndexerHandle};
use telemikiya::pg_store::PgStore;
use telemikiya::recorder::Recorder;
use telemikiya::{db, ingest, migrate, search};
use telemikiya_core::store::Store;

/// Telemikiya: record chat messages and search them semantically.
#[derive(Parser)]
#[command(name = "telemikiya", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/telemikiya.toml")]
    config: PathBuf,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database management.
    Db {
        #[command(subcommand)]
        action: DbAction,
    },

    /// Search recorded messages.
    Search {
        /// Search keywords, joined with spaces.
        #[arg(required = true)]
        keywords: Vec<String>,

        /// Maximum number of results.
        #[arg(long, short = 'n')]
        count: Option<usize>,

        /// Only messages sent at or after this time (YYYY-MM-DD HH:MM:SS, UTC).
        #[arg(long)]
        start_time: Option<String>,

        /// Only messages sent at or before this time (YYYY-MM-DD HH:MM:SS, UTC).
        #[arg(long)]
        end_time: Option<String>,

        /// Only messages from this dialog.
        #[arg(long, allow_hyphen_values = true)]
        dialog_id: Option<i64>,
    },

    /// Embed pending messages until interrupted.
    Index,

    /// Record chat events read as JSON lines.
    Ingest {
        /// Event file; stdin when absent or `-`.
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Record events and embed them in the background until interrupted.
    Run {
        /// Event file; stdin when absent or `-`.
        #[arg(long)]
        file: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum DbAction {
    /// Create or update tables and indexes.
    Migrate {
        /// Permit discarding all embeddings when the dimensions change.
        #[arg(long)]
        allow_clear_embedding: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if cli.debug {
            "telemikiya=debug,telemikiya_core=debug"
        } else {
            "info"
        })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Db {
            action: DbAction::Migrate {
                allow_clear_embedding,
            },
        } => {
            migrate::run_migrations(&cfg, allow_clear_embedding).await?;
        }
        Commands::Search {
            keywords,
            count,
            start_time,
            end_time,
            dialog_id,
        } => {
            search::run_search(&cfg, &keywords, count, start_time, end_time, dialog_id).await?;
        }
        Commands::Index => {
            let (_, indexer) = build_indexer(&cfg).await?;
            let handle = IndexerHandle::start(indexer);
            tokio::signal::ctrl_c().await?;
            let stats = handle.stop().await?;
            print!("{}", stats);
        }
        Commands::Ingest { file } => {
            let pool = db::connect(&cfg).await?;
            let store: Arc<dyn Store> = Arc::new(PgStore::new(pool.clone()));
            let recorder = Arc::new(Recorder::from_config(store, &cfg));
            ingest_until_interrupted(recorder, file.as_deref()).await?;
            pool.close().await;
        }
        Commands::Run { file } => {
            let (store, indexer) = build_indexer(&cfg).await?;
            let handle = IndexerHandle::start(indexer);
            let recorder = Arc::new(Recorder::from_config(store, &cfg));
            if !ingest_until_interrupted(recorder, file.as_deref()).await? {
                tracing::info!("event stream ended; indexing until interrupted");
                tokio::signal::ctrl_c().await?;
            }
            let stats = handle.stop().await?;
            print!("{}", stats);
        }
    }

    Ok(())
}

/// Ingest until the stream ends or Ctrl-C arrives. Events already read
/// are recorded either way. Returns whether Ctrl-C stopped the stream.
async fn ingest_until_interrupted(recorder: Arc<Recorder>, file: Option<&Path>) -> Result<bool> {
    let (stop, shutdown) = watch::channel(false);
    let ingest = ingest::run_ingest(recorder, file, shutdown);
    tokio::pin!(ingest);

    tokio::select! {
        r = &mut ingest => {
            r?;
            Ok(false)
        }
        r = tokio::signal::ctrl_c() => {
            r?;
            tracing::info!("interrupted; finishing events already read");
            stop.send_replace(true);
            ingest.await?;
            Ok(true)
        }
    }
}

/// Provider first, so a bad provider name fails before any database work.
async fn build_indexer(cfg: &Config) -> Result<(Arc<dyn Store>, Indexer)> {
    let provider = ProviderRegistry::builtin().create(cfg)?;
    verify_dimensions(provider.as_ref()).await?;
    let pool = db::connect(cfg).await?;
    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool));
    let indexer = Indexer::from_config(store.clone(), provider, cfg);
    Ok((store, indexer))
}
