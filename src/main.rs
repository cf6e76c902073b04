//! # Channel Archive CLI (`arc`)
//!
//! ## Usage
//!
//! ```bash
//! arc --config ./config/archive.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `arc init` | Create the SQLite database and schema |
//! | `arc lurk <channel>` | Local pipeline: export json → ingest → index |
//! | `arc export <channel>` | Remote pipeline: export html → upload → relocate |
//! | `arc ingest [files..]` | Ingest transcripts (pending raw dir when none given) |
//! | `arc index` | Index every unindexed message |
//! | `arc status [--reset]` | Readiness and recent ledger activity |
//! | `arc search "<query>"` | Nearest messages from the vector index |
//! | `arc serve` | Start the HTTP trigger |
//!
//! Secrets are read from the environment; a `.env` file in the working
//! directory is loaded first when present.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use channel_archive::pipeline::PipelineVariant;
use channel_archive::{config, index, ingest, migrate, pipeline, server};

/// Channel Archive: export chat channels, archive them to object storage,
/// and index their messages for search.
#[derive(Parser)]
#[command(name = "arc", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/archive.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database file and schema. Safe to re-run.
    Init,

    /// Run the local pipeline for a channel: export json, ingest, index.
    Lurk {
        channel_id: String,
        #[arg(long)]
        guild: Option<String>,
    },

    /// Run the remote pipeline for a channel: export html, upload, relocate.
    Export {
        channel_id: String,
        /// Defaults to `[chat].guild_id`.
        #[arg(long)]
        guild: Option<String>,
    },

    /// Ingest transcript files into the message store.
    ///
    /// With no files, every pending transcript in the raw export directory is
    /// ingested and moved to `processed/`.
    Ingest { files: Vec<PathBuf> },

    /// Push every unindexed message to the vector index.
    Index,

    /// Show readiness and recent ledger activity.
    Status {
        #[arg(long, default_value_t = 24)]
        window_hours: i64,
        /// Fail jobs left running by an interrupted process.
        #[arg(long)]
        reset: bool,
    },

    /// Search indexed messages.
    Search {
        query: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Start the HTTP trigger server.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("channel_archive=info,arc=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Lurk { channel_id, guild } => {
            pipeline::run_job(&cfg, &channel_id, guild.as_deref(), PipelineVariant::Local)
                .await?;
        }
        Commands::Export { channel_id, guild } => {
            pipeline::run_job(&cfg, &channel_id, guild.as_deref(), PipelineVariant::Remote)
                .await?;
        }
        Commands::Ingest { files } => {
            ingest::run_ingest(&cfg, files).await?;
        }
        Commands::Index => {
            index::run_index(&cfg).await?;
        }
        Commands::Status {
            window_hours,
            reset,
        } => {
            pipeline::run_status(&cfg, window_hours, reset).await?;
        }
        Commands::Search { query, limit } => {
            index::run_search(&cfg, &query, limit).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
