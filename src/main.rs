//! # repo-chat CLI
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `repo-chat process` | Clone a repository and ingest it into a Qdrant collection |
//! | `repo-chat chat` | Chat with an ingested collection in the terminal |
//! | `repo-chat serve` | Start the OpenAI-compatible chat server |
//!
//! ## Environment
//!
//! A `.env` file in the working directory is loaded first. `OPENAI_API_KEY`,
//! `OPENAI_API_BASE`, `QDRANT_URL`, `QDRANT_API_KEY`,
//! `QDRANT_COLLECTION_NAME`, `INDEX_BATCH_SIZE` and `LOG_LEVEL` override the
//! config file. `RUST_LOG` takes precedence over `LOG_LEVEL`.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use repo_chat::config::{self, Config};
use repo_chat::fetch::repo_name_from_url;
use repo_chat::ingest::{self, IngestRequest};
use repo_chat::{chat, server};

/// Chat with a source-code repository.
#[derive(Parser)]
#[command(name = "repo-chat", version, about)]
struct Cli {
    /// Path to configuration file (TOML). Optional; every setting has a default.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Clone a repository and ingest its files into a Qdrant collection.
    ///
    /// Re-running against the same collection replaces points instead of
    /// duplicating them.
    Process {
        /// Repository URL to clone.
        #[arg(long)]
        repo_url: String,

        /// File extensions to include, with the leading dot (e.g. `.py .md`).
        /// All extensions when omitted.
        #[arg(long, num_args = 1..)]
        include_file_extensions: Vec<String>,

        /// Collection name. Defaults to the repository name.
        #[arg(long, alias = "qdrant_collection_name")]
        collection_name: Option<String>,

        /// Where to clone the repository.
        #[arg(long, default_value = ".")]
        repo_destination: PathBuf,
    },

    /// Chat with an ingested collection in the terminal.
    Chat {
        #[arg(long, alias = "qdrant_collection_name")]
        collection_name: String,
    },

    /// Start the OpenAI-compatible chat server.
    Serve {
        /// Collection to answer from. Defaults to `QDRANT_COLLECTION_NAME`.
        #[arg(long)]
        collection_name: Option<String>,

        /// Address to bind, e.g. `127.0.0.1:8000`.
        #[arg(long)]
        bind: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let mut cfg = config::load_config(cli.config.as_deref())?;
    cfg.apply_env(|key| std::env::var(key).ok());
    cfg.validate()?;
    init_tracing(&cfg);

    match cli.command {
        Commands::Process {
            repo_url,
            include_file_extensions,
            collection_name,
            repo_destination,
        } => {
            let collection_name =
                collection_name.unwrap_or_else(|| repo_name_from_url(&repo_url));
            if collection_name.is_empty() {
                anyhow::bail!("Cannot derive a collection name from {}", repo_url);
            }
            let request = IngestRequest {
                repo_url,
                extensions: include_file_extensions,
                collection_name,
                destination: repo_destination,
            };
            ingest::run_process(&cfg, request).await?;
        }
        Commands::Chat { collection_name } => {
            chat::run_chat(&cfg, &collection_name).await?;
        }
        Commands::Serve {
            collection_name,
            bind,
        } => {
            if let Some(bind) = bind {
                cfg.server.bind = bind;
            }
            let collection = serve_collection(&cfg, collection_name)?;
            server::run_server(&cfg, &collection).await?;
        }
    }

    Ok(())
}

fn serve_collection(cfg: &Config, flag: Option<String>) -> anyhow::Result<String> {
    flag.or_else(|| cfg.server.collection.clone())
        .context("No collection given: pass --collection-name or set QDRANT_COLLECTION_NAME")
}

/// Logs go to stderr so `process` output on stdout stays clean.
fn init_tracing(cfg: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.log_level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
