use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use lazyaf::config::Config;
use lazyaf::server;

#[derive(Parser)]
#[command(name = "lazyaf")]
#[command(version, about = "Local-first orchestrator for AI coding agents")]
pub struct Cli {
    /// Data root for the store, bare repos, and snapshots.
    #[arg(long, global = true, env = "LAZYAF_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the orchestrator server.
    Serve {
        #[arg(long, env = "LAZYAF_PORT")]
        port: Option<u16>,
        /// Bind externally and allow any origin (UI development).
        #[arg(long)]
        dev: bool,
    },
    /// Create a repo record and mirror a source into the internal host.
    Ingest {
        /// Human name for the repo.
        name: String,
        /// Local directory or git URL to mirror.
        source: String,
        #[arg(long, default_value = "main")]
        default_branch: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lazyaf=info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }

    match cli.command {
        Commands::Serve { port, dev } => {
            if let Some(port) = port {
                config.port = port;
            }
            if dev {
                config.dev_mode = true;
            }
            server::serve(config).await
        }
        Commands::Ingest {
            name,
            source,
            default_branch,
        } => {
            let state = server::build_state(config).await?;
            let repo = state
                .store
                .create_repo(name, default_branch.clone(), state.config.base_url.clone())
                .await?;
            state.githost.ingest(repo.id, &source, &default_branch).await?;
            let repo = state.store.mark_ingested(repo.id).await?;
            println!("{}", repo.clone_url);
            Ok(())
        }
    }
}
