use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use spt_core::StudentRecord;
use spt_engine::pipeline_from_env;
use spt_store::PgStore;

#[derive(Debug, Parser)]
#[command(name = "spt-cli")]
#[command(about = "Student Platform Tracker command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the ingestion API (and the weekly scheduler when enabled)
    Serve,
    /// Submit one ingestion batch from a roster file and wait for it
    Ingest {
        #[arg(long)]
        file: PathBuf,
    },
    /// Create or upgrade the Postgres schema
    InitDb,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            spt_web::serve_from_env().await?;
        }
        Commands::Ingest { file } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("reading roster {}", file.display()))?;
            let records: Vec<StudentRecord> = serde_json::from_str(&text)
                .with_context(|| format!("parsing roster {}", file.display()))?;

            let pipeline = pipeline_from_env().await?;
            let batch_id = pipeline.orchestrator.submit(records).await?;
            println!("batch {batch_id} submitted");
            pipeline.orchestrator.wait_for(batch_id).await;

            let view = pipeline
                .orchestrator
                .status(batch_id)
                .await?
                .context("batch disappeared after completion")?;
            println!(
                "batch {batch_id} {:?}: {} processed, {} succeeded, {} failed ({} errors)",
                view.status,
                view.progress.processed,
                view.progress.succeeded,
                view.progress.failed,
                view.recent_errors.len()
            );
        }
        Commands::InitDb => {
            let database_url = std::env::var("DATABASE_URL")
                .context("DATABASE_URL must be set for init-db")?;
            let store = PgStore::connect(&database_url).await?;
            store.init_schema().await?;
            println!("Schema ready.");
        }
    }

    Ok(())
}
