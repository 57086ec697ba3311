use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use esg_pipeline::catalog::{CatalogClient, CompanyCatalog};
use esg_pipeline::http::{self, AppState};
use esg_pipeline::jobs::{JobCoordinator, JobKind, JobStatus};
use esg_pipeline::models::Config;
use esg_pipeline::store::RecordStore;

#[derive(Parser)]
#[command(
    name = "esg-pipeline",
    about = "ESG metric aggregation, forecasting and rollup pipeline"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP control plane (default)
    Serve,
    /// Run one aggregation pass and exit
    Aggregate {
        #[arg(long)]
        company_id: Option<i64>,
    },
    /// Run one rollup pass and exit
    Rollup {
        #[arg(long)]
        company_id: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            eprintln!("❌ Configuration Error: {}", e);
            eprintln!("Set CATALOG_URL (and optionally DATABASE_PATH) in the environment or a .env file.");
            std::process::exit(1);
        }
    };

    let store = match RecordStore::new(&config.database_path).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Failed to initialize record store: {}", e);
            eprintln!("❌ Database Error: {}", e);
            std::process::exit(1);
        }
    };

    let catalog: Arc<dyn CompanyCatalog> = match CatalogClient::new(&config.catalog_url) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!("Failed to build catalog client: {}", e);
            eprintln!("❌ Catalog Error: {}", e);
            std::process::exit(1);
        }
    };

    let coordinator = JobCoordinator::new(store.clone(), catalog.clone(), &config);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            let state = AppState {
                store,
                catalog,
                coordinator,
            };
            http::serve(state, config.http_port).await?;
        }
        Command::Aggregate { company_id } => {
            run_once(&coordinator, JobKind::Aggregation, company_id).await;
        }
        Command::Rollup { company_id } => {
            run_once(&coordinator, JobKind::Rollup, company_id).await;
        }
    }

    Ok(())
}

/// Submit a job and block until it finishes; exits non-zero on failure.
async fn run_once(coordinator: &JobCoordinator, kind: JobKind, company_id: Option<i64>) {
    let job_id = match coordinator.submit(kind, company_id) {
        Ok(job_id) => job_id,
        Err(e) => {
            eprintln!("❌ {}", e);
            std::process::exit(1);
        }
    };

    loop {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let Some(info) = coordinator.status(&job_id) else {
            eprintln!("❌ Job {} disappeared from the registry", job_id);
            std::process::exit(1);
        };
        match info.status {
            JobStatus::Running => continue,
            JobStatus::Completed => {
                println!("Processing completed successfully!");
                if let Some(summary) = info.summary {
                    println!(
                        "Summary: {}/{} companies processed successfully ({} records written)",
                        summary.succeeded, summary.total_companies, summary.records_written
                    );
                }
                return;
            }
            JobStatus::Error => {
                eprintln!("❌ {}", info.message);
                std::process::exit(1);
            }
        }
    }
}
