//! Appforge build orchestrator service binary.

use anyhow::Result;
use clap::Parser;
use dotenvy::dotenv;
use std::sync::Arc;
use tracing::{info, warn};

use orchestrator::api::{self, AppState};
use orchestrator::builder::Builder;
use orchestrator::config::Config;
use orchestrator::tool::ProcessRunner;

#[derive(Parser, Debug)]
#[clap(name = "orchestrator")]
#[clap(about = "Appforge build orchestrator - AI-assisted web app builds and deployments")]
struct Args {
    /// HTTP listen port
    #[clap(long, env = "PORT", default_value_t = 8092)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    let args = Args::parse();

    monitoring::init_logging()?;

    let mut config = Config::from_env();
    config.port = args.port;
    let config = Arc::new(config);

    info!("Starting Appforge orchestrator");
    info!("Workspace directory: {:?}", config.workspace_dir);
    info!("Starter code directory: {:?}", config.starter_code_dir);

    let db = match &config.database_url {
        Some(url) => Arc::new(state::Database::new(url).await?),
        None => {
            warn!("DATABASE_URL not set; using in-memory SQLite (development only)");
            Arc::new(state::Database::new_in_memory().await?)
        }
    };

    let artifacts = match &config.s3_bucket {
        Some(bucket) => Arc::new(storage::ArtifactStore::s3(bucket.clone()).await?),
        None => Arc::new(storage::ArtifactStore::in_memory()),
    };

    let bus = Arc::new(events::EventBus::connect(config.nats_url.as_deref()).await?);

    let builder = Arc::new(Builder::new(
        config.clone(),
        db.clone(),
        artifacts.clone(),
        bus.clone(),
        Arc::new(ProcessRunner),
    ));

    let router = api::router(AppState {
        config: config.clone(),
        db,
        bus,
        builder,
    });

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("🚀 Listening on {}", addr);

    // No write time-out is configured on the server: the progress stream
    // must be able to stay open for the full build.
    axum::serve(listener, router).await?;

    Ok(())
}
