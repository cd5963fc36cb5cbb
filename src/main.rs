//! Crucible - main entry point.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crucible::api::{self, AppState};
use crucible::catalog::Catalog;
use crucible::config::AppConfig;
use crucible::docker::{ContainerDriver, DockerDriver};
use crucible::executor::{AdmissionController, ExecutionStore, Executor, WorkspacePaths};

#[derive(Parser, Debug)]
#[command(name = "crucible")]
#[command(about = "Self-hosted orchestrator for containerised program execution")]
#[command(version)]
struct Args {
    /// Path to the catalog file (default: <base-dir>/config.yaml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory containing program sources and the actions/ hook directory
    #[arg(long)]
    base_dir: Option<PathBuf>,

    /// Port for the REST API
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _ = dotenvy::dotenv();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("crucible=info,tower_http=warn"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = AppConfig::resolve()?;
    if let Some(base_dir) = args.base_dir {
        config.catalog_path = base_dir.join("config.yaml");
        config.host_root = base_dir.clone();
        config.base_dir = base_dir;
    }
    if let Some(catalog_path) = args.config {
        config.catalog_path = catalog_path;
    }
    if let Some(port) = args.port {
        config.listen_port = port;
    }

    let catalog = Arc::new(Catalog::load(&config.catalog_path)?);
    let settings = catalog.snapshot().settings.clone();
    tracing::info!(
        programs = catalog.snapshot().len(),
        max_concurrent = settings.max_concurrent_executions,
        timeout_seconds = settings.timeout_seconds,
        "catalog ready"
    );

    let driver: Arc<dyn ContainerDriver> = Arc::new(DockerDriver::connect()?);
    let store = Arc::new(ExecutionStore::new(config.record_capacity));
    let admission = Arc::new(AdmissionController::new(
        settings.max_concurrent_executions,
    ));
    let executor = Arc::new(Executor::new(
        Arc::clone(&catalog),
        Arc::clone(&driver),
        store,
        admission,
        WorkspacePaths::from(&config),
    ));

    let state = AppState::new(executor, catalog, driver);
    let router = api::router(state);

    let addr: SocketAddr = format!("{}:{}", config.listen_addr, config.listen_port).parse()?;
    tracing::info!("REST API listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
