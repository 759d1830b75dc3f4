use anyhow::Result;
use axum::Router;
use sqlx::sqlite::SqlitePoolOptions;
use std::{fs, path::Path, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;

use services::disk_driver::DiskDriver;
use services::driver::StorageDriver;
use services::hub_service::HubService;

/// How often cache eviction counts are reported.
const EVICTION_REPORT_INTERVAL: Duration = Duration::from_secs(10 * 60);

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::HubConfig::from_env_and_args()?;

    tracing::info!("Starting storage hub with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    let storage_root = Path::new(&cfg.storage_dir).join(&cfg.bucket);
    if !storage_root.exists() {
        fs::create_dir_all(&storage_root)?;
        tracing::info!("Created storage directory at {}", storage_root.display());
    }

    // --- Initialize SQLite connection ---
    let db_url = &cfg.database_url;
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("file:");

    // SQLx will not create the database file or its directory on its own
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(db_path)?;

    let db: Arc<sqlx::Pool<sqlx::Sqlite>> = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await?,
    );

    let read_url_prefix = cfg
        .read_url
        .clone()
        .unwrap_or_else(|| format!("http://{}/read/", cfg.addr()));
    let driver = Arc::new(DiskDriver::new(
        db,
        storage_root,
        read_url_prefix,
        cfg.page_size,
    ));

    // --- Handle migration mode ---
    if migrate {
        driver.ensure_initialized().await?;
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // one-shot init; a failure here terminates the process
    driver.ensure_initialized().await?;

    // --- Initialize core service ---
    let service = HubService::new(cfg.clone(), driver);

    // periodic eviction reporting for the two policy caches
    let reporter = service.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(EVICTION_REPORT_INTERVAL);
        ticker.tick().await; // the first tick fires immediately
        loop {
            ticker.tick().await;
            reporter.report_cache_evictions();
        }
    });

    // --- Build router ---
    let app: Router = routes::routes::routes(cfg.max_file_upload_size_bytes() as usize)
        .with_state(service);

    // --- Start server ---
    let addr = cfg.addr();
    tracing::info!("Hub listening on http://{}", addr);

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
