use anyhow::Result;
use axum::Router;
use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};
use std::{fs, io::ErrorKind, path::Path, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod events;
mod handlers;
mod models;
mod routes;
mod services;
mod state;

use config::AppConfig;
use events::EventSender;
use services::bridge::{BridgeConfig, NotificationBridge};
use services::queue_service::{QueueConfig, QueueService};
use services::storage_service::{StorageConfig, StorageService, UploadStore};
use state::AppState;

/// Embedded schema, shared by the `--migrate` mode and the test suites.
const MIGRATIONS: &str = include_str!("../migrations/0001_init.sql");

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + run modes ---
    let (cfg, modes) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting image-pipeline with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    let db_url = &cfg.database_url;
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    // Create parent directory if needed
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    // Make sure the database file can be created before SQLx connects
    match fs::OpenOptions::new().create(true).write(true).open(db_path) {
        Ok(_) => tracing::debug!("Database file can be created/opened successfully."),
        Err(e) => tracing::warn!("Failed to open database file manually: {}", e),
    }

    let db: Arc<SqlitePool> = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await?,
    );

    // --- Handle migration mode ---
    if modes.migrate {
        run_migrations(&db).await?;
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Initialize components: store -> event channel -> bridge -> queue ---
    let (event_tx, event_rx) = EventSender::channel();
    let storage = StorageService::new(
        db.clone(),
        StorageConfig {
            bucket: cfg.bucket.clone(),
            root: cfg.storage_dir.clone().into(),
            versioning_enabled: cfg.versioning_enabled,
            teardown_policy: cfg.teardown_policy,
        },
        event_tx,
    );

    // --- Handle teardown mode ---
    if modes.teardown {
        let removed = storage.teardown().await?;
        tracing::info!("Teardown complete ({} versions removed).", removed);
        return Ok(());
    }

    let queue = QueueService::new(
        db,
        QueueConfig {
            visibility_timeout: Duration::from_secs(cfg.visibility_timeout_secs),
            retention: Duration::from_secs(cfg.retention_secs),
        },
    );
    let _sweeper = queue.spawn_retention_sweeper();
    let _bridge = NotificationBridge::spawn(
        event_rx,
        queue.clone(),
        BridgeConfig {
            max_attempts: cfg.bridge_max_attempts,
            base_backoff: Duration::from_millis(cfg.bridge_backoff_ms),
        },
    );

    let app_state = AppState {
        uploads: UploadStore::new(storage.clone()),
        storage,
        queue,
    };

    // --- Build router ---
    let app: Router = routes::routes::routes(cfg.max_upload_bytes).with_state(app_state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}

/// Run the embedded schema statements.
pub(crate) async fn run_migrations(db: &SqlitePool) -> Result<()> {
    let statements = MIGRATIONS
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    tracing::debug!("Running {} migration statements...", statements.len());

    for stmt in statements {
        sqlx::query(stmt).execute(db).await?;
    }

    Ok(())
}
