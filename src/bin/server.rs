//! EMG C3D Analyzer Server
//!
//! Binds the webhook ingestion API and starts the background worker pool.

use emg_c3d_analyzer::cache::AnalyticsCache;
use emg_c3d_analyzer::clinical::{ProcessorServices, TherapySessionProcessor};
use emg_c3d_analyzer::config::Settings;
use emg_c3d_analyzer::db;
use emg_c3d_analyzer::queue::{spawn_workers, TaskQueue};
use emg_c3d_analyzer::server::{create_router, AppState};
use emg_c3d_analyzer::storage::ObjectStorage;
use emg_c3d_analyzer::webhooks::{EventDeduplicator, WebhookSecurity};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,emg_c3d_analyzer=debug".into()),
        )
        .init();

    let settings = Settings::from_env();

    // Make sure the spool/database directory exists for file-backed SQLite.
    if let Some(parent) = settings.data_dir.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    std::fs::create_dir_all(&settings.data_dir).ok();

    info!("initializing database at {}", settings.database_url);
    let pool = db::init_db(&settings.database_url).await?;
    db::clinical::ensure_default_configuration(&pool).await?;

    let cache = Arc::new(AnalyticsCache::new(
        pool.clone(),
        Duration::from_secs(settings.cache_ttl_secs),
        settings.cache_max_entries,
    ));
    let storage = ObjectStorage::http(&settings.storage_base_url);

    let processor = Arc::new(TherapySessionProcessor::new(ProcessorServices {
        pool: pool.clone(),
        storage,
        cache,
        settings: settings.clone(),
    }));

    // Background queue and worker pool.
    let (queue, rx) = TaskQueue::new(settings.queue_depth);
    let workers = spawn_workers(
        &queue,
        rx,
        settings.worker_count,
        Duration::from_secs(settings.processing_timeout_secs),
        processor.clone(),
    );
    info!(
        workers = workers.len(),
        queue_depth = settings.queue_depth,
        "background processing started"
    );

    let state = AppState {
        processor,
        queue,
        security: Arc::new(WebhookSecurity::new(settings.webhook_secret.clone())),
        dedup: Arc::new(EventDeduplicator::default()),
    };
    let app = create_router(state);

    info!("🚀 EMG analyzer server starting on http://{}", settings.bind_addr);
    let listener = tokio::net::TcpListener::bind(&settings.bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
