//! Membersys - membership records lifecycle service
//!
//! Applications, the approval queue, members, departed members and the
//! archive live as separate namespaces of one wide-column store. Records
//! move between them through atomic stage transitions.
//!
//! The store backend is chosen at startup: an in-process memory store for
//! development, or the PostgreSQL-backed cell table.

mod backend;
mod config;
mod error;
mod membership;
mod metrics;
mod models;
mod password;
mod routes;
mod state;

use crate::backend::{MemoryStore, PostgresStore, StoreBackend};
use crate::config::{Settings, StoreBackendKind};
use crate::routes::create_router;
use crate::state::AppState;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber for structured logging
    init_tracing();
    metrics::init();

    info!("🚀 Starting Membersys...");

    // Load configuration
    let settings = Settings::load()?;
    info!("📋 Configuration loaded successfully");

    let backend = match settings.store.backend {
        StoreBackendKind::Memory => {
            warn!("⚠️  Using the in-memory store; records are lost on shutdown");
            StoreBackend::Memory(MemoryStore::with_tombstone_grace(
                settings.store.tombstone_grace(),
            ))
        }
        StoreBackendKind::Postgres => {
            let store = PostgresStore::connect(&settings.store)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to connect to the record store: {}", e))?;
            info!("✅ Record store connected");
            StoreBackend::Postgres(store)
        }
    };

    let state = Arc::new(AppState::new(backend, &settings));
    info!(
        "🗄️  Backend: {} (archive retention: {} days)",
        state.backend_name, settings.lifecycle.archive_retention_days
    );

    spawn_compaction(state.clone(), settings.store.compaction_interval());

    // Build the router
    let app = create_router(state, &settings);

    // Create socket address
    let addr = SocketAddr::from((settings.server.host, settings.server.port));

    info!("🌐 Server listening on http://{}", addr);
    info!("");
    info!("📚 API Endpoints:");
    info!("   ─── Intake ───");
    info!("   POST  /api/applications                 - Submit an application");
    info!("   PUT   /api/applications/:key/agreement  - Upload the signed agreement");
    info!("");
    info!("   ─── Records ───");
    info!("   GET   /api/:stage                       - List a stage (cursor, limit)");
    info!("   GET   /api/:stage/:key                  - Fetch one record");
    info!("   PATCH /api/:stage/:key                  - Update one field");
    info!("   GET   /api/usernames/:username          - Find a member by username");
    info!("");
    info!("   ─── Transitions ───");
    info!("   POST  /api/applications/:key/approve    - Move to the queue");
    info!("   POST  /api/applications/:key/reject     - Move to the archive");
    info!("   POST  /api/queue/:key/trash             - Archive a queued record");
    info!("   POST  /api/members/:key/trash           - Move a member to dequeue");
    info!("");
    info!("   GET   /health, /status");
    info!("");

    // Create TCP listener and serve
    let listener = TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("👋 Server shutdown complete");
    Ok(())
}

/// Periodically purge expired cells and spent tombstones
fn spawn_compaction(state: Arc<AppState>, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match state.stages.client().compact().await {
                Ok(purged) => debug!(purged, "Store compaction finished"),
                Err(e) => error!("Store compaction failed: {}", e),
            }
        }
    });
}

/// Initialize tracing with structured logging
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,membersys=debug,tower_http=debug"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .compact(),
        )
        .init();
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("📴 Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            info!("📴 Received terminate signal, initiating graceful shutdown...");
        },
    }
}
