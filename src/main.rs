//! PBXGate Server: licensing and session admission core.
//!
//! Main entry point that wires all crates together and starts the server.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, fmt};

use pbxgate_core::config::AppConfig;
use pbxgate_core::error::AppError;

#[tokio::main]
async fn main() {
    let env = std::env::var("PBXGATE_ENV").unwrap_or_else(|_| "default".to_string());
    let config = match AppConfig::load(&env) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    init_logging(&config);

    if let Err(e) = run(config).await {
        tracing::error!("Server error: {e}");
        std::process::exit(1);
    }
}

/// Initialize tracing/logging
fn init_logging(config: &AppConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format.as_str() {
        "json" => {
            fmt().json().with_env_filter(filter).with_target(true).init();
        }
        _ => {
            fmt().pretty().with_env_filter(filter).with_target(true).init();
        }
    }
}

/// Main server run function
async fn run(config: AppConfig) -> Result<(), AppError> {
    tracing::info!("Starting PBXGate v{}", env!("CARGO_PKG_VERSION"));

    // ── Step 1: Database connection + migrations ─────────────────
    let db = pbxgate_database::connection::DatabasePool::connect(&config.database).await?;
    pbxgate_database::migration::run_migrations(db.pool()).await?;

    // ── Step 2: Atomic session cache ─────────────────────────────
    let cache = pbxgate_cache::session::connect(&config.cache).await?;

    // ── Step 3: Repositories and stores ──────────────────────────
    let license_store = Arc::new(pbxgate_license::PgLicenseStore::new(
        pbxgate_database::repositories::LicenseRepository::new(db.pool().clone()),
        pbxgate_database::repositories::FingerprintChangeRepository::new(db.pool().clone()),
    ));
    let session_store = Arc::new(pbxgate_session::PgSessionStore::new(
        pbxgate_database::repositories::SessionRepository::new(db.pool().clone()),
    ));

    // ── Step 4: License sync engine ──────────────────────────────
    let fingerprint = Arc::new(pbxgate_license::HostFingerprint::new());
    let master = Arc::new(pbxgate_license::MasterHttpClient::new(&config.license)?);
    let license_engine = Arc::new(pbxgate_license::LicenseSyncEngine::new(
        Arc::clone(&license_store) as Arc<dyn pbxgate_license::LicenseStore>,
        Arc::clone(&master) as Arc<dyn pbxgate_license::MasterApi>,
        fingerprint,
        config.license.clone(),
    ));

    // Prime the license cache; degradation to stale/offline is handled
    // inside the engine, so a failure here only means we start offline.
    match license_engine.sync_from_master().await {
        Ok(record) => tracing::info!(
            master_license_id = %record.master_license_id,
            max_users = record.max_users,
            "License cache primed"
        ),
        Err(e) => tracing::warn!(error = %e, "License cache priming failed"),
    }

    // ── Step 5: Admission controller ─────────────────────────────
    let controller = Arc::new(pbxgate_session::AdmissionController::new(
        Arc::clone(&cache),
        Arc::clone(&session_store) as Arc<dyn pbxgate_session::SessionStore>,
        Arc::clone(&license_engine),
        Arc::clone(&master) as Arc<dyn pbxgate_license::MasterApi>,
        pbxgate_session::SessionTokens::new(&config.auth),
        config.session.clone(),
    ));

    // ── Step 6: Background jobs ──────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut job_handles = Vec::new();

    if config.worker.enabled {
        let reconciler = pbxgate_worker::ReconciliationService::new(
            Arc::clone(&session_store) as Arc<dyn pbxgate_session::SessionStore>,
            Arc::clone(&license_store) as Arc<dyn pbxgate_license::LicenseStore>,
            Arc::clone(&cache),
            config.session.clone(),
            config.license.clone(),
            config.worker.clone(),
        );
        reconciler.startup_recovery().await;

        let reconcile_cancel = shutdown_rx.clone();
        job_handles.push(tokio::spawn(async move {
            reconciler.run(reconcile_cancel).await;
        }));

        let refresh = pbxgate_worker::LicenseRefreshService::new(
            Arc::clone(&license_engine),
            config.license.resync_interval_minutes,
        );
        let refresh_cancel = shutdown_rx.clone();
        job_handles.push(tokio::spawn(async move {
            refresh.run(refresh_cancel).await;
        }));

        tracing::info!("Background jobs started");
    } else {
        tracing::info!("Background jobs disabled");
    }

    // ── Step 7: HTTP server ──────────────────────────────────────
    let shutdown_grace = config.server.shutdown_grace_seconds;
    let addr = format!("{}:{}", config.server.host, config.server.port);

    let app_state = pbxgate_api::AppState {
        config: Arc::new(config),
        controller,
        license_engine,
    };
    let app = pbxgate_api::build_router(app_state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| AppError::internal(format!("Failed to bind {addr}: {e}")))?;

    tracing::info!("PBXGate server listening on {addr}");

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        tracing::info!("Shutdown signal received, starting graceful shutdown...");
        let _ = shutdown_tx.send(true);
    });

    server
        .await
        .map_err(|e| AppError::internal(format!("Server error: {e}")))?;

    // ── Step 8: Wait for background jobs ─────────────────────────
    tracing::info!("Waiting for background jobs to complete...");
    for handle in job_handles {
        let _ = tokio::time::timeout(std::time::Duration::from_secs(shutdown_grace), handle).await;
    }

    db.close().await;
    tracing::info!("PBXGate server shut down gracefully");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
