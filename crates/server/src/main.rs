use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fleetguard_core::{
    create_audit_system, load_config, validate_config, AuditEvent, AuditStore, DeviceTransport,
    HttpTransport, JobLedger, SnapshotStore, SqliteAuditStore, SqliteJobLedger,
    SqliteSnapshotStore, StaticDeviceDirectory, TaskDispatcher,
};

use fleetguard_server::{api::create_router, state::AppState};

/// Application version
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Buffer size for audit event channel
const AUDIT_BUFFER_SIZE: usize = 1000;

/// How long to wait for queued audit events on shutdown.
const AUDIT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = std::env::var("FLEETGUARD_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.toml"));

    info!("Loading configuration from {:?}", config_path);
    let config = load_config(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;
    validate_config(&config).context("Configuration validation failed")?;

    info!("Configuration loaded successfully");
    info!("Database path: {:?}", config.database.path);
    info!("Device gateway: {}", config.transport.gateway_url);
    info!("{} devices in inventory", config.devices.len());

    // Hash of the sanitized config, recorded with ServiceStarted
    let config_json =
        serde_json::to_string(&fleetguard_core::SanitizedConfig::from(&config)).unwrap_or_default();
    let config_hash = format!("{:x}", Sha256::digest(config_json.as_bytes()));
    let config_hash_short = &config_hash[..16];

    let audit_store: Arc<dyn AuditStore> = Arc::new(
        SqliteAuditStore::new(&config.database.path).context("Failed to create audit store")?,
    );
    let ledger: Arc<dyn JobLedger> = Arc::new(
        SqliteJobLedger::new(&config.database.path).context("Failed to create job ledger")?,
    );
    let snapshots: Arc<dyn SnapshotStore> = Arc::new(
        SqliteSnapshotStore::new(&config.database.path, config.snapshots.repository_path.clone())
            .context("Failed to create snapshot store")?,
    );
    info!(
        "Stores initialized (snapshot repository at {:?})",
        config.snapshots.repository_path
    );

    let (audit_handle, audit_writer) =
        create_audit_system(Arc::clone(&audit_store), AUDIT_BUFFER_SIZE);
    let writer_handle = tokio::spawn(audit_writer.run());

    audit_handle
        .emit(AuditEvent::ServiceStarted {
            version: VERSION.to_string(),
            config_hash: config_hash_short.to_string(),
        })
        .await;

    let transport: Arc<dyn DeviceTransport> = Arc::new(
        HttpTransport::new(config.transport.clone())
            .context("Failed to create device transport")?,
    );
    let devices = Arc::new(StaticDeviceDirectory::new(config.devices.clone()));

    let dispatcher = Arc::new(TaskDispatcher::new(
        config.dispatcher.clone(),
        ledger,
        snapshots,
        devices,
        transport,
        config.commit_confirm.clone(),
        config.upgrade.clone(),
        Some(audit_handle.clone()),
    ));

    let recovered = dispatcher
        .recover_interrupted()
        .await
        .context("Failed to recover interrupted jobs")?;
    if !recovered.is_empty() {
        warn!(
            "{} jobs were interrupted by the last shutdown and marked failed",
            recovered.len()
        );
    }

    dispatcher.start().await;
    info!("Task dispatcher started");

    let state = Arc::new(AppState::new(
        config.clone(),
        Arc::clone(&dispatcher),
        audit_store,
    ));
    let app = create_router(state);

    let addr = SocketAddr::new(config.server.host, config.server.port);
    info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shutting down...");
    dispatcher.stop().await;
    let open = dispatcher.status().open_confirm_windows;
    if !open.is_empty() {
        // The device reverts these on its own once the window expires.
        warn!(jobs = ?open, "Shutting down with unconfirmed changes");
    }

    audit_handle
        .emit(AuditEvent::ServiceStopped {
            reason: "graceful_shutdown".to_string(),
        })
        .await;

    // The writer exits once every AuditHandle clone is gone; in-flight jobs
    // may still hold one, so the drain is bounded.
    drop(dispatcher);
    drop(audit_handle);
    if tokio::time::timeout(AUDIT_DRAIN_TIMEOUT, writer_handle)
        .await
        .is_err()
    {
        warn!("Audit writer did not drain in time");
    } else {
        info!("Audit writer stopped");
    }

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
