mod api;
mod metrics;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hotfolder_core::format::FormatRegistry;
use hotfolder_core::platform::PlatformRegistry;
use hotfolder_core::{
    build_transition_table, load_config, validate_config, HotFolderIngest, PackageStateMachine,
    PipelineContext, PublishScheduler, SqlitePackageStore, WatchError, WatchRegistry,
};

use api::create_router;
use state::AppState;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Determine config path
    let config_path = std::env::var("HOTFOLDER_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.toml"));

    info!("Loading configuration from {:?}", config_path);
    let config = load_config(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;
    validate_config(&config).context("Configuration validation failed")?;

    info!("Configuration loaded successfully");
    info!("Database path: {:?}", config.database.path);

    let store = Arc::new(
        SqlitePackageStore::new(&config.database.path).context("Failed to open package store")?,
    );
    info!("Package store initialized");

    let platforms = Arc::new(
        PlatformRegistry::from_config(&config.platforms)
            .context("Failed to create platform clients")?,
    );
    info!("Platforms: {:?}", platforms.names());

    let formats = Arc::new(FormatRegistry::with_defaults());
    let ctx = Arc::new(PipelineContext::new(
        config.pipeline.clone(),
        formats,
        Arc::clone(&platforms),
    ));
    let table = build_transition_table(ctx).context("Invalid transition table")?;
    let machine = Arc::new(PackageStateMachine::new(
        table,
        store,
        config.machine.clone(),
    ));
    let scheduler = PublishScheduler::new(config.scheduler.clone(), machine, platforms);

    // Crash recovery: resume everything that was mid-flight.
    let resumed = scheduler
        .retry_all()
        .context("Failed to resume interrupted packages")?;
    info!("Resumed {} interrupted package(s)", resumed);

    let (watches, events) = WatchRegistry::new(config.watcher.clone());
    let watches = Arc::new(watches);
    let ingest = HotFolderIngest::new(config.hot_folders.clone(), scheduler.clone());
    let ingest_handle = tokio::spawn(ingest.run(events));

    let roots: Vec<PathBuf> = config
        .hot_folders
        .iter()
        .map(|folder| folder.path.clone())
        .collect();
    let outcomes = watches.add(roots).await;
    // A hot folder nested in another one is watched through it.
    let failed = outcomes
        .iter()
        .filter(|o| matches!(&o.result, Err(e) if !matches!(e, WatchError::AlreadyWatched(_))))
        .count();
    if failed > 0 {
        warn!(
            "{} of {} hot folder(s) could not be watched",
            failed,
            outcomes.len()
        );
    } else {
        info!("Watching {} hot folder(s)", outcomes.len());
    }

    let state = Arc::new(AppState::new(
        config.clone(),
        scheduler,
        Arc::clone(&watches),
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
    let removed = watches.remove(None).await;
    info!("Stopped watching {} hot folder(s)", removed.len());

    ingest_handle.abort();

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
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
