use quire_core::coordinator::{ChannelLayer, FlushEvent, WriteCoordinator};
use quire_core::crdt::{DocumentStore, SqliteStorage};
use quire_core::history_view::HistoryViewer;
use quire_server::{
    config::Config,
    handlers::{api::ApiState, ws::WsState},
    router,
    sync::RoomRegistry,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "quire_server=debug,quire_core=debug,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!("Starting Quire Server v{}", env!("CARGO_PKG_VERSION"));
    info!("Database path: {:?}", config.database_path);
    info!(
        "Save debounce: {:?}, worker channel: {}",
        config.coordinator.debounce(),
        config.coordinator.worker_channel
    );

    // Initialize database
    let store: Arc<dyn DocumentStore> = match SqliteStorage::open(&config.database_path) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!("Failed to open database: {}", e);
            std::process::exit(1);
        }
    };

    // Start the save worker
    let channels = ChannelLayer::new();
    let receiver = channels.register(&config.coordinator.worker_channel);
    let Some(worker) = channels.sender(&config.coordinator.worker_channel) else {
        error!("Worker channel was not registered");
        std::process::exit(1);
    };
    let mut coordinator = WriteCoordinator::new(store.clone(), config.coordinator.clone());
    let events = coordinator.subscribe();
    tokio::spawn(log_flush_events(events));
    let coordinator_task = tokio::spawn(coordinator.run(receiver));

    // Create handler states
    let api_state = ApiState {
        config: config.clone(),
        store: store.clone(),
        viewer: Arc::new(HistoryViewer::with_defaults(store.clone())),
    };

    let ws_state = WsState {
        config: config.clone(),
        store: store.clone(),
        rooms: Arc::new(RoomRegistry::new()),
        worker,
    };

    let app = router(api_state, ws_state);

    // Create listener
    let addr = config.server_addr();
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    info!("Server listening on http://{}", addr);

    // Run server with graceful shutdown
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("Server error: {}", e);
    }

    // Closing the channel makes the save worker flush every buffer and stop.
    channels.unregister(&config.coordinator.worker_channel);
    match tokio::time::timeout(Duration::from_secs(10), coordinator_task).await {
        Ok(Ok(())) => info!("Save worker flushed pending edits"),
        Ok(Err(e)) => error!("Save worker failed: {}", e),
        Err(_) => warn!("Save worker did not finish in time; some live sessions are still open"),
    }

    info!("Server shut down gracefully");
}

async fn log_flush_events(mut events: tokio::sync::mpsc::UnboundedReceiver<FlushEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            FlushEvent::Persisted {
                document,
                entry_id,
                updates,
                ..
            } => info!("Saved {} updates to {} as entry {}", updates, document, entry_id),
            FlushEvent::Retrying {
                document,
                attempt,
                error,
                ..
            } => warn!("Save of {} failed (attempt {}): {}", document, attempt, error),
            FlushEvent::Failed {
                document, error, ..
            } => error!("Save of {} failed, keeping edits buffered: {}", document, error),
            FlushEvent::Discarded {
                document,
                updates,
                error,
                ..
            } => error!("Dropped {} updates for {}: {}", updates, document, error),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
