use caresync::config::CONFIG;
use caresync::orchestrator::{SyncOrchestratorHandle, spawn_poller};
use caresync::provider::{CalendarApi, GoogleCalendarClient, TokenSource, build_http_client};
use caresync::server::{CareSyncState, caresync_router};
use caresync::sync::{EntityStore, SyncService};
use caresync::watch::{WatchManager, spawn_renewer};
use mimalloc::MiMalloc;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::{net::TcpListener, signal};
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = &*CONFIG;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.basic.loglevel.clone()));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_level(true)
                .with_target(false),
        )
        .init();

    info!(
        database_url = %cfg.basic.database_url,
        api_url = %cfg.provider.api_url,
        proxy = %cfg.provider.proxy.as_ref().map(|u| u.as_str()).unwrap_or("<none>"),
        webhook_url = %cfg.watch.webhook_url.as_ref().map(|u| u.as_str()).unwrap_or("<none>"),
        polling = cfg.polling_enabled(),
        loglevel = %cfg.basic.loglevel,
        listen_addr = %cfg.basic.listen_addr,
        listen_port = cfg.basic.listen_port,
        "caresync starting"
    );

    let db = caresync::db::spawn(&cfg.basic.database_url).await;
    let http = build_http_client(&cfg.provider);
    let api: Arc<dyn CalendarApi> = Arc::new(GoogleCalendarClient::new(&cfg.provider, http.clone()));
    let store: Arc<dyn EntityStore> = Arc::new(db.clone());
    let tokens = TokenSource::new(db.clone(), &cfg.provider, http)?;

    let watch = WatchManager::new(
        api.clone(),
        db.clone(),
        tokens.clone(),
        cfg.watch.clone(),
        cfg.sync.debounce(),
    );
    let mut service = SyncService::new(
        api,
        db.clone(),
        store,
        tokens,
        &cfg.sync,
        &cfg.managed_calendar,
    );
    if cfg.watch.is_deliverable() {
        service = service.with_watch(watch.clone());
        spawn_renewer(watch.clone());
    }

    let orchestrator = SyncOrchestratorHandle::spawn(Arc::new(service.clone()), &cfg.sync).await?;
    if cfg.polling_enabled() {
        spawn_poller(db, Arc::new(orchestrator.clone()), &cfg.sync);
    }

    let state = CareSyncState::new(
        service,
        orchestrator,
        watch,
        Arc::from(cfg.basic.caresync_key.as_str()),
    );
    let app = caresync_router(state);

    let addr = SocketAddr::from((cfg.basic.listen_addr, cfg.basic.listen_port));
    let listener = TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("Server has shut down gracefully.");
    Ok(())
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
}
