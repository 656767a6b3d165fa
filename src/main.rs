//! AP Tracker Back binary entrypoint wiring storage, room pollers, push and the status API.

use std::{env, net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ap_tracker_back::{
    config::{AppConfig, StorageBackend},
    dao::{
        storage::StorageError,
        tracker_store::{TrackerStore, memory::MemoryTrackerStore},
    },
    push::{FcmTransport, LogTransport, PushTransport},
    remote::ArchipelagoClient,
    routes,
    services::{poller_supervisor::PollerSupervisor, storage_supervisor},
    state::{AppState, SharedState},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = AppConfig::load();
    let remote = ArchipelagoClient::new(&config.remote).context("building room API client")?;
    let transport = build_transport(&config);
    let app_state = AppState::new(config, Arc::new(remote), transport);

    spawn_storage_supervisor(app_state.clone());
    tokio::spawn(PollerSupervisor::new(app_state.clone()).run());

    // Build the HTTP router once the shared state is ready.
    let app = build_router(app_state);

    let port = env::var("PORT")
        .or_else(|_| env::var("SERVER_PORT"))
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "starting server");

    let listener = TcpListener::bind(addr).await.context("binding server")?;
    let service = app.into_make_service();
    axum::serve(listener, service)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving axum")?;

    Ok(())
}

/// FCM when a project and a service account are configured, log-only otherwise.
fn build_transport(config: &AppConfig) -> Arc<dyn PushTransport> {
    let Some(project_id) = config.push.fcm_project_id.as_deref() else {
        info!("no FCM project configured; notifications will only be logged");
        return Arc::new(LogTransport);
    };

    match FcmTransport::from_service_account(&config.push, project_id) {
        Ok(transport) => {
            info!(project_id, "push notifications enabled");
            Arc::new(transport)
        }
        Err(err) => {
            warn!(error = %err, "FCM unavailable; notifications will only be logged");
            Arc::new(LogTransport)
        }
    }
}

/// Start the storage supervisor for the backend selected by `STORAGE_BACKEND`.
fn spawn_storage_supervisor(state: SharedState) {
    match StorageBackend::from_env() {
        StorageBackend::Memory => {
            warn!(
                "STORAGE_BACKEND=memory: rooms and devices live only in this process; \
                 use for development and tests"
            );
            spawn_memory_supervisor(state);
        }
        StorageBackend::Mongo => spawn_mongo_supervisor(state),
    }
}

fn spawn_memory_supervisor(state: SharedState) {
    let store: Arc<dyn TrackerStore> = Arc::new(MemoryTrackerStore::new());
    tokio::spawn(storage_supervisor::run(state, move || {
        let store = store.clone();
        async move { Ok::<_, StorageError>(store) }
    }));
}

#[cfg(feature = "mongo-store")]
fn spawn_mongo_supervisor(state: SharedState) {
    use ap_tracker_back::dao::tracker_store::mongodb::{MongoConfig, MongoTrackerStore};

    tokio::spawn(storage_supervisor::run(state, || async {
        let config = MongoConfig::from_env().await?;
        let store = MongoTrackerStore::connect(config).await?;
        Ok::<Arc<dyn TrackerStore>, StorageError>(Arc::new(store))
    }));
}

#[cfg(not(feature = "mongo-store"))]
fn spawn_mongo_supervisor(state: SharedState) {
    warn!("built without mongo-store; falling back to in-memory storage");
    spawn_memory_supervisor(state);
}

/// Build the top-level router and attach cross-cutting middleware layers.
fn build_router(state: SharedState) -> Router<()> {
    routes::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Configure tracing subscribers so logs include spans by default.
fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=debug".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Wait for Ctrl+C or SIGTERM and shut the server down gracefully.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
