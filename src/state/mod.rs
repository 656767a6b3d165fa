pub mod pollers;

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{RwLock, watch};

use crate::{
    config::AppConfig,
    dao::tracker_store::TrackerStore,
    error::ServiceError,
    push::PushTransport,
    remote::RoomApi,
    services::notification_dispatcher::NotificationDispatcher,
};

pub use self::pollers::{PollerPhase, PollerStatus};

pub type SharedState = Arc<AppState>;

/// Central application state: storage handle, remote client, push fan-out and poller registry.
pub struct AppState {
    store: RwLock<Option<Arc<dyn TrackerStore>>>,
    degraded: watch::Sender<bool>,
    remote: Arc<dyn RoomApi>,
    dispatcher: NotificationDispatcher,
    pollers: DashMap<String, PollerStatus>,
    config: AppConfig,
}

impl AppState {
    /// Construct a new [`AppState`] wrapped in an [`Arc`] so it can be cloned cheaply.
    ///
    /// The application starts in degraded mode until a storage backend is installed.
    pub fn new(
        config: AppConfig,
        remote: Arc<dyn RoomApi>,
        transport: Arc<dyn PushTransport>,
    ) -> SharedState {
        let (degraded_tx, _rx) = watch::channel(true);
        let dispatcher = NotificationDispatcher::new(transport, &config.push);
        Arc::new(Self {
            store: RwLock::new(None),
            degraded: degraded_tx,
            remote,
            dispatcher,
            pollers: DashMap::new(),
            config,
        })
    }

    /// Obtain a handle to the current tracker store, if one is installed.
    pub async fn store(&self) -> Option<Arc<dyn TrackerStore>> {
        let guard = self.store.read().await;
        guard.as_ref().cloned()
    }

    /// Like [`AppState::store`], failing with [`ServiceError::Degraded`] when storage is down.
    pub async fn require_store(&self) -> Result<Arc<dyn TrackerStore>, ServiceError> {
        if *self.degraded.borrow() {
            return Err(ServiceError::Degraded);
        }
        self.store().await.ok_or(ServiceError::Degraded)
    }

    /// Install a new tracker store implementation and leave degraded mode.
    pub async fn install_store(&self, store: Arc<dyn TrackerStore>) {
        {
            let mut guard = self.store.write().await;
            *guard = Some(store);
        }
        self.update_degraded(false);
    }

    /// Current degraded flag.
    pub fn is_degraded(&self) -> bool {
        *self.degraded.borrow()
    }

    /// Subscribe to degraded mode updates.
    pub fn degraded_watcher(&self) -> watch::Receiver<bool> {
        self.degraded.subscribe()
    }

    /// Update and broadcast the degraded flag when the value changes.
    pub fn update_degraded(&self, value: bool) {
        self.degraded.send_if_modified(|current| {
            if *current == value {
                return false;
            }
            *current = value;
            true
        });
    }

    pub fn remote(&self) -> Arc<dyn RoomApi> {
        self.remote.clone()
    }

    pub fn dispatcher(&self) -> &NotificationDispatcher {
        &self.dispatcher
    }

    /// Registry of running room pollers keyed by room id.
    pub fn pollers(&self) -> &DashMap<String, PollerStatus> {
        &self.pollers
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }
}
