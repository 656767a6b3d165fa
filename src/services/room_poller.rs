//! Setup and poll loop of a single tracked room.

use std::{
    collections::{BTreeMap, BTreeSet},
    time::SystemTime,
};

use tokio::{sync::watch, time::sleep};
use tracing::{debug, info, warn};

use crate::{
    dao::models::TrackedRoomEntity,
    error::ServiceError,
    remote::{
        RemoteError,
        models::{Roster, TrackerPayload},
    },
    services::{
        datapackage_cache::DatapackageCache,
        event_dedup::{self, RoomContext},
        notification_dispatcher::DispatchReport,
    },
    state::SharedState,
};

/// Resolve the tracker handle and datapackages of `room`, record a silent baseline
/// and persist the result. Returns the tracker handle.
///
/// Nothing is persisted for the room itself unless every step up to the baseline succeeded.
pub async fn setup_room(
    state: &SharedState,
    room: &TrackedRoomEntity,
) -> Result<String, ServiceError> {
    let store = state.require_store().await?;
    let remote = state.remote();
    let room_id = room.room_id.as_str();

    let status = remote.room_status(room_id).await?;
    let tracker = status
        .tracker
        .clone()
        .filter(|handle| !handle.is_empty())
        .ok_or_else(|| RemoteError::RoomNotReady {
            room_id: room_id.to_owned(),
            missing: "tracker handle",
        })?;
    let port = status.last_port.ok_or_else(|| RemoteError::RoomNotReady {
        room_id: room_id.to_owned(),
        missing: "port",
    })?;

    let checksums = match remote.socket_checksums(port).await {
        Ok(checksums) if !checksums.is_empty() => checksums,
        Ok(_) => {
            debug!(room_id, port, "room socket listed no checksums; using room status");
            status.datapackage_checksums.clone()
        }
        Err(err) => {
            warn!(room_id, port, error = %err, "room socket unavailable; using room status checksums");
            status.datapackage_checksums.clone()
        }
    };

    let cache = DatapackageCache::new(store.clone(), remote.clone());
    for (game, checksum) in &checksums {
        match cache.ensure_cached(game, checksum).await {
            Ok(_) => {}
            Err(ServiceError::Remote(err)) => {
                warn!(room_id, game, checksum, error = %err, "datapackage fetch failed; names fall back to ids");
            }
            Err(err) => return Err(err),
        }
    }

    let payload = remote.tracker(&tracker).await?;
    let ledger = store.load_ledger(room_id).await?;
    let batch = event_dedup::baseline(
        room_id,
        &payload,
        &Roster::from(&status),
        &room.slots,
        &ledger,
        SystemTime::now(),
    );
    let recorded = batch.items.len() + batch.hints.len();
    if !batch.is_empty() {
        store.commit_ledger(batch).await?;
    }

    store
        .record_setup(room_id, tracker.clone(), checksums)
        .await?;
    info!(room_id, alias = %room.alias, recorded, "room setup complete");
    Ok(tracker)
}

/// What one poll cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// No slot is tracked; nothing was fetched.
    Idle,
    Processed {
        notifications: usize,
        ledger_rows: usize,
        dispatch: DispatchReport,
    },
}

/// Remote state fetched at the start of a cycle.
struct Fetched {
    room: TrackedRoomEntity,
    payload: TrackerPayload,
    roster: Roster,
}

/// Long-running poll task of one room.
pub struct RoomPoller {
    state: SharedState,
    room_id: String,
    /// `(game, checksum)` pairs confirmed cached by this poller.
    cached: BTreeSet<(String, String)>,
}

impl RoomPoller {
    pub fn new(state: SharedState, room_id: impl Into<String>) -> Self {
        Self {
            state,
            room_id: room_id.into(),
            cached: BTreeSet::new(),
        }
    }

    /// Poll until `cancel` flips to `true` or its sender is dropped.
    ///
    /// Cancellation is observed while fetching and while sleeping; once a cycle
    /// has fetched, it runs to completion first.
    pub async fn run(mut self, mut cancel: watch::Receiver<bool>) {
        let interval = self.state.config().polling.poll_interval();
        info!(room_id = %self.room_id, "room poller started");

        loop {
            let fetched = tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => break,
                fetched = self.fetch() => fetched,
            };
            let result = match fetched {
                Ok(Some(fetched)) => self.process(fetched).await,
                Ok(None) => Ok(CycleOutcome::Idle),
                Err(err) => Err(err),
            };
            self.record(&result);

            tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => break,
                _ = sleep(interval) => {}
            }
        }

        info!(room_id = %self.room_id, "room poller stopped");
    }

    /// Run exactly one cycle without cancellation.
    pub async fn poll_once(&mut self) -> Result<CycleOutcome, ServiceError> {
        let result = match self.fetch().await {
            Ok(Some(fetched)) => self.process(fetched).await,
            Ok(None) => Ok(CycleOutcome::Idle),
            Err(err) => Err(err),
        };
        self.record(&result);
        result
    }

    async fn fetch(&mut self) -> Result<Option<Fetched>, ServiceError> {
        let store = self.state.require_store().await?;
        let remote = self.state.remote();
        let room = store
            .find_room(&self.room_id)
            .await?
            .ok_or_else(|| ServiceError::RoomGone(self.room_id.clone()))?;
        if room.slots.is_empty() {
            debug!(room_id = %self.room_id, "no tracked slots; skipping cycle");
            return Ok(None);
        }

        let handle = room
            .tracker_handle
            .clone()
            .ok_or_else(|| RemoteError::RoomNotReady {
                room_id: self.room_id.clone(),
                missing: "tracker handle",
            })?;
        let payload = remote.tracker(&handle).await?;
        let roster = match remote.room_status(&self.room_id).await {
            Ok(status) => Roster::from(&status),
            Err(err) => {
                warn!(room_id = %self.room_id, error = %err, "room status unavailable; using slot fallbacks");
                Roster::default()
            }
        };

        Ok(Some(Fetched {
            room,
            payload,
            roster,
        }))
    }

    /// Retry caching datapackages that are not confirmed yet. Failures only degrade names.
    async fn refresh_datapackages(
        &mut self,
        cache: &DatapackageCache,
        checksums: &BTreeMap<String, String>,
    ) {
        for (game, checksum) in checksums {
            let pair = (game.clone(), checksum.clone());
            if self.cached.contains(&pair) {
                continue;
            }
            match cache.ensure_cached(game, checksum).await {
                Ok(_) => {
                    self.cached.insert(pair);
                }
                Err(err) => {
                    warn!(room_id = %self.room_id, game, checksum, error = %err, "datapackage still missing");
                }
            }
        }
    }

    /// Refresh names, dedup, commit, then dispatch. Not cancelled midway.
    ///
    /// Everything that can fail before delivery runs ahead of the commit, so a
    /// failed cycle leaves its events to the next one.
    async fn process(&mut self, fetched: Fetched) -> Result<CycleOutcome, ServiceError> {
        let Fetched {
            room,
            payload,
            roster,
        } = fetched;
        let store = self.state.require_store().await?;
        let cache = DatapackageCache::new(store.clone(), self.state.remote());
        self.refresh_datapackages(&cache, &room.game_checksums)
            .await;
        let ledger = store.load_ledger(&room.room_id).await?;

        let context = RoomContext {
            alias: &room.alias,
            roster: &roster,
            checksums: &room.game_checksums,
        };
        let outcome = event_dedup::deduplicate(
            &room.room_id,
            &payload,
            &room.slots,
            &ledger,
            &context,
            &cache,
            SystemTime::now(),
        )
        .await;

        let notifications = outcome.notifications.len();
        let tokens = if notifications == 0 {
            Vec::new()
        } else {
            store.device_tokens().await?
        };

        let ledger_rows = outcome.batch.items.len() + outcome.batch.hints.len();
        let finished = outcome.batch.finished_slots.len();
        if !outcome.batch.is_empty() {
            store.commit_ledger(outcome.batch).await?;
        }
        if finished > 0 {
            info!(room_id = %room.room_id, finished, "dropped finished slots");
        }

        let dispatch = if notifications == 0 {
            DispatchReport::default()
        } else {
            self.state
                .dispatcher()
                .dispatch(store.as_ref(), &outcome.notifications, &tokens)
                .await
        };

        Ok(CycleOutcome::Processed {
            notifications,
            ledger_rows,
            dispatch,
        })
    }

    fn record(&self, result: &Result<CycleOutcome, ServiceError>) {
        let error = match result {
            Ok(CycleOutcome::Processed {
                notifications,
                ledger_rows,
                ..
            }) => {
                debug!(room_id = %self.room_id, notifications, ledger_rows, "poll cycle complete");
                None
            }
            Ok(CycleOutcome::Idle) => None,
            Err(ServiceError::Degraded) => {
                debug!(room_id = %self.room_id, "storage degraded; skipping cycle");
                Some(ServiceError::Degraded.to_string())
            }
            Err(ServiceError::RoomGone(_)) => {
                debug!(room_id = %self.room_id, "room deleted; waiting for cancellation");
                None
            }
            Err(err) => {
                warn!(room_id = %self.room_id, error = %err, "poll cycle failed");
                Some(err.to_string())
            }
        };

        if let Some(mut status) = self.state.pollers().get_mut(&self.room_id) {
            status.record_cycle(SystemTime::now(), error);
        }
    }
}

/// Resolve once `cancel` is `true` or its sender is gone.
pub(crate) async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    while !*cancel.borrow_and_update() {
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use serde_json::json;

    use super::*;
    use crate::{
        config::AppConfig,
        dao::tracker_store::{TrackerStore, memory::MemoryTrackerStore},
        remote::models::{GamePackage, RoomStatus},
        state::{AppState, PollerStatus},
        test_support::{FakeRoomApi, FlakyStore, RecordingTransport},
    };

    struct Fixture {
        state: SharedState,
        store: MemoryTrackerStore,
        flaky: FlakyStore,
        remote: FakeRoomApi,
        transport: RecordingTransport,
    }

    async fn fixture() -> Fixture {
        let mut config = AppConfig::default();
        config.push.chunk_delay_ms = 0;
        let remote = FakeRoomApi::default();
        let transport = RecordingTransport::default();
        let state = AppState::new(config, Arc::new(remote.clone()), Arc::new(transport.clone()));
        let store = MemoryTrackerStore::new();
        let flaky = FlakyStore::new(store.clone());
        state.install_store(Arc::new(flaky.clone())).await;

        let mut room = TrackedRoomEntity::new("room-1", "Weekly");
        room.slots = BTreeSet::from([1]);
        store.add_room(room).await.unwrap();
        store.register_device("device-a".into()).await.unwrap();

        remote.set_status(
            "room-1",
            RoomStatus {
                players: vec![
                    ("Ann".into(), "Clique".into()),
                    ("Bob".into(), "Clique".into()),
                ],
                last_port: Some(38281),
                tracker: Some("trk".into()),
                datapackage_checksums: BTreeMap::from([("Clique".into(), "abc".into())]),
            },
        );
        remote.set_datapackage(
            "Clique",
            "abc",
            GamePackage {
                item_name_to_id: [("Button".to_owned(), 50)].into(),
                location_name_to_id: [("The Button".to_owned(), 10)].into(),
            },
        );

        Fixture {
            state,
            store,
            flaky,
            remote,
            transport,
        }
    }

    fn payload(value: serde_json::Value) -> TrackerPayload {
        serde_json::from_value(value).unwrap()
    }

    async fn room(fixture: &Fixture) -> TrackedRoomEntity {
        fixture.store.find_room("room-1").await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn setup_requires_tracker_and_port() {
        let fixture = fixture().await;
        fixture.remote.set_status("room-1", RoomStatus::default());

        let err = setup_room(&fixture.state, &room(&fixture).await)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Remote(RemoteError::RoomNotReady { .. })
        ));
        assert!(room(&fixture).await.tracker_handle.is_none());
    }

    #[tokio::test]
    async fn setup_falls_back_to_status_checksums_and_records_baseline() {
        let fixture = fixture().await;
        fixture.remote.set_tracker(
            "trk",
            payload(json!({
                "player_items_received": [{ "player": 1, "items": [[50, 10, 2, 1]] }]
            })),
        );

        let handle = setup_room(&fixture.state, &room(&fixture).await)
            .await
            .unwrap();

        assert_eq!(handle, "trk");
        let room = room(&fixture).await;
        assert_eq!(room.tracker_handle.as_deref(), Some("trk"));
        assert_eq!(room.game_checksums.get("Clique").map(String::as_str), Some("abc"));
        assert!(fixture.store.has_datapackage("Clique", "abc").await.unwrap());
        assert_eq!(fixture.store.item_rows("room-1").await, 1);
        assert!(fixture.transport.batches().is_empty());
    }

    #[tokio::test]
    async fn setup_prefers_socket_checksums() {
        let fixture = fixture().await;
        fixture
            .remote
            .set_socket(38281, BTreeMap::from([("Clique".into(), "def".into())]));
        fixture
            .remote
            .set_tracker("trk", TrackerPayload::default());

        setup_room(&fixture.state, &room(&fixture).await)
            .await
            .unwrap();

        let room = room(&fixture).await;
        assert_eq!(room.game_checksums.get("Clique").map(String::as_str), Some("def"));
    }

    #[tokio::test]
    async fn new_item_after_setup_is_pushed_once() {
        let fixture = fixture().await;
        fixture.remote.set_tracker("trk", TrackerPayload::default());
        setup_room(&fixture.state, &room(&fixture).await)
            .await
            .unwrap();
        fixture.state.pollers().insert("room-1".into(), PollerStatus::setup("Weekly"));

        fixture.remote.set_tracker(
            "trk",
            payload(json!({
                "player_items_received": [{ "player": 1, "items": [[50, 10, 2, 1]] }]
            })),
        );
        let mut poller = RoomPoller::new(fixture.state.clone(), "room-1");

        let first = poller.poll_once().await.unwrap();
        assert!(matches!(
            first,
            CycleOutcome::Processed {
                notifications: 1,
                ledger_rows: 1,
                ..
            }
        ));
        let sent = fixture.transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].token, "device-a");
        assert_eq!(sent[0].notification.title, "[Weekly] ✨ Progression Item!");
        assert_eq!(sent[0].notification.body, "Ann received: Button");

        poller.poll_once().await.unwrap();
        assert_eq!(fixture.transport.sent().len(), 1);
        assert_eq!(fixture.state.pollers().get("room-1").unwrap().cycles, 2);
    }

    #[tokio::test]
    async fn room_without_slots_is_idle() {
        let fixture = fixture().await;
        fixture
            .store
            .set_tracked_slots("room-1", BTreeSet::new())
            .await
            .unwrap();

        let mut poller = RoomPoller::new(fixture.state.clone(), "room-1");
        assert_eq!(poller.poll_once().await.unwrap(), CycleOutcome::Idle);
        assert_eq!(fixture.remote.tracker_calls(), 0);
    }

    #[tokio::test]
    async fn failed_fetch_is_reported_and_retried() {
        let fixture = fixture().await;
        fixture
            .store
            .record_setup("room-1", "trk".into(), BTreeMap::new())
            .await
            .unwrap();
        fixture.state.pollers().insert("room-1".into(), PollerStatus::setup("Weekly"));
        let mut poller = RoomPoller::new(fixture.state.clone(), "room-1");

        assert!(poller.poll_once().await.is_err());
        assert!(fixture.state.pollers().get("room-1").unwrap().last_error.is_some());

        fixture.remote.set_tracker("trk", TrackerPayload::default());
        assert!(poller.poll_once().await.is_ok());
        assert!(fixture.state.pollers().get("room-1").unwrap().last_error.is_none());
    }

    #[tokio::test]
    async fn ledger_is_recorded_without_devices() {
        let fixture = fixture().await;
        fixture
            .store
            .remove_device_tokens(vec!["device-a".into()])
            .await
            .unwrap();
        fixture
            .store
            .record_setup("room-1", "trk".into(), BTreeMap::new())
            .await
            .unwrap();
        fixture.remote.set_tracker(
            "trk",
            payload(json!({
                "player_items_received": [{ "player": 1, "items": [[50, 10, 2, 1]] }]
            })),
        );

        RoomPoller::new(fixture.state.clone(), "room-1")
            .poll_once()
            .await
            .unwrap();

        assert_eq!(fixture.store.item_rows("room-1").await, 1);
        assert!(fixture.transport.batches().is_empty());
    }

    #[tokio::test]
    async fn device_lookup_failure_leaves_events_for_next_cycle() {
        let fixture = fixture().await;
        fixture
            .store
            .record_setup("room-1", "trk".into(), BTreeMap::new())
            .await
            .unwrap();
        fixture.remote.set_tracker(
            "trk",
            payload(json!({
                "player_items_received": [{ "player": 1, "items": [[50, 10, 2, 1]] }]
            })),
        );
        let mut poller = RoomPoller::new(fixture.state.clone(), "room-1");

        fixture.flaky.fail_devices(true);
        let err = poller.poll_once().await.unwrap_err();
        assert!(matches!(err, ServiceError::Unavailable(_)));
        assert_eq!(fixture.store.item_rows("room-1").await, 0);
        assert!(fixture.transport.sent().is_empty());

        fixture.flaky.fail_devices(false);
        poller.poll_once().await.unwrap();
        assert_eq!(fixture.store.item_rows("room-1").await, 1);
        assert_eq!(fixture.transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn missing_datapackage_is_cached_by_a_later_cycle() {
        let fixture = fixture().await;
        fixture
            .store
            .record_setup(
                "room-1",
                "trk".into(),
                BTreeMap::from([("Clique".into(), "abc".into())]),
            )
            .await
            .unwrap();
        fixture.remote.set_tracker("trk", TrackerPayload::default());
        assert!(!fixture.store.has_datapackage("Clique", "abc").await.unwrap());

        RoomPoller::new(fixture.state.clone(), "room-1")
            .poll_once()
            .await
            .unwrap();

        assert!(fixture.store.has_datapackage("Clique", "abc").await.unwrap());
        assert_eq!(fixture.remote.datapackage_calls(), 1);
    }

    #[tokio::test]
    async fn deleted_room_reports_gone() {
        let fixture = fixture().await;
        fixture.store.remove_room("room-1").await.unwrap();

        let err = RoomPoller::new(fixture.state.clone(), "room-1")
            .poll_once()
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::RoomGone(_)));
    }

    #[tokio::test]
    async fn cancellation_stops_the_loop() {
        let fixture = fixture().await;
        fixture
            .store
            .set_tracked_slots("room-1", BTreeSet::new())
            .await
            .unwrap();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(RoomPoller::new(fixture.state.clone(), "room-1").run(cancel_rx));

        cancel_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("poller did not stop")
            .unwrap();
    }
}
