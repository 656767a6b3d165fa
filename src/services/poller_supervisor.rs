//! Reconciles the configured rooms against the running poll tasks.

use std::collections::{BTreeMap, HashMap};

use tokio::{sync::watch, task::JoinHandle, time::sleep};
use tracing::{debug, info, warn};

use crate::{
    dao::models::TrackedRoomEntity,
    services::room_poller::{RoomPoller, setup_room},
    state::{PollerPhase, PollerStatus, SharedState},
};

/// Fields of a room that a running poller depends on. A change restarts the poller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSnapshot {
    pub room_id: String,
    pub alias: String,
    pub tracker_handle: Option<String>,
}

impl From<&TrackedRoomEntity> for RoomSnapshot {
    fn from(room: &TrackedRoomEntity) -> Self {
        Self {
            room_id: room.room_id.clone(),
            alias: room.alias.clone(),
            tracker_handle: room.tracker_handle.clone(),
        }
    }
}

/// Decisions of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    /// Configured rooms without a poller.
    pub start: Vec<RoomSnapshot>,
    /// Running rooms whose snapshot drifted; the old poller is stopped first.
    pub restart: Vec<RoomSnapshot>,
    /// Running rooms no longer configured.
    pub stop: Vec<String>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.start.is_empty() && self.restart.is_empty() && self.stop.is_empty()
    }
}

/// Compare the desired rooms with the running snapshots, keyed by room id.
pub fn plan_reconciliation(
    desired: &[RoomSnapshot],
    running: &HashMap<String, RoomSnapshot>,
) -> ReconcilePlan {
    let mut plan = ReconcilePlan::default();
    let desired_by_id: BTreeMap<&str, &RoomSnapshot> = desired
        .iter()
        .map(|room| (room.room_id.as_str(), room))
        .collect();

    for (room_id, wanted) in &desired_by_id {
        match running.get(*room_id) {
            None => plan.start.push((*wanted).clone()),
            Some(current) if current != *wanted => plan.restart.push((*wanted).clone()),
            Some(_) => {}
        }
    }

    let mut stop: Vec<String> = running
        .keys()
        .filter(|room_id| !desired_by_id.contains_key(room_id.as_str()))
        .cloned()
        .collect();
    stop.sort();
    plan.stop = stop;
    plan
}

struct PollerHandle {
    snapshot: RoomSnapshot,
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    /// Signal the task and hand back its join handle.
    fn cancel(self) -> JoinHandle<()> {
        // The task observes this at its next fetch or sleep.
        let _ = self.cancel.send(true);
        self.task
    }

    /// Cancel, then wait until the in-flight cycle has committed and dispatched.
    async fn stop(self, room_id: &str) {
        if let Err(err) = self.cancel().await {
            warn!(room_id, error = %err, "room poller task ended abnormally");
        }
    }
}

/// Owner of every room poll task.
pub struct PollerSupervisor {
    state: SharedState,
    running: HashMap<String, PollerHandle>,
}

impl PollerSupervisor {
    pub fn new(state: SharedState) -> Self {
        Self {
            state,
            running: HashMap::new(),
        }
    }

    /// Reconcile forever at the configured interval.
    pub async fn run(mut self) {
        let interval = self.state.config().polling.supervisor_interval();
        info!(interval_secs = interval.as_secs(), "poller supervisor started");
        loop {
            self.reconcile_once().await;
            sleep(interval).await;
        }
    }

    /// Snapshots of the rooms with a live poller.
    pub fn running(&self) -> HashMap<String, RoomSnapshot> {
        self.running
            .iter()
            .map(|(room_id, handle)| (room_id.clone(), handle.snapshot.clone()))
            .collect()
    }

    /// One pass: read configured rooms, then stop, restart and start pollers.
    ///
    /// A storage failure skips the pass; a room whose setup fails stays stopped until the next pass.
    pub async fn reconcile_once(&mut self) -> ReconcilePlan {
        self.reap_finished();

        let store = match self.state.require_store().await {
            Ok(store) => store,
            Err(err) => {
                warn!(error = %err, "skipping reconciliation");
                return ReconcilePlan::default();
            }
        };
        let rooms = match store.list_rooms().await {
            Ok(rooms) => rooms,
            Err(err) => {
                warn!(error = %err, "failed to list tracked rooms; skipping reconciliation");
                return ReconcilePlan::default();
            }
        };

        let desired: Vec<RoomSnapshot> = rooms.iter().map(RoomSnapshot::from).collect();
        let plan = plan_reconciliation(&desired, &self.running());
        if plan.is_empty() {
            debug!(rooms = desired.len(), "pollers up to date");
            return plan;
        }

        for room_id in &plan.stop {
            if let Some(handle) = self.running.remove(room_id) {
                handle.stop(room_id).await;
            }
            self.state.pollers().remove(room_id);
            info!(room_id = %room_id, "stopped poller for removed room");
        }

        let rooms_by_id: HashMap<&str, &TrackedRoomEntity> = rooms
            .iter()
            .map(|room| (room.room_id.as_str(), room))
            .collect();
        let launches = plan
            .restart
            .iter()
            .map(|snapshot| (snapshot, true))
            .chain(plan.start.iter().map(|snapshot| (snapshot, false)));
        for (snapshot, restart) in launches {
            if restart {
                if let Some(handle) = self.running.remove(&snapshot.room_id) {
                    handle.stop(&snapshot.room_id).await;
                }
                info!(room_id = %snapshot.room_id, "room config changed; restarting poller");
            }
            if let Some(room) = rooms_by_id.get(snapshot.room_id.as_str()) {
                self.launch(room).await;
            }
        }

        plan
    }

    /// Set the room up when needed, then spawn its poll task.
    async fn launch(&mut self, room: &TrackedRoomEntity) {
        let room_id = room.room_id.clone();
        self.state
            .pollers()
            .insert(room_id.clone(), PollerStatus::setup(&room.alias));

        let mut snapshot = RoomSnapshot::from(room);
        if snapshot.tracker_handle.is_none() {
            match setup_room(&self.state, room).await {
                Ok(handle) => snapshot.tracker_handle = Some(handle),
                Err(err) => {
                    warn!(room_id = %room_id, error = %err, "room setup failed; retrying next pass");
                    if let Some(mut status) = self.state.pollers().get_mut(&room_id) {
                        status.last_error = Some(err.to_string());
                    }
                    return;
                }
            }
        }

        let (cancel, cancel_rx) = watch::channel(false);
        let poller = RoomPoller::new(self.state.clone(), room_id.clone());
        let task = tokio::spawn(poller.run(cancel_rx));
        if let Some(mut status) = self.state.pollers().get_mut(&room_id) {
            status.phase = PollerPhase::Polling;
        }
        info!(room_id = %room_id, alias = %room.alias, "started room poller");

        self.running.insert(
            room_id,
            PollerHandle {
                snapshot,
                cancel,
                task,
            },
        );
    }

    /// Forget pollers whose task ended on its own so they get started again.
    fn reap_finished(&mut self) {
        self.running.retain(|room_id, handle| {
            let alive = !handle.task.is_finished();
            if !alive {
                warn!(room_id = %room_id, "room poller exited unexpectedly");
            }
            alive
        });
    }
}

impl Drop for PollerSupervisor {
    fn drop(&mut self) {
        for (_, handle) in self.running.drain() {
            let _ = handle.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeSet,
        sync::Arc,
        time::Duration,
    };

    use serde_json::json;

    use super::*;
    use crate::{
        config::AppConfig,
        dao::tracker_store::{TrackerStore, memory::MemoryTrackerStore},
        remote::models::{GamePackage, RoomStatus, TrackerPayload},
        state::AppState,
        test_support::{FakeRoomApi, FlakyStore, RecordingTransport},
    };

    fn snapshot(room_id: &str, alias: &str, handle: Option<&str>) -> RoomSnapshot {
        RoomSnapshot {
            room_id: room_id.into(),
            alias: alias.into(),
            tracker_handle: handle.map(Into::into),
        }
    }

    #[test]
    fn plan_starts_restarts_and_stops() {
        let desired = vec![
            snapshot("new", "New", None),
            snapshot("same", "Same", Some("t1")),
            snapshot("renamed", "Renamed", Some("t2")),
        ];
        let running = HashMap::from([
            ("same".to_owned(), snapshot("same", "Same", Some("t1"))),
            ("renamed".to_owned(), snapshot("renamed", "Old", Some("t2"))),
            ("gone".to_owned(), snapshot("gone", "Gone", Some("t3"))),
        ]);

        let plan = plan_reconciliation(&desired, &running);

        assert_eq!(plan.start, vec![snapshot("new", "New", None)]);
        assert_eq!(plan.restart, vec![snapshot("renamed", "Renamed", Some("t2"))]);
        assert_eq!(plan.stop, vec!["gone".to_owned()]);
    }

    #[test]
    fn cleared_tracker_handle_forces_restart() {
        let desired = vec![snapshot("room", "Room", None)];
        let running = HashMap::from([("room".to_owned(), snapshot("room", "Room", Some("t")))]);

        let plan = plan_reconciliation(&desired, &running);
        assert_eq!(plan.restart.len(), 1);
        assert!(plan.start.is_empty() && plan.stop.is_empty());
    }

    #[test]
    fn converged_state_plans_nothing() {
        let desired = vec![snapshot("room", "Room", Some("t"))];
        let running = HashMap::from([("room".to_owned(), snapshot("room", "Room", Some("t")))]);
        assert!(plan_reconciliation(&desired, &running).is_empty());
    }

    async fn state_with(remote: &FakeRoomApi) -> (SharedState, Arc<MemoryTrackerStore>) {
        let state = AppState::new(
            AppConfig::default(),
            Arc::new(remote.clone()),
            Arc::new(RecordingTransport::default()),
        );
        let store = Arc::new(MemoryTrackerStore::new());
        state.install_store(store.clone()).await;
        (state, store)
    }

    fn ready_status() -> RoomStatus {
        RoomStatus {
            players: vec![("Ann".into(), "Clique".into())],
            last_port: Some(1),
            tracker: Some("trk".into()),
            ..RoomStatus::default()
        }
    }

    #[tokio::test]
    async fn failed_setup_does_not_block_other_rooms() {
        let remote = FakeRoomApi::default();
        remote.set_status("good", ready_status());
        remote.set_tracker("trk", TrackerPayload::default());
        let (state, store) = state_with(&remote).await;
        for room_id in ["good", "broken"] {
            let mut room = TrackedRoomEntity::new(room_id, room_id);
            room.slots = BTreeSet::from([1]);
            store.add_room(room).await.unwrap();
        }

        let mut supervisor = PollerSupervisor::new(state.clone());
        supervisor.reconcile_once().await;

        let running = supervisor.running();
        assert_eq!(running.len(), 1);
        assert_eq!(running["good"].tracker_handle.as_deref(), Some("trk"));
        assert_eq!(state.pollers().get("good").unwrap().phase, PollerPhase::Polling);
        let broken = state.pollers().get("broken").unwrap().clone();
        assert_eq!(broken.phase, PollerPhase::Setup);
        assert!(broken.last_error.is_some());

        // Setup persisted the handle, so the next pass sees no drift.
        assert!(supervisor.reconcile_once().await.restart.is_empty());
    }

    #[tokio::test]
    async fn removed_room_is_stopped() {
        let remote = FakeRoomApi::default();
        remote.set_status("room", ready_status());
        remote.set_tracker("trk", TrackerPayload::default());
        let (state, store) = state_with(&remote).await;
        store
            .add_room(TrackedRoomEntity::new("room", "Room"))
            .await
            .unwrap();

        let mut supervisor = PollerSupervisor::new(state.clone());
        supervisor.reconcile_once().await;
        assert_eq!(supervisor.running().len(), 1);

        store.remove_room("room").await.unwrap();
        let plan = supervisor.reconcile_once().await;

        assert_eq!(plan.stop, vec!["room".to_owned()]);
        assert!(supervisor.running().is_empty());
        assert!(state.pollers().get("room").is_none());
    }

    #[tokio::test]
    async fn restart_waits_for_the_running_cycle() {
        let remote = FakeRoomApi::default();
        remote.set_status(
            "room",
            RoomStatus {
                datapackage_checksums: BTreeMap::from([("Clique".into(), "abc".into())]),
                ..ready_status()
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
        remote.set_tracker("trk", TrackerPayload::default());

        let mut config = AppConfig::default();
        config.push.chunk_delay_ms = 0;
        let transport = RecordingTransport::default();
        let state = AppState::new(config, Arc::new(remote.clone()), Arc::new(transport.clone()));
        let memory = MemoryTrackerStore::new();
        let store = FlakyStore::new(memory.clone());
        store.delay_names(Duration::from_millis(300));
        state.install_store(Arc::new(store)).await;

        let mut room = TrackedRoomEntity::new("room", "Weekly");
        room.slots = BTreeSet::from([1]);
        memory.add_room(room).await.unwrap();
        memory.register_device("device-a".into()).await.unwrap();

        let mut supervisor = PollerSupervisor::new(state.clone());
        supervisor.reconcile_once().await;
        remote.set_tracker(
            "trk",
            serde_json::from_value(json!({
                "player_items_received": [{ "player": 1, "items": [[50, 10, 1, 1]] }]
            }))
            .unwrap(),
        );

        // The first cycle is now resolving names.
        tokio::time::sleep(Duration::from_millis(100)).await;
        memory.set_alias("room", "Renamed").await;
        let plan = supervisor.reconcile_once().await;
        assert_eq!(plan.restart.len(), 1);

        tokio::time::sleep(Duration::from_millis(500)).await;
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].notification.title.starts_with("[Weekly]"));
        assert_eq!(memory.item_rows("room").await, 1);
    }

    #[tokio::test]
    async fn degraded_storage_skips_the_pass() {
        let remote = FakeRoomApi::default();
        let state = AppState::new(
            AppConfig::default(),
            Arc::new(remote),
            Arc::new(RecordingTransport::default()),
        );

        let mut supervisor = PollerSupervisor::new(state);
        assert!(supervisor.reconcile_once().await.is_empty());
        assert!(supervisor.running().is_empty());
    }
}
