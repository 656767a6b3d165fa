//! Scripted collaborators shared by the unit tests.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use futures::future::BoxFuture;
use reqwest::StatusCode;

use crate::{
    dao::{
        models::{
            DatapackageEntry, DatapackageKey, LedgerBatch, LedgerSnapshot, SlotId,
            TrackedRoomEntity,
        },
        storage::{StorageError, StorageResult},
        tracker_store::{TrackerStore, memory::MemoryTrackerStore},
    },
    push::{PushError, PushMessage, PushOutcome, PushResult, PushTransport},
    remote::{
        RemoteError, RemoteResult, RoomApi,
        models::{GamePackage, RoomStatus, TrackerPayload},
    },
};

fn not_found(path: String) -> RemoteError {
    RemoteError::RequestStatus {
        path,
        status: StatusCode::NOT_FOUND,
    }
}

/// In-memory game-room service. Anything not scripted answers 404.
#[derive(Clone, Default)]
pub struct FakeRoomApi {
    inner: Arc<Mutex<FakeRooms>>,
    datapackage_calls: Arc<AtomicUsize>,
    tracker_calls: Arc<AtomicUsize>,
}

#[derive(Default)]
struct FakeRooms {
    statuses: HashMap<String, RoomStatus>,
    trackers: HashMap<String, TrackerPayload>,
    packages: HashMap<(String, String), GamePackage>,
    sockets: HashMap<u16, BTreeMap<String, String>>,
}

impl FakeRoomApi {
    pub fn set_status(&self, room_id: &str, status: RoomStatus) {
        let mut rooms = self.inner.lock().unwrap();
        rooms.statuses.insert(room_id.to_owned(), status);
    }

    pub fn set_tracker(&self, handle: &str, payload: TrackerPayload) {
        let mut rooms = self.inner.lock().unwrap();
        rooms.trackers.insert(handle.to_owned(), payload);
    }

    pub fn set_datapackage(&self, game: &str, checksum: &str, package: GamePackage) {
        let mut rooms = self.inner.lock().unwrap();
        rooms
            .packages
            .insert((game.to_owned(), checksum.to_owned()), package);
    }

    pub fn set_socket(&self, port: u16, checksums: BTreeMap<String, String>) {
        let mut rooms = self.inner.lock().unwrap();
        rooms.sockets.insert(port, checksums);
    }

    pub fn datapackage_calls(&self) -> usize {
        self.datapackage_calls.load(Ordering::SeqCst)
    }

    pub fn tracker_calls(&self) -> usize {
        self.tracker_calls.load(Ordering::SeqCst)
    }
}

impl RoomApi for FakeRoomApi {
    fn room_status(&self, room_id: &str) -> BoxFuture<'static, RemoteResult<RoomStatus>> {
        let found = self.inner.lock().unwrap().statuses.get(room_id).cloned();
        let path = format!("room_status/{room_id}");
        Box::pin(async move { found.ok_or_else(|| not_found(path)) })
    }

    fn tracker(&self, tracker_handle: &str) -> BoxFuture<'static, RemoteResult<TrackerPayload>> {
        self.tracker_calls.fetch_add(1, Ordering::SeqCst);
        let found = self.inner.lock().unwrap().trackers.get(tracker_handle).cloned();
        let path = format!("tracker/{tracker_handle}");
        Box::pin(async move { found.ok_or_else(|| not_found(path)) })
    }

    fn datapackage(
        &self,
        game: &str,
        checksum: &str,
    ) -> BoxFuture<'static, RemoteResult<GamePackage>> {
        self.datapackage_calls.fetch_add(1, Ordering::SeqCst);
        let found = self
            .inner
            .lock()
            .unwrap()
            .packages
            .get(&(game.to_owned(), checksum.to_owned()))
            .cloned();
        let path = format!("datapackage/{checksum}");
        Box::pin(async move { found.ok_or_else(|| not_found(path)) })
    }

    fn socket_checksums(
        &self,
        port: u16,
    ) -> BoxFuture<'static, RemoteResult<BTreeMap<String, String>>> {
        let found = self.inner.lock().unwrap().sockets.get(&port).cloned();
        Box::pin(async move {
            found.ok_or_else(|| RemoteError::SocketTimeout {
                uri: format!("wss://fake:{port}"),
            })
        })
    }
}

/// Push transport recording every batch it is handed.
#[derive(Clone, Default)]
pub struct RecordingTransport {
    batches: Arc<Mutex<Vec<Vec<PushMessage>>>>,
    unregistered: Arc<Mutex<HashSet<String>>>,
    failing_batches: Arc<Mutex<HashSet<usize>>>,
}

impl RecordingTransport {
    /// Report `token` as permanently invalid.
    pub fn unregister(&self, token: &str) {
        self.unregistered.lock().unwrap().insert(token.to_owned());
    }

    /// Make the batch with the given zero-based index fail as a whole.
    pub fn fail_batch(&self, index: usize) {
        self.failing_batches.lock().unwrap().insert(index);
    }

    pub fn batches(&self) -> Vec<Vec<PushMessage>> {
        self.batches.lock().unwrap().clone()
    }

    pub fn sent(&self) -> Vec<PushMessage> {
        self.batches().into_iter().flatten().collect()
    }
}

impl PushTransport for RecordingTransport {
    fn send_batch(
        &self,
        messages: Vec<PushMessage>,
    ) -> BoxFuture<'static, PushResult<Vec<PushOutcome>>> {
        let index = {
            let mut batches = self.batches.lock().unwrap();
            batches.push(messages.clone());
            batches.len() - 1
        };
        let failing = self.failing_batches.lock().unwrap().contains(&index);
        let unregistered = self.unregistered.lock().unwrap().clone();
        Box::pin(async move {
            if failing {
                return Err(PushError::AccessToken {
                    message: "scripted failure".into(),
                });
            }
            Ok(messages
                .iter()
                .map(|message| {
                    if unregistered.contains(&message.token) {
                        PushOutcome::Unregistered
                    } else {
                        PushOutcome::Delivered
                    }
                })
                .collect())
        })
    }
}

/// [`MemoryTrackerStore`] wrapper with slow name lookups and a switchable device registry outage.
#[derive(Clone)]
pub struct FlakyStore {
    inner: MemoryTrackerStore,
    name_delay: Arc<Mutex<Duration>>,
    devices_down: Arc<AtomicBool>,
}

impl FlakyStore {
    /// Wrap `inner`; both share the same rows.
    pub fn new(inner: MemoryTrackerStore) -> Self {
        Self {
            inner,
            name_delay: Arc::new(Mutex::new(Duration::ZERO)),
            devices_down: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn delay_names(&self, delay: Duration) {
        *self.name_delay.lock().unwrap() = delay;
    }

    pub fn fail_devices(&self, down: bool) {
        self.devices_down.store(down, Ordering::SeqCst);
    }
}

impl TrackerStore for FlakyStore {
    fn list_rooms(&self) -> BoxFuture<'static, StorageResult<Vec<TrackedRoomEntity>>> {
        self.inner.list_rooms()
    }

    fn find_room(
        &self,
        room_id: &str,
    ) -> BoxFuture<'static, StorageResult<Option<TrackedRoomEntity>>> {
        self.inner.find_room(room_id)
    }

    fn add_room(&self, room: TrackedRoomEntity) -> BoxFuture<'static, StorageResult<bool>> {
        self.inner.add_room(room)
    }

    fn remove_room(&self, room_id: &str) -> BoxFuture<'static, StorageResult<bool>> {
        self.inner.remove_room(room_id)
    }

    fn set_tracked_slots(
        &self,
        room_id: &str,
        slots: BTreeSet<SlotId>,
    ) -> BoxFuture<'static, StorageResult<()>> {
        self.inner.set_tracked_slots(room_id, slots)
    }

    fn record_setup(
        &self,
        room_id: &str,
        tracker_handle: String,
        game_checksums: BTreeMap<String, String>,
    ) -> BoxFuture<'static, StorageResult<()>> {
        self.inner
            .record_setup(room_id, tracker_handle, game_checksums)
    }

    fn has_datapackage(
        &self,
        game: &str,
        checksum: &str,
    ) -> BoxFuture<'static, StorageResult<bool>> {
        self.inner.has_datapackage(game, checksum)
    }

    fn insert_datapackage(
        &self,
        entries: Vec<DatapackageEntry>,
    ) -> BoxFuture<'static, StorageResult<()>> {
        self.inner.insert_datapackage(entries)
    }

    fn mark_datapackage_complete(
        &self,
        game: &str,
        checksum: &str,
    ) -> BoxFuture<'static, StorageResult<()>> {
        self.inner.mark_datapackage_complete(game, checksum)
    }

    fn entity_name(
        &self,
        key: DatapackageKey,
    ) -> BoxFuture<'static, StorageResult<Option<String>>> {
        let delay = *self.name_delay.lock().unwrap();
        let lookup = self.inner.entity_name(key);
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            lookup.await
        })
    }

    fn load_ledger(&self, room_id: &str) -> BoxFuture<'static, StorageResult<LedgerSnapshot>> {
        self.inner.load_ledger(room_id)
    }

    fn commit_ledger(&self, batch: LedgerBatch) -> BoxFuture<'static, StorageResult<()>> {
        self.inner.commit_ledger(batch)
    }

    fn device_tokens(&self) -> BoxFuture<'static, StorageResult<Vec<String>>> {
        if self.devices_down.load(Ordering::SeqCst) {
            return Box::pin(async {
                Err(StorageError::unavailable(
                    "device registry offline".into(),
                    std::io::Error::other("scripted outage"),
                ))
            });
        }
        self.inner.device_tokens()
    }

    fn register_device(&self, token: String) -> BoxFuture<'static, StorageResult<()>> {
        self.inner.register_device(token)
    }

    fn remove_device_tokens(&self, tokens: Vec<String>) -> BoxFuture<'static, StorageResult<u64>> {
        self.inner.remove_device_tokens(tokens)
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        self.inner.health_check()
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        self.inner.try_reconnect()
    }
}
