pub mod memory;
#[cfg(feature = "mongo-store")]
pub mod mongodb;

use std::collections::{BTreeMap, BTreeSet};

use futures::future::BoxFuture;

use crate::dao::models::{
    DatapackageEntry, DatapackageKey, LedgerBatch, LedgerSnapshot, SlotId, TrackedRoomEntity,
};
use crate::dao::storage::StorageResult;

/// Abstraction over the persistence layer for tracked rooms, the datapackage
/// cache, the dedup ledger and the device registry.
///
/// Inserts are idempotent: a unique-key conflict means "already recorded" and
/// is reported as success.
pub trait TrackerStore: Send + Sync {
    /// All tracked rooms with their slots.
    fn list_rooms(&self) -> BoxFuture<'static, StorageResult<Vec<TrackedRoomEntity>>>;
    fn find_room(&self, room_id: &str)
    -> BoxFuture<'static, StorageResult<Option<TrackedRoomEntity>>>;
    /// Insert a new room; returns `false` when the room id is already tracked.
    fn add_room(&self, room: TrackedRoomEntity) -> BoxFuture<'static, StorageResult<bool>>;
    /// Delete a room, cascading to its slots and ledger rows.
    fn remove_room(&self, room_id: &str) -> BoxFuture<'static, StorageResult<bool>>;
    /// Replace the tracked slot set of a room.
    fn set_tracked_slots(
        &self,
        room_id: &str,
        slots: BTreeSet<SlotId>,
    ) -> BoxFuture<'static, StorageResult<()>>;
    /// Persist the outcome of a successful room setup.
    fn record_setup(
        &self,
        room_id: &str,
        tracker_handle: String,
        game_checksums: BTreeMap<String, String>,
    ) -> BoxFuture<'static, StorageResult<()>>;

    /// Whether the manifest of `(game, checksum)` was stored completely.
    fn has_datapackage(&self, game: &str, checksum: &str)
    -> BoxFuture<'static, StorageResult<bool>>;
    fn insert_datapackage(
        &self,
        entries: Vec<DatapackageEntry>,
    ) -> BoxFuture<'static, StorageResult<()>>;
    /// Record that every entry of `(game, checksum)` is stored. Call after [`Self::insert_datapackage`].
    fn mark_datapackage_complete(
        &self,
        game: &str,
        checksum: &str,
    ) -> BoxFuture<'static, StorageResult<()>>;
    fn entity_name(&self, key: DatapackageKey)
    -> BoxFuture<'static, StorageResult<Option<String>>>;

    fn load_ledger(&self, room_id: &str) -> BoxFuture<'static, StorageResult<LedgerSnapshot>>;
    /// Write ledger rows, hint fulfilments and finished-slot removals in one batch.
    ///
    /// A failed commit leaves the ledger untouched on backends with transactions.
    fn commit_ledger(&self, batch: LedgerBatch) -> BoxFuture<'static, StorageResult<()>>;

    fn device_tokens(&self) -> BoxFuture<'static, StorageResult<Vec<String>>>;
    fn register_device(&self, token: String) -> BoxFuture<'static, StorageResult<()>>;
    fn remove_device_tokens(&self, tokens: Vec<String>) -> BoxFuture<'static, StorageResult<u64>>;

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>>;
    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>>;
}
