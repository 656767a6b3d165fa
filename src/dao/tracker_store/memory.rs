//! Process-local [`TrackerStore`] keeping the same uniqueness and cascade rules as
//! the database backends. Used by tests and by `STORAGE_BACKEND=memory`.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    sync::Arc,
};

use futures::future::BoxFuture;
use tokio::sync::RwLock;

use crate::dao::{
    models::{
        DatapackageEntry, DatapackageKey, HintKey, ItemKey, LedgerBatch, LedgerSnapshot,
        NotifiedItemEntity, RevealedHintEntity, SlotId, TrackedRoomEntity,
    },
    storage::{StorageError, StorageResult},
    tracker_store::TrackerStore,
};

#[derive(Clone, Default)]
pub struct MemoryTrackerStore {
    inner: Arc<RwLock<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    rooms: BTreeMap<String, TrackedRoomEntity>,
    /// `(game, checksum)` manifests stored completely.
    packages: HashSet<(String, String)>,
    names: HashMap<DatapackageKey, String>,
    items: HashMap<(String, ItemKey), NotifiedItemEntity>,
    hints: HashMap<(String, HintKey), RevealedHintEntity>,
    devices: BTreeSet<String>,
}

impl MemoryTrackerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of item ledger rows recorded for `room_id`.
    pub async fn item_rows(&self, room_id: &str) -> usize {
        let guard = self.inner.read().await;
        guard.items.keys().filter(|(room, _)| room == room_id).count()
    }

    /// Rename a tracked room in place.
    #[cfg(test)]
    pub async fn set_alias(&self, room_id: &str, alias: &str) {
        if let Some(room) = self.inner.write().await.rooms.get_mut(room_id) {
            room.alias = alias.to_owned();
        }
    }

    /// Hint ledger rows recorded for `room_id`.
    pub async fn hint_rows(&self, room_id: &str) -> Vec<RevealedHintEntity> {
        let guard = self.inner.read().await;
        guard
            .hints
            .iter()
            .filter(|((room, _), _)| room == room_id)
            .map(|(_, hint)| hint.clone())
            .collect()
    }
}

fn room_not_found(room_id: &str) -> StorageError {
    StorageError::RoomNotFound {
        room_id: room_id.to_owned(),
    }
}

impl TrackerStore for MemoryTrackerStore {
    fn list_rooms(&self) -> BoxFuture<'static, StorageResult<Vec<TrackedRoomEntity>>> {
        let inner = self.inner.clone();
        Box::pin(async move { Ok(inner.read().await.rooms.values().cloned().collect()) })
    }

    fn find_room(
        &self,
        room_id: &str,
    ) -> BoxFuture<'static, StorageResult<Option<TrackedRoomEntity>>> {
        let inner = self.inner.clone();
        let room_id = room_id.to_owned();
        Box::pin(async move { Ok(inner.read().await.rooms.get(&room_id).cloned()) })
    }

    fn add_room(&self, room: TrackedRoomEntity) -> BoxFuture<'static, StorageResult<bool>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let mut guard = inner.write().await;
            if guard.rooms.contains_key(&room.room_id) {
                return Ok(false);
            }
            guard.rooms.insert(room.room_id.clone(), room);
            Ok(true)
        })
    }

    fn remove_room(&self, room_id: &str) -> BoxFuture<'static, StorageResult<bool>> {
        let inner = self.inner.clone();
        let room_id = room_id.to_owned();
        Box::pin(async move {
            let mut guard = inner.write().await;
            let removed = guard.rooms.remove(&room_id).is_some();
            guard.items.retain(|(room, _), _| *room != room_id);
            guard.hints.retain(|(room, _), _| *room != room_id);
            Ok(removed)
        })
    }

    fn set_tracked_slots(
        &self,
        room_id: &str,
        slots: BTreeSet<SlotId>,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let inner = self.inner.clone();
        let room_id = room_id.to_owned();
        Box::pin(async move {
            let mut guard = inner.write().await;
            let room = guard
                .rooms
                .get_mut(&room_id)
                .ok_or_else(|| room_not_found(&room_id))?;
            room.slots = slots;
            Ok(())
        })
    }

    fn record_setup(
        &self,
        room_id: &str,
        tracker_handle: String,
        game_checksums: BTreeMap<String, String>,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let inner = self.inner.clone();
        let room_id = room_id.to_owned();
        Box::pin(async move {
            let mut guard = inner.write().await;
            let room = guard
                .rooms
                .get_mut(&room_id)
                .ok_or_else(|| room_not_found(&room_id))?;
            room.tracker_handle = Some(tracker_handle);
            room.game_checksums = game_checksums;
            Ok(())
        })
    }

    fn has_datapackage(
        &self,
        game: &str,
        checksum: &str,
    ) -> BoxFuture<'static, StorageResult<bool>> {
        let inner = self.inner.clone();
        let key = (game.to_owned(), checksum.to_owned());
        Box::pin(async move { Ok(inner.read().await.packages.contains(&key)) })
    }

    fn insert_datapackage(
        &self,
        entries: Vec<DatapackageEntry>,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let mut guard = inner.write().await;
            for entry in entries {
                guard.names.entry(entry.key).or_insert(entry.entity_name);
            }
            Ok(())
        })
    }

    fn mark_datapackage_complete(
        &self,
        game: &str,
        checksum: &str,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let inner = self.inner.clone();
        let key = (game.to_owned(), checksum.to_owned());
        Box::pin(async move {
            inner.write().await.packages.insert(key);
            Ok(())
        })
    }

    fn entity_name(
        &self,
        key: DatapackageKey,
    ) -> BoxFuture<'static, StorageResult<Option<String>>> {
        let inner = self.inner.clone();
        Box::pin(async move { Ok(inner.read().await.names.get(&key).cloned()) })
    }

    fn load_ledger(&self, room_id: &str) -> BoxFuture<'static, StorageResult<LedgerSnapshot>> {
        let inner = self.inner.clone();
        let room_id = room_id.to_owned();
        Box::pin(async move {
            let guard = inner.read().await;
            let items = guard
                .items
                .keys()
                .filter(|(room, _)| *room == room_id)
                .map(|(_, key)| *key)
                .collect();
            let hints = guard
                .hints
                .iter()
                .filter(|((room, _), _)| *room == room_id)
                .map(|((_, key), hint)| (*key, hint.found))
                .collect();
            Ok(LedgerSnapshot { items, hints })
        })
    }

    fn commit_ledger(&self, batch: LedgerBatch) -> BoxFuture<'static, StorageResult<()>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let mut guard = inner.write().await;
            let LedgerBatch {
                room_id,
                items,
                hints,
                found_hints,
                finished_slots,
            } = batch;

            let room = guard
                .rooms
                .get_mut(&room_id)
                .ok_or_else(|| room_not_found(&room_id))?;
            for slot in &finished_slots {
                room.slots.remove(slot);
            }

            for item in items {
                guard
                    .items
                    .entry((room_id.clone(), item.key))
                    .or_insert(item);
            }
            for hint in hints {
                guard
                    .hints
                    .entry((room_id.clone(), hint.key))
                    .or_insert(hint);
            }
            for key in found_hints {
                if let Some(hint) = guard.hints.get_mut(&(room_id.clone(), key)) {
                    hint.found = true;
                }
            }
            Ok(())
        })
    }

    fn device_tokens(&self) -> BoxFuture<'static, StorageResult<Vec<String>>> {
        let inner = self.inner.clone();
        Box::pin(async move { Ok(inner.read().await.devices.iter().cloned().collect()) })
    }

    fn register_device(&self, token: String) -> BoxFuture<'static, StorageResult<()>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            inner.write().await.devices.insert(token);
            Ok(())
        })
    }

    fn remove_device_tokens(&self, tokens: Vec<String>) -> BoxFuture<'static, StorageResult<u64>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let mut guard = inner.write().await;
            let removed = tokens
                .iter()
                .filter(|token| guard.devices.remove(token.as_str()))
                .count();
            Ok(removed as u64)
        })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        Box::pin(async { Ok(()) })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;
    use crate::dao::models::EntityKind;

    fn item(room: &str, slot: SlotId, item_id: i64, location_id: i64) -> NotifiedItemEntity {
        NotifiedItemEntity {
            room_id: room.into(),
            key: ItemKey {
                receiving_slot: slot,
                item_id,
                location_id,
            },
            notified_at: SystemTime::now(),
        }
    }

    #[tokio::test]
    async fn duplicate_ledger_rows_are_accepted_once() {
        let store = MemoryTrackerStore::new();
        store.add_room(TrackedRoomEntity::new("r", "Room")).await.unwrap();

        let mut batch = LedgerBatch::new("r");
        batch.items.push(item("r", 1, 50, 10));
        store.commit_ledger(batch.clone()).await.unwrap();
        store.commit_ledger(batch).await.unwrap();

        assert_eq!(store.item_rows("r").await, 1);
    }

    #[tokio::test]
    async fn removing_room_cascades_to_ledger() {
        let store = MemoryTrackerStore::new();
        store.add_room(TrackedRoomEntity::new("r", "Room")).await.unwrap();
        let mut batch = LedgerBatch::new("r");
        batch.items.push(item("r", 1, 50, 10));
        store.commit_ledger(batch).await.unwrap();

        assert!(store.remove_room("r").await.unwrap());
        assert_eq!(store.item_rows("r").await, 0);
        assert!(store.find_room("r").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn commit_for_deleted_room_fails() {
        let store = MemoryTrackerStore::new();
        let mut batch = LedgerBatch::new("gone");
        batch.items.push(item("gone", 1, 1, 1));

        let err = store.commit_ledger(batch).await.unwrap_err();
        assert!(matches!(err, StorageError::RoomNotFound { .. }));
        assert_eq!(store.item_rows("gone").await, 0);
    }

    #[tokio::test]
    async fn entries_without_completion_mark_are_not_cached() {
        let store = MemoryTrackerStore::new();
        store
            .insert_datapackage(vec![DatapackageEntry {
                key: DatapackageKey {
                    game: "Clique".into(),
                    checksum: "abc".into(),
                    kind: EntityKind::Item,
                    entity_id: 1,
                },
                entity_name: "Button".into(),
            }])
            .await
            .unwrap();
        assert!(!store.has_datapackage("Clique", "abc").await.unwrap());

        store.mark_datapackage_complete("Clique", "abc").await.unwrap();
        assert!(store.has_datapackage("Clique", "abc").await.unwrap());
        assert!(!store.has_datapackage("Clique", "def").await.unwrap());
    }

    #[tokio::test]
    async fn datapackage_entries_are_write_once() {
        let store = MemoryTrackerStore::new();
        let key = DatapackageKey {
            game: "Clique".into(),
            checksum: "abc".into(),
            kind: EntityKind::Item,
            entity_id: 1,
        };
        let entry = |name: &str| DatapackageEntry {
            key: key.clone(),
            entity_name: name.into(),
        };
        store.insert_datapackage(vec![entry("Button")]).await.unwrap();
        store.insert_datapackage(vec![entry("Other")]).await.unwrap();
        store.mark_datapackage_complete("Clique", "abc").await.unwrap();

        assert!(store.has_datapackage("Clique", "abc").await.unwrap());
        assert_eq!(
            store.entity_name(key).await.unwrap().as_deref(),
            Some("Button")
        );
    }
}
