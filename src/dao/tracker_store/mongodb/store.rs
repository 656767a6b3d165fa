use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use futures::{TryStreamExt, future::BoxFuture};
use mongodb::{
    Client, ClientSession, Collection, Database,
    bson::{DateTime, Document, doc},
    error::{Error as MongoError, ErrorKind, WriteFailure},
    options::IndexOptions,
};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::{
    config::MongoConfig,
    connection::establish_connection,
    error::{MongoDaoError, MongoResult},
    models::{
        MongoDatapackageDocument, MongoDeviceDocument, MongoNotifiedItemDocument,
        MongoRevealedHintDocument, MongoRoomDocument, datapackage_filter, hint_filter,
        item_filter,
    },
};
use crate::dao::{
    models::{
        DatapackageEntry, DatapackageKey, LedgerBatch, LedgerSnapshot, NotifiedItemEntity,
        RevealedHintEntity, SlotId, TrackedRoomEntity,
    },
    storage::StorageResult,
    tracker_store::TrackerStore,
};

const ROOMS: &str = "tracked_rooms";
const DATAPACKAGE: &str = "datapackage_cache";
const DATAPACKAGE_MANIFESTS: &str = "datapackage_manifests";
const NOTIFIED_ITEMS: &str = "notified_items";
const REVEALED_HINTS: &str = "revealed_hints";
const DEVICES: &str = "devices";

const DUPLICATE_KEY: i32 = 11000;

/// Unique indexes backing the idempotent inserts.
const UNIQUE_INDEXES: &[(&str, &str, &[&str])] = &[
    (
        DATAPACKAGE,
        "game_checksum_entity_uc",
        &["game", "checksum", "entity_type", "entity_id"],
    ),
    (
        DATAPACKAGE_MANIFESTS,
        "game_checksum_uc",
        &["game", "checksum"],
    ),
    (
        NOTIFIED_ITEMS,
        "item_event_uc",
        &["room_id", "receiving_slot_id", "item_id", "location_id"],
    ),
    (
        REVEALED_HINTS,
        "hint_event_uc",
        &[
            "room_id",
            "item_owner_id",
            "location_owner_id",
            "item_id",
            "location_id",
        ],
    ),
    (DEVICES, "fcm_token_uc", &["fcm_token"]),
];

#[derive(Clone)]
pub struct MongoTrackerStore {
    inner: Arc<MongoInner>,
}

struct MongoInner {
    state: RwLock<MongoState>,
    config: MongoConfig,
}

struct MongoState {
    client: Client,
    database: Database,
    /// Replica set or sharded cluster: multi-document transactions are available.
    transactions: bool,
}

impl MongoInner {
    async fn ping(&self) -> MongoResult<()> {
        let database = {
            let guard = self.state.read().await;
            guard.database.clone()
        };

        database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|source| MongoDaoError::HealthPing { source })?;
        Ok(())
    }

    async fn reconnect(&self) -> MongoResult<()> {
        let (client, database) =
            establish_connection(&self.config.options, &self.config.database_name).await?;
        let transactions = supports_transactions(&database).await;
        let mut guard = self.state.write().await;
        guard.client = client;
        guard.database = database;
        guard.transactions = transactions;
        Ok(())
    }
}

/// Ask the server whether it is a replica set member or a `mongos` router.
async fn supports_transactions(database: &Database) -> bool {
    match database.run_command(doc! { "hello": 1 }).await {
        Ok(reply) => {
            let replicated = reply.get_str("setName").is_ok()
                || reply.get_str("msg").is_ok_and(|msg| msg == "isdbgrid");
            if !replicated {
                warn!("MongoDB is a standalone server; ledger commits run without a transaction");
            }
            replicated
        }
        Err(err) => {
            warn!(error = %err, "MongoDB hello failed; ledger commits run without a transaction");
            false
        }
    }
}

/// True when every failure in `err` is a unique-key violation.
fn is_duplicate_only(err: &MongoError) -> bool {
    match err.kind.as_ref() {
        ErrorKind::InsertMany(failure) => {
            failure.write_concern_error.is_none()
                && failure
                    .write_errors
                    .as_ref()
                    .is_some_and(|errors| errors.iter().all(|e| e.code == DUPLICATE_KEY))
        }
        ErrorKind::Write(WriteFailure::WriteError(write)) => write.code == DUPLICATE_KEY,
        _ => false,
    }
}

/// Map a duplicate-key outcome of an idempotent insert to success.
fn ignore_duplicates<T>(result: Result<T, MongoError>) -> Result<(), MongoError> {
    match result {
        Ok(_) => Ok(()),
        Err(err) if is_duplicate_only(&err) => {
            debug!("insert hit existing rows; treating as already recorded");
            Ok(())
        }
        Err(err) => Err(err),
    }
}

impl MongoTrackerStore {
    /// Establish a connection to MongoDB and ensure indexes are present.
    pub async fn connect(config: MongoConfig) -> MongoResult<Self> {
        let (client, database) =
            establish_connection(&config.options, &config.database_name).await?;
        let transactions = supports_transactions(&database).await;

        let inner = Arc::new(MongoInner {
            state: RwLock::new(MongoState {
                client,
                database,
                transactions,
            }),
            config,
        });

        let store = Self { inner };
        store.ensure_indexes().await?;
        Ok(store)
    }

    async fn ensure_indexes(&self) -> MongoResult<()> {
        let database = self.database().await;
        for (collection_name, index_name, fields) in UNIQUE_INDEXES {
            let mut keys = Document::new();
            for field in fields.iter() {
                keys.insert(*field, 1);
            }
            let index = mongodb::IndexModel::builder()
                .keys(keys)
                .options(
                    IndexOptions::builder()
                        .name(Some((*index_name).to_owned()))
                        .unique(Some(true))
                        .build(),
                )
                .build();

            database
                .collection::<Document>(collection_name)
                .create_index(index)
                .await
                .map_err(|source| MongoDaoError::EnsureIndex {
                    collection: *collection_name,
                    index: *index_name,
                    source,
                })?;
        }

        Ok(())
    }

    async fn database(&self) -> Database {
        let guard = self.inner.state.read().await;
        guard.database.clone()
    }

    async fn client(&self) -> (Client, bool) {
        let guard = self.inner.state.read().await;
        (guard.client.clone(), guard.transactions)
    }

    async fn collection<T: Send + Sync>(&self, name: &str) -> Collection<T> {
        self.database().await.collection::<T>(name)
    }

    async fn list_rooms(&self) -> MongoResult<Vec<TrackedRoomEntity>> {
        let documents: Vec<MongoRoomDocument> = self
            .collection::<MongoRoomDocument>(ROOMS)
            .await
            .find(doc! {})
            .await
            .map_err(|source| MongoDaoError::ListRooms { source })?
            .try_collect()
            .await
            .map_err(|source| MongoDaoError::ListRooms { source })?;

        Ok(documents.into_iter().map(Into::into).collect())
    }

    async fn find_room(&self, room_id: &str) -> MongoResult<Option<TrackedRoomEntity>> {
        let document = self
            .collection::<MongoRoomDocument>(ROOMS)
            .await
            .find_one(doc! { "_id": room_id })
            .await
            .map_err(|source| MongoDaoError::LoadRoom {
                room_id: room_id.to_owned(),
                source,
            })?;
        Ok(document.map(Into::into))
    }

    async fn add_room(&self, room: TrackedRoomEntity) -> MongoResult<bool> {
        let room_id = room.room_id.clone();
        let document: MongoRoomDocument = room.into();
        match self
            .collection::<MongoRoomDocument>(ROOMS)
            .await
            .insert_one(&document)
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if is_duplicate_only(&err) => Ok(false),
            Err(source) => Err(MongoDaoError::SaveRoom { room_id, source }),
        }
    }

    async fn remove_room(&self, room_id: &str) -> MongoResult<bool> {
        let delete_error = |source| MongoDaoError::DeleteRoom {
            room_id: room_id.to_owned(),
            source,
        };
        let result = self
            .collection::<MongoRoomDocument>(ROOMS)
            .await
            .delete_one(doc! { "_id": room_id })
            .await
            .map_err(delete_error)?;

        for ledger in [NOTIFIED_ITEMS, REVEALED_HINTS] {
            self.collection::<Document>(ledger)
                .await
                .delete_many(doc! { "room_id": room_id })
                .await
                .map_err(delete_error)?;
        }

        Ok(result.deleted_count > 0)
    }

    async fn update_room(&self, room_id: &str, update: Document) -> MongoResult<()> {
        let result = self
            .collection::<MongoRoomDocument>(ROOMS)
            .await
            .update_one(doc! { "_id": room_id }, update)
            .await
            .map_err(|source| MongoDaoError::SaveRoom {
                room_id: room_id.to_owned(),
                source,
            })?;

        if result.matched_count == 0 {
            return Err(MongoDaoError::RoomNotFound {
                room_id: room_id.to_owned(),
            });
        }
        Ok(())
    }

    async fn has_datapackage(&self, game: &str, checksum: &str) -> MongoResult<bool> {
        let found = self
            .collection::<Document>(DATAPACKAGE_MANIFESTS)
            .await
            .find_one(doc! { "game": game, "checksum": checksum })
            .await
            .map_err(|source| MongoDaoError::LoadDatapackage {
                game: game.to_owned(),
                checksum: checksum.to_owned(),
                source,
            })?;
        Ok(found.is_some())
    }

    async fn insert_datapackage(&self, entries: Vec<DatapackageEntry>) -> MongoResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let count = entries.len();
        let documents: Vec<MongoDatapackageDocument> =
            entries.into_iter().map(Into::into).collect();
        let result = self
            .collection::<MongoDatapackageDocument>(DATAPACKAGE)
            .await
            .insert_many(documents)
            .ordered(false)
            .await;
        ignore_duplicates(result).map_err(|source| MongoDaoError::SaveDatapackage { count, source })
    }

    async fn mark_datapackage_complete(&self, game: &str, checksum: &str) -> MongoResult<()> {
        let result = self
            .collection::<Document>(DATAPACKAGE_MANIFESTS)
            .await
            .update_one(
                doc! { "game": game, "checksum": checksum },
                doc! { "$setOnInsert": { "completed_at": DateTime::now() } },
            )
            .upsert(true)
            .await;
        ignore_duplicates(result).map_err(|source| MongoDaoError::MarkDatapackage {
            game: game.to_owned(),
            checksum: checksum.to_owned(),
            source,
        })
    }

    async fn entity_name(&self, key: DatapackageKey) -> MongoResult<Option<String>> {
        let document = self
            .collection::<MongoDatapackageDocument>(DATAPACKAGE)
            .await
            .find_one(datapackage_filter(&key))
            .await
            .map_err(|source| MongoDaoError::LoadDatapackage {
                game: key.game.clone(),
                checksum: key.checksum.clone(),
                source,
            })?;
        Ok(document.map(|doc| doc.entity_name))
    }

    async fn load_ledger(&self, room_id: &str) -> MongoResult<LedgerSnapshot> {
        let load_error = |source| MongoDaoError::LoadLedger {
            room_id: room_id.to_owned(),
            source,
        };

        let items: Vec<MongoNotifiedItemDocument> = self
            .collection::<MongoNotifiedItemDocument>(NOTIFIED_ITEMS)
            .await
            .find(doc! { "room_id": room_id })
            .await
            .map_err(load_error)?
            .try_collect()
            .await
            .map_err(load_error)?;

        let hints: Vec<MongoRevealedHintDocument> = self
            .collection::<MongoRevealedHintDocument>(REVEALED_HINTS)
            .await
            .find(doc! { "room_id": room_id })
            .await
            .map_err(load_error)?
            .try_collect()
            .await
            .map_err(load_error)?;

        Ok(LedgerSnapshot {
            items: items.iter().filter_map(|item| item.key()).collect(),
            hints: hints
                .iter()
                .filter_map(|hint| hint.key().map(|key| (key, hint.found)))
                .collect(),
        })
    }

    /// Commit `batch` inside a transaction when the deployment supports one.
    ///
    /// Rows are upserted so a retried batch never trips the unique indexes,
    /// which would abort the transaction.
    async fn commit_ledger(&self, batch: LedgerBatch) -> MongoResult<()> {
        let room_id = batch.room_id.clone();
        let commit_error = |source| MongoDaoError::CommitLedger {
            room_id: room_id.clone(),
            source,
        };

        let (client, transactions) = self.client().await;
        let mut session = client.start_session().await.map_err(commit_error)?;
        if !transactions {
            return self.write_ledger(&mut session, batch).await;
        }

        session.start_transaction().await.map_err(commit_error)?;
        match self.write_ledger(&mut session, batch).await {
            Ok(()) => session.commit_transaction().await.map_err(commit_error),
            Err(err) => {
                if let Err(abort) = session.abort_transaction().await {
                    debug!(room_id = %room_id, error = %abort, "ledger transaction abort failed");
                }
                Err(err)
            }
        }
    }

    async fn write_ledger(&self, session: &mut ClientSession, batch: LedgerBatch) -> MongoResult<()> {
        let LedgerBatch {
            room_id,
            items,
            hints,
            found_hints,
            finished_slots,
        } = batch;
        let commit_error = |source| MongoDaoError::CommitLedger {
            room_id: room_id.clone(),
            source,
        };

        let slots: Vec<i64> = finished_slots.into_iter().map(i64::from).collect();
        let updated = self
            .collection::<MongoRoomDocument>(ROOMS)
            .await
            .update_one(
                doc! { "_id": room_id.as_str() },
                doc! { "$pull": { "slots": { "$in": slots } } },
            )
            .session(&mut *session)
            .await
            .map_err(commit_error)?;
        if updated.matched_count == 0 {
            return Err(MongoDaoError::RoomNotFound {
                room_id: room_id.clone(),
            });
        }

        let item_collection = self.collection::<Document>(NOTIFIED_ITEMS).await;
        for item in items {
            let NotifiedItemEntity {
                key, notified_at, ..
            } = item;
            item_collection
                .update_one(
                    item_filter(&room_id, &key),
                    doc! { "$setOnInsert": { "notified_at": DateTime::from_system_time(notified_at) } },
                )
                .upsert(true)
                .session(&mut *session)
                .await
                .map_err(commit_error)?;
        }

        let hint_collection = self.collection::<Document>(REVEALED_HINTS).await;
        for hint in hints {
            let RevealedHintEntity {
                key,
                found,
                notified_at,
                ..
            } = hint;
            hint_collection
                .update_one(
                    hint_filter(&room_id, &key),
                    doc! {
                        "$setOnInsert": {
                            "found": found,
                            "notified_at": DateTime::from_system_time(notified_at),
                        }
                    },
                )
                .upsert(true)
                .session(&mut *session)
                .await
                .map_err(commit_error)?;
        }

        for key in found_hints {
            hint_collection
                .update_one(hint_filter(&room_id, &key), doc! { "$set": { "found": true } })
                .session(&mut *session)
                .await
                .map_err(commit_error)?;
        }

        Ok(())
    }

    async fn device_tokens(&self) -> MongoResult<Vec<String>> {
        let documents: Vec<MongoDeviceDocument> = self
            .collection::<MongoDeviceDocument>(DEVICES)
            .await
            .find(doc! {})
            .await
            .map_err(|source| MongoDaoError::Devices { source })?
            .try_collect()
            .await
            .map_err(|source| MongoDaoError::Devices { source })?;
        Ok(documents.into_iter().map(|device| device.fcm_token).collect())
    }

    async fn register_device(&self, token: String) -> MongoResult<()> {
        let result = self
            .collection::<MongoDeviceDocument>(DEVICES)
            .await
            .insert_one(MongoDeviceDocument { fcm_token: token })
            .await;
        ignore_duplicates(result).map_err(|source| MongoDaoError::Devices { source })
    }

    async fn remove_device_tokens(&self, tokens: Vec<String>) -> MongoResult<u64> {
        let result = self
            .collection::<MongoDeviceDocument>(DEVICES)
            .await
            .delete_many(doc! { "fcm_token": { "$in": tokens } })
            .await
            .map_err(|source| MongoDaoError::Devices { source })?;
        Ok(result.deleted_count)
    }
}

impl TrackerStore for MongoTrackerStore {
    fn list_rooms(&self) -> BoxFuture<'static, StorageResult<Vec<TrackedRoomEntity>>> {
        let store = self.clone();
        Box::pin(async move { store.list_rooms().await.map_err(Into::into) })
    }

    fn find_room(
        &self,
        room_id: &str,
    ) -> BoxFuture<'static, StorageResult<Option<TrackedRoomEntity>>> {
        let store = self.clone();
        let room_id = room_id.to_owned();
        Box::pin(async move { store.find_room(&room_id).await.map_err(Into::into) })
    }

    fn add_room(&self, room: TrackedRoomEntity) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        Box::pin(async move { store.add_room(room).await.map_err(Into::into) })
    }

    fn remove_room(&self, room_id: &str) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        let room_id = room_id.to_owned();
        Box::pin(async move { store.remove_room(&room_id).await.map_err(Into::into) })
    }

    fn set_tracked_slots(
        &self,
        room_id: &str,
        slots: BTreeSet<SlotId>,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        let room_id = room_id.to_owned();
        Box::pin(async move {
            let slots: Vec<i64> = slots.into_iter().map(i64::from).collect();
            store
                .update_room(&room_id, doc! { "$set": { "slots": slots } })
                .await
                .map_err(Into::into)
        })
    }

    fn record_setup(
        &self,
        room_id: &str,
        tracker_handle: String,
        game_checksums: BTreeMap<String, String>,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        let room_id = room_id.to_owned();
        Box::pin(async move {
            let mut checksums = Document::new();
            for (game, checksum) in game_checksums {
                checksums.insert(game, checksum);
            }
            store
                .update_room(
                    &room_id,
                    doc! { "$set": { "tracker_handle": tracker_handle, "game_checksums": checksums } },
                )
                .await
                .map_err(Into::into)
        })
    }

    fn has_datapackage(
        &self,
        game: &str,
        checksum: &str,
    ) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        let (game, checksum) = (game.to_owned(), checksum.to_owned());
        Box::pin(async move {
            store
                .has_datapackage(&game, &checksum)
                .await
                .map_err(Into::into)
        })
    }

    fn insert_datapackage(
        &self,
        entries: Vec<DatapackageEntry>,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.insert_datapackage(entries).await.map_err(Into::into) })
    }

    fn mark_datapackage_complete(
        &self,
        game: &str,
        checksum: &str,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        let (game, checksum) = (game.to_owned(), checksum.to_owned());
        Box::pin(async move {
            store
                .mark_datapackage_complete(&game, &checksum)
                .await
                .map_err(Into::into)
        })
    }

    fn entity_name(
        &self,
        key: DatapackageKey,
    ) -> BoxFuture<'static, StorageResult<Option<String>>> {
        let store = self.clone();
        Box::pin(async move { store.entity_name(key).await.map_err(Into::into) })
    }

    fn load_ledger(&self, room_id: &str) -> BoxFuture<'static, StorageResult<LedgerSnapshot>> {
        let store = self.clone();
        let room_id = room_id.to_owned();
        Box::pin(async move { store.load_ledger(&room_id).await.map_err(Into::into) })
    }

    fn commit_ledger(&self, batch: LedgerBatch) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.commit_ledger(batch).await.map_err(Into::into) })
    }

    fn device_tokens(&self) -> BoxFuture<'static, StorageResult<Vec<String>>> {
        let store = self.clone();
        Box::pin(async move { store.device_tokens().await.map_err(Into::into) })
    }

    fn register_device(&self, token: String) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.register_device(token).await.map_err(Into::into) })
    }

    fn remove_device_tokens(&self, tokens: Vec<String>) -> BoxFuture<'static, StorageResult<u64>> {
        let store = self.clone();
        Box::pin(async move { store.remove_device_tokens(tokens).await.map_err(Into::into) })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.inner.ping().await.map_err(Into::into) })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.inner.reconnect().await.map_err(Into::into) })
    }
}
