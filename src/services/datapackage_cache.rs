use std::{collections::BTreeMap, sync::Arc};

use tracing::{debug, info, warn};

use crate::{
    dao::{
        models::{DatapackageEntry, DatapackageKey, EntityKind},
        tracker_store::TrackerStore,
    },
    error::ServiceError,
    remote::{RoomApi, models::GamePackage},
};

/// Write-once cache of datapackage names, filled lazily from the remote service.
#[derive(Clone)]
pub struct DatapackageCache {
    store: Arc<dyn TrackerStore>,
    remote: Arc<dyn RoomApi>,
}

impl DatapackageCache {
    pub fn new(store: Arc<dyn TrackerStore>, remote: Arc<dyn RoomApi>) -> Self {
        Self { store, remote }
    }

    /// Make sure `(game, checksum)` is cached. Returns `true` when it was fetched now.
    ///
    /// A pair is only marked complete after all of its rows are stored, so an
    /// interrupted fill is fetched again on the next call.
    pub async fn ensure_cached(&self, game: &str, checksum: &str) -> Result<bool, ServiceError> {
        if self.store.has_datapackage(game, checksum).await? {
            debug!(game, checksum, "datapackage already cached");
            return Ok(false);
        }

        let package = self.remote.datapackage(game, checksum).await?;
        let entries = manifest_entries(game, checksum, &package);
        let count = entries.len();
        self.store.insert_datapackage(entries).await?;
        self.store.mark_datapackage_complete(game, checksum).await?;
        info!(game, checksum, count, "cached datapackage");
        Ok(true)
    }

    /// Name of `id` in the given game manifest, or `ID {id}` when unknown.
    pub async fn resolve_name(
        &self,
        game: &str,
        checksum: Option<&str>,
        kind: EntityKind,
        id: i64,
    ) -> String {
        let fallback = || format!("ID {id}");
        let Some(checksum) = checksum else {
            return fallback();
        };

        let key = DatapackageKey {
            game: game.to_owned(),
            checksum: checksum.to_owned(),
            kind,
            entity_id: id,
        };
        match self.store.entity_name(key).await {
            Ok(Some(name)) => name,
            Ok(None) => fallback(),
            Err(err) => {
                warn!(game, %kind, id, error = %err, "datapackage lookup failed");
                fallback()
            }
        }
    }
}

/// Flatten a manifest into cache rows, one per `(kind, id)`.
///
/// Ids listed under several names keep the lexicographically first one.
fn manifest_entries(game: &str, checksum: &str, package: &GamePackage) -> Vec<DatapackageEntry> {
    let mut rows: BTreeMap<(EntityKind, i64), &str> = BTreeMap::new();
    let sections = [
        (EntityKind::Item, &package.item_name_to_id),
        (EntityKind::Location, &package.location_name_to_id),
    ];
    for (kind, names) in sections {
        let mut sorted: Vec<_> = names.iter().collect();
        sorted.sort();
        for (name, id) in sorted {
            rows.entry((kind, *id)).or_insert(name.as_str());
        }
    }

    rows.into_iter()
        .map(|((kind, entity_id), name)| DatapackageEntry {
            key: DatapackageKey {
                game: game.to_owned(),
                checksum: checksum.to_owned(),
                kind,
                entity_id,
            },
            entity_name: name.to_owned(),
        })
        .collect()
}
