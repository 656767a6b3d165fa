use std::collections::BTreeMap;

use mongodb::bson::{DateTime, Document, doc};
use serde::{Deserialize, Serialize};

use crate::dao::models::{
    DatapackageEntry, DatapackageKey, EntityKind, HintKey, ItemKey, SlotId, TrackedRoomEntity,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoRoomDocument {
    #[serde(rename = "_id")]
    pub room_id: String,
    pub alias: String,
    #[serde(default)]
    pub tracker_handle: Option<String>,
    #[serde(default)]
    pub game_checksums: BTreeMap<String, String>,
    #[serde(default)]
    pub slots: Vec<i64>,
}

impl From<TrackedRoomEntity> for MongoRoomDocument {
    fn from(value: TrackedRoomEntity) -> Self {
        Self {
            room_id: value.room_id,
            alias: value.alias,
            tracker_handle: value.tracker_handle,
            game_checksums: value.game_checksums,
            slots: value.slots.into_iter().map(i64::from).collect(),
        }
    }
}

impl From<MongoRoomDocument> for TrackedRoomEntity {
    fn from(value: MongoRoomDocument) -> Self {
        Self {
            room_id: value.room_id,
            alias: value.alias,
            tracker_handle: value.tracker_handle,
            game_checksums: value.game_checksums,
            slots: value
                .slots
                .into_iter()
                .filter_map(|slot| SlotId::try_from(slot).ok())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoDatapackageDocument {
    pub game: String,
    pub checksum: String,
    pub entity_type: EntityKind,
    pub entity_id: i64,
    pub entity_name: String,
}

impl From<DatapackageEntry> for MongoDatapackageDocument {
    fn from(value: DatapackageEntry) -> Self {
        let DatapackageKey {
            game,
            checksum,
            kind,
            entity_id,
        } = value.key;
        Self {
            game,
            checksum,
            entity_type: kind,
            entity_id,
            entity_name: value.entity_name,
        }
    }
}

pub fn datapackage_filter(key: &DatapackageKey) -> Document {
    doc! {
        "game": &key.game,
        "checksum": &key.checksum,
        "entity_type": key.kind.as_str(),
        "entity_id": key.entity_id,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoNotifiedItemDocument {
    pub room_id: String,
    pub receiving_slot_id: i64,
    pub item_id: i64,
    pub location_id: i64,
    pub notified_at: DateTime,
}

impl MongoNotifiedItemDocument {
    pub fn key(&self) -> Option<ItemKey> {
        Some(ItemKey {
            receiving_slot: SlotId::try_from(self.receiving_slot_id).ok()?,
            item_id: self.item_id,
            location_id: self.location_id,
        })
    }
}

pub fn item_filter(room_id: &str, key: &ItemKey) -> Document {
    doc! {
        "room_id": room_id,
        "receiving_slot_id": i64::from(key.receiving_slot),
        "item_id": key.item_id,
        "location_id": key.location_id,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoRevealedHintDocument {
    pub room_id: String,
    pub item_owner_id: i64,
    pub location_owner_id: i64,
    pub item_id: i64,
    pub location_id: i64,
    #[serde(default)]
    pub found: bool,
    pub notified_at: DateTime,
}

impl MongoRevealedHintDocument {
    pub fn key(&self) -> Option<HintKey> {
        Some(HintKey {
            item_owner: SlotId::try_from(self.item_owner_id).ok()?,
            location_owner: SlotId::try_from(self.location_owner_id).ok()?,
            item_id: self.item_id,
            location_id: self.location_id,
        })
    }
}

pub fn hint_filter(room_id: &str, key: &HintKey) -> Document {
    doc! {
        "room_id": room_id,
        "item_owner_id": i64::from(key.item_owner),
        "location_owner_id": i64::from(key.location_owner),
        "item_id": key.item_id,
        "location_id": key.location_id,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoDeviceDocument {
    pub fcm_token: String,
}
