use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    fmt,
    time::SystemTime,
};

use serde::{Deserialize, Serialize};

/// 1-based player position inside a room.
pub type SlotId = u32;

/// Room tracked by this deployment together with the slots it cares about.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackedRoomEntity {
    /// Identifier of the room on the remote service (unique).
    pub room_id: String,
    /// Display name used as notification prefix.
    pub alias: String,
    /// Tracker handle resolved during setup; `None` until setup succeeds.
    pub tracker_handle: Option<String>,
    /// Datapackage checksum per game active in this room.
    pub game_checksums: BTreeMap<String, String>,
    /// Tracked player positions.
    pub slots: BTreeSet<SlotId>,
}

impl TrackedRoomEntity {
    /// Fresh room as created by the CRUD layer, before any setup.
    pub fn new(room_id: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            alias: alias.into(),
            tracker_handle: None,
            game_checksums: BTreeMap::new(),
            slots: BTreeSet::new(),
        }
    }
}

/// Kind of entity described by a datapackage manifest.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Item,
    Location,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Item => "item",
            EntityKind::Location => "location",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lookup key of a cached datapackage name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatapackageKey {
    pub game: String,
    pub checksum: String,
    pub kind: EntityKind,
    pub entity_id: i64,
}

/// One cached `(game, checksum, kind, id) -> name` row. Write-once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatapackageEntry {
    pub key: DatapackageKey,
    pub entity_name: String,
}

/// Identity of a progression item delivery already notified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemKey {
    pub receiving_slot: SlotId,
    pub item_id: i64,
    pub location_id: i64,
}

/// Identity of a hint already surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HintKey {
    pub item_owner: SlotId,
    pub location_owner: SlotId,
    pub item_id: i64,
    pub location_id: i64,
}

/// Ledger row for a notified item delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifiedItemEntity {
    pub room_id: String,
    pub key: ItemKey,
    pub notified_at: SystemTime,
}

/// Ledger row for a revealed hint, with the fulfilment flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevealedHintEntity {
    pub room_id: String,
    pub key: HintKey,
    pub found: bool,
    pub notified_at: SystemTime,
}

/// Per-room view of the dedup ledger loaded at the start of a cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerSnapshot {
    /// Item deliveries already notified.
    pub items: HashSet<ItemKey>,
    /// Hints already surfaced, with their current `found` flag.
    pub hints: HashMap<HintKey, bool>,
}

/// Everything a cycle writes back, committed as one batch before dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerBatch {
    pub room_id: String,
    pub items: Vec<NotifiedItemEntity>,
    pub hints: Vec<RevealedHintEntity>,
    /// Existing unfound hints fulfilled during this cycle.
    pub found_hints: Vec<HintKey>,
    /// Tracked slots whose player finished.
    pub finished_slots: Vec<SlotId>,
}

impl LedgerBatch {
    pub fn new(room_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            items: Vec::new(),
            hints: Vec::new(),
            found_hints: Vec::new(),
            finished_slots: Vec::new(),
        }
    }

    /// Whether committing this batch would write anything.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
            && self.hints.is_empty()
            && self.found_hints.is_empty()
            && self.finished_slots.is_empty()
    }
}
