//! Wire shapes of the game-room service, limited to the fields the tracker consumes.

use std::collections::{BTreeMap, HashMap};

use serde::Deserialize;
use serde_json::Value;
use serde_with::{DisplayFromStr, serde_as};

use crate::dao::models::SlotId;

/// `GET /api/room_status/{room}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoomStatus {
    /// `[name, game]` per slot, slot `n` at index `n - 1`.
    #[serde(default)]
    pub players: Vec<(String, String)>,
    #[serde(default)]
    pub last_port: Option<u16>,
    #[serde(default)]
    pub tracker: Option<String>,
    #[serde(default)]
    pub datapackage_checksums: BTreeMap<String, String>,
}

/// Display name and game of every slot in a room.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roster {
    players: BTreeMap<SlotId, (String, String)>,
}

impl Roster {
    pub fn player_name(&self, slot: SlotId) -> String {
        self.players
            .get(&slot)
            .map(|(name, _)| name.clone())
            .unwrap_or_else(|| format!("P{slot}"))
    }

    pub fn game(&self, slot: SlotId) -> &str {
        self.players
            .get(&slot)
            .map(|(_, game)| game.as_str())
            .unwrap_or("Unknown")
    }

    pub fn slots(&self) -> impl Iterator<Item = SlotId> + '_ {
        self.players.keys().copied()
    }
}

impl From<&RoomStatus> for Roster {
    fn from(status: &RoomStatus) -> Self {
        let players = (1..)
            .zip(status.players.iter().cloned())
            .collect::<BTreeMap<SlotId, _>>();
        Self { players }
    }
}

/// `GET /api/tracker/{tracker}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TrackerPayload {
    #[serde(default)]
    pub player_status: Option<StatusPayload>,
    #[serde(default)]
    pub player_items_received: Vec<ReceivedItems>,
    #[serde(default)]
    pub hints: Vec<PlayerHints>,
}

/// Player status arrives either keyed by slot or as a list of records.
#[serde_as]
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StatusPayload {
    BySlot(#[serde_as(as = "HashMap<DisplayFromStr, _>")] HashMap<SlotId, i64>),
    Records(Vec<StatusRecord>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StatusRecord {
    Object { player: SlotId, status: i64 },
    Tuple(Vec<Value>),
}

/// Slot to status code lookup, independent of the upstream shape.
pub type SlotStatuses = HashMap<SlotId, i64>;

impl StatusPayload {
    pub fn normalize(&self) -> SlotStatuses {
        match self {
            StatusPayload::BySlot(map) => statuses_from_map(map),
            StatusPayload::Records(records) => statuses_from_records(records),
        }
    }
}

pub fn statuses_from_map(map: &HashMap<SlotId, i64>) -> SlotStatuses {
    map.clone()
}

/// Tuples are `[slot, status, ...]`; entries that do not fit are skipped.
pub fn statuses_from_records(records: &[StatusRecord]) -> SlotStatuses {
    records
        .iter()
        .filter_map(|record| match record {
            StatusRecord::Object { player, status } => Some((*player, *status)),
            StatusRecord::Tuple(values) => {
                let slot = values.first()?.as_u64()?;
                let status = values.get(1)?.as_i64()?;
                Some((SlotId::try_from(slot).ok()?, status))
            }
        })
        .collect()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReceivedItems {
    pub player: SlotId,
    #[serde(default)]
    pub items: Vec<NetworkItem>,
}

/// `[item, location, sender, flags]`.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct NetworkItem(pub i64, pub i64, pub SlotId, pub u32);

#[derive(Debug, Clone, Deserialize)]
pub struct PlayerHints {
    #[serde(default)]
    pub hints: Vec<Vec<Value>>,
}

/// `[item_owner, location_owner, location, item, found, ...]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawHint {
    pub item_owner: SlotId,
    pub location_owner: SlotId,
    pub location_id: i64,
    pub item_id: i64,
    pub found: bool,
}

impl RawHint {
    pub fn parse(values: &[Value]) -> Option<Self> {
        let slot = |value: &Value| value.as_u64().and_then(|raw| SlotId::try_from(raw).ok());
        Some(Self {
            item_owner: slot(values.first()?)?,
            location_owner: slot(values.get(1)?)?,
            location_id: values.get(2)?.as_i64()?,
            item_id: values.get(3)?.as_i64()?,
            found: values.get(4).and_then(Value::as_bool).unwrap_or(false),
        })
    }
}

/// Name-to-id manifest of one game.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct GamePackage {
    #[serde(default)]
    pub item_name_to_id: HashMap<String, i64>,
    #[serde(default)]
    pub location_name_to_id: HashMap<String, i64>,
}

/// The datapackage endpoint may nest the manifest under `games.{game}`.
pub fn game_package_from_value(game: &str, value: Value) -> Result<GamePackage, serde_json::Error> {
    let nested = value
        .get("games")
        .and_then(|games| games.get(game))
        .cloned();
    serde_json::from_value(nested.unwrap_or(value))
}

/// First frame of the room socket: a list of commands, the first being `RoomInfo`.
#[derive(Debug, Clone, Deserialize)]
pub struct RoomInfo {
    #[serde(default)]
    pub datapackage_checksums: BTreeMap<String, String>,
}
