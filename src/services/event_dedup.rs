//! Turns tracker events into notifications exactly once per room, using the ledger.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    time::SystemTime,
};

use indexmap::IndexSet;

use crate::{
    dao::models::{
        EntityKind, HintKey, ItemKey, LedgerBatch, LedgerSnapshot, NotifiedItemEntity,
        RevealedHintEntity, SlotId,
    },
    push::Notification,
    remote::models::{Roster, TrackerPayload},
    services::{
        datapackage_cache::DatapackageCache,
        tracker_events::{TrackerEvent, normalize},
    },
};

/// Name-resolution context of one room for one cycle.
pub struct RoomContext<'a> {
    pub alias: &'a str,
    pub roster: &'a Roster,
    /// Datapackage checksum per game.
    pub checksums: &'a BTreeMap<String, String>,
}

/// Events not yet in the ledger, and the rows that record them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub novel: Vec<TrackerEvent>,
    /// Tracked slots minus those that finished in this cycle.
    pub active: BTreeSet<SlotId>,
    pub batch: LedgerBatch,
}

/// Result of a full dedup pass.
#[derive(Debug, Clone)]
pub struct DedupOutcome {
    /// Unique notification texts, in event order.
    pub notifications: IndexSet<Notification>,
    pub batch: LedgerBatch,
}

/// Compare `events` with the ledger and collect what is new for the `tracked` slots.
pub fn detect(
    room_id: &str,
    events: &[TrackerEvent],
    tracked: &BTreeSet<SlotId>,
    ledger: &LedgerSnapshot,
    now: SystemTime,
) -> Detection {
    let mut batch = LedgerBatch::new(room_id);
    let mut novel = Vec::new();

    let mut finished = BTreeSet::new();
    for event in events {
        if let TrackerEvent::Finished { slot } = *event {
            if tracked.contains(&slot) && finished.insert(slot) {
                novel.push(TrackerEvent::Finished { slot });
            }
        }
    }
    batch.finished_slots = finished.iter().copied().collect();
    let active: BTreeSet<SlotId> = tracked.difference(&finished).copied().collect();

    let mut items: HashSet<ItemKey> = ledger.items.clone();
    let mut hints: HashMap<HintKey, bool> = ledger.hints.clone();

    for event in events {
        let TrackerEvent::ItemReceived {
            receiver,
            sender,
            item_id,
            location_id,
        } = *event
        else {
            continue;
        };
        if !active.contains(&receiver) {
            continue;
        }
        let key = ItemKey {
            receiving_slot: receiver,
            item_id,
            location_id,
        };
        if !items.insert(key) {
            continue;
        }

        let fulfilled = hints
            .iter()
            .filter(|(hint, found)| {
                !**found
                    && hint.item_owner == receiver
                    && hint.item_id == item_id
                    && hint.location_id == location_id
            })
            .map(|(hint, _)| *hint)
            .min();
        match fulfilled {
            Some(hint) => {
                hints.insert(hint, true);
                batch.found_hints.push(hint);
                novel.push(TrackerEvent::HintFound { hint, sender });
            }
            None => novel.push(*event),
        }
        batch.items.push(NotifiedItemEntity {
            room_id: room_id.to_owned(),
            key,
            notified_at: now,
        });
    }

    for event in events {
        let TrackerEvent::HintRevealed { hint, found } = *event else {
            continue;
        };
        if !active.contains(&hint.item_owner) && !active.contains(&hint.location_owner) {
            continue;
        }
        if hints.contains_key(&hint) {
            continue;
        }
        hints.insert(hint, found);
        batch.hints.push(RevealedHintEntity {
            room_id: room_id.to_owned(),
            key: hint,
            found,
            notified_at: now,
        });
        novel.push(*event);
    }

    Detection {
        novel,
        active,
        batch,
    }
}

/// Render notification texts for `novel` events. Equal texts collapse.
pub async fn render(
    novel: &[TrackerEvent],
    active: &BTreeSet<SlotId>,
    context: &RoomContext<'_>,
    cache: &DatapackageCache,
) -> IndexSet<Notification> {
    let names = NameResolver { context, cache };
    let title = |text: &str| format!("[{}] {}", context.alias, text);
    let roster = context.roster;
    let mut notifications = IndexSet::new();

    for event in novel {
        match *event {
            TrackerEvent::Finished { slot } => {
                notifications.insert(Notification::new(
                    title("🏁 Player Finished!"),
                    format!("{} has finished.", roster.player_name(slot)),
                ));
            }
            TrackerEvent::ItemReceived {
                receiver, item_id, ..
            } => {
                let item = names.item(receiver, item_id).await;
                notifications.insert(Notification::new(
                    title("✨ Progression Item!"),
                    format!("{} received: {}", roster.player_name(receiver), item),
                ));
            }
            TrackerEvent::HintFound { hint, .. } => {
                let item = names.item(hint.item_owner, hint.item_id).await;
                let location = names.location(hint.location_owner, hint.location_id).await;
                notifications.insert(Notification::new(
                    title("🎯 Hinted Item Found!"),
                    format!(
                        "{} found their hinted '{}' at '{}'.",
                        roster.player_name(hint.item_owner),
                        item,
                        location
                    ),
                ));
            }
            TrackerEvent::HintRevealed { hint, .. } => {
                let item = names.item(hint.item_owner, hint.item_id).await;
                let location = names.location(hint.location_owner, hint.location_id).await;
                let owner = roster.player_name(hint.item_owner);
                let finder = roster.player_name(hint.location_owner);
                if active.contains(&hint.item_owner) {
                    notifications.insert(Notification::new(
                        title(&format!("🔔 New Hint for {owner}!")),
                        format!("Your '{item}' is in {finder}'s world at '{location}'."),
                    ));
                }
                if active.contains(&hint.location_owner) && hint.location_owner != hint.item_owner
                {
                    notifications.insert(Notification::new(
                        title("🔎 Item Hinted in your World!"),
                        format!("'{item}' for {owner} is at your location: '{location}'."),
                    ));
                }
            }
        }
    }

    notifications
}

/// Full pass: normalize, detect against the ledger, render.
pub async fn deduplicate(
    room_id: &str,
    payload: &TrackerPayload,
    tracked: &BTreeSet<SlotId>,
    ledger: &LedgerSnapshot,
    context: &RoomContext<'_>,
    cache: &DatapackageCache,
    now: SystemTime,
) -> DedupOutcome {
    let events = normalize(payload);
    let detection = detect(room_id, &events, tracked, ledger, now);
    let notifications = render(&detection.novel, &detection.active, context, cache).await;
    DedupOutcome {
        notifications,
        batch: detection.batch,
    }
}

/// Silent pass recording everything currently visible for every roster slot.
///
/// Used once when a room is first set up so history is not replayed as notifications.
/// Nothing is rendered and no slot is removed.
pub fn baseline(
    room_id: &str,
    payload: &TrackerPayload,
    roster: &Roster,
    tracked: &BTreeSet<SlotId>,
    ledger: &LedgerSnapshot,
    now: SystemTime,
) -> LedgerBatch {
    let everyone: BTreeSet<SlotId> = roster.slots().chain(tracked.iter().copied()).collect();
    let events: Vec<TrackerEvent> = normalize(payload)
        .into_iter()
        .filter(|event| !matches!(event, TrackerEvent::Finished { .. }))
        .collect();
    detect(room_id, &events, &everyone, ledger, now).batch
}

struct NameResolver<'a> {
    context: &'a RoomContext<'a>,
    cache: &'a DatapackageCache,
}

impl NameResolver<'_> {
    async fn item(&self, owner: SlotId, id: i64) -> String {
        self.resolve(owner, EntityKind::Item, id).await
    }

    async fn location(&self, owner: SlotId, id: i64) -> String {
        self.resolve(owner, EntityKind::Location, id).await
    }

    async fn resolve(&self, slot: SlotId, kind: EntityKind, id: i64) -> String {
        let game = self.context.roster.game(slot);
        let checksum = self.context.checksums.get(game).map(String::as_str);
        self.cache.resolve_name(game, checksum, kind, id).await
    }
}
