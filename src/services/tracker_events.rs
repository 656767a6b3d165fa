//! Normalization of a tracker payload into a closed set of events.

use crate::{
    dao::models::{HintKey, SlotId},
    remote::models::{RawHint, TrackerPayload},
};

/// Status code reported for a slot whose player reached their goal.
pub const GOAL_COMPLETE: i64 = 30;
/// Classification bit marking an item as progression.
const PROGRESSION_FLAG: u32 = 0b001;

/// Everything the deduplicator reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerEvent {
    /// The slot reported goal completion.
    Finished { slot: SlotId },
    /// A progression item was delivered to `receiver`.
    ItemReceived {
        receiver: SlotId,
        sender: SlotId,
        item_id: i64,
        location_id: i64,
    },
    /// A hint is visible on the tracker.
    HintRevealed { hint: HintKey, found: bool },
    /// A delivery fulfilled a hint recorded earlier as unfound.
    HintFound { hint: HintKey, sender: SlotId },
}

/// Flatten a payload into events: finishes first, then progression deliveries, then hints.
///
/// Non-progression deliveries and malformed hint tuples are dropped.
pub fn normalize(payload: &TrackerPayload) -> Vec<TrackerEvent> {
    let mut events = Vec::new();

    if let Some(status) = &payload.player_status {
        let mut finished: Vec<SlotId> = status
            .normalize()
            .into_iter()
            .filter(|(_, code)| *code == GOAL_COMPLETE)
            .map(|(slot, _)| slot)
            .collect();
        finished.sort_unstable();
        events.extend(finished.into_iter().map(|slot| TrackerEvent::Finished { slot }));
    }

    for received in &payload.player_items_received {
        events.extend(
            received
                .items
                .iter()
                .filter(|item| item.3 & PROGRESSION_FLAG != 0)
                .map(|item| TrackerEvent::ItemReceived {
                    receiver: received.player,
                    sender: item.2,
                    item_id: item.0,
                    location_id: item.1,
                }),
        );
    }

    for player in &payload.hints {
        events.extend(
            player
                .hints
                .iter()
                .filter_map(|values| RawHint::parse(values))
                .map(|raw| TrackerEvent::HintRevealed {
                    hint: HintKey {
                        item_owner: raw.item_owner,
                        location_owner: raw.location_owner,
                        item_id: raw.item_id,
                        location_id: raw.location_id,
                    },
                    found: raw.found,
                }),
        );
    }

    events
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn keeps_only_progression_items_and_finished_slots() {
        let payload: TrackerPayload = serde_json::from_value(json!({
            "player_status": { "1": 10, "2": 30 },
            "player_items_received": [
                { "player": 1, "items": [[50, 10, 2, 1], [51, 11, 2, 0], [52, 12, 2, 5]] }
            ],
            "hints": []
        }))
        .unwrap();

        assert_eq!(
            normalize(&payload),
            vec![
                TrackerEvent::Finished { slot: 2 },
                TrackerEvent::ItemReceived {
                    receiver: 1,
                    sender: 2,
                    item_id: 50,
                    location_id: 10
                },
                TrackerEvent::ItemReceived {
                    receiver: 1,
                    sender: 2,
                    item_id: 52,
                    location_id: 12
                },
            ]
        );
    }

    #[test]
    fn malformed_hints_are_skipped() {
        let payload: TrackerPayload = serde_json::from_value(json!({
            "hints": [{ "hints": [[1, 2, 77, 5, false, "", 0], ["x"]] }]
        }))
        .unwrap();

        assert_eq!(
            normalize(&payload),
            vec![TrackerEvent::HintRevealed {
                hint: HintKey {
                    item_owner: 1,
                    location_owner: 2,
                    item_id: 5,
                    location_id: 77
                },
                found: false
            }]
        );
    }

    #[test]
    fn missing_sections_yield_nothing() {
        assert!(normalize(&TrackerPayload::default()).is_empty());
    }
}
