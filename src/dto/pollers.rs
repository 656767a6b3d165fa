use serde::Serialize;

/// One entry of the `/pollers` listing.
#[derive(Debug, Serialize)]
pub struct PollerView {
    pub room_id: String,
    pub alias: String,
    /// `setup` or `polling`.
    pub phase: &'static str,
    pub cycles: u64,
    /// RFC 3339 timestamp of the last finished cycle.
    pub last_cycle_at: Option<String>,
    pub last_error: Option<String>,
}
