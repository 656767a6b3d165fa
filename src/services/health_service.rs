use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tracing::warn;

use crate::{
    dto::{health::HealthResponse, pollers::PollerView},
    state::SharedState,
};

/// Respond with a static health payload while logging connectivity issues.
pub async fn health_status(state: &SharedState) -> HealthResponse {
    match state.require_store().await {
        Ok(store) => {
            if let Err(err) = store.health_check().await {
                warn!(error = %err, "storage health check failed");
            }
        }
        Err(_) => warn!("storage unavailable (degraded mode)"),
    }

    if state.is_degraded() {
        HealthResponse::degraded()
    } else {
        HealthResponse::ok()
    }
}

/// Current poller registry, sorted by room id.
pub fn poller_statuses(state: &SharedState) -> Vec<PollerView> {
    let mut views: Vec<PollerView> = state
        .pollers()
        .iter()
        .map(|entry| {
            let status = entry.value();
            PollerView {
                room_id: entry.key().clone(),
                alias: status.alias.clone(),
                phase: status.phase.as_str(),
                cycles: status.cycles,
                last_cycle_at: status.last_cycle_at.map(|at| {
                    OffsetDateTime::from(at)
                        .format(&Rfc3339)
                        .unwrap_or_else(|_| "invalid-timestamp".into())
                }),
                last_error: status.last_error.clone(),
            }
        })
        .collect();
    views.sort_by(|left, right| left.room_id.cmp(&right.room_id));
    views
}
