use axum::{Json, Router, extract::State, routing::get};

use crate::{
    dto::{health::HealthResponse, pollers::PollerView},
    services::health_service,
    state::SharedState,
};

/// Return the current health status of the backend and ping the store.
pub async fn healthcheck(State(state): State<SharedState>) -> Json<HealthResponse> {
    let status = health_service::health_status(&state).await;
    Json(status)
}

/// List room pollers known to the supervisor.
pub async fn pollers(State(state): State<SharedState>) -> Json<Vec<PollerView>> {
    Json(health_service::poller_statuses(&state))
}

/// Configure the health routes subtree.
pub fn router() -> Router<SharedState> {
    Router::<SharedState>::new()
        .route("/healthcheck", get(healthcheck))
        .route("/pollers", get(pollers))
}
