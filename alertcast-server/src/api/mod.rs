//! HTTP and WebSocket handlers.
//!
//! - `GET /ws`: the realtime gateway endpoint
//! - `GET /stats`: connection, channel and bus counters

mod ws;

use alertcast_core::gateway::HubStats;
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;

use crate::state::AppState;

/// Build the API routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/ws", get(ws::gateway_ws))
        .route("/stats", get(stats))
}

#[derive(Serialize)]
struct StatsResponse {
    #[serde(flatten)]
    hub: HubStats,
    backbone: &'static str,
    degraded: bool,
}

/// `GET /stats`
async fn stats(State(state): State<AppState>) -> Response {
    match state.gateway.stats().await {
        Ok(hub) => Json(StatsResponse {
            hub,
            backbone: state.bus.backbone_name(),
            degraded: state.bus.is_degraded(),
        })
        .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to collect gateway stats");
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}
