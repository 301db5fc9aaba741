//! Health check endpoints.

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use serde_json::{Value, json};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/health/ready", get(ready))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Ready while the scheduler accepts submissions; reports job counts.
async fn ready(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let stats = state.scheduler.stats();
    let (code, status) = if stats.accepting {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "shutting_down")
    };

    (
        code,
        Json(json!({
            "status": status,
            "jobs": stats.jobs,
            "by_status": stats.by_status,
            "queue": {
                "depth": stats.queue_depth,
                "capacity": stats.queue_capacity,
            },
            "workers": stats.workers,
        })),
    )
}
