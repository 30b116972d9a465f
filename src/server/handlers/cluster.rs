use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{Json, Response};
use serde_json::{json, Value};

use crate::error::{respond, EngineResult};
use crate::server::AppState;

pub async fn health(State(state): State<AppState>) -> Response {
    let engine = state.node.engine();
    if engine.is_read_caught_up() {
        respond(StatusCode::OK, json!({"ok": true}))
    } else {
        respond(
            StatusCode::SERVICE_UNAVAILABLE,
            json!({"ok": false, "resource_error": "LAGGING_OR_NOT_READY"}),
        )
    }
}

pub async fn cluster_status(State(state): State<AppState>) -> Json<Value> {
    Json(state.node.get_status())
}

pub async fn trigger_snapshot(State(state): State<AppState>) -> EngineResult<Json<Value>> {
    state.node.snapshot()?;
    Ok(Json(json!({"success": true})))
}

pub async fn trigger_vote(State(state): State<AppState>) -> EngineResult<Json<Value>> {
    state.node.trigger_vote()?;
    Ok(Json(json!({"success": true})))
}
