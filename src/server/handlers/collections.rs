use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{Json, Response};
use serde_json::Value;

use super::ensure_read_ready;
use crate::error::{respond, EngineError, EngineResult};
use crate::indexer::{RequestMeta, WriteKind};
use crate::server::AppState;

pub async fn list_collections(State(state): State<AppState>) -> EngineResult<Json<Value>> {
    ensure_read_ready(&state)?;
    Ok(Json(Value::Array(state.manager.list_collections())))
}

pub async fn create_collection(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> EngineResult<Response> {
    let meta = RequestMeta {
        req_id: state.next_req_id(),
        log_index: 0,
        kind: WriteKind::CreateCollection,
    };
    let (code, body) = state
        .node
        .write(meta, body.to_string().into_bytes(), "/collections")
        .await?;
    Ok(respond(
        StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        body,
    ))
}

pub async fn get_collection(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> EngineResult<Json<Value>> {
    ensure_read_ready(&state)?;
    let handle = state.manager.get_collection(&name).ok_or_else(|| {
        EngineError::NotFound(format!("No collection with name `{}` found.", name))
    })?;
    let summary = handle.read().summary_json();
    Ok(Json(summary))
}

pub async fn drop_collection(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> EngineResult<Response> {
    let meta = RequestMeta {
        req_id: state.next_req_id(),
        log_index: 0,
        kind: WriteKind::DropCollection { name: name.clone() },
    };
    let path = format!("/collections/{}", name);
    let (code, body) = state.node.write(meta, Vec::new(), &path).await?;
    Ok(respond(
        StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        body,
    ))
}

/// Alter schema: add fields and drop fields, then rebuild the in-memory
/// indexes from the stored documents.
pub async fn alter_collection(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<Value>,
) -> EngineResult<Json<Value>> {
    let summary = state.manager.alter_collection(&name, &body)?;
    Ok(Json(summary))
}

pub async fn async_request_status(
    State(state): State<AppState>,
    Path(req_id): Path<u64>,
) -> EngineResult<Json<Value>> {
    match state.indexer.request_status(req_id)? {
        Some(status) => Ok(Json(status)),
        None => Err(EngineError::NotFound(format!(
            "No write request with id `{}` found.",
            req_id
        ))),
    }
}
