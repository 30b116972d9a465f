use std::collections::BTreeMap;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{Json, Response};
use serde_json::Value;

use super::ensure_read_ready;
use crate::error::{respond, EngineError, EngineResult};
use crate::indexer::{RequestMeta, WriteKind};
use crate::server::AppState;

fn action_of(params: &BTreeMap<String, String>) -> String {
    params
        .get("action")
        .cloned()
        .unwrap_or_else(|| "create".to_string())
}

/// `POST /collections/:name/documents`: a single JSON document, or JSON-lines
/// for batch ingestion.
pub async fn write_documents(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<BTreeMap<String, String>>,
    body: String,
) -> EngineResult<Response> {
    let action = action_of(&params);
    let is_batch = body.trim().lines().filter(|l| !l.trim().is_empty()).count() > 1;
    let kind = if is_batch {
        WriteKind::ImportDocuments {
            collection: name.clone(),
            action,
        }
    } else {
        WriteKind::WriteDocument {
            collection: name.clone(),
            action,
        }
    };

    let meta = RequestMeta {
        req_id: state.next_req_id(),
        log_index: 0,
        kind,
    };
    let path = format!("/collections/{}/documents", name);
    let (code, body) = state.node.write(meta, body.into_bytes(), &path).await?;
    Ok(respond(
        StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        body,
    ))
}

/// `POST /collections/:name/documents/import`: always JSON-lines.
pub async fn import_documents(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<BTreeMap<String, String>>,
    body: String,
) -> EngineResult<Response> {
    let meta = RequestMeta {
        req_id: state.next_req_id(),
        log_index: 0,
        kind: WriteKind::ImportDocuments {
            collection: name.clone(),
            action: action_of(&params),
        },
    };
    let path = format!("/collections/{}/documents/import", name);
    let (code, body) = state.node.write(meta, body.into_bytes(), &path).await?;
    Ok(respond(
        StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        body,
    ))
}

pub async fn get_document(
    State(state): State<AppState>,
    Path((name, id)): Path<(String, String)>,
) -> EngineResult<Json<Value>> {
    ensure_read_ready(&state)?;
    let handle = state.manager.get_collection(&name).ok_or_else(|| {
        EngineError::NotFound(format!("No collection with name `{}` found.", name))
    })?;
    let doc = handle.read().get_document(&id)?;
    Ok(Json(doc))
}

pub async fn delete_document(
    State(state): State<AppState>,
    Path((name, id)): Path<(String, String)>,
) -> EngineResult<Response> {
    let meta = RequestMeta {
        req_id: state.next_req_id(),
        log_index: 0,
        kind: WriteKind::DeleteDocument {
            collection: name.clone(),
            id: id.clone(),
        },
    };
    let path = format!("/collections/{}/documents/{}", name, id);
    let (code, body) = state.node.write(meta, Vec::new(), &path).await?;
    Ok(respond(
        StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        body,
    ))
}

/// `GET /collections/:name/documents/export`: JSON-lines of every stored
/// document, sidecars stripped.
pub async fn export_documents(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> EngineResult<Response> {
    ensure_read_ready(&state)?;
    let handle = state.manager.get_collection(&name).ok_or_else(|| {
        EngineError::NotFound(format!("No collection with name `{}` found.", name))
    })?;
    let docs = handle.read().export_documents()?;
    let body = docs
        .iter()
        .map(Value::to_string)
        .collect::<Vec<_>>()
        .join("\n");
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain; charset=utf-8")
        .body(body.into())
        .expect("static response"))
}
