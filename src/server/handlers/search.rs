use std::collections::BTreeMap;
use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{Json, Response};
use serde_json::{json, Value};

use super::ensure_read_ready;
use crate::error::{respond, EngineError, EngineResult};
use crate::server::AppState;

/// Searches that tripped the cutoff return partial results with a 408.
fn search_response(result: Value) -> Response {
    let timed_out = result
        .get("out_of_bounds")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let code = if timed_out {
        StatusCode::REQUEST_TIMEOUT
    } else {
        StatusCode::OK
    };
    respond(code, result)
}

pub async fn search_collection(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<BTreeMap<String, String>>,
) -> EngineResult<Response> {
    ensure_read_ready(&state)?;
    let start = Instant::now();
    let req_id = state.next_req_id();
    state
        .housekeeper
        .add_req(req_id, format!("search {} q={:?}", name, params.get("q")));
    let result = state
        .manager
        .do_search(params, BTreeMap::new(), &name, start);
    state.housekeeper.remove_req(req_id);
    Ok(search_response(result?))
}

fn value_map(search: &Value) -> BTreeMap<String, String> {
    search
        .as_object()
        .map(|obj| {
            obj.iter()
                .map(|(k, v)| {
                    let s = match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (k.clone(), s)
                })
                .collect()
        })
        .unwrap_or_default()
}

/// `POST /multi_search`: federated by default; a union when `union: true`.
pub async fn multi_search(
    State(state): State<AppState>,
    Query(query): Query<BTreeMap<String, String>>,
    Json(body): Json<Value>,
) -> EngineResult<Response> {
    ensure_read_ready(&state)?;
    let start = Instant::now();
    let searches = body
        .get("searches")
        .and_then(Value::as_array)
        .ok_or_else(|| EngineError::ClientError("`searches` must be an array.".into()))?;

    let is_union = body.get("union").and_then(Value::as_bool).unwrap_or(false);
    if is_union {
        let maps: Vec<BTreeMap<String, String>> = searches.iter().map(value_map).collect();
        let result = state.manager.do_union(maps, start)?;
        return Ok(search_response(result));
    }

    // Federated: every search runs independently; per-search failures land in
    // that slot without failing the whole request. Common query-string
    // parameters apply to every search unless it sets its own.
    let mut results = Vec::with_capacity(searches.len());
    for search in searches {
        let mut map = value_map(search);
        for (k, v) in &query {
            map.entry(k.clone()).or_insert_with(|| v.clone());
        }
        let Some(collection) = map.remove("collection") else {
            results.push(json!({"code": 400, "error": "Each search must name a `collection`."}));
            continue;
        };
        match state.manager.do_search(map, BTreeMap::new(), &collection, start) {
            Ok(result) => results.push(result),
            Err(e) => results.push(json!({"code": e.code(), "error": e.to_string()})),
        }
    }
    Ok(respond(StatusCode::OK, json!({ "results": results })))
}
