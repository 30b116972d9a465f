use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::response::Json;
use serde_json::{json, Value};

use super::ensure_read_ready;
use crate::collection::{Override, Synonym};
use crate::error::{EngineError, EngineResult};
use crate::server::AppState;

// ==================== Overrides ====================

pub async fn list_overrides(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> EngineResult<Json<Value>> {
    ensure_read_ready(&state)?;
    let handle = state.manager.get_collection(&name).ok_or_else(|| {
        EngineError::NotFound(format!("No collection with name `{}` found.", name))
    })?;
    let overrides: Vec<Value> = handle.read().overrides.iter().map(Override::to_json).collect();
    Ok(Json(json!({ "overrides": overrides })))
}

pub async fn upsert_override(
    State(state): State<AppState>,
    Path((name, id)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> EngineResult<Json<Value>> {
    let ov = Override::from_json(&id, &body)?;
    let response = ov.to_json();
    state.manager.upsert_override(&name, ov)?;
    Ok(Json(response))
}

pub async fn delete_override(
    State(state): State<AppState>,
    Path((name, id)): Path<(String, String)>,
) -> EngineResult<Json<Value>> {
    state.manager.delete_override(&name, &id)?;
    Ok(Json(json!({ "id": id })))
}

// ==================== Synonyms ====================

pub async fn upsert_synonym(
    State(state): State<AppState>,
    Path((name, id)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> EngineResult<Json<Value>> {
    let synonym = Synonym::from_json(&id, &body)?;
    let response = synonym.to_json();
    state.manager.upsert_synonym(&name, synonym)?;
    Ok(Json(response))
}

// ==================== Aliases ====================

pub async fn list_aliases(State(state): State<AppState>) -> EngineResult<Json<Value>> {
    let aliases: Vec<Value> = state
        .manager
        .list_symlinks()
        .into_iter()
        .map(|(name, collection_name)| json!({"name": name, "collection_name": collection_name}))
        .collect();
    Ok(Json(json!({ "aliases": aliases })))
}

pub async fn get_alias(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> EngineResult<Json<Value>> {
    let target = state.manager.get_symlink(&name).ok_or_else(|| {
        EngineError::NotFound(format!("Could not find an alias named `{}`.", name))
    })?;
    Ok(Json(json!({"name": name, "collection_name": target})))
}

pub async fn upsert_alias(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<Value>,
) -> EngineResult<Json<Value>> {
    let target = body
        .get("collection_name")
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::ClientError("`collection_name` is required.".into()))?;
    state.manager.upsert_symlink(&name, target)?;
    Ok(Json(json!({"name": name, "collection_name": target})))
}

pub async fn delete_alias(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> EngineResult<Json<Value>> {
    state.manager.delete_symlink(&name)?;
    Ok(Json(json!({ "name": name })))
}

// ==================== Presets ====================

pub async fn list_presets(State(state): State<AppState>) -> EngineResult<Json<Value>> {
    let presets: Vec<Value> = state
        .manager
        .list_presets()
        .into_iter()
        .map(|(name, value)| json!({"name": name, "value": value}))
        .collect();
    Ok(Json(json!({ "presets": presets })))
}

pub async fn get_preset(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> EngineResult<Json<Value>> {
    let value = state.manager.get_preset(&name).ok_or_else(|| {
        EngineError::NotFound(format!("Could not find a preset named `{}`.", name))
    })?;
    Ok(Json(json!({"name": name, "value": value})))
}

pub async fn upsert_preset(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<Value>,
) -> EngineResult<Json<Value>> {
    let value = body
        .get("value")
        .cloned()
        .unwrap_or(body);
    state.manager.upsert_preset(&name, &value)?;
    Ok(Json(json!({"name": name, "value": value})))
}

pub async fn delete_preset(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> EngineResult<Json<Value>> {
    state.manager.delete_preset(&name)?;
    Ok(Json(json!({ "name": name })))
}

// ==================== Stopwords & Stemming ====================

pub async fn get_stopwords(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> EngineResult<Json<Value>> {
    let words = state.manager.get_stopwords(&name).ok_or_else(|| {
        EngineError::NotFound(format!("Could not find a stopwords set named `{}`.", name))
    })?;
    let mut sorted: Vec<String> = words.into_iter().collect();
    sorted.sort();
    Ok(Json(json!({"id": name, "stopwords": sorted})))
}

pub async fn upsert_stopwords(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<Value>,
) -> EngineResult<Json<Value>> {
    let words: Vec<String> = body
        .get("stopwords")
        .and_then(Value::as_array)
        .ok_or_else(|| EngineError::ClientError("`stopwords` must be an array.".into()))?
        .iter()
        .filter_map(Value::as_str)
        .map(String::from)
        .collect();
    state.manager.upsert_stopwords(&name, &words)?;
    Ok(Json(json!({"id": name, "stopwords": words})))
}

pub async fn delete_stopwords(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> EngineResult<Json<Value>> {
    state.manager.delete_stopwords(&name)?;
    Ok(Json(json!({ "id": name })))
}

/// `PUT /stemming/dictionaries/:name`: JSON-lines of `{"word": w, "root": r}`.
pub async fn upsert_stem_dictionary(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: String,
) -> EngineResult<Json<Value>> {
    let mut entries: HashMap<String, String> = HashMap::new();
    for line in body.lines().filter(|l| !l.trim().is_empty()) {
        let row: Value = serde_json::from_str(line)?;
        let (Some(word), Some(root)) = (
            row.get("word").and_then(Value::as_str),
            row.get("root").and_then(Value::as_str),
        ) else {
            return Err(EngineError::ClientError(
                "Each dictionary line must carry `word` and `root`.".into(),
            ));
        };
        entries.insert(word.to_lowercase(), root.to_lowercase());
    }
    let num_entries = entries.len();
    state.manager.upsert_stem_dictionary(&name, entries)?;
    Ok(Json(json!({"id": name, "num_entries": num_entries})))
}
