use axum::{
    routing::{delete, get, patch, post, put},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::handlers::*;
use super::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Collections
        .route("/collections", get(list_collections).post(create_collection))
        .route(
            "/collections/{name}",
            get(get_collection)
                .delete(drop_collection)
                .patch(alter_collection),
        )
        // Documents
        .route("/collections/{name}/documents", post(write_documents))
        .route("/collections/{name}/documents/import", post(import_documents))
        .route("/collections/{name}/documents/search", get(search_collection))
        .route("/collections/{name}/documents/export", get(export_documents))
        .route(
            "/collections/{name}/documents/{id}",
            get(get_document).delete(delete_document),
        )
        // Curation
        .route("/collections/{name}/overrides", get(list_overrides))
        .route(
            "/collections/{name}/overrides/{id}",
            put(upsert_override).delete(delete_override),
        )
        .route("/collections/{name}/synonyms/{id}", put(upsert_synonym))
        // Multi search
        .route("/multi_search", post(multi_search))
        // Aliases
        .route("/aliases", get(list_aliases))
        .route(
            "/aliases/{name}",
            get(get_alias).put(upsert_alias).delete(delete_alias),
        )
        // Presets
        .route("/presets", get(list_presets))
        .route(
            "/presets/{name}",
            get(get_preset).put(upsert_preset).delete(delete_preset),
        )
        // Stopwords & stemming
        .route(
            "/stopwords/{name}",
            get(get_stopwords).put(upsert_stopwords).delete(delete_stopwords),
        )
        .route("/stemming/dictionaries/{name}", put(upsert_stem_dictionary))
        // Async write status
        .route("/async/{req_id}", get(async_request_status))
        // Cluster operations
        .route("/health", get(health))
        .route("/status", get(cluster_status))
        .route("/operations/snapshot", post(trigger_snapshot))
        .route("/operations/vote", post(trigger_vote))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_methods(Any)
                .allow_origin(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
