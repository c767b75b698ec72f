use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use quire_core::QuireError;
use chrono::{DateTime, Utc};
use quire_core::crdt::{DocFields, DocTarget, DocumentStore};
use quire_core::history_view::HistoryViewer;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::config::Config;

/// Shared state for API handlers
#[derive(Clone)]
pub struct ApiState {
    pub config: Arc<Config>,
    pub store: Arc<dyn DocumentStore>,
    pub viewer: Arc<HistoryViewer>,
}

/// A created document
#[derive(Debug, Serialize)]
pub struct DocResponse {
    pub target_type: String,
    pub id: i64,
}

/// A listed document with the fields copied out of it on its last flush
#[derive(Debug, Serialize)]
pub struct DocListItem {
    pub target_type: String,
    pub id: i64,
    pub fields: DocFields,
    pub updated_at: DateTime<Utc>,
}

/// Query parameters for history listings
#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub page: Option<usize>,
}

/// Error response wrapping a core error
pub struct ApiError(pub QuireError);

impl From<QuireError> for ApiError {
    fn from(err: QuireError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }
        (status, Json(self.0.to_serializable())).into_response()
    }
}

/// HTTP status for a core error
pub fn status_for(err: &QuireError) -> StatusCode {
    if err.is_not_found() {
        StatusCode::NOT_FOUND
    } else if err.is_transient() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

/// Create API routes
pub fn api_routes(state: ApiState) -> Router {
    Router::new()
        .route("/docs", post(create_doc).get(list_docs))
        .route("/docs/{id}/history", get(history_page))
        .route("/docs/{id}/history/{history_id}", get(history_entry))
        .with_state(state)
}

/// Run blocking storage work off the async runtime
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> quire_core::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError(QuireError::StorageUnavailable(format!("worker task failed: {}", e))))?
        .map_err(ApiError)
}

/// POST /api/docs - Create an empty document
async fn create_doc(State(state): State<ApiState>) -> Result<impl IntoResponse, ApiError> {
    let store = state.store.clone();
    let doc_type = state.config.doc_type.clone();
    let target = blocking(move || store.create_doc(&doc_type)).await?;

    Ok((
        StatusCode::CREATED,
        Json(DocResponse {
            target_type: target.target_type,
            id: target.target_id,
        }),
    ))
}

/// GET /api/docs - List documents with their copied fields
async fn list_docs(State(state): State<ApiState>) -> Result<impl IntoResponse, ApiError> {
    let store = state.store.clone();
    let doc_type = state.config.doc_type.clone();
    let docs = blocking(move || store.list_summaries(&doc_type)).await?;

    Ok(Json(
        docs.into_iter()
            .map(|doc| DocListItem {
                target_type: doc.target.target_type,
                id: doc.target.target_id,
                fields: doc.fields,
                updated_at: doc.updated_at,
            })
            .collect::<Vec<_>>(),
    ))
}

/// GET /api/docs/{id}/history?page=N - Paginated history with diffs
async fn history_page(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    Query(query): Query<HistoryQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let target = DocTarget::new(state.config.doc_type.as_str(), id);
    let per_page = state.config.history_page_size;
    let page = query.page.unwrap_or(1);
    let viewer = state.viewer.clone();

    let page = blocking(move || viewer.page(&target, page, per_page)).await?;
    Ok(Json(page))
}

/// GET /api/docs/{id}/history/{history_id} - One entry with before/after
async fn history_entry(
    State(state): State<ApiState>,
    Path((id, history_id)): Path<(i64, i64)>,
) -> Result<impl IntoResponse, ApiError> {
    let target = DocTarget::new(state.config.doc_type.as_str(), id);
    let viewer = state.viewer.clone();

    let view = blocking(move || viewer.entry(&target, history_id)).await?;
    Ok(Json(view))
}
