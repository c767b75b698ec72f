//! Quire Server
//!
//! Collaborative editing server built on quire_core.
//!
//! ## Features
//!
//! - **Live editing**: WebSocket connections per document, relaying updates
//!   between everyone editing it
//! - **Debounced saving**: edits are buffered per connection and written by a
//!   single save worker, one history entry per flush
//! - **History views**: paginated history and per-entry before/after markup
//!
//! ## Environment Variables
//!
//! - `HOST`: Server host (default: 0.0.0.0)
//! - `PORT`: Server port (default: 3030)
//! - `DATABASE_PATH`: Path to SQLite database (default: ./quire.db)
//! - `DOC_TYPE`: Target type of served documents (default: doc)
//! - `COORDINATOR_CONFIG`: Optional TOML file with save worker settings
//! - `SAVE_DEBOUNCE_MS`: Overrides the save debounce window
//! - `HISTORY_PAGE_SIZE`: Entries per history page (default: 30)

pub mod config;
pub mod handlers;
pub mod sync;

pub use config::Config;

use axum::{
    Router,
    http::{Method, header},
    routing::get,
};
use handlers::{api::ApiState, api_routes, ws::WsState, ws_handler};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

/// Build the application router
pub fn router(api_state: ApiState, ws_state: WsState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
        .allow_origin(Any);

    Router::new()
        .route("/", get(|| async { "Quire Server" }))
        .route("/health", get(|| async { "OK" }))
        .route("/ws/doc/{id}", get(ws_handler).with_state(ws_state))
        .nest("/api", api_routes(api_state))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
