//! Teambook API - HTTP Identity and WebSocket Streaming
//!
//! Two small surfaces over the kernel:
//! - `GET /identity` and `GET /health` for identity resolution (§ identity
//!   endpoint), CORS-open and uncached;
//! - `GET /stream` upgrading to the WebSocket event-push protocol with
//!   single-use token auth, watch sync, per-connection rate limiting, and
//!   idle eviction.

mod identity;
mod stream;

pub use identity::{identity_handler, IdentityQuery};
pub use stream::{stream_handler, StreamRegistry};

use axum::http::header;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use teambook_kernel::Kernel;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub kernel: Arc<Kernel>,
    pub streams: Arc<StreamRegistry>,
}

impl AppState {
    pub fn new(kernel: Arc<Kernel>) -> Self {
        Self {
            streams: Arc::new(StreamRegistry::new()),
            kernel,
        }
    }
}

/// Build the router: identity, health, and the streaming upgrade.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(identity_handler))
        .route("/identity", get(identity_handler))
        .route("/health", get(health_handler))
        .route("/stream", get(stream_handler))
        .layer(cors)
        .layer(axum::middleware::map_response(no_store))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Json<serde_json::Value> {
    Json(json!({"status": "ok", "ai_id": state.kernel.ai_id()}))
}

async fn no_store(mut response: axum::response::Response) -> axum::response::Response {
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-store"),
    );
    response
}
