//! Internal instruction-fetch API.
//!
//! Sandboxes without a shared filesystem retrieve their instruction
//! document by signed key and write their results back:
//!
//! - `GET /api/internal/instructions/{key}`
//! - `PUT /api/internal/output/{key}`
//!
//! Keys are HMAC-signed per task attempt, so a sandbox can only access the
//! instruction it was launched with.

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, put};
use tower_http::cors::CorsLayer;

use super::instruction_store::InstructionStore;

/// Build the internal API router over a shared instruction store.
pub fn router(store: Arc<InstructionStore>) -> Router {
    Router::new()
        .route("/api/internal/instructions/{key}", get(get_instruction))
        .route("/api/internal/output/{key}", put(put_output))
        .layer(CorsLayer::permissive())
        .with_state(store)
}

/// Serve the router on the given listener until cancelled.
pub async fn serve(
    store: Arc<InstructionStore>,
    listener: tokio::net::TcpListener,
) -> std::io::Result<()> {
    let app = router(store);
    tracing::info!(addr = ?listener.local_addr(), "instruction API listening");
    axum::serve(listener, app).await
}

async fn get_instruction(
    State(store): State<Arc<InstructionStore>>,
    Path(key): Path<String>,
) -> Result<String, StatusCode> {
    match store.get_instruction(&key) {
        Some(instruction) => Ok(instruction),
        None => Err(StatusCode::NOT_FOUND),
    }
}

async fn put_output(
    State(store): State<Arc<InstructionStore>>,
    Path(key): Path<String>,
    body: String,
) -> StatusCode {
    if store.put_output(&key, &body) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::FORBIDDEN
    }
}
