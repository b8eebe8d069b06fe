//! Defines routes for the upload pipeline.
//!
//! ## Structure
//! - **Upload gateway**
//!   - `POST   /` — upload raw image bytes (optional `?key=`)
//!
//! - **Object reads**
//!   - `GET    /objects/{*key}` — download latest (or `?versionId=vN`)
//!   - `GET    /versions/{*key}` — list stored versions
//!
//! - **Consumer surface**
//!   - `POST   /queue/receive` — claim visible messages under a lease
//!   - `DELETE /queue/messages/{id}` — acknowledge
//!   - `POST   /queue/messages/{id}/nack` — release the lease early
//!
//! The wildcard `*key` allows nested keys like `photos/2025/img.jpg`.

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        queue_handlers::{acknowledge_message, nack_message, receive_messages},
        upload_handlers::{download_image, list_versions, upload_image},
    },
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
};

/// Build the router over shared [`AppState`].
///
/// `max_upload_bytes` caps request bodies; oversized uploads are rejected
/// with 413 before any handler runs.
pub fn routes(max_upload_bytes: usize) -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // upload gateway
        .route("/", post(upload_image))
        // object reads
        .route("/objects/{*key}", get(download_image))
        .route("/versions/{*key}", get(list_versions))
        // consumer surface
        .route("/queue/receive", post(receive_messages))
        .route("/queue/messages/{id}", delete(acknowledge_message))
        .route("/queue/messages/{id}/nack", post(nack_message))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
}
