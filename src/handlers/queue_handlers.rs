//! Consumer-facing queue endpoints.
//!
//! These mirror the queue contract one-to-one: receive grants a lease,
//! acknowledge deletes, nack gives the lease back early. A consumer that
//! never acknowledges simply sees the message again after its lease.

use crate::{errors::AppError, models::message::ReceivedMessage, state::AppState};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReceiveRequest {
    pub max_messages: Option<usize>,
    pub lease_seconds: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct ReceiveResponse {
    pub messages: Vec<ReceivedMessage>,
}

/// `POST /queue/receive` — claim up to `maxMessages` visible messages. The
/// body is optional; defaults are one message and the configured visibility
/// timeout.
pub async fn receive_messages(
    State(state): State<AppState>,
    body: Option<Json<ReceiveRequest>>,
) -> Result<Json<ReceiveResponse>, AppError> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let lease = req.lease_seconds.map(Duration::from_secs);
    let messages = state
        .queue
        .receive(req.max_messages.unwrap_or(1), lease)
        .await?;
    Ok(Json(ReceiveResponse { messages }))
}

/// `DELETE /queue/messages/{id}` — acknowledge a processed message.
pub async fn acknowledge_message(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.queue.acknowledge(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /queue/messages/{id}/nack` — give up the lease early so the message
/// is redelivered immediately.
pub async fn nack_message(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.queue.nack(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
