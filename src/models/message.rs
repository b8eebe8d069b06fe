//! Queue message types and their wire format.
//!
//! A message is created once per object creation event and remains queued
//! until a consumer acknowledges it or the retention window expires. A
//! received-but-unacknowledged message becomes visible again after its
//! lease, so consumers may observe duplicates and must be idempotent.

use base64::{Engine as _, engine::general_purpose};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A queued message as stored in SQLite.
///
/// Timestamps are unix milliseconds so visibility and retention comparisons
/// stay plain integer arithmetic in SQL.
#[derive(Debug, Clone, FromRow)]
pub struct QueueMessage {
    /// Unique identifier for the message.
    pub id: Uuid,

    /// Serialized [`MessageBody`] JSON.
    pub body: String,

    /// When the message was enqueued (unix ms).
    pub enqueued_at_ms: i64,

    /// The message is hidden from consumers while this is in the future
    /// (unix ms).
    pub visible_at_ms: i64,

    /// Number of times the message has been delivered to a consumer.
    pub receive_count: i64,
}

impl QueueMessage {
    pub fn enqueued_at(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.enqueued_at_ms)
            .single()
            .unwrap_or_else(Utc::now)
    }
}

/// Payload carried by every queue message, derived 1:1 from a creation event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageBody {
    pub key: String,
    pub version_id: String,
    pub event_time: DateTime<Utc>,
}

/// Delivery-time attributes exposed to consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageAttributes {
    pub enqueue_time: DateTime<Utc>,
    pub approx_receive_count: i64,
}

/// Wire shape handed to a consumer by `receive`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceivedMessage {
    pub message_id: Uuid,
    pub body: MessageBody,
    pub attributes: MessageAttributes,
    pub receipt_handle: String,
}

/// Opaque per-delivery receipt handle: the message id plus the delivery
/// attempt it was issued for.
pub fn receipt_handle(id: Uuid, receive_count: i64) -> String {
    general_purpose::STANDARD.encode(format!("{}:{}", id, receive_count))
}
