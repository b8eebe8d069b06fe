//! QueueService — at-least-once message queue backed by SQLite.
//!
//! A message stays enqueued until a consumer acknowledges it or the
//! retention window expires. Receiving a message pushes its visibility
//! deadline out by the lease, so an unacknowledged message reappears once
//! per lease expiry with an incremented receive count. No cross-message
//! ordering is guaranteed.

use crate::models::message::{
    MessageAttributes, MessageBody, QueueMessage, ReceivedMessage, receipt_handle,
};
use chrono::Utc;
use sqlx::SqlitePool;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("message `{0}` not found")]
    MessageNotFound(Uuid),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

pub type QueueResult<T> = Result<T, QueueError>;

/// A single receive may claim at most this many messages.
const MAX_RECEIVE_BATCH: usize = 10;

/// Longest lease a consumer may request (12 hours).
const MAX_LEASE: Duration = Duration::from_secs(12 * 60 * 60);

/// Immutable queue configuration, fixed at construction time.
#[derive(Clone, Debug)]
pub struct QueueConfig {
    /// Default lease granted per received message.
    pub visibility_timeout: Duration,
    /// Messages older than this are purged even if never acknowledged.
    pub retention: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(300),
            retention: Duration::from_secs(86_400),
        }
    }
}

#[derive(Clone)]
pub struct QueueService {
    db: Arc<SqlitePool>,
    config: QueueConfig,
}

impl QueueService {
    pub fn new(db: Arc<SqlitePool>, config: QueueConfig) -> Self {
        Self { db, config }
    }

    /// Insert a message, immediately visible to consumers.
    pub async fn enqueue(&self, body: &MessageBody) -> QueueResult<Uuid> {
        let id = Uuid::new_v4();
        let now_ms = Utc::now().timestamp_millis();
        sqlx::query(
            "INSERT INTO queue_messages (id, body, enqueued_at_ms, visible_at_ms, receive_count)
             VALUES (?, ?, ?, ?, 0)",
        )
        .bind(id)
        .bind(serde_json::to_string(body)?)
        .bind(now_ms)
        .bind(now_ms)
        .execute(&*self.db)
        .await?;

        tracing::debug!(message_id = %id, key = %body.key, version = %body.version_id, "message enqueued");
        Ok(id)
    }

    /// Claim up to `max_messages` currently-visible, unexpired messages.
    ///
    /// Claiming pushes each message's visibility deadline to now + lease and
    /// increments its receive count, all in one statement, so two consumers
    /// never claim the same delivery.
    pub async fn receive(
        &self,
        max_messages: usize,
        lease: Option<Duration>,
    ) -> QueueResult<Vec<ReceivedMessage>> {
        let limit = max_messages.clamp(1, MAX_RECEIVE_BATCH);
        let lease = lease.unwrap_or(self.config.visibility_timeout).min(MAX_LEASE);
        let now_ms = Utc::now().timestamp_millis();
        let lease_deadline_ms = now_ms.saturating_add(lease.as_millis() as i64);
        let expiry_floor_ms = now_ms - self.config.retention.as_millis() as i64;

        let rows = sqlx::query_as::<_, QueueMessage>(
            r#"
            UPDATE queue_messages
            SET visible_at_ms = ?, receive_count = receive_count + 1
            WHERE id IN (
                SELECT id FROM queue_messages
                WHERE visible_at_ms <= ? AND enqueued_at_ms > ?
                ORDER BY enqueued_at_ms ASC
                LIMIT ?
            )
            RETURNING id, body, enqueued_at_ms, visible_at_ms, receive_count
            "#,
        )
        .bind(lease_deadline_ms)
        .bind(now_ms)
        .bind(expiry_floor_ms)
        .bind(limit as i64)
        .fetch_all(&*self.db)
        .await?;

        rows.into_iter()
            .map(|row| {
                tracing::trace!(
                    message_id = %row.id,
                    leased_until_ms = row.visible_at_ms,
                    "message leased to consumer"
                );
                let body: MessageBody = serde_json::from_str(&row.body)?;
                Ok(ReceivedMessage {
                    message_id: row.id,
                    receipt_handle: receipt_handle(row.id, row.receive_count),
                    attributes: MessageAttributes {
                        enqueue_time: row.enqueued_at(),
                        approx_receive_count: row.receive_count,
                    },
                    body,
                })
            })
            .collect()
    }

    /// Delete a processed message. Unknown ids are reported, not ignored.
    pub async fn acknowledge(&self, id: Uuid) -> QueueResult<()> {
        let result = sqlx::query("DELETE FROM queue_messages WHERE id = ?")
            .bind(id)
            .execute(&*self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(QueueError::MessageNotFound(id));
        }
        tracing::debug!(message_id = %id, "message acknowledged");
        Ok(())
    }

    /// Give up a lease early, making the message immediately redeliverable.
    pub async fn nack(&self, id: Uuid) -> QueueResult<()> {
        let now_ms = Utc::now().timestamp_millis();
        let result = sqlx::query("UPDATE queue_messages SET visible_at_ms = ? WHERE id = ?")
            .bind(now_ms)
            .bind(id)
            .execute(&*self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(QueueError::MessageNotFound(id));
        }
        Ok(())
    }

    /// Purge messages older than the retention window. Returns how many rows
    /// were removed. This is a deliberate data-loss boundary: retention must
    /// be sized generously relative to expected consumer downtime.
    pub async fn sweep_expired(&self) -> QueueResult<u64> {
        let floor_ms = Utc::now().timestamp_millis() - self.config.retention.as_millis() as i64;
        let result = sqlx::query("DELETE FROM queue_messages WHERE enqueued_at_ms <= ?")
            .bind(floor_ms)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected())
    }

    /// Spawn the background retention sweeper.
    ///
    /// Sweeps at min(retention / 10, 60 s) so short retentions (tests) purge
    /// promptly while production defaults sweep once a minute.
    pub fn spawn_retention_sweeper(&self) -> RetentionSweeper {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let service = self.clone();
        let interval = (self.config.retention / 10).min(Duration::from_secs(60));

        tokio::spawn(async move {
            tracing::info!(interval_ms = interval.as_millis() as u64, "retention sweeper started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::info!("retention sweeper shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        match service.sweep_expired().await {
                            Ok(0) => {}
                            Ok(purged) => {
                                tracing::info!(purged, "retention sweep purged expired messages");
                            }
                            Err(err) => {
                                tracing::error!(error = %err, "retention sweep failed");
                            }
                        }
                    }
                }
            }
        });

        RetentionSweeper { shutdown_tx }
    }
}

/// Handle to the background sweeper task.
pub struct RetentionSweeper {
    shutdown_tx: mpsc::Sender<()>,
}

impl RetentionSweeper {
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn queue(config: QueueConfig) -> QueueService {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let db = Arc::new(pool);
        crate::run_migrations(&db).await.unwrap();
        QueueService::new(db, config)
    }

    fn body(key: &str) -> MessageBody {
        MessageBody {
            key: key.into(),
            version_id: "v1".into(),
            event_time: Utc::now(),
        }
    }

    #[tokio::test]
    async fn enqueue_then_receive_round_trip() {
        let queue = queue(QueueConfig::default()).await;
        let id = queue.enqueue(&body("abc123")).await.unwrap();

        let messages = queue.receive(10, None).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message_id, id);
        assert_eq!(messages[0].body.key, "abc123");
        assert_eq!(messages[0].body.version_id, "v1");
        assert_eq!(messages[0].attributes.approx_receive_count, 1);
        assert!(!messages[0].receipt_handle.is_empty());
    }

    #[tokio::test]
    async fn leased_message_is_invisible_until_expiry() {
        let queue = queue(QueueConfig {
            visibility_timeout: Duration::from_millis(200),
            ..QueueConfig::default()
        })
        .await;
        queue.enqueue(&body("leased")).await.unwrap();

        let first = queue.receive(1, None).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(queue.receive(1, None).await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(250)).await;
        let redelivered = queue.receive(1, None).await.unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].message_id, first[0].message_id);
        assert_eq!(redelivered[0].attributes.approx_receive_count, 2);
    }

    #[tokio::test]
    async fn oversized_lease_is_clamped_and_keeps_message_invisible() {
        let queue = queue(QueueConfig::default()).await;
        queue.enqueue(&body("held")).await.unwrap();

        let first = queue
            .receive(1, Some(Duration::from_secs(u64::MAX)))
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        assert!(queue.receive(1, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn acknowledged_message_is_gone() {
        let queue = queue(QueueConfig {
            visibility_timeout: Duration::from_millis(50),
            ..QueueConfig::default()
        })
        .await;
        queue.enqueue(&body("done")).await.unwrap();

        let messages = queue.receive(1, None).await.unwrap();
        queue.acknowledge(messages[0].message_id).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(queue.receive(1, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn acknowledge_unknown_id_is_not_found() {
        let queue = queue(QueueConfig::default()).await;
        let err = queue.acknowledge(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, QueueError::MessageNotFound(_)));
        let err = queue.nack(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, QueueError::MessageNotFound(_)));
    }

    #[tokio::test]
    async fn nack_makes_message_immediately_receivable() {
        let queue = queue(QueueConfig::default()).await;
        queue.enqueue(&body("again")).await.unwrap();

        let first = queue.receive(1, None).await.unwrap();
        assert!(queue.receive(1, None).await.unwrap().is_empty());

        queue.nack(first[0].message_id).await.unwrap();
        let second = queue.receive(1, None).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].attributes.approx_receive_count, 2);
    }

    #[tokio::test]
    async fn expired_messages_are_swept_and_never_delivered() {
        let queue = queue(QueueConfig {
            retention: Duration::from_millis(50),
            ..QueueConfig::default()
        })
        .await;
        queue.enqueue(&body("stale")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(queue.receive(1, None).await.unwrap().is_empty());
        assert_eq!(queue.sweep_expired().await.unwrap(), 1);
        assert_eq!(queue.sweep_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn receive_claims_at_most_the_requested_batch() {
        let queue = queue(QueueConfig::default()).await;
        for i in 0..5 {
            queue.enqueue(&body(&format!("k{}", i))).await.unwrap();
        }

        let batch = queue.receive(3, None).await.unwrap();
        assert_eq!(batch.len(), 3);
        let rest = queue.receive(10, None).await.unwrap();
        assert_eq!(rest.len(), 2);
    }
}
