//! NotificationBridge — republishes store creation events onto the queue.
//!
//! Runs as a background task owning the receiving end of the event channel.
//! The HTTP upload path never waits on it: by the time an event reaches the
//! bridge the upload has already been acknowledged, so enqueue failures are
//! retried here and, if retries run out, alerted. They are never surfaced
//! to the uploader.

use crate::events::{ObjectEvent, ObjectEventKind};
use crate::models::message::MessageBody;
use crate::services::queue_service::QueueService;
use std::time::Duration;
use tokio::sync::mpsc;

/// Immutable bridge configuration, fixed at construction time.
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    /// Enqueue attempts per event before it is dropped.
    pub max_attempts: u32,
    /// Backoff before the second attempt; doubles per attempt after that.
    pub base_backoff: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(200),
        }
    }
}

/// Handle to the spawned bridge task.
pub struct NotificationBridge {
    shutdown_tx: mpsc::Sender<()>,
}

impl NotificationBridge {
    /// Spawn the bridge loop over the given event stream.
    pub fn spawn(
        events: mpsc::UnboundedReceiver<ObjectEvent>,
        queue: QueueService,
        config: BridgeConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        tokio::spawn(Self::run(events, queue, config, shutdown_rx));
        Self { shutdown_tx }
    }

    async fn run(
        mut events: mpsc::UnboundedReceiver<ObjectEvent>,
        queue: QueueService,
        config: BridgeConfig,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        tracing::info!(
            max_attempts = config.max_attempts,
            base_backoff_ms = config.base_backoff.as_millis() as u64,
            "notification bridge started"
        );
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("notification bridge shutting down");
                    break;
                }
                event = events.recv() => {
                    match event {
                        Some(event) => Self::forward(&queue, &config, event).await,
                        None => {
                            tracing::info!("event channel closed, notification bridge stopping");
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Forward one event, retrying transient enqueue failures with
    /// exponential backoff. Only creation events become messages.
    async fn forward(queue: &QueueService, config: &BridgeConfig, event: ObjectEvent) {
        if event.kind != ObjectEventKind::Created {
            tracing::debug!(key = %event.key, kind = ?event.kind, "skipping non-creation event");
            return;
        }

        let body = MessageBody {
            key: event.key.clone(),
            version_id: event.version_id.clone(),
            event_time: event.event_time,
        };

        // A misconfigured zero would drop events without ever trying.
        let max_attempts = config.max_attempts.max(1);
        for attempt in 0..max_attempts {
            match queue.enqueue(&body).await {
                Ok(message_id) => {
                    tracing::debug!(
                        message_id = %message_id,
                        key = %event.key,
                        version = %event.version_id,
                        "creation event bridged to queue"
                    );
                    return;
                }
                Err(err) if attempt + 1 < max_attempts => {
                    let backoff = config.base_backoff * 2u32.pow(attempt);
                    tracing::warn!(
                        error = %err,
                        key = %event.key,
                        attempt = attempt + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        "enqueue failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => {
                    // Operational alert: the event is lost past this point.
                    tracing::error!(
                        error = %err,
                        key = %event.key,
                        version = %event.version_id,
                        attempts = max_attempts,
                        "dropping creation event after exhausting enqueue retries"
                    );
                    return;
                }
            }
        }
    }

    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventSender;
    use crate::services::queue_service::QueueConfig;
    use chrono::Utc;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::sync::Arc;

    async fn queue() -> QueueService {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let db = Arc::new(pool);
        crate::run_migrations(&db).await.unwrap();
        QueueService::new(db, QueueConfig::default())
    }

    fn event(key: &str, kind: ObjectEventKind) -> ObjectEvent {
        ObjectEvent {
            bucket: "images".into(),
            key: key.into(),
            version_id: "v1".into(),
            kind,
            event_time: Utc::now(),
        }
    }

    async fn wait_for_messages(
        queue: &QueueService,
        expected: usize,
    ) -> Vec<crate::models::message::ReceivedMessage> {
        for _ in 0..50 {
            let messages = queue.receive(10, None).await.unwrap();
            if messages.len() >= expected {
                return messages;
            }
            for m in &messages {
                queue.nack(m.message_id).await.unwrap();
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("queue never reached {} visible messages", expected);
    }

    #[tokio::test]
    async fn creation_events_become_queue_messages() {
        let queue = queue().await;
        let (sender, rx) = EventSender::channel();
        let bridge = NotificationBridge::spawn(rx, queue.clone(), BridgeConfig::default());

        sender.emit(event("img.png", ObjectEventKind::Created));

        let messages = wait_for_messages(&queue, 1).await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].body.key, "img.png");
        assert_eq!(messages[0].body.version_id, "v1");

        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn zero_max_attempts_still_enqueues_once() {
        let queue = queue().await;
        let (sender, rx) = EventSender::channel();
        let bridge = NotificationBridge::spawn(
            rx,
            queue.clone(),
            BridgeConfig {
                max_attempts: 0,
                ..BridgeConfig::default()
            },
        );

        sender.emit(event("img.png", ObjectEventKind::Created));

        let messages = wait_for_messages(&queue, 1).await;
        assert_eq!(messages[0].body.key, "img.png");

        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn deletion_events_are_filtered_out() {
        let queue = queue().await;
        let (sender, rx) = EventSender::channel();
        let bridge = NotificationBridge::spawn(rx, queue.clone(), BridgeConfig::default());

        sender.emit(event("pruned.png", ObjectEventKind::Deleted));
        sender.emit(event("kept.png", ObjectEventKind::Created));

        // The bridge processes in order, so once kept.png is visible the
        // deleted event has already been (not) handled.
        let messages = wait_for_messages(&queue, 1).await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].body.key, "kept.png");

        bridge.shutdown().await;
    }
}
