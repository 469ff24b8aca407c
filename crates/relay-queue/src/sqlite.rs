//! SQLite-backed embedded queue.
//!
//! Persistent counterpart of the memory queue for single-node deployments:
//! same lease semantics, same strict per-group delivery order, state
//! survives restarts. Not intended for multi-process consumption.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Row, Sqlite};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use relay_core::MessagePointer;

use crate::callback::{CallbackCapabilities, LeaseControl, MessageCallback, VisibilityProfile};
use crate::{
    BatchMessage, EmbeddedQueue, MessageSink, QueueConsumer, QueueError, QueueMetrics,
    QueuePublisher, Result,
};

struct SqliteQueueState {
    pool: Pool<Sqlite>,
    queue_name: String,
    receive_lease_seconds: u32,
    total_received: AtomicU64,
    total_acked: AtomicU64,
    total_nacked: AtomicU64,
    total_data_quality: AtomicU64,
}

impl SqliteQueueState {
    /// Lease up to `max` eligible messages.
    ///
    /// A message is eligible when it is visible and no earlier message of
    /// the same group is still stored, so a leased or delayed group head
    /// blocks the rest of its group.
    async fn receive(&self, max: u32) -> Result<Vec<(String, String)>> {
        let now = Utc::now().timestamp();
        let lease_until = now + self.receive_lease_seconds as i64;

        let rows = sqlx::query(
            r#"
            SELECT seq, body FROM relay_messages m
            WHERE m.queue_name = ? AND m.visible_at <= ?
              AND NOT EXISTS (
                  SELECT 1 FROM relay_messages e
                  WHERE e.queue_name = m.queue_name
                    AND e.message_group_id IS NOT NULL
                    AND e.message_group_id = m.message_group_id
                    AND e.seq < m.seq
              )
            ORDER BY m.seq
            LIMIT ?
            "#,
        )
        .bind(&self.queue_name)
        .bind(now)
        .bind(max as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut leased = Vec::with_capacity(rows.len());
        for row in rows {
            let seq: i64 = row.get("seq");
            let body: String = row.get("body");
            let receipt_handle = uuid::Uuid::new_v4().to_string();

            let updated = sqlx::query(
                r#"
                UPDATE relay_messages
                SET receipt_handle = ?, visible_at = ?, receive_count = receive_count + 1
                WHERE seq = ? AND visible_at <= ?
                "#,
            )
            .bind(&receipt_handle)
            .bind(lease_until)
            .bind(seq)
            .bind(now)
            .execute(&self.pool)
            .await?;

            if updated.rows_affected() == 0 {
                // Raced with another connection.
                continue;
            }
            leased.push((body, receipt_handle));
        }

        Ok(leased)
    }

    async fn count_where(&self, condition: &str) -> Result<u64> {
        let query = format!(
            "SELECT COUNT(*) AS n FROM relay_messages WHERE queue_name = ? AND {}",
            condition
        );
        let row = sqlx::query(&query)
            .bind(&self.queue_name)
            .bind(Utc::now().timestamp())
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.get("n");
        Ok(n as u64)
    }
}

#[async_trait]
impl LeaseControl for SqliteQueueState {
    fn queue_identifier(&self) -> &str {
        &self.queue_name
    }

    fn capabilities(&self) -> CallbackCapabilities {
        CallbackCapabilities::full()
    }

    async fn ack(&self, receipt_handle: &str) -> Result<()> {
        let deleted = sqlx::query(
            "DELETE FROM relay_messages WHERE queue_name = ? AND receipt_handle = ?",
        )
        .bind(&self.queue_name)
        .bind(receipt_handle)
        .execute(&self.pool)
        .await?;

        if deleted.rows_affected() == 0 {
            return Err(QueueError::UnknownReceiptHandle(receipt_handle.to_string()));
        }
        self.total_acked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn nack(&self, receipt_handle: &str) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE relay_messages
            SET visible_at = ?, receipt_handle = NULL
            WHERE queue_name = ? AND receipt_handle = ?
            "#,
        )
        .bind(Utc::now().timestamp())
        .bind(&self.queue_name)
        .bind(receipt_handle)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(QueueError::UnknownReceiptHandle(receipt_handle.to_string()));
        }
        self.total_nacked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn change_visibility(&self, receipt_handle: &str, seconds: u32) -> Result<()> {
        let visible_at = Utc::now().timestamp() + seconds as i64;
        let updated = if seconds == 0 {
            sqlx::query(
                r#"
                UPDATE relay_messages
                SET visible_at = ?, receipt_handle = NULL
                WHERE queue_name = ? AND receipt_handle = ?
                "#,
            )
            .bind(visible_at)
            .bind(&self.queue_name)
            .bind(receipt_handle)
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query(
                r#"
                UPDATE relay_messages
                SET visible_at = ?
                WHERE queue_name = ? AND receipt_handle = ?
                "#,
            )
            .bind(visible_at)
            .bind(&self.queue_name)
            .bind(receipt_handle)
            .execute(&self.pool)
            .await?
        };

        if updated.rows_affected() == 0 {
            return Err(QueueError::UnknownReceiptHandle(receipt_handle.to_string()));
        }
        Ok(())
    }
}

/// SQLite embedded queue: consumer and publisher over one table.
pub struct SqliteQueue {
    state: Arc<SqliteQueueState>,
    sink: Arc<dyn MessageSink>,
    visibility: VisibilityProfile,
    connections: u32,
    receive_timeout: Duration,
    started: AtomicBool,
    running: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
}

impl SqliteQueue {
    pub fn new(pool: Pool<Sqlite>, queue_name: &str, sink: Arc<dyn MessageSink>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            state: Arc::new(SqliteQueueState {
                pool,
                queue_name: queue_name.to_string(),
                receive_lease_seconds: 120,
                total_received: AtomicU64::new(0),
                total_acked: AtomicU64::new(0),
                total_nacked: AtomicU64::new(0),
                total_data_quality: AtomicU64::new(0),
            }),
            sink,
            visibility: VisibilityProfile::default(),
            connections: 1,
            receive_timeout: Duration::from_millis(500),
            started: AtomicBool::new(false),
            running: Arc::new(AtomicBool::new(true)),
            shutdown_tx,
        }
    }

    pub fn with_visibility_profile(mut self, visibility: VisibilityProfile) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn with_connections(mut self, connections: u32) -> Self {
        self.connections = connections.max(1);
        self
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    async fn poll_once(
        state: &Arc<SqliteQueueState>,
        sink: &Arc<dyn MessageSink>,
        visibility: VisibilityProfile,
    ) -> Result<usize> {
        let received = state.receive(10).await?;
        if received.is_empty() {
            return Ok(0);
        }

        let mut batch = Vec::with_capacity(received.len());
        for (body, receipt_handle) in received {
            let pointer: MessagePointer = match serde_json::from_str(&body) {
                Ok(p) => p,
                Err(e) => {
                    warn!(
                        queue = %state.queue_name,
                        error = %e,
                        "Malformed message body - terminating without redelivery"
                    );
                    state.total_data_quality.fetch_add(1, Ordering::Relaxed);
                    let _ = state.ack(&receipt_handle).await;
                    continue;
                }
            };
            if let Err(reason) = pointer.validate() {
                warn!(
                    queue = %state.queue_name,
                    message_id = %pointer.id,
                    reason = %reason,
                    "Invalid message pointer - terminating without redelivery"
                );
                state.total_data_quality.fetch_add(1, Ordering::Relaxed);
                let _ = state.ack(&receipt_handle).await;
                continue;
            }

            let callback = MessageCallback::new(
                state.clone() as Arc<dyn LeaseControl>,
                receipt_handle,
                visibility,
            );
            batch.push(BatchMessage { pointer, callback });
        }

        let count = batch.len();
        if count > 0 {
            state.total_received.fetch_add(count as u64, Ordering::Relaxed);
            sink.route_batch(batch).await;
        }
        Ok(count)
    }
}

#[async_trait]
impl QueueConsumer for SqliteQueue {
    fn queue_identifier(&self) -> &str {
        &self.state.queue_name
    }

    async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!(
            queue = %self.state.queue_name,
            connections = self.connections,
            "Starting SQLite queue consumer"
        );

        for connection in 0..self.connections {
            let state = self.state.clone();
            let sink = self.sink.clone();
            let running = self.running.clone();
            let visibility = self.visibility;
            let receive_timeout = self.receive_timeout;
            let mut shutdown_rx = self.shutdown_tx.subscribe();

            tokio::spawn(async move {
                debug!(queue = %state.queue_name, connection, "Consumer connection started");
                loop {
                    if !running.load(Ordering::SeqCst) {
                        break;
                    }

                    match Self::poll_once(&state, &sink, visibility).await {
                        Ok(0) | Err(_) => {
                            // Backoff covers both the empty queue and
                            // transient backend errors.
                            tokio::select! {
                                _ = shutdown_rx.recv() => break,
                                _ = tokio::time::sleep(receive_timeout) => {}
                            }
                        }
                        Ok(_) => {}
                    }
                }
                debug!(queue = %state.queue_name, connection, "Consumer connection stopped");
            });
        }

        Ok(())
    }

    async fn stop(&self) {
        info!(queue = %self.state.queue_name, "Stopping SQLite queue consumer");
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
    }

    fn is_healthy(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn metrics(&self) -> Result<Option<QueueMetrics>> {
        let pending = self.state.count_where("visible_at <= ?").await?;
        let in_flight = self
            .state
            .count_where("visible_at > ? AND receipt_handle IS NOT NULL")
            .await?;
        Ok(Some(QueueMetrics {
            pending_messages: pending,
            in_flight_messages: in_flight,
            queue_identifier: self.state.queue_name.clone(),
            total_received: self.state.total_received.load(Ordering::Relaxed),
            total_acked: self.state.total_acked.load(Ordering::Relaxed),
            total_nacked: self.state.total_nacked.load(Ordering::Relaxed),
            total_data_quality_failures: self.state.total_data_quality.load(Ordering::Relaxed),
        }))
    }
}

#[async_trait]
impl QueuePublisher for SqliteQueue {
    fn queue_identifier(&self) -> &str {
        &self.state.queue_name
    }

    async fn publish(&self, pointer: MessagePointer) -> Result<String> {
        let id = pointer.id.clone();
        let body = serde_json::to_string(&pointer)?;
        sqlx::query(
            r#"
            INSERT INTO relay_messages
                (queue_name, message_id, message_group_id, body, visible_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&self.state.queue_name)
        .bind(&id)
        .bind(&pointer.message_group_id)
        .bind(&body)
        .bind(Utc::now().timestamp())
        .bind(Utc::now().timestamp())
        .execute(&self.state.pool)
        .await?;
        Ok(id)
    }
}

#[async_trait]
impl EmbeddedQueue for SqliteQueue {
    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS relay_messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                queue_name TEXT NOT NULL,
                message_id TEXT NOT NULL,
                message_group_id TEXT,
                body TEXT NOT NULL,
                receipt_handle TEXT,
                visible_at INTEGER NOT NULL,
                receive_count INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.state.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_relay_messages_visible
            ON relay_messages (queue_name, visible_at)
            "#,
        )
        .execute(&self.state.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_relay_messages_receipt
            ON relay_messages (queue_name, receipt_handle)
            "#,
        )
        .execute(&self.state.pool)
        .await?;

        info!(queue = %self.state.queue_name, "SQLite queue schema initialized");
        Ok(())
    }
}
