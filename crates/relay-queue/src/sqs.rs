//! AWS SQS queue consumer.
//!
//! Long-polls a (FIFO) queue and feeds parsed pointers into the sink.
//! `change_message_visibility` is the single primitive behind nack,
//! fast-fail, default-reset, and lease extension.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_sqs::types::QueueAttributeName;
use aws_sdk_sqs::Client;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use relay_core::MessagePointer;

use crate::callback::{CallbackCapabilities, LeaseControl, MessageCallback, VisibilityProfile};
use crate::{
    BatchMessage, MessageSink, QueueConsumer, QueueError, QueueMetrics, Result,
};

/// Long poll wait. Short enough to keep shutdown responsive; SQS max is 20.
const DEFAULT_WAIT_TIME_SECONDS: i32 = 5;

struct SqsLease {
    client: Client,
    queue_url: String,
    queue_name: String,
    total_acked: AtomicU64,
    total_nacked: AtomicU64,
}

#[async_trait]
impl LeaseControl for SqsLease {
    fn queue_identifier(&self) -> &str {
        &self.queue_name
    }

    fn capabilities(&self) -> CallbackCapabilities {
        CallbackCapabilities::full()
    }

    async fn ack(&self, receipt_handle: &str) -> Result<()> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| QueueError::Sqs(e.to_string()))?;
        self.total_acked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn nack(&self, receipt_handle: &str) -> Result<()> {
        // Visibility 0 releases the message immediately.
        self.change_visibility(receipt_handle, 0).await?;
        self.total_nacked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn change_visibility(&self, receipt_handle: &str, seconds: u32) -> Result<()> {
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(seconds as i32)
            .send()
            .await
            .map_err(|e| QueueError::Sqs(e.to_string()))?;
        Ok(())
    }
}

/// SQS queue consumer with one long-polling loop per connection.
pub struct SqsQueueConsumer {
    lease: Arc<SqsLease>,
    sink: Arc<dyn MessageSink>,
    visibility: VisibilityProfile,
    receive_visibility_seconds: i32,
    wait_time_seconds: i32,
    connections: u32,
    started: AtomicBool,
    running: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
    total_received: Arc<AtomicU64>,
    total_data_quality: Arc<AtomicU64>,
}

impl SqsQueueConsumer {
    /// Connect and verify the queue exists. Fails fast when the backend is
    /// unreachable so a misconfigured instance never starts half-alive.
    pub async fn connect(
        client: Client,
        queue_url: String,
        sink: Arc<dyn MessageSink>,
    ) -> Result<Self> {
        client
            .get_queue_attributes()
            .queue_url(&queue_url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .send()
            .await
            .map_err(|e| QueueError::Connection(format!("SQS queue check failed: {}", e)))?;

        let queue_name = queue_url
            .rsplit('/')
            .next()
            .unwrap_or("unknown")
            .to_string();

        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            lease: Arc::new(SqsLease {
                client,
                queue_url,
                queue_name,
                total_acked: AtomicU64::new(0),
                total_nacked: AtomicU64::new(0),
            }),
            sink,
            visibility: VisibilityProfile::default(),
            receive_visibility_seconds: 120,
            wait_time_seconds: DEFAULT_WAIT_TIME_SECONDS,
            connections: 1,
            started: AtomicBool::new(false),
            running: Arc::new(AtomicBool::new(true)),
            shutdown_tx,
            total_received: Arc::new(AtomicU64::new(0)),
            total_data_quality: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn with_visibility_profile(mut self, visibility: VisibilityProfile) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn with_receive_visibility_seconds(mut self, seconds: u32) -> Self {
        self.receive_visibility_seconds = seconds as i32;
        self
    }

    pub fn with_wait_time_seconds(mut self, seconds: i32) -> Self {
        self.wait_time_seconds = seconds.clamp(0, 20);
        self
    }

    pub fn with_connections(mut self, connections: u32) -> Self {
        self.connections = connections.max(1);
        self
    }

    async fn poll_once(
        lease: &Arc<SqsLease>,
        sink: &Arc<dyn MessageSink>,
        visibility: VisibilityProfile,
        receive_visibility_seconds: i32,
        wait_time_seconds: i32,
        total_received: &AtomicU64,
        total_data_quality: &AtomicU64,
    ) -> Result<usize> {
        let result = lease
            .client
            .receive_message()
            .queue_url(&lease.queue_url)
            .max_number_of_messages(10)
            .visibility_timeout(receive_visibility_seconds)
            .wait_time_seconds(wait_time_seconds)
            .send()
            .await
            .map_err(|e| QueueError::Sqs(e.to_string()))?;

        let raw = result.messages.unwrap_or_default();
        let mut batch = Vec::with_capacity(raw.len());

        for sqs_msg in raw {
            let receipt_handle = match sqs_msg.receipt_handle() {
                Some(h) => h.to_string(),
                None => {
                    error!(queue = %lease.queue_name, "SQS message without receipt handle");
                    continue;
                }
            };

            let parsed = sqs_msg
                .body()
                .ok_or_else(|| "empty body".to_string())
                .and_then(|body| {
                    serde_json::from_str::<MessagePointer>(body).map_err(|e| e.to_string())
                })
                .and_then(|pointer| pointer.validate().map(|_| pointer));

            match parsed {
                Ok(pointer) => {
                    let callback = MessageCallback::new(
                        lease.clone() as Arc<dyn LeaseControl>,
                        receipt_handle,
                        visibility,
                    );
                    batch.push(BatchMessage { pointer, callback });
                }
                Err(reason) => {
                    warn!(
                        queue = %lease.queue_name,
                        reason = %reason,
                        "Malformed SQS message - terminating without redelivery"
                    );
                    total_data_quality.fetch_add(1, Ordering::Relaxed);
                    let _ = lease.ack(&receipt_handle).await;
                }
            }
        }

        let count = batch.len();
        if count > 0 {
            total_received.fetch_add(count as u64, Ordering::Relaxed);
            sink.route_batch(batch).await;
        }
        Ok(count)
    }
}

#[async_trait]
impl QueueConsumer for SqsQueueConsumer {
    fn queue_identifier(&self) -> &str {
        &self.lease.queue_name
    }

    async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!(
            queue = %self.lease.queue_name,
            connections = self.connections,
            "Starting SQS consumer"
        );

        for connection in 0..self.connections {
            let lease = self.lease.clone();
            let sink = self.sink.clone();
            let running = self.running.clone();
            let visibility = self.visibility;
            let receive_visibility_seconds = self.receive_visibility_seconds;
            let wait_time_seconds = self.wait_time_seconds;
            let total_received = self.total_received.clone();
            let total_data_quality = self.total_data_quality.clone();
            let mut shutdown_rx = self.shutdown_tx.subscribe();

            tokio::spawn(async move {
                debug!(queue = %lease.queue_name, connection, "SQS polling loop started");
                let mut backoff = Duration::from_secs(1);
                loop {
                    if !running.load(Ordering::SeqCst) {
                        break;
                    }

                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        result = Self::poll_once(
                            &lease,
                            &sink,
                            visibility,
                            receive_visibility_seconds,
                            wait_time_seconds,
                            &total_received,
                            &total_data_quality,
                        ) => {
                            match result {
                                Ok(_) => backoff = Duration::from_secs(1),
                                Err(e) => {
                                    error!(
                                        queue = %lease.queue_name,
                                        error = %e,
                                        backoff_secs = backoff.as_secs(),
                                        "SQS poll failed, backing off"
                                    );
                                    tokio::time::sleep(backoff).await;
                                    backoff = (backoff * 2).min(Duration::from_secs(30));
                                }
                            }
                        }
                    }
                }
                debug!(queue = %lease.queue_name, connection, "SQS polling loop stopped");
            });
        }

        Ok(())
    }

    async fn stop(&self) {
        info!(queue = %self.lease.queue_name, "Stopping SQS consumer");
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
    }

    fn is_healthy(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn metrics(&self) -> Result<Option<QueueMetrics>> {
        let attrs = self
            .lease
            .client
            .get_queue_attributes()
            .queue_url(&self.lease.queue_url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessagesNotVisible)
            .send()
            .await
            .map_err(|e| QueueError::Sqs(e.to_string()))?;

        let get = |name: &QueueAttributeName| -> u64 {
            attrs
                .attributes()
                .and_then(|m| m.get(name))
                .and_then(|v| v.parse().ok())
                .unwrap_or(0)
        };

        Ok(Some(QueueMetrics {
            pending_messages: get(&QueueAttributeName::ApproximateNumberOfMessages),
            in_flight_messages: get(&QueueAttributeName::ApproximateNumberOfMessagesNotVisible),
            queue_identifier: self.lease.queue_name.clone(),
            total_received: self.total_received.load(Ordering::Relaxed),
            total_acked: self.lease.total_acked.load(Ordering::Relaxed),
            total_nacked: self.lease.total_nacked.load(Ordering::Relaxed),
            total_data_quality_failures: self.total_data_quality.load(Ordering::Relaxed),
        }))
    }
}
