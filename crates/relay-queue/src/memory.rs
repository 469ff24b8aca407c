//! In-memory embedded queue.
//!
//! Mimics a FIFO queue with per-message visibility for local development
//! and integration tests: messages become invisible for the lease duration
//! when received, reappear when the lease lapses, and strict per-group
//! ordering is enforced at delivery time (a group is blocked while an
//! earlier message of that group is leased or delayed).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info, warn};

use relay_core::MessagePointer;

use crate::callback::{CallbackCapabilities, LeaseControl, MessageCallback, VisibilityProfile};
use crate::{
    BatchMessage, EmbeddedQueue, MessageSink, QueueConsumer, QueueError, QueueMetrics,
    QueuePublisher, Result,
};

struct StoredMessage {
    seq: u64,
    body: String,
    message_group_id: Option<String>,
    visible_at: Instant,
    receipt_handle: Option<String>,
    receive_count: u32,
}

struct MemoryQueueState {
    queue_name: String,
    /// Lease granted on receive, before any extension.
    receive_lease_seconds: u32,
    messages: Mutex<Vec<StoredMessage>>,
    seq: AtomicU64,
    notify: Notify,
    total_received: AtomicU64,
    total_acked: AtomicU64,
    total_nacked: AtomicU64,
    total_data_quality: AtomicU64,
}

impl MemoryQueueState {
    /// Pull up to `max` eligible messages, leasing each one.
    ///
    /// Eligibility walks messages in arrival order: the first message of
    /// each group claims the group; later messages of a claimed group are
    /// skipped even when visible, which is what makes redelivery preserve
    /// group order.
    fn receive(&self, max: usize) -> Vec<(String, String)> {
        let now = Instant::now();
        let lease = Duration::from_secs(self.receive_lease_seconds as u64);
        let mut messages = self.messages.lock();
        messages.sort_by_key(|m| m.seq);

        let mut claimed_groups: std::collections::HashSet<String> = std::collections::HashSet::new();
        let mut leased = Vec::new();

        for msg in messages.iter_mut() {
            if leased.len() >= max {
                break;
            }
            if let Some(ref group) = msg.message_group_id {
                if !claimed_groups.insert(group.clone()) {
                    continue;
                }
            }
            if msg.visible_at > now {
                continue;
            }
            let handle = uuid::Uuid::new_v4().to_string();
            msg.receipt_handle = Some(handle.clone());
            msg.visible_at = now + lease;
            msg.receive_count += 1;
            leased.push((msg.body.clone(), handle));
        }

        leased
    }

    fn find_index(&self, messages: &[StoredMessage], receipt_handle: &str) -> Option<usize> {
        messages
            .iter()
            .position(|m| m.receipt_handle.as_deref() == Some(receipt_handle))
    }

    fn pending_count(&self) -> u64 {
        let now = Instant::now();
        self.messages
            .lock()
            .iter()
            .filter(|m| m.visible_at <= now)
            .count() as u64
    }

    fn in_flight_count(&self) -> u64 {
        let now = Instant::now();
        self.messages
            .lock()
            .iter()
            .filter(|m| m.visible_at > now && m.receipt_handle.is_some())
            .count() as u64
    }
}

#[async_trait]
impl LeaseControl for MemoryQueueState {
    fn queue_identifier(&self) -> &str {
        &self.queue_name
    }

    fn capabilities(&self) -> CallbackCapabilities {
        CallbackCapabilities::full()
    }

    async fn ack(&self, receipt_handle: &str) -> Result<()> {
        let mut messages = self.messages.lock();
        match self.find_index(&messages, receipt_handle) {
            Some(idx) => {
                messages.remove(idx);
                self.total_acked.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            None => Err(QueueError::UnknownReceiptHandle(receipt_handle.to_string())),
        }
    }

    async fn nack(&self, receipt_handle: &str) -> Result<()> {
        {
            let mut messages = self.messages.lock();
            let idx = self
                .find_index(&messages, receipt_handle)
                .ok_or_else(|| QueueError::UnknownReceiptHandle(receipt_handle.to_string()))?;
            messages[idx].visible_at = Instant::now();
            messages[idx].receipt_handle = None;
            self.total_nacked.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn change_visibility(&self, receipt_handle: &str, seconds: u32) -> Result<()> {
        {
            let mut messages = self.messages.lock();
            let idx = self
                .find_index(&messages, receipt_handle)
                .ok_or_else(|| QueueError::UnknownReceiptHandle(receipt_handle.to_string()))?;
            messages[idx].visible_at = Instant::now() + Duration::from_secs(seconds as u64);
            if seconds == 0 {
                messages[idx].receipt_handle = None;
            }
        }
        if seconds == 0 {
            self.notify.notify_waiters();
        }
        Ok(())
    }
}

/// Embedded in-memory queue: consumer and publisher over shared state.
pub struct MemoryQueue {
    state: Arc<MemoryQueueState>,
    sink: Arc<dyn MessageSink>,
    visibility: VisibilityProfile,
    connections: u32,
    receive_timeout: Duration,
    started: AtomicBool,
    running: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
}

impl MemoryQueue {
    pub fn new(queue_name: &str, sink: Arc<dyn MessageSink>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            state: Arc::new(MemoryQueueState {
                queue_name: queue_name.to_string(),
                receive_lease_seconds: 120,
                messages: Mutex::new(Vec::new()),
                seq: AtomicU64::new(0),
                notify: Notify::new(),
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

    /// Enqueue a raw body directly, bypassing pointer serialization.
    /// Dev tooling and tests use this to inject malformed messages.
    pub fn publish_raw(&self, body: &str, message_group_id: Option<&str>) {
        let seq = self.state.seq.fetch_add(1, Ordering::SeqCst);
        self.state.messages.lock().push(StoredMessage {
            seq,
            body: body.to_string(),
            message_group_id: message_group_id.map(|s| s.to_string()),
            visible_at: Instant::now(),
            receipt_handle: None,
            receive_count: 0,
        });
        self.state.notify.notify_waiters();
    }

    /// Number of messages still stored (visible or leased).
    pub fn depth(&self) -> usize {
        self.state.messages.lock().len()
    }

    async fn poll_once(
        state: &Arc<MemoryQueueState>,
        sink: &Arc<dyn MessageSink>,
        visibility: VisibilityProfile,
    ) -> usize {
        let received = state.receive(10);
        if received.is_empty() {
            return 0;
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
        count
    }
}

#[async_trait]
impl QueueConsumer for MemoryQueue {
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
            "Starting memory queue consumer"
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

                    let handled = Self::poll_once(&state, &sink, visibility).await;
                    if handled == 0 {
                        tokio::select! {
                            _ = shutdown_rx.recv() => break,
                            _ = state.notify.notified() => {}
                            _ = tokio::time::sleep(receive_timeout) => {}
                        }
                    }
                }
                debug!(queue = %state.queue_name, connection, "Consumer connection stopped");
            });
        }

        Ok(())
    }

    async fn stop(&self) {
        info!(queue = %self.state.queue_name, "Stopping memory queue consumer");
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());

        // Grace window for leased messages to reach a terminal outcome.
        let deadline = Instant::now() + Duration::from_secs(10);
        while self.state.in_flight_count() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let remaining = self.state.in_flight_count();
        if remaining > 0 {
            warn!(
                queue = %self.state.queue_name,
                remaining,
                "Forcibly releasing leased messages on stop"
            );
            let now = Instant::now();
            for msg in self.state.messages.lock().iter_mut() {
                if msg.receipt_handle.is_some() {
                    msg.visible_at = now;
                    msg.receipt_handle = None;
                }
            }
        }
    }

    fn is_healthy(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn metrics(&self) -> Result<Option<QueueMetrics>> {
        Ok(Some(QueueMetrics {
            pending_messages: self.state.pending_count(),
            in_flight_messages: self.state.in_flight_count(),
            queue_identifier: self.state.queue_name.clone(),
            total_received: self.state.total_received.load(Ordering::Relaxed),
            total_acked: self.state.total_acked.load(Ordering::Relaxed),
            total_nacked: self.state.total_nacked.load(Ordering::Relaxed),
            total_data_quality_failures: self.state.total_data_quality.load(Ordering::Relaxed),
        }))
    }
}

#[async_trait]
impl QueuePublisher for MemoryQueue {
    fn queue_identifier(&self) -> &str {
        &self.state.queue_name
    }

    async fn publish(&self, pointer: MessagePointer) -> Result<String> {
        let id = pointer.id.clone();
        let group = pointer.message_group_id.clone();
        let body = serde_json::to_string(&pointer)?;
        self.publish_raw(&body, group.as_deref());
        Ok(id)
    }
}

#[async_trait]
impl EmbeddedQueue for MemoryQueue {
    async fn init_schema(&self) -> Result<()> {
        Ok(())
    }
}
