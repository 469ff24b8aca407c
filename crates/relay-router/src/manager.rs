//! QueueManager - in-flight deduplication and routing into pools.
//!
//! The manager owns acknowledgment responsibility for every admitted
//! message: an id is inserted into the process-wide in-flight map before
//! routing, and the `TrackedCallback` decorator clears it on whichever
//! terminal outcome eventually fires. At most one message per id is in
//! flight across the whole process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use relay_core::{
    MessagePointer, PoolStats, RouterConfig, WarningCategory, WarningSeverity,
};
use relay_queue::{BatchMessage, MessageCallback, MessageSink};

use crate::breaker::CircuitBreakerRegistry;
use crate::error::RouterError;
use crate::lifecycle::VisibilityExtender;
use crate::mediator::Mediator;
use crate::metrics;
use crate::pool::ProcessPool;
use crate::warning::WarningService;
use crate::Result;

/// A message the process currently owns acknowledgment for.
#[derive(Debug, Clone)]
pub struct InFlightEntry {
    pub message_id: String,
    pub pool_code: String,
    pub message_group_id: Option<String>,
    pub queue_identifier: String,
    pub started_at: Instant,
}

impl InFlightEntry {
    fn new(pointer: &MessagePointer, queue_identifier: &str) -> Self {
        Self {
            message_id: pointer.id.clone(),
            pool_code: pointer.pool_code.clone(),
            message_group_id: pointer.message_group_id.clone(),
            queue_identifier: queue_identifier.to_string(),
            started_at: Instant::now(),
        }
    }

    pub fn elapsed_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// Decorator over the consumer's callback that clears the in-flight entry
/// and the extender registration on any terminal call.
///
/// The single gate here is what makes deregister-then-terminal observably
/// atomic: the extender and the in-flight map are updated before the
/// underlying callback fires, and only by the first terminal caller.
pub struct TrackedCallback {
    inner: MessageCallback,
    message_id: String,
    in_flight: Arc<DashMap<String, InFlightEntry>>,
    extender: Arc<VisibilityExtender>,
    terminated: AtomicBool,
}

impl TrackedCallback {
    pub fn new(
        inner: MessageCallback,
        message_id: String,
        in_flight: Arc<DashMap<String, InFlightEntry>>,
        extender: Arc<VisibilityExtender>,
    ) -> Self {
        Self {
            inner,
            message_id,
            in_flight,
            extender,
            terminated: AtomicBool::new(false),
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn queue_identifier(&self) -> &str {
        self.inner.queue_identifier()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// First terminal caller wins; everyone else becomes a no-op.
    fn begin_terminal(&self) -> bool {
        if self.terminated.swap(true, Ordering::SeqCst) {
            debug!(message_id = %self.message_id, "Terminal call after termination ignored");
            return false;
        }
        self.extender.deregister(&self.message_id);
        self.in_flight.remove(&self.message_id);
        true
    }

    pub async fn ack(&self) -> relay_queue::Result<()> {
        if !self.begin_terminal() {
            return Ok(());
        }
        self.inner.ack().await
    }

    pub async fn nack(&self) -> relay_queue::Result<()> {
        if !self.begin_terminal() {
            return Ok(());
        }
        self.inner.nack().await
    }

    pub async fn set_fast_fail_visibility(&self) -> relay_queue::Result<()> {
        if !self.begin_terminal() {
            return Ok(());
        }
        self.inner.set_fast_fail_visibility().await
    }

    pub async fn reset_visibility_to_default(&self) -> relay_queue::Result<()> {
        if !self.begin_terminal() {
            return Ok(());
        }
        self.inner.reset_visibility_to_default().await
    }

    pub async fn set_visibility_delay(&self, seconds: u32) -> relay_queue::Result<()> {
        if !self.begin_terminal() {
            return Ok(());
        }
        self.inner.set_visibility_delay(seconds).await
    }

    /// Non-terminal lease extension; refused once terminated.
    pub async fn extend_visibility(&self, seconds: u32) -> relay_queue::Result<()> {
        if self.is_terminated() {
            return Ok(());
        }
        self.inner.extend_visibility(seconds).await
    }
}

/// Central orchestrator: accepts batches from consumers, deduplicates,
/// routes into pools.
pub struct QueueManager {
    in_flight: Arc<DashMap<String, InFlightEntry>>,
    pools: DashMap<String, Arc<ProcessPool>>,
    mediator: Arc<dyn Mediator>,
    breakers: Arc<CircuitBreakerRegistry>,
    extender: Arc<VisibilityExtender>,
    warnings: Option<Arc<WarningService>>,
    running: AtomicBool,
}

impl QueueManager {
    pub fn new(
        mediator: Arc<dyn Mediator>,
        breakers: Arc<CircuitBreakerRegistry>,
        extender: Arc<VisibilityExtender>,
    ) -> Self {
        Self {
            in_flight: Arc::new(DashMap::new()),
            pools: DashMap::new(),
            mediator,
            breakers,
            extender,
            warnings: None,
            running: AtomicBool::new(true),
        }
    }

    pub fn with_warning_service(mut self, warnings: Arc<WarningService>) -> Self {
        self.warnings = Some(warnings);
        self
    }

    /// Create the configured pools. Unknown inbound pool codes are never
    /// auto-created; they bounce at routing time.
    pub fn apply_config(&self, config: &RouterConfig) -> Result<()> {
        for pool_config in &config.pools {
            if pool_config.max_concurrency == 0 {
                return Err(RouterError::Config(format!(
                    "pool [{}] has zero concurrency",
                    pool_config.code
                )));
            }
            if self.pools.contains_key(&pool_config.code) {
                return Err(RouterError::Config(format!(
                    "duplicate pool code [{}]",
                    pool_config.code
                )));
            }

            let pool = ProcessPool::new(
                pool_config.clone(),
                self.mediator.clone(),
                self.breakers.clone(),
                self.extender.clone(),
            );
            self.pools.insert(pool_config.code.clone(), Arc::new(pool));
        }

        info!(pools = self.pools.len(), "Queue manager configured");
        Ok(())
    }

    pub fn pool(&self, code: &str) -> Option<Arc<ProcessPool>> {
        self.pools.get(code).map(|p| p.clone())
    }

    pub fn pool_codes(&self) -> Vec<String> {
        self.pools.iter().map(|e| e.key().clone()).collect()
    }

    pub fn pool_stats(&self) -> Vec<PoolStats> {
        self.pools.iter().map(|e| e.value().stats()).collect()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Snapshot of the longest in-flight messages, oldest first.
    pub fn in_flight_snapshot(&self, limit: usize) -> Vec<InFlightEntry> {
        let mut entries: Vec<InFlightEntry> =
            self.in_flight.iter().map(|e| e.value().clone()).collect();
        entries.sort_by_key(|e| std::cmp::Reverse(e.started_at.elapsed()));
        entries.truncate(limit);
        entries
    }

    fn warn(
        &self,
        category: WarningCategory,
        severity: WarningSeverity,
        message: String,
    ) {
        if let Some(ref warnings) = self.warnings {
            warnings.add_warning(category, severity, message, "QueueManager".to_string());
        }
    }

    async fn route_one(&self, pointer: MessagePointer, callback: MessageCallback) {
        // Step 1: claim the id. A duplicate means an already-owned message
        // was redelivered or replayed; swallowing it with an ack keeps it
        // from double-charging pool capacity. The entry guard must drop
        // before the callback await below.
        let is_duplicate = match self.in_flight.entry(pointer.id.clone()) {
            Entry::Occupied(_) => true,
            Entry::Vacant(vacant) => {
                vacant.insert(InFlightEntry::new(&pointer, callback.queue_identifier()));
                false
            }
        };
        if is_duplicate {
            debug!(
                message_id = %pointer.id,
                queue = %callback.queue_identifier(),
                "Duplicate of an in-flight message, acking"
            );
            metrics::record_duplicate_message(callback.queue_identifier());
            let _ = callback.ack().await;
            return;
        }

        // Step 2: resolve the pool. Unknown codes are an operator problem;
        // the message goes back at default visibility until config is fixed.
        let pool = self.pools.get(&pointer.pool_code).map(|p| p.clone());
        let pool = match pool {
            Some(pool) => pool,
            None => {
                warn!(
                    message_id = %pointer.id,
                    pool_code = %pointer.pool_code,
                    "No pool configured for code, nacking"
                );
                self.warn(
                    WarningCategory::Routing,
                    WarningSeverity::Error,
                    format!(
                        "Message {} routed to unknown pool [{}]",
                        pointer.id, pointer.pool_code
                    ),
                );
                self.in_flight.remove(&pointer.id);
                let _ = callback.nack().await;
                return;
            }
        };

        // Step 3: hand over to the pool through the tracking decorator.
        let tracked = Arc::new(TrackedCallback::new(
            callback,
            pointer.id.clone(),
            self.in_flight.clone(),
            self.extender.clone(),
        ));

        let pool_code = pointer.pool_code.clone();
        if !pool.submit(pointer, tracked.clone()).await {
            self.warn(
                WarningCategory::PoolCapacity,
                WarningSeverity::Warn,
                format!("Pool [{}] intake full, fast-failing", pool_code),
            );
            // Clears the in-flight entry through the tracked gate.
            let _ = tracked.set_fast_fail_visibility().await;
        }
    }

    /// Graceful shutdown: stop intake, drain pools up to the grace period,
    /// release whatever is left.
    pub async fn shutdown(&self, grace: Duration) {
        info!("Queue manager shutting down");
        self.running.store(false, Ordering::SeqCst);

        for pool in self.pools.iter() {
            pool.value().drain();
        }

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if self.pools.iter().all(|p| p.value().is_fully_drained()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        let remaining = self.in_flight.len();
        if remaining > 0 {
            warn!(
                remaining,
                "In-flight messages at shutdown will redeliver via their visibility timers"
            );
            self.in_flight.clear();
        }

        info!("Queue manager shutdown complete");
    }
}

#[async_trait]
impl MessageSink for QueueManager {
    async fn route_batch(&self, batch: Vec<BatchMessage>) {
        if !self.running.load(Ordering::SeqCst) {
            for message in batch {
                let _ = message.callback.nack().await;
            }
            return;
        }

        for BatchMessage { pointer, callback } in batch {
            self.route_one(pointer, callback).await;
        }

        metrics::set_in_flight_count(self.in_flight.len());
    }
}
