//! Background lifecycle tasks.
//!
//! The visibility extender keeps slow in-flight messages leased: workers
//! register a message before the mediator call and the tracked callback
//! deregisters it on any terminal outcome, so an extension can never race
//! a release. The remaining tasks are periodic maintenance sweeps.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use relay_core::{LifecycleSettings, WarningCategory, WarningSeverity};
use relay_queue::QueueConsumer;

use crate::breaker::CircuitBreakerRegistry;
use crate::manager::TrackedCallback;
use crate::metrics;
use crate::warning::WarningService;

/// Registry of in-flight messages whose leases need periodic extension.
pub struct VisibilityExtender {
    entries: DashMap<String, Arc<TrackedCallback>>,
    interval: Duration,
    warnings: parking_lot::RwLock<Option<Arc<WarningService>>>,
}

impl VisibilityExtender {
    pub fn new(settings: &LifecycleSettings) -> Self {
        Self {
            entries: DashMap::new(),
            interval: Duration::from_secs(settings.visibility_extension_interval_seconds.max(1)),
            warnings: parking_lot::RwLock::new(None),
        }
    }

    pub fn set_warning_service(&self, warnings: Arc<WarningService>) {
        *self.warnings.write() = Some(warnings);
    }

    /// Lease granted per extension: twice the wake interval, so every
    /// registered message is extended again before its lease lapses.
    pub fn lease_seconds(&self) -> u32 {
        (self.interval.as_secs() as u32).saturating_mul(2)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn register(&self, message_id: &str, callback: Arc<TrackedCallback>) {
        self.entries.insert(message_id.to_string(), callback);
    }

    pub fn deregister(&self, message_id: &str) {
        self.entries.remove(message_id);
    }

    pub fn tracked_count(&self) -> usize {
        self.entries.len()
    }

    /// One extension sweep over everything still registered.
    pub async fn extend_all(&self) {
        if self.entries.is_empty() {
            return;
        }

        let lease = self.lease_seconds();
        let snapshot: Vec<(String, Arc<TrackedCallback>)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        for (message_id, callback) in snapshot {
            // Backstop against a terminal outcome between snapshot and
            // extension; the callback itself refuses late extensions too.
            if callback.is_terminated() {
                self.entries.remove(&message_id);
                continue;
            }

            match callback.extend_visibility(lease).await {
                Ok(()) => {
                    metrics::record_visibility_extension(callback.queue_identifier());
                    debug!(
                        message_id = %message_id,
                        lease_seconds = lease,
                        "Extended message visibility"
                    );
                }
                Err(e) => {
                    warn!(
                        message_id = %message_id,
                        error = %e,
                        "Failed to extend message visibility"
                    );
                    if let Some(ref warnings) = *self.warnings.read() {
                        warnings.add_warning(
                            WarningCategory::QueueConnectivity,
                            WarningSeverity::Warn,
                            format!("Visibility extension failed for message {}: {}", message_id, e),
                            "VisibilityExtender".to_string(),
                        );
                    }
                }
            }
        }
    }
}

/// Spawn the extension ticker. Wakes every `interval` (= lease / 2).
pub fn spawn_visibility_extender(
    extender: Arc<VisibilityExtender>,
    shutdown: broadcast::Sender<()>,
) {
    let mut shutdown_rx = shutdown.subscribe();
    let interval = extender.interval();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => extender.extend_all().await,
                _ = shutdown_rx.recv() => {
                    info!("Visibility extender shutting down");
                    break;
                }
            }
        }
    });
}

/// Spawn the breaker registry sweeper: drops idle breakers so the registry
/// cannot grow without bound.
pub fn spawn_breaker_maintenance(
    registry: Arc<CircuitBreakerRegistry>,
    interval: Duration,
    shutdown: broadcast::Sender<()>,
) {
    let mut shutdown_rx = shutdown.subscribe();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    registry.evict_idle();
                }
                _ = shutdown_rx.recv() => {
                    info!("Breaker maintenance shutting down");
                    break;
                }
            }
        }
    });
}

/// Spawn the warning store cleanup sweep.
pub fn spawn_warning_cleanup(
    warnings: Arc<WarningService>,
    interval: Duration,
    shutdown: broadcast::Sender<()>,
) {
    let mut shutdown_rx = shutdown.subscribe();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => warnings.cleanup(),
                _ = shutdown_rx.recv() => {
                    info!("Warning cleanup shutting down");
                    break;
                }
            }
        }
    });
}

/// Spawn the queue-depth publisher: polls each consumer's metrics and
/// mirrors them onto the metrics facade.
pub fn spawn_queue_metrics_publisher(
    consumers: Vec<Arc<dyn QueueConsumer>>,
    interval: Duration,
    shutdown: broadcast::Sender<()>,
) {
    let mut shutdown_rx = shutdown.subscribe();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for consumer in &consumers {
                        match consumer.metrics().await {
                            Ok(Some(m)) => {
                                metrics::set_queue_depth(
                                    &m.queue_identifier,
                                    m.pending_messages,
                                    m.in_flight_messages,
                                );
                            }
                            Ok(None) => {}
                            Err(e) => {
                                debug!(
                                    consumer = %consumer.queue_identifier(),
                                    error = %e,
                                    "Queue metrics unavailable"
                                );
                            }
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Queue metrics publisher shutting down");
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use relay_core::LifecycleSettings;
    use relay_queue::{CallbackCapabilities, LeaseControl, MessageCallback, VisibilityProfile};

    struct RecordingLease {
        visibility_calls: Mutex<Vec<u32>>,
    }

    impl RecordingLease {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                visibility_calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LeaseControl for RecordingLease {
        fn queue_identifier(&self) -> &str {
            "test-queue"
        }

        fn capabilities(&self) -> CallbackCapabilities {
            CallbackCapabilities::full()
        }

        async fn ack(&self, _receipt_handle: &str) -> relay_queue::Result<()> {
            Ok(())
        }

        async fn nack(&self, _receipt_handle: &str) -> relay_queue::Result<()> {
            Ok(())
        }

        async fn change_visibility(
            &self,
            _receipt_handle: &str,
            seconds: u32,
        ) -> relay_queue::Result<()> {
            self.visibility_calls.lock().push(seconds);
            Ok(())
        }
    }

    fn tracked(
        lease: Arc<RecordingLease>,
        extender: &Arc<VisibilityExtender>,
    ) -> Arc<TrackedCallback> {
        let in_flight = Arc::new(DashMap::new());
        Arc::new(TrackedCallback::new(
            MessageCallback::new(
                lease as Arc<dyn LeaseControl>,
                "rh-1".to_string(),
                VisibilityProfile::default(),
            ),
            "m1".to_string(),
            in_flight,
            extender.clone(),
        ))
    }

    fn extender_with_interval(seconds: u64) -> Arc<VisibilityExtender> {
        Arc::new(VisibilityExtender::new(&LifecycleSettings {
            visibility_extension_interval_seconds: seconds,
        }))
    }

    #[tokio::test]
    async fn sweep_extends_registered_messages_with_twice_the_interval() {
        let extender = extender_with_interval(30);
        assert_eq!(extender.lease_seconds(), 60);

        let lease = RecordingLease::new();
        let callback = tracked(lease.clone(), &extender);
        extender.register("m1", callback);

        extender.extend_all().await;
        extender.extend_all().await;

        assert_eq!(*lease.visibility_calls.lock(), vec![60, 60]);
    }

    #[tokio::test]
    async fn terminal_outcome_stops_extensions() {
        let extender = extender_with_interval(30);
        let lease = RecordingLease::new();
        let callback = tracked(lease.clone(), &extender);
        extender.register("m1", callback.clone());
        assert_eq!(extender.tracked_count(), 1);

        callback.ack().await.unwrap();
        // Deregistration happens before the terminal call is emitted.
        assert_eq!(extender.tracked_count(), 0);

        extender.extend_all().await;
        assert!(lease.visibility_calls.lock().is_empty());
    }

    #[tokio::test]
    async fn stale_entries_are_dropped_by_the_sweep() {
        let extender = extender_with_interval(30);
        let lease = RecordingLease::new();
        let callback = tracked(lease.clone(), &extender);

        // Register under a different id so the terminal call cannot
        // deregister it; the sweep's terminated check must catch it.
        extender.register("other", callback.clone());
        callback.ack().await.unwrap();

        extender.extend_all().await;
        assert_eq!(extender.tracked_count(), 0);
        assert!(lease.visibility_calls.lock().is_empty());
    }
}
