//! Metrics for the routing core.
//!
//! Two layers: `metrics` facade counters/gauges for export by whatever
//! recorder the embedding process installs, and a per-pool collector for
//! the stats surface.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::{counter, gauge, histogram};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

// ============================================================================
// Facade helpers
// ============================================================================

pub fn record_message_processed(pool_code: &str, result: &str) {
    counter!(
        "relay_messages_processed_total",
        "pool" => pool_code.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
}

pub fn record_mediation_latency(pool_code: &str, duration_ms: u64) {
    histogram!(
        "relay_mediation_duration_ms",
        "pool" => pool_code.to_string()
    )
    .record(duration_ms as f64);
}

pub fn record_duplicate_message(queue: &str) {
    counter!(
        "relay_duplicate_messages_total",
        "queue" => queue.to_string()
    )
    .increment(1);
}

pub fn record_intake_rejected(pool_code: &str) {
    counter!(
        "relay_intake_rejected_total",
        "pool" => pool_code.to_string()
    )
    .increment(1);
}

pub fn set_pool_active_workers(pool_code: &str, count: u32) {
    gauge!(
        "relay_pool_active_workers",
        "pool" => pool_code.to_string()
    )
    .set(count as f64);
}

pub fn set_pool_queue_size(pool_code: &str, size: u32) {
    gauge!(
        "relay_pool_queue_size",
        "pool" => pool_code.to_string()
    )
    .set(size as f64);
}

pub fn set_in_flight_count(count: usize) {
    gauge!("relay_in_flight_messages").set(count as f64);
}

pub fn set_queue_depth(queue: &str, pending: u64, in_flight: u64) {
    gauge!(
        "relay_queue_pending_messages",
        "queue" => queue.to_string()
    )
    .set(pending as f64);
    gauge!(
        "relay_queue_in_flight_messages",
        "queue" => queue.to_string()
    )
    .set(in_flight as f64);
}

pub fn record_visibility_extension(queue: &str) {
    counter!(
        "relay_visibility_extensions_total",
        "queue" => queue.to_string()
    )
    .increment(1);
}

pub fn record_endpoint_requested_delay(pool_code: &str) {
    counter!(
        "relay_endpoint_requested_delay_total",
        "pool" => pool_code.to_string()
    )
    .increment(1);
}

// ============================================================================
// Per-pool collector
// ============================================================================

const MAX_DURATION_SAMPLES: usize = 4096;

/// Snapshot of a pool's processing counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolMetricsSnapshot {
    pub total_success: u64,
    pub total_failure: u64,
    pub total_rate_limited: u64,
    pub total_payload_dropped: u64,
    /// Count of `ack:true` responses carrying a visibilityDelay hint.
    pub total_endpoint_delay_requests: u64,
    pub avg_duration_ms: f64,
    pub min_duration_ms: u64,
    pub max_duration_ms: u64,
    pub sample_count: u64,
}

/// Rolling counters and duration samples for one pool.
pub struct PoolMetricsCollector {
    total_success: AtomicU64,
    total_failure: AtomicU64,
    total_rate_limited: AtomicU64,
    total_payload_dropped: AtomicU64,
    total_endpoint_delay_requests: AtomicU64,
    durations_ms: RwLock<VecDeque<u64>>,
}

impl PoolMetricsCollector {
    pub fn new() -> Self {
        Self {
            total_success: AtomicU64::new(0),
            total_failure: AtomicU64::new(0),
            total_rate_limited: AtomicU64::new(0),
            total_payload_dropped: AtomicU64::new(0),
            total_endpoint_delay_requests: AtomicU64::new(0),
            durations_ms: RwLock::new(VecDeque::with_capacity(MAX_DURATION_SAMPLES)),
        }
    }

    pub fn record_success(&self, duration_ms: u64) {
        self.total_success.fetch_add(1, Ordering::Relaxed);
        self.push_sample(duration_ms);
    }

    pub fn record_failure(&self, duration_ms: u64) {
        self.total_failure.fetch_add(1, Ordering::Relaxed);
        self.push_sample(duration_ms);
    }

    pub fn record_rate_limited(&self) {
        self.total_rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_payload_dropped(&self) {
        self.total_payload_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_endpoint_delay(&self) {
        self.total_endpoint_delay_requests
            .fetch_add(1, Ordering::Relaxed);
    }

    fn push_sample(&self, duration_ms: u64) {
        let mut samples = self.durations_ms.write();
        if samples.len() >= MAX_DURATION_SAMPLES {
            samples.pop_front();
        }
        samples.push_back(duration_ms);
    }

    pub fn snapshot(&self) -> PoolMetricsSnapshot {
        let samples = self.durations_ms.read();
        let sample_count = samples.len() as u64;
        let (mut min, mut max, mut sum) = (u64::MAX, 0u64, 0u64);
        for &d in samples.iter() {
            min = min.min(d);
            max = max.max(d);
            sum += d;
        }

        PoolMetricsSnapshot {
            total_success: self.total_success.load(Ordering::Relaxed),
            total_failure: self.total_failure.load(Ordering::Relaxed),
            total_rate_limited: self.total_rate_limited.load(Ordering::Relaxed),
            total_payload_dropped: self.total_payload_dropped.load(Ordering::Relaxed),
            total_endpoint_delay_requests: self
                .total_endpoint_delay_requests
                .load(Ordering::Relaxed),
            avg_duration_ms: if sample_count > 0 {
                sum as f64 / sample_count as f64
            } else {
                0.0
            },
            min_duration_ms: if sample_count > 0 { min } else { 0 },
            max_duration_ms: max,
            sample_count,
        }
    }

    pub fn reset(&self) {
        self.total_success.store(0, Ordering::Relaxed);
        self.total_failure.store(0, Ordering::Relaxed);
        self.total_rate_limited.store(0, Ordering::Relaxed);
        self.total_payload_dropped.store(0, Ordering::Relaxed);
        self.total_endpoint_delay_requests.store(0, Ordering::Relaxed);
        self.durations_ms.write().clear();
    }
}

impl Default for PoolMetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
