//! ProcessPool tests: concurrency bound, saturation fast-fail, rate
//! limiting, circuit gating, and terminal-exactly-once.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use relay_core::{
    BreakerSettings, LifecycleSettings, MediationOutcome, MessagePointer, MediationType,
    PoolConfig, RateLimitConfig, RouterConfig,
};
use relay_queue::{
    BatchMessage, CallbackCapabilities, LeaseControl, MessageCallback, MessageSink,
    VisibilityProfile,
};
use relay_router::{CircuitBreakerRegistry, Mediator, QueueManager, VisibilityExtender};

const TARGET: &str = "http://endpoint.example/x";

// ----------------------------------------------------------------------------
// Test doubles
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaseOp {
    Ack,
    Nack,
    Visibility(u32),
}

struct RecordingLease {
    ops: Mutex<Vec<(String, LeaseOp)>>,
}

impl RecordingLease {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            ops: Mutex::new(Vec::new()),
        })
    }

    fn ops_for(&self, receipt: &str) -> Vec<LeaseOp> {
        self.ops
            .lock()
            .iter()
            .filter(|(r, _)| r == receipt)
            .map(|(_, op)| *op)
            .collect()
    }

    fn count(&self, op: LeaseOp) -> usize {
        self.ops.lock().iter().filter(|(_, o)| *o == op).count()
    }

    fn total(&self) -> usize {
        self.ops.lock().len()
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

    async fn ack(&self, receipt_handle: &str) -> relay_queue::Result<()> {
        self.ops
            .lock()
            .push((receipt_handle.to_string(), LeaseOp::Ack));
        Ok(())
    }

    async fn nack(&self, receipt_handle: &str) -> relay_queue::Result<()> {
        self.ops
            .lock()
            .push((receipt_handle.to_string(), LeaseOp::Nack));
        Ok(())
    }

    async fn change_visibility(
        &self,
        receipt_handle: &str,
        seconds: u32,
    ) -> relay_queue::Result<()> {
        self.ops
            .lock()
            .push((receipt_handle.to_string(), LeaseOp::Visibility(seconds)));
        Ok(())
    }
}

type OutcomeFn = Box<dyn Fn(&MessagePointer) -> MediationOutcome + Send + Sync>;

struct CountingMediator {
    delay: Duration,
    outcome: OutcomeFn,
    calls: AtomicU32,
    current: AtomicU32,
    max_concurrent: AtomicU32,
}

impl CountingMediator {
    fn new(delay: Duration) -> Arc<Self> {
        Self::with_outcome(delay, Box::new(|_| MediationOutcome::success(200)))
    }

    fn with_outcome(delay: Duration, outcome: OutcomeFn) -> Arc<Self> {
        Arc::new(Self {
            delay,
            outcome,
            calls: AtomicU32::new(0),
            current: AtomicU32::new(0),
            max_concurrent: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn max_concurrent(&self) -> u32 {
        self.max_concurrent.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Mediator for CountingMediator {
    async fn process(&self, pointer: &MessagePointer) -> MediationOutcome {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.current.fetch_sub(1, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.outcome)(pointer)
    }
}

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

fn pointer(id: &str, pool: &str, group: Option<&str>) -> MessagePointer {
    MessagePointer {
        id: id.to_string(),
        pool_code: pool.to_string(),
        auth_token: "tok".to_string(),
        mediation_type: MediationType::Http,
        mediation_target: TARGET.to_string(),
        message_group_id: group.map(|s| s.to_string()),
        target_client_id: None,
    }
}

fn batch_message(
    lease: &Arc<RecordingLease>,
    id: &str,
    pool: &str,
    group: Option<&str>,
) -> BatchMessage {
    BatchMessage {
        pointer: pointer(id, pool, group),
        callback: MessageCallback::new(
            lease.clone() as Arc<dyn LeaseControl>,
            format!("receipt-{}", id),
            VisibilityProfile::default(),
        ),
    }
}

fn build_manager(
    pools: Vec<PoolConfig>,
    mediator: Arc<dyn Mediator>,
    breakers: Arc<CircuitBreakerRegistry>,
) -> Arc<QueueManager> {
    let extender = Arc::new(VisibilityExtender::new(&LifecycleSettings::default()));
    let manager = Arc::new(QueueManager::new(mediator, breakers, extender));
    manager
        .apply_config(&RouterConfig {
            pools,
            queues: vec![],
        })
        .unwrap();
    manager
}

async fn wait_for_terminal(lease: &Arc<RecordingLease>, receipt: &str) {
    for _ in 0..200 {
        if !lease.ops_for(receipt).is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no terminal outcome for {}", receipt);
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[tokio::test]
async fn concurrency_never_exceeds_the_pool_bound() {
    let mediator = CountingMediator::new(Duration::from_millis(100));
    let manager = build_manager(
        vec![PoolConfig {
            code: "P".to_string(),
            max_concurrency: 5,
            rate_limit: None,
        }],
        mediator.clone(),
        Arc::new(CircuitBreakerRegistry::default()),
    );

    let lease = RecordingLease::new();
    let batch: Vec<BatchMessage> = (0..20)
        .map(|i| batch_message(&lease, &format!("m{}", i), "P", None))
        .collect();
    manager.route_batch(batch).await;

    tokio::time::sleep(Duration::from_millis(400)).await;

    assert!(
        mediator.max_concurrent() <= 5,
        "observed {} concurrent dispatches",
        mediator.max_concurrent()
    );

    // Every message got exactly one terminal: an ack for the dispatched
    // ones, a fast-fail for the rest.
    assert_eq!(lease.total(), 20);
    let acked = lease.count(LeaseOp::Ack);
    let fast_failed = lease.count(LeaseOp::Visibility(10));
    assert_eq!(acked + fast_failed, 20);
    assert_eq!(acked as u32, mediator.calls());
    assert_eq!(manager.in_flight_count(), 0);
}

#[tokio::test]
async fn concurrency_one_degenerates_to_serial_execution() {
    let mediator = CountingMediator::new(Duration::from_millis(20));
    let manager = build_manager(
        vec![PoolConfig {
            code: "P".to_string(),
            max_concurrency: 1,
            rate_limit: None,
        }],
        mediator.clone(),
        Arc::new(CircuitBreakerRegistry::default()),
    );

    let lease = RecordingLease::new();
    for i in 0..5 {
        let id = format!("m{}", i);
        manager
            .route_batch(vec![batch_message(&lease, &id, "P", None)])
            .await;
        wait_for_terminal(&lease, &format!("receipt-{}", id)).await;
    }

    assert_eq!(mediator.calls(), 5);
    assert_eq!(mediator.max_concurrent(), 1);
    assert_eq!(lease.count(LeaseOp::Ack), 5);
}

#[tokio::test]
async fn rate_limit_fast_fails_without_dispatch() {
    let mediator = CountingMediator::new(Duration::ZERO);
    let manager = build_manager(
        vec![PoolConfig {
            code: "P".to_string(),
            max_concurrency: 10,
            rate_limit: Some(RateLimitConfig {
                per_second: 1,
                burst: Some(1),
            }),
        }],
        mediator.clone(),
        Arc::new(CircuitBreakerRegistry::default()),
    );

    let lease = RecordingLease::new();
    manager
        .route_batch(vec![
            batch_message(&lease, "m1", "P", None),
            batch_message(&lease, "m2", "P", None),
        ])
        .await;

    wait_for_terminal(&lease, "receipt-m1").await;
    wait_for_terminal(&lease, "receipt-m2").await;

    // One token in the bucket: one dispatch, one immediate fast-fail.
    assert_eq!(mediator.calls(), 1);
    assert_eq!(lease.count(LeaseOp::Ack), 1);
    assert_eq!(lease.count(LeaseOp::Visibility(10)), 1);
}

#[tokio::test]
async fn open_circuit_blocks_dispatch_at_the_pool() {
    let breakers = Arc::new(CircuitBreakerRegistry::new(BreakerSettings {
        window_size: 10,
        failure_rate_percent: 50,
        minimum_calls: 5,
        open_duration_seconds: 60,
        half_open_permitted_calls: 2,
        idle_ttl_seconds: 3_600,
    }));
    for _ in 0..5 {
        breakers.record_failure(TARGET);
    }

    let mediator = CountingMediator::new(Duration::ZERO);
    let manager = build_manager(
        vec![PoolConfig {
            code: "P".to_string(),
            max_concurrency: 5,
            rate_limit: None,
        }],
        mediator.clone(),
        breakers,
    );

    let lease = RecordingLease::new();
    manager
        .route_batch(vec![batch_message(&lease, "m1", "P", None)])
        .await;
    wait_for_terminal(&lease, "receipt-m1").await;

    assert_eq!(mediator.calls(), 0);
    assert_eq!(lease.ops_for("receipt-m1"), vec![LeaseOp::Visibility(10)]);
}

#[tokio::test]
async fn intake_overflow_fast_fails_and_clears_tracking() {
    // Group heads park in the mediator while the rest of the batch piles
    // into the intake; everything beyond capacity bounces.
    let mediator = CountingMediator::new(Duration::from_millis(50));

    let manager = build_manager(
        vec![PoolConfig {
            code: "P".to_string(),
            max_concurrency: 1,
            rate_limit: None,
        }],
        mediator.clone(),
        Arc::new(CircuitBreakerRegistry::default()),
    );

    let lease = RecordingLease::new();
    let batch: Vec<BatchMessage> = (0..60)
        .map(|i| batch_message(&lease, &format!("m{:02}", i), "P", Some("g")))
        .collect();
    manager.route_batch(batch).await;

    // Capacity is max(2 * concurrency, 50) = 50; the rest fast-fail at
    // submission and everything eventually reaches exactly one terminal.
    for i in 0..60 {
        wait_for_terminal(&lease, &format!("receipt-m{:02}", i)).await;
    }

    assert_eq!(lease.total(), 60);
    let acked = lease.count(LeaseOp::Ack);
    let fast_failed = lease.count(LeaseOp::Visibility(10));
    assert_eq!(acked + fast_failed, 60);
    assert!(fast_failed >= 9, "expected overflow, got {}", fast_failed);
    assert_eq!(manager.in_flight_count(), 0);
}

#[tokio::test]
async fn every_admitted_message_gets_exactly_one_terminal() {
    let mediator = CountingMediator::new(Duration::from_millis(10));
    let manager = build_manager(
        vec![PoolConfig {
            code: "P".to_string(),
            max_concurrency: 3,
            rate_limit: None,
        }],
        mediator.clone(),
        Arc::new(CircuitBreakerRegistry::default()),
    );

    let lease = RecordingLease::new();
    let batch: Vec<BatchMessage> = (0..10)
        .map(|i| batch_message(&lease, &format!("m{}", i), "P", None))
        .collect();
    manager.route_batch(batch).await;

    for i in 0..10 {
        let receipt = format!("receipt-m{}", i);
        wait_for_terminal(&lease, &receipt).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    for i in 0..10 {
        let receipt = format!("receipt-m{}", i);
        assert_eq!(
            lease.ops_for(&receipt).len(),
            1,
            "message {} terminated more than once",
            i
        );
    }
}
