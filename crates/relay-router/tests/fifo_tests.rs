//! Group ordering tests: strict FIFO within a group, parallelism across
//! groups, serializer bypass for ungrouped messages, and order-preserving
//! release when a group head fails.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use relay_core::{
    LifecycleSettings, MediationOutcome, MediationType, MessagePointer, PoolConfig, RouterConfig,
};
use relay_queue::{
    BatchMessage, CallbackCapabilities, LeaseControl, MessageCallback, MessageSink,
    VisibilityProfile,
};
use relay_router::{CircuitBreakerRegistry, Mediator, QueueManager, VisibilityExtender};

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

/// Mediator that records both start and completion order.
struct OrderTrackingMediator {
    delay: Duration,
    started: Mutex<Vec<String>>,
    completed: Mutex<Vec<String>>,
    fail_ids: Vec<String>,
}

impl OrderTrackingMediator {
    fn new(delay: Duration) -> Arc<Self> {
        Self::failing(delay, vec![])
    }

    fn failing(delay: Duration, fail_ids: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            delay,
            started: Mutex::new(Vec::new()),
            completed: Mutex::new(Vec::new()),
            fail_ids,
        })
    }

    fn completed(&self) -> Vec<String> {
        self.completed.lock().clone()
    }

    fn started(&self) -> Vec<String> {
        self.started.lock().clone()
    }
}

#[async_trait]
impl Mediator for OrderTrackingMediator {
    async fn process(&self, pointer: &MessagePointer) -> MediationOutcome {
        self.started.lock().push(pointer.id.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.completed.lock().push(pointer.id.clone());
        if self.fail_ids.contains(&pointer.id) {
            MediationOutcome::error_process(Some(500), "injected failure".to_string())
        } else {
            MediationOutcome::success(200)
        }
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
        mediation_target: "http://endpoint.example/x".to_string(),
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

fn build_manager(pools: Vec<PoolConfig>, mediator: Arc<dyn Mediator>) -> Arc<QueueManager> {
    let extender = Arc::new(VisibilityExtender::new(&LifecycleSettings::default()));
    let manager = Arc::new(QueueManager::new(
        mediator,
        Arc::new(CircuitBreakerRegistry::default()),
        extender,
    ));
    manager
        .apply_config(&RouterConfig {
            pools,
            queues: vec![],
        })
        .unwrap();
    manager
}

fn default_pool(code: &str, concurrency: u32) -> PoolConfig {
    PoolConfig {
        code: code.to_string(),
        max_concurrency: concurrency,
        rate_limit: None,
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool, timeout: Duration) {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within {:?}", timeout);
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[tokio::test]
async fn single_group_is_processed_strictly_in_order() {
    let mediator = OrderTrackingMediator::new(Duration::from_millis(20));
    let manager = build_manager(vec![default_pool("P", 5)], mediator.clone());

    let lease = RecordingLease::new();
    let batch: Vec<BatchMessage> = (0..10)
        .map(|i| batch_message(&lease, &format!("m{:02}", i), "P", Some("g")))
        .collect();
    manager.route_batch(batch).await;

    wait_until(|| mediator.completed().len() == 10, Duration::from_secs(2)).await;

    let completed = mediator.completed();
    for i in 0..10 {
        assert_eq!(completed[i], format!("m{:02}", i), "order broke at {}", i);
    }

    // No message starts before its predecessor completes.
    let started = mediator.started();
    for i in 0..10 {
        assert_eq!(started[i], format!("m{:02}", i));
    }
}

#[tokio::test]
async fn different_groups_run_in_parallel() {
    let mediator = OrderTrackingMediator::new(Duration::from_millis(60));
    let manager = build_manager(vec![default_pool("P", 10)], mediator.clone());

    let lease = RecordingLease::new();
    let batch: Vec<BatchMessage> = (0..5)
        .map(|i| batch_message(&lease, &format!("m{}", i), "P", Some(&format!("g{}", i))))
        .collect();

    let start = std::time::Instant::now();
    manager.route_batch(batch).await;
    wait_until(|| mediator.completed().len() == 5, Duration::from_secs(2)).await;
    let elapsed = start.elapsed();

    // Five groups at 60ms each: parallel finishes well under the 300ms a
    // serial run would need.
    assert!(
        elapsed < Duration::from_millis(250),
        "groups did not run in parallel: {:?}",
        elapsed
    );
}

#[tokio::test]
async fn ungrouped_messages_bypass_the_serializer() {
    let mediator = OrderTrackingMediator::new(Duration::from_millis(60));
    let manager = build_manager(vec![default_pool("P", 10)], mediator.clone());

    let lease = RecordingLease::new();
    let batch: Vec<BatchMessage> = (0..5)
        .map(|i| batch_message(&lease, &format!("m{}", i), "P", None))
        .collect();

    let start = std::time::Instant::now();
    manager.route_batch(batch).await;
    wait_until(|| mediator.completed().len() == 5, Duration::from_secs(2)).await;

    assert!(
        start.elapsed() < Duration::from_millis(250),
        "ungrouped messages were serialized"
    );
}

#[tokio::test]
async fn failed_group_head_does_not_block_the_chain() {
    let mediator =
        OrderTrackingMediator::failing(Duration::from_millis(20), vec!["m0".to_string()]);
    let manager = build_manager(vec![default_pool("P", 5)], mediator.clone());

    let lease = RecordingLease::new();
    manager
        .route_batch(vec![
            batch_message(&lease, "m0", "P", Some("g")),
            batch_message(&lease, "m1", "P", Some("g")),
            batch_message(&lease, "m2", "P", Some("g")),
        ])
        .await;

    wait_until(|| lease.total() == 3, Duration::from_secs(2)).await;

    // The head resets to default visibility and redelivers later; the
    // chain still advances, so the followers take their turns in order.
    assert_eq!(
        mediator.completed(),
        vec!["m0".to_string(), "m1".to_string(), "m2".to_string()]
    );
    assert_eq!(lease.ops_for("receipt-m0"), vec![LeaseOp::Visibility(120)]);
    assert_eq!(lease.ops_for("receipt-m1"), vec![LeaseOp::Ack]);
    assert_eq!(lease.ops_for("receipt-m2"), vec![LeaseOp::Ack]);
    assert_eq!(manager.in_flight_count(), 0);
}

#[tokio::test]
async fn group_order_holds_within_each_group_of_a_mixed_batch() {
    let mediator = OrderTrackingMediator::new(Duration::from_millis(10));
    let manager = build_manager(vec![default_pool("P", 5)], mediator.clone());

    let lease = RecordingLease::new();
    let mut batch = Vec::new();
    for i in 0..3 {
        batch.push(batch_message(&lease, &format!("a{}", i), "P", Some("ga")));
    }
    for i in 0..2 {
        batch.push(batch_message(&lease, &format!("n{}", i), "P", None));
    }
    for i in 0..3 {
        batch.push(batch_message(&lease, &format!("b{}", i), "P", Some("gb")));
    }
    manager.route_batch(batch).await;

    wait_until(|| mediator.completed().len() == 8, Duration::from_secs(2)).await;

    let completed = mediator.completed();
    let group_a: Vec<&String> = completed.iter().filter(|id| id.starts_with('a')).collect();
    let group_b: Vec<&String> = completed.iter().filter(|id| id.starts_with('b')).collect();
    assert_eq!(group_a, vec!["a0", "a1", "a2"]);
    assert_eq!(group_b, vec!["b0", "b1", "b2"]);
}

#[tokio::test]
async fn same_group_id_in_different_pools_is_independent() {
    let mediator = OrderTrackingMediator::new(Duration::from_millis(10));
    let manager = build_manager(
        vec![default_pool("POOL_A", 5), default_pool("POOL_B", 5)],
        mediator.clone(),
    );

    let lease = RecordingLease::new();
    let mut batch = Vec::new();
    for i in 0..3 {
        batch.push(batch_message(
            &lease,
            &format!("a{}", i),
            "POOL_A",
            Some("shared"),
        ));
    }
    for i in 0..3 {
        batch.push(batch_message(
            &lease,
            &format!("b{}", i),
            "POOL_B",
            Some("shared"),
        ));
    }
    manager.route_batch(batch).await;

    wait_until(|| mediator.completed().len() == 6, Duration::from_secs(2)).await;

    let completed = mediator.completed();
    let pool_a: Vec<&String> = completed.iter().filter(|id| id.starts_with('a')).collect();
    let pool_b: Vec<&String> = completed.iter().filter(|id| id.starts_with('b')).collect();
    assert_eq!(pool_a, vec!["a0", "a1", "a2"]);
    assert_eq!(pool_b, vec!["b0", "b1", "b2"]);
}
