//! ProcessPool - bounded-parallel dispatch with per-group FIFO.
//!
//! Three non-blocking gates guard each dispatch: a worker slot from the
//! pool semaphore, a token from the pool's bucket, and a permit from the
//! target's circuit breaker. Failing any gate releases the message back to
//! the queue with the short fast-fail delay; the queue, not pool memory,
//! is the durable backlog.
//!
//! Group ordering uses a chain per message group: submissions append to
//! the chain and a single head-runner task works it front to back, so at
//! most one message per group is ever inside the mediator. Idle chains are
//! removed; groups hold no task when empty.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use relay_core::{MediationResult, MessagePointer, PoolConfig, PoolStats};

use crate::breaker::CircuitBreakerRegistry;
use crate::lifecycle::VisibilityExtender;
use crate::manager::TrackedCallback;
use crate::mediator::Mediator;
use crate::metrics::{self, PoolMetricsCollector, PoolMetricsSnapshot};
use crate::rate_limit::PoolRateLimiter;

const QUEUE_CAPACITY_MULTIPLIER: u32 = 2;
const MIN_QUEUE_CAPACITY: u32 = 50;

struct PoolTask {
    pointer: MessagePointer,
    callback: Arc<TrackedCallback>,
}

#[derive(Default)]
struct GroupChain {
    queue: Mutex<VecDeque<PoolTask>>,
    running: AtomicBool,
    /// Set (under the queue lock) when the head-runner retires the chain;
    /// submitters seeing it retry against a fresh chain.
    closed: AtomicBool,
}

struct PoolShared {
    code: String,
    max_concurrency: u32,
    capacity: u32,
    mediator: Arc<dyn Mediator>,
    breakers: Arc<CircuitBreakerRegistry>,
    limiter: PoolRateLimiter,
    semaphore: Arc<Semaphore>,
    groups: DashMap<Arc<str>, Arc<GroupChain>>,
    queue_size: AtomicU32,
    active_workers: AtomicU32,
    running: AtomicBool,
    collector: PoolMetricsCollector,
    extender: Arc<VisibilityExtender>,
}

pub struct ProcessPool {
    shared: Arc<PoolShared>,
}

impl ProcessPool {
    pub fn new(
        config: PoolConfig,
        mediator: Arc<dyn Mediator>,
        breakers: Arc<CircuitBreakerRegistry>,
        extender: Arc<VisibilityExtender>,
    ) -> Self {
        let max_concurrency = config.max_concurrency.max(1);
        let capacity = std::cmp::max(
            max_concurrency * QUEUE_CAPACITY_MULTIPLIER,
            MIN_QUEUE_CAPACITY,
        );

        info!(
            pool_code = %config.code,
            max_concurrency,
            rate_limit = ?config.rate_limit,
            "Created process pool"
        );

        Self {
            shared: Arc::new(PoolShared {
                code: config.code,
                max_concurrency,
                capacity,
                mediator,
                breakers,
                limiter: PoolRateLimiter::new(config.rate_limit),
                semaphore: Arc::new(Semaphore::new(max_concurrency as usize)),
                groups: DashMap::new(),
                queue_size: AtomicU32::new(0),
                active_workers: AtomicU32::new(0),
                running: AtomicBool::new(true),
                collector: PoolMetricsCollector::new(),
                extender,
            }),
        }
    }

    /// Submit one message. Returns false when the intake is full or the
    /// pool is draining; the caller translates that into a fast-fail.
    pub async fn submit(&self, pointer: MessagePointer, callback: Arc<TrackedCallback>) -> bool {
        let shared = &self.shared;
        if !shared.running.load(Ordering::SeqCst) {
            return false;
        }

        let size = shared.queue_size.fetch_add(1, Ordering::SeqCst) + 1;
        if size > shared.capacity {
            shared.queue_size.fetch_sub(1, Ordering::SeqCst);
            metrics::record_intake_rejected(&shared.code);
            debug!(
                pool_code = %shared.code,
                capacity = shared.capacity,
                "Pool intake full, rejecting"
            );
            return false;
        }

        let task = PoolTask { pointer, callback };
        let group = task
            .pointer
            .message_group_id
            .as_deref()
            .filter(|g| !g.is_empty())
            .map(Arc::<str>::from);

        match group {
            Some(group) => Self::enqueue_grouped(shared, group, task).await,
            None => {
                let shared = shared.clone();
                tokio::spawn(async move {
                    Self::run_task(&shared, task).await;
                });
            }
        }

        true
    }

    async fn enqueue_grouped(shared: &Arc<PoolShared>, group: Arc<str>, task: PoolTask) {
        let mut task = Some(task);
        loop {
            let chain = shared
                .groups
                .entry(group.clone())
                .or_default()
                .clone();

            let spawn_runner = {
                let mut queue = chain.queue.lock();
                if chain.closed.load(Ordering::SeqCst) {
                    // Retired between lookup and lock; retry against the
                    // replacement entry.
                    drop(queue);
                    tokio::task::yield_now().await;
                    continue;
                }
                queue.push_back(task.take().expect("task consumed once"));
                !chain.running.swap(true, Ordering::SeqCst)
            };

            if spawn_runner {
                let shared = shared.clone();
                let group = group.clone();
                tokio::spawn(async move {
                    Self::run_group(shared, group, chain).await;
                });
            }
            return;
        }
    }

    /// Head-runner for one group chain: works the queue front to back,
    /// then retires the chain.
    ///
    /// Each head runs to its terminal outcome before the next is
    /// dequeued, whatever that outcome was; a released head rejoins the
    /// queue through its own visibility timer while the chain advances.
    async fn run_group(shared: Arc<PoolShared>, group: Arc<str>, chain: Arc<GroupChain>) {
        debug!(pool_code = %shared.code, group = %group, "Group runner started");
        loop {
            let task = chain.queue.lock().pop_front();
            match task {
                Some(task) => {
                    Self::run_task(&shared, task).await;
                }
                None => {
                    let queue = chain.queue.lock();
                    if queue.is_empty() {
                        chain.closed.store(true, Ordering::SeqCst);
                        drop(queue);
                        shared
                            .groups
                            .remove_if(&group, |_, candidate| Arc::ptr_eq(candidate, &chain));
                        break;
                    }
                    // A submit raced the pop; keep running.
                }
            }
        }
        debug!(pool_code = %shared.code, group = %group, "Group runner exited");
    }

    /// One dispatch: claim gates, mediate, map the outcome to a terminal
    /// callback action.
    async fn run_task(shared: &Arc<PoolShared>, task: PoolTask) {
        let PoolTask { pointer, callback } = task;
        shared.queue_size.fetch_sub(1, Ordering::SeqCst);

        if !shared.running.load(Ordering::SeqCst) {
            let _ = callback.set_fast_fail_visibility().await;
            return;
        }

        let permit = match shared.semaphore.clone().try_acquire_owned() {
            Ok(p) => p,
            Err(_) => {
                debug!(
                    pool_code = %shared.code,
                    message_id = %pointer.id,
                    "No worker slot available, fast-failing"
                );
                metrics::record_message_processed(
                    &shared.code,
                    MediationResult::NackPoolFull.as_str(),
                );
                let _ = callback.set_fast_fail_visibility().await;
                return;
            }
        };

        if !shared.limiter.try_acquire() {
            drop(permit);
            shared.collector.record_rate_limited();
            metrics::record_message_processed(
                &shared.code,
                MediationResult::NackRateLimit.as_str(),
            );
            debug!(
                pool_code = %shared.code,
                message_id = %pointer.id,
                "Rate limit exhausted, fast-failing"
            );
            let _ = callback.set_fast_fail_visibility().await;
            return;
        }

        if !shared.breakers.try_permit(&pointer.mediation_target) {
            drop(permit);
            metrics::record_message_processed(
                &shared.code,
                MediationResult::NackCircuitOpen.as_str(),
            );
            debug!(
                pool_code = %shared.code,
                message_id = %pointer.id,
                target = %pointer.mediation_target,
                "Circuit open, fast-failing without dispatch"
            );
            let _ = callback.set_fast_fail_visibility().await;
            return;
        }

        shared.active_workers.fetch_add(1, Ordering::SeqCst);
        metrics::set_pool_active_workers(
            &shared.code,
            shared.active_workers.load(Ordering::SeqCst),
        );
        shared.extender.register(&pointer.id, callback.clone());

        let start = Instant::now();
        let outcome = shared.mediator.process(&pointer).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        metrics::record_mediation_latency(&shared.code, duration_ms);
        metrics::record_message_processed(&shared.code, outcome.result.as_str());

        match outcome.result {
            MediationResult::Success => {
                shared.collector.record_success(duration_ms);
                debug!(
                    message_id = %pointer.id,
                    duration_ms,
                    "Message dispatched"
                );
                let _ = callback.ack().await;
            }
            MediationResult::SuccessWithDelay(delay) => {
                shared.collector.record_success(duration_ms);
                shared.collector.record_endpoint_delay();
                metrics::record_endpoint_requested_delay(&shared.code);
                debug!(
                    message_id = %pointer.id,
                    requested_delay = delay,
                    "Message dispatched, endpoint requested backoff"
                );
                let _ = callback.ack().await;
            }
            MediationResult::ErrorPayload => {
                shared.collector.record_payload_dropped();
                warn!(
                    message_id = %pointer.id,
                    status_code = ?outcome.status_code,
                    error = ?outcome.error_message,
                    "Dropping message after data-quality rejection"
                );
                let _ = callback.ack().await;
            }
            MediationResult::NackRateLimit
            | MediationResult::NackPoolFull
            | MediationResult::NackCircuitOpen => {
                let _ = callback.set_fast_fail_visibility().await;
            }
            MediationResult::ErrorProcess
            | MediationResult::ErrorConnection
            | MediationResult::ErrorTimeout => {
                shared.collector.record_failure(duration_ms);
                warn!(
                    message_id = %pointer.id,
                    status_code = ?outcome.status_code,
                    error = ?outcome.error_message,
                    "Endpoint failure, resetting to default visibility"
                );
                let _ = callback.reset_visibility_to_default().await;
            }
        }

        shared.active_workers.fetch_sub(1, Ordering::SeqCst);
        metrics::set_pool_active_workers(
            &shared.code,
            shared.active_workers.load(Ordering::SeqCst),
        );
        metrics::set_pool_queue_size(&shared.code, shared.queue_size.load(Ordering::SeqCst));
        drop(permit);
    }

    /// Stop accepting new work. In-flight dispatches finish on their own.
    pub fn drain(&self) {
        info!(pool_code = %self.shared.code, "Draining pool");
        self.shared.running.store(false, Ordering::SeqCst);
    }

    pub fn is_fully_drained(&self) -> bool {
        self.shared.queue_size.load(Ordering::SeqCst) == 0
            && self.shared.active_workers.load(Ordering::SeqCst) == 0
    }

    pub fn code(&self) -> &str {
        &self.shared.code
    }

    pub fn max_concurrency(&self) -> u32 {
        self.shared.max_concurrency
    }

    pub fn active_workers(&self) -> u32 {
        self.shared.active_workers.load(Ordering::SeqCst)
    }

    pub fn queue_size(&self) -> u32 {
        self.shared.queue_size.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            pool_code: self.shared.code.clone(),
            max_concurrency: self.shared.max_concurrency,
            active_workers: self.active_workers(),
            queue_size: self.queue_size(),
            queue_capacity: self.shared.capacity,
            message_group_count: self.shared.groups.len() as u32,
            rate_limit: self.shared.limiter.config(),
        }
    }

    pub fn metrics_snapshot(&self) -> PoolMetricsSnapshot {
        self.shared.collector.snapshot()
    }
}
