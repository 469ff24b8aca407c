//! Relay Message Router
//!
//! The in-process routing core:
//! - QueueManager: in-flight deduplication and routing into pools
//! - ProcessPool: bounded concurrency, token-bucket rate limiting,
//!   per-message-group FIFO
//! - HttpMediator: HTTP dispatch with response classification
//! - CircuitBreakerRegistry: per-target rolling-window breakers
//! - VisibilityExtender: lease extension for slow in-flight messages
//! - WarningService: in-memory operational warnings

pub mod breaker;
pub mod error;
pub mod lifecycle;
pub mod manager;
pub mod mediator;
pub mod metrics;
pub mod pool;
pub mod rate_limit;
pub mod warning;

pub use breaker::{BreakerState, BreakerStats, CircuitBreakerRegistry};
pub use error::RouterError;
pub use lifecycle::{
    spawn_breaker_maintenance, spawn_queue_metrics_publisher, spawn_visibility_extender,
    spawn_warning_cleanup, VisibilityExtender,
};
pub use manager::{InFlightEntry, QueueManager, TrackedCallback};
pub use mediator::{HttpMediator, HttpMediatorConfig, Mediator};
pub use metrics::{PoolMetricsCollector, PoolMetricsSnapshot};
pub use pool::ProcessPool;
pub use rate_limit::PoolRateLimiter;
pub use warning::{WarningService, WarningServiceConfig};

pub type Result<T> = std::result::Result<T, RouterError>;
