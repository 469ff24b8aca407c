use async_trait::async_trait;
use relay_core::MessagePointer;

pub mod callback;
pub mod error;
pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "sqs")]
pub mod sqs;

pub use callback::{
    CallbackCapabilities, LeaseControl, MessageCallback, VisibilityProfile,
    MAX_VISIBILITY_SECONDS,
};
pub use error::QueueError;

pub type Result<T> = std::result::Result<T, QueueError>;

/// A parsed pointer bundled with its acknowledgment handle.
#[derive(Debug)]
pub struct BatchMessage {
    pub pointer: MessagePointer,
    pub callback: MessageCallback,
}

/// Destination for consumed batches. Implemented by the queue manager.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn route_batch(&self, batch: Vec<BatchMessage>);
}

/// Queue metrics for monitoring
#[derive(Debug, Clone, Default)]
pub struct QueueMetrics {
    /// Approximate number of messages visible in the queue (pending)
    pub pending_messages: u64,
    /// Approximate number of leased, not-yet-terminated messages
    pub in_flight_messages: u64,
    pub queue_identifier: String,
    /// Well-formed messages handed to the sink
    pub total_received: u64,
    pub total_acked: u64,
    pub total_nacked: u64,
    /// Malformed bodies terminated at the consumer (not counted as received)
    pub total_data_quality_failures: u64,
}

/// Trait for consuming messages from one logical queue.
///
/// A consumer runs its own polling loops and feeds `(pointer, callback)`
/// pairs into the shared `MessageSink`. Construction must fail if the
/// initial backend connection cannot be established; runtime connection
/// loss is survived with backoff.
#[async_trait]
pub trait QueueConsumer: Send + Sync {
    /// Opaque identifier for observability and health.
    fn queue_identifier(&self) -> &str;

    /// Begin background fetching. Idempotent: calls after the first have
    /// no additional effect.
    async fn start(&self) -> Result<()>;

    /// Cease fetching and release consumer resources. Outstanding
    /// callbacks remain valid until they terminate.
    async fn stop(&self);

    fn is_healthy(&self) -> bool;

    /// Queue-depth and counter snapshot; `None` where the backend cannot
    /// report it.
    async fn metrics(&self) -> Result<Option<QueueMetrics>> {
        Ok(None)
    }
}

/// Trait for publishing pointers to a queue (outbox sinks, dev tooling).
#[async_trait]
pub trait QueuePublisher: Send + Sync {
    fn queue_identifier(&self) -> &str;

    /// Publish a single pointer; returns the stored message id.
    async fn publish(&self, pointer: MessagePointer) -> Result<String>;

    async fn publish_batch(&self, pointers: Vec<MessagePointer>) -> Result<Vec<String>> {
        let mut ids = Vec::with_capacity(pointers.len());
        for pointer in pointers {
            ids.push(self.publish(pointer).await?);
        }
        Ok(ids)
    }
}

/// Combined consumer and publisher for embedded/dev backends.
#[async_trait]
pub trait EmbeddedQueue: QueueConsumer + QueuePublisher {
    /// Initialize backend state (tables, files, ...).
    async fn init_schema(&self) -> Result<()>;
}
