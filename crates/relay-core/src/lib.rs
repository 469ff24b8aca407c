use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod logging;

// ============================================================================
// Core Message Types
// ============================================================================

/// The unit of work that flows through the router.
///
/// A pointer carries routing metadata and a target URL, never the domain
/// payload. Endpoints fetch the payload themselves using `id`, which keeps
/// queue messages tiny and routes large payloads through authenticated
/// channels only. Field names are camelCase on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePointer {
    pub id: String,
    pub pool_code: String,
    pub auth_token: String,
    pub mediation_type: MediationType,
    pub mediation_target: String,
    #[serde(default)]
    pub message_group_id: Option<String>,
    #[serde(default)]
    pub target_client_id: Option<String>,
}

impl MessagePointer {
    /// Validate the required-field and target-URL invariants.
    ///
    /// Consumers treat a validation failure as a data-quality failure:
    /// the raw message is acked and never redelivered.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.id.is_empty() {
            return Err("id is empty".to_string());
        }
        if self.pool_code.is_empty() {
            return Err("poolCode is empty".to_string());
        }
        if self.auth_token.is_empty() {
            return Err("authToken is empty".to_string());
        }
        if !is_absolute_http_url(&self.mediation_target) {
            return Err(format!(
                "mediationTarget is not an absolute http(s) URL: {}",
                self.mediation_target
            ));
        }
        Ok(())
    }

    /// Truncated token for log output. The full token is never logged.
    pub fn auth_token_preview(&self) -> &str {
        let end = self
            .auth_token
            .char_indices()
            .nth(20)
            .map(|(i, _)| i)
            .unwrap_or(self.auth_token.len());
        &self.auth_token[..end]
    }
}

fn is_absolute_http_url(target: &str) -> bool {
    let rest = if let Some(r) = target.strip_prefix("https://") {
        r
    } else if let Some(r) = target.strip_prefix("http://") {
        r
    } else {
        return false;
    };
    // Require a non-empty host component.
    !rest.is_empty() && !rest.starts_with('/')
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MediationType {
    Http,
}

// ============================================================================
// Mediation Outcome Types
// ============================================================================

/// Result of one dispatch attempt.
///
/// The split matters for two consumers: the pool worker maps each variant to
/// a terminal callback action, and the circuit breaker counts only the
/// endpoint-failure variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediationResult {
    /// Delivered and acknowledged by the endpoint.
    Success,
    /// Delivered; endpoint requested a backoff hint (metrics only).
    SuccessWithDelay(u32),
    /// Endpoint returned 429 - short redelivery delay, not a failure.
    NackRateLimit,
    /// Pool saturated before dispatch - short redelivery delay.
    NackPoolFull,
    /// Circuit breaker denied the call - short redelivery delay.
    NackCircuitOpen,
    /// Endpoint failure (5xx, 401/403, ack=false) - default visibility.
    ErrorProcess,
    /// Connection-level failure - default visibility.
    ErrorConnection,
    /// Request timed out - default visibility.
    ErrorTimeout,
    /// Data-quality failure (non-429 4xx) - ack and drop, retrying cannot help.
    ErrorPayload,
}

impl MediationResult {
    /// Whether this outcome counts against the target's circuit breaker.
    pub fn is_endpoint_failure(&self) -> bool {
        matches!(
            self,
            MediationResult::ErrorProcess
                | MediationResult::ErrorConnection
                | MediationResult::ErrorTimeout
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediationResult::Success => "success",
            MediationResult::SuccessWithDelay(_) => "success_with_delay",
            MediationResult::NackRateLimit => "nack_rate_limit",
            MediationResult::NackPoolFull => "nack_pool_full",
            MediationResult::NackCircuitOpen => "nack_circuit_open",
            MediationResult::ErrorProcess => "error_process",
            MediationResult::ErrorConnection => "error_connection",
            MediationResult::ErrorTimeout => "error_timeout",
            MediationResult::ErrorPayload => "error_payload",
        }
    }
}

/// Outcome of mediation with classification context.
#[derive(Debug, Clone)]
pub struct MediationOutcome {
    pub result: MediationResult,
    pub status_code: Option<u16>,
    pub retry_after: Option<u32>,
    pub error_message: Option<String>,
}

impl MediationOutcome {
    pub fn success(status_code: u16) -> Self {
        Self {
            result: MediationResult::Success,
            status_code: Some(status_code),
            retry_after: None,
            error_message: None,
        }
    }

    pub fn success_with_delay(status_code: u16, delay_seconds: u32) -> Self {
        Self {
            result: MediationResult::SuccessWithDelay(delay_seconds),
            status_code: Some(status_code),
            retry_after: None,
            error_message: None,
        }
    }

    pub fn rate_limited(retry_after: Option<u32>) -> Self {
        Self {
            result: MediationResult::NackRateLimit,
            status_code: Some(429),
            retry_after,
            error_message: None,
        }
    }

    pub fn circuit_open(target: &str) -> Self {
        Self {
            result: MediationResult::NackCircuitOpen,
            status_code: None,
            retry_after: None,
            error_message: Some(format!("circuit open for {}", target)),
        }
    }

    pub fn error_process(status_code: Option<u16>, message: String) -> Self {
        Self {
            result: MediationResult::ErrorProcess,
            status_code,
            retry_after: None,
            error_message: Some(message),
        }
    }

    pub fn error_connection(message: String) -> Self {
        Self {
            result: MediationResult::ErrorConnection,
            status_code: None,
            retry_after: None,
            error_message: Some(message),
        }
    }

    pub fn error_timeout(message: String) -> Self {
        Self {
            result: MediationResult::ErrorTimeout,
            status_code: None,
            retry_after: None,
            error_message: Some(message),
        }
    }

    pub fn error_payload(status_code: u16, message: String) -> Self {
        Self {
            result: MediationResult::ErrorPayload,
            status_code: Some(status_code),
            retry_after: None,
            error_message: Some(message),
        }
    }
}

/// Response body contract for target endpoints.
///
/// Parsing is permissive: a 2xx with any other body shape is treated as an
/// ack so that legacy endpoints keep working.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MediationResponse {
    #[serde(default = "default_ack")]
    pub ack: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub visibility_delay: Option<u32>,
}

fn default_ack() -> bool {
    true
}

// ============================================================================
// Configuration Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub code: String,
    pub max_concurrency: u32,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
}

/// Token bucket parameters: refill rate in requests/second, optional burst
/// capacity (defaults to the per-second rate).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub per_second: u32,
    #[serde(default)]
    pub burst: Option<u32>,
}

impl RateLimitConfig {
    pub fn burst_capacity(&self) -> u32 {
        self.burst.unwrap_or(self.per_second).max(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub name: String,
    /// Backend kind: "memory", "sqlite", or "sqs".
    pub kind: String,
    /// Backend-specific connection info (file path, queue URL, ...).
    pub uri: String,
    /// Parallel polling connections sharing one callback factory.
    pub connections: u32,
    pub metrics_poll_interval_seconds: u64,
    pub receive_timeout_ms: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: "memory".to_string(),
            uri: String::new(),
            connections: 1,
            metrics_poll_interval_seconds: 30,
            receive_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RouterConfig {
    pub pools: Vec<PoolConfig>,
    pub queues: Vec<QueueSettings>,
}

/// Rolling-window circuit breaker parameters, uniform per registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    /// Rolling window size, in calls.
    pub window_size: u32,
    /// Failure-rate threshold, percent of the window.
    pub failure_rate_percent: u32,
    /// Minimum calls in the window before the rate is evaluated.
    pub minimum_calls: u32,
    /// How long an open breaker rejects before probing.
    pub open_duration_seconds: u64,
    /// Consecutive successful probes required to close from half-open.
    pub half_open_permitted_calls: u32,
    /// Breakers with no calls for this long are evicted from the registry.
    pub idle_ttl_seconds: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            window_size: 100,
            failure_rate_percent: 50,
            minimum_calls: 10,
            open_duration_seconds: 30,
            half_open_permitted_calls: 5,
            idle_ttl_seconds: 3_600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediatorSettings {
    /// Per-request timeout. Generous default to tolerate long synchronous
    /// back-ends; operators typically set much lower.
    pub timeout_ms: u64,
    /// Redelivery delay for endpoint failures.
    pub default_visibility_delay_seconds: u32,
    /// Redelivery delay for client-side saturation signals.
    pub fast_fail_visibility_seconds: u32,
}

impl Default for MediatorSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 900_000,
            default_visibility_delay_seconds: 120,
            fast_fail_visibility_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleSettings {
    /// Extender wake interval. The lease granted on each extension is twice
    /// this, so a message is always extended before its lease lapses.
    pub visibility_extension_interval_seconds: u64,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            visibility_extension_interval_seconds: 55,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StandbySettings {
    pub enabled: bool,
    pub redis_url: String,
    pub lock_key: String,
    pub instance_id: String,
    pub lock_ttl_seconds: u64,
}

impl Default for StandbySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            lock_key: "relay:leader".to_string(),
            instance_id: uuid::Uuid::new_v4().to_string(),
            lock_ttl_seconds: 30,
        }
    }
}

// ============================================================================
// Warning System Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WarningCategory {
    /// Message routing issues (unknown pool, intake rejection)
    Routing,
    /// Message processing failures
    Processing,
    /// Configuration errors
    Configuration,
    /// Rate limiting triggered
    RateLimiting,
    /// Pool capacity issues
    PoolCapacity,
    /// Circuit breaker state transitions
    CircuitBreaker,
    /// Queue connectivity issues
    QueueConnectivity,
    /// Malformed messages and endpoint payload rejections
    DataQuality,
    /// Memory/resource issues
    Resource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum WarningSeverity {
    Info,
    Warn,
    Error,
    Critical,
}

/// An operational warning surfaced by a core component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Warning {
    pub id: String,
    pub category: WarningCategory,
    pub severity: WarningSeverity,
    pub message: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub acknowledged: bool,
    pub acknowledged_at: Option<DateTime<Utc>>,
}

impl Warning {
    pub fn new(
        category: WarningCategory,
        severity: WarningSeverity,
        message: String,
        source: String,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            category,
            severity,
            message,
            source,
            created_at: Utc::now(),
            acknowledged: false,
            acknowledged_at: None,
        }
    }

    pub fn age_minutes(&self) -> i64 {
        (Utc::now() - self.created_at).num_minutes()
    }
}

// ============================================================================
// Pool Statistics
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStats {
    pub pool_code: String,
    pub max_concurrency: u32,
    pub active_workers: u32,
    pub queue_size: u32,
    pub queue_capacity: u32,
    pub message_group_count: u32,
    pub rate_limit: Option<RateLimitConfig>,
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Pool error: {0}")]
    Pool(String),

    #[error("Mediation error: {0}")]
    Mediation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Redis error: {0}")]
    Redis(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Shutdown in progress")]
    ShutdownInProgress,
}

pub type Result<T> = std::result::Result<T, RelayError>;
