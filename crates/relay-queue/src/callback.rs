//! Per-message acknowledgment handles.
//!
//! Consumers build one `MessageCallback` per received message over the
//! backend's `LeaseControl`. The handle is single-use for terminal
//! operations (ack and the visibility-releasing variants); lease extension
//! is idempotent and refused once a terminal action has fired. Backends
//! that cannot set per-message visibility degrade the visibility variants
//! to a plain nack.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::Result;

/// Hard upper bound on any visibility value, shared by all backends.
pub const MAX_VISIBILITY_SECONDS: u32 = 43_200;

/// What a backend can actually do with a leased message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackCapabilities {
    pub can_extend: bool,
    pub can_change_visibility: bool,
    pub can_individual_ack: bool,
}

impl CallbackCapabilities {
    pub fn full() -> Self {
        Self {
            can_extend: true,
            can_change_visibility: true,
            can_individual_ack: true,
        }
    }
}

/// Backend lease operations, keyed by the opaque receipt handle.
#[async_trait]
pub trait LeaseControl: Send + Sync {
    fn queue_identifier(&self) -> &str;

    fn capabilities(&self) -> CallbackCapabilities;

    /// Permanently remove the message.
    async fn ack(&self, receipt_handle: &str) -> Result<()>;

    /// Release the message for redelivery at the backend default.
    async fn nack(&self, receipt_handle: &str) -> Result<()>;

    /// Set the remaining lease to `seconds` (caller pre-clamps).
    async fn change_visibility(&self, receipt_handle: &str, seconds: u32) -> Result<()>;
}

/// Redelivery delays applied by the visibility-releasing terminal actions.
#[derive(Debug, Clone, Copy)]
pub struct VisibilityProfile {
    /// Short delay for client-side saturation signals.
    pub fast_fail_seconds: u32,
    /// Long delay for real endpoint failures.
    pub default_delay_seconds: u32,
}

impl Default for VisibilityProfile {
    fn default() -> Self {
        Self {
            fast_fail_seconds: 10,
            default_delay_seconds: 120,
        }
    }
}

/// Terminal actions a callback can take. Exactly one takes effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TerminalAction {
    Ack,
    Nack,
    FastFail,
    ResetDefault,
    Delay(u32),
}

/// Single-use acknowledgment handle for one leased message.
pub struct MessageCallback {
    lease: Arc<dyn LeaseControl>,
    receipt_handle: String,
    visibility: VisibilityProfile,
    terminated: AtomicBool,
}

impl MessageCallback {
    pub fn new(
        lease: Arc<dyn LeaseControl>,
        receipt_handle: String,
        visibility: VisibilityProfile,
    ) -> Self {
        Self {
            lease,
            receipt_handle,
            visibility,
            terminated: AtomicBool::new(false),
        }
    }

    pub fn queue_identifier(&self) -> &str {
        self.lease.queue_identifier()
    }

    pub fn capabilities(&self) -> CallbackCapabilities {
        self.lease.capabilities()
    }

    pub fn receipt_handle(&self) -> &str {
        &self.receipt_handle
    }

    /// Whether a terminal action has already fired.
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Permanently remove the message from the queue.
    pub async fn ack(&self) -> Result<()> {
        self.terminal(TerminalAction::Ack).await
    }

    /// Release for redelivery at the backend default.
    pub async fn nack(&self) -> Result<()> {
        self.terminal(TerminalAction::Nack).await
    }

    /// Release with the short saturation delay.
    pub async fn set_fast_fail_visibility(&self) -> Result<()> {
        self.terminal(TerminalAction::FastFail).await
    }

    /// Release with the long endpoint-failure delay.
    pub async fn reset_visibility_to_default(&self) -> Result<()> {
        self.terminal(TerminalAction::ResetDefault).await
    }

    /// Release with a caller-chosen delay, clamped to the supported range.
    pub async fn set_visibility_delay(&self, seconds: u32) -> Result<()> {
        self.terminal(TerminalAction::Delay(seconds.min(MAX_VISIBILITY_SECONDS)))
            .await
    }

    /// Extend the lease while processing continues. Does not release.
    ///
    /// A no-op after a terminal action and on backends without extension
    /// support; the caller cannot assume the lease actually moved.
    pub async fn extend_visibility(&self, seconds: u32) -> Result<()> {
        if self.is_terminated() {
            debug!(
                receipt_handle = %self.receipt_handle,
                "Extension skipped - callback already terminated"
            );
            return Ok(());
        }
        if !self.lease.capabilities().can_extend {
            debug!(
                queue = %self.lease.queue_identifier(),
                "Extension skipped - backend does not support it"
            );
            return Ok(());
        }
        self.lease
            .change_visibility(&self.receipt_handle, seconds.min(MAX_VISIBILITY_SECONDS))
            .await
    }

    async fn terminal(&self, action: TerminalAction) -> Result<()> {
        if self.terminated.swap(true, Ordering::SeqCst) {
            debug!(
                receipt_handle = %self.receipt_handle,
                ?action,
                "Terminal action ignored - callback already terminated"
            );
            return Ok(());
        }
        self.dispatch(action).await
    }

    async fn dispatch(&self, action: TerminalAction) -> Result<()> {
        let caps = self.lease.capabilities();
        match action {
            TerminalAction::Ack => {
                if !caps.can_individual_ack {
                    debug!(
                        queue = %self.lease.queue_identifier(),
                        "Ack is a no-op on this backend"
                    );
                    return Ok(());
                }
                self.lease.ack(&self.receipt_handle).await
            }
            TerminalAction::Nack => self.lease.nack(&self.receipt_handle).await,
            TerminalAction::FastFail | TerminalAction::ResetDefault | TerminalAction::Delay(_)
                if !caps.can_change_visibility =>
            {
                // Degrade to an ordinary nack and rely on the backend's
                // redelivery cycle.
                self.lease.nack(&self.receipt_handle).await
            }
            TerminalAction::FastFail => {
                self.lease
                    .change_visibility(&self.receipt_handle, self.visibility.fast_fail_seconds)
                    .await
            }
            TerminalAction::ResetDefault => {
                self.lease
                    .change_visibility(&self.receipt_handle, self.visibility.default_delay_seconds)
                    .await
            }
            TerminalAction::Delay(seconds) => {
                self.lease
                    .change_visibility(&self.receipt_handle, seconds)
                    .await
            }
        }
    }
}

impl std::fmt::Debug for MessageCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageCallback")
            .field("queue", &self.lease.queue_identifier())
            .field("receipt_handle", &self.receipt_handle)
            .field("terminated", &self.is_terminated())
            .finish()
    }
}
