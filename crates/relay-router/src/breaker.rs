//! Per-target circuit breakers.
//!
//! One breaker per mediation target URL, created lazily on first call and
//! evicted after an idle TTL. The trip condition is a failure rate over a
//! count-based rolling window, evaluated only once a minimum number of
//! calls has been observed. Only endpoint failures count: 429s, payload
//! drops, and client-side saturation never move a breaker.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use relay_core::{BreakerSettings, WarningCategory, WarningSeverity};

use crate::warning::WarningService;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerStats {
    pub target: String,
    pub state: BreakerState,
    #[serde(rename = "successfulCalls")]
    pub successful_calls: u64,
    #[serde(rename = "failedCalls")]
    pub failed_calls: u64,
    #[serde(rename = "rejectedCalls")]
    pub rejected_calls: u64,
    #[serde(rename = "windowFailureRate")]
    pub window_failure_rate: f64,
    #[serde(rename = "windowCalls")]
    pub window_calls: u32,
}

struct BreakerInner {
    state: BreakerState,
    /// Rolling outcome window; `true` = success.
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    half_open_successes: u32,
    half_open_probes_in_flight: u32,
    last_activity: Instant,
    successful_calls: u64,
    failed_calls: u64,
    rejected_calls: u64,
}

struct TargetBreaker {
    target: String,
    settings: BreakerSettings,
    inner: Mutex<BreakerInner>,
}

enum Transition {
    Opened,
    HalfOpened,
    Closed,
}

impl TargetBreaker {
    fn new(target: String, settings: BreakerSettings) -> Self {
        Self {
            target,
            settings,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                window: VecDeque::new(),
                opened_at: None,
                half_open_successes: 0,
                half_open_probes_in_flight: 0,
                last_activity: Instant::now(),
                successful_calls: 0,
                failed_calls: 0,
                rejected_calls: 0,
            }),
        }
    }

    /// Consume a permit for one call. In half-open, at most
    /// `half_open_permitted_calls` probes may be outstanding at once.
    fn try_permit(&self) -> (bool, Option<Transition>) {
        let mut inner = self.inner.lock();
        inner.last_activity = Instant::now();

        match inner.state {
            BreakerState::Closed => (true, None),
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= Duration::from_secs(self.settings.open_duration_seconds) {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_successes = 0;
                    inner.half_open_probes_in_flight = 1;
                    (true, Some(Transition::HalfOpened))
                } else {
                    inner.rejected_calls += 1;
                    (false, None)
                }
            }
            BreakerState::HalfOpen => {
                if inner.half_open_probes_in_flight < self.settings.half_open_permitted_calls {
                    inner.half_open_probes_in_flight += 1;
                    (true, None)
                } else {
                    inner.rejected_calls += 1;
                    (false, None)
                }
            }
        }
    }

    /// Non-consuming peek used by the mediator as a pre-call gate.
    fn is_call_blocked(&self) -> bool {
        let inner = self.inner.lock();
        match inner.state {
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                elapsed < Duration::from_secs(self.settings.open_duration_seconds)
            }
            _ => false,
        }
    }

    fn record_success(&self) -> Option<Transition> {
        let mut inner = self.inner.lock();
        inner.last_activity = Instant::now();
        inner.successful_calls += 1;

        match inner.state {
            BreakerState::Closed => {
                Self::push_outcome(&mut inner.window, true, self.settings.window_size);
                None
            }
            BreakerState::HalfOpen => {
                inner.half_open_probes_in_flight =
                    inner.half_open_probes_in_flight.saturating_sub(1);
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.settings.half_open_permitted_calls {
                    inner.state = BreakerState::Closed;
                    inner.window.clear();
                    inner.opened_at = None;
                    Some(Transition::Closed)
                } else {
                    None
                }
            }
            BreakerState::Open => None,
        }
    }

    fn record_failure(&self) -> Option<Transition> {
        let mut inner = self.inner.lock();
        inner.last_activity = Instant::now();
        inner.failed_calls += 1;

        match inner.state {
            BreakerState::Closed => {
                Self::push_outcome(&mut inner.window, false, self.settings.window_size);
                let calls = inner.window.len() as u32;
                if calls >= self.settings.minimum_calls
                    && Self::failure_rate_percent(&inner.window) as u32
                        >= self.settings.failure_rate_percent
                {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    inner.window.clear();
                    Some(Transition::Opened)
                } else {
                    None
                }
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.half_open_probes_in_flight = 0;
                inner.half_open_successes = 0;
                Some(Transition::Opened)
            }
            BreakerState::Open => None,
        }
    }

    /// Release a permit without recording an outcome. Used for 429 and
    /// other excluded classifications so backpressure cannot oscillate the
    /// breaker.
    fn record_disregarded(&self) {
        let mut inner = self.inner.lock();
        inner.last_activity = Instant::now();
        if inner.state == BreakerState::HalfOpen {
            inner.half_open_probes_in_flight =
                inner.half_open_probes_in_flight.saturating_sub(1);
        }
    }

    fn push_outcome(window: &mut VecDeque<bool>, success: bool, window_size: u32) {
        if window.len() >= window_size as usize {
            window.pop_front();
        }
        window.push_back(success);
    }

    fn failure_rate_percent(window: &VecDeque<bool>) -> f64 {
        if window.is_empty() {
            return 0.0;
        }
        let failures = window.iter().filter(|&&success| !success).count();
        failures as f64 * 100.0 / window.len() as f64
    }

    fn stats(&self) -> BreakerStats {
        let inner = self.inner.lock();
        BreakerStats {
            target: self.target.clone(),
            state: inner.state,
            successful_calls: inner.successful_calls,
            failed_calls: inner.failed_calls,
            rejected_calls: inner.rejected_calls,
            window_failure_rate: Self::failure_rate_percent(&inner.window) / 100.0,
            window_calls: inner.window.len() as u32,
        }
    }

    fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    fn idle_for(&self) -> Duration {
        self.inner.lock().last_activity.elapsed()
    }
}

/// Registry of per-target breakers with uniform settings.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<TargetBreaker>>,
    settings: BreakerSettings,
    warnings: Option<Arc<WarningService>>,
}

impl CircuitBreakerRegistry {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            breakers: DashMap::new(),
            settings,
            warnings: None,
        }
    }

    pub fn with_warning_service(mut self, warnings: Arc<WarningService>) -> Self {
        self.warnings = Some(warnings);
        self
    }

    fn get_or_create(&self, target: &str) -> Arc<TargetBreaker> {
        self.breakers
            .entry(target.to_string())
            .or_insert_with(|| {
                Arc::new(TargetBreaker::new(target.to_string(), self.settings.clone()))
            })
            .clone()
    }

    /// Consume a permit for a call against `target`.
    pub fn try_permit(&self, target: &str) -> bool {
        let breaker = self.get_or_create(target);
        let (permitted, transition) = breaker.try_permit();
        if let Some(t) = transition {
            self.report_transition(target, t);
        }
        permitted
    }

    /// Whether the mediator must fail fast without issuing a request.
    pub fn is_call_blocked(&self, target: &str) -> bool {
        match self.breakers.get(target) {
            Some(breaker) => breaker.is_call_blocked(),
            None => false,
        }
    }

    pub fn record_success(&self, target: &str) {
        let breaker = self.get_or_create(target);
        if let Some(t) = breaker.record_success() {
            self.report_transition(target, t);
        }
    }

    pub fn record_failure(&self, target: &str) {
        let breaker = self.get_or_create(target);
        if let Some(t) = breaker.record_failure() {
            self.report_transition(target, t);
        }
    }

    pub fn record_disregarded(&self, target: &str) {
        self.get_or_create(target).record_disregarded();
    }

    pub fn state(&self, target: &str) -> Option<BreakerState> {
        self.breakers.get(target).map(|b| b.state())
    }

    pub fn stats(&self, target: &str) -> Option<BreakerStats> {
        self.breakers.get(target).map(|b| b.stats())
    }

    pub fn all_stats(&self) -> Vec<BreakerStats> {
        self.breakers.iter().map(|e| e.value().stats()).collect()
    }

    pub fn open_count(&self) -> usize {
        self.breakers
            .iter()
            .filter(|e| e.value().state() == BreakerState::Open)
            .count()
    }

    /// Drop breakers with no calls within the idle TTL. Called
    /// periodically so the registry cannot grow without bound.
    pub fn evict_idle(&self) -> usize {
        let ttl = Duration::from_secs(self.settings.idle_ttl_seconds);
        let before = self.breakers.len();
        self.breakers.retain(|_, breaker| breaker.idle_for() < ttl);
        let evicted = before - self.breakers.len();
        if evicted > 0 {
            debug!(evicted, "Evicted idle circuit breakers");
        }
        evicted
    }

    fn report_transition(&self, target: &str, transition: Transition) {
        let (severity, label) = match transition {
            Transition::Closed => (WarningSeverity::Info, "closed"),
            Transition::HalfOpened => (WarningSeverity::Warn, "half-open"),
            Transition::Opened => (WarningSeverity::Error, "open"),
        };

        match severity {
            WarningSeverity::Info => info!(target, state = label, "Circuit breaker transition"),
            _ => warn!(target, state = label, "Circuit breaker transition"),
        }

        if let Some(ref warnings) = self.warnings {
            warnings.add_warning(
                WarningCategory::CircuitBreaker,
                severity,
                format!("Circuit breaker for [{}] is now {}", target, label),
                "CircuitBreakerRegistry".to_string(),
            );
        }
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerSettings::default())
    }
}
