//! Warning Service - in-memory warning storage.
//!
//! The core components emit warnings here instead of owning any persistence
//! or alerting; the store keeps a bounded window of recent warnings with
//! acknowledgment and age-based cleanup.

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, info};

use relay_core::{Warning, WarningCategory, WarningSeverity};

#[derive(Debug, Clone)]
pub struct WarningServiceConfig {
    /// Warnings older than this are dropped by `cleanup`.
    pub max_warning_age_hours: i64,
    /// Hard cap on stored warnings; oldest are evicted beyond it.
    pub max_warnings: usize,
    /// Warnings older than this are auto-acknowledged by `cleanup`.
    pub auto_acknowledge_hours: i64,
}

impl Default for WarningServiceConfig {
    fn default() -> Self {
        Self {
            max_warning_age_hours: 24,
            max_warnings: 1000,
            auto_acknowledge_hours: 8,
        }
    }
}

pub struct WarningService {
    warnings: RwLock<HashMap<String, Warning>>,
    config: WarningServiceConfig,
}

impl WarningService {
    pub fn new(config: WarningServiceConfig) -> Self {
        Self {
            warnings: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn add_warning(
        &self,
        category: WarningCategory,
        severity: WarningSeverity,
        message: String,
        source: String,
    ) -> String {
        let warning = Warning::new(category, severity, message, source);
        let id = warning.id.clone();

        let mut warnings = self.warnings.write();
        if warnings.len() >= self.config.max_warnings {
            Self::evict_oldest(&mut warnings);
        }

        debug!(id = %id, ?category, ?severity, "Added warning");
        warnings.insert(id.clone(), warning);
        id
    }

    pub fn get_all_warnings(&self) -> Vec<Warning> {
        self.warnings.read().values().cloned().collect()
    }

    pub fn get_warnings_by_category(&self, category: WarningCategory) -> Vec<Warning> {
        self.warnings
            .read()
            .values()
            .filter(|w| w.category == category)
            .cloned()
            .collect()
    }

    pub fn get_warnings_by_severity(&self, severity: WarningSeverity) -> Vec<Warning> {
        self.warnings
            .read()
            .values()
            .filter(|w| w.severity == severity)
            .cloned()
            .collect()
    }

    pub fn acknowledge_warning(&self, id: &str) -> bool {
        let mut warnings = self.warnings.write();
        if let Some(warning) = warnings.get_mut(id) {
            warning.acknowledged = true;
            warning.acknowledged_at = Some(Utc::now());
            true
        } else {
            false
        }
    }

    pub fn warning_count(&self) -> usize {
        self.warnings.read().len()
    }

    pub fn unacknowledged_count(&self) -> usize {
        self.warnings
            .read()
            .values()
            .filter(|w| !w.acknowledged)
            .count()
    }

    pub fn has_critical_warnings(&self) -> bool {
        self.warnings
            .read()
            .values()
            .any(|w| w.severity == WarningSeverity::Critical && !w.acknowledged)
    }

    /// Periodic maintenance: auto-acknowledge stale warnings, drop old ones.
    pub fn cleanup(&self) {
        let auto_ack_minutes = self.config.auto_acknowledge_hours * 60;
        let max_age_minutes = self.config.max_warning_age_hours * 60;

        let mut warnings = self.warnings.write();
        let now = Utc::now();
        for warning in warnings.values_mut() {
            if !warning.acknowledged && warning.age_minutes() > auto_ack_minutes {
                warning.acknowledged = true;
                warning.acknowledged_at = Some(now);
            }
        }

        let before = warnings.len();
        warnings.retain(|_, w| w.age_minutes() <= max_age_minutes);
        let removed = before - warnings.len();
        if removed > 0 {
            info!(removed, "Cleared old warnings");
        }
    }

    fn evict_oldest(warnings: &mut HashMap<String, Warning>) {
        let to_remove = (warnings.len() / 10).max(1);
        let mut sorted: Vec<_> = warnings
            .iter()
            .map(|(id, w)| (id.clone(), w.created_at))
            .collect();
        sorted.sort_by_key(|(_, created)| *created);
        for (id, _) in sorted.into_iter().take(to_remove) {
            warnings.remove(&id);
        }
    }
}

impl Default for WarningService {
    fn default() -> Self {
        Self::new(WarningServiceConfig::default())
    }
}
