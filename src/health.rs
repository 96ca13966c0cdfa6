//! Health monitoring for the gateway core
//!
//! Turns scheduler and traffic counters into per-component health checks
//! with degradation thresholds. The overall status is the worst component
//! status.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::scheduler::SchedulerStats;

/// Health of one component, or of the whole gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// Working, but past a warning threshold
    Degraded,
    Unhealthy,
    /// Nothing checked yet
    #[default]
    Unknown,
}

impl HealthStatus {
    /// Healthy or degraded
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Healthy => 0,
            Self::Degraded => 1,
            Self::Unknown => 2,
            Self::Unhealthy => 3,
        }
    }
}

/// Result of checking one component
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub component: String,
    pub status: HealthStatus,
    /// ms since epoch
    pub checked_at: u64,
    pub message: String,
}

impl HealthCheck {
    fn new(component: impl Into<String>, status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status,
            checked_at: 0,
            message: message.into(),
        }
    }

    /// Passing check
    pub fn healthy(component: impl Into<String>) -> Self {
        Self::new(component, HealthStatus::Healthy, "OK")
    }

    /// Failing check
    pub fn unhealthy(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(component, HealthStatus::Unhealthy, message)
    }

    /// Check past a warning threshold
    pub fn degraded(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(component, HealthStatus::Degraded, message)
    }

    /// Stamp the check time
    pub fn at(mut self, now_ms: u64) -> Self {
        self.checked_at = now_ms;
        self
    }
}

/// Grading thresholds, all ratios in 0.0 - 1.0
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Slot id space usage before degraded
    pub degraded_utilization: f64,
    /// Slot id space usage before unhealthy
    pub unhealthy_utilization: f64,
    /// Failed/processed before degraded
    pub degraded_error_rate: f64,
    /// Failed/processed before unhealthy
    pub unhealthy_error_rate: f64,
    /// Late/total activations before degraded
    pub degraded_missed_rate: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            degraded_utilization: 0.8,
            unhealthy_utilization: 1.0,
            degraded_error_rate: 0.05,
            unhealthy_error_rate: 0.25,
            degraded_missed_rate: 0.1,
        }
    }
}

/// Latest check of every component
#[derive(Debug, Default)]
pub struct HealthMonitor {
    thresholds: HealthConfig,
    checks: BTreeMap<String, HealthCheck>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(thresholds: HealthConfig) -> Self {
        Self {
            thresholds,
            checks: BTreeMap::new(),
        }
    }

    /// Record a check, replacing the previous one of its component
    pub fn add_check(&mut self, check: HealthCheck) {
        self.checks.insert(check.component.clone(), check);
    }

    /// Grade the scheduler: running state, slot usage and late activations
    pub fn check_scheduler(&mut self, running: bool, stats: &SchedulerStats, now_ms: u64) {
        let limits = &self.thresholds;
        let missed_rate = if stats.slots_activated == 0 {
            0.0
        } else {
            stats.missed_slots as f64 / stats.slots_activated as f64
        };

        let check = if !running {
            HealthCheck::unhealthy("scheduler", "not running")
        } else if stats.utilization >= limits.unhealthy_utilization {
            HealthCheck::unhealthy(
                "scheduler",
                format!("all {} slots assigned", stats.total_slots),
            )
        } else if stats.utilization >= limits.degraded_utilization {
            HealthCheck::degraded(
                "scheduler",
                format!("slot utilization {:.0}%", stats.utilization * 100.0),
            )
        } else if missed_rate >= limits.degraded_missed_rate {
            HealthCheck::degraded(
                "scheduler",
                format!(
                    "{} of {} activations late",
                    stats.missed_slots, stats.slots_activated
                ),
            )
        } else {
            HealthCheck::healthy("scheduler")
        };
        self.add_check(check.at(now_ms));
    }

    /// Grade a component by its failed/processed ratio
    pub fn check_error_rate(&mut self, component: &str, errors: u64, total: u64, now_ms: u64) {
        let rate = if total == 0 {
            0.0
        } else {
            errors as f64 / total as f64
        };
        let message = format!("error rate {:.1}%", rate * 100.0);
        let check = if rate >= self.thresholds.unhealthy_error_rate {
            HealthCheck::unhealthy(component, message)
        } else if rate >= self.thresholds.degraded_error_rate {
            HealthCheck::degraded(component, message)
        } else {
            HealthCheck::healthy(component)
        };
        self.add_check(check.at(now_ms));
    }

    /// Worst component status; unknown before the first check
    pub fn status(&self) -> HealthStatus {
        self.checks
            .values()
            .map(|check| check.status)
            .max_by_key(|status| status.rank())
            .unwrap_or(HealthStatus::Unknown)
    }

    /// Checks ordered by component name
    pub fn checks(&self) -> impl Iterator<Item = &HealthCheck> {
        self.checks.values()
    }

    /// Latest check of one component
    pub fn check(&self, component: &str) -> Option<&HealthCheck> {
        self.checks.get(component)
    }

    pub fn is_operational(&self) -> bool {
        self.status().is_ok()
    }
}

impl fmt::Display for HealthMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "overall: {:?}", self.status())?;
        for check in self.checks.values() {
            writeln!(f, "  {:<12} {:?} - {}", check.component, check.status, check.message)?;
        }
        Ok(())
    }
}
