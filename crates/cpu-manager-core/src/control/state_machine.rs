//! The hysteretic activate/release controller.
//!
//! Activation and release use separate thresholds, and release is further
//! floored by a minimum active time, so the daemon never flaps around a
//! single boundary. The emitted rationale names the thresholds compared
//! and the observed values; it is logged every cycle.

use crate::config::Config;
use crate::model::{Action, Decision, EnforcementState, SystemMetrics};
use std::time::Instant;

/// Decides activate/maintain/deactivate from a snapshot and the current
/// enforcement state.
pub struct StateMachine {
    activate_pct: f64,
    release_pct: f64,
    min_active_time_s: u64,
    min_system_cores: u32,
    ignore_system_load: bool,
}

impl StateMachine {
    /// Creates a state machine from the config thresholds.
    pub fn new(config: &Config) -> Self {
        Self {
            activate_pct: config.activate_pct,
            release_pct: config.release_pct,
            min_active_time_s: config.min_active_time_s,
            min_system_cores: config.min_system_cores,
            ignore_system_load: config.ignore_system_load,
        }
    }

    /// Applies reloaded thresholds; takes effect from the next decision.
    pub fn reconfigure(&mut self, config: &Config) {
        *self = Self::new(config);
    }

    /// Decides for the current instant.
    pub fn decide(&self, metrics: &SystemMetrics, state: &EnforcementState) -> Decision {
        self.decide_at(Instant::now(), metrics, state)
    }

    /// Decides with an explicit clock, for deterministic tests.
    pub fn decide_at(
        &self,
        now: Instant,
        metrics: &SystemMetrics,
        state: &EnforcementState,
    ) -> Decision {
        if state.limits_active {
            self.decide_active(now, metrics, state)
        } else {
            self.decide_inactive(metrics)
        }
    }

    fn decide_active(
        &self,
        now: Instant,
        metrics: &SystemMetrics,
        state: &EnforcementState,
    ) -> Decision {
        let active_for = state.active_seconds(now);
        if active_for < self.min_active_time_s {
            return Decision {
                action: Action::Maintain,
                rationale: format!(
                    "limits active for {}s, below the {}s minimum active time",
                    active_for, self.min_active_time_s
                ),
            };
        }

        let below_release = metrics.user_cpu_percent < self.release_pct;
        if !below_release {
            return Decision {
                action: Action::Maintain,
                rationale: format!(
                    "user CPU {:.1}% still at or above release threshold {:.0}%",
                    metrics.user_cpu_percent, self.release_pct
                ),
            };
        }

        if !self.ignore_system_load && metrics.under_load {
            return Decision {
                action: Action::Maintain,
                rationale: format!(
                    "user CPU {:.1}% below release threshold {:.0}%, but load {:.2} keeps the host under load",
                    metrics.user_cpu_percent, self.release_pct, metrics.load1
                ),
            };
        }

        Decision {
            action: Action::Deactivate,
            rationale: format!(
                "user CPU {:.1}% below release threshold {:.0}% after {}s active",
                metrics.user_cpu_percent, self.release_pct, active_for
            ),
        }
    }

    fn decide_inactive(&self, metrics: &SystemMetrics) -> Decision {
        if metrics.user_cpu_percent < self.activate_pct {
            return Decision {
                action: Action::Maintain,
                rationale: format!(
                    "user CPU {:.1}% below threshold {:.0}%",
                    metrics.user_cpu_percent, self.activate_pct
                ),
            };
        }

        if metrics.total_cores <= self.min_system_cores {
            return Decision {
                action: Action::Maintain,
                rationale: format!(
                    "user CPU {:.1}% at or above threshold {:.0}%, but {} cores cannot spare {} for the system",
                    metrics.user_cpu_percent,
                    self.activate_pct,
                    metrics.total_cores,
                    self.min_system_cores
                ),
            };
        }

        if !self.ignore_system_load && metrics.under_load {
            return Decision {
                action: Action::Maintain,
                rationale: format!(
                    "user CPU {:.1}% at or above threshold {:.0}%, but load {:.2} keeps the host under load",
                    metrics.user_cpu_percent, self.activate_pct, metrics.load1
                ),
            };
        }

        Decision {
            action: Action::Activate,
            rationale: format!(
                "user CPU {:.1}% at or above threshold {:.0}%",
                metrics.user_cpu_percent, self.activate_pct
            ),
        }
    }
}
