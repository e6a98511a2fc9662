//! Core data model shared by the probe, state machine and reconciler.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::time::Instant;

/// Fraction of total cores above which `load1` marks the host as loaded.
pub const LOAD_FACTOR: f64 = 0.7;

/// Per-user sample within a [`SystemMetrics`] snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct UserSample {
    /// CPU usage of all the user's processes, percent of one core.
    pub cpu_percent: f64,
    /// Resident set size summed over the user's processes, bytes.
    pub rss_bytes: u64,
    /// Number of processes whose real UID matches.
    pub process_count: u32,
    /// Username from the passwd database, or the numeric UID as text.
    pub username: String,
}

/// One immutable per-cycle snapshot of host and per-user CPU state.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemMetrics {
    /// Seconds since the Unix epoch when the sample was taken.
    pub timestamp: i64,
    /// Online core count, stable for the life of the process.
    pub total_cores: u32,
    /// Host CPU usage, 0..100 * total_cores.
    pub total_cpu_percent: f64,
    /// Sum of per-user CPU percent over non-system UIDs.
    pub user_cpu_percent: f64,
    /// Used memory in MiB (total minus available).
    pub memory_used_mib: u64,
    /// 1-minute load average.
    pub load1: f64,
    /// Whether `load1` exceeds `LOAD_FACTOR * total_cores`.
    pub under_load: bool,
    /// Non-system UIDs with at least one running process, ascending.
    pub active_users: BTreeSet<u32>,
    /// Per-UID samples, only for UIDs inside the configured range.
    pub per_user: HashMap<u32, UserSample>,
}

impl SystemMetrics {
    /// Returns true when `uid` had at least one process in this snapshot.
    pub fn is_active(&self, uid: u32) -> bool {
        self.active_users.contains(&uid)
    }
}

/// Process-wide enforcement state, mutated only by the control loop.
#[derive(Debug, Clone, Default)]
pub struct EnforcementState {
    /// Whether the shared subtree currently caps user CPU.
    pub limits_active: bool,
    /// When `limits_active` last became true.
    pub activated_at: Option<Instant>,
    /// UID -> cgroup directory of every user this daemon placed.
    pub tracked_users: HashMap<u32, PathBuf>,
    /// Path of the shared subtree while limits are active.
    pub shared_cgroup_path: Option<PathBuf>,
}

impl EnforcementState {
    /// Creates a fresh state with no limits active.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seconds the limits have been active, or 0 when inactive.
    pub fn active_seconds(&self, now: Instant) -> u64 {
        match self.activated_at {
            Some(at) => now.saturating_duration_since(at).as_secs(),
            None => 0,
        }
    }
}

/// What the state machine asked the reconciler to do this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Create or extend the shared subtree and start tracking users.
    Activate,
    /// Tear the shared subtree down and release every tracked user.
    Deactivate,
    /// Keep the current state; only drop users that disappeared.
    Maintain,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Activate => write!(f, "ACTIVATE"),
            Action::Deactivate => write!(f, "DEACTIVATE"),
            Action::Maintain => write!(f, "MAINTAIN"),
        }
    }
}

/// A decision plus the human-readable reasoning behind it.
///
/// The rationale names the thresholds compared and the observed values; it
/// is logged every cycle and operators grep for it, so its wording is part
/// of the contract.
#[derive(Debug, Clone)]
pub struct Decision {
    pub action: Action,
    pub rationale: String,
}
