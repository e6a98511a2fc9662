//! The observability sink: what the control loop publishes every cycle.
//!
//! The sink is a narrow trait so the exporter is pluggable; the HTTP/TLS
//! Prometheus exporter is one out-of-tree implementation. Bundled here are
//! `LogSink`, which writes the records through `tracing`, and
//! `RecordingSink` for tests.

use crate::cgroup::reconciler::CgroupStat;
use crate::config::Config;
use std::fmt;
use std::sync::Mutex;
use tracing::debug;

/// Component labels for error counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Probe,
    Reconciler,
    Control,
    Config,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Component::Probe => write!(f, "probe"),
            Component::Reconciler => write!(f, "reconciler"),
            Component::Control => write!(f, "control"),
            Component::Config => write!(f, "config"),
        }
    }
}

/// Error-kind labels for error counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    SourceUnavailable,
    TransientIo,
    PermissionDenied,
    ConfigInvalid,
    ReloadIncompatible,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::SourceUnavailable => write!(f, "source_unavailable"),
            ErrorKind::TransientIo => write!(f, "transient_io"),
            ErrorKind::PermissionDenied => write!(f, "permission_denied"),
            ErrorKind::ConfigInvalid => write!(f, "config_invalid"),
            ErrorKind::ReloadIncompatible => write!(f, "reload_incompatible"),
        }
    }
}

/// Host-wide gauges.
#[derive(Debug, Clone, PartialEq)]
pub struct HostObservation {
    pub total_cores: u32,
    pub total_cpu_percent: f64,
    pub user_cpu_percent: f64,
    pub memory_used_mib: u64,
    pub load1: f64,
    pub active_users_count: usize,
    pub limited_users_count: usize,
    pub limits_active: bool,
}

/// Per-user gauges, labeled by UID and username.
#[derive(Debug, Clone, PartialEq)]
pub struct UserObservation {
    pub uid: u32,
    pub username: String,
    pub cpu_percent: f64,
    pub rss_bytes: u64,
    pub process_count: u32,
    pub limited: bool,
}

/// Monotonic counters owned by the control loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub activations: u64,
    pub deactivations: u64,
    pub cycles: u64,
}

/// Everything published once per cycle.
#[derive(Debug, Clone)]
pub struct CycleObservation {
    pub host: HostObservation,
    pub users: Vec<UserObservation>,
    pub cgroups: Vec<CgroupStat>,
    pub counters: Counters,
}

/// Where the control loop publishes each cycle's records.
pub trait ObservabilitySink: Send + Sync {
    /// Gauges and counters for one cycle, published whatever the decision.
    fn publish_cycle(&self, observation: &CycleObservation);

    /// One error occurrence, labeled by component and kind.
    fn record_error(&self, component: Component, kind: ErrorKind);

    /// Cycle and metrics-collection durations, in seconds.
    fn record_durations(&self, cycle_seconds: f64, collect_seconds: f64);

    /// A reloaded config; exporters pick up what they can apply live.
    fn reconfigure(&self, _config: &Config) {}
}

/// Sink that writes every record through `tracing` at DEBUG.
#[derive(Debug, Default)]
pub struct LogSink;

impl LogSink {
    pub fn new() -> Self {
        Self
    }
}

impl ObservabilitySink for LogSink {
    fn publish_cycle(&self, observation: &CycleObservation) {
        let host = &observation.host;
        debug!(
            "cycle {}: cpu={:.1}% user={:.1}% mem={}MiB load1={:.2} users={} limited={} active={}",
            observation.counters.cycles,
            host.total_cpu_percent,
            host.user_cpu_percent,
            host.memory_used_mib,
            host.load1,
            host.active_users_count,
            host.limited_users_count,
            host.limits_active as u8,
        );
        for user in &observation.users {
            debug!(
                "user {} ({}): cpu={:.1}% rss={} procs={} limited={}",
                user.uid,
                user.username,
                user.cpu_percent,
                user.rss_bytes,
                user.process_count,
                user.limited as u8,
            );
        }
        for cgroup in &observation.cgroups {
            let (quota_us, period_us) = cgroup
                .quota
                .map(|q| q.pair())
                .unwrap_or((None, 0));
            debug!(
                "cgroup {:?}: quota={:?} period={} memory={:?}",
                cgroup.path, quota_us, period_us, cgroup.memory_current_bytes,
            );
        }
    }

    fn record_error(&self, component: Component, kind: ErrorKind) {
        debug!("error counted: component={} kind={}", component, kind);
    }

    fn record_durations(&self, cycle_seconds: f64, collect_seconds: f64) {
        debug!(
            "durations: cycle={:.3}s collect={:.3}s",
            cycle_seconds, collect_seconds
        );
    }
}

/// In-memory sink for tests.
#[derive(Debug, Default)]
pub struct RecordingSink {
    cycles: Mutex<Vec<CycleObservation>>,
    errors: Mutex<Vec<(Component, ErrorKind)>>,
    durations: Mutex<Vec<(f64, f64)>>,
    reloads: Mutex<u64>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All cycle observations published so far.
    pub fn cycles(&self) -> Vec<CycleObservation> {
        self.cycles.lock().unwrap().clone()
    }

    /// The most recent cycle observation.
    pub fn last_cycle(&self) -> Option<CycleObservation> {
        self.cycles.lock().unwrap().last().cloned()
    }

    pub fn errors(&self) -> Vec<(Component, ErrorKind)> {
        self.errors.lock().unwrap().clone()
    }

    pub fn durations(&self) -> Vec<(f64, f64)> {
        self.durations.lock().unwrap().clone()
    }

    pub fn reload_count(&self) -> u64 {
        *self.reloads.lock().unwrap()
    }
}

impl ObservabilitySink for RecordingSink {
    fn publish_cycle(&self, observation: &CycleObservation) {
        self.cycles.lock().unwrap().push(observation.clone());
    }

    fn record_error(&self, component: Component, kind: ErrorKind) {
        self.errors.lock().unwrap().push((component, kind));
    }

    fn record_durations(&self, cycle_seconds: f64, collect_seconds: f64) {
        self.durations
            .lock()
            .unwrap()
            .push((cycle_seconds, collect_seconds));
    }

    fn reconfigure(&self, _config: &Config) {
        *self.reloads.lock().unwrap() += 1;
    }
}

// Sinks are shared by the controller, the reloader and the exporter.
impl<S: ObservabilitySink + ?Sized> ObservabilitySink for std::sync::Arc<S> {
    fn publish_cycle(&self, observation: &CycleObservation) {
        (**self).publish_cycle(observation);
    }

    fn record_error(&self, component: Component, kind: ErrorKind) {
        (**self).record_error(component, kind);
    }

    fn record_durations(&self, cycle_seconds: f64, collect_seconds: f64) {
        (**self).record_durations(cycle_seconds, collect_seconds);
    }

    fn reconfigure(&self, config: &Config) {
        (**self).reconfigure(config);
    }
}

impl<S: ObservabilitySink + ?Sized> ObservabilitySink for &S {
    fn publish_cycle(&self, observation: &CycleObservation) {
        (**self).publish_cycle(observation);
    }

    fn record_error(&self, component: Component, kind: ErrorKind) {
        (**self).record_error(component, kind);
    }

    fn record_durations(&self, cycle_seconds: f64, collect_seconds: f64) {
        (**self).record_durations(cycle_seconds, collect_seconds);
    }

    fn reconfigure(&self, config: &Config) {
        (**self).reconfigure(config);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_sink_accumulates() {
        let sink = RecordingSink::new();
        sink.record_error(Component::Probe, ErrorKind::SourceUnavailable);
        sink.record_durations(0.5, 0.1);

        assert_eq!(
            sink.errors(),
            vec![(Component::Probe, ErrorKind::SourceUnavailable)]
        );
        assert_eq!(sink.durations(), vec![(0.5, 0.1)]);
        assert!(sink.cycles().is_empty());
    }

    #[test]
    fn labels_are_stable() {
        assert_eq!(Component::Reconciler.to_string(), "reconciler");
        assert_eq!(ErrorKind::PermissionDenied.to_string(), "permission_denied");
        assert_eq!(
            ErrorKind::ReloadIncompatible.to_string(),
            "reload_incompatible"
        );
    }
}
