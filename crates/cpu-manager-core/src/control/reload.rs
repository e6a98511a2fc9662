//! Applies a reloaded configuration atomically across components.
//!
//! Reload events arrive between cycles, from the debounced file watcher
//! or from SIGHUP. The new file is parsed and validated first; failure
//! keeps the old config untouched. Fields a live reload cannot honor are
//! reported and deferred until restart. The in-memory config is swapped
//! only after every component accepted its slice.

use crate::cgroup::reconciler::CgroupReconciler;
use crate::collector::probe::MetricsProbe;
use crate::config::Config;
use crate::control::state_machine::StateMachine;
use crate::fs::FileSystem;
use crate::observe::{Component, ErrorKind, ObservabilitySink};
use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// What one reload attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// The new config is in effect (restart-required fields excepted).
    Applied,
    /// File stat matched the last applied state; nothing to do.
    Unchanged,
    /// The new config failed to parse or validate; old config kept.
    Rejected,
}

/// Serializes config reloads against the control loop.
pub struct Reloader {
    config_path: PathBuf,
    proc_path: String,
    /// (mtime, size) of the last applied config file.
    last_stat: Option<(SystemTime, u64)>,
}

impl Reloader {
    /// Creates a reloader; records the stat of the initially loaded file
    /// so an untouched file does not trigger a spurious reload.
    pub fn new(config_path: PathBuf, proc_path: impl Into<String>) -> Self {
        let last_stat = stat(&config_path);
        Self {
            config_path,
            proc_path: proc_path.into(),
            last_stat,
        }
    }

    /// Handles one reload event.
    pub fn apply<F, S>(
        &mut self,
        current: &mut Config,
        probe: &mut MetricsProbe<F>,
        machine: &mut StateMachine,
        reconciler: &mut CgroupReconciler<F>,
        sink: &S,
    ) -> ReloadOutcome
    where
        F: FileSystem + Clone + 'static,
        S: ObservabilitySink,
    {
        let current_stat = stat(&self.config_path);
        if current_stat.is_some() && current_stat == self.last_stat {
            debug!("config file unchanged (mtime and size match), skipping reload");
            return ReloadOutcome::Unchanged;
        }

        let mut new = match Config::load(&self.config_path) {
            Ok(config) => config,
            Err(e) => {
                warn!("reload rejected, keeping previous config: {}", e);
                sink.record_error(Component::Config, ErrorKind::ConfigInvalid);
                return ReloadOutcome::Rejected;
            }
        };

        for field in current.restart_required_diffs(&new) {
            warn!("{} changed; restart required, keeping previous value", field);
            sink.record_error(Component::Config, ErrorKind::ReloadIncompatible);
        }
        revert_restart_required(&mut new, current);

        probe.reconfigure(
            new.uid_min,
            new.uid_max,
            Duration::from_secs(new.metrics_cache_ttl_s),
        );
        machine.reconfigure(&new);
        reconciler.reconfigure(new.cgroup_settings(&self.proc_path));
        sink.reconfigure(&new);

        info!(
            "configuration reloaded: threshold={:.0}% release={:.0}% interval={}s",
            new.activate_pct, new.release_pct, new.poll_interval_s
        );
        *current = new;
        self.last_stat = current_stat;
        ReloadOutcome::Applied
    }
}

/// Carries the old values of fields that only a restart can change.
fn revert_restart_required(new: &mut Config, current: &Config) {
    new.metrics_listen_addr = current.metrics_listen_addr.clone();
    new.metrics_tls_cert = current.metrics_tls_cert.clone();
    new.metrics_tls_key = current.metrics_tls_key.clone();
    new.metrics_auth_token = current.metrics_auth_token.clone();
    new.log_file = current.log_file.clone();
}

fn stat(path: &std::path::Path) -> Option<(SystemTime, u64)> {
    let meta = std::fs::metadata(path).ok()?;
    Some((meta.modified().ok()?, meta.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroup::reconciler::CgroupReconciler;
    use crate::fs::MockFs;
    use crate::model::{Action, EnforcementState, SystemMetrics};
    use crate::observe::RecordingSink;
    use std::collections::{BTreeSet, HashMap};
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    fn components(
        config: &Config,
    ) -> (
        MetricsProbe<MockFs>,
        StateMachine,
        CgroupReconciler<MockFs>,
    ) {
        let fs = MockFs::new();
        fs.add_cgroup_root("/sys/fs/cgroup");
        let probe = MetricsProbe::new(fs.clone(), "/proc", config.uid_min, config.uid_max);
        let machine = StateMachine::new(config);
        let reconciler = CgroupReconciler::new(
            fs,
            config.cgroup_settings("/proc"),
            Arc::new(AtomicBool::new(true)),
        );
        (probe, machine, reconciler)
    }

    fn metrics(user_cpu_percent: f64) -> SystemMetrics {
        SystemMetrics {
            timestamp: 0,
            total_cores: 4,
            total_cpu_percent: user_cpu_percent,
            user_cpu_percent,
            memory_used_mib: 0,
            load1: 0.0,
            under_load: false,
            active_users: BTreeSet::new(),
            per_user: HashMap::new(),
        }
    }

    fn write_config(path: &std::path::Path, content: &str) {
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn applies_new_thresholds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cpu-manager.conf");
        write_config(&path, "CPU_THRESHOLD=90\nIGNORE_SYSTEM_LOAD=true\n");

        let mut config = Config::load(&path).unwrap();
        let (mut probe, mut machine, mut reconciler) = components(&config);
        let mut reloader = Reloader::new(path.clone(), "/proc");
        let sink = RecordingSink::new();

        // 60% does not clear the original 90% threshold.
        let decision = machine.decide(&metrics(60.0), &EnforcementState::new());
        assert_eq!(decision.action, Action::Maintain);

        write_config(
            &path,
            "CPU_THRESHOLD=50\nCPU_RELEASE_THRESHOLD=20\nIGNORE_SYSTEM_LOAD=true\n",
        );
        let outcome = reloader.apply(&mut config, &mut probe, &mut machine, &mut reconciler, &sink);
        assert_eq!(outcome, ReloadOutcome::Applied);
        assert_eq!(config.activate_pct, 50.0);

        let decision = machine.decide(&metrics(60.0), &EnforcementState::new());
        assert_eq!(decision.action, Action::Activate);
        assert!(decision.rationale.contains("50%"));
        assert_eq!(sink.reload_count(), 1);
    }

    #[test]
    fn unchanged_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cpu-manager.conf");
        write_config(&path, "CPU_THRESHOLD=90\n");

        let mut config = Config::load(&path).unwrap();
        let (mut probe, mut machine, mut reconciler) = components(&config);
        let mut reloader = Reloader::new(path, "/proc");
        let sink = RecordingSink::new();

        let outcome = reloader.apply(&mut config, &mut probe, &mut machine, &mut reconciler, &sink);
        assert_eq!(outcome, ReloadOutcome::Unchanged);
        assert_eq!(sink.reload_count(), 0);
    }

    #[test]
    fn invalid_config_keeps_the_old_one() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cpu-manager.conf");
        write_config(&path, "CPU_THRESHOLD=90\n");

        let mut config = Config::load(&path).unwrap();
        let (mut probe, mut machine, mut reconciler) = components(&config);
        let mut reloader = Reloader::new(path.clone(), "/proc");
        let sink = RecordingSink::new();

        write_config(&path, "CPU_THRESHOLD=90\nCPU_RELEASE_THRESHOLD=95\n");
        let outcome = reloader.apply(&mut config, &mut probe, &mut machine, &mut reconciler, &sink);
        assert_eq!(outcome, ReloadOutcome::Rejected);
        assert_eq!(config.activate_pct, 90.0);
        assert_eq!(
            sink.errors(),
            vec![(Component::Config, ErrorKind::ConfigInvalid)]
        );

        // A later valid rewrite goes through.
        write_config(&path, "CPU_THRESHOLD=70\nMIN_ACTIVE_TIME=60\n");
        let outcome = reloader.apply(&mut config, &mut probe, &mut machine, &mut reconciler, &sink);
        assert_eq!(outcome, ReloadOutcome::Applied);
        assert_eq!(config.activate_pct, 70.0);
    }

    #[test]
    fn listener_change_is_deferred_with_warning() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cpu-manager.conf");
        write_config(&path, "CPU_THRESHOLD=90\n");

        let mut config = Config::load(&path).unwrap();
        let (mut probe, mut machine, mut reconciler) = components(&config);
        let mut reloader = Reloader::new(path.clone(), "/proc");
        let sink = RecordingSink::new();

        write_config(
            &path,
            "CPU_THRESHOLD=80\nMETRICS_LISTEN_ADDR=0.0.0.0:9200\n",
        );
        let outcome = reloader.apply(&mut config, &mut probe, &mut machine, &mut reconciler, &sink);
        assert_eq!(outcome, ReloadOutcome::Applied);

        // The live field applied; the listener change did not.
        assert_eq!(config.activate_pct, 80.0);
        assert_eq!(config.metrics_listen_addr, None);
        assert!(
            sink.errors()
                .contains(&(Component::Config, ErrorKind::ReloadIncompatible))
        );
    }
}
