//! The control loop: probe, decide, reconcile, publish.
//!
//! A single controller task drives one cycle per poll interval (plus an
//! immediate cycle at startup) and selects on the event channel in
//! between, so reloads and shutdown are always handled on cycle
//! boundaries. The controller is the only writer of the enforcement
//! state; every mutation happens inside `run_cycle`.

use crate::cgroup::reconciler::{CgroupReconciler, ReconcileError, Report};
use crate::collector::probe::MetricsProbe;
use crate::config::Config;
use crate::control::reload::{ReloadOutcome, Reloader};
use crate::control::state_machine::StateMachine;
use crate::control::ControlEvent;
use crate::fs::FileSystem;
use crate::model::{Action, Decision, EnforcementState, SystemMetrics};
use crate::observe::{
    Component, Counters, CycleObservation, ErrorKind, HostObservation, ObservabilitySink,
    UserObservation,
};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Drives the periodic control cycle and owns the enforcement state.
pub struct Controller<F: FileSystem + Clone + 'static, S: ObservabilitySink> {
    config: Config,
    probe: MetricsProbe<F>,
    reconciler: CgroupReconciler<F>,
    machine: StateMachine,
    sink: S,
    reloader: Reloader,
    state: EnforcementState,
    counters: Counters,
    events: Receiver<ControlEvent>,
    running: Arc<AtomicBool>,
    /// Invoked with the new config after a successful reload; the daemon
    /// hooks its log-level handle in here.
    reload_hook: Option<Box<dyn Fn(&Config) + Send>>,
    last_decision: Option<Decision>,
}

impl<F: FileSystem + Clone + 'static, S: ObservabilitySink> Controller<F, S> {
    /// Wires the controller up from its collaborators.
    pub fn new(
        config: Config,
        reloader: Reloader,
        probe: MetricsProbe<F>,
        reconciler: CgroupReconciler<F>,
        sink: S,
        events: Receiver<ControlEvent>,
        running: Arc<AtomicBool>,
    ) -> Self {
        let machine = StateMachine::new(&config);
        Self {
            config,
            probe,
            reconciler,
            machine,
            sink,
            reloader,
            state: EnforcementState::new(),
            counters: Counters::default(),
            events,
            running,
            reload_hook: None,
            last_decision: None,
        }
    }

    /// Registers a callback run after each successfully applied reload.
    pub fn with_reload_hook(mut self, hook: impl Fn(&Config) + Send + 'static) -> Self {
        self.reload_hook = Some(Box::new(hook));
        self
    }

    /// Current enforcement state.
    pub fn state(&self) -> &EnforcementState {
        &self.state
    }

    /// The decision of the most recent cycle.
    pub fn last_decision(&self) -> Option<&Decision> {
        self.last_decision.as_ref()
    }

    /// Rediscovers state left by a previous run from the tracking file.
    pub fn startup_recovery(&mut self) -> io::Result<()> {
        let recovered = self.reconciler.recover()?;
        if recovered.is_empty() {
            return Ok(());
        }
        info!(
            "recovered {} tracked users from the tracking file, resuming enforcement",
            recovered.len()
        );
        self.state.limits_active = true;
        self.state.activated_at = Some(Instant::now());
        self.state.shared_cgroup_path = Some(self.reconciler.limited_path());
        self.state.tracked_users = recovered.into_iter().collect();
        Ok(())
    }

    /// Runs cycles until shutdown, then deactivates best-effort.
    pub fn run(&mut self) {
        if let Err(e) = self.startup_recovery() {
            warn!("tracking file recovery failed: {}", e);
        }

        // Immediate cycle before the first tick.
        self.run_cycle();

        let mut next_cycle =
            Instant::now() + Duration::from_secs(self.config.poll_interval_s);
        while self.running.load(Ordering::SeqCst) {
            let timeout = next_cycle.saturating_duration_since(Instant::now());
            match self.events.recv_timeout(timeout) {
                Ok(ControlEvent::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Ok(ControlEvent::Reload) => {
                    self.handle_reload();
                }
                Err(RecvTimeoutError::Timeout) => {
                    self.run_cycle();
                    next_cycle =
                        Instant::now() + Duration::from_secs(self.config.poll_interval_s);
                }
            }
        }

        self.shutdown();
    }

    /// One control cycle: probe, publish, decide, reconcile.
    pub fn run_cycle(&mut self) {
        let cycle_start = Instant::now();
        self.counters.cycles += 1;

        let collect_start = Instant::now();
        let metrics = match self.probe.sample() {
            Ok(metrics) => metrics,
            Err(e) => {
                error!("skipping cycle, cannot sample metrics: {}", e);
                self.sink
                    .record_error(Component::Probe, ErrorKind::SourceUnavailable);
                self.sink.record_durations(
                    cycle_start.elapsed().as_secs_f64(),
                    collect_start.elapsed().as_secs_f64(),
                );
                return;
            }
        };
        let collect_seconds = collect_start.elapsed().as_secs_f64();

        // Published before the decision, so the records always reflect the
        // state the decision was made against.
        self.publish(&metrics);

        let decision = self.machine.decide(&metrics, &self.state);
        info!("{}: {}", decision.action, decision.rationale);

        match decision.action {
            Action::Activate => {
                let report = self.reconciler.activate(&metrics);
                self.record_report(&report);
                if !report.created_users.is_empty() {
                    info!(
                        "confined users {:?} under {:?}",
                        report.created_users,
                        self.reconciler.limited_path()
                    );
                }
                if !self.state.limits_active {
                    self.state.limits_active = true;
                    self.state.activated_at = Some(Instant::now());
                    self.counters.activations += 1;
                }
                self.state.shared_cgroup_path = Some(self.reconciler.limited_path());
                self.drop_vanished(&metrics);
                self.sync_tracked();
            }
            Action::Deactivate => {
                let report = self.reconciler.deactivate();
                self.record_report(&report);
                self.counters.deactivations += 1;
                self.state.limits_active = false;
                self.state.activated_at = None;
                self.state.shared_cgroup_path = None;
                self.state.tracked_users.clear();
                info!("released users {:?}", report.removed_users);
            }
            Action::Maintain => {
                if self.state.limits_active {
                    self.drop_vanished(&metrics);
                    self.sync_tracked();
                    // Pick up processes started since the last placement.
                    self.reconciler.sweep_stragglers();
                }
            }
        }
        self.last_decision = Some(decision);

        let cycle_seconds = cycle_start.elapsed();
        self.sink
            .record_durations(cycle_seconds.as_secs_f64(), collect_seconds);
        let interval = Duration::from_secs(self.config.poll_interval_s);
        if cycle_seconds > interval / 2 {
            warn!(
                "cycle took {:.1}s, more than half the {}s poll interval",
                cycle_seconds.as_secs_f64(),
                self.config.poll_interval_s
            );
        }
    }

    /// Applies a pending configuration reload between cycles.
    pub fn handle_reload(&mut self) {
        let outcome = self.reloader.apply(
            &mut self.config,
            &mut self.probe,
            &mut self.machine,
            &mut self.reconciler,
            &self.sink,
        );
        if outcome == ReloadOutcome::Applied
            && let Some(hook) = &self.reload_hook
        {
            hook(&self.config);
        }
    }

    /// Final deactivation and state reset. Best effort.
    pub fn shutdown(&mut self) {
        info!("shutting down, releasing limits");
        let report = self.reconciler.deactivate();
        if let Some(e) = &report.first_error {
            warn!("best-effort deactivation left residue: {}", e);
        }
        if let Err(e) = self.reconciler.clear_tracking() {
            warn!("cannot truncate tracking file: {}", e);
        }
        self.state = EnforcementState::new();
        self.reconciler.shutdown();
        info!("shutdown complete");
    }

    /// Releases tracked users that no longer have processes.
    fn drop_vanished(&mut self, metrics: &SystemMetrics) {
        let gone: Vec<u32> = self
            .state
            .tracked_users
            .keys()
            .copied()
            .filter(|uid| !metrics.is_active(*uid))
            .collect();
        if gone.is_empty() {
            return;
        }
        info!("untracking users with no remaining processes: {:?}", gone);
        let report = self.reconciler.drop_users(&gone);
        self.record_report(&report);
    }

    /// Mirrors the reconciler's tracked map into the enforcement state.
    fn sync_tracked(&mut self) {
        let tracked = self.reconciler.tracked_handle();
        self.state.tracked_users = tracked.read().unwrap().clone();
    }

    fn record_report(&self, report: &Report) {
        if let Some(e) = &report.first_error {
            let kind = match e {
                ReconcileError::Io { source, .. }
                    if source.kind() == io::ErrorKind::PermissionDenied =>
                {
                    ErrorKind::PermissionDenied
                }
                _ => ErrorKind::TransientIo,
            };
            self.sink.record_error(Component::Reconciler, kind);
        }
    }

    fn publish(&self, metrics: &SystemMetrics) {
        let mut users: Vec<UserObservation> = metrics
            .per_user
            .iter()
            .map(|(uid, sample)| UserObservation {
                uid: *uid,
                username: sample.username.clone(),
                cpu_percent: sample.cpu_percent,
                rss_bytes: sample.rss_bytes,
                process_count: sample.process_count,
                limited: self.state.tracked_users.contains_key(uid),
            })
            .collect();
        users.sort_unstable_by_key(|u| u.uid);

        let cgroups = if self.state.limits_active {
            self.reconciler.cgroup_stats()
        } else {
            Vec::new()
        };

        let observation = CycleObservation {
            host: HostObservation {
                total_cores: metrics.total_cores,
                total_cpu_percent: metrics.total_cpu_percent,
                user_cpu_percent: metrics.user_cpu_percent,
                memory_used_mib: metrics.memory_used_mib,
                load1: metrics.load1,
                active_users_count: metrics.active_users.len(),
                limited_users_count: self.state.tracked_users.len(),
                limits_active: self.state.limits_active,
            },
            users,
            cgroups,
            counters: self.counters,
        };
        self.sink.publish_cycle(&observation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroup::reconciler::CgroupSettings;
    use crate::fs::MockFs;
    use crate::observe::RecordingSink;
    use std::path::{Path, PathBuf};
    use std::sync::mpsc;

    const PASSWD: &str =
        "root:x:0:0:root:/root:/bin/bash\nalice:x:1001:1001::/home/alice:/bin/bash\nbob:x:1002:1002::/home/bob:/bin/bash\n";

    fn test_config() -> Config {
        Config {
            activate_pct: 75.0,
            release_pct: 40.0,
            min_active_time_s: 60,
            min_system_cores: 1,
            ignore_system_load: true,
            metrics_cache_ttl_s: 0,
            tracking_file: PathBuf::from("/var/lib/cpu-manager/created"),
            ..Config::default()
        }
    }

    fn host_fs() -> MockFs {
        let fs = MockFs::new();
        fs.add_file("/etc/passwd", PASSWD);
        fs.add_host_files("/proc", 4, 0.5, "cpu  100 0 0 400 0 0 0 0 0 0");
        fs.add_cgroup_root("/sys/fs/cgroup");
        fs
    }

    /// A process whose tick counter jumps by a huge delta between the
    /// first and second scan, pinning its CPU percent at the clamp.
    fn add_busy_process(fs: &MockFs, pid: u32, uid: u32) {
        fs.add_process("/proc", pid, uid, "stress", 0, 0, 2048);
        fs.add_file_sequence(
            format!("/proc/{}/stat", pid),
            [
                format!(
                    "{pid} (stress) R 1 {pid} {pid} 0 -1 4194304 0 0 0 0 0 0 0 0 20 0 1 0 1 1 1 1 0 0 0 0 0 0 0 0 0 0 0 0 17 0 0 0 0 0"
                ),
                format!(
                    "{pid} (stress) R 1 {pid} {pid} 0 -1 4194304 0 0 0 0 100000000 0 0 0 20 0 1 0 1 1 1 1 0 0 0 0 0 0 0 0 0 0 0 0 17 0 0 0 0 0"
                ),
            ],
        );
    }

    fn controller(
        fs: &MockFs,
        config: Config,
    ) -> (
        Controller<MockFs, Arc<RecordingSink>>,
        Arc<RecordingSink>,
        mpsc::Sender<ControlEvent>,
    ) {
        let running = Arc::new(AtomicBool::new(true));
        let probe = MetricsProbe::new(fs.clone(), "/proc", config.uid_min, config.uid_max)
            .with_delta_window(Duration::ZERO)
            .with_cache_ttl(Duration::from_secs(config.metrics_cache_ttl_s));
        let settings = CgroupSettings {
            cgroup_root: config.cgroup_root.clone(),
            base_name: config.base_cgroup_name.clone(),
            proc_path: "/proc".to_string(),
            normal_quota: config.normal_cpu_quota,
            min_system_cores: config.min_system_cores,
            tracking_file: config.tracking_file.clone(),
        };
        let reconciler = CgroupReconciler::new(fs.clone(), settings, Arc::clone(&running))
            .with_settle_delay(Duration::ZERO);
        reconciler.prepare().unwrap();
        let sink = Arc::new(RecordingSink::new());
        let (tx, rx) = mpsc::channel();
        let reloader = Reloader::new(PathBuf::from("/nonexistent.conf"), "/proc");
        let controller = Controller::new(
            config,
            reloader,
            probe,
            reconciler,
            Arc::clone(&sink),
            rx,
            running,
        );
        (controller, sink, tx)
    }

    #[test]
    fn activation_creates_shared_subtree() {
        let fs = host_fs();
        add_busy_process(&fs, 100, 1001);
        add_busy_process(&fs, 200, 1002);

        let (mut controller, sink, _tx) = controller(&fs, test_config());

        // First cycle has no CPU baseline: below threshold, MAINTAIN.
        controller.run_cycle();
        assert!(!controller.state().limits_active);
        assert_eq!(
            controller.last_decision().unwrap().action,
            Action::Maintain
        );

        // Second cycle sees the tick delta and confines both users.
        controller.run_cycle();
        controller.reconciler.wait_for_placements();

        assert!(controller.state().limits_active);
        assert_eq!(controller.counters.activations, 1);
        assert_eq!(
            controller.state().shared_cgroup_path,
            Some(PathBuf::from("/sys/fs/cgroup/cpu_manager/limited"))
        );
        let mut tracked: Vec<u32> =
            controller.state().tracked_users.keys().copied().collect();
        tracked.sort_unstable();
        assert_eq!(tracked, vec![1001, 1002]);

        assert_eq!(
            fs.read_to_string(Path::new(
                "/sys/fs/cgroup/cpu_manager/limited/cpu.max"
            ))
            .unwrap(),
            "300000 100000"
        );
        assert_eq!(
            fs.read_to_string(Path::new(
                "/sys/fs/cgroup/cpu_manager/limited/user_1001/cpu.weight"
            ))
            .unwrap(),
            "100"
        );

        // Both cycles published; the second was still published against
        // the pre-activation state.
        let cycles = sink.cycles();
        assert_eq!(cycles.len(), 2);
        assert!(!cycles[1].host.limits_active);
        assert_eq!(cycles[1].host.active_users_count, 2);

        // A third cycle publishes the active state.
        controller.run_cycle();
        let last = sink.last_cycle().unwrap();
        assert!(last.host.limits_active);
        assert_eq!(last.host.limited_users_count, 2);
        assert_eq!(last.users.len(), 2);
        assert!(last.users.iter().all(|u| u.limited));
        assert!(!last.cgroups.is_empty());
    }

    #[test]
    fn hysteresis_below_threshold_makes_no_cgroup_mutations() {
        let fs = host_fs();
        fs.add_process("/proc", 100, 1001, "idle", 0, 0, 100);

        let (mut controller, _sink, _tx) = controller(&fs, test_config());
        let writes_before = fs.write_log().len();

        controller.run_cycle();
        controller.run_cycle();

        assert!(!controller.state().limits_active);
        assert_eq!(fs.write_log().len(), writes_before);
        assert!(!fs.exists(Path::new("/sys/fs/cgroup/cpu_manager/limited")));
    }

    #[test]
    fn release_blocked_until_min_active_time() {
        let fs = host_fs();
        add_busy_process(&fs, 100, 1001);

        let (mut controller, _sink, _tx) = controller(&fs, test_config());
        controller.run_cycle();
        controller.run_cycle();
        assert!(controller.state().limits_active);

        // CPU has fallen back to zero (tick sequence plateaued), but the
        // activation is only seconds old.
        controller.run_cycle();
        assert!(controller.state().limits_active);
        let decision = controller.last_decision().unwrap();
        assert_eq!(decision.action, Action::Maintain);
        assert!(decision.rationale.contains("60s"));
    }

    #[test]
    fn release_tears_the_subtree_down() {
        let fs = host_fs();
        add_busy_process(&fs, 100, 1001);

        let (mut controller, _sink, _tx) = controller(&fs, test_config());
        controller.run_cycle();
        controller.run_cycle();
        controller.reconciler.wait_for_placements();
        assert!(controller.state().limits_active);

        // Age the activation past the minimum active time.
        controller.state.activated_at =
            Some(Instant::now() - Duration::from_secs(120));

        controller.run_cycle();
        assert_eq!(
            controller.last_decision().unwrap().action,
            Action::Deactivate
        );
        assert!(!controller.state().limits_active);
        assert!(controller.state().tracked_users.is_empty());
        assert_eq!(controller.state().shared_cgroup_path, None);
        assert!(!fs.exists(Path::new("/sys/fs/cgroup/cpu_manager/limited")));
        assert_eq!(controller.counters.deactivations, 1);
    }

    #[test]
    fn maintain_drops_users_that_vanished() {
        let fs = host_fs();
        add_busy_process(&fs, 100, 1001);
        add_busy_process(&fs, 200, 1002);

        let (mut controller, _sink, _tx) = controller(&fs, test_config());
        controller.run_cycle();
        controller.run_cycle();
        controller.reconciler.wait_for_placements();
        assert_eq!(controller.state().tracked_users.len(), 2);

        // Bob's last process exits.
        fs.remove_file("/proc/200/status");
        fs.remove_file("/proc/200/stat");

        controller.run_cycle();
        assert_eq!(
            controller.last_decision().unwrap().action,
            Action::Maintain
        );
        let tracked: Vec<u32> = controller.state().tracked_users.keys().copied().collect();
        assert_eq!(tracked, vec![1001]);
        assert!(!fs.exists(Path::new(
            "/sys/fs/cgroup/cpu_manager/limited/user_1002"
        )));
        assert!(fs.exists(Path::new(
            "/sys/fs/cgroup/cpu_manager/limited/user_1001"
        )));
    }

    #[test]
    fn maintain_sweeps_new_processes_into_the_subtree() {
        let fs = host_fs();
        add_busy_process(&fs, 100, 1001);

        let (mut controller, _sink, _tx) = controller(&fs, test_config());
        controller.run_cycle();
        controller.run_cycle();
        controller.reconciler.wait_for_placements();
        assert!(controller.state().limits_active);

        // Alice starts another process while limits are active.
        fs.add_process("/proc", 150, 1001, "stress2", 0, 0, 100);
        controller.run_cycle();
        controller.reconciler.wait_for_placements();

        let procs = fs
            .read_to_string(Path::new(
                "/sys/fs/cgroup/cpu_manager/limited/user_1001/cgroup.procs",
            ))
            .unwrap();
        assert!(procs.lines().any(|l| l == "150"));
    }

    #[test]
    fn probe_failure_skips_the_cycle() {
        let fs = MockFs::new();
        fs.add_file("/etc/passwd", PASSWD);
        fs.add_cgroup_root("/sys/fs/cgroup");

        let (mut controller, sink, _tx) = controller(&fs, test_config());
        controller.run_cycle();

        assert_eq!(controller.counters.cycles, 1);
        assert!(sink.cycles().is_empty());
        assert_eq!(
            sink.errors(),
            vec![(Component::Probe, ErrorKind::SourceUnavailable)]
        );
        assert!(controller.last_decision().is_none());
        // Durations are still recorded for the skipped cycle.
        assert_eq!(sink.durations().len(), 1);
    }

    #[test]
    fn shutdown_deactivates_and_truncates_tracking() {
        let fs = host_fs();
        add_busy_process(&fs, 100, 1001);

        let (mut controller, _sink, _tx) = controller(&fs, test_config());
        controller.run_cycle();
        controller.run_cycle();
        controller.reconciler.wait_for_placements();
        assert!(controller.state().limits_active);

        controller.shutdown();

        assert!(!controller.state().limits_active);
        assert!(!fs.exists(Path::new("/sys/fs/cgroup/cpu_manager/limited")));
        assert_eq!(
            fs.read_to_string(Path::new("/var/lib/cpu-manager/created"))
                .unwrap(),
            ""
        );
    }

    #[test]
    fn startup_recovery_resumes_tracking() {
        let fs = host_fs();
        fs.add_dir("/sys/fs/cgroup/cpu_manager/limited/user_1002");
        fs.add_file(
            "/var/lib/cpu-manager/created",
            "1001:/sys/fs/cgroup/cpu_manager/limited/user_1001\n1002:/sys/fs/cgroup/cpu_manager/limited/user_1002\n",
        );

        let (mut controller, _sink, _tx) = controller(&fs, test_config());
        controller.startup_recovery().unwrap();

        assert!(controller.state().limits_active);
        let tracked: Vec<u32> = controller.state().tracked_users.keys().copied().collect();
        assert_eq!(tracked, vec![1002]);
        // The stale entry is gone from the rewritten file.
        let content = fs
            .read_to_string(Path::new("/var/lib/cpu-manager/created"))
            .unwrap();
        assert_eq!(
            content,
            "1002:/sys/fs/cgroup/cpu_manager/limited/user_1002\n"
        );
    }

    #[test]
    fn reload_applies_between_cycles() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("cpu-manager.conf");
        std::fs::write(&config_path, "CPU_THRESHOLD=90\nIGNORE_SYSTEM_LOAD=true\n").unwrap();

        let fs = host_fs();
        let (mut controller, sink, _tx) = controller(&fs, test_config());
        controller.reloader = Reloader::new(config_path.clone(), "/proc");

        let hook_count = Arc::new(AtomicBool::new(false));
        let hook_seen = Arc::clone(&hook_count);
        controller.reload_hook = Some(Box::new(move |config: &Config| {
            assert_eq!(config.activate_pct, 50.0);
            hook_seen.store(true, Ordering::SeqCst);
        }));

        std::fs::write(
            &config_path,
            "CPU_THRESHOLD=50\nCPU_RELEASE_THRESHOLD=20\nIGNORE_SYSTEM_LOAD=true\n",
        )
        .unwrap();
        controller.handle_reload();

        assert_eq!(controller.config.activate_pct, 50.0);
        assert!(hook_count.load(Ordering::SeqCst));
        assert_eq!(sink.reload_count(), 1);
    }
}
