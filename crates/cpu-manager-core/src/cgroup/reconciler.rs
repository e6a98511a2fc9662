//! The cgroup-v2 reconciler.
//!
//! Materializes enforcement decisions onto the kernel under
//! `<cgroup_root>/<base>`:
//!
//! ```text
//! <cgroup_root>/<base>/
//!    cgroup.subtree_control      +cpu +cpuset
//!    limited/                    shared subtree, absolute cpu.max cap
//!        cpu.max
//!        cgroup.subtree_control  +cpu
//!        user_<UID>/             one per tracked UID
//!            cpu.weight          100
//!            cgroup.procs
//! ```
//!
//! Per-UID failures never abort a reconciliation; the first error is
//! recorded and returned after every UID has been attempted. Process
//! placement for a newly tracked user runs in a short-lived background
//! thread whose handle is retained, so shutdown (and tests) can join it.

use crate::cgroup::quota::Quota;
use crate::cgroup::tracking::TrackingFile;
use crate::collector::procfs::parser::parse_proc_status;
use crate::fs::FileSystem;
use crate::model::SystemMetrics;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default weight for every user cgroup; idle users yield bandwidth to
/// busy peers through proportional scheduling, not hard caps.
const CPU_WEIGHT: u32 = 100;

/// cgroup-v2 bandwidth period in microseconds.
const PERIOD_US: u64 = 100_000;

/// Delay before a single retry of a refused cgroup write or removal.
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Delay before a background placement starts, letting the cgroup settle.
const SETTLE_DELAY: Duration = Duration::from_millis(400);

/// Fatal startup error: the cgroup-v2 facility this daemon needs is not
/// available.
#[derive(Debug, thiserror::Error)]
#[error("cgroup v2 setup unavailable at {path}: {reason}")]
pub struct SetupError {
    pub path: PathBuf,
    pub reason: String,
}

/// A per-UID reconciliation failure.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("cgroup I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ReconcileError {
    fn io(path: &Path, source: io::Error) -> Self {
        ReconcileError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// What one `activate`/`deactivate`/`drop_users` call changed.
#[derive(Debug, Default)]
pub struct Report {
    /// UIDs whose cgroup was created this call.
    pub created_users: Vec<u32>,
    /// UIDs whose cgroup was removed this call.
    pub removed_users: Vec<u32>,
    /// The shared quota written, when the shared subtree was touched.
    pub shared_quota: Option<Quota>,
    /// First per-UID error; later errors are logged only.
    pub first_error: Option<ReconcileError>,
}

impl Report {
    fn record(&mut self, err: ReconcileError) {
        warn!("reconciliation error: {}", err);
        if self.first_error.is_none() {
            self.first_error = Some(err);
        }
    }
}

/// Per-cgroup readings for the observability sink.
#[derive(Debug, Clone)]
pub struct CgroupStat {
    /// Tracked UID, or `None` for the shared subtree itself.
    pub uid: Option<u32>,
    pub path: PathBuf,
    pub quota: Option<Quota>,
    pub memory_current_bytes: Option<u64>,
}

/// Reconciler configuration, cut from the daemon config.
#[derive(Debug, Clone)]
pub struct CgroupSettings {
    /// Mount of the cgroup-v2 hierarchy.
    pub cgroup_root: PathBuf,
    /// Name of this daemon's subtree under the root.
    pub base_name: String,
    /// Proc filesystem root, scanned to find a user's PIDs.
    pub proc_path: String,
    /// `cpu.max` value restored to legacy per-user cgroups on release.
    pub normal_quota: Quota,
    /// Cores withheld from the shared quota.
    pub min_system_cores: u32,
    /// Path of the tracking file.
    pub tracking_file: PathBuf,
}

/// Owns all writes under `<cgroup_root>/<base>`.
pub struct CgroupReconciler<F: FileSystem + Clone + 'static> {
    fs: F,
    settings: CgroupSettings,
    tracking: TrackingFile<F>,
    /// UID -> cgroup directory. The control loop is the only writer;
    /// observability readers take the lock shared.
    tracked: Arc<RwLock<HashMap<u32, PathBuf>>>,
    running: Arc<AtomicBool>,
    settle_delay: Duration,
    placements: Vec<JoinHandle<()>>,
}

impl<F: FileSystem + Clone + 'static> CgroupReconciler<F> {
    /// Creates a reconciler. `running` is the process-wide cancellation
    /// flag; placement threads stop when it clears.
    pub fn new(fs: F, settings: CgroupSettings, running: Arc<AtomicBool>) -> Self {
        let tracking = TrackingFile::new(fs.clone(), settings.tracking_file.clone());
        Self {
            fs,
            settings,
            tracking,
            tracked: Arc::new(RwLock::new(HashMap::new())),
            running,
            settle_delay: SETTLE_DELAY,
            placements: Vec::new(),
        }
    }

    /// Overrides the placement settle delay. Tests use zero.
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Path of the daemon's base cgroup.
    pub fn base_path(&self) -> PathBuf {
        self.settings.cgroup_root.join(&self.settings.base_name)
    }

    /// Path of the shared subtree.
    pub fn limited_path(&self) -> PathBuf {
        self.base_path().join("limited")
    }

    fn user_path(&self, uid: u32) -> PathBuf {
        self.limited_path().join(format!("user_{}", uid))
    }

    /// Legacy per-user cgroup from the older non-shared mode.
    fn legacy_user_path(&self, uid: u32) -> PathBuf {
        self.base_path().join(format!("user_{}", uid))
    }

    /// Shared read handle on the tracked-user map.
    pub fn tracked_handle(&self) -> Arc<RwLock<HashMap<u32, PathBuf>>> {
        Arc::clone(&self.tracked)
    }

    /// Currently tracked UIDs, ascending.
    pub fn tracked_users(&self) -> Vec<u32> {
        let mut uids: Vec<u32> = self.tracked.read().unwrap().keys().copied().collect();
        uids.sort_unstable();
        uids
    }

    /// Applies a reloaded configuration. The tracked set is untouched;
    /// already-created cgroups keep their recorded absolute paths.
    pub fn reconfigure(&mut self, settings: CgroupSettings) {
        self.tracking = TrackingFile::new(self.fs.clone(), settings.tracking_file.clone());
        self.settings = settings;
    }

    /// Verifies cgroup-v2 is usable and prepares the base cgroup.
    ///
    /// Invoked once at startup. Enabling `+cpu +cpuset` at the hierarchy
    /// root is attempted here; whether that succeeds is up to how the
    /// system delegates controllers, and failure is fatal.
    pub fn prepare(&self) -> Result<(), SetupError> {
        let root = &self.settings.cgroup_root;
        let controllers_path = root.join("cgroup.controllers");
        let controllers = self
            .fs
            .read_to_string(&controllers_path)
            .map_err(|e| SetupError {
                path: controllers_path.clone(),
                reason: format!("cannot read cgroup.controllers: {}", e),
            })?;
        if !controllers.split_whitespace().any(|c| c == "cpu") {
            return Err(SetupError {
                path: controllers_path,
                reason: "cpu controller not available".to_string(),
            });
        }

        self.enable_controllers(root, "+cpu +cpuset")?;

        let base = self.base_path();
        self.fs.create_dir(&base).map_err(|e| SetupError {
            path: base.clone(),
            reason: format!("cannot create base cgroup: {}", e),
        })?;
        self.enable_controllers(&base, "+cpu +cpuset")?;

        info!("prepared base cgroup {:?}", base);
        Ok(())
    }

    /// Ensures `subtree_control` of `dir` carries the given controllers.
    fn enable_controllers(&self, dir: &Path, wanted: &str) -> Result<(), SetupError> {
        let path = dir.join("cgroup.subtree_control");
        let current = self.fs.read_to_string(&path).unwrap_or_default();
        let missing = wanted
            .split_whitespace()
            .any(|c| !current.split_whitespace().any(|e| e == &c[1..]));
        if !missing {
            return Ok(());
        }
        self.fs.write_string(&path, wanted).map_err(|e| SetupError {
            path: path.clone(),
            reason: format!("cannot enable controllers: {}", e),
        })
    }

    /// Restores the tracked set from the tracking file, keeping only
    /// entries whose cgroup still exists.
    pub fn recover(&mut self) -> io::Result<Vec<(u32, PathBuf)>> {
        let entries = self.tracking.recover()?;
        let mut tracked = self.tracked.write().unwrap();
        for (uid, path) in &entries {
            tracked.insert(*uid, path.clone());
        }
        Ok(entries)
    }

    /// The absolute bandwidth cap for the shared subtree: everything but
    /// `min_system_cores`, never less than one core.
    fn shared_quota(&self, total_cores: u32) -> Quota {
        let cores = total_cores
            .saturating_sub(self.settings.min_system_cores)
            .max(1);
        Quota::Limited {
            quota_us: cores as u64 * PERIOD_US,
            period_us: PERIOD_US,
        }
    }

    /// Ensures the shared subtree exists with the absolute quota, and
    /// creates (plus asynchronously populates) a cgroup for every active
    /// user not yet tracked. UIDs are processed in ascending order.
    pub fn activate(&mut self, metrics: &SystemMetrics) -> Report {
        let mut report = Report::default();
        self.reap_finished_placements();

        let limited = self.limited_path();
        if let Err(e) = self.fs.create_dir(&limited) {
            report.record(ReconcileError::io(&limited, e));
            return report;
        }

        let quota = self.shared_quota(metrics.total_cores);
        let quota_path = limited.join("cpu.max");
        match self.write_quota(&quota_path, quota) {
            Ok(()) => report.shared_quota = Some(quota),
            Err(e) => report.record(ReconcileError::io(&quota_path, e)),
        }

        // Children need +cpu in the shared subtree for their weights.
        let subtree = limited.join("cgroup.subtree_control");
        let current = self.fs.read_to_string(&subtree).unwrap_or_default();
        if !current.split_whitespace().any(|c| c == "cpu")
            && let Err(e) = self.fs.write_string(&subtree, "+cpu")
        {
            report.record(ReconcileError::io(&subtree, e));
        }

        for &uid in &metrics.active_users {
            if self.tracked.read().unwrap().contains_key(&uid) {
                continue;
            }
            let dir = self.user_path(uid);
            if let Err(e) = self.fs.create_dir(&dir) {
                report.record(ReconcileError::io(&dir, e));
                continue;
            }
            if let Err(e) = self.tracking.append(uid, &dir) {
                warn!("cannot append tracking entry for uid {}: {}", uid, e);
            }
            self.tracked.write().unwrap().insert(uid, dir.clone());
            report.created_users.push(uid);
            debug!("created {:?}", dir);
            self.spawn_placement(uid, dir);
        }

        report
    }

    /// Starts the background migration of `uid`'s processes into `dir`.
    ///
    /// Re-entry is idempotent: rewriting a PID already in the target
    /// `cgroup.procs` is a no-op for the kernel.
    fn spawn_placement(&mut self, uid: u32, dir: PathBuf) {
        let fs = self.fs.clone();
        let proc_path = self.settings.proc_path.clone();
        let running = Arc::clone(&self.running);
        let settle = self.settle_delay;

        let handle = std::thread::spawn(move || {
            if !settle.is_zero() {
                std::thread::sleep(settle);
            }
            if !running.load(Ordering::SeqCst) {
                return;
            }
            let moved = place_user_processes(&fs, &proc_path, uid, &dir, &running);
            debug!("placed {} processes of uid {} into {:?}", moved, uid, dir);

            // Weight goes in only after placement was attempted.
            let weight_path = dir.join("cpu.weight");
            if let Err(e) = write_with_retry(&fs, &weight_path, &CPU_WEIGHT.to_string()) {
                warn!("cannot set cpu.weight for uid {}: {}", uid, e);
            }
        });
        self.placements.push(handle);
    }

    /// Sweeps stragglers: re-places every tracked user's processes.
    ///
    /// Run once per cycle while limits are active. A process started
    /// after its user's placement finished would otherwise sit outside
    /// the shared subtree forever. One background task scans `/proc` a
    /// single time and replays the placement writes, which the kernel
    /// treats as no-ops for already-confined PIDs.
    pub fn sweep_stragglers(&mut self) {
        self.reap_finished_placements();

        let tracked = self.tracked.read().unwrap();
        let mut targets: Vec<(u32, PathBuf)> =
            tracked.iter().map(|(u, p)| (*u, p.clone())).collect();
        drop(tracked);
        if targets.is_empty() {
            return;
        }
        targets.sort_unstable_by_key(|(uid, _)| *uid);

        let fs = self.fs.clone();
        let proc_path = self.settings.proc_path.clone();
        let running = Arc::clone(&self.running);

        let handle = std::thread::spawn(move || {
            for (uid, dir) in targets {
                if !running.load(Ordering::SeqCst) {
                    return;
                }
                if !fs.exists(&dir) {
                    continue;
                }
                place_user_processes(&fs, &proc_path, uid, &dir, &running);
            }
        });
        self.placements.push(handle);
    }

    /// Joins all outstanding placement threads.
    pub fn wait_for_placements(&mut self) {
        for handle in self.placements.drain(..) {
            let _ = handle.join();
        }
    }

    fn reap_finished_placements(&mut self) {
        self.placements.retain(|h| !h.is_finished());
    }

    /// Tears the shared subtree down and releases every tracked user.
    ///
    /// Processes move back to the cgroup root; a user's legacy per-user
    /// cgroup, when present, gets `normal_quota` restored. The empty base
    /// cgroup is left in place.
    pub fn deactivate(&mut self) -> Report {
        // Serialize against in-flight placements so nothing writes into
        // directories being removed.
        self.wait_for_placements();

        let mut report = Report::default();
        for uid in self.tracked_users() {
            let legacy = self.legacy_user_path(uid);
            if self.fs.exists(&legacy) {
                let quota_path = legacy.join("cpu.max");
                if let Err(e) = self.write_quota(&quota_path, self.settings.normal_quota) {
                    report.record(ReconcileError::io(&quota_path, e));
                }
            }
            self.release_user(uid, &mut report);
        }

        let limited = self.limited_path();
        if self.fs.exists(&limited)
            && let Err(e) = self.remove_dir_with_retry(&limited)
        {
            report.record(ReconcileError::io(&limited, e));
        }

        report
    }

    /// Drops users that are no longer active, without touching the shared
    /// subtree. Used on MAINTAIN; never creates cgroups.
    pub fn drop_users(&mut self, uids: &[u32]) -> Report {
        let mut report = Report::default();
        let mut uids = uids.to_vec();
        uids.sort_unstable();
        for uid in uids {
            if self.tracked.read().unwrap().contains_key(&uid) {
                self.release_user(uid, &mut report);
            }
        }
        report
    }

    /// Moves a user's processes back to the root and removes its cgroup.
    /// A missing directory is a non-error.
    fn release_user(&mut self, uid: u32, report: &mut Report) {
        let Some(dir) = self.tracked.write().unwrap().remove(&uid) else {
            return;
        };

        if !self.fs.exists(&dir) {
            if let Err(e) = self.tracking.remove(uid) {
                warn!("cannot drop tracking entry for uid {}: {}", uid, e);
            }
            report.removed_users.push(uid);
            return;
        }

        let root_procs = self.settings.cgroup_root.join("cgroup.procs");
        let procs_path = dir.join("cgroup.procs");
        if let Ok(content) = self.fs.read_to_string(&procs_path) {
            for pid in content.lines().filter(|l| !l.trim().is_empty()) {
                if let Err(e) = append_with_retry(&self.fs, &root_procs, &format!("{}\n", pid)) {
                    debug!("cannot move pid {} back to root: {}", pid, e);
                }
            }
        }

        match self.remove_dir_with_retry(&dir) {
            Ok(()) => {
                if let Err(e) = self.tracking.remove(uid) {
                    warn!("cannot drop tracking entry for uid {}: {}", uid, e);
                }
                report.removed_users.push(uid);
                debug!("removed {:?}", dir);
            }
            Err(e) => {
                // Leave the tracking line; recovery picks the
                // still-existing directory up after a restart.
                report.record(ReconcileError::io(&dir, e));
            }
        }
    }

    /// Writes a validated quota and rereads it; one corrective rewrite,
    /// then gives up with a warning.
    fn write_quota(&self, path: &Path, quota: Quota) -> io::Result<()> {
        let value = quota.to_string();
        write_with_retry(&self.fs, path, &value)?;

        let read_back = self.fs.read_to_string(path)?;
        if read_back.trim_end() == value {
            return Ok(());
        }
        write_with_retry(&self.fs, path, &value)?;
        let read_back = self.fs.read_to_string(path)?;
        if read_back.trim_end() != value {
            warn!(
                "cpu.max at {:?} reads back {:?} after writing {:?}; giving up",
                path,
                read_back.trim_end(),
                value
            );
        }
        Ok(())
    }

    fn remove_dir_with_retry(&self, dir: &Path) -> io::Result<()> {
        match self.fs.remove_dir(dir) {
            Ok(()) => Ok(()),
            Err(first) => {
                debug!("removal of {:?} failed ({}), retrying", dir, first);
                std::thread::sleep(RETRY_DELAY);
                self.fs.remove_dir(dir)
            }
        }
    }

    /// Per-cgroup readings for the observability sink: the shared subtree
    /// plus every tracked user.
    pub fn cgroup_stats(&self) -> Vec<CgroupStat> {
        let mut stats = Vec::new();

        let limited = self.limited_path();
        if self.fs.exists(&limited) {
            stats.push(self.stat_dir(None, limited));
        }

        let tracked = self.tracked.read().unwrap();
        let mut entries: Vec<(u32, PathBuf)> =
            tracked.iter().map(|(u, p)| (*u, p.clone())).collect();
        drop(tracked);
        entries.sort_unstable_by_key(|(uid, _)| *uid);
        for (uid, path) in entries {
            stats.push(self.stat_dir(Some(uid), path));
        }
        stats
    }

    fn stat_dir(&self, uid: Option<u32>, path: PathBuf) -> CgroupStat {
        let quota = self
            .fs
            .read_to_string(&path.join("cpu.max"))
            .ok()
            .and_then(|content| Quota::parse(content.trim_end()).ok());
        let memory_current_bytes = self
            .fs
            .read_to_string(&path.join("memory.current"))
            .ok()
            .and_then(|content| content.trim().parse().ok());
        CgroupStat {
            uid,
            path,
            quota,
            memory_current_bytes,
        }
    }

    /// Truncates the tracking file; shutdown persists the empty set.
    pub fn clear_tracking(&self) -> io::Result<()> {
        self.tracking.clear()
    }

    /// Cancels placements and joins them. Called on shutdown after the
    /// final deactivation.
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.wait_for_placements();
    }
}

/// Writes `value`, retrying once after a short delay when the write is
/// refused with a permission error (cgroup delegation races).
fn write_with_retry<F: FileSystem>(fs: &F, path: &Path, value: &str) -> io::Result<()> {
    match fs.write_string(path, value) {
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            debug!("write to {:?} refused ({}), retrying", path, e);
            std::thread::sleep(RETRY_DELAY);
            fs.write_string(path, value)
        }
        other => other,
    }
}

/// Appends `value` with the same single-retry policy as `write_with_retry`.
fn append_with_retry<F: FileSystem>(fs: &F, path: &Path, value: &str) -> io::Result<()> {
    match fs.append_string(path, value) {
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            debug!("append to {:?} refused ({}), retrying", path, e);
            std::thread::sleep(RETRY_DELAY);
            fs.append_string(path, value)
        }
        other => other,
    }
}

/// Moves every process owned by `uid` into `dir` by writing its PID to
/// the target `cgroup.procs`, one at a time, in filesystem order. PIDs
/// may vanish between the scan and the write; that is not an error.
fn place_user_processes<F: FileSystem>(
    fs: &F,
    proc_path: &str,
    uid: u32,
    dir: &Path,
    running: &AtomicBool,
) -> usize {
    let entries = match fs.read_dir(Path::new(proc_path)) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("cannot scan {} for uid {}: {}", proc_path, uid, e);
            return 0;
        }
    };

    let procs_path = dir.join("cgroup.procs");
    let mut moved = 0;

    for entry in entries {
        if !running.load(Ordering::SeqCst) {
            break;
        }
        let Some(pid) = entry
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.parse::<u32>().ok())
        else {
            continue;
        };

        let status_path = entry.join("status");
        let Ok(content) = fs.read_to_string(&status_path) else {
            continue;
        };
        let Ok(status) = parse_proc_status(&content) else {
            continue;
        };
        if status.uid != uid {
            continue;
        }

        match append_with_retry(fs, &procs_path, &format!("{}\n", pid)) {
            Ok(()) => moved += 1,
            Err(e) => debug!("cannot move pid {} of uid {}: {}", pid, uid, e),
        }
    }

    moved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MockFs;
    use std::collections::BTreeSet;

    fn metrics_with_users(total_cores: u32, uids: &[u32]) -> SystemMetrics {
        SystemMetrics {
            timestamp: 0,
            total_cores,
            total_cpu_percent: 0.0,
            user_cpu_percent: 0.0,
            memory_used_mib: 0,
            load1: 0.0,
            under_load: false,
            active_users: BTreeSet::from_iter(uids.iter().copied()),
            per_user: HashMap::new(),
        }
    }

    fn settings() -> CgroupSettings {
        CgroupSettings {
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            base_name: "cpu_manager".to_string(),
            proc_path: "/proc".to_string(),
            normal_quota: Quota::Max { period_us: 100_000 },
            min_system_cores: 1,
            tracking_file: PathBuf::from("/var/lib/cpu-manager/created"),
        }
    }

    fn reconciler(fs: &MockFs) -> CgroupReconciler<MockFs> {
        fs.add_cgroup_root("/sys/fs/cgroup");
        let running = Arc::new(AtomicBool::new(true));
        CgroupReconciler::new(fs.clone(), settings(), running)
            .with_settle_delay(Duration::ZERO)
    }

    #[test]
    fn prepare_sets_up_base_cgroup() {
        let fs = MockFs::new();
        let rec = reconciler(&fs);
        rec.prepare().unwrap();

        assert!(fs.exists(Path::new("/sys/fs/cgroup/cpu_manager")));
        assert_eq!(
            fs.read_to_string(Path::new("/sys/fs/cgroup/cgroup.subtree_control"))
                .unwrap(),
            "+cpu +cpuset"
        );
        assert_eq!(
            fs.read_to_string(Path::new(
                "/sys/fs/cgroup/cpu_manager/cgroup.subtree_control"
            ))
            .unwrap(),
            "+cpu +cpuset"
        );
    }

    #[test]
    fn prepare_skips_enable_when_already_on() {
        let fs = MockFs::new();
        let rec = reconciler(&fs);
        fs.add_file(
            "/sys/fs/cgroup/cgroup.subtree_control",
            "cpu cpuset memory\n",
        );
        rec.prepare().unwrap();

        // The root file was not rewritten.
        assert!(
            !fs.write_log()
                .iter()
                .any(|(p, _)| p == Path::new("/sys/fs/cgroup/cgroup.subtree_control"))
        );
    }

    #[test]
    fn prepare_fails_without_cpu_controller() {
        let fs = MockFs::new();
        fs.add_dir("/sys/fs/cgroup");
        fs.add_file("/sys/fs/cgroup/cgroup.controllers", "memory pids\n");
        let running = Arc::new(AtomicBool::new(true));
        let rec = CgroupReconciler::new(fs, settings(), running);

        assert!(rec.prepare().is_err());
    }

    #[test]
    fn prepare_fails_without_cgroup_v2() {
        let fs = MockFs::new();
        let running = Arc::new(AtomicBool::new(true));
        let rec = CgroupReconciler::new(fs, settings(), running);
        assert!(rec.prepare().is_err());
    }

    #[test]
    fn activate_creates_shared_subtree_with_total_quota() {
        let fs = MockFs::new();
        let mut rec = reconciler(&fs);
        rec.prepare().unwrap();

        fs.add_process("/proc", 100, 1001, "stress", 1, 0, 100);
        fs.add_process("/proc", 101, 1002, "make", 1, 0, 100);

        // 4 cores minus 1 reserved -> 300000/100000.
        let report = rec.activate(&metrics_with_users(4, &[1001, 1002]));
        rec.wait_for_placements();

        assert!(report.first_error.is_none());
        assert_eq!(report.created_users, vec![1001, 1002]);
        assert_eq!(
            fs.read_to_string(Path::new(
                "/sys/fs/cgroup/cpu_manager/limited/cpu.max"
            ))
            .unwrap(),
            "300000 100000"
        );
        for uid in [1001u32, 1002] {
            let dir = format!("/sys/fs/cgroup/cpu_manager/limited/user_{}", uid);
            assert_eq!(
                fs.read_to_string(&Path::new(&dir).join("cpu.weight")).unwrap(),
                "100"
            );
        }
    }

    #[test]
    fn quota_reserves_at_least_one_core() {
        let fs = MockFs::new();
        let mut rec = reconciler(&fs);
        rec.prepare().unwrap();

        // 1 core minus 1 reserved would be zero; floor is one core.
        let report = rec.activate(&metrics_with_users(1, &[]));
        assert_eq!(
            report.shared_quota,
            Some(Quota::Limited {
                quota_us: 100_000,
                period_us: 100_000
            })
        );
    }

    #[test]
    fn placement_moves_only_matching_uid() {
        let fs = MockFs::new();
        let mut rec = reconciler(&fs);
        rec.prepare().unwrap();

        fs.add_process("/proc", 100, 1001, "stress", 1, 0, 100);
        fs.add_process("/proc", 101, 1001, "stress", 1, 0, 100);
        fs.add_process("/proc", 200, 0, "systemd", 1, 0, 100);
        fs.add_process("/proc", 300, 1002, "make", 1, 0, 100);

        rec.activate(&metrics_with_users(4, &[1001]));
        rec.wait_for_placements();

        let procs = fs
            .read_to_string(Path::new(
                "/sys/fs/cgroup/cpu_manager/limited/user_1001/cgroup.procs"
            ))
            .unwrap();
        let mut pids: Vec<&str> = procs.lines().collect();
        pids.sort_unstable();
        assert_eq!(pids, vec!["100", "101"]);

        // Nothing under the base ever saw the system or untracked PIDs.
        for (path, content) in fs.write_log() {
            if path.ends_with("cgroup.procs") {
                assert_ne!(content.trim(), "200");
                assert_ne!(content.trim(), "300");
            }
        }
    }

    #[test]
    fn activate_twice_is_idempotent() {
        let fs = MockFs::new();
        let mut rec = reconciler(&fs);
        rec.prepare().unwrap();
        fs.add_process("/proc", 100, 1001, "stress", 1, 0, 100);

        let metrics = metrics_with_users(4, &[1001]);
        let first = rec.activate(&metrics);
        rec.wait_for_placements();
        assert_eq!(first.created_users, vec![1001]);
        let log_after_first = fs.write_log().len();

        let second = rec.activate(&metrics);
        rec.wait_for_placements();
        assert!(second.created_users.is_empty());
        assert!(second.first_error.is_none());

        // The second call re-asserts the quota but moves no new PIDs.
        let new_writes: Vec<(PathBuf, String)> =
            fs.write_log().drain(log_after_first..).collect();
        assert!(
            new_writes
                .iter()
                .all(|(p, _)| p.ends_with("cpu.max") || p.ends_with("cgroup.subtree_control")),
            "unexpected writes: {:?}",
            new_writes
        );
    }

    #[test]
    fn permission_denied_write_is_retried() {
        let fs = MockFs::new();
        let mut rec = reconciler(&fs);
        rec.prepare().unwrap();
        fs.add_process("/proc", 100, 1001, "stress", 1, 0, 100);
        fs.deny_writes(
            Path::new("/sys/fs/cgroup/cpu_manager/limited/cpu.max"),
            1,
        );

        let report = rec.activate(&metrics_with_users(4, &[1001]));
        rec.wait_for_placements();

        assert!(report.first_error.is_none());
        assert_eq!(
            fs.read_to_string(Path::new(
                "/sys/fs/cgroup/cpu_manager/limited/cpu.max"
            ))
            .unwrap(),
            "300000 100000"
        );
    }

    #[test]
    fn clamped_quota_rewritten_once_then_given_up() {
        let fs = MockFs::new();
        let mut rec = reconciler(&fs);
        rec.prepare().unwrap();
        let quota_path = "/sys/fs/cgroup/cpu_manager/limited/cpu.max";
        fs.add_dir("/sys/fs/cgroup/cpu_manager/limited");
        fs.pin_file(quota_path, "max 100000\n");

        let report = rec.activate(&metrics_with_users(4, &[]));
        assert!(report.first_error.is_none());

        let quota_writes = fs
            .write_log()
            .iter()
            .filter(|(p, _)| p == Path::new(quota_path))
            .count();
        assert_eq!(quota_writes, 2);
    }

    #[test]
    fn deactivate_round_trips_the_tree() {
        let fs = MockFs::new();
        let mut rec = reconciler(&fs);
        rec.prepare().unwrap();
        fs.add_process("/proc", 100, 1001, "stress", 1, 0, 100);
        fs.add_process("/proc", 200, 1002, "make", 1, 0, 100);

        rec.activate(&metrics_with_users(4, &[1001, 1002]));
        rec.wait_for_placements();

        let report = rec.deactivate();
        assert!(report.first_error.is_none());
        assert_eq!(report.removed_users, vec![1001, 1002]);

        // The shared subtree and all user children are gone; the base stays.
        assert!(!fs.exists(Path::new("/sys/fs/cgroup/cpu_manager/limited")));
        assert!(fs.exists(Path::new("/sys/fs/cgroup/cpu_manager")));
        assert!(rec.tracked_users().is_empty());

        // Moved PIDs went back to the root cgroup.
        let root_procs = fs
            .read_to_string(Path::new("/sys/fs/cgroup/cgroup.procs"))
            .unwrap();
        assert!(root_procs.lines().any(|l| l == "100"));
        assert!(root_procs.lines().any(|l| l == "200"));

        // Tracking file is empty again.
        let tracking = fs
            .read_to_string(Path::new("/var/lib/cpu-manager/created"))
            .unwrap();
        assert_eq!(tracking, "");
    }

    #[test]
    fn deactivate_restores_legacy_user_quota() {
        let fs = MockFs::new();
        let mut rec = reconciler(&fs);
        rec.prepare().unwrap();
        fs.add_process("/proc", 100, 1001, "stress", 1, 0, 100);
        // Legacy per-user cgroup from the old non-shared mode.
        fs.add_dir("/sys/fs/cgroup/cpu_manager/user_1001");

        rec.activate(&metrics_with_users(4, &[1001]));
        rec.wait_for_placements();
        rec.deactivate();

        assert_eq!(
            fs.read_to_string(Path::new(
                "/sys/fs/cgroup/cpu_manager/user_1001/cpu.max"
            ))
            .unwrap(),
            "max 100000"
        );
    }

    #[test]
    fn busy_directory_retried_then_reported() {
        let fs = MockFs::new();
        let mut rec = reconciler(&fs);
        rec.prepare().unwrap();
        fs.add_process("/proc", 100, 1001, "stress", 1, 0, 100);

        rec.activate(&metrics_with_users(4, &[1001]));
        rec.wait_for_placements();

        let user_dir = Path::new("/sys/fs/cgroup/cpu_manager/limited/user_1001");
        // First removal attempt is busy, the retry succeeds.
        fs.deny_removals(user_dir, 1);
        let report = rec.deactivate();
        assert!(report.first_error.is_none());
        assert!(!fs.exists(user_dir));
    }

    #[test]
    fn stuck_directory_errors_but_keeps_tracking_line() {
        let fs = MockFs::new();
        let mut rec = reconciler(&fs);
        rec.prepare().unwrap();
        fs.add_process("/proc", 100, 1001, "stress", 1, 0, 100);

        rec.activate(&metrics_with_users(4, &[1001]));
        rec.wait_for_placements();

        let user_dir = Path::new("/sys/fs/cgroup/cpu_manager/limited/user_1001");
        fs.deny_removals(user_dir, 2);
        let report = rec.deactivate();
        assert!(report.first_error.is_some());

        // The surviving directory keeps its tracking line for recovery.
        let tracking = fs
            .read_to_string(Path::new("/var/lib/cpu-manager/created"))
            .unwrap();
        assert!(tracking.contains("1001:"));
    }

    #[test]
    fn drop_users_releases_only_the_given_uids() {
        let fs = MockFs::new();
        let mut rec = reconciler(&fs);
        rec.prepare().unwrap();
        fs.add_process("/proc", 100, 1001, "stress", 1, 0, 100);
        fs.add_process("/proc", 200, 1002, "make", 1, 0, 100);

        rec.activate(&metrics_with_users(4, &[1001, 1002]));
        rec.wait_for_placements();

        let report = rec.drop_users(&[1002, 9999]);
        assert_eq!(report.removed_users, vec![1002]);
        assert!(fs.exists(Path::new(
            "/sys/fs/cgroup/cpu_manager/limited/user_1001"
        )));
        assert!(!fs.exists(Path::new(
            "/sys/fs/cgroup/cpu_manager/limited/user_1002"
        )));
        assert_eq!(rec.tracked_users(), vec![1001]);
    }

    #[test]
    fn sweep_confines_processes_started_after_placement() {
        let fs = MockFs::new();
        let mut rec = reconciler(&fs);
        rec.prepare().unwrap();
        fs.add_process("/proc", 100, 1001, "stress", 1, 0, 100);

        rec.activate(&metrics_with_users(4, &[1001]));
        rec.wait_for_placements();

        // A new process appears after the initial placement finished.
        fs.add_process("/proc", 150, 1001, "stress2", 1, 0, 100);
        rec.sweep_stragglers();
        rec.wait_for_placements();

        let procs = fs
            .read_to_string(Path::new(
                "/sys/fs/cgroup/cpu_manager/limited/user_1001/cgroup.procs"
            ))
            .unwrap();
        assert!(procs.lines().any(|l| l == "150"));
    }

    #[test]
    fn sweep_without_tracked_users_spawns_nothing() {
        let fs = MockFs::new();
        let mut rec = reconciler(&fs);
        rec.prepare().unwrap();

        rec.sweep_stragglers();
        assert!(rec.placements.is_empty());
    }

    #[test]
    fn recover_keeps_only_existing_directories() {
        let fs = MockFs::new();
        fs.add_cgroup_root("/sys/fs/cgroup");
        fs.add_dir("/sys/fs/cgroup/cpu_manager/limited/user_1002");
        fs.add_file(
            "/var/lib/cpu-manager/created",
            "1001:/sys/fs/cgroup/cpu_manager/limited/user_1001\n1002:/sys/fs/cgroup/cpu_manager/limited/user_1002\n",
        );

        let running = Arc::new(AtomicBool::new(true));
        let mut rec = CgroupReconciler::new(fs.clone(), settings(), running);
        let recovered = rec.recover().unwrap();

        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].0, 1002);
        assert_eq!(rec.tracked_users(), vec![1002]);
    }

    #[test]
    fn cgroup_stats_reports_quota_pairs() {
        let fs = MockFs::new();
        let mut rec = reconciler(&fs);
        rec.prepare().unwrap();
        fs.add_process("/proc", 100, 1001, "stress", 1, 0, 100);

        rec.activate(&metrics_with_users(4, &[1001]));
        rec.wait_for_placements();
        fs.add_file(
            "/sys/fs/cgroup/cpu_manager/limited/user_1001/memory.current",
            "4096\n",
        );

        let stats = rec.cgroup_stats();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].uid, None);
        assert_eq!(stats[0].quota.unwrap().pair(), (Some(300_000), 100_000));
        assert_eq!(stats[1].uid, Some(1001));
        assert_eq!(stats[1].memory_current_bytes, Some(4096));
    }

    #[test]
    fn cancelled_placement_moves_nothing() {
        let fs = MockFs::new();
        fs.add_cgroup_root("/sys/fs/cgroup");
        let running = Arc::new(AtomicBool::new(true));
        let mut rec = CgroupReconciler::new(fs.clone(), settings(), Arc::clone(&running))
            .with_settle_delay(Duration::from_millis(50));
        rec.prepare().unwrap();
        fs.add_process("/proc", 100, 1001, "stress", 1, 0, 100);

        rec.activate(&metrics_with_users(4, &[1001]));
        // Cancel before the settle delay elapses.
        running.store(false, Ordering::SeqCst);
        rec.wait_for_placements();

        let procs = fs.read_to_string(Path::new(
            "/sys/fs/cgroup/cpu_manager/limited/user_1001/cgroup.procs",
        ));
        assert!(procs.is_err() || procs.unwrap().is_empty());
    }
}
