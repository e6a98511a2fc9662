//! The metrics probe: one `sample()` call produces a complete
//! [`SystemMetrics`] snapshot.
//!
//! Host CPU usage comes from a short delta sample of the `/proc/stat`
//! aggregate line; per-process usage is the tick delta against the
//! previous scan. Snapshots are cached for `cache_ttl`, except the
//! `under_load` flag which is refreshed on its own short TTL because it
//! gates release decisions.

use crate::collector::procfs::parser::UserResolver;
use crate::collector::procfs::process::{CLK_TCK, CollectError, ProcSample, ProcessCollector};
use crate::collector::procfs::system::{SystemCollector, cpu_percent_between};
use crate::fs::FileSystem;
use crate::model::{LOAD_FACTOR, SystemMetrics, UserSample};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// TTL of the `under_load` reading, independent of the snapshot cache.
const UNDER_LOAD_TTL: Duration = Duration::from_secs(10);

/// Window of the host CPU delta sample.
const DELTA_WINDOW: Duration = Duration::from_secs(1);

/// Error type for probe failures.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    /// A required metrics source could not be read.
    #[error("metrics source unavailable: {0}")]
    SourceUnavailable(String),
}

impl From<CollectError> for ProbeError {
    fn from(e: CollectError) -> Self {
        ProbeError::SourceUnavailable(e.to_string())
    }
}

struct PrevScan {
    at: Instant,
    /// PID -> cumulative CPU ticks at the previous scan.
    ticks: HashMap<u32, u64>,
}

struct CachedSnapshot {
    at: Instant,
    metrics: SystemMetrics,
}

struct LoadReading {
    at: Instant,
    load1: f64,
    under_load: bool,
}

/// Samples host and per-user CPU state into [`SystemMetrics`] snapshots.
pub struct MetricsProbe<F: FileSystem + Clone> {
    fs: F,
    passwd_path: String,
    uid_min: u32,
    uid_max: u32,
    cache_ttl: Duration,
    delta_window: Duration,
    under_load_ttl: Duration,
    system: SystemCollector<F>,
    processes: ProcessCollector<F>,
    resolver: UserResolver,
    /// Core count is stable; probed once.
    cores: Option<u32>,
    prev_scan: Option<PrevScan>,
    cache: Option<CachedSnapshot>,
    load: Option<LoadReading>,
}

impl<F: FileSystem + Clone> MetricsProbe<F> {
    /// Creates a new probe.
    ///
    /// # Arguments
    /// * `fs` - Filesystem implementation (real or mock)
    /// * `proc_path` - Base path to proc filesystem (usually "/proc")
    /// * `uid_min`, `uid_max` - Inclusive non-system UID range
    pub fn new(fs: F, proc_path: impl Into<String>, uid_min: u32, uid_max: u32) -> Self {
        let proc_path = proc_path.into();
        let passwd_path = "/etc/passwd".to_string();

        let mut resolver = UserResolver::new();
        if let Ok(content) = fs.read_to_string(Path::new(&passwd_path)) {
            resolver.load_from_content(&content);
        }

        Self {
            fs: fs.clone(),
            passwd_path,
            uid_min,
            uid_max,
            cache_ttl: Duration::ZERO,
            delta_window: DELTA_WINDOW,
            under_load_ttl: UNDER_LOAD_TTL,
            system: SystemCollector::new(fs.clone(), &proc_path),
            processes: ProcessCollector::new(fs, &proc_path),
            resolver,
            cores: None,
            prev_scan: None,
            cache: None,
            load: None,
        }
    }

    /// Sets the snapshot cache TTL.
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Overrides the CPU delta window. Tests use a zero window so
    /// sampling does not sleep.
    pub fn with_delta_window(mut self, window: Duration) -> Self {
        self.delta_window = window;
        self
    }

    /// Overrides the `under_load` TTL (clamped to the 10 s default).
    pub fn with_under_load_ttl(mut self, ttl: Duration) -> Self {
        self.under_load_ttl = ttl.min(UNDER_LOAD_TTL);
        self
    }

    /// Uses an alternate passwd file for username resolution.
    pub fn with_passwd_path(mut self, path: impl Into<String>) -> Self {
        self.passwd_path = path.into();
        let mut resolver = UserResolver::new();
        if let Ok(content) = self.fs.read_to_string(Path::new(&self.passwd_path)) {
            resolver.load_from_content(&content);
        }
        self.resolver = resolver;
        self
    }

    /// Drops the cached snapshot and load reading, e.g. after a reload.
    pub fn clear_cache(&mut self) {
        self.cache = None;
        self.load = None;
    }

    /// Applies a new UID range and cache TTL from a reloaded config.
    pub fn reconfigure(&mut self, uid_min: u32, uid_max: u32, cache_ttl: Duration) {
        self.uid_min = uid_min;
        self.uid_max = uid_max;
        self.cache_ttl = cache_ttl;
        self.clear_cache();
    }

    /// Takes (or serves from cache) one snapshot.
    pub fn sample(&mut self) -> Result<SystemMetrics, ProbeError> {
        let cached = match &self.cache {
            Some(cached) if cached.at.elapsed() < self.cache_ttl => {
                Some(cached.metrics.clone())
            }
            _ => None,
        };
        if let Some(mut metrics) = cached {
            let (load1, under_load) = self.current_load(metrics.total_cores)?;
            metrics.load1 = load1;
            metrics.under_load = under_load;
            return Ok(metrics);
        }

        let metrics = self.sample_uncached()?;
        self.cache = Some(CachedSnapshot {
            at: Instant::now(),
            metrics: metrics.clone(),
        });
        Ok(metrics)
    }

    fn sample_uncached(&mut self) -> Result<SystemMetrics, ProbeError> {
        let cores = self.core_count()?;

        let t0 = self.system.cpu_totals()?;
        if !self.delta_window.is_zero() {
            std::thread::sleep(self.delta_window);
        }
        let t1 = self.system.cpu_totals()?;
        let total_cpu_percent = cpu_percent_between(&t0, &t1, cores);

        let samples = self.processes.scan()?;
        let scanned_at = Instant::now();

        let mut per_user: HashMap<u32, UserSample> = HashMap::new();
        let mut active_users = BTreeSet::new();
        let mut refreshed_passwd = false;

        for sample in &samples {
            if sample.uid < self.uid_min || sample.uid > self.uid_max {
                continue;
            }

            // A UID created after startup will not be in the cached passwd
            // map yet; reread it at most once per sample.
            if !self.resolver.knows(sample.uid) && !refreshed_passwd {
                refreshed_passwd = true;
                if let Ok(content) = self.fs.read_to_string(Path::new(&self.passwd_path)) {
                    self.resolver.load_from_content(&content);
                }
            }

            let cpu_percent = self.process_cpu_percent(sample, scanned_at, cores);
            let entry = per_user.entry(sample.uid).or_insert_with(|| UserSample {
                cpu_percent: 0.0,
                rss_bytes: 0,
                process_count: 0,
                username: self.resolver.resolve(sample.uid),
            });
            entry.cpu_percent += cpu_percent;
            entry.rss_bytes += sample.rss_bytes;
            entry.process_count += 1;
            active_users.insert(sample.uid);
        }

        let user_cpu_percent = per_user.values().map(|u| u.cpu_percent).sum();

        let mem = self.system.meminfo()?;
        let (load1, under_load) = self.read_load(cores)?;

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        self.prev_scan = Some(PrevScan {
            at: scanned_at,
            ticks: samples.iter().map(|s| (s.pid, s.cpu_ticks)).collect(),
        });

        Ok(SystemMetrics {
            timestamp,
            total_cores: cores,
            total_cpu_percent,
            user_cpu_percent,
            memory_used_mib: mem.used_mib(),
            load1,
            under_load,
            active_users,
            per_user,
        })
    }

    fn core_count(&mut self) -> Result<u32, ProbeError> {
        if let Some(cores) = self.cores {
            return Ok(cores);
        }
        let cores = self.system.core_count()?;
        self.cores = Some(cores);
        Ok(cores)
    }

    /// CPU percent of one process since the previous scan, clamped to the
    /// machine total. The first scan has no baseline and reads 0%.
    fn process_cpu_percent(&self, sample: &ProcSample, now: Instant, cores: u32) -> f64 {
        let Some(prev) = &self.prev_scan else {
            return 0.0;
        };
        // A recycled PID shows fewer ticks than before; treat as new.
        let prev_ticks = prev.ticks.get(&sample.pid).copied().unwrap_or(0);
        let delta = sample.cpu_ticks.saturating_sub(prev_ticks);
        let elapsed = now.saturating_duration_since(prev.at).as_secs_f64();
        if elapsed <= 0.0 || delta == 0 {
            return 0.0;
        }
        let percent = (delta as f64 / CLK_TCK as f64) / elapsed * 100.0;
        percent.min(100.0 * cores as f64)
    }

    /// Serves `load1`/`under_load`, rereading only past their short TTL.
    fn current_load(&mut self, cores: u32) -> Result<(f64, bool), ProbeError> {
        if let Some(reading) = &self.load
            && reading.at.elapsed() < self.under_load_ttl
        {
            return Ok((reading.load1, reading.under_load));
        }
        self.read_load(cores)
    }

    fn read_load(&mut self, cores: u32) -> Result<(f64, bool), ProbeError> {
        let load = self.system.loadavg()?;
        let under_load = load.load1 > LOAD_FACTOR * cores as f64;
        self.load = Some(LoadReading {
            at: Instant::now(),
            load1: load.load1,
            under_load,
        });
        Ok((load.load1, under_load))
    }
}
