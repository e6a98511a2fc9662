//! System collector for host-wide metrics from `/proc/`.

use crate::collector::procfs::parser::{
    CpuTotals, LoadAvg, MemInfo, count_cpuinfo_processors, parse_cpu_totals, parse_loadavg,
    parse_meminfo,
};
use crate::collector::procfs::process::CollectError;
use crate::fs::FileSystem;
use std::path::Path;

/// Collects host-wide metrics from `/proc/`.
pub struct SystemCollector<F: FileSystem> {
    fs: F,
    proc_path: String,
}

impl<F: FileSystem> SystemCollector<F> {
    /// Creates a new system collector.
    ///
    /// # Arguments
    /// * `fs` - Filesystem implementation (real or mock)
    /// * `proc_path` - Base path to proc filesystem (usually "/proc")
    pub fn new(fs: F, proc_path: impl Into<String>) -> Self {
        Self {
            fs,
            proc_path: proc_path.into(),
        }
    }

    /// Returns the core count.
    ///
    /// Asks the OS first, then falls back to counting `processor` lines
    /// in `/proc/cpuinfo`.
    pub fn core_count(&self) -> Result<u32, CollectError> {
        if let Some(cores) = self.fs.os_core_count()
            && cores > 0
        {
            return Ok(cores);
        }

        let path = format!("{}/cpuinfo", self.proc_path);
        let content = self.fs.read_to_string(Path::new(&path))?;
        let cores = count_cpuinfo_processors(&content);
        if cores == 0 {
            return Err(CollectError::Parse(
                "no processor lines in cpuinfo".to_string(),
            ));
        }
        Ok(cores)
    }

    /// Reads the aggregate CPU tick counters from `/proc/stat`.
    pub fn cpu_totals(&self) -> Result<CpuTotals, CollectError> {
        let path = format!("{}/stat", self.proc_path);
        let content = self.fs.read_to_string(Path::new(&path))?;
        parse_cpu_totals(&content).map_err(|e| CollectError::Parse(e.message))
    }

    /// Reads load averages from `/proc/loadavg`.
    pub fn loadavg(&self) -> Result<LoadAvg, CollectError> {
        let path = format!("{}/loadavg", self.proc_path);
        let content = self.fs.read_to_string(Path::new(&path))?;
        parse_loadavg(&content).map_err(|e| CollectError::Parse(e.message))
    }

    /// Reads memory totals from `/proc/meminfo`.
    pub fn meminfo(&self) -> Result<MemInfo, CollectError> {
        let path = format!("{}/meminfo", self.proc_path);
        let content = self.fs.read_to_string(Path::new(&path))?;
        parse_meminfo(&content).map_err(|e| CollectError::Parse(e.message))
    }
}

/// Host CPU usage between two `/proc/stat` readings, 0..100 * cores.
pub fn cpu_percent_between(prev: &CpuTotals, next: &CpuTotals, cores: u32) -> f64 {
    let busy = next.busy().saturating_sub(prev.busy());
    let total = next.total().saturating_sub(prev.total());
    if total == 0 {
        return 0.0;
    }
    (busy as f64 / total as f64) * 100.0 * cores as f64
}
