//! Process scanner gathering per-process identity and CPU ticks from
//! `/proc/[pid]/`.

use crate::collector::procfs::parser::{parse_proc_stat, parse_proc_status};
use crate::fs::FileSystem;
use std::path::Path;
use tracing::debug;

/// Clock ticks per second (USER_HZ). Standard value for Linux.
pub const CLK_TCK: u64 = 100;

/// Error type for collection failures.
#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    /// Process disappeared during collection.
    #[error("process {0} disappeared")]
    ProcessGone(u32),
    /// I/O error reading process files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Parse error in process files.
    #[error("parse error: {0}")]
    Parse(String),
}

/// One process as seen by a single scan.
#[derive(Debug, Clone)]
pub struct ProcSample {
    pub pid: u32,
    /// Real UID from `/proc/[pid]/status`.
    pub uid: u32,
    /// Cumulative utime + stime in clock ticks.
    pub cpu_ticks: u64,
    /// Resident set size in bytes (`VmRSS` kB * 1024).
    pub rss_bytes: u64,
}

/// Scans `/proc` for per-process samples.
pub struct ProcessCollector<F: FileSystem> {
    fs: F,
    proc_path: String,
}

impl<F: FileSystem> ProcessCollector<F> {
    /// Creates a new process collector.
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

    /// Collects one process.
    fn collect_process(&self, pid: u32) -> Result<ProcSample, CollectError> {
        let proc_dir = format!("{}/{}", self.proc_path, pid);

        let status_path = format!("{}/status", proc_dir);
        let status_content = self
            .fs
            .read_to_string(Path::new(&status_path))
            .map_err(|_| CollectError::ProcessGone(pid))?;
        let status = parse_proc_status(&status_content)
            .map_err(|e| CollectError::Parse(e.message.clone()))?;

        let stat_path = format!("{}/stat", proc_dir);
        let stat_content = self
            .fs
            .read_to_string(Path::new(&stat_path))
            .map_err(|_| CollectError::ProcessGone(pid))?;
        let stat =
            parse_proc_stat(&stat_content).map_err(|e| CollectError::Parse(e.message.clone()))?;

        Ok(ProcSample {
            pid,
            uid: status.uid,
            cpu_ticks: stat.utime + stat.stime,
            rss_bytes: status.vm_rss_kb * 1024,
        })
    }

    /// Scans all PID directories under the proc root.
    ///
    /// Processes that disappear during the scan are silently skipped; an
    /// unreadable proc root is an error.
    pub fn scan(&self) -> Result<Vec<ProcSample>, CollectError> {
        let proc_path = Path::new(&self.proc_path);
        let entries = self.fs.read_dir(proc_path)?;

        let mut samples = Vec::new();

        for entry in entries {
            if let Some(name) = entry.file_name().and_then(|n| n.to_str())
                && let Ok(pid) = name.parse::<u32>()
            {
                match self.collect_process(pid) {
                    Ok(sample) => samples.push(sample),
                    Err(CollectError::ProcessGone(_)) => {
                        // PID vanished mid-scan.
                        continue;
                    }
                    Err(e) => {
                        debug!("skipping process {}: {}", pid, e);
                    }
                }
            }
        }

        Ok(samples)
    }
}
