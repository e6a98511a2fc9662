//! Abstractions for filesystem access to enable testing and mocking.
//!
//! The `FileSystem` trait lets the metrics collectors and the cgroup
//! reconciler run against the real `/proc` and cgroup filesystems in
//! production, and against an in-memory mock in tests and CI.

pub mod mock;

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub use mock::MockFs;

/// Abstraction for filesystem operations.
///
/// Collectors only read; the cgroup reconciler also writes. Both run
/// through this trait so the whole control plane can be exercised against
/// `MockFs`.
pub trait FileSystem: Send + Sync {
    /// Reads the entire contents of a file as a string.
    fn read_to_string(&self, path: &Path) -> io::Result<String>;

    /// Writes `content` to a file, replacing whatever was there.
    ///
    /// Cgroup control files reject writes with `EACCES`/`EBUSY` under
    /// delegation races; callers decide whether to retry.
    fn write_string(&self, path: &Path, content: &str) -> io::Result<()>;

    /// Appends `content` to a file, creating it if missing.
    fn append_string(&self, path: &Path, content: &str) -> io::Result<()>;

    /// Checks if a path exists.
    fn exists(&self, path: &Path) -> bool;

    /// Lists entries in a directory.
    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>>;

    /// Creates a directory and any missing parents.
    fn create_dir(&self, path: &Path) -> io::Result<()>;

    /// Removes an empty directory.
    ///
    /// Cgroup directories refuse removal while they still hold processes.
    fn remove_dir(&self, path: &Path) -> io::Result<()>;

    /// Core count as reported by the OS, if the environment exposes one.
    ///
    /// `None` sends callers to the `/proc/cpuinfo` fallback.
    fn os_core_count(&self) -> Option<u32> {
        None
    }
}

/// Real filesystem implementation that delegates to `std::fs`.
///
/// Use this in production to touch the actual `/proc` and cgroup trees.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealFs;

impl RealFs {
    /// Creates a new `RealFs` instance.
    pub fn new() -> Self {
        Self
    }
}

impl FileSystem for RealFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn write_string(&self, path: &Path, content: &str) -> io::Result<()> {
        std::fs::write(path, content)
    }

    fn append_string(&self, path: &Path, content: &str) -> io::Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(content.as_bytes())
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let entries = std::fs::read_dir(path)?;
        let mut paths = Vec::new();
        for entry in entries {
            paths.push(entry?.path());
        }
        Ok(paths)
    }

    fn create_dir(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(path)
    }

    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_dir(path)
    }

    fn os_core_count(&self) -> Option<u32> {
        std::thread::available_parallelism()
            .ok()
            .map(|n| n.get() as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn real_fs_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let fs = RealFs::new();
        let file = dir.path().join("cpu.max");

        fs.write_string(&file, "max 100000\n").unwrap();
        assert!(fs.exists(&file));
        assert_eq!(fs.read_to_string(&file).unwrap(), "max 100000\n");

        fs.append_string(&file, "extra\n").unwrap();
        assert_eq!(fs.read_to_string(&file).unwrap(), "max 100000\nextra\n");
    }

    #[test]
    fn real_fs_create_and_remove_dir() {
        let dir = tempfile::tempdir().unwrap();
        let fs = RealFs::new();
        let nested = dir.path().join("limited/user_1001");

        fs.create_dir(&nested).unwrap();
        assert!(fs.exists(&nested));

        fs.remove_dir(&nested).unwrap();
        assert!(!fs.exists(&nested));
    }

    #[test]
    fn real_fs_read_dir() {
        let dir = tempfile::tempdir().unwrap();
        let fs = RealFs::new();
        fs.write_string(&dir.path().join("a"), "1").unwrap();
        fs.write_string(&dir.path().join("b"), "2").unwrap();

        let entries = fs.read_dir(dir.path()).unwrap();
        assert_eq!(entries.len(), 2);
    }
}
