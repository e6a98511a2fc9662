//! The tracking file: the persisted projection of the tracked-user set.
//!
//! One line per created cgroup, `UID:<absolute path>`. Created cgroups are
//! appended; removals rewrite the whole file. A crash mid-rewrite is
//! recovered at the next start by discarding entries whose directory no
//! longer exists.

use crate::fs::FileSystem;
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Reads and writes the `UID:path` tracking file.
///
/// The reconciler is the only writer.
pub struct TrackingFile<F: FileSystem> {
    fs: F,
    path: PathBuf,
}

impl<F: FileSystem> TrackingFile<F> {
    /// Creates a handle for the tracking file at `path`.
    pub fn new(fs: F, path: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            path: path.into(),
        }
    }

    /// Path of the tracking file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads all entries. A missing file is an empty set; malformed lines
    /// are skipped with a warning.
    pub fn load(&self) -> Vec<(u32, PathBuf)> {
        let content = match self.fs.read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!("cannot read tracking file {:?}: {}", self.path, e);
                return Vec::new();
            }
        };

        let mut entries = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match line.split_once(':') {
                Some((uid, path)) if !path.is_empty() => match uid.parse::<u32>() {
                    Ok(uid) => entries.push((uid, PathBuf::from(path))),
                    Err(_) => warn!("skipping malformed tracking line: {}", line),
                },
                _ => warn!("skipping malformed tracking line: {}", line),
            }
        }
        entries
    }

    /// Loads the file, keeps only entries whose directory still exists,
    /// and rewrites the file to the surviving set.
    pub fn recover(&self) -> io::Result<Vec<(u32, PathBuf)>> {
        let entries = self.load();
        let surviving: Vec<(u32, PathBuf)> = entries
            .into_iter()
            .filter(|(_, path)| self.fs.exists(path))
            .collect();
        self.rewrite(&surviving)?;
        Ok(surviving)
    }

    /// Appends one entry for a freshly created cgroup.
    pub fn append(&self, uid: u32, path: &Path) -> io::Result<()> {
        self.fs
            .append_string(&self.path, &format!("{}:{}\n", uid, path.display()))
    }

    /// Removes the entry for `uid` with a full rewrite.
    pub fn remove(&self, uid: u32) -> io::Result<()> {
        let entries: Vec<(u32, PathBuf)> = self
            .load()
            .into_iter()
            .filter(|(entry_uid, _)| *entry_uid != uid)
            .collect();
        self.rewrite(&entries)
    }

    /// Truncates the file to the given set.
    pub fn rewrite(&self, entries: &[(u32, PathBuf)]) -> io::Result<()> {
        let mut content = String::new();
        for (uid, path) in entries {
            content.push_str(&format!("{}:{}\n", uid, path.display()));
        }
        self.fs.write_string(&self.path, &content)
    }

    /// Truncates the file to empty, as shutdown does.
    pub fn clear(&self) -> io::Result<()> {
        self.fs.write_string(&self.path, "")
    }
}
