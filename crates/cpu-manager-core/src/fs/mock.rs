//! In-memory mock filesystem for testing without real `/proc` or cgroups.
//!
//! `MockFs` simulates both read-side (`/proc` scans) and write-side (cgroup
//! control files) behavior in memory, so the whole control plane can run in
//! tests on any platform. Clones share state through an `Arc`, which is what
//! lets background placement tasks and test assertions observe the same
//! tree.

use crate::fs::FileSystem;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct MockFsInner {
    /// Map from path to file contents.
    files: HashMap<PathBuf, String>,
    /// Queued contents per path; successive reads pop until one remains.
    sequences: HashMap<PathBuf, VecDeque<String>>,
    /// Set of directories (for read_dir support).
    directories: HashSet<PathBuf>,
    /// Paths whose next N writes fail with `PermissionDenied`.
    denied_writes: HashMap<PathBuf, u32>,
    /// Directories whose next N removals fail with "device or resource busy".
    busy_removals: HashMap<PathBuf, u32>,
    /// Every write and append performed, in order.
    write_log: Vec<(PathBuf, String)>,
    /// Core count the "OS" reports, when set.
    os_cores: Option<u32>,
    /// Files whose content ignores writes, as a kernel clamping a value.
    pinned: HashSet<PathBuf>,
}

/// In-memory filesystem for testing.
///
/// Stores files and directories in memory, and records every write so tests
/// can assert on exactly what the reconciler touched. Failure injection
/// covers the two races the cgroup filesystem is known for: transiently
/// rejected writes and busy directory removal.
#[derive(Debug, Clone, Default)]
pub struct MockFs {
    inner: Arc<Mutex<MockFsInner>>,
}

impl MockFs {
    /// Creates a new empty mock filesystem.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a file with the given content.
    ///
    /// Parent directories are automatically created.
    pub fn add_file(&self, path: impl AsRef<Path>, content: impl Into<String>) {
        let mut inner = self.inner.lock().unwrap();
        let path = path.as_ref().to_path_buf();
        add_parents(&mut inner.directories, &path);
        inner.files.insert(path, content.into());
    }

    /// Queues successive contents for a path.
    ///
    /// Each read pops the next entry until one remains, which is then
    /// returned forever. Used to simulate `/proc/stat` advancing between
    /// the two halves of a CPU delta sample.
    pub fn add_file_sequence<I, S>(&self, path: impl AsRef<Path>, contents: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut inner = self.inner.lock().unwrap();
        let path = path.as_ref().to_path_buf();
        add_parents(&mut inner.directories, &path);
        let queue: VecDeque<String> = contents.into_iter().map(Into::into).collect();
        if let Some(last) = queue.back() {
            inner.files.insert(path.clone(), last.clone());
        }
        inner.sequences.insert(path, queue);
    }

    /// Adds an empty directory (parents included).
    pub fn add_dir(&self, path: impl AsRef<Path>) {
        let mut inner = self.inner.lock().unwrap();
        let path = path.as_ref().to_path_buf();
        inner.directories.insert(path.clone());
        add_parents(&mut inner.directories, &path);
    }

    /// Removes a file, as the kernel does when a PID vanishes mid-scan.
    pub fn remove_file(&self, path: impl AsRef<Path>) {
        let mut inner = self.inner.lock().unwrap();
        inner.files.remove(path.as_ref());
        inner.sequences.remove(path.as_ref());
    }

    /// Makes the next `count` writes to `path` fail with `PermissionDenied`.
    pub fn deny_writes(&self, path: impl AsRef<Path>, count: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .denied_writes
            .insert(path.as_ref().to_path_buf(), count);
    }

    /// Makes the next `count` removals of `path` fail as busy.
    pub fn deny_removals(&self, path: impl AsRef<Path>, count: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .busy_removals
            .insert(path.as_ref().to_path_buf(), count);
    }

    /// Returns every write and append performed so far, in order.
    pub fn write_log(&self) -> Vec<(PathBuf, String)> {
        self.inner.lock().unwrap().write_log.clone()
    }

    /// Makes `os_core_count` report a value instead of deferring to the
    /// cpuinfo fallback.
    pub fn set_os_core_count(&self, cores: u32) {
        self.inner.lock().unwrap().os_cores = Some(cores);
    }

    /// Pins a file to its current content: writes are accepted (and
    /// logged) but do not change what reads return. Models a kernel
    /// clamping a control-file value.
    pub fn pin_file(&self, path: impl AsRef<Path>, content: impl Into<String>) {
        let mut inner = self.inner.lock().unwrap();
        let path = path.as_ref().to_path_buf();
        add_parents(&mut inner.directories, &path);
        inner.files.insert(path.clone(), content.into());
        inner.pinned.insert(path);
    }

    /// Adds a process under `<proc_path>/<pid>/` with `status` and `stat`
    /// files synthesized from the given identity and CPU tick counters.
    pub fn add_process(
        &self,
        proc_path: &str,
        pid: u32,
        uid: u32,
        name: &str,
        utime: u64,
        stime: u64,
        vm_rss_kb: u64,
    ) {
        let base = PathBuf::from(format!("{}/{}", proc_path, pid));
        self.add_dir(&base);
        self.add_file(
            base.join("status"),
            format!(
                "Name:\t{name}\nPid:\t{pid}\nPPid:\t1\nUid:\t{uid}\t{uid}\t{uid}\t{uid}\nGid:\t{uid}\t{uid}\t{uid}\t{uid}\nVmRSS:\t{vm_rss_kb} kB\n"
            ),
        );
        self.add_file(
            base.join("stat"),
            format!(
                "{pid} ({name}) S 1 {pid} {pid} 0 -1 4194304 100 0 0 0 {utime} {stime} 0 0 20 0 1 0 100 10000000 256 18446744073709551615 0 0 0 0 0 0 0 0 0 0 0 0 17 0 0 0 0 0 0 0 0 0 0 0 0 0 0"
            ),
        );
    }

    /// Populates the host-wide `/proc` files every probe sample reads.
    pub fn add_host_files(
        &self,
        proc_path: &str,
        cores: u32,
        load1: f64,
        cpu_line: &str,
    ) {
        self.add_file(
            format!("{}/loadavg", proc_path),
            format!("{load1:.2} 0.40 0.30 1/200 12345\n"),
        );
        self.add_file(
            format!("{}/meminfo", proc_path),
            "MemTotal:       16384000 kB\nMemFree:         4096000 kB\nMemAvailable:    8192000 kB\n",
        );
        let mut cpuinfo = String::new();
        for i in 0..cores {
            cpuinfo.push_str(&format!("processor\t: {i}\nmodel name\t: mock cpu\n\n"));
        }
        self.add_file(format!("{}/cpuinfo", proc_path), cpuinfo);
        self.add_file(format!("{}/stat", proc_path), format!("{cpu_line}\n"));
    }

    /// Lays out an empty cgroup-v2 root with all controllers available.
    pub fn add_cgroup_root(&self, root: &str) {
        self.add_dir(root);
        self.add_file(
            format!("{}/cgroup.controllers", root),
            "cpuset cpu io memory pids\n",
        );
        self.add_file(format!("{}/cgroup.subtree_control", root), "\n");
        self.add_file(format!("{}/cgroup.procs", root), "");
    }
}

fn add_parents(directories: &mut HashSet<PathBuf>, path: &Path) {
    let mut parent = path.parent();
    while let Some(p) = parent {
        if !p.as_os_str().is_empty() {
            directories.insert(p.to_path_buf());
        }
        parent = p.parent();
    }
}

impl FileSystem for MockFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        let mut inner = self.inner.lock().unwrap();
        let queued = match inner.sequences.get_mut(path) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        };
        if let Some(content) = queued {
            inner.files.insert(path.to_path_buf(), content.clone());
            return Ok(content);
        }
        inner.files.get(path).cloned().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("file not found: {:?}", path),
            )
        })
    }

    fn write_string(&self, path: &Path, content: &str) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(count) = inner.denied_writes.get_mut(path) {
            if *count > 0 {
                *count -= 1;
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    format!("write denied: {:?}", path),
                ));
            }
        }
        inner
            .write_log
            .push((path.to_path_buf(), content.to_string()));
        let path = path.to_path_buf();
        if inner.pinned.contains(&path) {
            return Ok(());
        }
        add_parents(&mut inner.directories, &path);
        inner.sequences.remove(&path);
        inner.files.insert(path, content.to_string());
        Ok(())
    }

    fn append_string(&self, path: &Path, content: &str) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .write_log
            .push((path.to_path_buf(), content.to_string()));
        let path = path.to_path_buf();
        add_parents(&mut inner.directories, &path);
        inner.files.entry(path).or_default().push_str(content);
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.files.contains_key(path) || inner.directories.contains(path)
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let inner = self.inner.lock().unwrap();
        if !inner.directories.contains(path) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("directory not found: {:?}", path),
            ));
        }

        let mut entries = HashSet::new();
        for file_path in inner.files.keys() {
            if file_path.parent().is_some_and(|parent| parent == path) {
                entries.insert(file_path.clone());
            }
        }
        for dir_path in &inner.directories {
            if dir_path.parent().is_some_and(|parent| parent == path) && dir_path != path {
                entries.insert(dir_path.clone());
            }
        }

        Ok(entries.into_iter().collect())
    }

    fn create_dir(&self, path: &Path) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let path = path.to_path_buf();
        inner.directories.insert(path.clone());
        add_parents(&mut inner.directories, &path);
        Ok(())
    }

    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(count) = inner.busy_removals.get_mut(path) {
            if *count > 0 {
                *count -= 1;
                return Err(io::Error::new(
                    io::ErrorKind::ResourceBusy,
                    format!("device or resource busy: {:?}", path),
                ));
            }
        }
        if !inner.directories.contains(path) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("directory not found: {:?}", path),
            ));
        }
        // Subdirectories block removal; plain files go with the directory,
        // the way cgroup control files vanish with their cgroup.
        let has_subdir = inner
            .directories
            .iter()
            .any(|d| d.parent().is_some_and(|parent| parent == path));
        if has_subdir {
            return Err(io::Error::new(
                io::ErrorKind::DirectoryNotEmpty,
                format!("directory not empty: {:?}", path),
            ));
        }
        inner.directories.remove(path);
        inner
            .files
            .retain(|p, _| !p.parent().is_some_and(|parent| parent == path));
        Ok(())
    }

    fn os_core_count(&self) -> Option<u32> {
        self.inner.lock().unwrap().os_cores
    }
}
