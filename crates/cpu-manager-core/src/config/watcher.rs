//! Config file watcher.
//!
//! Watches the configuration file's parent directory through filesystem
//! notifications and coalesces bursts (editors write, rename and chmod in
//! quick succession) into a single reload event on the control channel.
//! A manual SIGHUP reload enters the same channel without the debounce.

use crate::control::ControlEvent;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Debounce window for bursts of file notifications.
const DEBOUNCE_WINDOW: Duration = Duration::from_secs(2);

/// Watches a config file and emits [`ControlEvent::Reload`].
///
/// Dropping the watcher stops the notification stream and ends the
/// debounce thread.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    /// Starts watching `config_path`, sending reload events to `tx`.
    pub fn spawn(config_path: PathBuf, tx: Sender<ControlEvent>) -> notify::Result<Self> {
        Self::spawn_with_debounce(config_path, tx, DEBOUNCE_WINDOW)
    }

    /// Starts watching with an explicit debounce window.
    pub fn spawn_with_debounce(
        config_path: PathBuf,
        tx: Sender<ControlEvent>,
        debounce: Duration,
    ) -> notify::Result<Self> {
        // Watch the parent directory: editors replace files by rename,
        // which would silently detach a watch on the file itself.
        let parent = match config_path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let file_name: OsString = config_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();

        let (raw_tx, raw_rx) = mpsc::channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = raw_tx.send(res);
        })?;
        watcher.watch(&parent, RecursiveMode::NonRecursive)?;

        std::thread::spawn(move || {
            debounce_loop(&raw_rx, &file_name, debounce, &tx);
            debug!("config watcher thread exiting");
        });

        Ok(Self { _watcher: watcher })
    }
}

fn debounce_loop(
    raw_rx: &mpsc::Receiver<notify::Result<Event>>,
    file_name: &OsString,
    debounce: Duration,
    tx: &Sender<ControlEvent>,
) {
    loop {
        let event = match raw_rx.recv() {
            Ok(Ok(event)) => event,
            Ok(Err(e)) => {
                warn!("config watch error: {}", e);
                continue;
            }
            Err(_) => return,
        };
        if !is_relevant(&event, file_name) {
            continue;
        }

        // Swallow the rest of the burst.
        let deadline = Instant::now() + debounce;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match raw_rx.recv_timeout(remaining) {
                Ok(_) => continue,
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        debug!("config file changed, requesting reload");
        if tx.send(ControlEvent::Reload).is_err() {
            return;
        }
    }
}

/// Write, create, rename and remove touch the config; reads do not.
fn is_relevant(event: &Event, file_name: &OsString) -> bool {
    if matches!(event.kind, EventKind::Access(_)) {
        return false;
    }
    event
        .paths
        .iter()
        .any(|p| p.file_name().is_some_and(|n| n == file_name.as_os_str()))
}
