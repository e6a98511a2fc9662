//! cpu-managerd - fair CPU sharing daemon.
//!
//! Watches aggregate user CPU consumption and, past a configured ceiling,
//! confines every non-system user under one shared cgroup-v2 subtree with
//! an absolute bandwidth cap. Idle users yield to busy peers inside the
//! subtree through proportional weights. Limits release once load falls
//! below the release ceiling and the minimum active time has passed.

use tikv_jemallocator::Jemalloc;
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use nix::sys::signal::{SigSet, Signal};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

use cpu_manager_core::cgroup::reconciler::CgroupReconciler;
use cpu_manager_core::collector::probe::MetricsProbe;
use cpu_manager_core::config::{Config, ConfigError, ConfigWatcher, DEFAULT_CONFIG_PATH};
use cpu_manager_core::control::{ControlEvent, Controller, Reloader};
use cpu_manager_core::fs::RealFs;
use cpu_manager_core::observe::LogSink;

/// Proc filesystem root.
const PROC_PATH: &str = "/proc";

/// Grace period between a shutdown signal and a forced exit.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// Fair CPU sharing daemon for interactive users.
#[derive(Parser, Debug)]
#[command(
    name = "cpu-managerd",
    about = "Fair CPU sharing daemon for interactive users",
    version
)]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,
}

/// Loads the configuration.
///
/// A missing file is fatal when the path was given explicitly; the
/// default path is allowed to be absent, in which case built-in defaults
/// (still subject to environment overrides) apply.
fn load_config(path: &Path, explicit: bool) -> Result<Config, ConfigError> {
    if path.exists() {
        return Config::load(path);
    }
    if explicit {
        return Err(ConfigError::Io {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        });
    }
    Config::from_content("", |key| std::env::var(key).ok())
}

type LevelHandle = reload::Handle<EnvFilter, Registry>;

/// Initializes the tracing subscriber.
///
/// The level filter sits behind a reload handle so `LOG_LEVEL` changes
/// apply live; the sink (stdout or `LOG_FILE`) is fixed for the life of
/// the process, and rotation belongs to the log rotation collaborator.
fn init_logging(config: &Config) -> LevelHandle {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_filter()));
    let (filter, handle) = reload::Layer::new(filter);
    let registry = tracing_subscriber::registry().with(filter);

    let log_file = config.log_file.as_ref().and_then(|path| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| eprintln!("cpu-managerd: cannot open log file {:?}: {}", path, e))
            .ok()
    });

    match log_file {
        Some(file) => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(Arc::new(file)),
            )
            .init(),
        None => registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init(),
    }
    handle
}

/// Blocks the handled signals on the calling thread. Every thread spawned
/// afterwards inherits the mask, so only the listener ever takes them.
fn block_signals() -> nix::Result<SigSet> {
    let mut sigset = SigSet::empty();
    sigset.add(Signal::SIGHUP);
    sigset.add(Signal::SIGINT);
    sigset.add(Signal::SIGTERM);
    sigset.thread_block()?;
    Ok(sigset)
}

/// Listens for signals and publishes control events.
///
/// SIGHUP forces a config reread; SIGINT and SIGTERM start a graceful
/// shutdown backed by a forced-exit watchdog.
fn spawn_signal_listener(sigset: SigSet, tx: Sender<ControlEvent>, running: Arc<AtomicBool>) {
    std::thread::spawn(move || {
        let mut watchdog_armed = false;
        loop {
            match sigset.wait() {
                Ok(Signal::SIGHUP) => {
                    info!("received SIGHUP, scheduling config reload");
                    if tx.send(ControlEvent::Reload).is_err() {
                        return;
                    }
                }
                Ok(signal) => {
                    info!("received {}, shutting down", signal);
                    running.store(false, Ordering::SeqCst);
                    if !watchdog_armed {
                        watchdog_armed = true;
                        std::thread::spawn(|| {
                            std::thread::sleep(SHUTDOWN_DEADLINE);
                            eprintln!(
                                "cpu-managerd: shutdown did not finish within {}s, forcing exit",
                                SHUTDOWN_DEADLINE.as_secs()
                            );
                            std::process::exit(2);
                        });
                    }
                    if tx.send(ControlEvent::Shutdown).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    error!("signal wait failed: {}", e);
                    return;
                }
            }
        }
    });
}

fn main() {
    let args = Args::parse();
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let config = match load_config(&config_path, args.config.is_some()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("cpu-managerd: {}", e);
            std::process::exit(1);
        }
    };

    let level_handle = init_logging(&config);

    info!("cpu-managerd {} starting", env!("CARGO_PKG_VERSION"));
    info!(
        "config: interval={}s threshold={:.0}% release={:.0}% min_active={}s uids={}-{} cgroup={:?}",
        config.poll_interval_s,
        config.activate_pct,
        config.release_pct,
        config.min_active_time_s,
        config.uid_min,
        config.uid_max,
        config.cgroup_root.join(&config.base_cgroup_name),
    );

    let running = Arc::new(AtomicBool::new(true));
    let fs = RealFs::new();

    let reconciler = CgroupReconciler::new(
        fs,
        config.cgroup_settings(PROC_PATH),
        Arc::clone(&running),
    );
    if let Err(e) = reconciler.prepare() {
        error!("cannot prepare cgroup hierarchy: {}", e);
        std::process::exit(1);
    }

    let probe = MetricsProbe::new(fs, PROC_PATH, config.uid_min, config.uid_max)
        .with_cache_ttl(Duration::from_secs(config.metrics_cache_ttl_s));

    let (tx, rx) = mpsc::channel();

    match block_signals() {
        Ok(sigset) => spawn_signal_listener(sigset, tx.clone(), Arc::clone(&running)),
        Err(e) => warn!("cannot install signal handling: {}", e),
    }

    // Keep the watcher alive for the life of the controller.
    let _watcher = match ConfigWatcher::spawn(config_path.clone(), tx.clone()) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            warn!("config file watching disabled: {}", e);
            None
        }
    };

    let reloader = Reloader::new(config_path, PROC_PATH);
    let mut controller = Controller::new(
        config,
        reloader,
        probe,
        reconciler,
        LogSink::new(),
        rx,
        Arc::clone(&running),
    )
    .with_reload_hook(move |config: &Config| {
        let filter = EnvFilter::new(config.log_level.as_filter());
        if let Err(e) = level_handle.reload(filter) {
            warn!("cannot apply reloaded log level: {}", e);
        }
    });

    controller.run();
    info!("cpu-managerd exited cleanly");
}
