//! Daemon configuration: defaults, file format, environment overrides,
//! validation, and the file watcher feeding hot reloads.

pub mod parser;
pub mod watcher;

use crate::cgroup::quota::Quota;
use crate::cgroup::reconciler::CgroupSettings;
use parser::{parse_bool, parse_config_content};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub use watcher::ConfigWatcher;

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/cpu-manager.conf";

/// Keys recognized in the configuration file; unknown keys are ignored.
/// Environment variables of the same name override file values.
const KNOWN_KEYS: &[&str] = &[
    "CGROUP_ROOT",
    "SCRIPT_CGROUP_BASE",
    "CREATED_CGROUPS_FILE",
    "POLLING_INTERVAL",
    "MIN_ACTIVE_TIME",
    "METRICS_CACHE_TTL",
    "CPU_THRESHOLD",
    "CPU_RELEASE_THRESHOLD",
    "CPU_QUOTA_NORMAL",
    "CPU_QUOTA_LIMITED",
    "MIN_SYSTEM_CORES",
    "SYSTEM_UID_MIN",
    "SYSTEM_UID_MAX",
    "IGNORE_SYSTEM_LOAD",
    "LOG_LEVEL",
    "LOG_FILE",
    "LOG_MAX_SIZE",
    "METRICS_LISTEN_ADDR",
    "METRICS_TLS_CERT",
    "METRICS_TLS_KEY",
    "METRICS_AUTH_TOKEN",
];

/// Error type for configuration failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.into(),
    }
}

/// Log verbosity, from `LOG_LEVEL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "DEBUG" => Some(LogLevel::Debug),
            "INFO" => Some(LogLevel::Info),
            "WARN" | "WARNING" => Some(LogLevel::Warn),
            "ERROR" => Some(LogLevel::Error),
            _ => None,
        }
    }

    /// The level as a tracing filter directive.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// The daemon configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Mount of the cgroup-v2 hierarchy.
    pub cgroup_root: PathBuf,
    /// Name of this daemon's subtree under the cgroup root.
    pub base_cgroup_name: String,
    /// Path of the tracking file.
    pub tracking_file: PathBuf,
    /// Seconds between control cycles (>= 5).
    pub poll_interval_s: u64,
    /// Minimum seconds limits stay active once engaged.
    pub min_active_time_s: u64,
    /// Max age of cached metrics, seconds.
    pub metrics_cache_ttl_s: u64,
    /// User CPU percent at which limits engage (1-100).
    pub activate_pct: f64,
    /// User CPU percent below which limits release (< activate_pct).
    pub release_pct: f64,
    /// `cpu.max` restored to legacy per-user cgroups on release.
    pub normal_cpu_quota: Quota,
    /// `cpu.max` for the legacy per-user limited mode.
    pub limited_cpu_quota: Quota,
    /// Cores withheld from the shared quota (>= 1).
    pub min_system_cores: u32,
    /// Inclusive non-system UID range.
    pub uid_min: u32,
    pub uid_max: u32,
    /// If true, `under_load` never gates decisions.
    pub ignore_system_load: bool,
    pub log_level: LogLevel,
    /// Log sink path; stdout when unset.
    pub log_file: Option<PathBuf>,
    /// Rotation threshold in bytes, handed to the rotation collaborator.
    pub log_max_size: u64,
    /// Exporter listen address; restart required to change.
    pub metrics_listen_addr: Option<String>,
    pub metrics_tls_cert: Option<PathBuf>,
    pub metrics_tls_key: Option<PathBuf>,
    pub metrics_auth_token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            base_cgroup_name: "cpu_manager".to_string(),
            tracking_file: PathBuf::from("/var/lib/cpu-manager/created_cgroups"),
            poll_interval_s: 10,
            min_active_time_s: 300,
            metrics_cache_ttl_s: 30,
            activate_pct: 75.0,
            release_pct: 40.0,
            normal_cpu_quota: Quota::Max { period_us: 100_000 },
            limited_cpu_quota: Quota::Limited {
                quota_us: 50_000,
                period_us: 100_000,
            },
            min_system_cores: 1,
            uid_min: 1000,
            uid_max: 60000,
            ignore_system_load: false,
            log_level: LogLevel::Info,
            log_file: None,
            log_max_size: 10 * 1024 * 1024,
            metrics_listen_addr: None,
            metrics_tls_cert: None,
            metrics_tls_key: None,
            metrics_auth_token: None,
        }
    }
}

impl Config {
    /// Loads the config from a file, with environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_content(&content, |key| std::env::var(key).ok())
    }

    /// Parses config content, applying `env` overrides for known keys.
    pub fn from_content(
        content: &str,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut pairs = parse_config_content(content);
        for key in KNOWN_KEYS {
            if let Some(value) = env(key) {
                pairs.insert(key.to_string(), value);
            }
        }
        Self::from_pairs(&pairs)
    }

    /// Builds a config from a key -> value map. Unknown keys are ignored;
    /// missing keys keep their defaults; every value is validated.
    pub fn from_pairs(pairs: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(v) = pairs.get("CGROUP_ROOT") {
            config.cgroup_root = PathBuf::from(v);
        }
        if let Some(v) = pairs.get("SCRIPT_CGROUP_BASE") {
            if v.is_empty() || v.contains('/') {
                return Err(invalid("SCRIPT_CGROUP_BASE", "must be a single path component"));
            }
            config.base_cgroup_name = v.clone();
        }
        if let Some(v) = pairs.get("CREATED_CGROUPS_FILE") {
            config.tracking_file = PathBuf::from(v);
        }

        if let Some(v) = pairs.get("POLLING_INTERVAL") {
            config.poll_interval_s = parse_u64("POLLING_INTERVAL", v)?;
        }
        if let Some(v) = pairs.get("MIN_ACTIVE_TIME") {
            config.min_active_time_s = parse_u64("MIN_ACTIVE_TIME", v)?;
        }
        if let Some(v) = pairs.get("METRICS_CACHE_TTL") {
            config.metrics_cache_ttl_s = parse_u64("METRICS_CACHE_TTL", v)?;
        }
        if let Some(v) = pairs.get("CPU_THRESHOLD") {
            config.activate_pct = parse_u64("CPU_THRESHOLD", v)? as f64;
        }
        if let Some(v) = pairs.get("CPU_RELEASE_THRESHOLD") {
            config.release_pct = parse_u64("CPU_RELEASE_THRESHOLD", v)? as f64;
        }
        if let Some(v) = pairs.get("CPU_QUOTA_NORMAL") {
            config.normal_cpu_quota = Quota::parse(v)
                .map_err(|e| invalid("CPU_QUOTA_NORMAL", e.to_string()))?;
        }
        if let Some(v) = pairs.get("CPU_QUOTA_LIMITED") {
            config.limited_cpu_quota = Quota::parse(v)
                .map_err(|e| invalid("CPU_QUOTA_LIMITED", e.to_string()))?;
        }
        if let Some(v) = pairs.get("MIN_SYSTEM_CORES") {
            config.min_system_cores = parse_u64("MIN_SYSTEM_CORES", v)? as u32;
        }
        if let Some(v) = pairs.get("SYSTEM_UID_MIN") {
            config.uid_min = parse_u64("SYSTEM_UID_MIN", v)? as u32;
        }
        if let Some(v) = pairs.get("SYSTEM_UID_MAX") {
            config.uid_max = parse_u64("SYSTEM_UID_MAX", v)? as u32;
        }
        if let Some(v) = pairs.get("IGNORE_SYSTEM_LOAD") {
            config.ignore_system_load = parse_bool(v)
                .ok_or_else(|| invalid("IGNORE_SYSTEM_LOAD", format!("not a boolean: {v:?}")))?;
        }
        if let Some(v) = pairs.get("LOG_LEVEL") {
            config.log_level = LogLevel::parse(v)
                .ok_or_else(|| invalid("LOG_LEVEL", format!("unknown level: {v:?}")))?;
        }
        if let Some(v) = pairs.get("LOG_FILE") {
            config.log_file = Some(PathBuf::from(v));
        }
        if let Some(v) = pairs.get("LOG_MAX_SIZE") {
            config.log_max_size = parse_u64("LOG_MAX_SIZE", v)?;
        }
        if let Some(v) = pairs.get("METRICS_LISTEN_ADDR") {
            config.metrics_listen_addr = Some(v.clone());
        }
        if let Some(v) = pairs.get("METRICS_TLS_CERT") {
            config.metrics_tls_cert = Some(PathBuf::from(v));
        }
        if let Some(v) = pairs.get("METRICS_TLS_KEY") {
            config.metrics_tls_key = Some(PathBuf::from(v));
        }
        if let Some(v) = pairs.get("METRICS_AUTH_TOKEN") {
            config.metrics_auth_token = Some(v.clone());
        }

        config.validate()?;
        Ok(config)
    }

    /// Range and consistency checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_s < 5 {
            return Err(invalid("POLLING_INTERVAL", "must be at least 5 seconds"));
        }
        if !(1.0..=100.0).contains(&self.activate_pct) {
            return Err(invalid("CPU_THRESHOLD", "must be between 1 and 100"));
        }
        if !(1.0..=100.0).contains(&self.release_pct) {
            return Err(invalid("CPU_RELEASE_THRESHOLD", "must be between 1 and 100"));
        }
        if self.activate_pct <= self.release_pct {
            return Err(invalid(
                "CPU_RELEASE_THRESHOLD",
                "must be below CPU_THRESHOLD",
            ));
        }
        if self.min_system_cores < 1 {
            return Err(invalid("MIN_SYSTEM_CORES", "must be at least 1"));
        }
        if self.uid_max < self.uid_min {
            return Err(invalid("SYSTEM_UID_MAX", "must be >= SYSTEM_UID_MIN"));
        }
        if self.log_max_size == 0 {
            return Err(invalid("LOG_MAX_SIZE", "must be positive"));
        }
        Ok(())
    }

    /// The reconciler's slice of this config.
    pub fn cgroup_settings(&self, proc_path: &str) -> CgroupSettings {
        CgroupSettings {
            cgroup_root: self.cgroup_root.clone(),
            base_name: self.base_cgroup_name.clone(),
            proc_path: proc_path.to_string(),
            normal_quota: self.normal_cpu_quota,
            min_system_cores: self.min_system_cores,
            tracking_file: self.tracking_file.clone(),
        }
    }

    /// Fields a live reload cannot change. Each differing field is
    /// reported and the change deferred until restart.
    pub fn restart_required_diffs(&self, new: &Config) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.metrics_listen_addr != new.metrics_listen_addr {
            fields.push("METRICS_LISTEN_ADDR");
        }
        if self.metrics_tls_cert != new.metrics_tls_cert
            || self.metrics_tls_key != new.metrics_tls_key
        {
            fields.push("METRICS_TLS_CERT/KEY");
        }
        if self.metrics_auth_token != new.metrics_auth_token {
            fields.push("METRICS_AUTH_TOKEN");
        }
        if self.log_file != new.log_file {
            fields.push("LOG_FILE");
        }
        fields
    }
}

fn parse_u64(key: &'static str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| invalid(key, format!("not an integer: {value:?}")))
}
