//! Host and per-user CPU metrics collection.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                       MetricsProbe                         │
//! │  ┌─────────────────────┐   ┌────────────────────────────┐  │
//! │  │  ProcessCollector   │   │      SystemCollector       │  │
//! │  │  - /proc/[pid]/stat │   │  - /proc/stat (CPU delta)  │  │
//! │  │  - /proc/[pid]/status│  │  - /proc/loadavg           │  │
//! │  └──────────┬──────────┘   │  - /proc/meminfo, cpuinfo  │  │
//! │             │              └──────────────┬─────────────┘  │
//! │             └──────────────┬──────────────┘                │
//! │                            │                               │
//! │                     ┌──────▼──────┐                        │
//! │                     │  FileSystem │ (trait)                │
//! │                     └─────────────┘                        │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! The probe caches snapshots for the configured TTL and aggregates
//! per-process samples into per-UID entries for the configured
//! non-system UID range.

pub mod probe;
pub mod procfs;

pub use probe::{MetricsProbe, ProbeError};
pub use procfs::{CollectError, ProcessCollector, SystemCollector, UserResolver};
