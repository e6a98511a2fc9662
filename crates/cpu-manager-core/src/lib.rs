//! cpu-manager-core — shared library for the cpu-manager daemon.
//!
//! Provides:
//! - `fs` — filesystem abstraction over `/proc` and the cgroup-v2 tree
//! - `collector` — host and per-user CPU metrics collection
//! - `cgroup` — cgroup-v2 reconciler, quota grammar, tracking file
//! - `control` — hysteretic state machine, control loop, hot reload
//! - `config` — configuration parsing, validation, file watching
//! - `observe` — observability sink trait and bundled implementations

pub mod cgroup;
pub mod collector;
pub mod config;
pub mod control;
pub mod fs;
pub mod model;
pub mod observe;
