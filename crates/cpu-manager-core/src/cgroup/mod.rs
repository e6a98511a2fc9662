//! cgroup-v2 enforcement: quota grammar, tracking file, reconciler.
//!
//! The reconciler owns every write under the daemon's base cgroup. It
//! projects the state machine's decisions onto the kernel idempotently;
//! nothing else in the process touches that subtree.

pub mod quota;
pub mod reconciler;
pub mod tracking;

pub use quota::{Quota, QuotaError};
pub use reconciler::{CgroupReconciler, CgroupSettings, CgroupStat, ReconcileError, Report, SetupError};
pub use tracking::TrackingFile;
