//! The control plane: hysteretic state machine, control loop, hot reload.

pub mod controller;
pub mod reload;
pub mod state_machine;

pub use controller::Controller;
pub use reload::{ReloadOutcome, Reloader};
pub use state_machine::StateMachine;

/// Out-of-band events the control loop selects on between cycles.
///
/// Produced by the signal listener and the config watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    /// Reread the configuration before the next cycle.
    Reload,
    /// Finish the current cycle, deactivate, and exit.
    Shutdown,
}
