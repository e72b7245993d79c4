//! Worker tasks with cooperative cancellation and forced termination.
//!
//! - `state`: task state machine (Created → Running → Completed/Cancelled/Killed)
//! - `kill`: kill switch that closes a hung worker's connection
//! - `cancellable`: `CancellableTask` handle and its shared `TaskControl`
//! - `registry`: name → task map enforcing one worker per account

pub mod cancellable;
pub mod kill;
pub mod registry;
pub mod state;

pub use cancellable::{CancellableTask, TaskControl};
pub use kill::{Interrupt, KillSwitch};
pub use registry::TaskRegistry;
pub use state::{TaskSnapshot, TaskState};
