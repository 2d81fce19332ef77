//! Thin-clone module
//!
//! Thin-clone creation and garbage collection of the hidden base LUNs
//! thin clones depend on.

mod coordinator;
mod gc;

pub use coordinator::{ThinCloneAction, ThinCloneConfig, ThinCloneCoordinator};
pub use gc::{GcJob, GcStatus};
