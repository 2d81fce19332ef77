//! Thin-clone lifecycle and garbage-collection coordinator
//!
//! Storage-array SDK subsystem that creates thin clones from LUNs and
//! snapshots, remembers which LUN depends on which hidden base LUN, and
//! deletes base LUNs in the background once no thin clone depends on them.
//!
//! # Architecture
//!
//! ```text
//! SDK resources ──notify──▶ ThinCloneCoordinator ──put──▶ RetryQueue
//!                                 │                          │
//!                          tc_cache / gc_candidates     delete-base job
//!                                 │                          │
//!                                 └──────▶ StorageArray ◀────┘
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - Infrastructure adapters implementing domain ports
//! - [`domain`] - Value objects and the storage array port
//! - [`error`] - Error types
//! - [`persist`] - Persistent map and durable retry queue
//! - [`thin_clone`] - The coordinator and its GC job

pub mod adapters;
pub mod domain;
pub mod error;
pub mod persist;
pub mod thin_clone;

// Re-export commonly used types
pub use domain::{CloneSource, Lun, Snap, StorageArray};
pub use error::{ArrayError, ArrayErrorKind, Error, Result};
pub use thin_clone::{GcJob, GcStatus, ThinCloneAction, ThinCloneConfig, ThinCloneCoordinator};
