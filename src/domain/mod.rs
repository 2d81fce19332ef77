//! Domain Layer
//!
//! Value objects for array resources and the port the coordinator talks to
//! the array through.
//!
//! # Usage
//!
//! ```ignore
//! use thinclone::domain::{CloneSource, Lun, StorageArray};
//!
//! async fn clone_count<A: StorageArray>(array: &A, base: &Lun) -> u32 {
//!     array.family_clone_count(&base.id).await.unwrap_or(0)
//! }
//! ```

pub mod ports;

pub use ports::{ArrayResult, CloneSource, Lun, Snap, StorageArray, ThinCloneRequest};
