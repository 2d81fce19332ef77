//! Infrastructure Adapters
//!
//! Adapter implementations of the domain ports, following the Port/Adapter
//! (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │                 StorageArray (port trait)                        │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │                        InMemoryArray                             │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use thinclone::adapters::InMemoryArray;
//! use thinclone::domain::StorageArray;
//!
//! let array = InMemoryArray::new();
//! let lun = array.add_lun("vol-1");
//! let snap = array.create_snap(&lun.id, "snap-1", false).await?;
//! ```

mod in_memory;

pub use in_memory::{ArrayCall, ArrayOp, InMemoryArray};
