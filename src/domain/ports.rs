//! Domain Ports (DDD Port/Adapter Pattern)
//!
//! This module defines the value objects the coordinator works with and the
//! single port it depends on: the storage array. The REST transport behind
//! the port is an adapter concern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Domain Layer                            │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │         Lun │ Snap │ CloneSource │ StorageArray      │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │        REST client │ InMemoryArray (tests, simulation)       │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ArrayError;

// =============================================================================
// Value Objects
// =============================================================================

/// Reference to a LUN (volume) on the array.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Lun {
    /// Array-assigned identifier, e.g. `sv_12`
    pub id: String,
    /// Display name
    pub name: String,
    /// Whether the array created this LUN as a thin clone
    #[serde(default)]
    pub is_thin_clone: bool,
    /// Base LUN of the thin-clone family, as last reported by the array
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family_base_lun_id: Option<String>,
}

impl Lun {
    /// Create a reference to a plain (non thin-clone) LUN.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            is_thin_clone: false,
            family_base_lun_id: None,
        }
    }

    /// Create a reference to a thin clone of `base_id`.
    pub fn thin_clone_of(
        id: impl Into<String>,
        name: impl Into<String>,
        base_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            is_thin_clone: true,
            family_base_lun_id: Some(base_id.into()),
        }
    }
}

impl std::fmt::Display for Lun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name, self.id)
    }
}

/// Reference to a snapshot of a LUN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snap {
    pub id: String,
    pub name: String,
    /// The LUN this snapshot belongs to
    pub lun: Lun,
}

impl Snap {
    pub fn new(id: impl Into<String>, name: impl Into<String>, lun: Lun) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            lun,
        }
    }
}

/// What a thin clone is created from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloneSource {
    Lun(Lun),
    Snap(Snap),
}

impl CloneSource {
    pub fn id(&self) -> &str {
        match self {
            CloneSource::Lun(lun) => &lun.id,
            CloneSource::Snap(snap) => &snap.id,
        }
    }

    /// Split into the LUN to clone from and the caller-designated snapshot.
    pub fn into_parts(self) -> (Lun, Option<Snap>) {
        match self {
            CloneSource::Lun(lun) => (lun, None),
            CloneSource::Snap(snap) => (snap.lun.clone(), Some(snap)),
        }
    }
}

impl From<Lun> for CloneSource {
    fn from(lun: Lun) -> Self {
        CloneSource::Lun(lun)
    }
}

impl From<Snap> for CloneSource {
    fn from(snap: Snap) -> Self {
        CloneSource::Snap(snap)
    }
}

/// Body of the array's create-thin-clone action.
///
/// Empty optional fields are left out of the serialized body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThinCloneRequest {
    /// Snapshot the clone shares storage with
    pub snap_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub io_limit_policy: Option<String>,
}

// =============================================================================
// Storage Array Port
// =============================================================================

/// Result of a single array call.
pub type ArrayResult<T> = std::result::Result<T, ArrayError>;

/// Port for the storage-array operations the coordinator needs.
///
/// Implementations translate array responses into [`ArrayError`]s carrying
/// the array's numeric error code.
#[async_trait]
pub trait StorageArray: Send + Sync {
    /// Fetch a LUN by id.
    async fn get_lun(&self, lun_id: &str) -> ArrayResult<Lun>;

    /// Number of live thin clones depending on the given base LUN.
    async fn family_clone_count(&self, lun_id: &str) -> ArrayResult<u32>;

    /// Snapshot a LUN.
    async fn create_snap(&self, lun_id: &str, name: &str, is_auto_delete: bool)
        -> ArrayResult<Snap>;

    /// Delete a snapshot.
    async fn delete_snap(&self, snap_id: &str) -> ArrayResult<()>;

    /// Create a thin clone of `lun_id`, returning the new LUN's id.
    async fn create_thin_clone(&self, lun_id: &str, request: &ThinCloneRequest)
        -> ArrayResult<String>;

    /// Delete a LUN.
    async fn delete_lun(&self, lun_id: &str) -> ArrayResult<()>;

    /// Attach a LUN to a host.
    async fn attach_lun(&self, lun_id: &str, host_id: &str) -> ArrayResult<()>;
}

// =============================================================================
// Tests
// =============================================================================
