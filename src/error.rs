//! Error types for the thin-clone coordinator

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the thin-clone coordinator
#[derive(Error, Debug)]
pub enum Error {
    /// Error reported by the storage array
    #[error("Array error: {0}")]
    Array(#[from] ArrayError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Persistent store could not be read or written
    #[error("Persistence error at {}: {reason}", path.display())]
    Persistence { path: PathBuf, reason: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// The array error carried by this error, if any.
    pub fn array_error(&self) -> Option<&ArrayError> {
        match self {
            Error::Array(e) => Some(e),
            _ => None,
        }
    }

    /// Classification of the carried array error, if any.
    pub fn array_kind(&self) -> Option<ArrayErrorKind> {
        self.array_error().map(ArrayError::kind)
    }
}

// =============================================================================
// Array Errors
// =============================================================================

/// Array error code: the thin-clone family has reached its size limit.
pub const CODE_THIN_CLONE_LIMIT_EXCEEDED: u32 = 108_007_744;

/// Array error code: the base LUN still has thin clones depending on it.
pub const CODE_BASE_HAS_THIN_CLONE: u32 = 108_007_864;

/// Array error code: the snapshot backing the base is still being destroyed.
pub const CODE_SNAP_IS_DESTROYING: u32 = 100_666_142;

/// Array error code: the resource does not exist.
pub const CODE_RESOURCE_NOT_FOUND: u32 = 131_149_829;

/// Classification of array error codes the coordinator reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArrayErrorKind {
    ThinCloneLimitExceeded,
    BaseHasThinClone,
    SnapIsDestroying,
    ResourceNotFound,
    Other,
}

impl ArrayErrorKind {
    /// Classify a numeric array error code.
    pub fn from_code(code: u32) -> Self {
        match code {
            CODE_THIN_CLONE_LIMIT_EXCEEDED => ArrayErrorKind::ThinCloneLimitExceeded,
            CODE_BASE_HAS_THIN_CLONE => ArrayErrorKind::BaseHasThinClone,
            CODE_SNAP_IS_DESTROYING => ArrayErrorKind::SnapIsDestroying,
            CODE_RESOURCE_NOT_FOUND => ArrayErrorKind::ResourceNotFound,
            _ => ArrayErrorKind::Other,
        }
    }

    /// Whether this condition only means "not yet safe to delete the base".
    pub fn is_deferrable(self) -> bool {
        matches!(
            self,
            ArrayErrorKind::BaseHasThinClone | ArrayErrorKind::SnapIsDestroying
        )
    }
}

impl std::fmt::Display for ArrayErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArrayErrorKind::ThinCloneLimitExceeded => write!(f, "ThinCloneLimitExceeded"),
            ArrayErrorKind::BaseHasThinClone => write!(f, "BaseHasThinClone"),
            ArrayErrorKind::SnapIsDestroying => write!(f, "SnapIsDestroying"),
            ArrayErrorKind::ResourceNotFound => write!(f, "ResourceNotFound"),
            ArrayErrorKind::Other => write!(f, "Other"),
        }
    }
}

/// Typed error derived from the array's numeric error code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("[{code}] {message}")]
pub struct ArrayError {
    pub code: u32,
    pub message: String,
}

impl ArrayError {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ArrayErrorKind {
        ArrayErrorKind::from_code(self.code)
    }

    pub fn thin_clone_limit_exceeded(lun_id: &str) -> Self {
        Self::new(
            CODE_THIN_CLONE_LIMIT_EXCEEDED,
            format!("thin clone limit exceeded for family of {}", lun_id),
        )
    }

    pub fn base_has_thin_clone(lun_id: &str) -> Self {
        Self::new(
            CODE_BASE_HAS_THIN_CLONE,
            format!("base lun {} still has thin clones", lun_id),
        )
    }

    pub fn snap_is_destroying(lun_id: &str) -> Self {
        Self::new(
            CODE_SNAP_IS_DESTROYING,
            format!("snapshot of {} is being destroyed", lun_id),
        )
    }

    pub fn not_found(resource_id: &str) -> Self {
        Self::new(
            CODE_RESOURCE_NOT_FOUND,
            format!("resource {} does not exist", resource_id),
        )
    }
}
