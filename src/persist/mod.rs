//! Persistence
//!
//! On-disk building blocks the coordinator binds to at set-up time:
//!
//! - [`PersistentMap`] - thread-safe string-keyed map flushed to a JSON file
//! - [`RetryQueue`] - durable job queue drained by a background task
//!
//! Both write through a temp file and an atomic rename, so a crash leaves
//! either the previous or the new contents on disk, never a torn file.

mod map;
mod queue;

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

pub use map::PersistentMap;
pub use queue::{DrainReport, JobOutcome, JobRunner, QueuedJob, RetryQueue, RetryQueueConfig};

/// Serialize `value` as JSON and atomically replace `path` with it.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| persistence_error(parent, e))?;
    }

    let tmp = path.with_extension("json.tmp");
    {
        let mut file = File::create(&tmp).map_err(|e| persistence_error(&tmp, e))?;
        file.write_all(&bytes)
            .map_err(|e| persistence_error(&tmp, e))?;
        file.sync_all().map_err(|e| persistence_error(&tmp, e))?;
    }

    fs::rename(&tmp, path).map_err(|e| persistence_error(path, e))?;
    Ok(())
}

/// Load JSON from `path`, or `None` when the file does not exist yet.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| persistence_error(path, e)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(persistence_error(path, e)),
    }
}

fn persistence_error(path: &Path, reason: impl std::fmt::Display) -> Error {
    Error::Persistence {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}
