//! Base LUN garbage collection
//!
//! The delete-base job body and the state it runs against. Shared between
//! the coordinator (immediate attempts) and the retry queue worker
//! (deferred attempts).

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::domain::ports::{Lun, StorageArray};
use crate::error::{ArrayError, ArrayErrorKind, Result};
use crate::persist::{JobOutcome, JobRunner, PersistentMap};

/// Job stored in the retry queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GcJob {
    /// Delete a base LUN once it has no thin clones left
    DeleteBase { base: Lun },
}

impl GcJob {
    pub fn base(&self) -> &Lun {
        match self {
            GcJob::DeleteBase { base } => base,
        }
    }
}

/// Result of a delete-base attempt that did not need a retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcStatus {
    /// The base LUN was deleted on the array
    Deleted,
    /// The array no longer knows the base LUN; the candidate was dropped
    AlreadyAbsent,
    /// The LUN is not a GC candidate (already collected, or never marked)
    NotCandidate,
}

/// State shared by the coordinator and its background worker.
pub(crate) struct GcCore {
    pub(crate) array: Arc<dyn StorageArray>,
    /// Clone id -> base LUN the clone depends on
    pub(crate) tc_cache: PersistentMap<Lun>,
    /// Base id -> base LUN pending deletion
    pub(crate) gc_candidates: PersistentMap<Lun>,
}

impl GcCore {
    /// Delete a base LUN if it is a candidate with no thin clones left.
    ///
    /// Returns `BaseHasThinClone` while clones remain; the candidate is kept.
    #[instrument(skip(self))]
    pub(crate) async fn collect_base(&self, base_id: &str) -> Result<GcStatus> {
        if !self.gc_candidates.contains_key(base_id) {
            debug!("Not a GC candidate, nothing to do");
            return Ok(GcStatus::NotCandidate);
        }

        match self.array.family_clone_count(base_id).await {
            Ok(0) => {}
            Ok(count) => {
                info!(clones = count, "Base lun still has thin clones");
                return Err(ArrayError::base_has_thin_clone(base_id).into());
            }
            Err(e) if e.kind() == ArrayErrorKind::ResourceNotFound => {
                return self.forget_absent(base_id);
            }
            Err(e) => return Err(e.into()),
        }

        match self.array.delete_lun(base_id).await {
            Ok(()) => {}
            Err(e) if e.kind() == ArrayErrorKind::ResourceNotFound => {
                return self.forget_absent(base_id);
            }
            Err(e) => return Err(e.into()),
        }

        self.gc_candidates.remove(base_id)?;
        info!("Deleted base lun");
        Ok(GcStatus::Deleted)
    }

    /// Base is gone from the array (e.g. deleted before a crash); drop it.
    fn forget_absent(&self, base_id: &str) -> Result<GcStatus> {
        self.gc_candidates.remove(base_id)?;
        info!("Base lun already absent on array, dropped from candidates");
        Ok(GcStatus::AlreadyAbsent)
    }
}

#[async_trait]
impl JobRunner<GcJob> for GcCore {
    async fn run(&self, job: &GcJob) -> JobOutcome {
        match job {
            GcJob::DeleteBase { base } => match self.collect_base(&base.id).await {
                Ok(_) => JobOutcome::Done,
                Err(e) if e.array_kind().is_some_and(ArrayErrorKind::is_deferrable) => {
                    JobOutcome::RetryLater(e.to_string())
                }
                Err(e) => JobOutcome::Failed(e.to_string()),
            },
        }
    }
}
