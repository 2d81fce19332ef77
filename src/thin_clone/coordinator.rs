//! Thin-Clone Coordinator
//!
//! Creates thin clones and keeps track of which LUN depends on which hidden
//! base LUN, so base LUNs can be garbage-collected once nothing depends on
//! them anymore.
//!
//! # Guarantees
//!
//! 1. Clones never chain: a tracked clone is always cloned from its base
//! 2. Temporary snapshots are deleted once the clone call returns
//! 3. An old base is marked for GC before the cache forgets about it
//! 4. GC scheduling problems never fail the operation that triggered them

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, instrument, warn};

use super::gc::{GcCore, GcJob, GcStatus};
use crate::domain::ports::{CloneSource, Lun, StorageArray, ThinCloneRequest};
use crate::error::{ArrayErrorKind, Error, Result};
use crate::persist::{DrainReport, PersistentMap, QueuedJob, RetryQueue, RetryQueueConfig};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the coordinator
#[derive(Debug, Clone)]
pub struct ThinCloneConfig {
    /// Interval between background GC passes
    pub gc_interval: Duration,

    /// Failed GC attempts tolerated per job before it is dropped (None = unbounded)
    pub max_retries: Option<u32>,

    /// Namespace of the clone-to-base cache
    pub cache_namespace: String,

    /// Namespace of the GC candidate set
    pub candidates_namespace: String,

    /// File name of the GC job queue
    pub queue_file: String,
}

impl Default for ThinCloneConfig {
    fn default() -> Self {
        Self {
            gc_interval: Duration::from_secs(60 * 60), // 1 hour
            max_retries: None,
            cache_namespace: "tc_cache".to_string(),
            candidates_namespace: "gc_candidates".to_string(),
            queue_file: "gc_queue.json".to_string(),
        }
    }
}

impl ThinCloneConfig {
    /// Retry queue settings derived from this config.
    pub fn queue_config(&self) -> RetryQueueConfig {
        RetryQueueConfig {
            interval: self.gc_interval,
            max_retries: self.max_retries,
        }
    }

    /// Location of the GC job queue under `persist_path`.
    pub fn queue_path(&self, persist_path: &Path) -> PathBuf {
        persist_path.join(&self.queue_file)
    }
}

// =============================================================================
// Notifications
// =============================================================================

/// Lifecycle events the rest of the SDK reports to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThinCloneAction {
    /// A thin clone is being deleted by the user
    TcDelete,
    /// A destructive copy of `new_base` was written onto the LUN
    DdCopy { new_base: Lun },
    /// The LUN was attached to a production host
    LunAttach,
    /// The LUN is itself a base being retired
    BaseLunDelete,
}

impl std::fmt::Display for ThinCloneAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ThinCloneAction::TcDelete => write!(f, "TcDelete"),
            ThinCloneAction::DdCopy { .. } => write!(f, "DdCopy"),
            ThinCloneAction::LunAttach => write!(f, "LunAttach"),
            ThinCloneAction::BaseLunDelete => write!(f, "BaseLunDelete"),
        }
    }
}

// =============================================================================
// Coordinator
// =============================================================================

/// Thin-clone lifecycle and base LUN garbage collection.
///
/// One coordinator should be bound to a persisted location at a time. Clones
/// of it are not provided; share it behind an `Arc`.
pub struct ThinCloneCoordinator {
    core: Arc<GcCore>,
    /// Background GC queue (None when never set up)
    gc_queue: Option<Arc<RetryQueue<GcJob>>>,
    persist_path: Option<PathBuf>,
}

impl ThinCloneCoordinator {
    /// Bind to persistent state under `persist_path` and start background GC.
    ///
    /// Must be called from within a tokio runtime. Base LUNs left as GC
    /// candidates by a previous process are scheduled again.
    #[instrument(skip(persist_path, array, config), fields(path = %persist_path.as_ref().display()))]
    pub fn set_up(
        persist_path: impl AsRef<Path>,
        array: Arc<dyn StorageArray>,
        config: ThinCloneConfig,
    ) -> Result<Self> {
        let persist_path = persist_path.as_ref();
        std::fs::create_dir_all(persist_path)?;

        let core = Arc::new(GcCore {
            array,
            tc_cache: PersistentMap::open(persist_path, &config.cache_namespace)?,
            gc_candidates: PersistentMap::open(persist_path, &config.candidates_namespace)?,
        });
        let gc_queue: Arc<RetryQueue<GcJob>> = Arc::new(RetryQueue::open(
            &config.queue_path(persist_path),
            config.queue_config(),
        )?);
        gc_queue.start(core.clone())?;

        let coordinator = Self {
            core,
            gc_queue: Some(gc_queue),
            persist_path: Some(persist_path.to_path_buf()),
        };

        let rescheduled = coordinator.reschedule_orphaned_candidates()?;
        info!(
            cached_clones = coordinator.core.tc_cache.len(),
            gc_candidates = coordinator.core.gc_candidates.len(),
            rescheduled,
            "Thin-clone coordinator set up"
        );
        Ok(coordinator)
    }

    /// Coordinator with in-memory state and no background GC.
    ///
    /// GC candidates are recorded but never scheduled.
    pub fn in_memory(array: Arc<dyn StorageArray>) -> Self {
        Self {
            core: Arc::new(GcCore {
                array,
                tc_cache: PersistentMap::in_memory("tc_cache"),
                gc_candidates: PersistentMap::in_memory("gc_candidates"),
            }),
            gc_queue: None,
            persist_path: None,
        }
    }

    /// Stop background GC and release the persisted state.
    ///
    /// Files under the persist path are kept for the next `set_up`.
    pub async fn clean_up(self) -> Result<()> {
        if let Some(queue) = &self.gc_queue {
            queue.stop().await;
        }
        self.core.tc_cache.flush()?;
        self.core.gc_candidates.flush()?;

        info!(path = ?self.persist_path, "Thin-clone coordinator cleaned up");
        Ok(())
    }

    /// Queue a delete job for every candidate that has none pending.
    fn reschedule_orphaned_candidates(&self) -> Result<usize> {
        let Some(queue) = &self.gc_queue else {
            return Ok(0);
        };

        let mut rescheduled = 0;
        for (id, base) in self.core.gc_candidates.snapshot() {
            let job = GcJob::DeleteBase { base };
            if queue
                .put_unless_pending(job, |pending| pending.base().id == id)?
                .is_some()
            {
                rescheduled += 1;
            }
        }
        Ok(rescheduled)
    }

    // =========================================================================
    // Clone creation
    // =========================================================================

    /// Create a thin clone of a LUN or snapshot.
    ///
    /// A source that is itself a tracked clone is cloned from its base
    /// instead. Unless the caller supplied the snapshot, a temporary
    /// `tmp-<name>` snapshot is taken and removed again afterwards.
    #[instrument(skip(self, array, source), fields(source = %source.id()))]
    pub async fn thin_clone(
        &self,
        array: &dyn StorageArray,
        source: CloneSource,
        name: &str,
        io_limit_policy: Option<&str>,
        description: Option<&str>,
    ) -> Result<Lun> {
        let source_id = source.id().to_string();
        let (mut tc_node, original_snap) = source.into_parts();
        let mut snap_to_tc = original_snap.clone();

        if let Some(base) = self.core.tc_cache.get(&source_id) {
            debug!(base = %base.id, "Source is a tracked thin clone, cloning its base");
            tc_node = base;
            snap_to_tc = None;
        }

        let snap = match snap_to_tc {
            Some(snap) => snap,
            None => {
                array
                    .create_snap(&tc_node.id, &format!("tmp-{}", name), false)
                    .await?
            }
        };

        let request = ThinCloneRequest {
            snap_id: snap.id.clone(),
            name: name.to_string(),
            description: description.map(str::to_string),
            io_limit_policy: io_limit_policy.map(str::to_string),
        };
        let created = array.create_thin_clone(&tc_node.id, &request).await;

        // No early return between snapshot creation and here
        let is_temporary = original_snap.as_ref().map(|s| s.id.as_str()) != Some(snap.id.as_str());
        if is_temporary {
            if let Err(e) = array.delete_snap(&snap.id).await {
                warn!(snap = %snap.id, "Failed to delete temporary snapshot: {}", e);
            }
        }

        let clone_id = created?;
        // Clones of clones join the family of the original base
        let family_base = match (tc_node.is_thin_clone, tc_node.family_base_lun_id.clone()) {
            (true, Some(base_id)) => base_id,
            _ => tc_node.id.clone(),
        };
        let clone = Lun::thin_clone_of(clone_id, name, family_base);
        info!(
            base = %tc_node.id,
            clone = %clone.id,
            "Created thin clone"
        );
        Ok(clone)
    }

    // =========================================================================
    // Notifications
    // =========================================================================

    /// Report a lifecycle event on `resource`.
    ///
    /// Only array errors from an immediate thin-clone GC attempt (other than
    /// "not yet deletable") and cache persistence errors are returned.
    #[instrument(skip(self, resource, action), fields(lun = %resource.id, action = %action))]
    pub async fn notify(&self, resource: &Lun, action: ThinCloneAction) -> Result<()> {
        match action {
            ThinCloneAction::TcDelete => self.on_tc_delete(resource).await,
            ThinCloneAction::DdCopy { new_base } => self.on_dd_copy(resource, new_base),
            ThinCloneAction::LunAttach => self.on_lun_attach(resource),
            ThinCloneAction::BaseLunDelete => {
                self.mark_for_gc(resource);
                Ok(())
            }
        }
    }

    async fn on_tc_delete(&self, clone: &Lun) -> Result<()> {
        // Family base as the array reports it; the handle's copy once the clone is gone
        let base_id = match self.core.array.get_lun(&clone.id).await {
            Ok(live) => live.family_base_lun_id,
            Err(e) if e.kind() == ArrayErrorKind::ResourceNotFound => {
                clone.family_base_lun_id.clone()
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(base_id) = base_id {
            match self.core.collect_base(&base_id).await {
                Ok(status) => debug!(base = %base_id, ?status, "Immediate base GC attempt"),
                Err(e) if e.array_kind().is_some_and(ArrayErrorKind::is_deferrable) => {
                    info!(base = %base_id, "Base lun not deletable yet, deferring: {}", e);
                }
                Err(e) => return Err(e),
            }
        }

        if self.core.tc_cache.remove(&clone.id)?.is_some() {
            debug!("Removed cache entry of deleted thin clone");
        }
        Ok(())
    }

    fn on_dd_copy(&self, lun: &Lun, new_base: Lun) -> Result<()> {
        if let Some(old_base) = self.core.tc_cache.get(&lun.id) {
            if old_base.id != new_base.id {
                self.mark_for_gc(&old_base);
            }
        }
        self.core.tc_cache.insert(lun.id.clone(), new_base)?;
        Ok(())
    }

    fn on_lun_attach(&self, lun: &Lun) -> Result<()> {
        if let Some(old_base) = self.core.tc_cache.get(&lun.id) {
            self.mark_for_gc(&old_base);
            self.core.tc_cache.remove(&lun.id)?;
        }
        Ok(())
    }

    /// Record `base` as a GC candidate and schedule its deletion.
    fn mark_for_gc(&self, base: &Lun) {
        if let Err(e) = self.core.gc_candidates.insert(base.id.clone(), base.clone()) {
            error!(base = %base.id, "Failed to record GC candidate: {}", e);
        }

        match &self.gc_queue {
            Some(queue) => {
                let job = GcJob::DeleteBase { base: base.clone() };
                match queue.put_unless_pending(job, |pending| pending.base().id == base.id) {
                    Ok(Some(job_id)) => info!(base = %base.id, %job_id, "Scheduled base lun for GC"),
                    Ok(None) => debug!(base = %base.id, "Base lun GC already scheduled"),
                    Err(e) => error!(base = %base.id, "Failed to schedule base lun GC: {}", e),
                }
            }
            None => warn!(
                base = %base.id,
                "Background GC not set up, base lun recorded as candidate only"
            ),
        }
    }

    // =========================================================================
    // Resource hooks
    // =========================================================================

    /// Attach a LUN to a host and report it.
    pub async fn attach_lun(&self, lun: &Lun, host_id: &str) -> Result<()> {
        self.core.array.attach_lun(&lun.id, host_id).await?;
        self.notify(lun, ThinCloneAction::LunAttach).await
    }

    /// Delete a LUN and let the coordinator react to it.
    pub async fn delete_lun(&self, lun: &Lun) -> Result<()> {
        self.core.array.delete_lun(&lun.id).await?;

        if lun.is_thin_clone {
            self.notify(lun, ThinCloneAction::TcDelete).await
        } else {
            // A destructive-copy target no longer holds on to its base
            self.on_lun_attach(lun)
        }
    }

    /// Report a finished destructive copy of `new_base` onto `lun`.
    pub async fn dd_copy_completed(&self, lun: &Lun, new_base: Lun) -> Result<()> {
        self.notify(lun, ThinCloneAction::DdCopy { new_base }).await
    }

    // =========================================================================
    // Garbage collection and introspection
    // =========================================================================

    /// Run the delete-base job for `base` right away.
    pub async fn delete_base_lun(&self, base: &Lun) -> Result<GcStatus> {
        self.core.collect_base(&base.id).await
    }

    /// Run one pass over the pending GC jobs.
    pub async fn drain_now(&self) -> Result<DrainReport> {
        let queue = self
            .gc_queue
            .as_ref()
            .ok_or_else(|| Error::Config("background GC is not set up".to_string()))?;
        Ok(queue.drain(self.core.as_ref()).await)
    }

    pub fn is_background_gc_active(&self) -> bool {
        self.gc_queue.as_ref().is_some_and(|q| q.is_running())
    }

    pub fn persist_path(&self) -> Option<&Path> {
        self.persist_path.as_deref()
    }

    /// Base the given clone is tracked against, if any.
    pub fn cached_base(&self, lun_id: &str) -> Option<Lun> {
        self.core.tc_cache.get(lun_id)
    }

    pub fn is_gc_candidate(&self, lun_id: &str) -> bool {
        self.core.gc_candidates.contains_key(lun_id)
    }

    pub fn tc_cache(&self) -> BTreeMap<String, Lun> {
        self.core.tc_cache.snapshot()
    }

    pub fn gc_candidates(&self) -> BTreeMap<String, Lun> {
        self.core.gc_candidates.snapshot()
    }

    pub fn pending_jobs(&self) -> Vec<QueuedJob<GcJob>> {
        self.gc_queue
            .as_ref()
            .map(|q| q.pending())
            .unwrap_or_default()
    }
}

impl Drop for ThinCloneCoordinator {
    fn drop(&mut self) {
        if let Some(queue) = &self.gc_queue {
            queue.signal_stop();
        }
    }
}

impl std::fmt::Debug for ThinCloneCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThinCloneCoordinator")
            .field("persist_path", &self.persist_path)
            .field("cached_clones", &self.core.tc_cache.len())
            .field("gc_candidates", &self.core.gc_candidates.len())
            .field("gc_queue", &self.gc_queue)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
