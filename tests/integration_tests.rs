//! Thin-Clone Coordinator Integration Tests
//!
//! End-to-end behavior of the coordinator against the in-memory array:
//! cache maintenance on lifecycle notifications, base LUN garbage
//! collection, the background worker and persistence across restarts.

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use thinclone::adapters::{ArrayCall, InMemoryArray};
use thinclone::domain::StorageArray;
use thinclone::{
    ArrayErrorKind, GcJob, GcStatus, Lun, ThinCloneAction, ThinCloneConfig, ThinCloneCoordinator,
};

fn fast_gc() -> ThinCloneConfig {
    ThinCloneConfig {
        gc_interval: Duration::from_millis(100),
        max_retries: Some(1),
        ..Default::default()
    }
}

/// Config whose worker will not fire during a test.
fn idle_gc() -> ThinCloneConfig {
    ThinCloneConfig {
        gc_interval: Duration::from_secs(3600),
        ..Default::default()
    }
}

async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

// =============================================================================
// Cache maintenance
// =============================================================================

mod notify_tests {
    use super::*;

    #[tokio::test]
    async fn test_dd_copy_without_prior_entry() {
        let array = Arc::new(InMemoryArray::new());
        let coordinator = ThinCloneCoordinator::in_memory(array.clone());
        let lun = array.add_lun("lun-a");
        let new_base = array.add_lun("base-b");

        coordinator
            .notify(&lun, ThinCloneAction::DdCopy { new_base: new_base.clone() })
            .await
            .unwrap();

        assert_eq!(coordinator.cached_base(&lun.id), Some(new_base.clone()));
        assert!(!coordinator.is_gc_candidate(&lun.id));
        assert!(!coordinator.is_gc_candidate(&new_base.id));
    }

    #[tokio::test]
    async fn test_dd_copy_marks_old_base() {
        let dir = tempfile::tempdir().unwrap();
        let array = Arc::new(InMemoryArray::new());
        let coordinator =
            ThinCloneCoordinator::set_up(dir.path(), array.clone(), idle_gc()).unwrap();
        let lun = array.add_lun("lun-a");
        let old_base = array.add_lun("base-old");
        let new_base = array.add_lun("base-new");

        coordinator
            .dd_copy_completed(&lun, old_base.clone())
            .await
            .unwrap();
        coordinator
            .dd_copy_completed(&lun, new_base.clone())
            .await
            .unwrap();

        assert_eq!(coordinator.cached_base(&lun.id), Some(new_base));
        assert!(coordinator.is_gc_candidate(&old_base.id));

        let jobs = coordinator.pending_jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job, GcJob::DeleteBase { base: old_base });

        coordinator.clean_up().await.unwrap();
    }

    #[tokio::test]
    async fn test_lun_attach_drops_entry_and_marks_base() {
        let array = Arc::new(InMemoryArray::new());
        let coordinator = ThinCloneCoordinator::in_memory(array.clone());
        let lun = array.add_lun("lun-a");
        let old_base = array.add_lun("base-old");
        coordinator
            .dd_copy_completed(&lun, old_base.clone())
            .await
            .unwrap();

        coordinator
            .notify(&lun, ThinCloneAction::LunAttach)
            .await
            .unwrap();

        assert!(coordinator.cached_base(&lun.id).is_none());
        assert!(coordinator.is_gc_candidate(&old_base.id));
    }

    #[tokio::test]
    async fn test_lun_attach_untracked_is_noop() {
        let array = Arc::new(InMemoryArray::new());
        let coordinator = ThinCloneCoordinator::in_memory(array.clone());
        let lun = array.add_lun("lun-a");

        coordinator
            .notify(&lun, ThinCloneAction::LunAttach)
            .await
            .unwrap();

        assert!(coordinator.tc_cache().is_empty());
        assert!(coordinator.gc_candidates().is_empty());
    }

    #[tokio::test]
    async fn test_base_lun_delete_marks_itself() {
        let array = Arc::new(InMemoryArray::new());
        let coordinator = ThinCloneCoordinator::in_memory(array.clone());
        let base = array.add_lun("base");

        coordinator
            .notify(&base, ThinCloneAction::BaseLunDelete)
            .await
            .unwrap();

        assert!(coordinator.is_gc_candidate(&base.id));
        assert!(coordinator.tc_cache().is_empty());
        // Nothing is deleted until the GC job runs
        assert!(array.has_lun(&base.id));
    }
}

// =============================================================================
// Garbage collection
// =============================================================================

mod gc_tests {
    use super::*;

    #[tokio::test]
    async fn test_delete_base_twice_is_idempotent() {
        let array = Arc::new(InMemoryArray::new());
        let coordinator = ThinCloneCoordinator::in_memory(array.clone());
        let base = array.add_lun("base");
        coordinator
            .notify(&base, ThinCloneAction::BaseLunDelete)
            .await
            .unwrap();

        let first = coordinator.delete_base_lun(&base).await.unwrap();
        let second = coordinator.delete_base_lun(&base).await.unwrap();

        assert_eq!(first, GcStatus::Deleted);
        assert_eq!(second, GcStatus::NotCandidate);
        assert!(!coordinator.is_gc_candidate(&base.id));
        assert_eq!(array.delete_lun_calls(&base.id), 1);
    }

    #[tokio::test]
    async fn test_delete_base_deferred_while_clones_exist() {
        let array = Arc::new(InMemoryArray::new());
        let coordinator = ThinCloneCoordinator::in_memory(array.clone());
        let base = array.add_lun("base");
        let clone = coordinator
            .thin_clone(&*array, base.clone().into(), "tc", None, None)
            .await
            .unwrap();
        coordinator
            .notify(&base, ThinCloneAction::BaseLunDelete)
            .await
            .unwrap();

        let err = coordinator.delete_base_lun(&base).await.unwrap_err();
        assert_eq!(err.array_kind(), Some(ArrayErrorKind::BaseHasThinClone));
        assert!(coordinator.is_gc_candidate(&base.id));
        assert!(array.has_lun(&base.id));

        // Once the last clone is gone the same job succeeds
        array.delete_lun(&clone.id).await.unwrap();
        assert_eq!(
            coordinator.delete_base_lun(&base).await.unwrap(),
            GcStatus::Deleted
        );
        assert!(!coordinator.is_gc_candidate(&base.id));
    }

    #[tokio::test]
    async fn test_delete_base_after_crash_between_delete_and_commit() {
        let array = Arc::new(InMemoryArray::new());
        let coordinator = ThinCloneCoordinator::in_memory(array.clone());
        let base = array.add_lun("base");
        coordinator
            .notify(&base, ThinCloneAction::BaseLunDelete)
            .await
            .unwrap();

        // The array delete went through but the candidate was never removed
        array.delete_lun(&base.id).await.unwrap();

        assert_eq!(
            coordinator.delete_base_lun(&base).await.unwrap(),
            GcStatus::AlreadyAbsent
        );
        assert!(!coordinator.is_gc_candidate(&base.id));
    }

    #[tokio::test]
    async fn test_tc_delete_with_live_sibling() {
        let array = Arc::new(InMemoryArray::new());
        let coordinator = ThinCloneCoordinator::in_memory(array.clone());
        let base = array.add_lun("base");
        let first = coordinator
            .thin_clone(&*array, base.clone().into(), "tc-1", None, None)
            .await
            .unwrap();
        let _sibling = coordinator
            .thin_clone(&*array, base.clone().into(), "tc-2", None, None)
            .await
            .unwrap();
        coordinator
            .notify(&base, ThinCloneAction::BaseLunDelete)
            .await
            .unwrap();

        coordinator.delete_lun(&first).await.unwrap();

        assert!(!array.has_lun(&first.id));
        assert!(coordinator.cached_base(&first.id).is_none());
        assert!(!coordinator.is_gc_candidate(&first.id));
        // The base waits for its remaining clone
        assert!(array.has_lun(&base.id));
        assert!(coordinator.is_gc_candidate(&base.id));
    }

    #[tokio::test]
    async fn test_tc_delete_of_cached_clone_drops_entry() {
        let array = Arc::new(InMemoryArray::new());
        let coordinator = ThinCloneCoordinator::in_memory(array.clone());
        let base = array.add_lun("base");
        let other = array.add_lun("other");
        let clone = coordinator
            .thin_clone(&*array, base.clone().into(), "tc", None, None)
            .await
            .unwrap();
        coordinator
            .dd_copy_completed(&clone, other.clone())
            .await
            .unwrap();

        coordinator
            .notify(&clone, ThinCloneAction::TcDelete)
            .await
            .unwrap();

        assert!(coordinator.cached_base(&clone.id).is_none());
        assert!(!coordinator.is_gc_candidate(&other.id));
    }
}

// =============================================================================
// Clone creation
// =============================================================================

mod thin_clone_tests {
    use super::*;

    #[tokio::test]
    async fn test_thin_clone_dechains_through_cache() {
        let array = Arc::new(InMemoryArray::new());
        let coordinator = ThinCloneCoordinator::in_memory(array.clone());
        let lun = array.add_lun("lun");
        let cached_base = array.add_lun("hidden-base");
        coordinator
            .dd_copy_completed(&lun, cached_base.clone())
            .await
            .unwrap();
        array.clear_calls();

        let clone = coordinator
            .thin_clone(&*array, lun.clone().into(), "tc", Some("qp_1"), None)
            .await
            .unwrap();

        assert_eq!(
            clone.family_base_lun_id.as_deref(),
            Some(cached_base.id.as_str())
        );

        let calls = array.calls();
        assert!(calls.iter().any(|c| matches!(
            c,
            ArrayCall::CreateThinClone { lun_id, request }
                if lun_id == &cached_base.id && request.io_limit_policy.as_deref() == Some("qp_1")
        )));
        assert!(!calls.iter().any(|c| matches!(
            c,
            ArrayCall::CreateSnap { lun_id, .. } | ArrayCall::CreateThinClone { lun_id, .. }
                if lun_id == &lun.id
        )));
    }

    #[tokio::test]
    async fn test_thin_clone_limit_propagates() {
        let array = Arc::new(InMemoryArray::with_thin_clone_limit(1));
        let coordinator = ThinCloneCoordinator::in_memory(array.clone());
        let lun = array.add_lun("lun");

        coordinator
            .thin_clone(&*array, lun.clone().into(), "tc-1", None, None)
            .await
            .unwrap();
        let err = coordinator
            .thin_clone(&*array, lun.clone().into(), "tc-2", None, None)
            .await
            .unwrap_err();

        assert_eq!(err.array_kind(), Some(ArrayErrorKind::ThinCloneLimitExceeded));
        assert_eq!(array.snap_count(), 0);
    }
}

// =============================================================================
// Background GC and persistence
// =============================================================================

mod lifecycle_tests {
    use super::*;

    #[tokio::test]
    async fn test_end_to_end_background_gc() {
        let dir = tempfile::tempdir().unwrap();
        let array = Arc::new(InMemoryArray::new());
        let coordinator =
            ThinCloneCoordinator::set_up(dir.path(), array.clone(), fast_gc()).unwrap();
        assert!(coordinator.is_background_gc_active());

        let lun_a = array.add_lun("lun-a");
        let lun_b = array.add_lun("lun-b");

        coordinator
            .notify(&lun_a, ThinCloneAction::DdCopy { new_base: lun_b.clone() })
            .await
            .unwrap();
        assert_eq!(coordinator.cached_base(&lun_a.id), Some(lun_b.clone()));

        coordinator
            .notify(&lun_a, ThinCloneAction::LunAttach)
            .await
            .unwrap();
        assert!(coordinator.cached_base(&lun_a.id).is_none());
        assert!(coordinator.is_gc_candidate(&lun_b.id));

        let collected = wait_until(|| !coordinator.is_gc_candidate(&lun_b.id)).await;
        assert!(collected, "base lun was not collected in time");
        assert!(!array.has_lun(&lun_b.id));
        assert_eq!(array.delete_lun_calls(&lun_b.id), 1);
        assert!(wait_until(|| coordinator.pending_jobs().is_empty()).await);

        coordinator.clean_up().await.unwrap();
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let array = Arc::new(InMemoryArray::new());
        let lun = array.add_lun("lun");
        let base = array.add_lun("base");
        let retired = array.add_lun("retired");

        let coordinator =
            ThinCloneCoordinator::set_up(dir.path(), array.clone(), idle_gc()).unwrap();
        coordinator.dd_copy_completed(&lun, base.clone()).await.unwrap();
        coordinator
            .notify(&retired, ThinCloneAction::BaseLunDelete)
            .await
            .unwrap();
        coordinator.clean_up().await.unwrap();

        let coordinator =
            ThinCloneCoordinator::set_up(dir.path(), array.clone(), idle_gc()).unwrap();
        assert_eq!(coordinator.cached_base(&lun.id), Some(base));
        assert!(coordinator.is_gc_candidate(&retired.id));
        assert_eq!(coordinator.pending_jobs().len(), 1);

        assert_matches!(
            coordinator.drain_now().await,
            Ok(report) if report.completed == 1 && report.retried == 0
        );
        assert!(!array.has_lun(&retired.id));
        coordinator.clean_up().await.unwrap();
    }

    #[tokio::test]
    async fn test_orphaned_candidates_rescheduled_on_set_up() {
        let dir = tempfile::tempdir().unwrap();
        let array = Arc::new(InMemoryArray::new());
        let base = array.add_lun("base");

        // Candidate recorded, but its job already dropped from the queue
        let coordinator = ThinCloneCoordinator::set_up(
            dir.path(),
            array.clone(),
            ThinCloneConfig {
                max_retries: Some(0),
                ..idle_gc()
            },
        )
        .unwrap();
        let clone = coordinator
            .thin_clone(&*array, base.clone().into(), "tc", None, None)
            .await
            .unwrap();
        coordinator
            .notify(&base, ThinCloneAction::BaseLunDelete)
            .await
            .unwrap();
        let report = coordinator.drain_now().await.unwrap();
        assert_eq!(report.dropped, 1);
        assert!(coordinator.pending_jobs().is_empty());
        coordinator.clean_up().await.unwrap();

        array.delete_lun(&clone.id).await.unwrap();

        let coordinator =
            ThinCloneCoordinator::set_up(dir.path(), array.clone(), idle_gc()).unwrap();
        let jobs = coordinator.pending_jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job.base().id, base.id);

        coordinator.drain_now().await.unwrap();
        assert!(!array.has_lun(&base.id));
        assert!(!coordinator.is_gc_candidate(&base.id));
        coordinator.clean_up().await.unwrap();
    }

    #[tokio::test]
    async fn test_deferred_job_retried_until_budget_spent() {
        let dir = tempfile::tempdir().unwrap();
        let array = Arc::new(InMemoryArray::new());
        let coordinator =
            ThinCloneCoordinator::set_up(dir.path(), array.clone(), fast_gc()).unwrap();
        let base = array.add_lun("base");
        coordinator
            .thin_clone(&*array, base.clone().into(), "tc", None, None)
            .await
            .unwrap();

        coordinator
            .notify(&base, ThinCloneAction::BaseLunDelete)
            .await
            .unwrap();

        // One retry allowed: the job runs twice, then is dropped
        assert!(wait_until(|| coordinator.pending_jobs().is_empty()).await);
        assert!(coordinator.is_gc_candidate(&base.id));
        assert!(array.has_lun(&base.id));
        let attempts = array
            .calls()
            .iter()
            .filter(|c| matches!(c, ArrayCall::FamilyCloneCount(id) if id == &base.id))
            .count();
        assert_eq!(attempts, 2);

        coordinator.clean_up().await.unwrap();
    }

    #[tokio::test]
    async fn test_clean_up_with_no_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let array = Arc::new(InMemoryArray::new());
        let coordinator = ThinCloneCoordinator::set_up(dir.path(), array, fast_gc()).unwrap();

        assert_eq!(coordinator.persist_path(), Some(dir.path()));
        coordinator.clean_up().await.unwrap();

        assert!(dir.path().join("tc_cache.json").exists());
        assert!(dir.path().join("gc_candidates.json").exists());
    }
}

// =============================================================================
// Properties
// =============================================================================

mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_dd_copy_then_attach(names in proptest::collection::vec("[a-z]{1,8}", 1..6)) {
            tokio_test::block_on(async {
                let array = Arc::new(InMemoryArray::new());
                let coordinator = ThinCloneCoordinator::in_memory(array.clone());
                let lun = array.add_lun("target");

                let bases: Vec<Lun> = names.iter().map(|n| array.add_lun(n)).collect();
                for base in &bases {
                    coordinator.dd_copy_completed(&lun, base.clone()).await.unwrap();
                    assert_eq!(coordinator.cached_base(&lun.id), Some(base.clone()));
                    assert!(!coordinator.is_gc_candidate(&lun.id));
                }

                // Every replaced base is pending GC, the current one is not
                for base in &bases[..bases.len() - 1] {
                    assert!(coordinator.is_gc_candidate(&base.id));
                }
                let current = bases.last().unwrap();
                assert!(!coordinator.is_gc_candidate(&current.id));

                coordinator.notify(&lun, ThinCloneAction::LunAttach).await.unwrap();
                assert!(coordinator.cached_base(&lun.id).is_none());
                assert!(coordinator.is_gc_candidate(&current.id));
            });
        }
    }
}
