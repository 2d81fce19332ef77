//! In-Memory Array Adapter
//!
//! Implements the `StorageArray` port against an in-process model of the
//! array: LUNs, snapshots, thin-clone families and host attachments. Records
//! every call and supports one-shot fault injection, so tests can assert on
//! exactly what the coordinator asked the array to do.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::domain::ports::{ArrayResult, Lun, Snap, StorageArray, ThinCloneRequest};
use crate::error::ArrayError;

/// Array operations, used to target injected faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArrayOp {
    GetLun,
    FamilyCloneCount,
    CreateSnap,
    DeleteSnap,
    CreateThinClone,
    DeleteLun,
    AttachLun,
}

/// A recorded call against the array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArrayCall {
    GetLun(String),
    FamilyCloneCount(String),
    CreateSnap {
        lun_id: String,
        name: String,
        is_auto_delete: bool,
    },
    DeleteSnap(String),
    CreateThinClone {
        lun_id: String,
        request: ThinCloneRequest,
    },
    DeleteLun(String),
    AttachLun {
        lun_id: String,
        host_id: String,
    },
}

#[derive(Debug)]
struct Fault {
    op: ArrayOp,
    resource_id: String,
    error: ArrayError,
}

#[derive(Debug, Default)]
struct ArrayState {
    luns: BTreeMap<String, Lun>,
    snaps: BTreeMap<String, Snap>,
    attachments: BTreeMap<String, BTreeSet<String>>,
    faults: Vec<Fault>,
    calls: Vec<ArrayCall>,
    next_lun: u64,
    next_snap: u64,
}

impl ArrayState {
    /// Consume a matching injected fault, if any.
    fn take_fault(&mut self, op: ArrayOp, resource_id: &str) -> ArrayResult<()> {
        match self
            .faults
            .iter()
            .position(|f| f.op == op && f.resource_id == resource_id)
        {
            Some(index) => Err(self.faults.remove(index).error),
            None => Ok(()),
        }
    }

    fn lun(&self, lun_id: &str) -> ArrayResult<&Lun> {
        self.luns
            .get(lun_id)
            .ok_or_else(|| ArrayError::not_found(lun_id))
    }

    fn clone_count(&self, base_id: &str) -> u32 {
        self.luns
            .values()
            .filter(|l| l.is_thin_clone && l.family_base_lun_id.as_deref() == Some(base_id))
            .count() as u32
    }
}

/// In-process storage array.
#[derive(Debug, Default)]
pub struct InMemoryArray {
    state: Mutex<ArrayState>,
    /// Maximum thin clones per family base
    thin_clone_limit: Option<u32>,
}

impl InMemoryArray {
    /// Create an empty array without a thin-clone limit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty array that refuses more than `limit` clones per base.
    pub fn with_thin_clone_limit(limit: u32) -> Self {
        Self {
            thin_clone_limit: Some(limit),
            ..Default::default()
        }
    }

    /// Provision a plain LUN.
    pub fn add_lun(&self, name: &str) -> Lun {
        let mut state = self.state.lock();
        state.next_lun += 1;
        let lun = Lun::new(format!("sv_{}", state.next_lun), name);
        state.luns.insert(lun.id.clone(), lun.clone());
        lun
    }

    /// Make the next `op` against `resource_id` fail with `error`.
    pub fn inject_fault(&self, op: ArrayOp, resource_id: &str, error: ArrayError) {
        self.state.lock().faults.push(Fault {
            op,
            resource_id: resource_id.to_string(),
            error,
        });
    }

    pub fn has_lun(&self, lun_id: &str) -> bool {
        self.state.lock().luns.contains_key(lun_id)
    }

    pub fn has_snap(&self, snap_id: &str) -> bool {
        self.state.lock().snaps.contains_key(snap_id)
    }

    pub fn snap_count(&self) -> usize {
        self.state.lock().snaps.len()
    }

    /// Hosts a LUN is attached to.
    pub fn attachments(&self, lun_id: &str) -> Vec<String> {
        self.state
            .lock()
            .attachments
            .get(lun_id)
            .map(|hosts| hosts.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// All calls made so far, oldest first.
    pub fn calls(&self) -> Vec<ArrayCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Number of delete calls issued against a LUN.
    pub fn delete_lun_calls(&self, lun_id: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| matches!(c, ArrayCall::DeleteLun(id) if id == lun_id))
            .count()
    }
}

#[async_trait]
impl StorageArray for InMemoryArray {
    async fn get_lun(&self, lun_id: &str) -> ArrayResult<Lun> {
        let mut state = self.state.lock();
        state.calls.push(ArrayCall::GetLun(lun_id.to_string()));
        state.take_fault(ArrayOp::GetLun, lun_id)?;
        state.lun(lun_id).cloned()
    }

    async fn family_clone_count(&self, lun_id: &str) -> ArrayResult<u32> {
        let mut state = self.state.lock();
        state
            .calls
            .push(ArrayCall::FamilyCloneCount(lun_id.to_string()));
        state.take_fault(ArrayOp::FamilyCloneCount, lun_id)?;
        state.lun(lun_id)?;
        Ok(state.clone_count(lun_id))
    }

    async fn create_snap(
        &self,
        lun_id: &str,
        name: &str,
        is_auto_delete: bool,
    ) -> ArrayResult<Snap> {
        let mut state = self.state.lock();
        state.calls.push(ArrayCall::CreateSnap {
            lun_id: lun_id.to_string(),
            name: name.to_string(),
            is_auto_delete,
        });
        state.take_fault(ArrayOp::CreateSnap, lun_id)?;

        let lun = state.lun(lun_id)?.clone();
        state.next_snap += 1;
        let snap = Snap::new(format!("snap_{}", state.next_snap), name, lun);
        state.snaps.insert(snap.id.clone(), snap.clone());

        debug!(lun = %lun_id, snap = %snap.id, "Created snapshot");
        Ok(snap)
    }

    async fn delete_snap(&self, snap_id: &str) -> ArrayResult<()> {
        let mut state = self.state.lock();
        state.calls.push(ArrayCall::DeleteSnap(snap_id.to_string()));
        state.take_fault(ArrayOp::DeleteSnap, snap_id)?;

        state
            .snaps
            .remove(snap_id)
            .map(|_| ())
            .ok_or_else(|| ArrayError::not_found(snap_id))
    }

    async fn create_thin_clone(
        &self,
        lun_id: &str,
        request: &ThinCloneRequest,
    ) -> ArrayResult<String> {
        let mut state = self.state.lock();
        state.calls.push(ArrayCall::CreateThinClone {
            lun_id: lun_id.to_string(),
            request: request.clone(),
        });
        state.take_fault(ArrayOp::CreateThinClone, lun_id)?;

        let source = state.lun(lun_id)?.clone();
        let snap = state
            .snaps
            .get(&request.snap_id)
            .ok_or_else(|| ArrayError::not_found(&request.snap_id))?;
        if snap.lun.id != lun_id {
            return Err(ArrayError::new(
                0,
                format!("snapshot {} does not belong to {}", snap.id, lun_id),
            ));
        }

        // Clones of clones join the family of the original base
        let base_id = match (source.is_thin_clone, source.family_base_lun_id) {
            (true, Some(base_id)) => base_id,
            _ => source.id,
        };
        if let Some(limit) = self.thin_clone_limit {
            if state.clone_count(&base_id) >= limit {
                return Err(ArrayError::thin_clone_limit_exceeded(&base_id));
            }
        }

        state.next_lun += 1;
        let clone = Lun::thin_clone_of(format!("sv_{}", state.next_lun), &request.name, base_id);
        let clone_id = clone.id.clone();
        state.luns.insert(clone_id.clone(), clone);

        debug!(source = %lun_id, clone = %clone_id, "Created thin clone");
        Ok(clone_id)
    }

    async fn delete_lun(&self, lun_id: &str) -> ArrayResult<()> {
        let mut state = self.state.lock();
        state.calls.push(ArrayCall::DeleteLun(lun_id.to_string()));
        state.take_fault(ArrayOp::DeleteLun, lun_id)?;

        state.lun(lun_id)?;
        if state.clone_count(lun_id) > 0 {
            return Err(ArrayError::base_has_thin_clone(lun_id));
        }

        state.luns.remove(lun_id);
        state.snaps.retain(|_, snap| snap.lun.id != lun_id);
        state.attachments.remove(lun_id);

        debug!(lun = %lun_id, "Deleted lun");
        Ok(())
    }

    async fn attach_lun(&self, lun_id: &str, host_id: &str) -> ArrayResult<()> {
        let mut state = self.state.lock();
        state.calls.push(ArrayCall::AttachLun {
            lun_id: lun_id.to_string(),
            host_id: host_id.to_string(),
        });
        state.take_fault(ArrayOp::AttachLun, lun_id)?;

        state.lun(lun_id)?;
        state
            .attachments
            .entry(lun_id.to_string())
            .or_default()
            .insert(host_id.to_string());
        Ok(())
    }
}
