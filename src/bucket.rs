use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::manager::CheckpointManager;
use crate::types::Vbid;

/// Registry of the bucket's live partitions, shared between the front end
/// (which resolves managers per request) and the remover (which sweeps
/// them). Partitions may come and go at any time; sweepers work on a
/// snapshot of the map and simply skip managers that have since vanished.
#[derive(Default)]
pub struct VBucketMap {
    inner: RwLock<BTreeMap<Vbid, Arc<CheckpointManager>>>,
}

impl VBucketMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a manager under its partition id, replacing any previous
    /// one.
    pub fn add(&self, manager: Arc<CheckpointManager>) {
        self.inner.write().insert(manager.vbid(), manager);
    }

    pub fn remove(&self, vbid: Vbid) -> Option<Arc<CheckpointManager>> {
        self.inner.write().remove(&vbid)
    }

    pub fn get(&self, vbid: Vbid) -> Option<Arc<CheckpointManager>> {
        self.inner.read().get(&vbid).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn vbids(&self) -> Vec<Vbid> {
        self.inner.read().keys().copied().collect()
    }

    /// Snapshot of every manager, in partition order.
    pub fn managers(&self) -> Vec<Arc<CheckpointManager>> {
        self.inner.read().values().cloned().collect()
    }

    /// Snapshot of every manager, sorted by checkpoint memory usage
    /// descending — the sweep order for memory recovery.
    pub fn managers_by_checkpoint_memory(&self) -> Vec<Arc<CheckpointManager>> {
        let mut managers = self.managers();
        managers.sort_by_key(|m| std::cmp::Reverse(m.memory_usage()));
        managers
    }

    /// Sum of checkpoint memory across partitions, recomputed from the
    /// managers rather than the (relaxed, approximate) global counter.
    pub fn total_checkpoint_memory(&self) -> usize {
        self.inner.read().values().map(|m| m.memory_usage()).sum()
    }
}
