use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Bucket-wide counters shared by every checkpoint manager and the remover.
///
/// All counters use relaxed atomics: aggregate reads are approximate by
/// design. `estimated_total_memory` is fed by the embedding bucket (the
/// allocator hooks live outside this crate); `checkpoint_memory` is
/// maintained here through differential updates from the managers.
#[derive(Debug, Default)]
pub struct BucketStats {
    estimated_total_memory: AtomicU64,
    checkpoint_memory: AtomicU64,
    num_checkpoints: AtomicU64,
    items_expelled: AtomicU64,
    items_removed_from_checkpoints: AtomicU64,
    cursors_dropped: AtomicU64,
    cursor_memory_freed: AtomicU64,
}

/// Point-in-time copy of [`BucketStats`], safe to serialize and ship.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct StatsSnapshot {
    pub estimated_total_memory: u64,
    pub checkpoint_memory: u64,
    pub num_checkpoints: u64,
    pub items_expelled: u64,
    pub items_removed_from_checkpoints: u64,
    pub cursors_dropped: u64,
    pub cursor_memory_freed: u64,
}

impl BucketStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn memory_used(&self) -> u64 {
        self.estimated_total_memory.load(Ordering::Relaxed)
    }

    pub fn set_memory_used(&self, bytes: u64) {
        self.estimated_total_memory.store(bytes, Ordering::Relaxed);
    }

    pub fn checkpoint_memory(&self) -> u64 {
        self.checkpoint_memory.load(Ordering::Relaxed)
    }

    pub(crate) fn add_checkpoint_memory(&self, bytes: u64) {
        if bytes != 0 {
            self.checkpoint_memory.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    pub(crate) fn sub_checkpoint_memory(&self, bytes: u64) {
        if bytes != 0 {
            self.checkpoint_memory.fetch_sub(bytes, Ordering::Relaxed);
        }
    }

    pub fn num_checkpoints(&self) -> u64 {
        self.num_checkpoints.load(Ordering::Relaxed)
    }

    pub(crate) fn checkpoint_created(&self) {
        self.num_checkpoints.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn checkpoint_destroyed(&self, count: u64) {
        self.num_checkpoints.fetch_sub(count, Ordering::Relaxed);
    }

    pub fn items_expelled(&self) -> u64 {
        self.items_expelled.load(Ordering::Relaxed)
    }

    pub(crate) fn add_items_expelled(&self, count: u64) {
        if count != 0 {
            self.items_expelled.fetch_add(count, Ordering::Relaxed);
        }
    }

    pub fn items_removed_from_checkpoints(&self) -> u64 {
        self.items_removed_from_checkpoints.load(Ordering::Relaxed)
    }

    pub(crate) fn add_items_removed(&self, count: u64) {
        if count != 0 {
            self.items_removed_from_checkpoints
                .fetch_add(count, Ordering::Relaxed);
        }
    }

    pub fn cursors_dropped(&self) -> u64 {
        self.cursors_dropped.load(Ordering::Relaxed)
    }

    pub fn cursor_dropped(&self, memory_freed: u64) {
        self.cursors_dropped.fetch_add(1, Ordering::Relaxed);
        self.cursor_memory_freed
            .fetch_add(memory_freed, Ordering::Relaxed);
    }

    pub fn cursor_memory_freed(&self) -> u64 {
        self.cursor_memory_freed.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            estimated_total_memory: self.memory_used(),
            checkpoint_memory: self.checkpoint_memory(),
            num_checkpoints: self.num_checkpoints(),
            items_expelled: self.items_expelled(),
            items_removed_from_checkpoints: self.items_removed_from_checkpoints(),
            cursors_dropped: self.cursors_dropped(),
            cursor_memory_freed: self.cursor_memory_freed(),
        }
    }
}

impl StatsSnapshot {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
