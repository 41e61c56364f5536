use std::collections::HashMap;
use std::mem;
use std::sync::Arc;
use std::time::Instant;

use tracing::trace;

use crate::error::{CheckpointError, Result};
use crate::item::QueuedItem;
use crate::types::{CheckpointId, CheckpointState, CheckpointType, SnapshotRange, Vbid};

/// Fixed per-checkpoint bookkeeping cost.
pub const CHECKPOINT_OVERHEAD: usize = 256;
/// Estimated cost of one dedup-index entry beyond its key bytes.
const INDEX_ENTRY_OVERHEAD: usize = 2 * mem::size_of::<usize>();

/// Outcome of queueing an item into a checkpoint.
///
/// Precondition violations (closed checkpoint, exhausted allocation) surface
/// through the error channel instead of a third variant.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum QueueItemStatus {
    /// Appended as a new entry.
    NewItem,
    /// Replaced a prior unread occurrence of the same key in place.
    ExistingItem,
}

/// Items removed by one expel pass.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct ExpelledItems {
    pub items: usize,
    pub non_meta: usize,
    pub bytes: usize,
}

/// A bounded, ordered window of queued items with an explicit snapshot range.
///
/// The sequence always begins with a `checkpoint_start` meta item and, once
/// closed, ends with a `checkpoint_end`. Offsets handed to cursors are
/// *logical*: expel shortens the physical sequence but never renumbers what
/// remains, so cursor positions stay valid without fixups.
#[derive(Debug)]
pub struct Checkpoint {
    id: CheckpointId,
    vbid: Vbid,
    state: CheckpointState,
    ckpt_type: CheckpointType,
    snap_start: u64,
    snap_end: u64,
    high_completed_seqno: Option<u64>,
    items: Vec<Arc<QueuedItem>>,
    /// key -> logical offset of its live occurrence; open checkpoints only.
    key_index: HashMap<Vec<u8>, usize>,
    num_items: usize,
    item_bytes: usize,
    index_key_bytes: usize,
    num_expelled: usize,
    first_seqno: Option<i64>,
    max_deleted_rev_seqno: Option<u64>,
    created_at: Instant,
}

impl Checkpoint {
    pub(crate) fn new(
        id: CheckpointId,
        vbid: Vbid,
        snap_start: u64,
        snap_end: u64,
        high_completed_seqno: Option<u64>,
        ckpt_type: CheckpointType,
        start_seqno: i64,
    ) -> Self {
        let start = Arc::new(QueuedItem::checkpoint_start(id, start_seqno));
        let item_bytes = start.size_bytes();
        Self {
            id,
            vbid,
            state: CheckpointState::Open,
            ckpt_type,
            snap_start,
            snap_end,
            high_completed_seqno,
            items: vec![start],
            key_index: HashMap::new(),
            num_items: 0,
            item_bytes,
            index_key_bytes: 0,
            num_expelled: 0,
            first_seqno: None,
            max_deleted_rev_seqno: None,
            created_at: Instant::now(),
        }
    }

    pub fn id(&self) -> CheckpointId {
        self.id
    }

    pub fn state(&self) -> CheckpointState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == CheckpointState::Open
    }

    pub fn checkpoint_type(&self) -> CheckpointType {
        self.ckpt_type
    }

    pub fn snapshot_range(&self) -> SnapshotRange {
        SnapshotRange::new(self.snap_start, self.snap_end)
    }

    /// Snapshot range with the start clamped up to the first item actually
    /// queued, so a range never claims seqnos that predate the checkpoint's
    /// content.
    pub fn effective_snapshot_range(&self) -> SnapshotRange {
        let start = match self.first_seqno {
            Some(seqno) => self.snap_start.max(seqno as u64),
            None => self.snap_start,
        };
        SnapshotRange::new(start, self.snap_end)
    }

    pub(crate) fn set_snapshot_range(&mut self, range: SnapshotRange, hcs: Option<u64>) {
        self.snap_start = range.start;
        self.snap_end = range.end;
        self.high_completed_seqno = hcs;
    }

    pub(crate) fn extend_snapshot_end(&mut self, snap_end: u64) {
        self.snap_end = self.snap_end.max(snap_end);
    }

    /// Re-labels an untouched open checkpoint; only valid while it holds
    /// nothing beyond its `checkpoint_start` marker.
    pub(crate) fn set_type(&mut self, ckpt_type: CheckpointType) {
        debug_assert_eq!(self.num_items, 0);
        self.ckpt_type = ckpt_type;
    }

    pub fn high_completed_seqno(&self) -> Option<u64> {
        self.high_completed_seqno
    }

    /// Count of non-meta items currently held (expelled items excluded).
    pub fn num_items(&self) -> usize {
        self.num_items
    }

    pub fn num_expelled(&self) -> usize {
        self.num_expelled
    }

    pub(crate) fn max_deleted_rev_seqno(&self) -> Option<u64> {
        self.max_deleted_rev_seqno
    }

    pub(crate) fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// Total logical length including expelled slots and meta items.
    pub(crate) fn logical_len(&self) -> usize {
        self.items.len() + self.num_expelled
    }

    /// Resolves a logical offset to the retained item it denotes, if any.
    pub(crate) fn get(&self, logical: usize) -> Option<&Arc<QueuedItem>> {
        match self.physical(logical) {
            Some(physical) => self.items.get(physical),
            None => None,
        }
    }

    fn physical(&self, logical: usize) -> Option<usize> {
        if logical == 0 {
            Some(0)
        } else if logical <= self.num_expelled {
            None
        } else {
            Some(logical - self.num_expelled)
        }
    }

    /// First logical offset holding an item with `by_seqno > seqno`, or the
    /// logical length when every retained item is at or below it.
    pub(crate) fn find_offset_after_seqno(&self, seqno: u64) -> usize {
        for (physical, item) in self.items.iter().enumerate() {
            if item.by_seqno > seqno as i64 {
                return if physical == 0 {
                    0
                } else {
                    physical + self.num_expelled
                };
            }
        }
        self.logical_len()
    }

    /// Memory footprint: fixed overhead, retained item bytes, dedup index.
    pub fn memory_usage(&self) -> usize {
        self.memory_overhead() + self.item_bytes
    }

    /// Non-payload part of the footprint.
    pub fn memory_overhead(&self) -> usize {
        CHECKPOINT_OVERHEAD
            + self.index_key_bytes
            + self.key_index.len() * INDEX_ENTRY_OVERHEAD
    }

    /// True when queueing `key` would have to replace an occurrence that a
    /// cursor in this checkpoint has read or is about to read. The caller
    /// must then roll the checkpoint instead of deduplicating.
    pub(crate) fn dedup_blocked(&self, key: Option<&[u8]>, cursor_offsets: &[usize]) -> bool {
        let Some(key) = key else { return false };
        match self.key_index.get(key) {
            Some(&offset) => cursor_offsets.iter().any(|&c| c >= offset),
            None => false,
        }
    }

    /// Appends `item`, deduplicating against a live occurrence of the same
    /// key ("back of queue": the old entry is removed, the new one appended).
    ///
    /// The caller has already established via [`Self::dedup_blocked`] that no
    /// cursor still needs the old occurrence.
    pub(crate) fn queue_item(&mut self, item: QueuedItem) -> Result<QueueItemStatus> {
        if self.state == CheckpointState::Closed {
            return Err(CheckpointError::ClosedCheckpoint(self.id.0));
        }
        let item = Arc::new(item);
        if !item.is_meta_item() {
            if self.first_seqno.is_none() {
                self.first_seqno = Some(item.by_seqno);
            }
            if item.op.is_deletion() {
                self.max_deleted_rev_seqno = Some(
                    self.max_deleted_rev_seqno
                        .map_or(item.rev_seqno, |m| m.max(item.rev_seqno)),
                );
            }
        }

        let existing = item
            .key()
            .filter(|_| !item.is_meta_item())
            .and_then(|key| self.key_index.get(key).copied());

        match existing {
            Some(offset) => {
                let physical = self
                    .physical(offset)
                    .ok_or(CheckpointError::InvariantViolation(
                        "dedup index references an expelled offset",
                    ))?;
                let old = self.items.remove(physical);
                self.item_bytes -= old.size_bytes();
                self.item_bytes += item.size_bytes();
                // Removal shifts every later occurrence down one slot.
                for slot in self.key_index.values_mut() {
                    if *slot > offset {
                        *slot -= 1;
                    }
                }
                self.items.push(Arc::clone(&item));
                let tail = self.logical_len() - 1;
                if let Some(key) = item.key() {
                    self.key_index.insert(key.to_vec(), tail);
                }
                trace!(
                    vbid = %self.vbid,
                    checkpoint = %self.id,
                    seqno = item.by_seqno,
                    "checkpoint.queue.dedup"
                );
                Ok(QueueItemStatus::ExistingItem)
            }
            None => {
                self.item_bytes += item.size_bytes();
                if !item.is_meta_item() {
                    self.num_items += 1;
                    if let Some(key) = item.key() {
                        self.index_key_bytes += key.len();
                        self.key_index.insert(key.to_vec(), self.logical_len());
                    }
                }
                self.items.push(item);
                Ok(QueueItemStatus::NewItem)
            }
        }
    }

    /// Closes the checkpoint: appends the `checkpoint_end` meta item and
    /// drops the dedup index (closed content is frozen, so it can no longer
    /// deduplicate).
    pub(crate) fn close(&mut self, end_seqno: i64) {
        debug_assert_eq!(self.state, CheckpointState::Open);
        let end = Arc::new(QueuedItem::checkpoint_end(self.id, end_seqno));
        self.item_bytes += end.size_bytes();
        self.items.push(end);
        self.state = CheckpointState::Closed;
        self.key_index.clear();
        self.index_key_bytes = 0;
    }

    /// Removes items in logical range `[1, upto)` — everything strictly
    /// behind `upto` except the `checkpoint_start` marker. The snapshot
    /// range, id, state and type are untouched; only the sequence shortens.
    pub(crate) fn expel_items_before(&mut self, upto: usize) -> ExpelledItems {
        let mut upto = upto.min(self.logical_len());
        if self.state == CheckpointState::Closed {
            // The trailing checkpoint_end marker is never expelled.
            upto = upto.min(self.logical_len() - 1);
        }
        let from = self.num_expelled + 1;
        if upto <= from {
            return ExpelledItems::default();
        }

        let mut out = ExpelledItems::default();
        let physical_end = upto - self.num_expelled;
        for item in self.items.drain(1..physical_end) {
            out.items += 1;
            out.bytes += item.size_bytes();
            if !item.is_meta_item() {
                out.non_meta += 1;
            }
        }
        self.num_items -= out.non_meta;
        self.item_bytes -= out.bytes;
        if !self.key_index.is_empty() {
            // Entries pointing into the expelled region lose their dedup
            // window; later writes of those keys append as new items.
            let mut dropped_key_bytes = 0;
            self.key_index.retain(|key, &mut slot| {
                if slot < upto {
                    dropped_key_bytes += key.len();
                    false
                } else {
                    true
                }
            });
            self.index_key_bytes -= dropped_key_bytes;
        }
        self.num_expelled = upto - 1;
        trace!(
            vbid = %self.vbid,
            checkpoint = %self.id,
            expelled = out.items,
            bytes = out.bytes,
            "checkpoint.expel"
        );
        out
    }
}
