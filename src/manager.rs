use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::mem;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::checkpoint::{Checkpoint, QueueItemStatus};
use crate::config::CheckpointConfig;
use crate::cursor::{
    CheckpointCursor, CursorHandle, CursorPos, CursorRegResult, PERSISTENCE_CURSOR_NAME,
};
use crate::error::{CheckpointError, Result};
use crate::hlc::{HybridLogicalClock, PreLinkContext};
use crate::item::QueuedItem;
use crate::stats::BucketStats;
use crate::types::{
    CheckpointId, CheckpointState, CheckpointType, SnapshotInfo, SnapshotRange, VBucketState, Vbid,
};

/// Invoked (outside the manager lock) whenever the persistence queue grows,
/// so the flusher can wake and drain.
pub type FlusherCallback = Arc<dyn Fn(Vbid) + Send + Sync>;

/// Invoked (outside the manager lock) when a new open checkpoint is created,
/// so paused replication consumers can retry. Receives the high seqno at the
/// time of creation.
pub type NewCheckpointCallback = Arc<dyn Fn(Vbid, u64) + Send + Sync>;

/// Snapshot range of one checkpoint visited by a drain, with the
/// high-completed-seqno carried by disk checkpoints.
#[derive(Clone, Copy, Debug)]
pub struct CheckpointSnapshotRange {
    pub range: SnapshotRange,
    pub high_completed_seqno: Option<u64>,
}

/// Result of draining a cursor.
///
/// `items` preserves enqueue order and includes the checkpoint meta markers;
/// consumers that only want documents filter on
/// [`QueuedItem::is_meta_item`]. `ranges` holds one entry per checkpoint
/// items were taken from, in visit order.
#[derive(Debug)]
pub struct ItemsForCursor {
    pub items: Vec<Arc<QueuedItem>>,
    pub ranges: Vec<CheckpointSnapshotRange>,
    /// True when the drain stopped short of the open checkpoint's tail
    /// (bounded by `approx_limit` or by a Memory/Disk boundary).
    pub more_available: bool,
    pub checkpoint_type: CheckpointType,
    pub max_deleted_rev_seqno: Option<u64>,
}

impl Default for ItemsForCursor {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            ranges: Vec::new(),
            more_available: false,
            checkpoint_type: CheckpointType::Memory,
            max_deleted_rev_seqno: None,
        }
    }
}

/// Outcome of one expel pass over a manager.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExpelResult {
    pub expel_count: usize,
    pub estimate_of_free_memory: usize,
}

/// Outcome of [`CheckpointManager::remove_closed_unref_checkpoints`].
#[derive(Clone, Copy, Debug, Default)]
pub struct RemovalResult {
    /// Non-meta items released with the removed checkpoints.
    pub items_released: usize,
    /// Whether an exhausted open checkpoint was rolled so it can be
    /// reclaimed on a later pass.
    pub new_open_checkpoint: bool,
}

struct Inner {
    list: VecDeque<Checkpoint>,
    cursors: HashMap<String, Arc<CheckpointCursor>>,
    last_by_seqno: i64,
    pcursor_pre_checkpoint_id: u64,
    /// Non-meta items across the whole list.
    num_items: usize,
}

/// Ordered list of checkpoints for one partition.
///
/// A single mutex serializes every mutation of the list, the cursor map and
/// the seqno counter; drains hold it only for the duration of one call, so
/// consumers are free to read in arbitrary-size chunks. Exactly one
/// checkpoint is open at any time and it is always the last element.
pub struct CheckpointManager {
    vbid: Vbid,
    config: Arc<CheckpointConfig>,
    stats: Arc<BucketStats>,
    hlc: HybridLogicalClock,
    flusher_cb: Option<FlusherCallback>,
    new_checkpoint_cb: Option<NewCheckpointCallback>,
    inner: Mutex<Inner>,
}

impl CheckpointManager {
    pub fn new(
        vbid: Vbid,
        config: Arc<CheckpointConfig>,
        stats: Arc<BucketStats>,
        last_seqno: i64,
        last_snap_start: u64,
        last_snap_end: u64,
    ) -> Self {
        Self::with_callbacks(
            vbid, config, stats, last_seqno, last_snap_start, last_snap_end, None, None,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_callbacks(
        vbid: Vbid,
        config: Arc<CheckpointConfig>,
        stats: Arc<BucketStats>,
        last_seqno: i64,
        last_snap_start: u64,
        last_snap_end: u64,
        flusher_cb: Option<FlusherCallback>,
        new_checkpoint_cb: Option<NewCheckpointCallback>,
    ) -> Self {
        let first = Checkpoint::new(
            CheckpointId(1),
            vbid,
            last_snap_start,
            last_snap_end,
            None,
            CheckpointType::Memory,
            last_seqno + 1,
        );
        stats.checkpoint_created();
        stats.add_checkpoint_memory(first.memory_usage() as u64);

        let mut cursors = HashMap::new();
        let pcursor = CheckpointCursor::new(
            PERSISTENCE_CURSOR_NAME,
            false,
            CursorPos {
                checkpoint_id: first.id(),
                offset: 0,
            },
        );
        cursors.insert(PERSISTENCE_CURSOR_NAME.to_string(), pcursor);

        let mut list = VecDeque::new();
        list.push_back(first);
        Self {
            vbid,
            config,
            stats,
            hlc: HybridLogicalClock::new(),
            flusher_cb,
            new_checkpoint_cb,
            inner: Mutex::new(Inner {
                list,
                cursors,
                last_by_seqno: last_seqno,
                pcursor_pre_checkpoint_id: 0,
                num_items: 0,
            }),
        }
    }

    pub fn vbid(&self) -> Vbid {
        self.vbid
    }

    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    // ---------------------------------------------------------------- queueing

    /// Queues a mutation into the open checkpoint, creating a new checkpoint
    /// first when the creation policy demands one.
    ///
    /// Returns `Ok(true)` when the logical persistence queue grew by one,
    /// i.e. the item went in as a new entry rather than replacing a
    /// still-unpersisted occurrence of the same key.
    pub fn queue_dirty(
        &self,
        mut item: QueuedItem,
        generate_seqno: bool,
        generate_cas: bool,
        pre_link: Option<&dyn PreLinkContext>,
    ) -> Result<bool> {
        if item.is_meta_item() {
            return Err(CheckpointError::InvariantViolation(
                "meta items are queued by the manager itself",
            ));
        }
        // Quota gate: the mutation is rejected outright and the caller
        // retries once backpressure has drained memory.
        if self.stats.memory_used() > self.config.max_size as u64 {
            return Err(CheckpointError::MemoryExhausted);
        }

        let mut rolled = None;
        let grew;
        let seqno;
        {
            let mut inner = self.inner.lock();
            if let Some(prev_id) = self.maybe_create_checkpoint_locked(&mut inner, false, item.key())? {
                rolled = Some(prev_id);
            }

            if generate_seqno {
                inner.last_by_seqno += 1;
                item.by_seqno = inner.last_by_seqno;
            } else {
                if item.by_seqno <= inner.last_by_seqno {
                    return Err(CheckpointError::NonMonotonicSeqno {
                        got: item.by_seqno,
                        last: inner.last_by_seqno,
                    });
                }
                inner.last_by_seqno = item.by_seqno;
            }
            seqno = item.by_seqno;

            if generate_cas {
                item.cas = self.hlc.next();
                if let Some(ctx) = pre_link {
                    ctx.pre_link(item.cas);
                }
            }

            let open = Self::open_mut(&mut inner)?;
            match open.checkpoint_type() {
                CheckpointType::Memory => open.extend_snapshot_end(seqno as u64),
                CheckpointType::Disk => {
                    if !open.snapshot_range().contains(seqno as u64) {
                        return Err(CheckpointError::InvariantViolation(
                            "item seqno outside the disk checkpoint's snapshot range",
                        ));
                    }
                }
            }

            let before = open.memory_usage();
            let status = open.queue_item(item)?;
            let after = open.memory_usage();
            self.apply_mem_delta(before, after);
            grew = status == QueueItemStatus::NewItem;
            if grew {
                inner.num_items += 1;
            }
        }

        if let Some(prev_id) = rolled {
            self.notify_new_checkpoint(prev_id, seqno as u64);
        }
        if grew {
            if let Some(cb) = &self.flusher_cb {
                cb(self.vbid);
            }
        }
        Ok(grew)
    }

    /// Queues a `set_vbucket_state` marker into the open checkpoint. The
    /// marker is stamped with the next seqno without consuming it and is
    /// never deduplicated.
    pub fn queue_set_vbucket_state(&self, state: VBucketState) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            let seqno = inner.last_by_seqno + 1;
            let open = Self::open_mut(&mut inner)?;
            let before = open.memory_usage();
            open.queue_item(QueuedItem::set_vbucket_state(state, seqno))?;
            let after = open.memory_usage();
            self.apply_mem_delta(before, after);
        }
        if let Some(cb) = &self.flusher_cb {
            cb(self.vbid);
        }
        Ok(())
    }

    /// Forces a new open checkpoint (e.g. to unfreeze a dedup window held
    /// open by memory recovery). No-op when the open checkpoint is empty.
    /// Returns the id of the open checkpoint after the call.
    pub fn create_new_checkpoint(&self) -> Result<u64> {
        let rolled;
        let open_id;
        let high;
        {
            let mut inner = self.inner.lock();
            rolled = self.maybe_create_checkpoint_locked(&mut inner, true, None)?;
            high = inner.last_by_seqno as u64;
            open_id = Self::open_ref(&inner)?.id().0;
        }
        if let Some(prev_id) = rolled {
            self.notify_new_checkpoint(prev_id, high);
        }
        Ok(open_id)
    }

    // ------------------------------------------------------------- snapshots

    /// Starts a new snapshot. An untouched open checkpoint (nothing but its
    /// `checkpoint_start` marker) is re-labelled in place — range, type and
    /// `hcs` — so replicas do not leave husk checkpoints behind; otherwise
    /// the open checkpoint is closed and a new one opened with the given
    /// attributes.
    pub fn create_snapshot(
        &self,
        snap_start: u64,
        snap_end: u64,
        high_completed_seqno: Option<u64>,
        ckpt_type: CheckpointType,
    ) -> Result<()> {
        if high_completed_seqno.is_some() && ckpt_type != CheckpointType::Disk {
            return Err(CheckpointError::InvariantViolation(
                "highCompletedSeqno is only valid for disk snapshots",
            ));
        }
        let mut rolled = None;
        let high;
        {
            let mut inner = self.inner.lock();
            high = inner.last_by_seqno as u64;
            let open = Self::open_mut(&mut inner)?;
            if open.logical_len() == 1 {
                let before = open.memory_usage();
                open.set_snapshot_range(SnapshotRange::new(snap_start, snap_end), high_completed_seqno);
                open.set_type(ckpt_type);
                let after = open.memory_usage();
                self.apply_mem_delta(before, after);
            } else {
                let prev_id = self.close_and_open_locked(
                    &mut inner,
                    snap_start,
                    snap_end,
                    high_completed_seqno,
                    ckpt_type,
                )?;
                rolled = Some(prev_id);
            }
        }
        if let Some(prev_id) = rolled {
            self.notify_new_checkpoint(prev_id, high);
        }
        Ok(())
    }

    /// Extends the open checkpoint's snapshot end. The given type must match
    /// the open checkpoint's.
    pub fn update_current_snapshot(&self, snap_end: u64, ckpt_type: CheckpointType) -> Result<()> {
        let mut inner = self.inner.lock();
        let open = Self::open_mut(&mut inner)?;
        if open.checkpoint_type() != ckpt_type {
            return Err(CheckpointError::InvariantViolation(
                "snapshot update type does not match the open checkpoint",
            ));
        }
        open.extend_snapshot_end(snap_end);
        Ok(())
    }

    pub fn snapshot_info(&self) -> SnapshotInfo {
        let inner = self.inner.lock();
        let range = inner
            .list
            .back()
            .map(|ck| ck.effective_snapshot_range())
            .unwrap_or(SnapshotRange { start: 0, end: 0 });
        SnapshotInfo {
            start: inner.last_by_seqno as u64,
            range,
        }
    }

    pub fn open_snapshot_start_seqno(&self) -> u64 {
        self.snapshot_info().range.start
    }

    // --------------------------------------------------------------- cursors

    /// Registers (or re-registers) a named cursor at the position following
    /// `start_by_seqno`. Items at exactly `start_by_seqno` are considered
    /// already observed by the consumer.
    ///
    /// `droppable` opts the cursor into memory-recovery cursor dropping;
    /// the persistence cursor can never be registered through this path.
    pub fn register_cursor(
        &self,
        name: &str,
        start_by_seqno: u64,
        droppable: bool,
    ) -> Result<CursorRegResult> {
        if name == PERSISTENCE_CURSOR_NAME {
            return Err(CheckpointError::InvariantViolation(
                "the persistence cursor is registered by the manager itself",
            ));
        }
        let mut rolled = None;
        let high;
        let result;
        {
            let mut inner = self.inner.lock();
            high = inner.last_by_seqno as u64;
            if inner.cursors.remove(name).is_some() {
                debug!(vbid = %self.vbid, cursor = name, "cursor.reregister");
            }

            let oldest_start = inner
                .list
                .front()
                .map(|ck| ck.snapshot_range().start)
                .unwrap_or(0);
            let try_backfill = start_by_seqno + 1 < oldest_start;

            let open_idx = inner.list.len() - 1;
            let mut idx = open_idx;
            for (i, ck) in inner.list.iter().enumerate() {
                let range = ck.snapshot_range();
                if range.contains(start_by_seqno) || range.start > start_by_seqno {
                    idx = i;
                    break;
                }
            }

            let ck = &inner.list[idx];
            let at_open = idx == open_idx;
            let offset = if at_open && start_by_seqno as i64 >= inner.last_by_seqno {
                ck.logical_len()
            } else {
                ck.find_offset_after_seqno(start_by_seqno)
            };
            let seqno = ck
                .get(offset)
                .map(|item| item.by_seqno as u64)
                .unwrap_or(inner.last_by_seqno as u64 + 1);
            let checkpoint_id = ck.id();

            // Bound the new cursor's first read: a registration landing
            // strictly inside the open checkpoint closes it.
            if at_open && (start_by_seqno as i64) < inner.last_by_seqno && ck.num_items() > 0 {
                rolled = Some(self.roll_open_checkpoint_locked(&mut inner)?);
            }

            let cursor = CheckpointCursor::new(
                name,
                droppable,
                CursorPos {
                    checkpoint_id,
                    offset,
                },
            );
            let handle = CursorHandle::new(&cursor);
            inner.cursors.insert(name.to_string(), cursor);
            debug!(
                vbid = %self.vbid,
                cursor = name,
                start = start_by_seqno,
                seqno,
                try_backfill,
                "cursor.register"
            );
            result = CursorRegResult {
                seqno,
                try_backfill,
                handle,
            };
        }
        if let Some(prev_id) = rolled {
            self.notify_new_checkpoint(prev_id, high);
        }
        Ok(result)
    }

    /// Removes the cursor behind `handle`. Returns false when the handle has
    /// already expired or names the persistence cursor.
    pub fn remove_cursor(&self, handle: &CursorHandle) -> bool {
        match handle.upgrade() {
            Some(cursor) => self.remove_cursor_by_name(cursor.name()),
            None => false,
        }
    }

    pub fn remove_cursor_by_name(&self, name: &str) -> bool {
        if name == PERSISTENCE_CURSOR_NAME {
            return false;
        }
        let removed = self.inner.lock().cursors.remove(name).is_some();
        if removed {
            debug!(vbid = %self.vbid, cursor = name, "cursor.remove");
        }
        removed
    }

    /// Looks up a registered cursor by name.
    pub fn cursor_by_name(&self, name: &str) -> Result<CursorHandle> {
        let inner = self.inner.lock();
        inner
            .cursors
            .get(name)
            .map(CursorHandle::new)
            .ok_or_else(|| CheckpointError::NoSuchCursor(name.to_string()))
    }

    pub fn persistence_cursor(&self) -> CursorHandle {
        let inner = self.inner.lock();
        match inner.cursors.get(PERSISTENCE_CURSOR_NAME) {
            Some(cursor) => CursorHandle::new(cursor),
            // Unreachable by construction; a dead handle keeps the caller on
            // its graceful-abort path.
            None => CursorHandle::new(&CheckpointCursor::new(
                PERSISTENCE_CURSOR_NAME,
                false,
                CursorPos {
                    checkpoint_id: CheckpointId(0),
                    offset: 0,
                },
            )),
        }
    }

    /// Droppable cursors in position order (oldest first), as weak handles
    /// for the memory-recovery path.
    pub fn cursors_eligible_for_drop(&self) -> Vec<CursorHandle> {
        let inner = self.inner.lock();
        let mut eligible: Vec<(usize, usize, &Arc<CheckpointCursor>)> = inner
            .cursors
            .values()
            .filter(|cursor| cursor.is_droppable())
            .filter_map(|cursor| {
                let pos = cursor.pos();
                Self::index_of(&inner, pos.checkpoint_id).map(|idx| (idx, pos.offset, cursor))
            })
            .collect();
        eligible.sort_by_key(|&(idx, offset, _)| (idx, offset));
        eligible
            .into_iter()
            .map(|(_, _, cursor)| CursorHandle::new(cursor))
            .collect()
    }

    // ---------------------------------------------------------------- drains

    /// Drains every available item for the cursor; see
    /// [`Self::get_items_for_cursor`].
    pub fn get_next_items_for_cursor(&self, handle: &CursorHandle) -> ItemsForCursor {
        self.get_items_for_cursor(handle, usize::MAX)
    }

    /// Drains items for the cursor, stopping at the first checkpoint
    /// boundary at or past `approx_limit` non-meta items (drains never stop
    /// in the middle of a checkpoint) and at any Memory/Disk type boundary.
    /// A cursor parked on a type boundary crosses it on the next call.
    ///
    /// An expired handle drains nothing.
    pub fn get_items_for_cursor(&self, handle: &CursorHandle, approx_limit: usize) -> ItemsForCursor {
        let Some(cursor) = handle.upgrade() else {
            warn!(vbid = %self.vbid, "drain.expired_cursor");
            return ItemsForCursor::default();
        };
        let inner = self.inner.lock();
        self.drain_locked(&inner, &cursor, approx_limit)
    }

    pub fn get_next_items_for_persistence(&self) -> ItemsForCursor {
        self.get_items_for_persistence(usize::MAX)
    }

    pub fn get_items_for_persistence(&self, approx_limit: usize) -> ItemsForCursor {
        let inner = self.inner.lock();
        let Some(cursor) = inner.cursors.get(PERSISTENCE_CURSOR_NAME).cloned() else {
            return ItemsForCursor::default();
        };
        self.drain_locked(&inner, &cursor, approx_limit)
    }

    fn drain_locked(
        &self,
        inner: &Inner,
        cursor: &Arc<CheckpointCursor>,
        approx_limit: usize,
    ) -> ItemsForCursor {
        let mut out = ItemsForCursor::default();
        let mut pos = cursor.pos();
        let Some(mut idx) = Self::index_of(inner, pos.checkpoint_id) else {
            error!(
                vbid = %self.vbid,
                cursor = cursor.name(),
                checkpoint = %pos.checkpoint_id,
                "drain.unresolved_checkpoint"
            );
            return out;
        };

        let mut non_meta = 0usize;
        let mut collected_type = None;
        loop {
            let ck = &inner.list[idx];
            let mut collected_here = 0usize;
            while pos.offset < ck.logical_len() {
                if let Some(item) = ck.get(pos.offset) {
                    if !item.is_meta_item() {
                        non_meta += 1;
                    }
                    out.items.push(Arc::clone(item));
                    collected_here += 1;
                }
                pos.offset += 1;
            }
            if collected_here > 0 {
                collected_type.get_or_insert(ck.checkpoint_type());
                out.ranges.push(CheckpointSnapshotRange {
                    range: ck.effective_snapshot_range(),
                    high_completed_seqno: ck.high_completed_seqno(),
                });
                if let Some(rev) = ck.max_deleted_rev_seqno() {
                    out.max_deleted_rev_seqno =
                        Some(out.max_deleted_rev_seqno.map_or(rev, |m| m.max(rev)));
                }
            }

            if ck.is_open() {
                break;
            }
            let next_idx = idx + 1;
            let next = &inner.list[next_idx];
            if next.checkpoint_type() != ck.checkpoint_type() && !out.items.is_empty() {
                // Park on the boundary; the caller's next drain yields the
                // other type's checkpoints on their own.
                out.more_available = true;
                break;
            }
            pos = CursorPos {
                checkpoint_id: next.id(),
                offset: 0,
            };
            idx = next_idx;
            if non_meta >= approx_limit {
                out.more_available = true;
                break;
            }
        }

        out.checkpoint_type = collected_type.unwrap_or_else(|| inner.list[idx].checkpoint_type());
        cursor.set_pos(pos);
        trace!(
            vbid = %self.vbid,
            cursor = cursor.name(),
            items = out.items.len(),
            more = out.more_available,
            "drain"
        );
        out
    }

    /// Exact count of non-meta items the cursor has yet to observe, from its
    /// current position to the tail of the open checkpoint. Unlike some
    /// implementations of this interface, the count does not overshoot.
    pub fn num_items_for_cursor(&self, handle: &CursorHandle) -> usize {
        let Some(cursor) = handle.upgrade() else {
            return 0;
        };
        let inner = self.inner.lock();
        let pos = cursor.pos();
        let Some(idx) = Self::index_of(&inner, pos.checkpoint_id) else {
            return 0;
        };
        let current = &inner.list[idx];
        let mut count = (pos.offset..current.logical_len())
            .filter_map(|offset| current.get(offset))
            .filter(|item| !item.is_meta_item())
            .count();
        for ck in inner.list.iter().skip(idx + 1) {
            count += ck.num_items();
        }
        count
    }

    pub fn num_items_for_persistence(&self) -> usize {
        self.num_items_for_cursor(&self.persistence_cursor())
    }

    /// Records that everything handed to the persistence cursor so far has
    /// been flushed, advancing the persisted-past checkpoint watermark.
    pub fn items_persisted(&self) {
        let mut inner = self.inner.lock();
        if let Some(cursor) = inner.cursors.get(PERSISTENCE_CURSOR_NAME) {
            let id = cursor.pos().checkpoint_id.0;
            inner.pcursor_pre_checkpoint_id = id.saturating_sub(1);
        }
    }

    pub fn persistence_cursor_pre_checkpoint_id(&self) -> u64 {
        self.inner.lock().pcursor_pre_checkpoint_id
    }

    // ------------------------------------------------------ memory recovery

    /// Removes closed checkpoints no cursor references, scanning from the
    /// oldest and stopping at the first referenced one (removing a later
    /// checkpoint while an earlier one remains would tear the snapshot-range
    /// contiguity cursors rely on). At most `limit` checkpoints are removed.
    pub fn remove_closed_unref_checkpoints(&self, limit: usize) -> RemovalResult {
        let mut inner = self.inner.lock();
        let referenced: HashSet<CheckpointId> = inner
            .cursors
            .values()
            .map(|cursor| cursor.pos().checkpoint_id)
            .collect();

        let mut result = RemovalResult::default();
        let mut removed = 0usize;
        let mut freed_bytes = 0usize;
        while inner.list.len() > 1 && removed < limit {
            let front = &inner.list[0];
            if front.state() != CheckpointState::Closed || referenced.contains(&front.id()) {
                break;
            }
            if let Some(ck) = inner.list.pop_front() {
                trace!(
                    vbid = %self.vbid,
                    checkpoint = %ck.id(),
                    items = ck.num_items(),
                    "checkpoint.remove"
                );
                result.items_released += ck.num_items();
                freed_bytes += ck.memory_usage();
                removed += 1;
            }
        }
        inner.num_items -= result.items_released;
        self.stats.sub_checkpoint_memory(freed_bytes as u64);
        self.stats.checkpoint_destroyed(removed as u64);
        self.stats.add_items_removed(result.items_released as u64);

        // An open checkpoint drained down to a husk by expel keeps its
        // metadata alive until it is rolled; roll it here so the next pass
        // can reclaim it. Virgin empty checkpoints are left alone.
        if inner.list.len() == 1 && removed < limit {
            let roll = {
                let open = &inner.list[0];
                open.num_items() == 0 && open.num_expelled() > 0
            };
            if roll {
                if let Ok(prev_id) = self.roll_open_checkpoint_locked(&mut inner) {
                    let new_id = inner
                        .list
                        .back()
                        .map(|ck| ck.id())
                        .unwrap_or(CheckpointId(0));
                    for cursor in inner.cursors.values() {
                        if cursor.pos().checkpoint_id.0 == prev_id {
                            cursor.set_pos(CursorPos {
                                checkpoint_id: new_id,
                                offset: 0,
                            });
                        }
                    }
                    result.new_open_checkpoint = true;
                }
            }
        }

        if removed > 0 {
            debug!(
                vbid = %self.vbid,
                removed,
                items = result.items_released,
                bytes = freed_bytes,
                "checkpoint.remove_closed_unref"
            );
        }
        result
    }

    /// Expels already-read items from the oldest checkpoint still holding a
    /// cursor. The checkpoint keeps its identity, snapshot range and type;
    /// only its item sequence is compacted.
    pub fn expel_unreferenced_checkpoint_items(&self) -> ExpelResult {
        let mut inner = self.inner.lock();
        let mut target = None;
        for (idx, ck) in inner.list.iter().enumerate() {
            let id = ck.id();
            if inner
                .cursors
                .values()
                .any(|cursor| cursor.pos().checkpoint_id == id)
            {
                target = Some((idx, id));
                break;
            }
        }
        let Some((idx, id)) = target else {
            return ExpelResult::default();
        };
        let min_offset = inner
            .cursors
            .values()
            .map(|cursor| cursor.pos())
            .filter(|pos| pos.checkpoint_id == id)
            .map(|pos| pos.offset)
            .min()
            .unwrap_or(0);

        let ck = &mut inner.list[idx];
        let before = ck.memory_usage();
        let expelled = ck.expel_items_before(min_offset);
        let after = ck.memory_usage();
        inner.num_items -= expelled.non_meta;
        self.stats.sub_checkpoint_memory((before - after) as u64);
        self.stats.add_items_expelled(expelled.items as u64);
        if expelled.items > 0 {
            debug!(
                vbid = %self.vbid,
                checkpoint = %id,
                expelled = expelled.items,
                bytes = before - after,
                "checkpoint.expel_unreferenced"
            );
        }
        ExpelResult {
            expel_count: expelled.items,
            estimate_of_free_memory: before - after,
        }
    }

    /// Re-homes every cursor of `other` to the start of this manager's open
    /// checkpoint, clearing them from `other` (which keeps its checkpoints
    /// and receives a fresh persistence cursor). Used during partition
    /// reset.
    pub fn take_and_reset_cursors(&self, other: &CheckpointManager) {
        if std::ptr::eq(self, other) {
            return;
        }
        // Address order avoids deadlock between two concurrent swaps. Both
        // branches yield (self guard, other guard); only acquisition order
        // differs.
        let (mut self_guard, mut other_guard) = {
            if (self as *const Self as usize) < (other as *const Self as usize) {
                (self.inner.lock(), other.inner.lock())
            } else {
                let other_guard = other.inner.lock();
                let self_guard = self.inner.lock();
                (self_guard, other_guard)
            }
        };
        let self_inner = &mut *self_guard;
        let other_inner = &mut *other_guard;

        let open_id = match self_inner.list.back() {
            Some(ck) => ck.id(),
            None => return,
        };
        let taken = mem::take(&mut other_inner.cursors);
        for (name, cursor) in taken {
            cursor.set_pos(CursorPos {
                checkpoint_id: open_id,
                offset: 0,
            });
            self_inner.cursors.insert(name, cursor);
        }

        // The source must keep a persistence cursor for its lifetime.
        if let Some(ck) = other_inner.list.back() {
            let pos = CursorPos {
                checkpoint_id: ck.id(),
                offset: 0,
            };
            other_inner.cursors.insert(
                PERSISTENCE_CURSOR_NAME.to_string(),
                CheckpointCursor::new(PERSISTENCE_CURSOR_NAME, false, pos),
            );
        }
        debug!(vbid = %self.vbid, from = %other.vbid, "cursors.take_and_reset");
    }

    /// Discards every checkpoint, resets the seqno counter and recreates a
    /// single open checkpoint; all cursors are repositioned to its start.
    pub fn clear(&self, vb_state: VBucketState) {
        debug!(vbid = %self.vbid, state = ?vb_state, "manager.clear");
        self.clear_with_seqno(0);
    }

    pub fn clear_with_seqno(&self, seqno: u64) {
        let mut inner = self.inner.lock();
        let freed: usize = inner.list.iter().map(Checkpoint::memory_usage).sum();
        let destroyed = inner.list.len();
        let next_id = inner
            .list
            .back()
            .map(|ck| ck.id().next())
            .unwrap_or(CheckpointId(1));
        self.stats.sub_checkpoint_memory(freed as u64);
        self.stats.checkpoint_destroyed(destroyed as u64);

        inner.list.clear();
        inner.last_by_seqno = seqno as i64;
        inner.num_items = 0;
        let first = Checkpoint::new(
            next_id,
            self.vbid,
            seqno + 1,
            seqno,
            None,
            CheckpointType::Memory,
            seqno as i64 + 1,
        );
        self.stats.checkpoint_created();
        self.stats.add_checkpoint_memory(first.memory_usage() as u64);
        inner.list.push_back(first);
        for cursor in inner.cursors.values() {
            cursor.set_pos(CursorPos {
                checkpoint_id: next_id,
                offset: 0,
            });
        }
    }

    // --------------------------------------------------------- introspection

    /// Non-meta items across all checkpoints of this manager.
    pub fn num_items(&self) -> usize {
        self.inner.lock().num_items
    }

    pub fn num_open_checkpoint_items(&self) -> usize {
        let inner = self.inner.lock();
        inner.list.back().map_or(0, Checkpoint::num_items)
    }

    pub fn num_checkpoints(&self) -> usize {
        self.inner.lock().list.len()
    }

    pub fn num_cursors(&self) -> usize {
        self.inner.lock().cursors.len()
    }

    pub fn open_checkpoint_id(&self) -> u64 {
        let inner = self.inner.lock();
        inner.list.back().map_or(0, |ck| ck.id().0)
    }

    pub fn last_closed_checkpoint_id(&self) -> u64 {
        let inner = self.inner.lock();
        inner
            .list
            .iter()
            .rev()
            .find(|ck| ck.state() == CheckpointState::Closed)
            .map_or(0, |ck| ck.id().0)
    }

    pub fn high_seqno(&self) -> i64 {
        self.inner.lock().last_by_seqno
    }

    /// Advances the seqno counter past externally assigned seqnos. Rejects
    /// regressions.
    pub fn set_by_seqno(&self, seqno: i64) -> Result<()> {
        let mut inner = self.inner.lock();
        if seqno < inner.last_by_seqno {
            return Err(CheckpointError::NonMonotonicSeqno {
                got: seqno,
                last: inner.last_by_seqno,
            });
        }
        inner.last_by_seqno = seqno;
        Ok(())
    }

    /// Reserves and returns the next seqno without queueing an item.
    pub fn next_by_seqno(&self) -> i64 {
        let mut inner = self.inner.lock();
        inner.last_by_seqno += 1;
        inner.last_by_seqno
    }

    pub fn is_open_checkpoint_disk(&self) -> bool {
        let inner = self.inner.lock();
        inner
            .list
            .back()
            .is_some_and(|ck| ck.checkpoint_type() == CheckpointType::Disk)
    }

    pub fn memory_usage(&self) -> usize {
        self.inner.lock().list.iter().map(Checkpoint::memory_usage).sum()
    }

    pub fn memory_overhead(&self) -> usize {
        self.inner
            .lock()
            .list
            .iter()
            .map(Checkpoint::memory_overhead)
            .sum()
    }

    /// Memory held by closed checkpoints no cursor references — what a
    /// successful cursor drop would let the next removal pass reclaim.
    pub fn memory_usage_of_unref_checkpoints(&self) -> usize {
        let inner = self.inner.lock();
        let referenced: HashSet<CheckpointId> = inner
            .cursors
            .values()
            .map(|cursor| cursor.pos().checkpoint_id)
            .collect();
        inner
            .list
            .iter()
            .filter(|ck| ck.state() == CheckpointState::Closed && !referenced.contains(&ck.id()))
            .map(Checkpoint::memory_usage)
            .sum()
    }

    pub fn has_closed_unref_checkpoints(&self) -> bool {
        let inner = self.inner.lock();
        let referenced: HashSet<CheckpointId> = inner
            .cursors
            .values()
            .map(|cursor| cursor.pos().checkpoint_id)
            .collect();
        inner
            .list
            .iter()
            .any(|ck| ck.state() == CheckpointState::Closed && !referenced.contains(&ck.id()))
    }

    // --------------------------------------------------------------- helpers

    fn open_ref<'a>(inner: &'a Inner) -> Result<&'a Checkpoint> {
        inner
            .list
            .back()
            .ok_or(CheckpointError::InvariantViolation("checkpoint list is empty"))
    }

    fn open_mut<'a>(inner: &'a mut Inner) -> Result<&'a mut Checkpoint> {
        inner
            .list
            .back_mut()
            .ok_or(CheckpointError::InvariantViolation("checkpoint list is empty"))
    }

    fn index_of(inner: &Inner, id: CheckpointId) -> Option<usize> {
        inner.list.iter().position(|ck| ck.id() == id)
    }

    fn cursor_offsets_in(inner: &Inner, id: CheckpointId) -> Vec<usize> {
        inner
            .cursors
            .values()
            .map(|cursor| cursor.pos())
            .filter(|pos| pos.checkpoint_id == id)
            .map(|pos| pos.offset)
            .collect()
    }

    fn apply_mem_delta(&self, before: usize, after: usize) {
        if after >= before {
            self.stats.add_checkpoint_memory((after - before) as u64);
        } else {
            self.stats.sub_checkpoint_memory((before - after) as u64);
        }
    }

    /// Evaluates the checkpoint-creation policy; rolls the open checkpoint
    /// and returns the previous open id when a trigger fires.
    fn maybe_create_checkpoint_locked(
        &self,
        inner: &mut Inner,
        force: bool,
        incoming_key: Option<&[u8]>,
    ) -> Result<Option<u64>> {
        let (blocked, count_trigger, time_trigger, empty) = {
            let open = Self::open_ref(inner)?;
            let offsets = Self::cursor_offsets_in(inner, open.id());
            let is_memory = open.checkpoint_type() == CheckpointType::Memory;
            (
                open.dedup_blocked(incoming_key, &offsets),
                is_memory && open.num_items() >= self.config.max_checkpoint_items,
                is_memory
                    && open.num_items() > 0
                    && open.age() >= self.config.max_checkpoint_time,
                open.num_items() == 0 && open.num_expelled() == 0,
            )
        };
        let force = force && !empty;
        if !(force || blocked || count_trigger || time_trigger) {
            return Ok(None);
        }
        trace!(
            vbid = %self.vbid,
            force,
            blocked,
            count_trigger,
            time_trigger,
            "checkpoint.roll"
        );
        self.roll_open_checkpoint_locked(inner).map(Some)
    }

    /// Closes the open checkpoint and opens its successor: Memory
    /// checkpoints start a fresh range at the next seqno, a rolled Disk
    /// checkpoint continues its remaining range and keeps its `hcs`.
    fn roll_open_checkpoint_locked(&self, inner: &mut Inner) -> Result<u64> {
        let (snap_start, snap_end, hcs, ckpt_type) = {
            let open = Self::open_ref(inner)?;
            let next_start = (inner.last_by_seqno + 1) as u64;
            match open.checkpoint_type() {
                CheckpointType::Memory => (
                    next_start,
                    inner.last_by_seqno as u64,
                    None,
                    CheckpointType::Memory,
                ),
                CheckpointType::Disk => (
                    next_start,
                    open.snapshot_range().end,
                    open.high_completed_seqno(),
                    CheckpointType::Disk,
                ),
            }
        };
        self.close_and_open_locked(inner, snap_start, snap_end, hcs, ckpt_type)
    }

    fn close_and_open_locked(
        &self,
        inner: &mut Inner,
        snap_start: u64,
        snap_end: u64,
        high_completed_seqno: Option<u64>,
        ckpt_type: CheckpointType,
    ) -> Result<u64> {
        let end_seqno = inner.last_by_seqno + 1;
        let prev_id;
        {
            let open = Self::open_mut(inner)?;
            prev_id = open.id();
            let before = open.memory_usage();
            open.close(end_seqno);
            let after = open.memory_usage();
            self.apply_mem_delta(before, after);
        }
        let next = Checkpoint::new(
            prev_id.next(),
            self.vbid,
            snap_start,
            snap_end,
            high_completed_seqno,
            ckpt_type,
            end_seqno,
        );
        self.stats.checkpoint_created();
        self.stats.add_checkpoint_memory(next.memory_usage() as u64);
        debug!(
            vbid = %self.vbid,
            closed = %prev_id,
            opened = %next.id(),
            ckpt_type = ?ckpt_type,
            "checkpoint.open"
        );
        inner.list.push_back(next);
        Ok(prev_id.0)
    }

    fn notify_new_checkpoint(&self, prev_id: u64, high_seqno: u64) {
        trace!(vbid = %self.vbid, prev = prev_id, "checkpoint.notify");
        if let Some(cb) = &self.new_checkpoint_cb {
            cb(self.vbid, high_seqno);
        }
    }
}

impl Drop for CheckpointManager {
    fn drop(&mut self) {
        let inner = self.inner.lock();
        let total: usize = inner.list.iter().map(Checkpoint::memory_usage).sum();
        self.stats.sub_checkpoint_memory(total as u64);
        self.stats.checkpoint_destroyed(inner.list.len() as u64);
    }
}

impl fmt::Display for CheckpointManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        write!(
            f,
            "CheckpointManager[{}] high_seqno={} items={}",
            self.vbid, inner.last_by_seqno, inner.num_items
        )?;
        for ck in &inner.list {
            write!(
                f,
                " {{id={} {:?} {:?} snap={} items={} expelled={}}}",
                ck.id(),
                ck.state(),
                ck.checkpoint_type(),
                ck.snapshot_range(),
                ck.num_items(),
                ck.num_expelled()
            )?;
        }
        Ok(())
    }
}
