use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::types::CheckpointId;

/// Name of the distinguished cursor drained by the persistence layer. It is
/// created with its manager, never droppable, and exists for the manager's
/// whole lifetime.
pub const PERSISTENCE_CURSOR_NAME: &str = "persistence";

/// Position of a cursor inside a manager's checkpoint list.
///
/// `offset` is the logical index of the next item the cursor will read
/// (0 is the `checkpoint_start` meta item). Logical offsets are stable
/// across expel, which only shortens the physical sequence. The position is
/// re-resolved against the list under the manager lock on every use.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct CursorPos {
    pub checkpoint_id: CheckpointId,
    pub offset: usize,
}

/// A named, forward-only reading position owned by the manager.
///
/// The manager holds the `Arc`; consumers hold a [`CursorHandle`]. The
/// position mutex is only ever taken while the owning manager's lock is
/// held, so cursor state cannot drift from the list it indexes into.
#[derive(Debug)]
pub struct CheckpointCursor {
    name: String,
    droppable: bool,
    pos: Mutex<CursorPos>,
}

impl CheckpointCursor {
    pub(crate) fn new(name: impl Into<String>, droppable: bool, pos: CursorPos) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            droppable,
            pos: Mutex::new(pos),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the remover may offer this cursor for dropping. The
    /// persistence cursor always reports `false`.
    pub fn is_droppable(&self) -> bool {
        self.droppable
    }

    pub(crate) fn pos(&self) -> CursorPos {
        *self.pos.lock()
    }

    pub(crate) fn set_pos(&self, pos: CursorPos) {
        *self.pos.lock() = pos;
    }
}

/// Weak reference to a cursor, handed to external consumers.
///
/// An expired handle means the cursor was dropped (by name re-registration,
/// explicit removal, or cursor dropping); holders must abandon the operation
/// rather than assume a position.
#[derive(Clone, Debug)]
pub struct CursorHandle {
    inner: Weak<CheckpointCursor>,
}

impl CursorHandle {
    pub(crate) fn new(cursor: &Arc<CheckpointCursor>) -> Self {
        Self {
            inner: Arc::downgrade(cursor),
        }
    }

    pub fn upgrade(&self) -> Option<Arc<CheckpointCursor>> {
        self.inner.upgrade()
    }

    pub fn is_expired(&self) -> bool {
        self.inner.strong_count() == 0
    }
}

/// Outcome of registering a cursor by seqno.
#[derive(Debug)]
pub struct CursorRegResult {
    /// Seqno from which the cursor will next observe items.
    pub seqno: u64,
    /// True when `start_by_seqno` precedes the earliest snapshot still
    /// retained, so the consumer must fall back to a disk backfill.
    pub try_backfill: bool,
    pub handle: CursorHandle,
}
