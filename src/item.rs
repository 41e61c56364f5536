use std::mem;

use crate::types::{CheckpointId, CommittedState, QueueOp, VBucketState};

/// Fixed bookkeeping cost attributed to every queued item on top of its key
/// and value bytes.
pub const ITEM_OVERHEAD: usize = mem::size_of::<QueuedItem>();

/// A record placed in a checkpoint's ordered log: either a document mutation
/// or a meta marker describing checkpoint structure.
///
/// Items are immutable once linked into a checkpoint; the manager assigns
/// `by_seqno` and `cas` before insertion.
#[derive(Clone, Debug)]
pub struct QueuedItem {
    pub key: Option<Vec<u8>>,
    /// Document body; `None` marks a tombstone.
    pub value: Option<Vec<u8>>,
    pub by_seqno: i64,
    pub cas: u64,
    pub rev_seqno: u64,
    pub op: QueueOp,
    pub committed: CommittedState,
    /// Only meaningful for `SetVBucketState` markers.
    pub vbucket_state: Option<VBucketState>,
}

impl QueuedItem {
    fn base(key: Option<Vec<u8>>, value: Option<Vec<u8>>, op: QueueOp) -> Self {
        Self {
            key,
            value,
            by_seqno: 0,
            cas: 0,
            rev_seqno: 1,
            op,
            committed: CommittedState::Committed,
            vbucket_state: None,
        }
    }

    pub fn mutation(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self::base(Some(key.into()), Some(value.into()), QueueOp::Mutation)
    }

    pub fn deletion(key: impl Into<Vec<u8>>, rev_seqno: u64) -> Self {
        let mut item = Self::base(Some(key.into()), None, QueueOp::Deletion);
        item.rev_seqno = rev_seqno;
        item
    }

    pub fn expiration(key: impl Into<Vec<u8>>, rev_seqno: u64) -> Self {
        let mut item = Self::base(Some(key.into()), None, QueueOp::Expiration);
        item.rev_seqno = rev_seqno;
        item
    }

    pub fn pending_sync_write(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        let mut item = Self::base(Some(key.into()), Some(value.into()), QueueOp::PendingSyncWrite);
        item.committed = CommittedState::Pending;
        item
    }

    pub fn commit_sync_write(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        let mut item = Self::base(Some(key.into()), Some(value.into()), QueueOp::CommitSyncWrite);
        item.committed = CommittedState::PrepareCommitted;
        item
    }

    pub fn abort_sync_write(key: impl Into<Vec<u8>>) -> Self {
        let mut item = Self::base(Some(key.into()), None, QueueOp::AbortSyncWrite);
        item.committed = CommittedState::PrepareAborted;
        item
    }

    pub(crate) fn checkpoint_start(id: CheckpointId, by_seqno: i64) -> Self {
        let mut item = Self::base(None, None, QueueOp::CheckpointStart);
        item.by_seqno = by_seqno;
        item.rev_seqno = id.0;
        item
    }

    pub(crate) fn checkpoint_end(id: CheckpointId, by_seqno: i64) -> Self {
        let mut item = Self::base(None, None, QueueOp::CheckpointEnd);
        item.by_seqno = by_seqno;
        item.rev_seqno = id.0;
        item
    }

    pub(crate) fn set_vbucket_state(state: VBucketState, by_seqno: i64) -> Self {
        let mut item = Self::base(None, None, QueueOp::SetVBucketState);
        item.by_seqno = by_seqno;
        item.vbucket_state = Some(state);
        item
    }

    /// Placeholder item carrying no operation; used by callers that need a
    /// parked position in the log.
    pub fn empty() -> Self {
        Self::base(None, None, QueueOp::Empty)
    }

    pub fn is_meta_item(&self) -> bool {
        self.op.is_meta()
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    /// Bytes attributed to this item in checkpoint memory accounting.
    pub fn size_bytes(&self) -> usize {
        let key = self.key.as_ref().map_or(0, Vec::len);
        let value = self.value.as_ref().map_or(0, Vec::len);
        ITEM_OVERHEAD + key + value
    }
}
