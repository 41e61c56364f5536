#![forbid(unsafe_code)]

pub mod bucket;
pub mod checkpoint;
pub mod config;
pub mod cursor;
pub mod error;
pub mod hlc;
pub mod item;
pub mod manager;
pub mod remover;
pub mod stats;
pub mod types;

pub use crate::bucket::VBucketMap;
pub use crate::checkpoint::{Checkpoint, QueueItemStatus, CHECKPOINT_OVERHEAD};
pub use crate::config::CheckpointConfig;
pub use crate::cursor::{CheckpointCursor, CursorHandle, CursorRegResult, PERSISTENCE_CURSOR_NAME};
pub use crate::error::{CheckpointError, Result};
pub use crate::hlc::{cas_wall_clock_micros, HybridLogicalClock, PreLinkContext};
pub use crate::item::{QueuedItem, ITEM_OVERHEAD};
pub use crate::manager::{
    CheckpointManager, CheckpointSnapshotRange, ExpelResult, FlusherCallback, ItemsForCursor,
    NewCheckpointCallback, RemovalResult,
};
pub use crate::remover::{CheckpointRemover, MemoryRecoveryMechanism, RemoverState, StreamObserver};
pub use crate::stats::{BucketStats, StatsSnapshot};
pub use crate::types::{
    CheckpointId, CheckpointState, CheckpointType, CommittedState, QueueOp, SnapshotInfo,
    SnapshotRange, VBucketState, Vbid,
};
