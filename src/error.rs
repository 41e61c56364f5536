use thiserror::Error;

pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Failure modes of the checkpoint subsystem.
///
/// `InvariantViolation` and `NonMonotonicSeqno` are fatal for the affected
/// partition: the caller cannot recover and is expected to raise them to the
/// partition supervisor. The remaining variants are benign conditions the
/// caller handles inline.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("invariant violation: {0}")]
    InvariantViolation(&'static str),
    #[error("non-monotonic seqno: got {got}, last assigned {last}")]
    NonMonotonicSeqno { got: i64, last: i64 },
    #[error("checkpoint {0} is closed")]
    ClosedCheckpoint(u64),
    #[error("no cursor named {0:?}")]
    NoSuchCursor(String),
    #[error("allocation rejected while queueing item")]
    MemoryExhausted,
}
