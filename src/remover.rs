use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;

use tracing::{debug, info, warn};

use crate::bucket::VBucketMap;
use crate::config::CheckpointConfig;
use crate::cursor::CursorHandle;
use crate::stats::BucketStats;
use crate::types::Vbid;

/// Upper-layer hook invoked during cursor dropping. Implementations ask the
/// owning replication stream to switch to backfill and, on success, remove
/// its cursor from the manager; returning true reports that the cursor is
/// gone and its checkpoints may become reclaimable.
pub trait StreamObserver: Send + Sync {
    fn handle_slow_stream(&self, vbid: Vbid, cursor: &CursorHandle) -> bool;
}

/// The two memory-recovery mechanisms, tried in this order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MemoryRecoveryMechanism {
    CheckpointExpel,
    CursorDrop,
}

enum RemoverMessage {
    Trigger,
    Shutdown,
}

fn to_mb(bytes: u64) -> u64 {
    bytes / (1024 * 1024)
}

/// Periodic memory-recovery task over the bucket's partitions.
///
/// Each run evaluates the recovery triggers against the global stats, frees
/// memory by expel and (if still short) cursor dropping, then visits every
/// partition to remove closed unreferenced checkpoints. All steps are
/// best-effort; a partition that disappears mid-run is skipped.
pub struct CheckpointRemover {
    map: Arc<VBucketMap>,
    config: Arc<CheckpointConfig>,
    stats: Arc<BucketStats>,
    observer: Arc<dyn StreamObserver>,
}

impl CheckpointRemover {
    pub fn new(
        map: Arc<VBucketMap>,
        config: Arc<CheckpointConfig>,
        stats: Arc<BucketStats>,
        observer: Arc<dyn StreamObserver>,
    ) -> Self {
        Self {
            map,
            config,
            stats,
            observer,
        }
    }

    /// Evaluates the two trigger conditions and, when recovery is needed,
    /// returns the number of bytes to reclaim.
    ///
    /// Recovery starts when total memory exceeds `cursor_dropping_upper_mark`
    /// or when checkpoint memory exceeds its own mark while the bucket sits
    /// above the low watermark; it aims at the matching lower mark.
    pub fn is_reduction_needed(&self) -> Option<u64> {
        let mem_used = self.stats.memory_used();
        let ckpt_mem = self.stats.checkpoint_memory();

        let above_low_watermark = mem_used >= self.config.mem_low_watermark_bytes() as u64;
        let ckpt_mem_exceeds =
            above_low_watermark && ckpt_mem >= self.config.checkpoint_mem_upper_bytes() as u64;
        let total_mem_exceeds = mem_used > self.config.cursor_dropping_upper_bytes() as u64;

        if ckpt_mem_exceeds {
            let target = mem_used.saturating_sub(self.config.checkpoint_mem_lower_bytes() as u64);
            info!(
                checkpoint_mem_mb = to_mb(ckpt_mem),
                upper_mark_mb = to_mb(self.config.checkpoint_mem_upper_bytes() as u64),
                target_mb = to_mb(target),
                "remover.trigger.checkpoint_memory"
            );
            Some(target)
        } else if total_mem_exceeds {
            let target = mem_used.saturating_sub(self.config.cursor_dropping_lower_bytes() as u64);
            info!(
                mem_used_mb = to_mb(mem_used),
                upper_mark_mb = to_mb(self.config.cursor_dropping_upper_bytes() as u64),
                target_mb = to_mb(target),
                "remover.trigger.total_memory"
            );
            Some(target)
        } else {
            None
        }
    }

    /// Runs one mechanism over the partitions (checkpoint-memory order,
    /// heaviest first) until `target` bytes are recovered or the partitions
    /// are exhausted. Returns the recovered estimate.
    pub fn attempt_memory_recovery(
        &self,
        mechanism: MemoryRecoveryMechanism,
        target: u64,
    ) -> u64 {
        let mut recovered = 0u64;
        for manager in self.map.managers_by_checkpoint_memory() {
            if recovered >= target {
                break;
            }
            let vbid = manager.vbid();
            if self.map.get(vbid).is_none() {
                // Partition went away between selection and operation.
                continue;
            }
            match mechanism {
                MemoryRecoveryMechanism::CheckpointExpel => {
                    let result = manager.expel_unreferenced_checkpoint_items();
                    debug!(
                        %vbid,
                        expelled = result.expel_count,
                        bytes = result.estimate_of_free_memory,
                        "remover.expel"
                    );
                    recovered += result.estimate_of_free_memory as u64;
                }
                MemoryRecoveryMechanism::CursorDrop => {
                    for cursor in manager.cursors_eligible_for_drop() {
                        if recovered >= target {
                            break;
                        }
                        if self.observer.handle_slow_stream(vbid, &cursor) {
                            let freed = manager.memory_usage_of_unref_checkpoints() as u64;
                            self.stats.cursor_dropped(freed);
                            recovered += freed;
                            debug!(%vbid, freed, "remover.cursor_drop");
                        } else {
                            warn!(%vbid, "remover.cursor_drop.rejected");
                        }
                    }
                }
            }
        }
        recovered
    }

    /// One full remover pass: trigger evaluation, expel, cursor drop, then
    /// the removal visit over every partition.
    pub fn run_once(&self) {
        if let Some(target) = self.is_reduction_needed() {
            let mut recovered = 0u64;
            if self.config.chk_expel_enabled {
                recovered =
                    self.attempt_memory_recovery(MemoryRecoveryMechanism::CheckpointExpel, target);
            }
            if target > recovered {
                self.attempt_memory_recovery(
                    MemoryRecoveryMechanism::CursorDrop,
                    target - recovered,
                );
            }
        }

        for manager in self.map.managers() {
            let result = manager.remove_closed_unref_checkpoints(usize::MAX);
            if result.items_released > 0 || result.new_open_checkpoint {
                debug!(
                    vbid = %manager.vbid(),
                    items = result.items_released,
                    rolled_open = result.new_open_checkpoint,
                    "remover.visit"
                );
            }
        }
    }

    /// Starts the periodic task thread. The interval comes from
    /// `config.remover_interval`; a `Trigger` message runs a pass
    /// immediately.
    pub fn spawn(self) -> RemoverState {
        let (sender, receiver) = mpsc::channel();
        let thread = thread::spawn(move || self.remover_loop(receiver));
        RemoverState {
            sender,
            thread: Some(thread),
        }
    }

    fn remover_loop(&self, receiver: Receiver<RemoverMessage>) {
        loop {
            match receiver.recv_timeout(self.config.remover_interval) {
                Ok(RemoverMessage::Trigger) | Err(RecvTimeoutError::Timeout) => {
                    self.run_once();
                }
                Ok(RemoverMessage::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                    break;
                }
            }
        }
    }
}

/// Handle to a spawned remover thread.
pub struct RemoverState {
    sender: Sender<RemoverMessage>,
    thread: Option<thread::JoinHandle<()>>,
}

impl RemoverState {
    /// Requests an immediate pass. Fails only after shutdown.
    pub fn trigger(&self) -> bool {
        self.sender.send(RemoverMessage::Trigger).is_ok()
    }

    pub fn shutdown(&mut self) {
        let _ = self.sender.send(RemoverMessage::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for RemoverState {
    fn drop(&mut self) {
        self.shutdown();
    }
}
