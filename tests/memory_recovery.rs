use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tidemark::{
    BucketStats, CheckpointConfig, CheckpointManager, CheckpointRemover, CursorHandle,
    MemoryRecoveryMechanism, QueuedItem, Result, StreamObserver, VBucketMap, Vbid,
};

/// Test double for the replication layer: cooperates with every drop request
/// by removing the cursor from its manager.
struct DroppingObserver {
    map: Arc<VBucketMap>,
    drops: AtomicUsize,
}

impl DroppingObserver {
    fn new(map: Arc<VBucketMap>) -> Self {
        Self {
            map,
            drops: AtomicUsize::new(0),
        }
    }
}

impl StreamObserver for DroppingObserver {
    fn handle_slow_stream(&self, vbid: Vbid, cursor: &CursorHandle) -> bool {
        let Some(manager) = self.map.get(vbid) else {
            return false;
        };
        if manager.remove_cursor(cursor) {
            self.drops.fetch_add(1, Ordering::SeqCst);
            true
        } else {
            false
        }
    }
}

/// Refuses every drop request, as a stream that cannot switch to backfill
/// would.
struct RefusingObserver;

impl StreamObserver for RefusingObserver {
    fn handle_slow_stream(&self, _vbid: Vbid, _cursor: &CursorHandle) -> bool {
        false
    }
}

struct Harness {
    map: Arc<VBucketMap>,
    stats: Arc<BucketStats>,
    config: Arc<CheckpointConfig>,
}

impl Harness {
    fn new(config: CheckpointConfig) -> Self {
        // RUST_LOG=tidemark=debug surfaces the remover's trigger decisions.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        Self {
            map: Arc::new(VBucketMap::new()),
            stats: Arc::new(BucketStats::new()),
            config: Arc::new(config),
        }
    }

    fn add_manager(&self, vbid: Vbid) -> Arc<CheckpointManager> {
        let manager = Arc::new(CheckpointManager::new(
            vbid,
            Arc::clone(&self.config),
            Arc::clone(&self.stats),
            0,
            0,
            0,
        ));
        self.map.add(Arc::clone(&manager));
        manager
    }

    fn remover(&self, observer: Arc<dyn StreamObserver>) -> CheckpointRemover {
        CheckpointRemover::new(
            Arc::clone(&self.map),
            Arc::clone(&self.config),
            Arc::clone(&self.stats),
            observer,
        )
    }
}

fn small_quota_config() -> CheckpointConfig {
    CheckpointConfig {
        max_size: 100_000,
        remover_interval: Duration::from_millis(20),
        ..CheckpointConfig::default()
    }
}

fn fill(manager: &CheckpointManager, keys: std::ops::Range<u32>, value_len: usize) -> Result<()> {
    for i in keys {
        manager.queue_dirty(
            QueuedItem::mutation(format!("key-{i}"), vec![b'v'; value_len]),
            true,
            false,
            None,
        )?;
    }
    Ok(())
}

#[test]
fn no_recovery_below_marks() -> Result<()> {
    let harness = Harness::new(small_quota_config());
    let manager = harness.add_manager(Vbid(0));
    fill(&manager, 0..5, 64)?;
    harness.stats.set_memory_used(10_000);

    let remover = harness.remover(Arc::new(RefusingObserver));
    assert!(remover.is_reduction_needed().is_none());
    remover.run_once();
    assert_eq!(harness.stats.items_expelled(), 0);
    assert_eq!(harness.stats.cursors_dropped(), 0);
    Ok(())
}

#[test]
fn total_memory_trigger_targets_lower_mark() {
    let harness = Harness::new(small_quota_config());
    harness.stats.set_memory_used(96_000);
    let remover = harness.remover(Arc::new(RefusingObserver));
    // 96k used, upper mark 95k, lower mark 80k: reclaim the overshoot.
    assert_eq!(remover.is_reduction_needed(), Some(16_000));
}

#[test]
fn checkpoint_memory_trigger_takes_precedence() -> Result<()> {
    let harness = Harness::new(small_quota_config());
    let manager = harness.add_manager(Vbid(0));
    // Push real checkpoint memory past the 50% mark.
    fill(&manager, 0..30, 2_048)?;
    assert!(harness.stats.checkpoint_memory() >= 50_000);

    // Above the low watermark but below the total-memory mark: only the
    // checkpoint condition fires, aiming at the checkpoint lower mark.
    harness.stats.set_memory_used(80_000);
    let remover = harness.remover(Arc::new(RefusingObserver));
    assert_eq!(remover.is_reduction_needed(), Some(50_000));

    // Below the low watermark the checkpoint condition is suppressed.
    harness.stats.set_memory_used(60_000);
    assert!(remover.is_reduction_needed().is_none());
    Ok(())
}

#[test]
fn expel_recovers_read_items() -> Result<()> {
    let harness = Harness::new(small_quota_config());
    let manager = harness.add_manager(Vbid(0));
    fill(&manager, 0..10, 2_048)?;
    manager.get_next_items_for_persistence();
    fill(&manager, 10..20, 2_048)?;

    harness.stats.set_memory_used(96_000);
    let before = harness.stats.checkpoint_memory();
    let remover = harness.remover(Arc::new(RefusingObserver));
    remover.run_once();

    assert_eq!(harness.stats.items_expelled(), 10);
    assert!(harness.stats.checkpoint_memory() < before);
    assert_eq!(manager.num_items(), 10);
    Ok(())
}

#[test]
fn cursor_drop_frees_unreferenced_checkpoints() -> Result<()> {
    let config = CheckpointConfig {
        chk_expel_enabled: false,
        ..small_quota_config()
    };
    let harness = Harness::new(config);
    let manager = harness.add_manager(Vbid(0));
    fill(&manager, 0..5, 2_048)?;
    // The replica cursor registers inside the open checkpoint, closing it;
    // the cursor then lags behind in the closed checkpoint.
    manager.register_cursor("replica-1", 0, true)?;
    manager.get_next_items_for_persistence();

    harness.stats.set_memory_used(96_000);
    let observer = Arc::new(DroppingObserver::new(Arc::clone(&harness.map)));
    let remover = harness.remover(Arc::clone(&observer) as Arc<dyn StreamObserver>);
    remover.run_once();

    assert_eq!(observer.drops.load(Ordering::SeqCst), 1);
    assert_eq!(harness.stats.cursors_dropped(), 1);
    assert!(harness.stats.cursor_memory_freed() > 0);
    // The visitor pass already reclaimed the now-unreferenced checkpoint.
    assert_eq!(manager.num_checkpoints(), 1);
    assert!(manager.cursor_by_name("replica-1").is_err());
    Ok(())
}

#[test]
fn refused_drop_leaves_cursor_in_place() -> Result<()> {
    let config = CheckpointConfig {
        chk_expel_enabled: false,
        ..small_quota_config()
    };
    let harness = Harness::new(config);
    let manager = harness.add_manager(Vbid(0));
    fill(&manager, 0..5, 2_048)?;
    manager.register_cursor("replica-1", 0, true)?;
    manager.get_next_items_for_persistence();

    harness.stats.set_memory_used(96_000);
    let remover = harness.remover(Arc::new(RefusingObserver));
    remover.run_once();

    assert_eq!(harness.stats.cursors_dropped(), 0);
    assert!(manager.cursor_by_name("replica-1").is_ok());
    // The referenced checkpoint stays pinned.
    assert_eq!(manager.num_checkpoints(), 2);
    Ok(())
}

#[test]
fn heaviest_partition_is_visited_first() -> Result<()> {
    let harness = Harness::new(small_quota_config());
    let light = harness.add_manager(Vbid(0));
    let heavy = harness.add_manager(Vbid(1));
    fill(&light, 0..2, 128)?;
    light.get_next_items_for_persistence();
    fill(&light, 2..4, 128)?;
    fill(&heavy, 0..20, 2_048)?;
    heavy.get_next_items_for_persistence();
    fill(&heavy, 20..24, 2_048)?;

    harness.stats.set_memory_used(81_000);
    let remover = harness.remover(Arc::new(RefusingObserver));
    // Target 1k (81k - 80k): the heavy partition alone satisfies it.
    let recovered =
        remover.attempt_memory_recovery(MemoryRecoveryMechanism::CheckpointExpel, 1_000);
    assert!(recovered > 0);
    assert_eq!(light.num_items(), 4, "light partition was not touched");
    assert_eq!(heavy.num_items(), 4);
    Ok(())
}

#[test]
fn visitor_reclaims_without_memory_pressure() -> Result<()> {
    let harness = Harness::new(small_quota_config());
    let manager = harness.add_manager(Vbid(0));
    fill(&manager, 0..3, 64)?;
    manager.create_new_checkpoint()?;
    fill(&manager, 3..6, 64)?;
    manager.get_next_items_for_persistence();
    assert_eq!(manager.num_checkpoints(), 2);

    let remover = harness.remover(Arc::new(RefusingObserver));
    remover.run_once();
    assert_eq!(manager.num_checkpoints(), 1);
    assert_eq!(harness.stats.items_removed_from_checkpoints(), 3);
    Ok(())
}

#[test]
fn remover_thread_trigger_and_shutdown() -> Result<()> {
    let config = CheckpointConfig {
        chk_expel_enabled: false,
        ..small_quota_config()
    };
    let harness = Harness::new(config);
    let manager = harness.add_manager(Vbid(0));
    fill(&manager, 0..5, 2_048)?;
    manager.register_cursor("replica-1", 0, true)?;
    manager.get_next_items_for_persistence();
    harness.stats.set_memory_used(96_000);

    let observer = Arc::new(DroppingObserver::new(Arc::clone(&harness.map)));
    let mut state = harness
        .remover(Arc::clone(&observer) as Arc<dyn StreamObserver>)
        .spawn();
    assert!(state.trigger());

    let deadline = Instant::now() + Duration::from_secs(5);
    while harness.stats.cursors_dropped() == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(harness.stats.cursors_dropped(), 1);

    state.shutdown();
    assert!(!state.trigger(), "shutdown remover no longer accepts work");
    Ok(())
}
