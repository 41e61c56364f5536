use std::cmp;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Number of low bits reserved for the logical counter in a CAS token.
const LOGICAL_BITS: u32 = 16;
const WALL_MASK: u64 = (1 << 48) - 1;

/// Receives the CAS assigned to an item before the item becomes visible to
/// readers, so the caller can link the token into its own structures without
/// racing the drain path.
pub trait PreLinkContext {
    fn pre_link(&self, cas: u64);
}

/// Hybrid logical clock used as the CAS source.
///
/// Tokens are `wall_micros << 16 | logical`: the upper 48 bits carry wall
/// time, the low 16 bits absorb bursts within one microsecond and backwards
/// clock steps. Tokens are strictly increasing across threads.
#[derive(Debug, Default)]
pub struct HybridLogicalClock {
    last: AtomicU64,
}

impl HybridLogicalClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resumes the clock at a previously observed token, e.g. after a
    /// partition reset from a peer's high CAS.
    pub fn with_initial(cas: u64) -> Self {
        Self {
            last: AtomicU64::new(cas),
        }
    }

    /// Returns the next CAS token.
    pub fn next(&self) -> u64 {
        let physical = (wall_clock_micros() & WALL_MASK) << LOGICAL_BITS;
        let prev = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(cmp::max(physical, last + 1))
            })
            .unwrap_or_else(|last| last);
        cmp::max(physical, prev + 1)
    }

    /// Last token handed out (or seeded), without advancing.
    pub fn current(&self) -> u64 {
        self.last.load(Ordering::SeqCst)
    }
}

/// Extracts the wall-clock component (microseconds) of a CAS token.
pub fn cas_wall_clock_micros(cas: u64) -> u64 {
    cas >> LOGICAL_BITS
}

fn wall_clock_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
