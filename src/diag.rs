//! Process-wide diagnostic counters.
//!
//! Monotonically increasing, read-only for observers, bumped by the registry
//! as queries succeed or abort. Not required for correctness.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

pub static HIT_HEAP: AtomicU64 = AtomicU64::new(0);
pub static HIT_STACK: AtomicU64 = AtomicU64::new(0);
pub static HIT_STATIC: AtomicU64 = AtomicU64::new(0);
pub static HIT_MAPPED: AtomicU64 = AtomicU64::new(0);
pub static ABORTED_STACK: AtomicU64 = AtomicU64::new(0);
pub static ABORTED_STATIC: AtomicU64 = AtomicU64::new(0);
pub static ABORTED_UNINDEXED_HEAP: AtomicU64 = AtomicU64::new(0);
pub static ABORTED_UNRECOGNISED_ALLOCSITE: AtomicU64 = AtomicU64::new(0);
pub static ABORTED_UNKNOWN_STORAGE: AtomicU64 = AtomicU64::new(0);

pub fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// A point-in-time copy of every counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub hit_heap: u64,
    pub hit_stack: u64,
    pub hit_static: u64,
    pub hit_mapped: u64,
    pub aborted_stack: u64,
    pub aborted_static: u64,
    pub aborted_unindexed_heap: u64,
    pub aborted_unrecognised_allocsite: u64,
    pub aborted_unknown_storage: u64,
}

pub fn snapshot() -> Counters {
    Counters {
        hit_heap: HIT_HEAP.load(Ordering::Relaxed),
        hit_stack: HIT_STACK.load(Ordering::Relaxed),
        hit_static: HIT_STATIC.load(Ordering::Relaxed),
        hit_mapped: HIT_MAPPED.load(Ordering::Relaxed),
        aborted_stack: ABORTED_STACK.load(Ordering::Relaxed),
        aborted_static: ABORTED_STATIC.load(Ordering::Relaxed),
        aborted_unindexed_heap: ABORTED_UNINDEXED_HEAP.load(Ordering::Relaxed),
        aborted_unrecognised_allocsite: ABORTED_UNRECOGNISED_ALLOCSITE.load(Ordering::Relaxed),
        aborted_unknown_storage: ABORTED_UNKNOWN_STORAGE.load(Ordering::Relaxed),
    }
}

impl Counters {
    /// JSON rendering for log scrapers and dashboards.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("counters always serialize")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_bumps() {
        let before = snapshot();
        bump(&HIT_HEAP);
        bump(&ABORTED_UNKNOWN_STORAGE);
        let after = snapshot();
        assert!(after.hit_heap >= before.hit_heap + 1);
        assert!(after.aborted_unknown_storage >= before.aborted_unknown_storage + 1);
    }

    #[test]
    fn counters_serialize() {
        let json = snapshot().to_json();
        assert!(json.contains("hit_heap"));
        assert!(json.contains("aborted_unknown_storage"));
    }
}
