//! Timer subsystem
//!
//! One [`TimerManager`] implementation serves two owners:
//!
//! - the scheduler's user timers (`expire_at` / `expire_after`), whose
//!   payload is a boxed callback run by the dispatch loop
//! - the reactor's private timers, whose payload says which parked task
//!   to wake (I/O timeout or sleep)
//!
//! Entries are ordered by `(deadline, id)` in a `BTreeMap` and indexed by id
//! for O(log n) cancellation. Expired entries are handed out as
//! [`ExpiredTimer`] guards; while a guard is alive its timer counts as in
//! flight and `block_cancel` waits for it.

mod manager;

pub use manager::{ExpiredTimer, TimerManager};

/// Statistics snapshot for a TimerManager
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimerStats {
    /// Pending timers
    pub active: usize,
    /// Fired timers whose guard is still alive
    pub in_flight: usize,
    /// Total timers inserted (lifetime)
    pub total_inserted: u64,
    /// Total timers handed out by `get_expired` (lifetime)
    pub total_fired: u64,
    /// Total timers removed by cancellation (lifetime)
    pub total_cancelled: u64,
}
