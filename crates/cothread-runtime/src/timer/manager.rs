//! Ordered-map timer manager

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

use cothread_core::{SpinLock, TimerId};

use super::TimerStats;

struct Inner<F> {
    queue: BTreeMap<(Instant, TimerId), F>,
    index: HashMap<TimerId, Instant>,
    in_flight: HashSet<TimerId>,
    total_inserted: u64,
    total_fired: u64,
    total_cancelled: u64,
}

/// Deadline-ordered set of timers carrying a payload of type `F`
pub struct TimerManager<F> {
    inner: SpinLock<Inner<F>>,
}

impl<F> TimerManager<F> {
    pub fn new() -> Self {
        TimerManager {
            inner: SpinLock::new(Inner {
                queue: BTreeMap::new(),
                index: HashMap::new(),
                in_flight: HashSet::new(),
                total_inserted: 0,
                total_fired: 0,
                total_cancelled: 0,
            }),
        }
    }

    /// Schedule `payload` for `deadline`
    pub fn expire_at(&self, deadline: Instant, payload: F) -> TimerId {
        let id = TimerId::next();
        let mut inner = self.inner.lock();
        inner.queue.insert((deadline, id), payload);
        inner.index.insert(id, deadline);
        inner.total_inserted += 1;
        id
    }

    /// Schedule `payload` for `now + after`
    pub fn expire_after(&self, after: Duration, payload: F) -> TimerId {
        self.expire_at(Instant::now() + after, payload)
    }

    /// Remove a pending timer
    ///
    /// Returns false when the id is unknown, already fired (in flight or
    /// finished) or already cancelled.
    pub fn cancel(&self, id: TimerId) -> bool {
        self.take(id).is_some()
    }

    /// Remove a pending timer and return its payload
    pub fn take(&self, id: TimerId) -> Option<F> {
        let mut inner = self.inner.lock();
        let deadline = inner.index.remove(&id)?;
        let payload = inner.queue.remove(&(deadline, id));
        if payload.is_some() {
            inner.total_cancelled += 1;
        }
        payload
    }

    /// Cancel, and if the timer is currently firing wait until its guard
    /// is dropped
    ///
    /// Inside a coroutine the wait yields to the scheduler, on a plain
    /// thread it yields the CPU. Must not be called for a timer from inside
    /// that timer's own callback.
    pub fn block_cancel(&self, id: TimerId) -> bool {
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(deadline) = inner.index.remove(&id) {
                    inner.queue.remove(&(deadline, id));
                    inner.total_cancelled += 1;
                    return true;
                }
                if !inner.in_flight.contains(&id) {
                    return false;
                }
            }
            if crate::tls::is_in_coroutine() {
                crate::scheduler::yield_now();
            } else {
                std::thread::yield_now();
            }
        }
    }

    /// Remove up to `limit` due timers, earliest first
    ///
    /// The whole batch is in flight until each guard drops. Callers that run
    /// arbitrary callbacks use `pop_expired` instead, so a callback can
    /// cancel a timer of the same batch that has not started yet.
    pub fn get_expired(&self, limit: usize) -> Vec<ExpiredTimer<'_, F>> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let mut expired = Vec::new();

        while expired.len() < limit {
            match self.pop_due(&mut inner, now) {
                Some(timer) => expired.push(timer),
                None => break,
            }
        }

        expired
    }

    /// Remove the earliest timer if it is due at `now`
    pub fn pop_expired(&self, now: Instant) -> Option<ExpiredTimer<'_, F>> {
        let mut inner = self.inner.lock();
        self.pop_due(&mut inner, now)
    }

    fn pop_due(&self, inner: &mut Inner<F>, now: Instant) -> Option<ExpiredTimer<'_, F>> {
        let entry = inner.queue.first_entry()?;
        let (deadline, id) = *entry.key();
        if deadline > now {
            return None;
        }
        let payload = entry.remove();
        inner.index.remove(&id);
        inner.in_flight.insert(id);
        inner.total_fired += 1;
        Some(ExpiredTimer {
            id,
            deadline,
            payload: Some(payload),
            mgr: self,
        })
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.inner.lock().queue.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Number of pending timers
    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get statistics snapshot
    pub fn stats(&self) -> TimerStats {
        let inner = self.inner.lock();
        TimerStats {
            active: inner.queue.len(),
            in_flight: inner.in_flight.len(),
            total_inserted: inner.total_inserted,
            total_fired: inner.total_fired,
            total_cancelled: inner.total_cancelled,
        }
    }

    /// Drop every pending timer and return their payloads
    pub fn drain(&self) -> Vec<F> {
        let mut inner = self.inner.lock();
        inner.index.clear();
        let queue = std::mem::take(&mut inner.queue);
        queue.into_values().collect()
    }

    fn finish(&self, id: TimerId) {
        self.inner.lock().in_flight.remove(&id);
    }
}

impl<F> Default for TimerManager<F> {
    fn default() -> Self {
        TimerManager::new()
    }
}

/// A fired timer; counts as in flight until dropped
pub struct ExpiredTimer<'a, F> {
    id: TimerId,
    deadline: Instant,
    payload: Option<F>,
    mgr: &'a TimerManager<F>,
}

impl<F> ExpiredTimer<'_, F> {
    #[inline]
    pub fn id(&self) -> TimerId {
        self.id
    }

    #[inline]
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Take the payload out; the timer stays in flight until the guard drops
    pub fn take(&mut self) -> Option<F> {
        self.payload.take()
    }
}

impl<F> Drop for ExpiredTimer<'_, F> {
    fn drop(&mut self) {
        self.mgr.finish(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_deadline_order() {
        let mgr = TimerManager::new();
        let now = Instant::now();
        mgr.expire_at(now + Duration::from_millis(3), 3);
        mgr.expire_at(now + Duration::from_millis(1), 1);
        mgr.expire_at(now + Duration::from_millis(2), 2);
        assert_eq!(mgr.len(), 3);

        std::thread::sleep(Duration::from_millis(5));
        let fired: Vec<i32> = mgr
            .get_expired(10)
            .into_iter()
            .map(|mut t| t.take().unwrap())
            .collect();
        assert_eq!(fired, vec![1, 2, 3]);
        assert!(mgr.is_empty());
    }

    #[test]
    fn test_same_deadline_ordered_by_id() {
        let mgr = TimerManager::new();
        let when = Instant::now();
        let a = mgr.expire_at(when, "a");
        let b = mgr.expire_at(when, "b");
        assert!(a < b);
        let ids: Vec<_> = mgr.get_expired(10).iter().map(|t| t.id()).collect();
        assert_eq!(ids, vec![a, b]);
    }

    #[test]
    fn test_limit() {
        let mgr = TimerManager::new();
        for i in 0..5 {
            mgr.expire_after(Duration::ZERO, i);
        }
        assert_eq!(mgr.get_expired(2).len(), 2);
        assert_eq!(mgr.len(), 3);
        assert_eq!(mgr.get_expired(100).len(), 3);
    }

    #[test]
    fn test_future_not_expired() {
        let mgr = TimerManager::new();
        mgr.expire_after(Duration::from_secs(60), ());
        assert!(mgr.get_expired(10).is_empty());
        let deadline = mgr.next_deadline().unwrap();
        assert!(deadline > Instant::now());
    }

    #[test]
    fn test_cancel_idempotent() {
        let mgr = TimerManager::new();
        let id = mgr.expire_after(Duration::from_millis(500), ());
        assert!(mgr.cancel(id));
        assert!(!mgr.cancel(id));
        assert!(!mgr.block_cancel(id));
        assert!(mgr.next_deadline().is_none());
    }

    #[test]
    fn test_cancel_after_fire() {
        let mgr = TimerManager::new();
        let id = mgr.expire_after(Duration::ZERO, ());
        let fired = mgr.get_expired(1);
        assert_eq!(fired.len(), 1);
        assert!(!mgr.cancel(id));
        drop(fired);
        assert!(!mgr.block_cancel(id));
    }

    #[test]
    fn test_pop_expired_one_at_a_time() {
        let mgr = TimerManager::new();
        let when = Instant::now();
        let a = mgr.expire_at(when, "a");
        let b = mgr.expire_at(when, "b");

        let first = mgr.pop_expired(Instant::now()).unwrap();
        assert_eq!(first.id(), a);
        assert_eq!(mgr.stats().in_flight, 1);
        // b has not been handed out, so it can still be cancelled
        assert!(mgr.block_cancel(b));
        drop(first);
        assert!(mgr.pop_expired(Instant::now()).is_none());
        assert_eq!(mgr.stats().in_flight, 0);
    }

    #[test]
    fn test_take_returns_payload() {
        let mgr = TimerManager::new();
        let id = mgr.expire_after(Duration::from_secs(1), String::from("x"));
        assert_eq!(mgr.take(id).as_deref(), Some("x"));
        assert_eq!(mgr.take(id), None);
    }

    #[test]
    fn test_block_cancel_waits_for_in_flight() {
        let mgr = Arc::new(TimerManager::new());
        let id = mgr.expire_after(Duration::ZERO, ());
        let mut fired = mgr.get_expired(1);
        assert_eq!(fired.len(), 1);

        let done = Arc::new(AtomicBool::new(false));
        let waiter = {
            let mgr = Arc::clone(&mgr);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                let cancelled = mgr.block_cancel(id);
                assert!(done.load(Ordering::SeqCst));
                cancelled
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        done.store(true, Ordering::SeqCst);
        fired.clear();

        assert!(!waiter.join().unwrap());
        assert_eq!(mgr.stats().in_flight, 0);
    }

    #[test]
    fn test_stats_and_drain() {
        let mgr = TimerManager::new();
        mgr.expire_after(Duration::ZERO, 1);
        let id = mgr.expire_after(Duration::from_secs(10), 2);
        mgr.expire_after(Duration::from_secs(10), 3);

        drop(mgr.get_expired(10));
        mgr.cancel(id);

        let stats = mgr.stats();
        assert_eq!(stats.total_inserted, 3);
        assert_eq!(stats.total_fired, 1);
        assert_eq!(stats.total_cancelled, 1);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.in_flight, 0);

        assert_eq!(mgr.drain(), vec![3]);
        assert!(mgr.is_empty());
    }
}
