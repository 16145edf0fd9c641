//! Keyed wait table for `block_wait` / `block_wakeup`
//!
//! Buckets are addressed by `(domain, key)`. Negative domains are reserved
//! for the runtime ([`SysDomain`]); user code gets the non-negative range.
//!
//! A bucket holds a FIFO of parked tasks and a credit counter. A wakeup
//! that finds fewer waiters than requested banks the rest as credit, and a
//! later wait consumes a credit instead of parking, so a wakeup issued
//! before the waiter got parked is never lost. Empty buckets with no credit
//! are removed.

use std::collections::HashMap;
use std::sync::atomic::Ordering;

use cothread_core::{SList, SpinLock};

use crate::task::{Task, TaskRef};

/// Runtime-reserved wait domains
#[repr(i64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SysDomain {
    Mutex = -1,
    Channel = -2,
    Event = -3,
}

impl SysDomain {
    #[inline]
    pub fn as_domain(self) -> i64 {
        self as i64
    }
}

impl From<SysDomain> for i64 {
    fn from(d: SysDomain) -> i64 {
        d.as_domain()
    }
}

/// True for domains reserved by the runtime
#[inline]
pub fn is_sys_domain(domain: i64) -> bool {
    domain < 0
}

/// Map a user wait type onto its domain
#[inline]
pub fn user_domain(kind: u32) -> i64 {
    kind as i64
}

struct Bucket {
    credit: i64,
    waiters: SList<Task>,
}

impl Bucket {
    fn new() -> Self {
        Bucket {
            credit: 0,
            waiters: SList::new(),
        }
    }

    #[inline]
    fn is_idle(&self) -> bool {
        self.credit == 0 && self.waiters.is_empty()
    }
}

pub struct WaitTable {
    buckets: SpinLock<HashMap<(i64, u64), Bucket>>,
}

impl WaitTable {
    pub fn new() -> Self {
        WaitTable {
            buckets: SpinLock::new(HashMap::new()),
        }
    }

    /// Park a task that switched out in SysBlock/UserBlock
    ///
    /// Returns false if a banked credit was consumed instead; the caller
    /// keeps the task runnable.
    pub(crate) fn park(&self, task: TaskRef) -> bool {
        let domain = task.wait_domain.load(Ordering::Acquire);
        let key = task.wait_key.load(Ordering::Acquire);

        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry((domain, key)).or_insert_with(Bucket::new);
        if bucket.credit > 0 {
            bucket.credit -= 1;
            if bucket.is_idle() {
                buckets.remove(&(domain, key));
            }
            return false;
        }
        // Safety: the task stays alive while parked (base count held)
        unsafe { bucket.waiters.push_back(task.as_ptr()) };
        true
    }

    /// Consume one credit if available
    pub fn try_wait(&self, domain: i64, key: u64) -> bool {
        let mut buckets = self.buckets.lock();
        let Some(bucket) = buckets.get_mut(&(domain, key)) else {
            return false;
        };
        if bucket.credit <= 0 {
            return false;
        }
        bucket.credit -= 1;
        if bucket.is_idle() {
            buckets.remove(&(domain, key));
        }
        true
    }

    /// Pop up to `count` waiters in FIFO order, banking the shortfall
    pub(crate) fn wakeup(&self, domain: i64, key: u64, count: u32) -> SList<Task> {
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry((domain, key)).or_insert_with(Bucket::new);
        let woken = bucket.waiters.pop_n(count as usize);
        let shortfall = count as usize - woken.len();
        bucket.credit += shortfall as i64;
        if bucket.is_idle() {
            buckets.remove(&(domain, key));
        }
        woken
    }

    /// Banked credit for a bucket
    pub fn credit(&self, domain: i64, key: u64) -> i64 {
        self.buckets
            .lock()
            .get(&(domain, key))
            .map_or(0, |b| b.credit)
    }

    /// Tasks parked on a bucket
    pub fn waiter_count(&self, domain: i64, key: u64) -> usize {
        self.buckets
            .lock()
            .get(&(domain, key))
            .map_or(0, |b| b.waiters.len())
    }

    /// Live buckets
    pub fn len(&self) -> usize {
        self.buckets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total parked tasks over all buckets
    pub fn parked(&self) -> usize {
        self.buckets.lock().values().map(|b| b.waiters.len()).sum()
    }
}

impl Default for WaitTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sys_domains_negative() {
        for d in [SysDomain::Mutex, SysDomain::Channel, SysDomain::Event] {
            assert!(is_sys_domain(d.into()));
        }
        assert!(!is_sys_domain(user_domain(0)));
        assert!(!is_sys_domain(user_domain(u32::MAX)));
    }

    #[test]
    fn test_wakeup_banks_credit() {
        let table = WaitTable::new();
        let woken = table.wakeup(5, 1, 3);
        assert!(woken.is_empty());
        assert_eq!(table.credit(5, 1), 3);

        assert!(table.try_wait(5, 1));
        assert!(table.try_wait(5, 1));
        assert!(table.try_wait(5, 1));
        assert!(!table.try_wait(5, 1));
        assert!(table.is_empty());
    }

    #[test]
    fn test_try_wait_unknown_bucket() {
        let table = WaitTable::new();
        assert!(!table.try_wait(SysDomain::Event.into(), 42));
        assert!(table.is_empty());
    }

    #[test]
    fn test_wakeup_zero_leaves_no_bucket() {
        let table = WaitTable::new();
        assert!(table.wakeup(1, 1, 0).is_empty());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_keys_independent() {
        let table = WaitTable::new();
        table.wakeup(1, 1, 1);
        table.wakeup(1, 2, 2);
        table.wakeup(-1, 1, 1);
        assert_eq!(table.len(), 3);
        assert_eq!(table.credit(1, 2), 2);
        assert_eq!(table.credit(-1, 1), 1);
        assert_eq!(table.waiter_count(1, 1), 0);
        assert_eq!(table.parked(), 0);
    }
}
