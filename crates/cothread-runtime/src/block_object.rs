//! Counting gate with a FIFO of parked tasks
//!
//! `wakeup` hands the gate to the oldest waiter, or banks a credit if
//! nobody waits. Credits are capped at `max_wakeup`; a wakeup beyond the
//! cap is refused, which is how a mutex detects a double unlock.
//!
//! Parking is two-step. The waiting task records the object and switches
//! out; the dispatcher then calls `add_wait_task`, which re-checks the
//! credit under the lock. A wakeup landing between the two steps is banked
//! and consumed there.

use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::time::Duration;

use cothread_core::{kwarn, SList, SpinLock, TaskState};

use crate::scheduler;
use crate::task::{Task, TaskRef};
use crate::tls;

/// Thread sleep between polls when waiting outside a coroutine
const THREAD_POLL_INTERVAL: Duration = Duration::from_micros(100);

struct Gate {
    wakeup: u32,
    released: bool,
    waiters: SList<Task>,
}

pub struct BlockObject {
    gate: SpinLock<Gate>,
    max_wakeup: u32,
}

impl BlockObject {
    /// Gate holding `initial` credits, never more than `max_wakeup`
    pub fn new(initial: u32, max_wakeup: u32) -> Self {
        BlockObject {
            gate: SpinLock::new(Gate {
                wakeup: initial.min(max_wakeup),
                released: false,
                waiters: SList::new(),
            }),
            max_wakeup,
        }
    }

    /// Consume a credit, parking the current task until one arrives
    ///
    /// Outside a coroutine the calling thread polls `try_block_wait`.
    pub fn co_block_wait(&self) {
        if !tls::is_in_coroutine() {
            while !self.try_block_wait() {
                std::thread::sleep(THREAD_POLL_INTERVAL);
            }
            return;
        }

        if self.try_block_wait() {
            return;
        }

        let task = tls::current_task();
        // Safety: non-null inside a coroutine, and it is us
        let task = unsafe { &*task };
        task.block
            .store(self as *const BlockObject as *mut BlockObject, Ordering::Release);
        scheduler::suspend_current(task, TaskState::SysBlock);
    }

    /// Consume a credit without waiting
    pub fn try_block_wait(&self) -> bool {
        let mut gate = self.gate.lock();
        if gate.released {
            return true;
        }
        if gate.wakeup > 0 {
            gate.wakeup -= 1;
            return true;
        }
        false
    }

    /// Requeue the oldest waiter, or bank a credit
    ///
    /// Returns false if the credit is already at `max_wakeup`.
    pub fn wakeup(&self) -> bool {
        let waiter = {
            let mut gate = self.gate.lock();
            match gate.waiters.pop_front() {
                Some(t) => t,
                None => {
                    if gate.wakeup >= self.max_wakeup {
                        return false;
                    }
                    gate.wakeup += 1;
                    return true;
                }
            }
        };
        requeue(waiter);
        true
    }

    /// Check whether a wait would pass right now
    pub fn is_wakeup(&self) -> bool {
        let gate = self.gate.lock();
        gate.released || gate.wakeup > 0
    }

    /// Open the gate for good and requeue every waiter
    ///
    /// Every later wait passes immediately. Returns the number of tasks
    /// woken.
    pub fn release_all(&self) -> usize {
        let mut woken = {
            let mut gate = self.gate.lock();
            gate.released = true;
            gate.waiters.pop_n(usize::MAX)
        };
        let n = woken.len();
        while let Some(t) = woken.pop_front() {
            requeue(t);
        }
        n
    }

    pub fn is_released(&self) -> bool {
        self.gate.lock().released
    }

    /// Tasks parked on this object
    pub fn waiter_count(&self) -> usize {
        self.gate.lock().waiters.len()
    }

    #[inline]
    pub fn max_wakeup(&self) -> u32 {
        self.max_wakeup
    }

    /// Park a task that switched out on this object
    ///
    /// Returns false if it may run on instead (credit consumed or gate
    /// released).
    pub(crate) fn add_wait_task(&self, task: TaskRef) -> bool {
        let mut gate = self.gate.lock();
        if gate.released {
            return false;
        }
        if gate.wakeup > 0 {
            gate.wakeup -= 1;
            return false;
        }
        // Safety: the task stays alive while parked (base count held)
        unsafe { gate.waiters.push_back(task.as_ptr()) };
        true
    }
}

fn requeue(task: NonNull<Task>) {
    let task = TaskRef::from_ptr(task);
    task.scheduler().add_task_runnable(task);
}

impl Default for BlockObject {
    /// Binary gate starting closed
    fn default() -> Self {
        BlockObject::new(0, 1)
    }
}

impl Drop for BlockObject {
    fn drop(&mut self) {
        let parked = self.gate.get_mut().waiters.len();
        if parked > 0 {
            kwarn!("BlockObject dropped with {} parked tasks", parked);
        }
    }
}

impl std::fmt::Debug for BlockObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let gate = self.gate.lock();
        f.debug_struct("BlockObject")
            .field("wakeup", &gate.wakeup)
            .field("max_wakeup", &self.max_wakeup)
            .field("released", &gate.released)
            .field("waiters", &gate.waiters.len())
            .finish()
    }
}
