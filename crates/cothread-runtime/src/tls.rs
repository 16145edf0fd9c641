//! Thread-local storage for the dispatcher
//!
//! Records which task the current OS thread is executing and where the
//! thread's dispatcher context is saved while a task runs.
//!
//! Every accessor is `#[inline(never)]`. A task can suspend on one thread
//! and resume on another; if the thread-local address were computed once
//! and kept in a register across the switch, the resumed task would keep
//! using the old thread's slot.

use std::cell::{Cell, UnsafeCell};

use crate::arch::SavedRegs;
use crate::task::Task;

thread_local! {
    /// Task currently executing on this thread
    static CURRENT_TASK: Cell<*const Task> = const { Cell::new(std::ptr::null()) };

    /// Dispatcher context saved while a task runs on this thread
    static SCHED_REGS: UnsafeCell<SavedRegs> = const {
        // Safety: SavedRegs is plain integers
        UnsafeCell::new(unsafe { std::mem::zeroed() })
    };

    /// Consecutive idle iterations on this thread
    static IDLE_STREAK: Cell<u32> = const { Cell::new(0) };
}

/// Set the task this thread is about to run (null to clear)
#[inline(never)]
pub fn set_current_task(task: *const Task) {
    CURRENT_TASK.with(|cell| cell.set(task));
}

/// Task currently running on this thread, null outside a coroutine
#[inline(never)]
pub fn current_task() -> *const Task {
    CURRENT_TASK.with(|cell| cell.get())
}

/// Check if we're running inside a coroutine
#[inline(never)]
pub fn is_in_coroutine() -> bool {
    !current_task().is_null()
}

/// Address of this thread's dispatcher context
#[inline(never)]
pub fn sched_regs() -> *mut SavedRegs {
    SCHED_REGS.with(|cell| cell.get())
}

/// Bump the idle streak and return the new value
#[inline(never)]
pub fn idle_streak_inc() -> u32 {
    IDLE_STREAK.with(|cell| {
        let v = cell.get().saturating_add(1);
        cell.set(v);
        v
    })
}

#[inline(never)]
pub fn idle_streak_reset() {
    IDLE_STREAK.with(|cell| cell.set(0));
}
