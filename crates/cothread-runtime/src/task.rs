//! Coroutine task
//!
//! A task owns its stack and saved registers. It is allocated by
//! `Scheduler::spawn`, linked onto exactly one list at a time (run queue,
//! dispatch batch, reactor wait set, wait-table bucket or block object)
//! and freed once its reference count drops to zero.
//!
//! # Reference counting
//!
//! - the scheduler holds one reference from spawn until the task is Done
//! - every fd the reactor registered in epoll holds one
//! - an armed I/O timeout holds one
//!
//! Dropping to zero does not free the task. It is pushed on the reactor's
//! deferred list and freed during a reactor pass with the epoll lock held,
//! after any events that still point into it have been consumed.

use std::any::Any;
use std::cell::UnsafeCell;
use std::fmt;
use std::ops::Deref;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicPtr, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;

use cothread_core::error::MemoryError;
use cothread_core::{kerror, ExceptionPolicy, Link, Linked, SpinLock, TaskId, TaskState};

use crate::arch::{self, SavedRegs};
use crate::block_object::BlockObject;
use crate::io_wait::IoWaitData;
use crate::memory::Stack;
use crate::scheduler::Scheduler;
use crate::tls;

/// Boxed task body
pub type TaskFn = Box<dyn FnOnce() + Send + 'static>;

pub struct Task {
    id: TaskId,
    state: AtomicU8,
    regs: UnsafeCell<SavedRegs>,
    stack: Stack,
    entry: UnsafeCell<Option<TaskFn>>,
    refs: AtomicUsize,
    label: SpinLock<Option<String>>,
    panic: UnsafeCell<Option<String>>,
    link: Link<Task>,
    sched: *const Scheduler,

    /// fd interests of the current I/O wait
    pub(crate) io: SpinLock<IoWaitData>,
    /// Generation of the current I/O wait, bumped on every io_block_switch
    pub(crate) io_block_id: AtomicU32,
    /// Number of fds that fired for the current generation
    pub(crate) wait_successful: AtomicU32,
    /// Set when the reactor timeout ended the current wait
    pub(crate) io_timed_out: AtomicBool,

    /// Wait-table bucket the task is parking on
    pub(crate) wait_domain: AtomicI64,
    pub(crate) wait_key: AtomicU64,
    /// BlockObject the task is parking on (null for wait-table waits)
    pub(crate) block: AtomicPtr<BlockObject>,

    /// Requested sleep, in nanoseconds
    pub(crate) sleep_ns: AtomicU64,

    yield_count: AtomicU64,
}

// Safety: fields touched from several threads are atomics or lock-protected;
// regs, entry and panic are only touched by whoever currently runs the task
// (the task itself or the dispatcher that switched out of it).
unsafe impl Send for Task {}
unsafe impl Sync for Task {}

unsafe impl Linked for Task {
    fn link(&self) -> &Link<Task> {
        &self.link
    }
}

impl Task {
    /// Allocate a task with its own stack, primed to run `f`
    pub(crate) fn new(
        sched: &Scheduler,
        f: TaskFn,
        stack_size: usize,
    ) -> Result<TaskRef, MemoryError> {
        let stack = Stack::new(stack_size)?;

        let task = Box::new(Task {
            id: TaskId::next(),
            state: AtomicU8::new(TaskState::Init as u8),
            regs: UnsafeCell::new(SavedRegs::default()),
            stack,
            entry: UnsafeCell::new(Some(f)),
            refs: AtomicUsize::new(1),
            label: SpinLock::new(None),
            panic: UnsafeCell::new(None),
            link: Link::new(),
            sched: sched as *const Scheduler,
            io: SpinLock::new(IoWaitData::default()),
            io_block_id: AtomicU32::new(0),
            wait_successful: AtomicU32::new(0),
            io_timed_out: AtomicBool::new(false),
            wait_domain: AtomicI64::new(0),
            wait_key: AtomicU64::new(0),
            block: AtomicPtr::new(std::ptr::null_mut()),
            sleep_ns: AtomicU64::new(0),
            yield_count: AtomicU64::new(0),
        });

        let ptr = NonNull::from(Box::leak(task));
        // Safety: the task is pinned on the heap until freed
        unsafe {
            let task = ptr.as_ref();
            arch::init_context(task.regs.get(), task.stack.top(), task_entry, ptr.as_ptr() as usize);
        }
        Ok(TaskRef(ptr))
    }

    #[inline]
    pub fn id(&self) -> TaskId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> TaskState {
        TaskState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Scheduler that owns this task
    #[inline]
    pub fn scheduler(&self) -> &Scheduler {
        // Safety: a scheduler frees or leaks every task before it goes away
        unsafe { &*self.sched }
    }

    pub fn label(&self) -> Option<String> {
        self.label.lock().clone()
    }

    pub fn set_label(&self, label: impl Into<String>) {
        *self.label.lock() = Some(label.into());
    }

    #[inline]
    pub(crate) fn yield_count(&self) -> u64 {
        self.yield_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    /// Stack this task runs on
    #[inline]
    pub fn stack(&self) -> &Stack {
        &self.stack
    }

    /// Take the message of a captured panic
    ///
    /// Only called by the dispatcher after the task reached Done.
    pub(crate) fn take_panic(&self) -> Option<String> {
        unsafe { (*self.panic.get()).take() }
    }

    /// Run the task until it switches back out
    ///
    /// # Safety
    ///
    /// Must be called by a dispatcher that owns the task exclusively, with
    /// the task's TLS slot already set.
    #[inline]
    pub(crate) unsafe fn switch_in(&self) {
        unsafe { arch::context_switch(tls::sched_regs(), self.regs.get()) };
    }

    /// Save this task's context and return to the dispatcher of the
    /// current thread
    ///
    /// # Safety
    ///
    /// Must be called by the task itself, on its own stack.
    #[inline]
    pub(crate) unsafe fn switch_out(&self) {
        self.yield_count.fetch_add(1, Ordering::Relaxed);
        unsafe { arch::context_switch(self.regs.get(), tls::sched_regs()) };
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.label.try_lock() {
            Some(label) => match label.as_deref() {
                Some(l) => write!(f, "{}({})", self.id, l),
                None => write!(f, "{}", self.id),
            },
            None => write!(f, "{}", self.id),
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("refs", &self.ref_count())
            .finish()
    }
}

/// Counted pointer to a heap task
///
/// Copying a `TaskRef` does not touch the count; `inc_ref`/`dec_ref` are
/// explicit, mirroring which component currently holds the task.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct TaskRef(NonNull<Task>);

// Safety: Task is Sync, and TaskRef is only dereferenced while a count is held
unsafe impl Send for TaskRef {}
unsafe impl Sync for TaskRef {}

impl TaskRef {
    #[inline]
    pub(crate) fn from_ptr(ptr: NonNull<Task>) -> Self {
        TaskRef(ptr)
    }

    #[inline]
    pub(crate) fn from_task(task: &Task) -> Self {
        TaskRef(NonNull::from(task))
    }

    #[inline]
    pub(crate) fn as_ptr(self) -> NonNull<Task> {
        self.0
    }

    #[inline]
    pub(crate) fn inc_ref(self) {
        self.refs.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop one count; the last one hands the task to the deferred list
    #[inline]
    pub(crate) fn dec_ref(self) {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "task refcount underflow");
        if prev == 1 {
            self.scheduler().io_wait().defer_delete(self);
        }
    }

    /// Free the task and unmap its stack
    ///
    /// # Safety
    ///
    /// The count must be zero and the task must not be on any list.
    pub(crate) unsafe fn free(self) {
        debug_assert!(!self.link.is_linked(), "freeing a linked task");
        drop(unsafe { Box::from_raw(self.0.as_ptr()) });
    }
}

impl Deref for TaskRef {
    type Target = Task;

    #[inline]
    fn deref(&self) -> &Task {
        // Safety: a TaskRef is only used while some component holds a count
        unsafe { self.0.as_ref() }
    }
}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskRef({:p})", self.0)
    }
}

/// First Rust frame on every task stack
extern "C" fn task_entry(arg: usize) -> ! {
    // Safety: arg is the task pointer passed to init_context
    let task = unsafe { &*(arg as *const Task) };
    let body = unsafe { (*task.entry.get()).take() };

    if let Some(body) = body {
        match task.scheduler().options().exception_policy() {
            // A panic unwinding out of this extern "C" frame aborts the
            // process with the coroutine stack still intact
            ExceptionPolicy::Immediately => body(),
            ExceptionPolicy::DelayRethrow | ExceptionPolicy::LogOnly => {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(body)) {
                    let message = panic_message(payload.as_ref());
                    unsafe { *task.panic.get() = Some(message) };
                }
            }
        }
    }

    task.set_state(TaskState::Done);
    unsafe { task.switch_out() };

    kerror!("task {} resumed after completion", task.id());
    std::process::abort();
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Box<dyn Any>".to_string()
    }
}

/// Duration helper for the sleep slot
#[inline]
pub(crate) fn duration_to_ns(d: Duration) -> u64 {
    d.as_nanos().min(u64::MAX as u128) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let payload = panic::catch_unwind(|| panic!("static text")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "static text");

        let payload = panic::catch_unwind(|| panic!("formatted {}", 7)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "formatted 7");

        let payload = panic::catch_unwind(|| std::panic::panic_any(5u8)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "Box<dyn Any>");
    }

    #[test]
    fn test_duration_to_ns() {
        assert_eq!(duration_to_ns(Duration::from_micros(3)), 3_000);
        assert_eq!(duration_to_ns(Duration::MAX), u64::MAX);
    }
}
