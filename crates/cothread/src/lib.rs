//! # cothread - cooperative stackful coroutines
//!
//! Blocking-style code multiplexed over a few OS threads. Each task runs on
//! its own mmap'd stack; when it would block on a socket, a timer or a
//! lock it switches back to the scheduler, which runs something else until
//! epoll or a wakeup makes it runnable again.
//!
//! ## Features
//!
//! - **Stackful**: plain functions, no `async`; deep call chains may block
//! - **Fast Context Switch**: hand-written callee-saved register switch
//! - **epoll reactor**: multi-fd waits with timeouts, first event wins
//! - **Synchronization**: keyed wait table, `CoMutex`, bounded channels
//! - **Timers**: one-shot callbacks, cancellable, and task sleeps
//!
//! ## Quick Start
//!
//! ```ignore
//! use cothread::{Runtime, SchedulerConfig, spawn, yield_now, channel};
//!
//! fn main() {
//!     let mut runtime = Runtime::new(SchedulerConfig::from_env()).unwrap();
//!
//!     runtime.block_on(|| {
//!         let (tx, rx) = channel(10);
//!
//!         spawn(move || {
//!             for i in 0..5 {
//!                 tx.send(i).unwrap();
//!             }
//!         }).unwrap();
//!
//!         while let Ok(val) = rx.recv() {
//!             println!("Received: {}", val);
//!             yield_now();
//!         }
//!     }).unwrap();
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      User Code                              │
//! │     spawn(), yield_now(), sleep(), io::read(), channel      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Scheduler                              │
//! │    shared run queue, chunked dispatch, wait table, timers   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │  Worker   │      │  Worker   │      │  Worker   │
//!    │  Thread   │      │  Thread   │      │  Thread   │
//!    └───────────┘      └───────────┘      └───────────┘
//!          │                   │                   │
//!          └───────────────────┼───────────────────┘
//!                              ▼
//!    ┌─────────────────────────────────────────────────────────┐
//!    │            epoll reactor (one pass at a time)           │
//!    │     ready fds, I/O timeouts, sleeps, deferred frees     │
//!    └─────────────────────────────────────────────────────────┘
//! ```

pub mod io;
mod worker;

use std::sync::{Arc, Weak};
use std::time::Duration;

// Re-export core types
pub use cothread_core::{
    ExceptionPolicy, SchedError, SchedResult, SendError, TaskId, TaskState, TimerId,
    TryRecvError, TrySendError,
};

// Re-export kprint macros for debug logging
pub use cothread_core::{kdebug, kerror, kinfo, kprint, kprintln, ktrace, kwarn};
pub use cothread_core::kprint::{init as init_logging, set_flush_enabled, set_log_level, LogLevel};

// Re-export env utilities
pub use cothread_core::{env_get, env_get_bits, env_get_bool, env_get_opt};

// Re-export runtime types
pub use cothread_runtime::config::debug;
pub use cothread_runtime::{
    channel, current_task_id, current_task_label, io_block_switch, io_block_wait, is_coroutine,
    set_current_task_label, yield_now, BlockObject, CoMutex, CoMutexGuard, FdInterest, IoWaitStatus,
    Options, RawCoMutex, Receiver, Scheduler, SchedulerConfig, Sender, SysDomain, TimerStats,
};

pub use worker::WorkerPool;

use cothread_core::SpinLock;

/// Scheduler used by the free functions when called outside a coroutine
static DEFAULT_SCHEDULER: SpinLock<Option<Weak<Scheduler>>> = SpinLock::new(None);

/// Runtime handle: one scheduler plus the worker threads driving it
pub struct Runtime {
    sched: Arc<Scheduler>,
    num_workers: usize,
    workers: Option<WorkerPool>,
}

impl Runtime {
    /// Create a new runtime with the given configuration
    ///
    /// This does not start any worker. Call `start()` or `block_on()` to
    /// begin. The first runtime created becomes the default target of the
    /// free `spawn` function.
    pub fn new(config: SchedulerConfig) -> SchedResult<Self> {
        let num_workers = config.num_workers;
        let sched = Scheduler::new(config)?;

        {
            let mut default = DEFAULT_SCHEDULER.lock();
            let live = default.as_ref().is_some_and(|w| w.strong_count() > 0);
            if !live {
                *default = Some(Arc::downgrade(&sched));
            }
        }

        Ok(Self {
            sched,
            num_workers,
            workers: None,
        })
    }

    /// The scheduler this runtime drives
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.sched
    }

    /// Start the worker threads
    pub fn start(&mut self) -> SchedResult<()> {
        if self.workers.is_some() {
            return Err(SchedError::AlreadyInitialized);
        }
        if self.sched.is_stopped() {
            return Err(SchedError::NotInitialized);
        }

        let mut workers = WorkerPool::new(self.num_workers);
        let started = workers.start(&self.sched);
        self.workers = Some(workers);
        if let Err(e) = started {
            self.shutdown();
            return Err(e.into());
        }
        kdebug!("runtime started with {} workers", self.num_workers);
        Ok(())
    }

    /// Run `f` as a task on a started runtime, wait for its result, then
    /// shut down
    ///
    /// A panic inside `f` surfaces as `SchedError::ChannelClosed` once the
    /// workers have logged it.
    pub fn block_on<F, T>(&mut self, f: F) -> SchedResult<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if self.workers.is_none() {
            self.start()?;
        }

        let (tx, rx) = channel(1);
        self.sched.spawn_labeled("block_on", move || {
            let _ = tx.send(f());
        })?;

        let result = rx.recv();
        self.shutdown();
        result
    }

    /// Spawn a task on this runtime
    pub fn spawn<F>(&self, f: F) -> SchedResult<TaskId>
    where
        F: FnOnce() + Send + 'static,
    {
        self.sched.spawn(f)
    }

    /// Drive the scheduler on the calling thread until no task is left
    ///
    /// For runtimes whose workers were never started.
    pub fn run_until_no_task(&self) -> SchedResult<()> {
        self.sched.run_until_no_task()
    }

    /// Stop the scheduler and join the workers
    pub fn shutdown(&mut self) {
        self.sched.stop();
        if let Some(workers) = self.workers.take() {
            if let Err(e) = workers.join() {
                kerror!("runtime shutdown: {}", e);
            }
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn default_scheduler() -> Option<Arc<Scheduler>> {
    DEFAULT_SCHEDULER.lock().as_ref().and_then(Weak::upgrade)
}

/// Spawn a task
///
/// From inside a coroutine the task goes to the caller's scheduler,
/// otherwise to the default runtime's.
pub fn spawn<F>(f: F) -> SchedResult<TaskId>
where
    F: FnOnce() + Send + 'static,
{
    if is_coroutine() {
        return cothread_runtime::with_current_scheduler(move |s| s.spawn(f))
            .unwrap_or(Err(SchedError::NotInCoroutine));
    }
    match default_scheduler() {
        Some(sched) => sched.spawn(f),
        None => Err(SchedError::NotInitialized),
    }
}

/// Suspend the current task; sleeps the thread outside a coroutine
#[inline]
pub fn sleep(duration: Duration) {
    cothread_runtime::sleep_switch(duration)
}

#[inline]
pub fn sleep_ms(ms: u64) {
    sleep(Duration::from_millis(ms))
}

/// Park the current task on a user wait key; false outside a coroutine
pub fn user_block_wait(kind: u32, key: u64) -> bool {
    cothread_runtime::with_current_scheduler(|s| s.user_block_wait(kind, key)).unwrap_or(false)
}

/// Wake up to `count` tasks parked on a user wait key of the default
/// scheduler (or the caller's, inside a coroutine)
pub fn user_block_wakeup(kind: u32, key: u64, count: u32) -> u32 {
    if let Some(n) = cothread_runtime::with_current_scheduler(|s| s.user_block_wakeup(kind, key, count)) {
        return n;
    }
    default_scheduler().map_or(0, |s| s.user_block_wakeup(kind, key, count))
}

/// Get the current task's ID
///
/// Returns `TaskId::NONE` if not running in a coroutine.
#[inline]
pub fn current_id() -> TaskId {
    current_task_id()
}
