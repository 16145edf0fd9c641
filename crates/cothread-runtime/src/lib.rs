//! # cothread-runtime
//!
//! Linux runtime for the cothread coroutine scheduler.
//!
//! This crate provides:
//! - Task stacks (mmap with a guard page)
//! - Context switching (architecture-specific assembly)
//! - The epoll reactor with I/O timeouts and sleeps
//! - Timer manager
//! - Keyed wait table, BlockObject, CoMutex and channel
//! - The scheduler and its dispatch loop

pub mod config;
pub mod memory;
pub mod arch;
pub mod tls;
pub mod task;
pub mod timer;
pub mod io_wait;
pub mod wait_table;
pub mod block_object;
pub mod sync;
pub mod scheduler;

// Re-exports
pub use config::{Options, SchedulerConfig};
pub use scheduler::{
    current_task_id, current_task_label, io_block_switch, io_block_wait, is_coroutine,
    set_current_task_label, sleep_switch, with_current_scheduler, yield_now, Scheduler, TimerFn,
};
pub use io_wait::{poll_fallback, FdInterest, IoWait, IoWaitStatus};
pub use timer::{TimerManager, TimerStats};
pub use wait_table::{SysDomain, WaitTable};
pub use block_object::BlockObject;
pub use sync::{channel, CoMutex, CoMutexGuard, RawCoMutex, Receiver, Sender};

#[doc(hidden)]
pub use cothread_core as __core;

// Platform detection
cfg_if::cfg_if! {
    if #[cfg(not(target_os = "linux"))] {
        compile_error!("cothread-runtime needs epoll; only Linux is supported");
    }
}

// Architecture detection
cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub use arch::x86_64 as current_arch;
    } else if #[cfg(target_arch = "aarch64")] {
        pub use arch::aarch64 as current_arch;
    } else {
        compile_error!("Unsupported architecture");
    }
}
