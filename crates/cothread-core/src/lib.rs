//! # cothread-core
//!
//! Core types shared by the cothread coroutine runtime.
//!
//! Nothing in here switches stacks or talks to epoll; that lives in
//! `cothread-runtime`.
//!
//! ## Modules
//!
//! - `id` - Task and timer identifiers
//! - `state` - Task state and exception policy enums
//! - `spinlock` - Busy-wait lock for short critical sections
//! - `ts_queue` - Intrusive lists (`SList`) and the locked `TsQueue`
//! - `error` - Error types
//! - `kprint` - Kernel-style debug printing macros
//! - `env` - Environment variable utilities

pub mod id;
pub mod state;
pub mod spinlock;
pub mod ts_queue;
pub mod error;
pub mod kprint;
pub mod env;

// Re-exports for convenience
pub use id::{TaskId, TimerId};
pub use state::{ExceptionPolicy, TaskState};
pub use spinlock::{SpinLock, SpinLockGuard};
pub use ts_queue::{Link, Linked, SList, TsQueue};
pub use error::{
    MemoryError, SchedError, SchedResult, SendError, TryRecvError, TrySendError, WorkerError,
};
pub use env::{env_get, env_get_bits, env_get_bool, env_get_opt};
