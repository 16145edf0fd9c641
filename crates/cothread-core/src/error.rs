//! Error types for the cothread runtime

use core::fmt;

use nix::errno::Errno;

use crate::id::TaskId;

/// Result type for scheduler operations
pub type SchedResult<T> = Result<T, SchedError>;

/// Errors that can occur in scheduler operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedError {
    /// Operation needs a running coroutine but was called from a plain thread
    NotInCoroutine,

    /// Unlock of a mutex (or wakeup of a gate) that would exceed its credit limit
    DoubleUnlock,

    /// A task panicked and the scheduler runs with the delayed-rethrow policy
    TaskPanicked {
        task_id: TaskId,
        label: Option<String>,
        message: String,
    },

    /// Channel was closed
    ChannelClosed,

    /// Runtime not started
    NotInitialized,

    /// Runtime already started
    AlreadyInitialized,

    /// Configuration rejected by validation
    InvalidConfig(String),

    /// Stack allocation/mapping failed
    Memory(MemoryError),

    /// Worker thread error
    Worker(WorkerError),

    /// epoll setup failed (errno)
    Reactor(i32),
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedError::NotInCoroutine => write!(f, "not running inside a coroutine"),
            SchedError::DoubleUnlock => write!(f, "unlock without matching lock"),
            SchedError::TaskPanicked { task_id, label, message } => match label {
                Some(label) => write!(f, "task {} ({}) panicked: {}", task_id, label, message),
                None => write!(f, "task {} panicked: {}", task_id, message),
            },
            SchedError::ChannelClosed => write!(f, "channel closed"),
            SchedError::NotInitialized => write!(f, "runtime not initialized"),
            SchedError::AlreadyInitialized => write!(f, "runtime already initialized"),
            SchedError::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
            SchedError::Memory(e) => write!(f, "memory error: {}", e),
            SchedError::Worker(e) => write!(f, "worker error: {}", e),
            SchedError::Reactor(code) => {
                write!(f, "reactor error: {}", Errno::from_raw(*code).desc())
            }
        }
    }
}

impl std::error::Error for SchedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SchedError::Memory(e) => Some(e),
            SchedError::Worker(e) => Some(e),
            _ => None,
        }
    }
}

/// Stack memory errors, carrying the errno of the failed call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// mmap failed
    AllocationFailed(i32),

    /// mprotect of the guard page failed
    ProtectionFailed(i32),

    /// Requested stack size is unusable
    InvalidSize(usize),
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::AllocationFailed(code) => {
                write!(f, "stack allocation failed: {}", Errno::from_raw(*code).desc())
            }
            MemoryError::ProtectionFailed(code) => {
                write!(f, "guard page protection failed: {}", Errno::from_raw(*code).desc())
            }
            MemoryError::InvalidSize(size) => write!(f, "invalid stack size {}", size),
        }
    }
}

impl std::error::Error for MemoryError {}

impl From<MemoryError> for SchedError {
    fn from(e: MemoryError) -> Self {
        SchedError::Memory(e)
    }
}

/// Worker thread related errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    /// Failed to spawn worker thread
    SpawnFailed,

    /// Worker thread panicked
    Panicked,
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerError::SpawnFailed => write!(f, "failed to spawn worker thread"),
            WorkerError::Panicked => write!(f, "worker thread panicked"),
        }
    }
}

impl std::error::Error for WorkerError {}

impl From<WorkerError> for SchedError {
    fn from(e: WorkerError) -> Self {
        SchedError::Worker(e)
    }
}

/// Error returned when sending on a closed channel; gives the value back
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendError<T>(pub T);

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel closed")
    }
}

/// Error returned by a non-blocking send
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrySendError<T> {
    Full(T),
    Closed(T),
}

impl<T> TrySendError<T> {
    pub fn into_inner(self) -> T {
        match self {
            TrySendError::Full(v) | TrySendError::Closed(v) => v,
        }
    }
}

impl<T> fmt::Display for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrySendError::Full(_) => write!(f, "channel full"),
            TrySendError::Closed(_) => write!(f, "channel closed"),
        }
    }
}

/// Error returned by a non-blocking receive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryRecvError {
    Empty,
    Closed,
}

impl fmt::Display for TryRecvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TryRecvError::Empty => write!(f, "channel empty"),
            TryRecvError::Closed => write!(f, "channel closed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(SchedError::DoubleUnlock.to_string(), "unlock without matching lock");

        let e = SchedError::Memory(MemoryError::InvalidSize(3));
        assert_eq!(e.to_string(), "memory error: invalid stack size 3");

        let e = SchedError::TaskPanicked {
            task_id: TaskId::new(7),
            label: Some("worker".into()),
            message: "boom".into(),
        };
        assert_eq!(e.to_string(), "task 7 (worker) panicked: boom");
    }

    #[test]
    fn test_errno_messages() {
        let e = SchedError::Reactor(Errno::ENOMEM as i32);
        assert!(e.to_string().starts_with("reactor error: "));
        assert_ne!(e.to_string(), "reactor error: ");
    }

    #[test]
    fn test_error_conversion() {
        let sched_err: SchedError = MemoryError::AllocationFailed(12).into();
        assert!(matches!(sched_err, SchedError::Memory(MemoryError::AllocationFailed(12))));
        assert!(std::error::Error::source(&sched_err).is_some());

        let sched_err: SchedError = WorkerError::SpawnFailed.into();
        assert!(matches!(sched_err, SchedError::Worker(WorkerError::SpawnFailed)));
    }

    #[test]
    fn test_try_send_into_inner() {
        assert_eq!(TrySendError::Full(5).into_inner(), 5);
        assert_eq!(TrySendError::Closed("x").into_inner(), "x");
    }
}
