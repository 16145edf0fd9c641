//! Task state and scheduling policy enums

use core::fmt;

/// State of a coroutine task
///
/// A task only changes its own state while it is executing; the dispatcher
/// reads the state immediately after switching out of the task and routes
/// it accordingly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// Just created, stack and context not yet handed to the run queue
    Init = 0,

    /// Eligible for the next dispatch batch
    Runnable = 1,

    /// Parked in the reactor awaiting fd readiness and/or a timeout
    IoBlock = 2,

    /// Parked under a reserved (negative) wait domain or a BlockObject
    SysBlock = 3,

    /// Parked under a user (non-negative) wait domain
    UserBlock = 4,

    /// Parked awaiting a relative deadline with no fd interest
    Sleep = 5,

    /// Function returned (or its panic was captured)
    Done = 6,

    /// Construction failed, never ran
    Fatal = 7,
}

impl TaskState {
    /// Check if this state allows the task to be dispatched
    #[inline]
    pub const fn is_runnable(&self) -> bool {
        matches!(self, TaskState::Runnable)
    }

    /// Check if this task has terminated
    #[inline]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Done | TaskState::Fatal)
    }

    /// Check if the task is parked in a wait-table bucket or BlockObject
    #[inline]
    pub const fn is_block(&self) -> bool {
        matches!(self, TaskState::SysBlock | TaskState::UserBlock)
    }
}

impl From<u8> for TaskState {
    fn from(v: u8) -> Self {
        match v {
            0 => TaskState::Init,
            1 => TaskState::Runnable,
            2 => TaskState::IoBlock,
            3 => TaskState::SysBlock,
            4 => TaskState::UserBlock,
            5 => TaskState::Sleep,
            6 => TaskState::Done,
            _ => TaskState::Fatal,
        }
    }
}

impl From<TaskState> for u8 {
    fn from(state: TaskState) -> u8 {
        state as u8
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Init => "init",
            TaskState::Runnable => "runnable",
            TaskState::IoBlock => "io_block",
            TaskState::SysBlock => "sys_block",
            TaskState::UserBlock => "user_block",
            TaskState::Sleep => "sleep",
            TaskState::Done => "done",
            TaskState::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

/// What the dispatcher does with a panic that escapes a task's function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ExceptionPolicy {
    /// Let the panic cross the coroutine entry frame, aborting the process
    /// with the panic hook output and the coroutine stack intact
    Immediately = 0,

    /// Capture the panic on the task and return it from `run()` once the
    /// coroutine stack has unwound
    #[default]
    DelayRethrow = 1,

    /// Log the panic and drop it
    LogOnly = 2,
}

impl ExceptionPolicy {
    /// Parse from the `COT_EXCEPTION` spelling
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "immediately" | "immediate" | "abort" | "0" => Some(ExceptionPolicy::Immediately),
            "delay" | "delay_rethrow" | "rethrow" | "1" => Some(ExceptionPolicy::DelayRethrow),
            "log" | "log_only" | "debugger_only" | "2" => Some(ExceptionPolicy::LogOnly),
            _ => None,
        }
    }
}

impl From<u8> for ExceptionPolicy {
    fn from(v: u8) -> Self {
        match v {
            0 => ExceptionPolicy::Immediately,
            2 => ExceptionPolicy::LogOnly,
            _ => ExceptionPolicy::DelayRethrow,
        }
    }
}
