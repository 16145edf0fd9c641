//! cothread configuration
//!
//! Provides compile-time defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder calls on `SchedulerConfig`
//! 2. Environment variables (`from_env`)
//! 3. User's cot_config.rs (compile-time, via `COT_CONFIG_RS`)
//! 4. Library defaults
//!
//! A scheduler copies its config into [`Options`], a set of atomics that
//! can be tuned while the scheduler is running.
//!
//! # Example
//!
//! ```rust,ignore
//! use cothread_runtime::config::SchedulerConfig;
//!
//! let config = SchedulerConfig::from_env()
//!     .stack_size(128 * 1024)
//!     .exception_policy(ExceptionPolicy::LogOnly);
//! ```

pub mod defaults;

use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;

use cothread_core::env::{env_get, env_get_bits, env_get_opt};
use cothread_core::ExceptionPolicy;

/// Debug output areas for `COT_DEBUG` / `Options::set_debug`
pub mod debug {
    pub const TASK: u64 = 1 << 0;
    pub const SWITCH: u64 = 1 << 1;
    pub const IOBLOCK: u64 = 1 << 2;
    pub const WAIT: u64 = 1 << 3;
    pub const TIMER: u64 = 1 << 4;
    pub const SCHEDULER: u64 = 1 << 5;
    pub const EXCEPTION: u64 = 1 << 6;
    pub const YIELD: u64 = 1 << 7;
    pub const ALL: u64 = u64::MAX;
}

/// Smallest stack a task may be given
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// Scheduler configuration with builder pattern.
///
/// Use `from_env()` to start with compile-time defaults and apply
/// any environment variable overrides.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Worker threads a `Runtime` starts (a bare `Scheduler` ignores this)
    pub num_workers: usize,
    /// Stack size per task, rounded up to whole pages
    pub stack_size: usize,
    /// Divisor for the dispatch chunk size
    pub chunk_count: usize,
    /// Upper bound on tasks popped per chunk
    pub max_chunk_size: usize,
    /// What happens to a panic that escapes a task
    pub exception_policy: ExceptionPolicy,
    /// Debug output bitmask (see [`debug`])
    pub debug: u64,
    /// Events drained per epoll_wait call
    pub epoll_batch_size: usize,
    /// Expired timers handled per reactor/timer pass
    pub timer_batch_size: usize,
    /// Cap on the idle backoff sleep when an iteration did no work
    pub max_idle_sleep: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl SchedulerConfig {
    /// Create config from compile-time defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `COT_NUM_WORKERS` - Worker threads for `Runtime`
    /// - `COT_STACK_SIZE` - Stack size per task in bytes
    /// - `COT_CHUNK_COUNT` - Divisor for dispatch chunk size
    /// - `COT_MAX_CHUNK_SIZE` - Max tasks per dispatch chunk
    /// - `COT_EXCEPTION` - `immediately`, `delay` or `log`
    /// - `COT_DEBUG` - Debug bitmask (decimal or 0x hex)
    /// - `COT_EPOLL_BATCH` - Events per epoll_wait
    /// - `COT_TIMER_BATCH` - Timers per pass
    /// - `COT_MAX_IDLE_SLEEP_US` - Idle backoff cap in microseconds
    pub fn from_env() -> Self {
        let exception_policy = env_get_opt::<String>("COT_EXCEPTION")
            .and_then(|s| ExceptionPolicy::parse(&s))
            .unwrap_or_default();

        Self {
            num_workers: env_get("COT_NUM_WORKERS", defaults::NUM_WORKERS),
            stack_size: env_get("COT_STACK_SIZE", defaults::STACK_SIZE),
            chunk_count: env_get("COT_CHUNK_COUNT", defaults::CHUNK_COUNT),
            max_chunk_size: env_get("COT_MAX_CHUNK_SIZE", defaults::MAX_CHUNK_SIZE),
            exception_policy,
            debug: env_get_bits("COT_DEBUG", defaults::DEBUG_FLAGS),
            epoll_batch_size: env_get("COT_EPOLL_BATCH", defaults::EPOLL_BATCH_SIZE),
            timer_batch_size: env_get("COT_TIMER_BATCH", defaults::TIMER_BATCH_SIZE),
            max_idle_sleep: Duration::from_micros(env_get(
                "COT_MAX_IDLE_SLEEP_US",
                defaults::MAX_IDLE_SLEEP_US,
            )),
        }
    }

    /// Create config with explicit defaults (no env override).
    /// Useful for testing or when you want full control.
    pub fn new() -> Self {
        Self {
            num_workers: defaults::NUM_WORKERS,
            stack_size: defaults::STACK_SIZE,
            chunk_count: defaults::CHUNK_COUNT,
            max_chunk_size: defaults::MAX_CHUNK_SIZE,
            exception_policy: ExceptionPolicy::default(),
            debug: defaults::DEBUG_FLAGS,
            epoll_batch_size: defaults::EPOLL_BATCH_SIZE,
            timer_batch_size: defaults::TIMER_BATCH_SIZE,
            max_idle_sleep: Duration::from_micros(defaults::MAX_IDLE_SLEEP_US),
        }
    }

    // Builder methods

    pub fn num_workers(mut self, n: usize) -> Self {
        self.num_workers = n;
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    pub fn chunk_count(mut self, n: usize) -> Self {
        self.chunk_count = n;
        self
    }

    pub fn max_chunk_size(mut self, n: usize) -> Self {
        self.max_chunk_size = n;
        self
    }

    pub fn exception_policy(mut self, policy: ExceptionPolicy) -> Self {
        self.exception_policy = policy;
        self
    }

    pub fn debug(mut self, flags: u64) -> Self {
        self.debug = flags;
        self
    }

    pub fn epoll_batch_size(mut self, n: usize) -> Self {
        self.epoll_batch_size = n;
        self
    }

    pub fn timer_batch_size(mut self, n: usize) -> Self {
        self.timer_batch_size = n;
        self
    }

    pub fn max_idle_sleep(mut self, d: Duration) -> Self {
        self.max_idle_sleep = d;
        self
    }

    /// Validate configuration and return errors if invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_workers == 0 {
            return Err(ConfigError::InvalidValue("num_workers must be > 0"));
        }
        if self.num_workers > 256 {
            return Err(ConfigError::InvalidValue("num_workers must be <= 256"));
        }
        if self.stack_size < MIN_STACK_SIZE {
            return Err(ConfigError::InvalidValue("stack_size must be >= 16KB"));
        }
        if self.chunk_count == 0 {
            return Err(ConfigError::InvalidValue("chunk_count must be > 0"));
        }
        if self.max_chunk_size == 0 {
            return Err(ConfigError::InvalidValue("max_chunk_size must be > 0"));
        }
        if self.epoll_batch_size == 0 {
            return Err(ConfigError::InvalidValue("epoll_batch_size must be > 0"));
        }
        if self.timer_batch_size == 0 {
            return Err(ConfigError::InvalidValue("timer_batch_size must be > 0"));
        }
        Ok(())
    }

    /// Print configuration (for debugging)
    pub fn print(&self) {
        eprintln!("cothread configuration:");
        eprintln!("  num_workers:       {}", self.num_workers);
        eprintln!("  stack_size:        {}", self.stack_size);
        eprintln!("  chunk_count:       {}", self.chunk_count);
        eprintln!("  max_chunk_size:    {}", self.max_chunk_size);
        eprintln!("  exception_policy:  {:?}", self.exception_policy);
        eprintln!("  debug:             {:#x}", self.debug);
        eprintln!("  epoll_batch_size:  {}", self.epoll_batch_size);
        eprintln!("  timer_batch_size:  {}", self.timer_batch_size);
        eprintln!("  max_idle_sleep:    {:?}", self.max_idle_sleep);
    }
}

/// Configuration error
#[derive(Debug, Clone)]
pub enum ConfigError {
    InvalidValue(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for cothread_core::SchedError {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::InvalidValue(msg) => cothread_core::SchedError::InvalidConfig(msg.into()),
        }
    }
}

/// Live scheduler options, adjustable while tasks are running
///
/// Values are read on every use, so a change applies to the next spawn,
/// the next dispatch chunk or the next idle sleep. Zero values written
/// through the setters are clamped to 1 where a zero would stall dispatch.
#[derive(Debug)]
pub struct Options {
    stack_size: AtomicUsize,
    chunk_count: AtomicUsize,
    max_chunk_size: AtomicUsize,
    exception_policy: AtomicU8,
    debug: AtomicU64,
    timer_batch_size: AtomicUsize,
    max_idle_sleep_us: AtomicU64,
}

impl Options {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Options {
            stack_size: AtomicUsize::new(config.stack_size),
            chunk_count: AtomicUsize::new(config.chunk_count.max(1)),
            max_chunk_size: AtomicUsize::new(config.max_chunk_size.max(1)),
            exception_policy: AtomicU8::new(config.exception_policy as u8),
            debug: AtomicU64::new(config.debug),
            timer_batch_size: AtomicUsize::new(config.timer_batch_size.max(1)),
            max_idle_sleep_us: AtomicU64::new(config.max_idle_sleep.as_micros() as u64),
        }
    }

    #[inline]
    pub fn stack_size(&self) -> usize {
        self.stack_size.load(Ordering::Relaxed)
    }

    pub fn set_stack_size(&self, size: usize) {
        self.stack_size.store(size.max(MIN_STACK_SIZE), Ordering::Relaxed);
    }

    #[inline]
    pub fn chunk_count(&self) -> usize {
        self.chunk_count.load(Ordering::Relaxed)
    }

    pub fn set_chunk_count(&self, n: usize) {
        self.chunk_count.store(n.max(1), Ordering::Relaxed);
    }

    #[inline]
    pub fn max_chunk_size(&self) -> usize {
        self.max_chunk_size.load(Ordering::Relaxed)
    }

    pub fn set_max_chunk_size(&self, n: usize) {
        self.max_chunk_size.store(n.max(1), Ordering::Relaxed);
    }

    #[inline]
    pub fn exception_policy(&self) -> ExceptionPolicy {
        ExceptionPolicy::from(self.exception_policy.load(Ordering::Relaxed))
    }

    pub fn set_exception_policy(&self, policy: ExceptionPolicy) {
        self.exception_policy.store(policy as u8, Ordering::Relaxed);
    }

    #[inline]
    pub fn debug(&self) -> u64 {
        self.debug.load(Ordering::Relaxed)
    }

    pub fn set_debug(&self, flags: u64) {
        self.debug.store(flags, Ordering::Relaxed);
    }

    /// Check whether any of `flags` is enabled
    #[inline]
    pub fn debug_enabled(&self, flags: u64) -> bool {
        self.debug() & flags != 0
    }

    #[inline]
    pub fn timer_batch_size(&self) -> usize {
        self.timer_batch_size.load(Ordering::Relaxed)
    }

    pub fn set_timer_batch_size(&self, n: usize) {
        self.timer_batch_size.store(n.max(1), Ordering::Relaxed);
    }

    #[inline]
    pub fn max_idle_sleep(&self) -> Duration {
        Duration::from_micros(self.max_idle_sleep_us.load(Ordering::Relaxed))
    }

    pub fn set_max_idle_sleep(&self, d: Duration) {
        self.max_idle_sleep_us.store(d.as_micros() as u64, Ordering::Relaxed);
    }

    /// Dispatch chunk size for a run queue holding `runnable` tasks
    #[inline]
    pub fn chunk_size(&self, runnable: usize) -> usize {
        (runnable / self.chunk_count()).min(self.max_chunk_size()).max(1)
    }
}

/// Debug print gated on an [`Options`] debug area
///
/// ```ignore
/// co_debug!(sched.options(), debug::TIMER, "timer {} fired", id);
/// ```
#[macro_export]
macro_rules! co_debug {
    ($opts:expr, $flag:expr, $($arg:tt)*) => {{
        if $opts.debug_enabled($flag) {
            $crate::__core::kdebug!($($arg)*);
        }
    }};
}
