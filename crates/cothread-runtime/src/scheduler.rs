//! Scheduler: run queue, dispatcher and the public scheduling API
//!
//! Any number of OS threads may call [`Scheduler::run`] on the same
//! scheduler. One iteration:
//!
//! 1. Pops up to the current runnable count from the shared run queue in
//!    chunks, switches into each task and routes it by the state it left
//!    itself in.
//! 2. Runs a reactor pass (ready fds, I/O timeouts, sleeps, deferred frees).
//! 3. Fires due user timers.
//!
//! An iteration that found nothing to do sleeps with capped exponential
//! backoff.
//!
//! A task is only ever touched by the dispatcher that switched out of it
//! until that dispatcher hands it to a queue, the reactor, the wait table
//! or a BlockObject. After the hand-off another thread may already be
//! running it.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cothread_core::kprint::{self, LogLevel};
use cothread_core::{
    kdebug, kerror, ExceptionPolicy, SList, SchedError, SchedResult, TaskId, TaskState, TimerId,
    TsQueue,
};

use crate::co_debug;
use crate::config::{debug, Options, SchedulerConfig};
use crate::io_wait::{poll_fallback, FdInterest, FdWait, IoWait, IoWaitStatus};
use crate::task::{duration_to_ns, Task, TaskRef};
use crate::timer::{TimerManager, TimerStats};
use crate::tls;
use crate::wait_table::{user_domain, WaitTable};

/// Boxed user timer callback
pub type TimerFn = Box<dyn FnOnce() + Send + 'static>;

/// Longest idle backoff step before the configured cap applies
const MAX_BACKOFF_SHIFT: u32 = 16;

pub struct Scheduler {
    options: Options,
    run_queue: TsQueue<Task>,
    /// Live tasks (spawned and not yet Done)
    task_count: AtomicUsize,
    /// Tasks queued or executing, i.e. not parked anywhere
    runnable_count: AtomicUsize,
    io_wait: IoWait,
    timers: TimerManager<TimerFn>,
    wait_table: WaitTable,
    stop: AtomicBool,
}

impl Scheduler {
    /// Create a scheduler; tasks keep a pointer to it, hence the `Arc`
    pub fn new(config: SchedulerConfig) -> SchedResult<Arc<Scheduler>> {
        config.validate()?;

        if config.debug != 0 && !kprint::level_enabled(LogLevel::Debug) {
            kprint::set_log_level(LogLevel::Debug);
        }

        let io_wait = IoWait::new(config.epoll_batch_size)?;
        let sched = Arc::new(Scheduler {
            options: Options::from_config(&config),
            run_queue: TsQueue::new(),
            task_count: AtomicUsize::new(0),
            runnable_count: AtomicUsize::new(0),
            io_wait,
            timers: TimerManager::new(),
            wait_table: WaitTable::new(),
            stop: AtomicBool::new(false),
        });

        co_debug!(
            sched.options,
            debug::SCHEDULER,
            "scheduler created: stack={} chunk_count={} max_chunk={} policy={:?}",
            config.stack_size,
            config.chunk_count,
            config.max_chunk_size,
            config.exception_policy
        );
        Ok(sched)
    }

    /// Scheduler with compile-time defaults and `COT_*` overrides
    pub fn with_defaults() -> SchedResult<Arc<Scheduler>> {
        Self::new(SchedulerConfig::from_env())
    }

    /// Live options; changes apply from the next spawn/iteration
    #[inline]
    pub fn options(&self) -> &Options {
        &self.options
    }

    #[inline]
    pub fn io_wait(&self) -> &IoWait {
        &self.io_wait
    }

    /// Spawn a task running `f`
    pub fn spawn<F>(&self, f: F) -> SchedResult<TaskId>
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn_task(Box::new(f), None)
    }

    /// Spawn a task with a debug label
    pub fn spawn_labeled<F>(&self, label: impl Into<String>, f: F) -> SchedResult<TaskId>
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn_task(Box::new(f), Some(label.into()))
    }

    fn spawn_task(
        &self,
        f: crate::task::TaskFn,
        label: Option<String>,
    ) -> SchedResult<TaskId> {
        let task = Task::new(self, f, self.options.stack_size()).map_err(|e| {
            kerror!("spawn failed: {}", e);
            SchedError::Memory(e)
        })?;
        if let Some(label) = label {
            task.set_label(label);
        }

        let id = task.id();
        self.task_count.fetch_add(1, Ordering::AcqRel);
        co_debug!(self.options, debug::TASK, "task {} spawned", *task);
        self.add_task_runnable(task);
        Ok(id)
    }

    /// Make a task runnable and queue it
    pub(crate) fn add_task_runnable(&self, task: TaskRef) {
        task.set_state(TaskState::Runnable);
        self.runnable_count.fetch_add(1, Ordering::AcqRel);
        co_debug!(self.options, debug::SCHEDULER, "task {} queued", *task);
        // Safety: the task is off every list and holds its base count
        unsafe { self.run_queue.push(task.as_ptr()) };
    }

    /// One scheduling iteration; returns the number of task switches
    ///
    /// With `ExceptionPolicy::DelayRethrow` a task panic surfaces here as
    /// `SchedError::TaskPanicked`, after the rest of the batch was
    /// requeued. Calling `run` again continues with the other tasks.
    pub fn run(&self) -> SchedResult<usize> {
        let ran = self.do_runnable()?;
        let woken = self
            .io_wait
            .wait_loop(&self.options, |task| self.add_task_runnable(task));
        let fired = self.do_timer();

        if ran + woken + fired == 0 {
            self.idle();
        } else {
            tls::idle_streak_reset();
        }
        Ok(ran)
    }

    /// Run until every spawned task has finished (or `stop` was called)
    pub fn run_until_no_task(&self) -> SchedResult<()> {
        while self.task_count() > 0 && !self.is_stopped() {
            self.run()?;
        }
        Ok(())
    }

    /// Run until `stop` is called
    pub fn run_loop(&self) -> SchedResult<()> {
        while !self.is_stopped() {
            self.run()?;
        }
        Ok(())
    }

    pub fn stop(&self) {
        co_debug!(self.options, debug::SCHEDULER, "stop requested");
        self.stop.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn do_runnable(&self) -> SchedResult<usize> {
        let max = self.runnable_count();
        let mut count = 0usize;

        while count < max {
            let n = self.options.chunk_size(max);
            let mut batch = self.run_queue.pop_n(n);
            if batch.is_empty() {
                break;
            }
            co_debug!(self.options, debug::SCHEDULER, "dispatch chunk of {}", batch.len());
            count += self.run_batch(&mut batch)?;
        }
        Ok(count)
    }

    fn run_batch(&self, batch: &mut SList<Task>) -> SchedResult<usize> {
        let mut keep: SList<Task> = SList::new();
        let mut count = 0usize;

        while let Some(ptr) = batch.pop_front() {
            let task = TaskRef::from_ptr(ptr);
            task.set_state(TaskState::Runnable);

            tls::set_current_task(ptr.as_ptr());
            kprint::set_task_tag(task.id().as_u64());
            co_debug!(self.options, debug::SWITCH, "enter task {}", *task);

            // Safety: popped from the run queue, so this thread owns it
            unsafe { task.switch_in() };

            kprint::set_task_tag(0);
            tls::set_current_task(std::ptr::null());
            count += 1;

            let state = task.state();
            co_debug!(self.options, debug::SWITCH, "leave task {} state={}", *task, state);

            match state {
                TaskState::Runnable => {
                    // Safety: just popped, not on any list
                    unsafe { keep.push_back(ptr) };
                }
                TaskState::IoBlock => {
                    self.runnable_count.fetch_sub(1, Ordering::AcqRel);
                    if !self.io_wait.scheduler_switch(task, &self.options) {
                        self.runnable_count.fetch_add(1, Ordering::AcqRel);
                        task.set_state(TaskState::Runnable);
                        unsafe { keep.push_back(ptr) };
                    }
                }
                TaskState::Sleep => {
                    self.runnable_count.fetch_sub(1, Ordering::AcqRel);
                    let duration = Duration::from_nanos(task.sleep_ns.load(Ordering::Acquire));
                    let id = self.io_wait.sleep_switch(task, duration);
                    co_debug!(self.options, debug::TIMER, "task {} sleeps {:?} timer {}", *task, duration, id);
                }
                TaskState::SysBlock | TaskState::UserBlock => {
                    self.runnable_count.fetch_sub(1, Ordering::AcqRel);
                    let block = task.block.swap(std::ptr::null_mut(), Ordering::AcqRel);
                    let parked = if block.is_null() {
                        self.wait_table.park(task)
                    } else {
                        // Safety: the waiter keeps the object alive while
                        // it is blocked on it
                        unsafe { (*block).add_wait_task(task) }
                    };
                    if parked {
                        co_debug!(self.options, debug::WAIT, "task {} parked", *task);
                    } else {
                        self.runnable_count.fetch_add(1, Ordering::AcqRel);
                        task.set_state(TaskState::Runnable);
                        unsafe { keep.push_back(ptr) };
                    }
                }
                TaskState::Init | TaskState::Done | TaskState::Fatal => {
                    self.task_count.fetch_sub(1, Ordering::AcqRel);
                    self.runnable_count.fetch_sub(1, Ordering::AcqRel);
                    co_debug!(self.options, debug::TASK, "task {} finished", *task);

                    if let Some(message) = task.take_panic() {
                        if let Some(err) = self.handle_panic(task, message) {
                            self.run_queue.push_list(&mut keep);
                            self.run_queue.push_list(batch);
                            task.dec_ref();
                            return Err(err);
                        }
                    }
                    task.dec_ref();
                }
            }
        }

        self.run_queue.push_list(&mut keep);
        Ok(count)
    }

    /// Apply the exception policy to a captured panic; Some means surface
    /// it from `run`
    fn handle_panic(&self, task: TaskRef, message: String) -> Option<SchedError> {
        let label = task.label();
        match self.options.exception_policy() {
            ExceptionPolicy::LogOnly => {
                kerror!("task {} panicked: {}", *task, message);
                None
            }
            ExceptionPolicy::DelayRethrow | ExceptionPolicy::Immediately => {
                co_debug!(self.options, debug::EXCEPTION, "task {} panicked, rethrowing: {}", *task, message);
                Some(SchedError::TaskPanicked {
                    task_id: task.id(),
                    label,
                    message,
                })
            }
        }
    }

    /// Fire due user timers one at a time, so only the running callback
    /// counts as in flight
    fn do_timer(&self) -> usize {
        let limit = self.options.timer_batch_size();
        let now = Instant::now();
        let mut n = 0usize;
        while n < limit {
            let Some(mut timer) = self.timers.pop_expired(now) else {
                break;
            };
            let id = timer.id();
            if let Some(callback) = timer.take() {
                co_debug!(self.options, debug::TIMER, "enter timer callback {}", id);
                callback();
                co_debug!(self.options, debug::TIMER, "leave timer callback {}", id);
            }
            n += 1;
        }
        n
    }

    fn idle(&self) {
        let cap = self.options.max_idle_sleep();
        if cap.is_zero() {
            std::thread::yield_now();
            return;
        }

        let streak = tls::idle_streak_inc();
        let step = Duration::from_micros(1u64 << streak.min(MAX_BACKOFF_SHIFT));
        let mut sleep = step.min(cap);

        let deadline = [self.timers.next_deadline(), self.io_wait.next_deadline()]
            .into_iter()
            .flatten()
            .min();
        if let Some(deadline) = deadline {
            sleep = sleep.min(deadline.saturating_duration_since(Instant::now()));
        }
        if !sleep.is_zero() {
            std::thread::sleep(sleep);
        }
    }

    // Keyed waits

    /// Park the current task on `(domain, key)` until woken
    ///
    /// Negative domains are reserved for the runtime. Returns false outside
    /// a coroutine.
    pub fn block_wait(&self, domain: i64, key: u64) -> bool {
        let Some(task) = current() else {
            return false;
        };
        task.wait_domain.store(domain, Ordering::Release);
        task.wait_key.store(key, Ordering::Release);
        let state = if domain < 0 {
            TaskState::SysBlock
        } else {
            TaskState::UserBlock
        };
        co_debug!(self.options, debug::WAIT, "task {} {} on ({}, {})", task, state, domain, key);
        suspend_current(task, state);
        true
    }

    /// Consume a banked wakeup for `(domain, key)` without parking
    pub fn try_block_wait(&self, domain: i64, key: u64) -> bool {
        self.wait_table.try_wait(domain, key)
    }

    /// Wake up to `count` waiters of `(domain, key)` in FIFO order
    ///
    /// The shortfall is banked for future waits. Returns the number of
    /// tasks woken.
    pub fn block_wakeup(&self, domain: i64, key: u64, count: u32) -> u32 {
        let mut tasks = self.wait_table.wakeup(domain, key, count);
        let mut woken = 0u32;
        while let Some(ptr) = tasks.pop_front() {
            let task = TaskRef::from_ptr(ptr);
            co_debug!(self.options, debug::WAIT, "wakeup task {} from ({}, {})", *task, domain, key);
            self.add_task_runnable(task);
            woken += 1;
        }
        woken
    }

    pub fn user_block_wait(&self, kind: u32, key: u64) -> bool {
        self.block_wait(user_domain(kind), key)
    }

    pub fn try_user_block_wait(&self, kind: u32, key: u64) -> bool {
        self.try_block_wait(user_domain(kind), key)
    }

    pub fn user_block_wakeup(&self, kind: u32, key: u64, count: u32) -> u32 {
        self.block_wakeup(user_domain(kind), key, count)
    }

    #[inline]
    pub fn wait_table(&self) -> &WaitTable {
        &self.wait_table
    }

    // Timers

    /// Run `f` on a dispatcher thread once `deadline` has passed
    pub fn expire_at<F>(&self, deadline: Instant, f: F) -> TimerId
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.timers.expire_at(deadline, Box::new(f));
        co_debug!(self.options, debug::TIMER, "timer {} armed", id);
        id
    }

    pub fn expire_after<F>(&self, after: Duration, f: F) -> TimerId
    where
        F: FnOnce() + Send + 'static,
    {
        self.expire_at(Instant::now() + after, f)
    }

    /// Cancel a timer that has not fired yet
    pub fn cancel_timer(&self, id: TimerId) -> bool {
        self.timers.cancel(id)
    }

    /// Cancel, waiting for the callback to return if it is running
    pub fn block_cancel_timer(&self, id: TimerId) -> bool {
        self.timers.block_cancel(id)
    }

    pub fn timer_stats(&self) -> TimerStats {
        self.timers.stats()
    }

    // Introspection

    /// Tasks spawned and not yet finished
    #[inline]
    pub fn task_count(&self) -> usize {
        self.task_count.load(Ordering::Acquire)
    }

    /// Tasks queued or running
    #[inline]
    pub fn runnable_task_count(&self) -> usize {
        self.runnable_count()
    }

    #[inline]
    fn runnable_count(&self) -> usize {
        self.runnable_count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.task_count() == 0
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let mut queued = self.run_queue.pop_all();
        let mut queued_freed = 0usize;
        while let Some(ptr) = queued.pop_front() {
            // Safety: queued tasks hold only their base count
            unsafe { TaskRef::from_ptr(ptr).free() };
            queued_freed += 1;
        }
        drop(self.timers.drain());
        // Finished tasks waiting for a reactor pass
        let done_freed = self.io_wait.drain_deferred();

        let live = self.task_count().saturating_sub(queued_freed);
        if live > 0 {
            cothread_core::kwarn!("scheduler dropped with {} parked tasks; leaking them", live);
        }
        kdebug!("scheduler dropped, {} tasks freed", queued_freed + done_freed);
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("tasks", &self.task_count())
            .field("runnable", &self.runnable_count())
            .field("io_waiting", &self.io_wait.wait_task_count())
            .field("timers", &self.timers.len())
            .finish()
    }
}

/// Current task, None outside a coroutine
#[inline]
fn current() -> Option<&'static Task> {
    let ptr = tls::current_task();
    // Safety: the running task outlives every call made on its own stack
    unsafe { ptr.as_ref() }
}

/// Record `state` and switch back to the dispatcher
pub(crate) fn suspend_current(task: &Task, state: TaskState) {
    task.set_state(state);
    // Safety: called by the task on its own stack
    unsafe { task.switch_out() };
}

/// Give other tasks a turn; no-op outside a coroutine
pub fn yield_now() {
    let Some(task) = current() else {
        return;
    };
    co_debug!(task.scheduler().options(), debug::YIELD, "task {} yield", task);
    suspend_current(task, TaskState::Runnable);
}

/// Suspend the current task for `duration`
///
/// Outside a coroutine this sleeps the thread.
pub fn sleep_switch(duration: Duration) {
    let Some(task) = current() else {
        std::thread::sleep(duration);
        return;
    };
    task.sleep_ns.store(duration_to_ns(duration), Ordering::Release);
    suspend_current(task, TaskState::Sleep);
}

/// Wait until any of `fds` is ready or `timeout` expires
///
/// Returns the number of fds that fired, 0 on timeout or if no fd could be
/// registered. `revents` of every entry is filled in. Outside a coroutine
/// this is a blocking poll(2).
pub fn io_block_switch(fds: &mut [FdInterest], timeout: Option<Duration>) -> usize {
    io_block_wait(fds, timeout).ready_count()
}

/// `io_block_switch` that tells a timeout apart from a wait that never
/// started
pub fn io_block_wait(fds: &mut [FdInterest], timeout: Option<Duration>) -> IoWaitStatus {
    let Some(task) = current() else {
        return match poll_fallback(fds, timeout) {
            0 if timeout.is_some() => IoWaitStatus::TimedOut,
            0 => IoWaitStatus::NotRegistered,
            n => IoWaitStatus::Ready(n),
        };
    };

    {
        let mut io = task.io.lock();
        let io_block_id = task.io_block_id.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        task.wait_successful.store(0, Ordering::Release);
        task.io_timed_out.store(false, Ordering::Release);
        let task_ref = TaskRef::from_task(task);
        io.fds = fds
            .iter()
            .map(|f| FdWait::new(f, task_ref, io_block_id))
            .collect();
        io.timeout = timeout;
        io.timer = None;
    }

    co_debug!(task.scheduler().options(), debug::IOBLOCK, "task {} io_block on {} fds, timeout {:?}", task, fds.len(), timeout);
    suspend_current(task, TaskState::IoBlock);

    let io = task.io.lock();
    for (f, w) in fds.iter_mut().zip(io.fds.iter()) {
        f.revents = w.revents.load(Ordering::Acquire);
    }
    match task.wait_successful.load(Ordering::Acquire) {
        0 if task.io_timed_out.load(Ordering::Acquire) => IoWaitStatus::TimedOut,
        0 => IoWaitStatus::NotRegistered,
        n => IoWaitStatus::Ready(n as usize),
    }
}

/// Id of the running task, `TaskId::NONE` outside a coroutine
pub fn current_task_id() -> TaskId {
    current().map_or(TaskId::NONE, |t| t.id())
}

/// Label of the running task
pub fn current_task_label() -> Option<String> {
    current().and_then(|t| t.label())
}

/// Set the label of the running task; no-op outside a coroutine
pub fn set_current_task_label(label: impl Into<String>) {
    if let Some(task) = current() {
        task.set_label(label);
    }
}

/// Check whether the caller runs inside a coroutine
#[inline]
pub fn is_coroutine() -> bool {
    tls::is_in_coroutine()
}

/// Run `f` with the scheduler of the running task
pub fn with_current_scheduler<R>(f: impl FnOnce(&Scheduler) -> R) -> Option<R> {
    current().map(|task| f(task.scheduler()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::CoMutex;
    use std::os::unix::io::RawFd;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    fn sched() -> Arc<Scheduler> {
        Scheduler::new(SchedulerConfig::new().stack_size(64 * 1024)).unwrap()
    }

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) }, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn test_yield_interleaving() {
        let s = sched();
        let out = Arc::new(Mutex::new(Vec::new()));

        for (a, b) in [(1, 3), (2, 4)] {
            let out = out.clone();
            s.spawn(move || {
                out.lock().unwrap().push(a);
                yield_now();
                out.lock().unwrap().push(b);
            })
            .unwrap();
        }

        s.run_until_no_task().unwrap();
        assert_eq!(*out.lock().unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(s.task_count(), 0);
        assert_eq!(s.runnable_task_count(), 0);
    }

    #[test]
    fn test_mutex_counter() {
        let s = sched();
        let m = Arc::new(CoMutex::new(0u32));
        let guard = m.lock();

        for _ in 0..2 {
            let m = m.clone();
            s.spawn(move || {
                for _ in 0..3 {
                    let mut g = m.lock();
                    let v = *g;
                    yield_now();
                    *g = v + 1;
                }
            })
            .unwrap();
        }

        s.run().unwrap();
        assert_eq!(s.runnable_task_count(), 0);
        assert_eq!(s.task_count(), 2);

        drop(guard);
        s.run_until_no_task().unwrap();
        assert_eq!(*m.lock(), 6);
    }

    #[test]
    fn test_timer_cancel_before_fire() {
        let s = sched();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let id = s.expire_after(Duration::from_millis(500), move || flag.store(true, Ordering::SeqCst));

        assert!(s.cancel_timer(id));
        assert!(!s.cancel_timer(id));
        assert!(!s.block_cancel_timer(id));
        for _ in 0..3 {
            s.run().unwrap();
        }
        assert!(!fired.load(Ordering::SeqCst));
        assert_eq!(s.timer_stats().total_cancelled, 1);
    }

    #[test]
    fn test_timer_callback_cancels_timer_of_same_batch() {
        let s = sched();
        let when = Instant::now();
        let target = Arc::new(Mutex::new(None));
        let cancelled = Arc::new(Mutex::new(None));
        let second_ran = Arc::new(AtomicBool::new(false));

        let sc = s.clone();
        let (t, c) = (target.clone(), cancelled.clone());
        s.expire_at(when, move || {
            let id = t.lock().unwrap().take().unwrap();
            *c.lock().unwrap() = Some(sc.block_cancel_timer(id));
        });
        let flag = second_ran.clone();
        let second = s.expire_at(when, move || flag.store(true, Ordering::SeqCst));
        *target.lock().unwrap() = Some(second);

        let (tx, rx) = std::sync::mpsc::channel();
        let s2 = s.clone();
        std::thread::spawn(move || {
            s2.run().unwrap();
            let _ = tx.send(());
        });
        rx.recv_timeout(Duration::from_secs(5))
            .expect("timer callback never returned");

        assert_eq!(*cancelled.lock().unwrap(), Some(true));
        assert!(!second_ran.load(Ordering::SeqCst));
        assert_eq!(s.timer_stats().total_cancelled, 1);
        assert_eq!(s.timer_stats().in_flight, 0);
    }

    #[test]
    fn test_block_cancel_timer_in_coroutine_waits() {
        let s = sched();
        let id = s.expire_after(Duration::ZERO, || {});
        // Hold the timer in flight as a dispatcher running its callback would
        let in_flight = s.timers.get_expired(1);
        assert_eq!(in_flight.len(), 1);

        let outcome = Arc::new(Mutex::new(None));
        let (sc, out) = (s.clone(), outcome.clone());
        s.spawn(move || {
            let task = current().unwrap();
            let before = task.yield_count();
            let cancelled = sc.block_cancel_timer(id);
            *out.lock().unwrap() = Some((cancelled, task.yield_count() - before));
        })
        .unwrap();

        let s2 = s.clone();
        let driver = std::thread::spawn(move || s2.run_until_no_task().unwrap());
        std::thread::sleep(Duration::from_millis(30));
        drop(in_flight);
        driver.join().unwrap();

        let (cancelled, yields) = outcome.lock().unwrap().take().unwrap();
        assert!(!cancelled);
        assert!(yields > 0);
        assert_eq!(s.timer_stats().in_flight, 0);
    }

    #[test]
    fn test_timer_fires() {
        let s = sched();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        s.expire_after(Duration::from_millis(10), move || flag.store(true, Ordering::SeqCst));

        let start = Instant::now();
        while !fired.load(Ordering::SeqCst) && start.elapsed() < Duration::from_secs(5) {
            s.run().unwrap();
        }
        assert!(fired.load(Ordering::SeqCst));
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn test_io_timeout() {
        let s = sched();
        let (r, w) = pipe();
        let result = Arc::new(Mutex::new(None));

        let res = result.clone();
        s.spawn(move || {
            let mut fds = [FdInterest::readable(r)];
            let start = Instant::now();
            let n = io_block_switch(&mut fds, Some(Duration::from_millis(100)));
            *res.lock().unwrap() = Some((n, fds[0].revents, start.elapsed()));
        })
        .unwrap();

        s.run_until_no_task().unwrap();
        let (n, revents, elapsed) = result.lock().unwrap().take().unwrap();
        assert_eq!(n, 0);
        assert_eq!(revents, 0);
        assert!(elapsed >= Duration::from_millis(100), "{:?}", elapsed);
        assert!(elapsed < Duration::from_secs(2), "{:?}", elapsed);
        assert_eq!(s.io_wait().wait_task_count(), 0);
        assert_eq!(s.io_wait().timer_count(), 0);

        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn test_io_ready_before_timeout() {
        let s = sched();
        let (r, w) = pipe();
        let result = Arc::new(Mutex::new(None));

        let res = result.clone();
        s.spawn(move || {
            let mut fds = [FdInterest::readable(r)];
            let n = io_block_switch(&mut fds, Some(Duration::from_secs(10)));
            *res.lock().unwrap() = Some((n, fds[0].revents));
        })
        .unwrap();
        s.spawn(move || {
            sleep_switch(Duration::from_millis(20));
            assert_eq!(unsafe { libc::write(w, b"x".as_ptr() as *const _, 1) }, 1);
        })
        .unwrap();

        let start = Instant::now();
        s.run_until_no_task().unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));

        let (n, revents) = result.lock().unwrap().take().unwrap();
        assert_eq!(n, 1);
        assert!(revents & libc::EPOLLIN as u32 != 0);
        // The 10s timeout was disarmed by the fd
        assert_eq!(s.io_wait().timer_count(), 0);

        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn test_io_no_fds_no_timeout() {
        let s = sched();
        let result = Arc::new(AtomicU32::new(u32::MAX));
        let res = result.clone();
        s.spawn(move || {
            let n = io_block_switch(&mut [], None);
            res.store(n as u32, Ordering::SeqCst);
        })
        .unwrap();
        s.run_until_no_task().unwrap();
        assert_eq!(result.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_io_block_wait_status() {
        let s = sched();
        let got = Arc::new(Mutex::new(Vec::new()));
        let g = got.clone();
        s.spawn(move || {
            let empty = io_block_wait(&mut [], None);
            let timed = io_block_wait(&mut [], Some(Duration::from_millis(10)));
            g.lock().unwrap().extend([empty, timed]);
        })
        .unwrap();
        s.run_until_no_task().unwrap();
        assert_eq!(
            *got.lock().unwrap(),
            vec![IoWaitStatus::NotRegistered, IoWaitStatus::TimedOut]
        );
    }

    #[test]
    fn test_sleep() {
        let s = sched();
        let elapsed = Arc::new(Mutex::new(Duration::ZERO));
        let e = elapsed.clone();
        s.spawn(move || {
            let start = Instant::now();
            sleep_switch(Duration::from_millis(30));
            *e.lock().unwrap() = start.elapsed();
        })
        .unwrap();

        s.run().unwrap();
        assert_eq!(s.runnable_task_count(), 0);
        s.run_until_no_task().unwrap();
        assert!(*elapsed.lock().unwrap() >= Duration::from_millis(30));
    }

    #[test]
    fn test_block_wakeup_fifo() {
        let s = sched();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            let sc = s.clone();
            s.spawn(move || {
                assert!(sc.user_block_wait(1, 7));
                order.lock().unwrap().push(i);
            })
            .unwrap();
        }

        s.run().unwrap();
        assert_eq!(s.wait_table().waiter_count(1, 7), 3);
        assert_eq!(s.runnable_task_count(), 0);

        assert_eq!(s.user_block_wakeup(1, 7, 5), 3);
        assert_eq!(s.wait_table().credit(1, 7), 2);
        assert!(s.try_user_block_wait(1, 7));

        s.run_until_no_task().unwrap();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_wakeup_before_wait_not_lost() {
        let s = sched();
        assert_eq!(s.block_wakeup(crate::wait_table::SysDomain::Event.into(), 9, 1), 0);

        let done = Arc::new(AtomicBool::new(false));
        let d = done.clone();
        let sc = s.clone();
        s.spawn(move || {
            sc.block_wait(crate::wait_table::SysDomain::Event.into(), 9);
            d.store(true, Ordering::SeqCst);
        })
        .unwrap();

        s.run_until_no_task().unwrap();
        assert!(done.load(Ordering::SeqCst));
        assert!(s.wait_table().is_empty());
    }

    #[test]
    fn test_block_wait_outside_coroutine() {
        let s = sched();
        assert!(!s.block_wait(3, 3));
        assert!(!s.try_block_wait(3, 3));
        assert_eq!(current_task_id(), TaskId::NONE);
        assert!(!is_coroutine());
        yield_now();
    }

    #[test]
    fn test_delay_rethrow() {
        let s = Scheduler::new(
            SchedulerConfig::new()
                .stack_size(64 * 1024)
                .exception_policy(ExceptionPolicy::DelayRethrow),
        )
        .unwrap();
        let ran = Arc::new(AtomicBool::new(false));

        s.spawn_labeled("bad", || panic!("boom")).unwrap();
        let r = ran.clone();
        s.spawn(move || {
            yield_now();
            r.store(true, Ordering::SeqCst);
        })
        .unwrap();

        match s.run_until_no_task() {
            Err(SchedError::TaskPanicked { label, message, .. }) => {
                assert_eq!(label.as_deref(), Some("bad"));
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected {:?}", other),
        }
        s.run_until_no_task().unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_log_only() {
        let s = Scheduler::new(
            SchedulerConfig::new()
                .stack_size(64 * 1024)
                .exception_policy(ExceptionPolicy::LogOnly),
        )
        .unwrap();
        s.spawn(|| panic!("ignored")).unwrap();
        s.run_until_no_task().unwrap();
        assert_eq!(s.task_count(), 0);
    }

    #[test]
    fn test_labels_and_ids() {
        let s = sched();
        let seen = Arc::new(Mutex::new(None));
        let sn = seen.clone();
        let id = s
            .spawn(move || {
                assert!(is_coroutine());
                set_current_task_label("worker");
                *sn.lock().unwrap() = Some((current_task_id(), current_task_label()));
            })
            .unwrap();
        s.run_until_no_task().unwrap();
        let (tid, label) = seen.lock().unwrap().take().unwrap();
        assert_eq!(tid, id);
        assert_eq!(label.as_deref(), Some("worker"));
    }

    #[test]
    fn test_spawn_from_task() {
        let s = sched();
        let count = Arc::new(AtomicUsize::new(0));
        let sc = s.clone();
        let c = count.clone();
        s.spawn(move || {
            for _ in 0..5 {
                let c = c.clone();
                sc.spawn(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            }
        })
        .unwrap();
        s.run_until_no_task().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_multi_thread_exactly_once() {
        let s = sched();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let hits = hits.clone();
            s.spawn(move || {
                for _ in 0..10 {
                    hits.fetch_add(1, Ordering::SeqCst);
                    yield_now();
                }
            })
            .unwrap();
        }

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let s = s.clone();
                std::thread::spawn(move || s.run_until_no_task().unwrap())
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1000);
        assert_eq!(s.task_count(), 0);
    }

    #[test]
    fn test_stop() {
        let s = sched();
        s.stop();
        assert!(s.is_stopped());
        s.run_loop().unwrap();
    }

    #[test]
    fn test_invalid_config() {
        let err = Scheduler::new(SchedulerConfig::new().chunk_count(0)).unwrap_err();
        assert!(matches!(err, SchedError::InvalidConfig(_)));
    }
}
