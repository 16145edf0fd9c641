//! epoll reactor
//!
//! Tasks blocked in `io_block_switch` sit in `wait_tasks` with their fds
//! registered in one shared epoll instance. A wait ends when the first
//! source claims the task: either an fd fires, or the optional timeout
//! expires. Claiming means erasing the task from `wait_tasks` under the
//! queue lock with a generation check, so exactly one source wins and a
//! stale wakeup from an older wait can never end a newer one.
//!
//! The winner removes every fd of the task from epoll, cancels the other
//! source and requeues the task.
//!
//! Reactor passes are serialized by the epoll lock, which also owns the
//! event buffer. epoll hands back raw pointers into task memory, so tasks
//! whose count reached zero are only freed at the end of a pass, with the
//! lock still held.

use std::collections::HashSet;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use crossbeam_queue::SegQueue;
use nix::errno::Errno;

use cothread_core::{kerror, kwarn, SchedError, SchedResult, SpinLock, TimerId, TsQueue};

use crate::co_debug;
use crate::config::{debug, Options};
use crate::task::{Task, TaskRef};
use crate::timer::TimerManager;

/// One fd of interest for `io_block_switch`
///
/// `events` and `revents` use the epoll bit values (`libc::EPOLLIN`,
/// `libc::EPOLLOUT`, ...). For the bits that also exist in poll(2) the
/// values are identical.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdInterest {
    pub fd: RawFd,
    pub events: u32,
    pub revents: u32,
}

impl FdInterest {
    pub fn new(fd: RawFd, events: u32) -> Self {
        FdInterest { fd, events, revents: 0 }
    }

    pub fn readable(fd: RawFd) -> Self {
        Self::new(fd, libc::EPOLLIN as u32)
    }

    pub fn writable(fd: RawFd) -> Self {
        Self::new(fd, libc::EPOLLOUT as u32)
    }

    /// Check whether any of `mask` was reported
    #[inline]
    pub fn fired(&self, mask: u32) -> bool {
        self.revents & mask != 0
    }
}

/// How an `io_block_wait` ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoWaitStatus {
    /// This many fds fired
    Ready(usize),
    /// The timeout expired first
    TimedOut,
    /// The wait never started: no fd could be registered (for example
    /// another task already waits on one of them), or the fd set was empty
    /// and no timeout was given
    NotRegistered,
}

impl IoWaitStatus {
    /// Fired fd count, 0 for the other outcomes
    #[inline]
    pub fn ready_count(self) -> usize {
        match self {
            IoWaitStatus::Ready(n) => n,
            _ => 0,
        }
    }
}

/// Registration tag; epoll's data field points at one of these
pub(crate) struct FdWait {
    pub(crate) fd: RawFd,
    pub(crate) events: u32,
    pub(crate) revents: AtomicU32,
    io_block_id: u32,
    task: TaskRef,
    registered: AtomicBool,
}

impl FdWait {
    pub(crate) fn new(interest: &FdInterest, task: TaskRef, io_block_id: u32) -> Self {
        FdWait {
            fd: interest.fd,
            events: interest.events,
            revents: AtomicU32::new(0),
            io_block_id,
            task,
            registered: AtomicBool::new(false),
        }
    }
}

/// Per-task state of the current I/O wait
///
/// The fd vector is only replaced by the task itself, between waits. While
/// a wait is registered the elements do not move.
#[derive(Default)]
pub(crate) struct IoWaitData {
    pub(crate) fds: Vec<FdWait>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) timer: Option<TimerId>,
}

/// Reactor-private timer payload
pub(crate) enum WaitTimeout {
    Io { task: TaskRef, io_block_id: u32 },
    Sleep(TaskRef),
}

pub struct IoWait {
    epoll_fd: RawFd,
    epoll_lock: SpinLock<Vec<libc::epoll_event>>,
    wait_tasks: TsQueue<Task>,
    timers: TimerManager<WaitTimeout>,
    deferred: SegQueue<TaskRef>,
}

impl IoWait {
    pub fn new(epoll_batch_size: usize) -> SchedResult<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            let errno = Errno::last();
            kerror!("epoll_create1 failed: {}", errno);
            return Err(SchedError::Reactor(errno as i32));
        }

        let events = vec![libc::epoll_event { events: 0, u64: 0 }; epoll_batch_size.max(1)];

        Ok(IoWait {
            epoll_fd,
            epoll_lock: SpinLock::new(events),
            wait_tasks: TsQueue::new(),
            timers: TimerManager::new(),
            deferred: SegQueue::new(),
        })
    }

    /// Tasks currently parked on fds
    pub fn wait_task_count(&self) -> usize {
        self.wait_tasks.len()
    }

    /// Pending I/O timeouts and sleeps
    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    /// Earliest I/O timeout or sleep deadline
    pub fn next_deadline(&self) -> Option<std::time::Instant> {
        self.timers.next_deadline()
    }

    /// Register a task that just switched out in IoBlock
    ///
    /// Returns false if the wait could not be set up at all; the caller
    /// then requeues the task and `io_block_switch` reports 0.
    pub(crate) fn scheduler_switch(&self, task: TaskRef, opts: &Options) -> bool {
        let mut io = task.io.lock();
        let io_block_id = task.io_block_id.load(Ordering::Acquire);

        if io.fds.is_empty() && io.timeout.is_none() {
            return false;
        }

        // Safety: the task holds its base count while parked
        unsafe { self.wait_tasks.push(task.as_ptr()) };

        let mut added = 0usize;
        let mut duplicate = false;
        for fw in io.fds.iter() {
            task.inc_ref();
            let mut ev = libc::epoll_event {
                events: fw.events,
                u64: fw as *const FdWait as u64,
            };
            let ret = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fw.fd, &mut ev) };
            if ret == 0 {
                fw.registered.store(true, Ordering::Release);
                added += 1;
                co_debug!(opts, debug::IOBLOCK, "task {} add fd={} events={:#x}", *task, fw.fd, fw.events);
                continue;
            }

            let errno = Errno::last();
            task.dec_ref();

            if errno == Errno::EEXIST {
                kwarn!("task {} fd={} already in epoll, rolling back wait", *task, fw.fd);
                duplicate = true;
                break;
            }

            kwarn!("task {} epoll_ctl add fd={} failed: {}", *task, fw.fd, errno);
        }

        if duplicate {
            // A reactor pass may hold events pointing at our tags, so the
            // rollback runs between passes. The io lock is released first;
            // a pass takes it after the epoll lock.
            drop(io);
            let _pass = self.epoll_lock.lock();
            let io = task.io.lock();
            self.unregister_fds(task, &io, opts);
            // If the erase fails a pass already claimed the wait through an
            // fd registered before the duplicate, and requeued the task
            return !self.wait_tasks.erase(&task);
        }

        if added == 0 && !io.fds.is_empty() {
            if self.wait_tasks.erase(&task) {
                return false;
            }
            return true;
        }

        if let Some(timeout) = io.timeout {
            task.inc_ref();
            let id = self
                .timers
                .expire_after(timeout, WaitTimeout::Io { task, io_block_id });
            io.timer = Some(id);
            co_debug!(opts, debug::IOBLOCK, "task {} io timeout {:?} timer {}", *task, timeout, id);
        }

        true
    }

    /// Park a task that switched out in Sleep
    pub(crate) fn sleep_switch(&self, task: TaskRef, duration: Duration) -> TimerId {
        self.timers.expire_after(duration, WaitTimeout::Sleep(task))
    }

    /// Hand a task with a zero count to the next reactor pass for freeing
    pub(crate) fn defer_delete(&self, task: TaskRef) {
        self.deferred.push(task);
    }

    /// One reactor pass: expired timeouts, ready fds, deferred frees
    ///
    /// Returns immediately (0) if another thread is in a pass. Every task
    /// whose wait ended is passed to `requeue`.
    pub(crate) fn wait_loop(
        &self,
        opts: &Options,
        mut requeue: impl FnMut(TaskRef),
    ) -> usize {
        let Some(mut events) = self.epoll_lock.try_lock() else {
            return 0;
        };

        // Collected before epoll_wait so a wait that both fires and times
        // out in this pass is claimed by the fd
        let mut expired = self.timers.get_expired(opts.timer_batch_size());

        let n = loop {
            let n = unsafe {
                libc::epoll_wait(self.epoll_fd, events.as_mut_ptr(), events.len() as i32, 0)
            };
            if n >= 0 {
                break n as usize;
            }
            let errno = Errno::last();
            if errno != Errno::EINTR {
                kwarn!("epoll_wait failed: {}", errno);
                break 0;
            }
        };

        let mut fired: Vec<(TaskRef, u32)> = Vec::new();
        let mut seen: HashSet<TaskRef> = HashSet::new();
        for ev in events[..n].iter() {
            let data = ev.u64;
            let revents = ev.events;
            // Safety: the tag stays registered (and its task counted) until
            // removed from epoll in this or a later pass
            let fw = unsafe { &*(data as *const FdWait) };
            fw.revents.fetch_or(revents, Ordering::AcqRel);

            let task = fw.task;
            if fw.io_block_id != task.io_block_id.load(Ordering::Acquire) {
                continue;
            }
            task.wait_successful.fetch_add(1, Ordering::AcqRel);
            if seen.insert(task) {
                fired.push((task, fw.io_block_id));
            }
        }

        let mut woken = 0usize;

        for (task, io_block_id) in fired {
            if !self.claim(task, io_block_id) {
                continue;
            }
            self.finish_wait(task, opts, true);
            co_debug!(opts, debug::IOBLOCK, "task {} io ready", *task);
            requeue(task);
            woken += 1;
        }

        for timer in expired.iter_mut() {
            match timer.take() {
                Some(WaitTimeout::Io { task, io_block_id }) => {
                    if self.claim(task, io_block_id) {
                        task.io_timed_out.store(true, Ordering::Release);
                        task.io.lock().timer = None;
                        self.finish_wait(task, opts, false);
                        co_debug!(opts, debug::IOBLOCK, "task {} io timeout", *task);
                        requeue(task);
                        woken += 1;
                    }
                    // The count taken when the timeout was armed
                    task.dec_ref();
                }
                Some(WaitTimeout::Sleep(task)) => {
                    co_debug!(opts, debug::TIMER, "task {} sleep done", *task);
                    requeue(task);
                    woken += 1;
                }
                None => {}
            }
        }
        drop(expired);

        while let Some(task) = self.deferred.pop() {
            co_debug!(opts, debug::TASK, "task {} freed", *task);
            // Safety: count is zero and the task is off every list
            unsafe { task.free() };
        }

        woken
    }

    /// Remove a task from the wait set if it is still waiting on generation
    /// `io_block_id`
    fn claim(&self, task: TaskRef, io_block_id: u32) -> bool {
        self.wait_tasks
            .erase_if(&task, |t| t.io_block_id.load(Ordering::Acquire) == io_block_id)
    }

    /// Tear down a claimed wait: drop every fd from epoll and, when the
    /// claim came from an fd, disarm the timeout
    fn finish_wait(&self, task: TaskRef, opts: &Options, cancel_timer: bool) {
        let mut io = task.io.lock();
        self.unregister_fds(task, &io, opts);
        if cancel_timer {
            if let Some(id) = io.timer.take() {
                if self.timers.cancel(id) {
                    task.dec_ref();
                }
            }
        }
    }

    fn unregister_fds(&self, task: TaskRef, io: &IoWaitData, opts: &Options) {
        for fw in io.fds.iter() {
            if !fw.registered.swap(false, Ordering::AcqRel) {
                continue;
            }
            let ret = unsafe {
                libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fw.fd, std::ptr::null_mut())
            };
            if ret != 0 {
                // fd was closed while waited on; its registration is gone
                co_debug!(opts, debug::IOBLOCK, "task {} del fd={} failed: {}", *task, fw.fd, Errno::last());
            } else {
                co_debug!(opts, debug::IOBLOCK, "task {} del fd={}", *task, fw.fd);
            }
            task.dec_ref();
        }
    }

    /// Free everything on the deferred list (scheduler teardown)
    pub(crate) fn drain_deferred(&self) -> usize {
        let _guard = self.epoll_lock.lock();
        let mut n = 0;
        while let Some(task) = self.deferred.pop() {
            unsafe { task.free() };
            n += 1;
        }
        n
    }
}

impl Drop for IoWait {
    fn drop(&mut self) {
        let parked = self.wait_tasks.len();
        if parked > 0 {
            kwarn!("reactor dropped with {} tasks still waiting on fds", parked);
        }
        if unsafe { libc::close(self.epoll_fd) } != 0 {
            kwarn!("close(epoll fd) failed: {}", Errno::last());
        }
    }
}

/// Blocking poll(2) over the same interest set, for callers outside a
/// coroutine
pub fn poll_fallback(fds: &mut [FdInterest], timeout: Option<Duration>) -> usize {
    let mut pfds: Vec<libc::pollfd> = fds
        .iter()
        .map(|f| libc::pollfd {
            fd: f.fd,
            events: f.events as libc::c_short,
            revents: 0,
        })
        .collect();

    let timeout_ms: libc::c_int = match timeout {
        None => -1,
        Some(d) => {
            // Round up so a sub-millisecond timeout still waits
            let ms = d.as_nanos().div_ceil(1_000_000);
            ms.min(libc::c_int::MAX as u128) as libc::c_int
        }
    };

    let n = loop {
        let n = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, timeout_ms) };
        if n >= 0 {
            break n as usize;
        }
        if Errno::last() != Errno::EINTR {
            break 0;
        }
    };

    for (f, p) in fds.iter_mut().zip(pfds.iter()) {
        f.revents = p.revents as u16 as u32;
    }
    n
}
