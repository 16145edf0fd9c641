//! Coroutine-aware mutex and channel
//!
//! Both are built on [`BlockObject`]. Blocking calls park the current task
//! when made from a coroutine and poll with short sleeps from a plain
//! thread.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use cothread_core::{kerror, SchedError, SchedResult, SendError, SpinLock, TryRecvError, TrySendError};

use crate::block_object::BlockObject;

/// Mutex without data: one BlockObject holding a single credit
pub struct RawCoMutex {
    block: BlockObject,
}

impl RawCoMutex {
    pub fn new() -> Self {
        RawCoMutex {
            block: BlockObject::new(1, 1),
        }
    }

    /// Acquire, parking the current coroutine while held elsewhere
    pub fn lock(&self) {
        self.block.co_block_wait();
    }

    pub fn try_lock(&self) -> bool {
        self.block.try_block_wait()
    }

    /// Release; fails if the mutex was not locked
    pub fn unlock(&self) -> SchedResult<()> {
        if self.block.wakeup() {
            Ok(())
        } else {
            Err(SchedError::DoubleUnlock)
        }
    }

    pub fn is_locked(&self) -> bool {
        !self.block.is_wakeup()
    }
}

impl Default for RawCoMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RawCoMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawCoMutex")
            .field("locked", &self.is_locked())
            .finish()
    }
}

/// Data-carrying mutex with an RAII guard
pub struct CoMutex<T: ?Sized> {
    raw: RawCoMutex,
    data: UnsafeCell<T>,
}

// Safety: access to data is serialized by raw
unsafe impl<T: ?Sized + Send> Send for CoMutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for CoMutex<T> {}

impl<T> CoMutex<T> {
    pub fn new(value: T) -> Self {
        CoMutex {
            raw: RawCoMutex::new(),
            data: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> CoMutex<T> {
    pub fn lock(&self) -> CoMutexGuard<'_, T> {
        self.raw.lock();
        CoMutexGuard { mutex: self }
    }

    pub fn try_lock(&self) -> Option<CoMutexGuard<'_, T>> {
        if self.raw.try_lock() {
            Some(CoMutexGuard { mutex: self })
        } else {
            None
        }
    }

    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: Default> Default for CoMutex<T> {
    fn default() -> Self {
        CoMutex::new(T::default())
    }
}

impl<T: ?Sized> fmt::Debug for CoMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoMutex")
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}

pub struct CoMutexGuard<'a, T: ?Sized> {
    mutex: &'a CoMutex<T>,
}

impl<T: ?Sized> Deref for CoMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard exists only while this task holds the lock
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for CoMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the lock is held and `&mut self` rules out other borrows
        // through this guard
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for CoMutexGuard<'_, T> {
    fn drop(&mut self) {
        if let Err(e) = self.mutex.raw.unlock() {
            kerror!("CoMutexGuard drop: {}", e);
        }
    }
}

/// Create a bounded MPMC channel
///
/// Capacity 0 is bumped to 1.
pub fn channel<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let capacity = capacity.max(1);
    let slots = u32::try_from(capacity).unwrap_or(u32::MAX);
    let inner = Arc::new(ChannelInner {
        buffer: SpinLock::new(VecDeque::with_capacity(capacity)),
        capacity,
        free: BlockObject::new(slots, slots),
        filled: BlockObject::new(0, slots),
        closed: AtomicBool::new(false),
        sender_count: AtomicUsize::new(1),
        receiver_count: AtomicUsize::new(1),
    });

    (
        Sender {
            inner: Arc::clone(&inner),
        },
        Receiver { inner },
    )
}

/// Sending half of a channel
pub struct Sender<T> {
    inner: Arc<ChannelInner<T>>,
}

/// Receiving half of a channel
pub struct Receiver<T> {
    inner: Arc<ChannelInner<T>>,
}

struct ChannelInner<T> {
    buffer: SpinLock<VecDeque<T>>,
    capacity: usize,
    /// One credit per empty slot
    free: BlockObject,
    /// One credit per queued message
    filled: BlockObject,
    closed: AtomicBool,
    sender_count: AtomicUsize,
    receiver_count: AtomicUsize,
}

impl<T> ChannelInner<T> {
    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.free.release_all();
        self.filled.release_all();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn push(&self, value: T) {
        self.buffer.lock().push_back(value);
        self.filled.wakeup();
    }

    fn pop(&self) -> Option<T> {
        let value = self.buffer.lock().pop_front()?;
        self.free.wakeup();
        Some(value)
    }
}

impl<T> Sender<T> {
    /// Send a value, parking while the channel is full
    ///
    /// Gives the value back if the channel is closed.
    pub fn send(&self, value: T) -> Result<(), SendError<T>> {
        if self.inner.is_closed() {
            return Err(SendError(value));
        }
        self.inner.free.co_block_wait();
        if self.inner.is_closed() {
            return Err(SendError(value));
        }
        self.inner.push(value);
        Ok(())
    }

    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        if self.inner.is_closed() {
            return Err(TrySendError::Closed(value));
        }
        if !self.inner.free.try_block_wait() {
            return Err(TrySendError::Full(value));
        }
        self.inner.push(value);
        Ok(())
    }

    /// Close the channel for every sender and receiver
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn len(&self) -> usize {
        self.inner.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}

impl<T> Receiver<T> {
    /// Receive a value, parking while the channel is empty
    ///
    /// Messages queued before close are still delivered; after that
    /// `ChannelClosed` is returned.
    pub fn recv(&self) -> SchedResult<T> {
        self.inner.filled.co_block_wait();
        self.inner.pop().ok_or(SchedError::ChannelClosed)
    }

    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        if self.inner.filled.try_block_wait() {
            if let Some(v) = self.inner.pop() {
                return Ok(v);
            }
        }
        if self.inner.is_closed() {
            Err(TryRecvError::Closed)
        } else {
            Err(TryRecvError::Empty)
        }
    }

    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn len(&self) -> usize {
        self.inner.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.inner.sender_count.fetch_add(1, Ordering::Relaxed);
        Sender {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        if self.inner.sender_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.close();
        }
    }
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        self.inner.receiver_count.fetch_add(1, Ordering::Relaxed);
        Receiver {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        if self.inner.receiver_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.close();
        }
    }
}

// Safety: the buffer is behind a SpinLock and values only move between threads
unsafe impl<T: Send> Send for Sender<T> {}
unsafe impl<T: Send> Sync for Sender<T> {}
unsafe impl<T: Send> Send for Receiver<T> {}
unsafe impl<T: Send> Sync for Receiver<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_mutex_double_unlock() {
        let m = RawCoMutex::new();
        assert!(!m.is_locked());
        assert!(m.try_lock());
        assert!(m.is_locked());
        assert!(!m.try_lock());
        m.unlock().unwrap();
        assert!(matches!(m.unlock(), Err(SchedError::DoubleUnlock)));
    }

    #[test]
    fn test_mutex_guard_unlocks() {
        let m = CoMutex::new(5);
        {
            let mut g = m.lock();
            *g += 1;
            assert!(m.try_lock().is_none());
        }
        assert_eq!(*m.try_lock().unwrap(), 6);
        assert_eq!(m.into_inner(), 6);
    }

    #[test]
    fn test_mutex_across_threads() {
        let m = Arc::new(CoMutex::new(0u32));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let m = m.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        *m.lock() += 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*m.lock(), 400);
    }

    #[test]
    fn test_basic_send_recv() {
        let (tx, rx) = channel(10);

        tx.try_send(42).unwrap();
        assert_eq!(rx.try_recv().unwrap(), 42);
    }

    #[test]
    fn test_buffer_full() {
        let (tx, rx) = channel(2);

        tx.try_send(1).unwrap();
        tx.try_send(2).unwrap();
        assert!(matches!(tx.try_send(3), Err(TrySendError::Full(3))));

        rx.try_recv().unwrap();
        tx.try_send(3).unwrap();
        assert_eq!(tx.len(), 2);
    }

    #[test]
    fn test_empty_recv() {
        let (_tx, rx) = channel::<i32>(4);
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn test_close_drains_then_errors() {
        let (tx, rx) = channel(4);
        tx.send(1).unwrap();
        tx.send(2).unwrap();
        drop(tx);

        assert!(rx.is_closed());
        assert_eq!(rx.recv().unwrap(), 1);
        assert_eq!(rx.recv().unwrap(), 2);
        assert!(matches!(rx.recv(), Err(SchedError::ChannelClosed)));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Closed));
    }

    #[test]
    fn test_send_after_receiver_dropped() {
        let (tx, rx) = channel(1);
        drop(rx);
        assert_eq!(tx.send(7), Err(SendError(7)));
        assert!(matches!(tx.try_send(8), Err(TrySendError::Closed(8))));
    }

    #[test]
    fn test_threads_blocking_send() {
        let (tx, rx) = channel(1);
        let producer = std::thread::spawn(move || {
            for i in 0..50 {
                tx.send(i).unwrap();
            }
        });
        let mut got = Vec::new();
        while let Ok(v) = rx.recv() {
            got.push(v);
        }
        producer.join().unwrap();
        assert_eq!(got, (0..50).collect::<Vec<_>>());
    }
}
