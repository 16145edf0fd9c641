//! Intrusive doubly linked lists
//!
//! `SList` is the single-owner list: it is what a dispatcher pops a batch
//! into, what a wait-table bucket parks tasks on, and what a BlockObject
//! queues its waiters on. `TsQueue` wraps one in a spinlock for the shared
//! run queue and the reactor's wait set.
//!
//! Elements embed a [`Link`] and are never owned by the list. Whoever pushes
//! an element guarantees it stays alive until it is popped or erased.
//!
//! Every list gets a process-unique id, and each linked element records the
//! id of the list it sits on. That makes "erase this element if it is still
//! here" an O(1) check that works even after the list value itself has been
//! moved (lists live inside hash maps).

use core::cell::UnsafeCell;
use core::fmt;
use core::marker::PhantomData;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::spinlock::SpinLock;

static NEXT_LIST_ID: AtomicU64 = AtomicU64::new(1);

/// Link fields embedded in every list element
pub struct Link<T> {
    prev: UnsafeCell<Option<NonNull<T>>>,
    next: UnsafeCell<Option<NonNull<T>>>,
    owner: AtomicU64,
}

// Safety: prev/next are only touched by the list that owns the element,
// and every list mutation happens under `&mut SList`.
unsafe impl<T> Send for Link<T> {}
unsafe impl<T> Sync for Link<T> {}

impl<T> Link<T> {
    pub const fn new() -> Self {
        Link {
            prev: UnsafeCell::new(None),
            next: UnsafeCell::new(None),
            owner: AtomicU64::new(0),
        }
    }

    /// Id of the list currently holding this element, 0 when unlinked
    #[inline]
    pub fn owner(&self) -> u64 {
        self.owner.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_linked(&self) -> bool {
        self.owner() != 0
    }
}

impl<T> Default for Link<T> {
    fn default() -> Self {
        Link::new()
    }
}

impl<T> fmt::Debug for Link<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link").field("owner", &self.owner()).finish()
    }
}

/// Types that can sit on an [`SList`]
///
/// # Safety
///
/// `link()` must always return the same `Link` for a given element, and that
/// link must not be shared with another element.
pub unsafe trait Linked: Sized {
    fn link(&self) -> &Link<Self>;
}

/// Non-owning intrusive FIFO list
pub struct SList<T: Linked> {
    head: Option<NonNull<T>>,
    tail: Option<NonNull<T>>,
    len: usize,
    id: u64,
    _marker: PhantomData<*const T>,
}

// Safety: the list only hands out pointers to elements that are themselves
// shareable across threads.
unsafe impl<T: Linked + Sync> Send for SList<T> {}
unsafe impl<T: Linked + Sync> Sync for SList<T> {}

impl<T: Linked> SList<T> {
    pub fn new() -> Self {
        SList {
            head: None,
            tail: None,
            len: 0,
            id: NEXT_LIST_ID.fetch_add(1, Ordering::Relaxed),
            _marker: PhantomData,
        }
    }

    #[inline]
    fn link_of<'a>(elem: NonNull<T>) -> &'a Link<T> {
        // Safety: linked elements outlive their membership (push contract)
        unsafe { (*elem.as_ptr()).link() }
    }

    /// Unique id stamped into the links of every element on this list
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Peek at the first element
    #[inline]
    pub fn front(&self) -> Option<NonNull<T>> {
        self.head
    }

    /// Append an element at the tail
    ///
    /// # Safety
    ///
    /// `elem` must point to a live element that is not on any list, and it
    /// must stay alive until it is popped or erased.
    pub unsafe fn push_back(&mut self, elem: NonNull<T>) {
        let link = Self::link_of(elem);
        debug_assert_eq!(link.owner(), 0, "element is already on a list");
        unsafe {
            *link.prev.get() = self.tail;
            *link.next.get() = None;
        }
        match self.tail {
            Some(tail) => unsafe { *Self::link_of(tail).next.get() = Some(elem) },
            None => self.head = Some(elem),
        }
        self.tail = Some(elem);
        self.len += 1;
        link.owner.store(self.id, Ordering::Release);
    }

    /// Remove and return the head element
    pub fn pop_front(&mut self) -> Option<NonNull<T>> {
        let head = self.head?;
        // Safety: head is on this list
        unsafe { self.unlink(head) };
        Some(head)
    }

    /// Move up to `n` elements from the front into a new list, preserving order
    pub fn pop_n(&mut self, n: usize) -> SList<T> {
        let mut out = SList::new();
        if n >= self.len {
            out.append(self);
            return out;
        }
        for _ in 0..n {
            match self.pop_front() {
                // Safety: just unlinked, still alive
                Some(elem) => unsafe { out.push_back(elem) },
                None => break,
            }
        }
        out
    }

    /// Move every element of `other` to the tail of this list
    pub fn append(&mut self, other: &mut SList<T>) {
        let Some(other_head) = other.head else {
            return;
        };

        let mut cur = Some(other_head);
        while let Some(elem) = cur {
            let link = Self::link_of(elem);
            link.owner.store(self.id, Ordering::Release);
            cur = unsafe { *link.next.get() };
        }

        match self.tail {
            Some(tail) => unsafe {
                *Self::link_of(tail).next.get() = Some(other_head);
                *Self::link_of(other_head).prev.get() = Some(tail);
            },
            None => self.head = Some(other_head),
        }
        self.tail = other.tail;
        self.len += other.len;

        other.head = None;
        other.tail = None;
        other.len = 0;
    }

    /// Remove `elem` if it is on this list
    pub fn erase(&mut self, elem: &T) -> bool {
        self.erase_if(elem, |_| true)
    }

    /// Remove `elem` if it is on this list and `pred` accepts it
    ///
    /// The predicate runs with the list exclusively borrowed, so under a
    /// `TsQueue` it is evaluated atomically with the removal.
    pub fn erase_if(&mut self, elem: &T, pred: impl FnOnce(&T) -> bool) -> bool {
        if elem.link().owner() != self.id || !pred(elem) {
            return false;
        }
        // Safety: owner id matches, so the element is on this list
        unsafe { self.unlink(NonNull::from(elem)) };
        true
    }

    /// Iterate over the elements front to back
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            cur: self.head,
            _list: PhantomData,
        }
    }

    unsafe fn unlink(&mut self, elem: NonNull<T>) {
        let link = Self::link_of(elem);
        let (prev, next) = unsafe { (*link.prev.get(), *link.next.get()) };

        match prev {
            Some(p) => unsafe { *Self::link_of(p).next.get() = next },
            None => self.head = next,
        }
        match next {
            Some(n) => unsafe { *Self::link_of(n).prev.get() = prev },
            None => self.tail = prev,
        }

        unsafe {
            *link.prev.get() = None;
            *link.next.get() = None;
        }
        link.owner.store(0, Ordering::Release);
        self.len -= 1;
    }
}

impl<T: Linked> Default for SList<T> {
    fn default() -> Self {
        SList::new()
    }
}

impl<T: Linked> fmt::Debug for SList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SList")
            .field("id", &self.id)
            .field("len", &self.len)
            .finish()
    }
}

/// Front-to-back iterator over an [`SList`]
pub struct Iter<'a, T: Linked> {
    cur: Option<NonNull<T>>,
    _list: PhantomData<&'a SList<T>>,
}

impl<'a, T: Linked + 'a> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        let elem = self.cur?;
        let link = SList::<T>::link_of(elem);
        self.cur = unsafe { *link.next.get() };
        // Safety: elements on the list are alive while the list is borrowed
        Some(unsafe { &*elem.as_ptr() })
    }
}

/// Spinlock-protected [`SList`] shared between threads
pub struct TsQueue<T: Linked> {
    list: SpinLock<SList<T>>,
    len: AtomicUsize,
}

impl<T: Linked + Sync> TsQueue<T> {
    pub fn new() -> Self {
        TsQueue {
            list: SpinLock::new(SList::new()),
            len: AtomicUsize::new(0),
        }
    }

    /// Approximate length, exact when no push/pop is in flight
    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Push one element at the tail
    ///
    /// # Safety
    ///
    /// Same contract as [`SList::push_back`].
    pub unsafe fn push(&self, elem: NonNull<T>) {
        let mut list = self.list.lock();
        unsafe { list.push_back(elem) };
        self.len.store(list.len(), Ordering::Relaxed);
    }

    /// Move a whole list to the tail
    pub fn push_list(&self, other: &mut SList<T>) {
        if other.is_empty() {
            return;
        }
        let mut list = self.list.lock();
        list.append(other);
        self.len.store(list.len(), Ordering::Relaxed);
    }

    pub fn pop(&self) -> Option<NonNull<T>> {
        if self.is_empty() {
            return None;
        }
        let mut list = self.list.lock();
        let elem = list.pop_front();
        self.len.store(list.len(), Ordering::Relaxed);
        elem
    }

    /// Pop up to `n` elements in FIFO order
    pub fn pop_n(&self, n: usize) -> SList<T> {
        if self.is_empty() {
            return SList::new();
        }
        let mut list = self.list.lock();
        let out = list.pop_n(n);
        self.len.store(list.len(), Ordering::Relaxed);
        out
    }

    /// Take every element
    pub fn pop_all(&self) -> SList<T> {
        self.pop_n(usize::MAX)
    }

    /// Remove `elem` if it is still queued here
    pub fn erase(&self, elem: &T) -> bool {
        self.erase_if(elem, |_| true)
    }

    /// Remove `elem` if it is still queued here and `pred` accepts it,
    /// with the check made under the queue lock
    pub fn erase_if(&self, elem: &T, pred: impl FnOnce(&T) -> bool) -> bool {
        let mut list = self.list.lock();
        let erased = list.erase_if(elem, pred);
        if erased {
            self.len.store(list.len(), Ordering::Relaxed);
        }
        erased
    }
}

impl<T: Linked + Sync> Default for TsQueue<T> {
    fn default() -> Self {
        TsQueue::new()
    }
}

impl<T: Linked> fmt::Debug for TsQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TsQueue")
            .field("len", &self.len.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    struct Node {
        val: u32,
        link: Link<Node>,
    }

    unsafe impl Linked for Node {
        fn link(&self) -> &Link<Node> {
            &self.link
        }
    }

    fn nodes(n: u32) -> Vec<Box<Node>> {
        (0..n)
            .map(|val| Box::new(Node { val, link: Link::new() }))
            .collect()
    }

    fn ptr(node: &Node) -> NonNull<Node> {
        NonNull::from(node)
    }

    fn vals(list: &SList<Node>) -> Vec<u32> {
        list.iter().map(|n| n.val).collect()
    }

    #[test]
    fn test_slist_fifo() {
        let ns = nodes(4);
        let mut list: SList<Node> = SList::new();
        for n in &ns {
            unsafe { list.push_back(ptr(n)) };
        }
        assert_eq!(list.len(), 4);
        assert_eq!(vals(&list), vec![0, 1, 2, 3]);

        let first = list.pop_front().unwrap();
        assert_eq!(unsafe { first.as_ref() }.val, 0);
        assert!(!ns[0].link.is_linked());
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn test_slist_erase() {
        let ns = nodes(3);
        let mut list: SList<Node> = SList::new();
        let mut other: SList<Node> = SList::new();
        for n in &ns {
            unsafe { list.push_back(ptr(n)) };
        }

        // Not on `other`
        assert!(!other.erase(&*ns[1]));

        assert!(list.erase(&*ns[1]));
        assert_eq!(vals(&list), vec![0, 2]);

        // Second erase is a no-op
        assert!(!list.erase(&*ns[1]));

        assert!(list.erase(&*ns[2]));
        assert!(list.erase(&*ns[0]));
        assert!(list.is_empty());
        assert!(list.pop_front().is_none());

        unsafe { other.push_back(ptr(&ns[1])) };
        assert_eq!(vals(&other), vec![1]);
    }

    #[test]
    fn test_slist_erase_if() {
        let ns = nodes(2);
        let mut list: SList<Node> = SList::new();
        for n in &ns {
            unsafe { list.push_back(ptr(n)) };
        }
        assert!(!list.erase_if(&*ns[0], |n| n.val == 99));
        assert!(list.erase_if(&*ns[0], |n| n.val == 0));
        assert_eq!(vals(&list), vec![1]);
    }

    #[test]
    fn test_slist_pop_n_and_append() {
        let ns = nodes(6);
        let mut list: SList<Node> = SList::new();
        for n in &ns {
            unsafe { list.push_back(ptr(n)) };
        }

        let mut batch = list.pop_n(4);
        assert_eq!(vals(&batch), vec![0, 1, 2, 3]);
        assert_eq!(vals(&list), vec![4, 5]);

        // Moved elements belong to the batch now
        assert!(!list.erase(&*ns[0]));
        assert!(batch.erase(&*ns[0]));

        list.append(&mut batch);
        assert!(batch.is_empty());
        assert_eq!(vals(&list), vec![4, 5, 1, 2, 3]);
        assert!(list.erase(&*ns[2]));
        assert_eq!(vals(&list), vec![4, 5, 1, 3]);

        let all = list.pop_n(100);
        assert_eq!(all.len(), 4);
        assert!(list.is_empty());
    }

    #[test]
    fn test_slist_survives_move() {
        let ns = nodes(2);
        let mut map = std::collections::HashMap::new();
        let mut list: SList<Node> = SList::new();
        unsafe { list.push_back(ptr(&ns[0])) };
        map.insert(1u64, list);
        for i in 2..64u64 {
            map.insert(i, SList::new());
        }
        assert!(map.get_mut(&1).unwrap().erase(&*ns[0]));
    }

    #[test]
    fn test_tsqueue_basic() {
        let ns = nodes(3);
        let q: TsQueue<Node> = TsQueue::new();
        assert!(q.is_empty());
        for n in &ns {
            unsafe { q.push(ptr(n)) };
        }
        assert_eq!(q.len(), 3);
        assert!(q.erase_if(&*ns[1], |n| n.val == 1));
        assert_eq!(q.len(), 2);

        let batch = q.pop_n(10);
        assert_eq!(vals(&batch), vec![0, 2]);
        assert!(q.is_empty());
        assert!(q.pop().is_none());
    }

    #[test]
    fn test_tsqueue_concurrent() {
        let q = Arc::new(TsQueue::<Node>::new());
        let producers: Vec<_> = (0..4)
            .map(|t| {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    for i in 0..1000 {
                        let node = Box::new(Node { val: t * 1000 + i, link: Link::new() });
                        let p = NonNull::from(Box::leak(node));
                        unsafe { q.push(p) };
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }

        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    loop {
                        let mut batch = q.pop_n(7);
                        if batch.is_empty() {
                            break;
                        }
                        while let Some(p) = batch.pop_front() {
                            let node = unsafe { Box::from_raw(p.as_ptr()) };
                            seen.push(node.val);
                        }
                    }
                    seen
                })
            })
            .collect();

        let mut all: Vec<u32> = consumers
            .into_iter()
            .flat_map(|c| c.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all, (0..4000).collect::<Vec<_>>());
    }
}
