//! Task stack memory
//!
//! Every task owns one anonymous mapping: a PROT_NONE guard page at the low
//! end followed by the usable stack. Pages are reserved lazily
//! (MAP_NORESERVE), so a large configured stack only costs what the task
//! actually touches.

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        pub use unix::page_size;
    } else {
        compile_error!("cothread stacks need a unix mmap");
    }
}

use core::ptr::NonNull;

use cothread_core::error::MemoryError;

/// An owned, guard-protected coroutine stack
///
/// ```text
///   base                 base + guard                     base + len
///   | guard (PROT_NONE)  | usable stack, grows downward  <- top |
/// ```
pub struct Stack {
    base: NonNull<u8>,
    len: usize,
    guard: usize,
}

// Safety: the mapping is exclusively owned and only ever used by the task
// that owns this Stack, on whichever thread currently runs it.
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

impl Stack {
    /// Map a stack with at least `size` usable bytes
    pub fn new(size: usize) -> Result<Stack, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidSize(size));
        }
        let page = page_size();
        let usable = size
            .checked_add(page - 1)
            .map(|s| s & !(page - 1))
            .ok_or(MemoryError::InvalidSize(size))?;
        let len = usable
            .checked_add(page)
            .ok_or(MemoryError::InvalidSize(size))?;

        let base = unix::map_stack(len, page)?;
        Ok(Stack { base, len, guard: page })
    }

    /// Highest address of the stack (initial stack pointer lives just below)
    #[inline]
    pub fn top(&self) -> *mut u8 {
        // Safety: one past the end of the mapping
        unsafe { self.base.as_ptr().add(self.len) }
    }

    /// Lowest usable address (just above the guard page)
    #[inline]
    pub fn bottom(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.guard) }
    }

    /// Usable bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.len - self.guard
    }

    /// Check whether `addr` lies inside the usable range
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.bottom() as usize && addr < self.top() as usize
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unix::unmap_stack(self.base, self.len);
    }
}

impl core::fmt::Debug for Stack {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Stack")
            .field("bottom", &self.bottom())
            .field("top", &self.top())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_rounding() {
        let page = page_size();
        let stack = Stack::new(page + 1).unwrap();
        assert_eq!(stack.size(), 2 * page);
        assert_eq!(stack.top() as usize % page, 0);
        assert!(stack.contains(stack.bottom() as usize));
        assert!(!stack.contains(stack.top() as usize));
    }

    #[test]
    fn test_stack_writable() {
        let stack = Stack::new(64 * 1024).unwrap();
        unsafe {
            let p = stack.top().sub(8);
            p.write(0xAB);
            assert_eq!(p.read(), 0xAB);
            stack.bottom().write(1);
        }
    }

    #[test]
    fn test_stack_zero_size() {
        assert!(matches!(Stack::new(0), Err(MemoryError::InvalidSize(0))));
    }

    #[test]
    fn test_stack_many() {
        // NORESERVE: lots of big stacks cost only address space
        let stacks: Vec<_> = (0..64).map(|_| Stack::new(1 << 20).unwrap()).collect();
        assert_eq!(stacks.len(), 64);
    }
}
