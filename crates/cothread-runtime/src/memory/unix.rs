//! Unix stack mapping using mmap

use core::ptr::NonNull;
use std::sync::OnceLock;

use cothread_core::error::MemoryError;
use cothread_core::kwarn;
use nix::errno::Errno;

/// System page size (cached)
pub fn page_size() -> usize {
    static PAGE: OnceLock<usize> = OnceLock::new();
    *PAGE.get_or_init(|| {
        let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if sz > 0 {
            sz as usize
        } else {
            4096
        }
    })
}

/// Map `len` bytes read/write and turn the lowest `guard` bytes into a
/// PROT_NONE guard region
pub(super) fn map_stack(len: usize, guard: usize) -> Result<NonNull<u8>, MemoryError> {
    let base = unsafe {
        libc::mmap(
            core::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | libc::MAP_STACK,
            -1,
            0,
        )
    };
    if base == libc::MAP_FAILED {
        return Err(MemoryError::AllocationFailed(Errno::last_raw()));
    }

    // Overflowing into this page faults instead of corrupting a neighbour
    let ret = unsafe { libc::mprotect(base, guard, libc::PROT_NONE) };
    if ret != 0 {
        let errno = Errno::last_raw();
        unsafe { libc::munmap(base, len) };
        return Err(MemoryError::ProtectionFailed(errno));
    }

    NonNull::new(base as *mut u8).ok_or(MemoryError::AllocationFailed(0))
}

pub(super) fn unmap_stack(base: NonNull<u8>, len: usize) {
    let ret = unsafe { libc::munmap(base.as_ptr() as *mut libc::c_void, len) };
    if ret != 0 {
        kwarn!("munmap of stack {:p} failed: {}", base, Errno::last());
    }
}
