//! x86_64 context switching (System V AMD64)
//!
//! Uses naked functions for the switch and the entry trampoline.
//! Stable since Rust 1.88.

use std::arch::naked_asm;

use super::EntryFn;

/// Callee-saved registers of a suspended context
///
/// Field offsets are hard-coded in `context_switch`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SavedRegs {
    pub rsp: u64, // 0x00
    pub rip: u64, // 0x08
    pub rbx: u64, // 0x10
    pub rbp: u64, // 0x18
    pub r12: u64, // 0x20
    pub r13: u64, // 0x28
    pub r14: u64, // 0x30
    pub r15: u64, // 0x38
}

impl SavedRegs {
    #[inline]
    pub fn stack_pointer(&self) -> u64 {
        self.rsp
    }
}

/// Initialize a fresh context on `stack_top`
///
/// The first switch into `regs` lands in the trampoline, which calls
/// `entry_fn(entry_arg)` on the new stack.
///
/// # Safety
///
/// `regs` must be valid for writes and `stack_top` must be the top of a
/// mapped stack that outlives the context.
#[inline]
pub unsafe fn init_context(
    regs: *mut SavedRegs,
    stack_top: *mut u8,
    entry_fn: EntryFn,
    entry_arg: usize,
) {
    // The trampoline reaches entry_fn through `call`, which needs rsp
    // 16-byte aligned at the call instruction
    let sp = (stack_top as usize) & !0xF;

    let regs = unsafe { &mut *regs };
    *regs = SavedRegs {
        rsp: sp as u64,
        rip: entry_trampoline as usize as u64,
        rbx: 0,
        rbp: 0,
        r12: entry_fn as usize as u64,
        r13: entry_arg as u64,
        r14: 0,
        r15: 0,
    };
}

/// First code run on a fresh stack: `entry_fn(entry_arg)`, never returns
#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!("mov rdi, r13", "call r12", "ud2");
}

/// Save the current context into `old` and resume `new`
///
/// Returns when some other context switches back into `old`.
///
/// # Safety
///
/// `old` must be valid for writes, `new` must hold a context produced by
/// `init_context` or a previous `context_switch`, and its stack must still
/// be mapped.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_old: *mut SavedRegs, _new: *const SavedRegs) {
    naked_asm!(
        // Save into old (rdi)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load from new (rsi)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "jmp rax",
        // Resume point of a saved context
        "1:",
        "ret",
    );
}
