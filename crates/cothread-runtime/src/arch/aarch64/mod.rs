//! aarch64 context switching (AAPCS64)

use std::arch::naked_asm;

use super::EntryFn;

/// Callee-saved registers of a suspended context
///
/// x19-x28, the frame pointer, the link register and the low halves of
/// v8-v15. Offsets are hard-coded in `context_switch`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SavedRegs {
    pub sp: u64, // 0
    pub lr: u64, // 8
    pub x19_x28: [u64; 10], // 16
    pub fp: u64, // 96
    pub d8_d15: [u64; 8], // 104
}

impl SavedRegs {
    #[inline]
    pub fn stack_pointer(&self) -> u64 {
        self.sp
    }
}

/// Initialize a fresh context on `stack_top`
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
    let sp = (stack_top as usize) & !0xF;

    let mut x19_x28 = [0u64; 10];
    x19_x28[0] = entry_fn as usize as u64;
    x19_x28[1] = entry_arg as u64;

    let regs = unsafe { &mut *regs };
    *regs = SavedRegs {
        sp: sp as u64,
        lr: entry_trampoline as usize as u64,
        x19_x28,
        fp: 0,
        d8_d15: [0; 8],
    };
}

/// First code run on a fresh stack: `entry_fn(entry_arg)`, never returns
#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!("mov x0, x20", "blr x19", "brk #1");
}

/// Save the current context into `old` and resume `new`
///
/// # Safety
///
/// Same contract as the x86_64 version.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_old: *mut SavedRegs, _new: *const SavedRegs) {
    naked_asm!(
        // Save into old (x0)
        "mov x9, sp",
        "str x9, [x0, #0]",
        "str x30, [x0, #8]",
        "stp x19, x20, [x0, #16]",
        "stp x21, x22, [x0, #32]",
        "stp x23, x24, [x0, #48]",
        "stp x25, x26, [x0, #64]",
        "stp x27, x28, [x0, #80]",
        "str x29, [x0, #96]",
        "stp d8, d9, [x0, #104]",
        "stp d10, d11, [x0, #120]",
        "stp d12, d13, [x0, #136]",
        "stp d14, d15, [x0, #152]",
        // Load from new (x1)
        "ldr x9, [x1, #0]",
        "mov sp, x9",
        "ldr x30, [x1, #8]",
        "ldp x19, x20, [x1, #16]",
        "ldp x21, x22, [x1, #32]",
        "ldp x23, x24, [x1, #48]",
        "ldp x25, x26, [x1, #64]",
        "ldp x27, x28, [x1, #80]",
        "ldr x29, [x1, #96]",
        "ldp d8, d9, [x1, #104]",
        "ldp d10, d11, [x1, #120]",
        "ldp d12, d13, [x1, #136]",
        "ldp d14, d15, [x1, #152]",
        "ret",
    );
}
