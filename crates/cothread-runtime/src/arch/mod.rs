//! Architecture-specific context switching
//!
//! Each architecture provides the same surface:
//!
//! - `SavedRegs` - callee-saved registers plus stack pointer and resume address
//! - `init_context` - prime a fresh stack so the first switch enters a function
//! - `context_switch` - save the current context and load another one
//!
//! Only callee-saved state is switched. Every switch happens at a call
//! boundary, so the compiler has already spilled everything else.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        pub use self::x86_64::{context_switch, init_context, SavedRegs};
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
        pub use self::aarch64::{context_switch, init_context, SavedRegs};
    } else {
        compile_error!("Unsupported architecture");
    }
}

/// Signature of the function a fresh context starts in
///
/// It receives the argument given to `init_context` and must never return;
/// it leaves by switching to another context.
pub type EntryFn = extern "C" fn(usize) -> !;
