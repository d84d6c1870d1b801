//! Stack Switcher.
//!
//! One leaf routine per (CPU, calling convention) pair, each saving every
//! ABI-mandated callee-saved register to the outgoing `Context` and loading
//! the same from the incoming one, then returning on the incoming stack.
//! None of these allocate.
//!
//! Each routine stores every callee-saved register to the `old` context,
//! loads the same set from `new`, zeroes the incoming argument registers,
//! and returns onto the new stack — the same shape across all three ISAs,
//! expressed as a real `#[unsafe(naked)]` function per target rather than a
//! plain-`asm!`-in-a-normal-function sketch, so the compiler never inserts
//! a prologue or epilogue around the register swap.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub(crate) use self::x86_64::*;
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub(crate) use self::aarch64::*;
    } else if #[cfg(target_arch = "riscv64")] {
        mod riscv64;
        pub(crate) use self::riscv64::*;
    } else {
        compile_error!("corostack: unsupported target_arch; supported: x86_64, aarch64, riscv64");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A context that has never run has no meaningful register state; this
    /// just pins down that `Context::default()` is the all-zero state the
    /// rest of the crate assumes when a task is created.
    #[test]
    fn default_context_is_zeroed() {
        let ctx = Context::default();
        assert_eq!(ctx.sp, 0);
    }
}
