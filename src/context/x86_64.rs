//! x86_64 System V context switch.
//!
//! Callee-saved per the SysV ABI: `rbx`, `rbp`, `r12`-`r15`, and `rsp`
//! itself. SysV has no callee-saved XMM/vector registers, so there is
//! nothing FP/vector-wide to save here (unlike the Windows x64 ABI, which
//! is out of scope — this crate targets Linux/SysV).
//!
//! Unlike `aarch64`/`riscv64`, a plain `call`/`ret` pair on this ISA passes
//! the resume address through the stack rather than a register, which would
//! make it part of the very memory `crate::stack` copies out from under it —
//! by the time `StackSlot::capture` runs, the word at the top of the
//! outgoing range is still whatever `call switch` is *about* to overwrite,
//! not the address that write produces. `switch` below sidesteps this
//! entirely: it pops its own return address into a register at entry, saves
//! it in `Context` alongside the other callee-saved state (same shape as the
//! `lr`/`ra` fields on the other two ISAs), and resumes with an explicit
//! `jmp` instead of `ret`. The stack's `[low, high)` range this crate copies
//! never has to hold a return address at all.

use std::arch::naked_asm;

/// Saved register state for one suspended task.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Context {
    pub(crate) sp: u64,
    ip: u64,
    rbx: u64,
    rbp: u64,
    r12: u64,
    r13: u64,
    r14: u64,
    r15: u64,
}

pub(crate) const STACK_ALIGNMENT: usize = 16;

/// `switch` pops its own return address into a register before saving `sp`,
/// so the saved `sp` already matches whatever the caller read via
/// `current_sp()` just beforehand — nothing for the switch protocol to
/// adjust for.
pub(crate) const CALL_RETADDR_BYTES: usize = 0;

/// Read the current stack pointer. Used by the switch protocol to compute
/// the `[low, high)` range a task used before suspending.
#[inline(always)]
pub(crate) fn current_sp() -> usize {
    let sp: u64;
    unsafe {
        std::arch::asm!("mov {}, rsp", out(reg) sp, options(nomem, nostack, preserves_flags));
    }
    sp as usize
}

/// Build the `Context` for a task that has never run. No stack memory needs
/// seeding — the resume address lives in `Context.ip`, loaded straight into
/// a register and `jmp`-ed to, exactly like `lr`/`ra` on the other ISAs —
/// but the entered function still expects the SysV-mandated "as if just
/// called" alignment (`sp % 16 == 8`), so `sp` is primed one word below the
/// 16-aligned `ceiling` to stand in for the return address a real `call`
/// would have pushed.
pub(crate) fn prime(ceiling: usize, trampoline: usize) -> (Context, usize, Vec<u8>) {
    debug_assert_eq!(ceiling % STACK_ALIGNMENT, 0, "stack ceiling must be 16-byte aligned");
    let sp = ceiling - std::mem::size_of::<u64>();
    let ctx = Context {
        sp: sp as u64,
        ip: trampoline as u64,
        ..Context::default()
    };
    (ctx, ceiling, Vec::new())
}

/// Save `old`'s callee-saved registers, instruction pointer, and stack
/// pointer; load `new`'s; and resume on `new`'s stack at `new`'s saved `ip`.
/// Does not allocate.
///
/// # Safety
/// `new` must describe a context previously saved by this function (or
/// fabricated by `crate::stack::prime` to look like one): a live,
/// 16-byte-aligned-minus-one-word stack pointer and a valid resume address.
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn switch(old: *mut Context, new: *const Context) {
    naked_asm!(
        // Pop our own return address instead of leaving it on the stack:
        // after this, `rsp` equals exactly what `current_sp()` read in the
        // caller before the `call` that reached here.
        "pop rax",
        "mov [rdi + 0x00], rsp",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        // Zero the argument registers before handing control to the
        // target so a fresh task's first resume can't observe pointers
        // belonging to whoever switched into it.
        "xor edi, edi",
        "xor esi, esi",
        "jmp rax",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prime_sets_the_as_if_just_called_alignment() {
        let ceiling = 0x10_000usize;
        let (ctx, low, seed) = prime(ceiling, 0xdead_beef);
        assert_eq!(ctx.ip, 0xdead_beef);
        assert_eq!(ctx.sp as usize % STACK_ALIGNMENT, STACK_ALIGNMENT - 8);
        assert_eq!(low, ceiling);
        assert!(seed.is_empty());
    }
}
