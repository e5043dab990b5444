//! x86_64 context switching
//!
//! Voluntary switches only need the System V callee-saved set plus
//! rsp/rip; everything else is dead across the call boundary.

use std::arch::naked_asm;

/// Callee-saved register frame for a suspended fiber.
///
/// Field order is load-bearing: the assembly below addresses the frame by
/// fixed offsets.
#[repr(C)]
#[derive(Debug)]
pub struct Context {
    pub rsp: u64, // 0x00
    pub rip: u64, // 0x08
    pub rbx: u64, // 0x10
    pub rbp: u64, // 0x18
    pub r12: u64, // 0x20
    pub r13: u64, // 0x28
    pub r14: u64, // 0x30
    pub r15: u64, // 0x38
}

impl Context {
    pub const fn zeroed() -> Self {
        Context {
            rsp: 0,
            rip: 0,
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }
}

/// Prepare a fresh context so that switching to it enters the trampoline.
///
/// `entry_fn` must be an `extern "C" fn(usize)` address; `entry_arg` is its
/// single argument (passed through r13/rdi).
///
/// # Safety
///
/// `ctx` must point to writable `Context` memory and `stack_top` to the top
/// of a mapped stack region.
pub unsafe fn init_context(ctx: *mut Context, stack_top: *mut u8, entry_fn: usize, entry_arg: usize) {
    // The trampoline is entered by jmp with a 16-aligned rsp; its `call`
    // then gives the entry function the usual rsp % 16 == 8 frame.
    let aligned_sp = stack_top as usize & !0xF;

    let ctx = unsafe { &mut *ctx };
    ctx.rsp = aligned_sp as u64;
    ctx.rip = fiber_trampoline as usize as u64;
    ctx.rbx = 0;
    ctx.rbp = 0;
    ctx.r12 = entry_fn as u64;
    ctx.r13 = entry_arg as u64;
    ctx.r14 = 0;
    ctx.r15 = 0;
}

/// First code a fresh fiber executes: moves the entry argument into place
/// and calls the entry function. The entry function never returns.
#[unsafe(naked)]
unsafe extern "C" fn fiber_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        "ud2",
    );
}

/// Save the calling execution into `save` and resume `load`.
///
/// Returns when some later switch targets `save` again.
///
/// # Safety
///
/// Both pointers must reference valid `Context` frames; `load` must hold
/// either a frame produced by `init_context` or one captured by a previous
/// switch, and its stack must still be mapped.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_save: *mut Context, _load: *const Context) {
    naked_asm!(
        // Save callee-saved state into *rdi
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load callee-saved state from *rsi
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "jmp rax",
        // Resume point for the saved context
        "1:",
        "ret",
    );
}
