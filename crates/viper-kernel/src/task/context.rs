//! Low-level context switch (AArch64).
//!
//! Register save layout matches [`super::TaskContext`] field order byte for
//! byte: x19..x28 at offsets 0..=72, x29 at 80, x30 at 88, sp at 96.

use super::TaskContext;

/// Save the callee-saved context of the outgoing task and restore the
/// incoming one. Returns into the incoming task's saved `x30`.
///
/// # Safety
/// Both pointers must reference valid, distinct `TaskContext` values, and
/// the incoming context must have been initialized either by a previous
/// save or by task creation (trampoline + fresh stack).
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_prev: *mut TaskContext, _next: *const TaskContext) {
    core::arch::naked_asm!(
        // Save outgoing callee-saved registers and SP.
        "stp x19, x20, [x0, #0]",
        "stp x21, x22, [x0, #16]",
        "stp x23, x24, [x0, #32]",
        "stp x25, x26, [x0, #48]",
        "stp x27, x28, [x0, #64]",
        "stp x29, x30, [x0, #80]",
        "mov x9, sp",
        "str x9, [x0, #96]",
        // Restore the incoming context.
        "ldp x19, x20, [x1, #0]",
        "ldp x21, x22, [x1, #16]",
        "ldp x23, x24, [x1, #32]",
        "ldp x25, x26, [x1, #48]",
        "ldp x27, x28, [x1, #64]",
        "ldp x29, x30, [x1, #80]",
        "ldr x9, [x1, #96]",
        "mov sp, x9",
        "ret",
    );
}

/// First-run entry for kernel tasks.
///
/// Task creation leaves `[entry_fn, arg]` at the top of the new stack and
/// points the saved `x30` here. If the entry function returns, the task
/// exits with code 0.
///
/// # Safety
/// Only reachable through `context_switch` into a freshly created task.
#[unsafe(naked)]
pub unsafe extern "C" fn task_entry_trampoline() {
    core::arch::naked_asm!(
        "ldp x9, x0, [sp], #16",
        "blr x9",
        "mov x0, #0",
        "bl {exit}",
        exit = sym trampoline_exit,
    );
}

extern "C" fn trampoline_exit(code: i64) -> ! {
    crate::sched::exit_current(code as i32);
}

/// First-run entry for user tasks: switch to the process address space,
/// set up TLS, and drop to EL0.
///
/// # Safety
/// Only reachable through `context_switch` into a freshly created user
/// task whose TCB carries valid user entry/stack values.
#[unsafe(naked)]
pub unsafe extern "C" fn user_entry_trampoline() {
    core::arch::naked_asm!(
        "bl {prepare}",
        // prepare() returns entry in x0 and user SP in x1.
        "msr elr_el1, x0",
        "msr sp_el0, x1",
        "mov x9, #0",
        "msr spsr_el1, x9", // EL0t, interrupts enabled
        "mov x0, #0",
        "mov x1, #0",
        "eret",
        prepare = sym prepare_user_entry,
    );
}

/// Entry point and initial stack pointer, returned in x0/x1.
#[repr(C)]
struct UserEntry {
    entry: u64,
    stack: u64,
}

/// Install the user task's address space (TTBR0 + ASID), flush the local
/// TLB for that ASID, and set `TPIDR_EL0` for TLS.
extern "C" fn prepare_user_entry() -> UserEntry {
    let (process, entry, stack) = {
        let table = crate::task::table().lock();
        let cpu = crate::arch::cpu_id();
        let current = crate::sched::current_on(cpu).expect("user trampoline without current");
        let t = table.get(current);
        (t.process, t.user_entry, t.user_stack)
    };
    // The process handle encodes TTBR0 in the low 48 bits and the ASID in
    // the high 16, the layout the address-space collaborator hands out.
    let ttbr0 = (process as u64) & 0x0000_FFFF_FFFF_FFFF;
    let asid = (process as u64) >> 48;
    unsafe {
        core::arch::asm!(
            "msr ttbr0_el1, {ttbr0}",
            "isb",
            "tlbi aside1, {asid_arg}",
            "dsb ish",
            "isb",
            "msr tpidr_el0, xzr",
            ttbr0 = in(reg) (asid << 48) | ttbr0,
            asid_arg = in(reg) asid << 48,
        );
    }
    UserEntry { entry, stack }
}
