//! Architecture shims.
//!
//! On AArch64 these touch real system registers; elsewhere they degrade to
//! host-friendly stand-ins so the scheduler logic stays testable.

#[cfg(target_arch = "aarch64")]
mod aarch64 {
    /// Current CPU id from MPIDR_EL1 (Aff0).
    #[inline]
    pub fn cpu_id() -> usize {
        let mpidr: u64;
        unsafe {
            core::arch::asm!("mrs {}, mpidr_el1", out(reg) mpidr, options(nomem, nostack));
        }
        (mpidr & 0xFF) as usize
    }

    /// Mask IRQs, returning the previous DAIF state.
    #[inline]
    pub fn irq_save() -> u64 {
        let daif: u64;
        unsafe {
            core::arch::asm!(
                "mrs {}, daif",
                "msr daifset, #2",
                out(reg) daif,
                options(nomem, nostack)
            );
        }
        daif
    }

    /// Restore a DAIF state saved by [`irq_save`].
    #[inline]
    pub fn irq_restore(saved: u64) {
        unsafe {
            core::arch::asm!("msr daif, {}", in(reg) saved, options(nomem, nostack));
        }
    }

    /// Halt until the next interrupt.
    #[inline]
    pub fn wait_for_interrupt() {
        unsafe {
            core::arch::asm!("wfi", options(nomem, nostack));
        }
    }
}

#[cfg(target_arch = "aarch64")]
pub use aarch64::*;

#[cfg(not(target_arch = "aarch64"))]
mod host {
    use std::cell::Cell;

    thread_local! {
        static CPU_ID: Cell<usize> = const { Cell::new(0) };
    }

    /// Host stand-in: the per-thread CPU id set by the test harness.
    pub fn cpu_id() -> usize {
        CPU_ID.with(|c| c.get())
    }

    /// Pin the calling thread to a logical CPU for testing.
    pub fn set_cpu_id(id: usize) {
        CPU_ID.with(|c| c.set(id));
    }

    pub fn irq_save() -> u64 {
        0
    }

    pub fn irq_restore(_saved: u64) {}

    pub fn wait_for_interrupt() {}
}

#[cfg(not(target_arch = "aarch64"))]
pub use host::*;

/// PSCI calls used during SMP bring-up. Return codes per the PSCI spec:
/// 0 success, negative values are errors.
#[cfg(target_arch = "aarch64")]
pub mod psci {
    const PSCI_CPU_ON: u64 = 0xC400_0003;
    const PSCI_CPU_OFF: u64 = 0x8400_0002;
    const PSCI_SYSTEM_OFF: u64 = 0x8400_0008;
    const PSCI_SYSTEM_RESET: u64 = 0x8400_0009;

    #[inline]
    fn smc(function: u64, arg0: u64, arg1: u64, arg2: u64) -> i64 {
        let ret: i64;
        unsafe {
            core::arch::asm!(
                "smc #0",
                inlateout("x0") function => ret,
                in("x1") arg0,
                in("x2") arg1,
                in("x3") arg2,
                options(nomem, nostack)
            );
        }
        ret
    }

    /// Start a secondary CPU at `entry` with `context` in x0.
    ///
    /// # Safety
    /// `entry` must be the physical address of valid secondary-boot code.
    pub unsafe fn cpu_on(target: u64, entry: u64, context: u64) -> i64 {
        smc(PSCI_CPU_ON, target, entry, context)
    }

    /// Power off the calling CPU. Does not return on success.
    pub fn cpu_off() -> i64 {
        smc(PSCI_CPU_OFF, 0, 0, 0)
    }

    pub fn system_off() -> i64 {
        smc(PSCI_SYSTEM_OFF, 0, 0, 0)
    }

    pub fn system_reset() -> i64 {
        smc(PSCI_SYSTEM_RESET, 0, 0, 0)
    }
}
