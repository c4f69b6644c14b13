//! Inter-processor interrupts.
//!
//! The scheduler raises `RESCHEDULE` when it places work on a remote CPU;
//! `STOP` halts a CPU; `TLB_FLUSH` invalidates the local TLB for one ASID.
//! Delivery goes through a pluggable backend: the GIC distributor on
//! AArch64, a recording mock in host tests.

use spin::Once;

use crate::arch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IpiType {
    Reschedule = 0,
    Stop = 1,
    TlbFlush = 2,
}

impl IpiType {
    pub fn from_sgi(id: u32) -> Option<IpiType> {
        match id {
            0 => Some(IpiType::Reschedule),
            1 => Some(IpiType::Stop),
            2 => Some(IpiType::TlbFlush),
            _ => None,
        }
    }
}

/// Backend that delivers software-generated interrupts.
pub trait IpiBackend: Sync {
    fn send(&self, cpu: usize, ipi: IpiType);
}

static BACKEND: Once<&'static dyn IpiBackend> = Once::new();

/// Install the delivery backend. Called once at boot (or test setup);
/// later calls are ignored.
pub fn set_backend(backend: &'static dyn IpiBackend) {
    BACKEND.call_once(|| backend);
}

fn backend() -> Option<&'static dyn IpiBackend> {
    BACKEND.get().copied()
}

/// Send an IPI to one CPU.
pub fn send_ipi(cpu: usize, ipi: IpiType) {
    if let Some(b) = backend() {
        b.send(cpu, ipi);
    } else {
        log::warn!("ipi {:?} to cpu {} dropped: no backend", ipi, cpu);
    }
}

/// Send an IPI to every CPU except the caller.
pub fn broadcast_ipi(ipi: IpiType) {
    let me = arch::cpu_id();
    for cpu in 0..crate::MAX_CPUS {
        if cpu != me {
            send_ipi(cpu, ipi);
        }
    }
}

/// Entry point for the SGI interrupt handler.
pub fn handle_ipi(ipi: IpiType, asid: u16) {
    match ipi {
        IpiType::Reschedule => crate::sched::schedule(),
        IpiType::Stop => loop {
            arch::wait_for_interrupt();
        },
        IpiType::TlbFlush => {
            #[cfg(target_arch = "aarch64")]
            gic::flush_tlb_asid(asid);
            #[cfg(not(target_arch = "aarch64"))]
            let _ = asid;
        }
    }
}

/// GIC distributor backend.
///
/// GICD_SGIR layout: target-list filter in bits 24..25, CPU target list in
/// bits 16..23, SGI id in bits 0..3.
#[cfg(target_arch = "aarch64")]
pub mod gic {
    use super::{IpiBackend, IpiType};

    /// QEMU virt GICv2 distributor base.
    const GICD_BASE: usize = 0x0800_0000;
    const GICD_SGIR: usize = GICD_BASE + 0xF00;

    pub struct GicBackend;

    impl IpiBackend for GicBackend {
        fn send(&self, cpu: usize, ipi: IpiType) {
            let target_list = 1u32 << cpu;
            let value = (target_list << 16) | ipi as u32;
            // SAFETY: GICD_SGIR is a write-only MMIO doorbell register.
            unsafe {
                core::ptr::write_volatile(GICD_SGIR as *mut u32, value);
            }
        }
    }

    pub static GIC: GicBackend = GicBackend;

    /// Invalidate the local TLB for one ASID.
    pub fn flush_tlb_asid(asid: u16) {
        let arg = (asid as u64) << 48;
        unsafe {
            core::arch::asm!(
                "tlbi aside1, {}",
                "dsb ish",
                "isb",
                in(reg) arg,
                options(nostack)
            );
        }
    }
}

#[cfg(not(target_arch = "aarch64"))]
pub mod test_support {
    use super::{IpiBackend, IpiType};
    use std::sync::Mutex;

    /// Records every IPI sent, for assertions.
    pub struct RecordingBackend {
        pub sent: Mutex<Vec<(usize, IpiType)>>,
    }

    impl RecordingBackend {
        pub const fn new() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
            }
        }

        pub fn take(&self) -> Vec<(usize, IpiType)> {
            std::mem::take(&mut self.sent.lock().unwrap())
        }
    }

    impl IpiBackend for RecordingBackend {
        fn send(&self, cpu: usize, ipi: IpiType) {
            self.sent.lock().unwrap().push((cpu, ipi));
        }
    }
}
