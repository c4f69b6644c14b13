//! ViperDOS scheduler core.
//!
//! Preemptive multi-policy scheduling for up to four CPUs: per-CPU run
//! structures (deadline heap, CFS heap, real-time bitmap queues), priority
//! ordered wait queues with timeouts, per-task bandwidth ceilings, and
//! periodic load balancing. Hardware-facing pieces (context switch, GIC
//! software-generated interrupts, PSCI, WFI) are AArch64-only; everything
//! above them is plain code and runs under the host test harness with a
//! mock IPI backend.
//!
//! Lock ordering: the global task-table lock is always acquired before any
//! per-CPU scheduler lock, and locks are released in reverse order.

#![cfg_attr(target_arch = "aarch64", no_std)]

pub mod arch;
pub mod balance;
pub mod bandwidth;
pub mod ipi;
pub mod sched;
pub mod sync;
pub mod task;
pub mod wait;

use core::sync::atomic::{AtomicU64, Ordering};

/// Number of CPUs the scheduler supports.
pub const MAX_CPUS: usize = 4;

/// Timer tick length at the default 1 kHz tick rate.
pub const TICK_NS: u64 = 1_000_000;

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Monotonic tick counter, advanced by [`sched::tick`].
pub fn current_tick() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// One-time kernel-side initialization: reserve the kernel stack region,
/// then bring CPUs up with [`sched::init_cpu`].
pub fn init(stack_base: usize, stack_len: usize) {
    task::table().lock().init_stacks(stack_base, stack_len);
    log::info!("scheduler core ready ({} cpus max)", MAX_CPUS);
}

pub(crate) fn advance_tick() -> u64 {
    TICKS.fetch_add(1, Ordering::Relaxed) + 1
}

#[cfg(not(target_arch = "aarch64"))]
pub(crate) fn reset_ticks_for_test() {
    TICKS.store(0, Ordering::Relaxed);
}

/// Errors surfaced by the scheduler core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// Task table, heap, or stack pool exhausted.
    NoResource,
    /// Enqueue of a non-runnable task, double insert, or removal of a task
    /// that is not queued. Logged and rejected; state is left untouched.
    InvalidState,
    /// A wait returned because its timeout elapsed.
    TimedOut,
    /// The referenced task does not exist.
    NoSuchTask,
}

pub type Result<T> = core::result::Result<T, SchedError>;
