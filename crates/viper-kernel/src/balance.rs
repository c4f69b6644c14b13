//! SMP load balancing.
//!
//! Every [`LOAD_BALANCE_INTERVAL`] ticks the lock-free per-CPU queue counts
//! are compared; when the spread reaches the steal threshold, one fair-share
//! task migrates from the busiest CPU to the idlest. Real-time and deadline
//! tasks are never moved by balancing, and neither is a running task.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::sched::{self, QUEUE_COUNTS};
use crate::task::{self, SchedPolicy, TaskId, TaskLocation};
use crate::MAX_CPUS;

/// Ticks between balancing passes.
pub const LOAD_BALANCE_INTERVAL: u32 = 100;

/// Smallest queue-count spread worth a migration.
pub const STEAL_THRESHOLD: u32 = 2;

static COUNTER: AtomicU32 = AtomicU32::new(0);

/// Called once per tick; runs a balancing pass every interval.
pub fn on_tick() {
    let c = COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
    if c < LOAD_BALANCE_INTERVAL {
        return;
    }
    COUNTER.store(0, Ordering::Relaxed);
    balance_once();
}

/// One balancing pass. Public for tests.
pub fn balance_once() {
    let mut max_load = 0u32;
    let mut min_load = u32::MAX;
    let mut busiest = None;
    let mut idlest = None;
    for c in 0..MAX_CPUS {
        if !sched::cpu_initialized(c) {
            continue;
        }
        let load = QUEUE_COUNTS[c].load(Ordering::Relaxed);
        if load > max_load {
            max_load = load;
            busiest = Some(c);
        }
        if load < min_load {
            min_load = load;
            idlest = Some(c);
        }
    }
    let (Some(src), Some(dst)) = (busiest, idlest) else {
        return;
    };
    if src == dst || max_load < min_load + STEAL_THRESHOLD {
        return;
    }

    if let Some(stolen) = steal_task(src, dst) {
        // enqueue_on_cpu raises the reschedule IPI when `dst` is remote.
        let _ = sched::enqueue_on_cpu(stolen, dst);
    }
}

/// Detach one migratable CFS task from `src`. Affinity must allow `dst`,
/// and the running task stays put.
fn steal_task(src: usize, dst: usize) -> Option<TaskId> {
    let mut table = task::table().lock();
    let mut pc = sched::cpu(src).lock();

    let candidate = {
        let mut found = None;
        for id in pc.cfs_candidates() {
            let t = table.get(id);
            if t.policy == SchedPolicy::Other
                && t.location == TaskLocation::CfsHeap
                && t.cpu_affinity & (1 << dst) != 0
            {
                found = Some(id);
                break;
            }
        }
        found
    }?;

    sched::detach_locked(&mut table, &mut pc, src, candidate).ok()?;
    pc.steals += 1;
    pc.migrations += 1;
    log::debug!(
        "stole task {} from cpu {} for cpu {}",
        table.get(candidate).id,
        src,
        dst
    );
    Some(candidate)
}

#[cfg(not(target_arch = "aarch64"))]
pub fn reset_for_test() {
    COUNTER.store(0, Ordering::Relaxed);
}
