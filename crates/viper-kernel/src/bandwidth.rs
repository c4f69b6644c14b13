//! Per-task bandwidth control.
//!
//! A task with a budget (`bw_runtime` nanoseconds per `bw_period`
//! nanoseconds) is throttled once it consumes its runtime within the
//! current period: it leaves the scheduler until the period boundary, where
//! the budget replenishes and the task is re-enqueued if still runnable.
//! The default budget of zero disables the mechanism entirely.

use crate::sched;
use crate::task::{self, Task, TaskId, TaskLocation, TaskState};
use crate::TICK_NS;

/// Configure a task's budget. Zero runtime disables throttling.
pub fn set_budget(id: TaskId, runtime_ns: u64, period_ns: u64) {
    let mut table = task::table().lock();
    let t = table.get_mut(id);
    t.bw_runtime = runtime_ns;
    t.bw_period = period_ns;
    t.bw_consumed = 0;
    t.bw_period_start = crate::current_tick();
    t.bw_throttled = false;
}

/// Charge one tick of runtime to the running task. Returns true if the
/// task just got throttled and the CPU must reschedule.
///
/// Runs with the task-table and per-CPU locks held, after deadline
/// accounting: bandwidth is a ceiling, deadlines are a floor.
pub(crate) fn account_tick(task: &mut Task, _now: u64) -> bool {
    if task.bw_runtime == 0 || task.bw_throttled {
        return false;
    }
    task.bw_consumed += TICK_NS;
    if task.bw_consumed >= task.bw_runtime {
        task.bw_throttled = true;
        log::debug!("task {} throttled", task.id);
        return true;
    }
    false
}

/// Period-boundary sweep: replenish budgets and wake throttled tasks.
pub fn replenish_sweep(now: u64) {
    let mut wake: [Option<TaskId>; task::MAX_TASKS] = [None; task::MAX_TASKS];
    let mut n = 0;
    {
        let mut table = task::table().lock();
        for i in 0..task::MAX_TASKS {
            let id = TaskId(i as u32);
            if !table.exists(id) {
                continue;
            }
            let t = table.get_mut(id);
            if t.bw_runtime == 0 {
                continue;
            }
            let period_ticks = (t.bw_period / TICK_NS).max(1);
            if now >= t.bw_period_start + period_ticks {
                t.bw_consumed = 0;
                t.bw_period_start = now;
                if t.bw_throttled {
                    t.bw_throttled = false;
                    if t.state == TaskState::Ready && t.location == TaskLocation::NotQueued {
                        wake[n] = Some(id);
                        n += 1;
                    }
                }
            }
        }
    }
    for slot in wake.iter().take(n) {
        if let Some(id) = *slot {
            let _ = sched::enqueue(id);
        }
    }
}
