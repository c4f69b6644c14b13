//! Priority-ordered wait queues with timeouts.
//!
//! A wait queue is a doubly-linked list of Blocked tasks kept in ascending
//! priority order (0 first), linked through the tasks' intrusive `next`/
//! `prev` fields. The queue itself carries no lock: the subsystem that owns
//! the predicate supplies one, enqueues before releasing it, and releases
//! it before yielding. The task-table lock covers the link manipulation.
//!
//! Timeouts are absolute ticks; the per-tick sweep wakes overdue tasks and
//! marks them with the [`WAIT_TIMED_OUT`](crate::task::WAIT_TIMED_OUT)
//! sentinel so callers can tell a timeout from a real wakeup after
//! re-checking their predicate.

use crate::arch;
use crate::sched;
use crate::task::{self, TaskId, TaskLocation, TaskState, TaskTable, WAIT_TIMED_OUT};
use crate::{Result, SchedError};

#[derive(Debug)]
pub struct WaitQueue {
    head: Option<TaskId>,
    tail: Option<TaskId>,
    count: u32,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            count: 0,
        }
    }

    pub fn len(&self) -> u32 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Insert a task in priority order: before the first member whose
    /// priority value is strictly greater (lower urgency). The task must be
    /// detached from scheduler structures already.
    pub fn insert(&mut self, table: &mut TaskTable, id: TaskId) {
        let priority = table.get(id).priority;
        let mut cursor = self.head;
        while let Some(member) = cursor {
            if table.get(member).priority > priority {
                break;
            }
            cursor = table.get(member).next;
        }

        let this = self as *mut WaitQueue;
        match cursor {
            Some(before) => {
                let prev = table.get(before).prev;
                {
                    let t = table.get_mut(id);
                    t.next = Some(before);
                    t.prev = prev;
                }
                table.get_mut(before).prev = Some(id);
                match prev {
                    Some(p) => table.get_mut(p).next = Some(id),
                    None => self.head = Some(id),
                }
            }
            None => {
                {
                    let t = table.get_mut(id);
                    t.next = None;
                    t.prev = self.tail;
                }
                match self.tail {
                    Some(tail) => table.get_mut(tail).next = Some(id),
                    None => self.head = Some(id),
                }
                self.tail = Some(id);
            }
        }
        let t = table.get_mut(id);
        t.state = TaskState::Blocked;
        t.location = TaskLocation::WaitQueue;
        t.wait_channel = this;
        self.count += 1;
    }

    /// Unlink a member. Clears the wait-channel back-reference.
    pub fn remove(&mut self, table: &mut TaskTable, id: TaskId) -> Result<()> {
        if table.get(id).location != TaskLocation::WaitQueue
            || table.get(id).wait_channel != self as *mut WaitQueue
        {
            return Err(SchedError::InvalidState);
        }
        let (prev, next) = {
            let t = table.get(id);
            (t.prev, t.next)
        };
        match prev {
            Some(p) => table.get_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => table.get_mut(n).prev = prev,
            None => self.tail = prev,
        }
        let t = table.get_mut(id);
        t.next = None;
        t.prev = None;
        t.location = TaskLocation::NotQueued;
        t.wait_channel = core::ptr::null_mut();
        self.count -= 1;
        Ok(())
    }

    pub fn peek(&self) -> Option<TaskId> {
        self.head
    }

    /// Members from head to tail; priorities are non-decreasing.
    pub fn iter<'a>(&'a self, table: &'a TaskTable) -> WaitQueueIter<'a> {
        WaitQueueIter {
            table,
            cursor: self.head,
        }
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

pub struct WaitQueueIter<'a> {
    table: &'a TaskTable,
    cursor: Option<TaskId>,
}

impl Iterator for WaitQueueIter<'_> {
    type Item = TaskId;
    fn next(&mut self) -> Option<TaskId> {
        let id = self.cursor?;
        self.cursor = self.table.get(id).next;
        Some(id)
    }
}

/// Block the calling task on `wq`, optionally with a timeout in ticks.
///
/// The caller must hold the external lock protecting its predicate, enqueue
/// via this function before releasing it, and release it before calling
/// [`sched::schedule`]. On return the caller re-checks the predicate and
/// inspects [`consume_timeout`] to distinguish a timeout wake.
pub fn block_current(wq: &mut WaitQueue, timeout_ticks: Option<u64>) -> Result<()> {
    let cpu_id = arch::cpu_id();
    let mut table = task::table().lock();
    let current = sched::current_on(cpu_id).ok_or(SchedError::InvalidState)?;
    {
        let t = table.get_mut(current);
        t.wait_timeout = match timeout_ticks {
            Some(ticks) => crate::current_tick() + ticks,
            None => 0,
        };
    }
    wq.insert(&mut table, current);
    Ok(())
}

/// Check and clear the timed-out sentinel on a task after a wake.
pub fn consume_timeout(id: TaskId) -> bool {
    let mut table = task::table().lock();
    let t = table.get_mut(id);
    let timed_out = t.wait_timeout == WAIT_TIMED_OUT;
    t.wait_timeout = 0;
    timed_out
}

/// Wake the highest-priority waiter: back to Ready and enqueued on its
/// home CPU's scheduler.
pub fn wake_one(wq: &mut WaitQueue) -> Option<TaskId> {
    let woken = {
        let mut table = task::table().lock();
        let head = wq.peek()?;
        wq.remove(&mut table, head).ok()?;
        let t = table.get_mut(head);
        t.state = TaskState::Ready;
        t.wait_timeout = 0;
        head
    };
    let _ = sched::enqueue(woken);
    Some(woken)
}

/// Drain the queue in priority order.
pub fn wake_all(wq: &mut WaitQueue) -> u32 {
    let mut woken = 0;
    while wake_one(wq).is_some() {
        woken += 1;
    }
    woken
}

/// Per-tick sweep waking every blocked task whose deadline has passed,
/// marking it as timed out.
pub fn timeout_sweep(now: u64) {
    let mut overdue: [Option<TaskId>; task::MAX_TASKS] = [None; task::MAX_TASKS];
    let mut n = 0;
    {
        let mut table = task::table().lock();
        for i in 0..task::MAX_TASKS {
            let id = TaskId(i as u32);
            if !table.exists(id) {
                continue;
            }
            let t = table.get(id);
            if t.state == TaskState::Blocked
                && t.wait_timeout != 0
                && t.wait_timeout != WAIT_TIMED_OUT
                && t.wait_timeout <= now
            {
                let wq = t.wait_channel;
                if !wq.is_null() {
                    // SAFETY: wait channels point at queues owned by live
                    // kernel subsystems; links are only touched under the
                    // table lock we hold.
                    let wq = unsafe { &mut *wq };
                    if wq.remove(&mut table, id).is_ok() {
                        let t = table.get_mut(id);
                        t.state = TaskState::Ready;
                        t.wait_timeout = WAIT_TIMED_OUT;
                        overdue[n] = Some(id);
                        n += 1;
                    }
                }
            }
        }
    }
    for slot in overdue.iter().take(n) {
        if let Some(id) = *slot {
            let _ = sched::enqueue(id);
        }
    }
}
