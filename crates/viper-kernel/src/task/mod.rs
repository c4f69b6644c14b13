//! Task control blocks and the global task table.
//!
//! Tasks live in a fixed-size arena addressed by [`TaskId`] (a slot index).
//! Intrusive links between scheduler structures are arena indices, and each
//! task carries a [`TaskLocation`] tag naming the one structure that holds
//! it, which makes the exclusivity invariant checkable: a task is in at most
//! one run queue, heap, or wait queue at any instant.
//!
//! The table, the unique-id counter, the id hash table, and the kernel-stack
//! pool all share one global lock ([`table()`]).

pub mod stack;

#[cfg(target_arch = "aarch64")]
pub mod context;

use bitflags::bitflags;

use crate::sync::Spinlock;
use crate::wait::WaitQueue;
use crate::{Result, SchedError};

/// Maximum number of tasks in the fixed table.
pub const MAX_TASKS: usize = 64;
const TASK_HASH_BUCKETS: usize = 64;

/// Highest priority (most urgent).
pub const PRIORITY_HIGHEST: u8 = 0;
pub const PRIORITY_DEFAULT: u8 = 128;
pub const PRIORITY_LOWEST: u8 = 255;
/// Number of real-time priority queues.
pub const NUM_PRIORITY_QUEUES: usize = 8;
pub const PRIORITIES_PER_QUEUE: u8 = 32;

/// Default SCHED_RR time slice in ticks (100 ms at 1 kHz).
pub const RT_TIME_SLICE_DEFAULT: u32 = 100;

/// All CPUs allowed.
pub const CPU_AFFINITY_ALL: u32 = 0xFFFF_FFFF;

/// SCHED_OTHER time slice per priority queue, in ticks.
pub const TIME_SLICE_BY_QUEUE: [u32; NUM_PRIORITY_QUEUES] = [20, 18, 15, 12, 10, 8, 5, 5];

/// Sentinel meaning "not in any heap".
pub const HEAP_INDEX_INVALID: u32 = u32::MAX;

/// Sentinel stored in `wait_timeout` after a timeout wake.
pub const WAIT_TIMED_OUT: u64 = u64::MAX;

/// `SIGKILL` is immediately fatal and can be neither masked nor caught.
pub const SIGKILL: u32 = 9;
pub const NUM_SIGNALS: usize = 32;

/// Stable index of a task slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u32);

impl TaskId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskState {
    #[default]
    Invalid,
    Ready,
    Running,
    Blocked,
    Exited,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TaskFlags: u32 {
        const KERNEL = 1 << 0;
        const IDLE = 1 << 1;
        const USER = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedPolicy {
    /// Normal time-sharing under CFS.
    #[default]
    Other,
    /// Real-time, runs until it blocks or yields.
    Fifo,
    /// Real-time, round-robin time slicing.
    Rr,
    /// Earliest-deadline-first.
    Deadline,
}

impl SchedPolicy {
    pub fn is_realtime(self) -> bool {
        matches!(self, SchedPolicy::Fifo | SchedPolicy::Rr)
    }
}

/// Which scheduler structure currently holds a task. At most one at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskLocation {
    #[default]
    NotQueued,
    RtQueue(u8),
    CfsHeap,
    DeadlineHeap,
    WaitQueue,
    Running,
}

/// Callee-saved register context for the switch primitive. Field order
/// matches the store/load offsets in `context.rs` byte for byte.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct TaskContext {
    pub x19: u64,
    pub x20: u64,
    pub x21: u64,
    pub x22: u64,
    pub x23: u64,
    pub x24: u64,
    pub x25: u64,
    pub x26: u64,
    pub x27: u64,
    pub x28: u64,
    /// Frame pointer.
    pub x29: u64,
    /// Link register: the address execution resumes at.
    pub x30: u64,
    pub sp: u64,
}

/// Per-task signal state. Handler value 0 is SIG_DFL, 1 is SIG_IGN.
#[derive(Debug, Clone, Copy)]
pub struct SignalState {
    pub handlers: [u64; NUM_SIGNALS],
    pub blocked: u32,
    pub pending: u32,
}

impl Default for SignalState {
    fn default() -> Self {
        Self {
            handlers: [0; NUM_SIGNALS],
            blocked: 0,
            pending: 0,
        }
    }
}

impl TaskContext {
    pub const ZERO: TaskContext = TaskContext {
        x19: 0,
        x20: 0,
        x21: 0,
        x22: 0,
        x23: 0,
        x24: 0,
        x25: 0,
        x26: 0,
        x27: 0,
        x28: 0,
        x29: 0,
        x30: 0,
        sp: 0,
    };
}

pub type TaskEntry = fn(usize);

/// Task control block.
#[derive(Debug, Clone, Copy)]
pub struct Task {
    pub id: u32,
    name: [u8; 32],
    name_len: u8,
    pub state: TaskState,
    pub flags: TaskFlags,
    pub policy: SchedPolicy,
    /// 0 is highest, 255 lowest.
    pub priority: u8,
    pub nice: i8,
    pub time_slice: u32,
    pub cpu_affinity: u32,
    /// CPU whose structures hold (or last held) this task.
    pub cpu: u32,

    // CFS
    /// Weighted virtual runtime in nanoseconds.
    pub vruntime: u64,

    // SCHED_DEADLINE
    pub dl_runtime: u64,
    pub dl_deadline: u64,
    pub dl_period: u64,
    pub dl_abs_deadline: u64,
    pub dl_missed: u32,

    // Bandwidth ceiling; disabled while `bw_runtime` is zero.
    pub bw_runtime: u64,
    pub bw_period: u64,
    pub bw_consumed: u64,
    pub bw_period_start: u64,
    pub bw_throttled: bool,

    // Intrusive links.
    pub next: Option<TaskId>,
    pub prev: Option<TaskId>,
    pub heap_index: u32,
    pub location: TaskLocation,
    hash_next: Option<TaskId>,

    /// Wait queue currently holding this task, for removal on kill and the
    /// timeout sweep.
    ///
    /// # Safety
    /// Only dereferenced while the owning subsystem's lock and the task
    /// table lock are held.
    pub wait_channel: *mut WaitQueue,
    /// Absolute wake tick; [`WAIT_TIMED_OUT`] after a timeout wake.
    pub wait_timeout: u64,

    pub context: TaskContext,
    pub stack: Option<stack::StackSlot>,

    pub parent_id: u32,
    pub exit_code: i32,
    pub cpu_ticks: u64,
    pub switch_count: u64,

    pub signals: SignalState,
    cwd: [u8; 256],
    cwd_len: u8,

    // User tasks.
    pub user_entry: u64,
    pub user_stack: u64,
    /// Opaque handle to the owning process' address space.
    pub process: usize,
}

// SAFETY: the raw wait-channel pointer is only touched under the documented
// locks; everything else is plain data.
unsafe impl Send for Task {}

impl Task {
    const fn empty() -> Self {
        Self {
            id: 0,
            name: [0; 32],
            name_len: 0,
            state: TaskState::Invalid,
            flags: TaskFlags::empty(),
            policy: SchedPolicy::Other,
            priority: PRIORITY_DEFAULT,
            nice: 0,
            time_slice: 0,
            cpu_affinity: CPU_AFFINITY_ALL,
            cpu: 0,
            vruntime: 0,
            dl_runtime: 0,
            dl_deadline: 0,
            dl_period: 0,
            dl_abs_deadline: 0,
            dl_missed: 0,
            bw_runtime: 0,
            bw_period: 0,
            bw_consumed: 0,
            bw_period_start: 0,
            bw_throttled: false,
            next: None,
            prev: None,
            heap_index: HEAP_INDEX_INVALID,
            location: TaskLocation::NotQueued,
            hash_next: None,
            wait_channel: core::ptr::null_mut(),
            wait_timeout: 0,
            context: TaskContext::ZERO,
            stack: None,
            parent_id: 0,
            exit_code: 0,
            cpu_ticks: 0,
            switch_count: 0,
            signals: SignalState {
                handlers: [0; NUM_SIGNALS],
                blocked: 0,
                pending: 0,
            },
            cwd: [0; 256],
            cwd_len: 1,
            user_entry: 0,
            user_stack: 0,
            process: 0,
        }
    }

    pub fn name(&self) -> &str {
        core::str::from_utf8(&self.name[..self.name_len as usize]).unwrap_or("?")
    }

    fn set_name(&mut self, name: &str) {
        let bytes = name.as_bytes();
        let len = bytes.len().min(self.name.len());
        self.name[..len].copy_from_slice(&bytes[..len]);
        self.name_len = len as u8;
    }

    pub fn cwd(&self) -> &str {
        core::str::from_utf8(&self.cwd[..self.cwd_len as usize]).unwrap_or("/")
    }

    pub fn set_cwd(&mut self, path: &str) {
        let bytes = path.as_bytes();
        let len = bytes.len().min(self.cwd.len());
        self.cwd[..len].copy_from_slice(&bytes[..len]);
        self.cwd_len = len as u8;
    }

    /// Priority queue index for real-time queues.
    pub fn queue_index(&self) -> u8 {
        self.priority / PRIORITIES_PER_QUEUE
    }

    /// SCHED_OTHER time slice by priority queue.
    pub fn base_time_slice(&self) -> u32 {
        TIME_SLICE_BY_QUEUE[self.queue_index() as usize]
    }

    pub fn runnable(&self) -> bool {
        matches!(self.state, TaskState::Ready | TaskState::Running)
    }
}

/// The global task arena plus id allocation and lookup state.
pub struct TaskTable {
    slots: [Task; MAX_TASKS],
    present: [bool; MAX_TASKS],
    next_unique_id: u32,
    hash: [Option<TaskId>; TASK_HASH_BUCKETS],
    stacks: stack::StackPool,
}

impl TaskTable {
    pub const fn new() -> Self {
        Self {
            slots: [Task::empty(); MAX_TASKS],
            present: [false; MAX_TASKS],
            next_unique_id: 1,
            hash: [None; TASK_HASH_BUCKETS],
            stacks: stack::StackPool::new(),
        }
    }

    /// Configure the reserved region backing kernel stacks. Called once at
    /// boot before any task is created.
    pub fn init_stacks(&mut self, base: usize, len: usize) {
        self.stacks.init(base, len);
    }

    pub fn get(&self, id: TaskId) -> &Task {
        &self.slots[id.index()]
    }

    pub fn get_mut(&mut self, id: TaskId) -> &mut Task {
        &mut self.slots[id.index()]
    }

    pub fn exists(&self, id: TaskId) -> bool {
        id.index() < MAX_TASKS
            && self.present[id.index()]
            && self.slots[id.index()].state != TaskState::Invalid
    }

    /// Iterate live task slots.
    pub fn iter_ids(&self) -> impl Iterator<Item = TaskId> + '_ {
        (0..MAX_TASKS as u32)
            .map(TaskId)
            .filter(move |id| self.exists(*id))
    }

    /// O(1) lookup by unique task id.
    pub fn find_by_unique_id(&self, unique: u32) -> Option<TaskId> {
        let mut cursor = self.hash[(unique as usize) % TASK_HASH_BUCKETS];
        while let Some(id) = cursor {
            if self.slots[id.index()].id == unique {
                return Some(id);
            }
            cursor = self.slots[id.index()].hash_next;
        }
        None
    }

    fn hash_insert(&mut self, id: TaskId) {
        let bucket = (self.slots[id.index()].id as usize) % TASK_HASH_BUCKETS;
        self.slots[id.index()].hash_next = self.hash[bucket];
        self.hash[bucket] = Some(id);
    }

    fn hash_remove(&mut self, id: TaskId) {
        let unique = self.slots[id.index()].id;
        let bucket = (unique as usize) % TASK_HASH_BUCKETS;
        let mut cursor = self.hash[bucket];
        let mut prev: Option<TaskId> = None;
        while let Some(cur) = cursor {
            if cur == id {
                let next = self.slots[cur.index()].hash_next;
                match prev {
                    Some(p) => self.slots[p.index()].hash_next = next,
                    None => self.hash[bucket] = next,
                }
                self.slots[cur.index()].hash_next = None;
                return;
            }
            prev = Some(cur);
            cursor = self.slots[cur.index()].hash_next;
        }
    }

    fn alloc_slot(&mut self) -> Option<TaskId> {
        for i in 0..MAX_TASKS {
            if !self.present[i] {
                self.present[i] = true;
                return Some(TaskId(i as u32));
            }
        }
        None
    }

    /// Create a kernel task: allocate a slot and stack, initialize the TCB,
    /// and aim the saved context at the entry trampoline.
    pub fn create(
        &mut self,
        name: &str,
        entry: TaskEntry,
        arg: usize,
        flags: TaskFlags,
    ) -> Result<TaskId> {
        let id = self.alloc_slot().ok_or(SchedError::NoResource)?;
        let stack_slot = match self.stacks.alloc() {
            Some(slot) => slot,
            None => {
                self.present[id.index()] = false;
                return Err(SchedError::NoResource);
            }
        };

        let unique = self.next_unique_id;
        self.next_unique_id += 1;

        let task = &mut self.slots[id.index()];
        *task = Task::empty();
        task.id = unique;
        task.set_name(name);
        task.set_cwd("/");
        task.flags = flags;
        task.state = TaskState::Ready;
        task.priority = PRIORITY_DEFAULT;

        // The first switch lands in the trampoline, which pops the entry
        // function and argument off the new stack.
        let mut sp = stack_slot.top();
        sp -= 16;
        #[cfg(target_arch = "aarch64")]
        unsafe {
            let slots = sp as *mut usize;
            slots.write(entry as usize);
            slots.add(1).write(arg);
            task.context.x30 = context::task_entry_trampoline as usize as u64;
        }
        #[cfg(not(target_arch = "aarch64"))]
        {
            // Host builds never switch; remember the entry for inspection.
            let _ = (entry, arg);
        }
        task.context.sp = sp as u64;
        task.stack = Some(stack_slot);

        self.hash_insert(id);
        log::debug!("created task {} '{}' (slot {})", unique, name, id.0);
        Ok(id)
    }

    /// Create a user task bound to a process address space. It enters user
    /// mode through the user trampoline on first schedule.
    pub fn create_user(
        &mut self,
        name: &str,
        process: usize,
        user_entry: u64,
        user_stack: u64,
    ) -> Result<TaskId> {
        fn user_bounce(_arg: usize) {}
        let id = self.create(name, user_bounce, 0, TaskFlags::USER)?;
        let task = self.get_mut(id);
        task.process = process;
        task.user_entry = user_entry;
        task.user_stack = user_stack;
        #[cfg(target_arch = "aarch64")]
        {
            task.context.x30 = context::user_entry_trampoline as usize as u64;
        }
        Ok(id)
    }

    /// Create an additional thread in an existing process: shares the
    /// address space, keeps its own kernel stack and scheduling state.
    /// Joiners wait on the slot's [`join_queue`].
    pub fn create_thread(
        &mut self,
        name: &str,
        process: usize,
        entry: TaskEntry,
        arg: usize,
    ) -> Result<TaskId> {
        let id = self.create(name, entry, arg, TaskFlags::USER)?;
        self.get_mut(id).process = process;
        Ok(id)
    }

    /// Mark a task exited and detach it from whatever structure holds it.
    /// The scheduler notices on the next schedule or tick.
    pub fn mark_exited(&mut self, id: TaskId, code: i32) {
        let task = self.get_mut(id);
        task.exit_code = code;
        task.state = TaskState::Exited;
        task.wait_channel = core::ptr::null_mut();
        task.wait_timeout = 0;
    }

    /// Reap exited tasks: return stacks to the pool and free the slots.
    pub fn reap_exited(&mut self) -> u32 {
        let mut reaped = 0;
        for i in 0..MAX_TASKS {
            let id = TaskId(i as u32);
            if self.present[i] && self.slots[i].state == TaskState::Exited {
                if let Some(slot) = self.slots[i].stack.take() {
                    self.stacks.free(slot);
                }
                self.hash_remove(id);
                self.slots[i] = Task::empty();
                self.present[i] = false;
                reaped += 1;
            }
        }
        reaped
    }
}

static TASKS: Spinlock<TaskTable> = Spinlock::new(TaskTable::new());

/// The global task table. Lock ordering: this lock comes before any per-CPU
/// scheduler lock.
pub fn table() -> &'static Spinlock<TaskTable> {
    &TASKS
}

/// Per-slot join queues. The queue's lock is the external lock of the
/// wait-queue contract: joiners hold it across the exited-check and the
/// enqueue, and exit wakes through it.
static JOIN_QUEUES: [Spinlock<WaitQueue>; MAX_TASKS] =
    [const { Spinlock::new(WaitQueue::new()) }; MAX_TASKS];

pub fn join_queue(id: TaskId) -> &'static Spinlock<WaitQueue> {
    &JOIN_QUEUES[id.index()]
}

/// Block until `target` exits and return its exit code.
pub fn join(target: TaskId) -> Result<i32> {
    loop {
        let mut wq = join_queue(target).lock();
        {
            let table = table().lock();
            if !table.exists(target) {
                return Err(SchedError::NoSuchTask);
            }
            if table.get(target).state == TaskState::Exited {
                return Ok(table.get(target).exit_code);
            }
        }
        crate::wait::block_current(&mut wq, None)?;
        drop(wq);
        crate::sched::schedule();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_arg: usize) {}

    #[test]
    fn create_and_lookup_by_unique_id() {
        let mut table = TaskTable::new();
        let a = table.create("a", noop, 0, TaskFlags::empty()).unwrap();
        let b = table.create("b", noop, 0, TaskFlags::empty()).unwrap();
        assert_ne!(table.get(a).id, table.get(b).id);
        assert_eq!(table.find_by_unique_id(table.get(a).id), Some(a));
        assert_eq!(table.find_by_unique_id(table.get(b).id), Some(b));
        assert_eq!(table.get(a).name(), "a");
        assert_eq!(table.get(a).state, TaskState::Ready);
        assert_eq!(table.get(a).heap_index, HEAP_INDEX_INVALID);
    }

    #[test]
    fn slots_recycle_after_reap() {
        let mut table = TaskTable::new();
        let a = table.create("short", noop, 0, TaskFlags::empty()).unwrap();
        let unique = table.get(a).id;
        table.mark_exited(a, 7);
        assert_eq!(table.reap_exited(), 1);
        assert!(!table.exists(a));
        assert_eq!(table.find_by_unique_id(unique), None);
        let b = table.create("next", noop, 0, TaskFlags::empty()).unwrap();
        assert_eq!(a, b);
        assert_ne!(table.get(b).id, unique);
    }

    #[test]
    fn table_exhaustion_reports_no_resource() {
        let mut table = TaskTable::new();
        for i in 0..MAX_TASKS {
            table
                .create("filler", noop, i, TaskFlags::empty())
                .unwrap();
        }
        assert_eq!(
            table.create("overflow", noop, 0, TaskFlags::empty()),
            Err(SchedError::NoResource)
        );
    }
}
