//! Per-CPU scheduler.
//!
//! Each CPU owns a deadline heap (EDF), a CFS heap keyed by vruntime, and
//! eight real-time FIFO/RR queues with a bitmap for O(1) highest-priority
//! lookup. Selection order: deadline, then real-time, then fair, then the
//! per-CPU idle task.
//!
//! Locking: the global task-table lock is taken before the per-CPU lock;
//! the per-CPU lock is released before the context switch itself.

pub mod cfs;
pub mod heap;

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::arch;
use crate::ipi::{self, IpiType};
use crate::sync::Spinlock;
use crate::task::{
    self, SchedPolicy, Task, TaskContext, TaskFlags, TaskId, TaskLocation, TaskState, TaskTable,
    HEAP_INDEX_INVALID, NUM_PRIORITY_QUEUES, PRIORITY_LOWEST, RT_TIME_SLICE_DEFAULT,
};
use crate::{Result, SchedError, MAX_CPUS, TICK_NS};

fn vruntime_key(t: &Task) -> u64 {
    t.vruntime
}

fn deadline_key(t: &Task) -> u64 {
    t.dl_abs_deadline
}

#[derive(Debug, Clone, Copy, Default)]
struct RtQueue {
    head: Option<TaskId>,
    tail: Option<TaskId>,
}

/// Scheduler state of one CPU.
pub struct PerCpuScheduler {
    deadline_heap: heap::TaskHeap,
    cfs_heap: heap::TaskHeap,
    rt_queues: [RtQueue; NUM_PRIORITY_QUEUES],
    rt_bitmap: u8,
    /// Monotonically non-decreasing floor for CFS vruntime.
    pub min_vruntime: u64,
    /// Enqueued CFS tasks, idle excluded.
    pub cfs_nr_running: u32,
    pub context_switches: u64,
    pub steals: u32,
    pub migrations: u32,
    pub total_tasks: u32,
    pub initialized: bool,
    current: Option<TaskId>,
    idle: Option<TaskId>,
    need_resched: bool,
    /// Landing pad for the very first switch on this CPU.
    boot_context: TaskContext,
}

impl PerCpuScheduler {
    const fn new() -> Self {
        Self {
            deadline_heap: heap::TaskHeap::new(deadline_key),
            cfs_heap: heap::TaskHeap::new(vruntime_key),
            rt_queues: [RtQueue { head: None, tail: None }; NUM_PRIORITY_QUEUES],
            rt_bitmap: 0,
            min_vruntime: 0,
            cfs_nr_running: 0,
            context_switches: 0,
            steals: 0,
            migrations: 0,
            total_tasks: 0,
            initialized: false,
            current: None,
            idle: None,
            need_resched: false,
            boot_context: TaskContext::ZERO,
        }
    }

    pub fn current(&self) -> Option<TaskId> {
        self.current
    }

    pub fn request_resched(&mut self) {
        self.need_resched = true;
    }

    /// Members of the CFS heap, unordered. Load balancing scans these for a
    /// migratable victim.
    pub fn cfs_candidates(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.cfs_heap.iter()
    }

    fn rt_push(&mut self, table: &mut TaskTable, id: TaskId) {
        let q = table.get(id).queue_index() as usize;
        let queue = &mut self.rt_queues[q];
        let task = table.get_mut(id);
        task.next = None;
        task.prev = queue.tail;
        task.location = TaskLocation::RtQueue(q as u8);
        match queue.tail {
            Some(tail) => table.get_mut(tail).next = Some(id),
            None => queue.head = Some(id),
        }
        self.rt_queues[q].tail = Some(id);
        self.rt_bitmap |= 1 << q;
    }

    fn rt_pop(&mut self, table: &mut TaskTable, q: usize) -> Option<TaskId> {
        let head = self.rt_queues[q].head?;
        self.rt_unlink(table, head, q);
        Some(head)
    }

    fn rt_unlink(&mut self, table: &mut TaskTable, id: TaskId, q: usize) {
        let (prev, next) = {
            let t = table.get(id);
            (t.prev, t.next)
        };
        match prev {
            Some(p) => table.get_mut(p).next = next,
            None => self.rt_queues[q].head = next,
        }
        match next {
            Some(n) => table.get_mut(n).prev = prev,
            None => self.rt_queues[q].tail = prev,
        }
        if self.rt_queues[q].head.is_none() {
            self.rt_bitmap &= !(1 << q);
        }
        let t = table.get_mut(id);
        t.next = None;
        t.prev = None;
        t.location = TaskLocation::NotQueued;
    }
}

static CPUS: [Spinlock<PerCpuScheduler>; MAX_CPUS] =
    [const { Spinlock::new(PerCpuScheduler::new()) }; MAX_CPUS];

/// Lock-free per-CPU queue length estimates, for load balancing and fast
/// emptiness probes only; never a correctness input.
pub static QUEUE_COUNTS: [AtomicU32; MAX_CPUS] = [const { AtomicU32::new(0) }; MAX_CPUS];

static CPU_INITIALIZED: [AtomicBool; MAX_CPUS] = [const { AtomicBool::new(false) }; MAX_CPUS];

static CONTEXT_SWITCHES: AtomicU64 = AtomicU64::new(0);

pub(crate) fn cpu(cpu: usize) -> &'static Spinlock<PerCpuScheduler> {
    &CPUS[cpu]
}

pub fn cpu_initialized(cpu: usize) -> bool {
    cpu < MAX_CPUS && CPU_INITIALIZED[cpu].load(Ordering::Relaxed)
}

/// Initialize the scheduler for one CPU, creating its idle task.
pub fn init_cpu(cpu_id: usize) -> Result<()> {
    fn idle_body(_arg: usize) {
        loop {
            arch::wait_for_interrupt();
        }
    }

    let mut table = task::table().lock();
    let idle = table.create("idle", idle_body, cpu_id, TaskFlags::KERNEL | TaskFlags::IDLE)?;
    {
        let t = table.get_mut(idle);
        t.priority = PRIORITY_LOWEST;
        t.cpu_affinity = 1 << cpu_id;
        t.cpu = cpu_id as u32;
    }
    let mut pc = CPUS[cpu_id].lock();
    pc.idle = Some(idle);
    pc.initialized = true;
    if pc.current.is_none() {
        pc.current = Some(idle);
        table.get_mut(idle).state = TaskState::Running;
        table.get_mut(idle).location = TaskLocation::Running;
    }
    CPU_INITIALIZED[cpu_id].store(true, Ordering::Release);
    log::debug!("cpu {} scheduler initialized", cpu_id);
    Ok(())
}

/// The task currently running on `cpu_id`.
pub fn current_on(cpu_id: usize) -> Option<TaskId> {
    CPUS[cpu_id].lock().current()
}

/// Route a wakeup or new task to a CPU: single-bit affinity wins, then the
/// local CPU for cache locality, then the least-loaded candidate.
pub fn select_target_cpu(task: &Task) -> usize {
    let mask = task.cpu_affinity;
    if mask.count_ones() == 1 {
        let cpu = mask.trailing_zeros() as usize;
        if cpu < MAX_CPUS {
            return cpu;
        }
    }
    let me = arch::cpu_id();
    if mask & (1 << me) != 0 && cpu_initialized(me) {
        return me;
    }
    let mut best = me.min(MAX_CPUS - 1);
    let mut best_load = u32::MAX;
    for c in 0..MAX_CPUS {
        if mask & (1 << c) != 0 && cpu_initialized(c) {
            let load = QUEUE_COUNTS[c].load(Ordering::Relaxed);
            if load < best_load {
                best_load = load;
                best = c;
            }
        }
    }
    best
}

/// Enqueue on whichever CPU [`select_target_cpu`] picks.
pub fn enqueue(id: TaskId) -> Result<()> {
    let table = task::table().lock();
    let target = select_target_cpu(table.get(id));
    enqueue_with_table(table, id, target)
}

/// Enqueue on a specific CPU.
pub fn enqueue_on_cpu(id: TaskId, cpu_id: usize) -> Result<()> {
    let table = task::table().lock();
    enqueue_with_table(table, id, cpu_id)
}

fn enqueue_with_table(
    mut table: crate::sync::SpinlockGuard<'_, TaskTable>,
    id: TaskId,
    cpu_id: usize,
) -> Result<()> {
    let mut pc = CPUS[cpu_id].lock();
    enqueue_locked(&mut table, &mut pc, cpu_id, id)?;
    let preempt = preemption_candidate(&table, &pc, id);
    if preempt {
        pc.request_resched();
    }
    drop(pc);
    drop(table);
    if cpu_id != arch::cpu_id() {
        ipi::send_ipi(cpu_id, IpiType::Reschedule);
    }
    Ok(())
}

/// Does the freshly enqueued task outrank the CPU's current one?
fn preemption_candidate(table: &TaskTable, pc: &PerCpuScheduler, id: TaskId) -> bool {
    let Some(cur) = pc.current else { return true };
    let cur = table.get(cur);
    let new = table.get(id);
    if cur.flags.contains(TaskFlags::IDLE) {
        return true;
    }
    match new.policy {
        SchedPolicy::Deadline => {
            cur.policy != SchedPolicy::Deadline || new.dl_abs_deadline < cur.dl_abs_deadline
        }
        SchedPolicy::Fifo | SchedPolicy::Rr => {
            !cur.policy.is_realtime() || new.queue_index() < cur.queue_index()
        }
        SchedPolicy::Other => false,
    }
}

/// Core enqueue; caller holds both locks.
pub(crate) fn enqueue_locked(
    table: &mut TaskTable,
    pc: &mut PerCpuScheduler,
    cpu_id: usize,
    id: TaskId,
) -> Result<()> {
    let t = table.get(id);
    if !t.runnable() {
        log::warn!(
            "enqueue of task {} in state {:?} rejected",
            t.id,
            t.state
        );
        return Err(SchedError::InvalidState);
    }
    let policy = t.policy;
    if matches!(policy, SchedPolicy::Other | SchedPolicy::Deadline)
        && t.heap_index != HEAP_INDEX_INVALID
    {
        log::warn!("double enqueue of task {} rejected", t.id);
        return Err(SchedError::InvalidState);
    }

    match policy {
        SchedPolicy::Fifo | SchedPolicy::Rr => pc.rt_push(table, id),
        SchedPolicy::Other => {
            // Sleeper fairness: a task that slept does not get to replay the
            // vruntime it missed, but is never pushed backwards either.
            let floor = pc.min_vruntime;
            let t = table.get_mut(id);
            if t.vruntime < floor {
                t.vruntime = floor;
            }
            pc.cfs_heap.insert(table, id)?;
            table.get_mut(id).location = TaskLocation::CfsHeap;
            if !table.get(id).flags.contains(TaskFlags::IDLE) {
                pc.cfs_nr_running += 1;
            }
        }
        SchedPolicy::Deadline => {
            pc.deadline_heap.insert(table, id)?;
            table.get_mut(id).location = TaskLocation::DeadlineHeap;
        }
    }

    let t = table.get_mut(id);
    t.state = TaskState::Ready;
    t.cpu = cpu_id as u32;
    pc.total_tasks += 1;
    QUEUE_COUNTS[cpu_id].fetch_add(1, Ordering::Relaxed);
    Ok(())
}

/// Remove a specific task from whatever per-CPU structure holds it.
pub(crate) fn detach_locked(
    table: &mut TaskTable,
    pc: &mut PerCpuScheduler,
    cpu_id: usize,
    id: TaskId,
) -> Result<()> {
    match table.get(id).location {
        TaskLocation::RtQueue(q) => pc.rt_unlink(table, id, q as usize),
        TaskLocation::CfsHeap => {
            pc.cfs_heap.remove(table, id)?;
            if !table.get(id).flags.contains(TaskFlags::IDLE) {
                pc.cfs_nr_running -= 1;
            }
            table.get_mut(id).location = TaskLocation::NotQueued;
        }
        TaskLocation::DeadlineHeap => {
            pc.deadline_heap.remove(table, id)?;
            table.get_mut(id).location = TaskLocation::NotQueued;
        }
        _ => return Err(SchedError::InvalidState),
    }
    pc.total_tasks = pc.total_tasks.saturating_sub(1);
    QUEUE_COUNTS[cpu_id].fetch_sub(1, Ordering::Relaxed);
    Ok(())
}

/// Pick the next runnable task: deadline first, then the highest-priority
/// real-time queue (count-trailing-zeros on the bitmap), then lowest
/// vruntime, advancing `min_vruntime` as fair tasks leave the heap.
pub(crate) fn pick_next_locked(
    table: &mut TaskTable,
    pc: &mut PerCpuScheduler,
    cpu_id: usize,
) -> Option<TaskId> {
    let picked = if let Some(id) = pc.deadline_heap.extract_min(table) {
        table.get_mut(id).location = TaskLocation::NotQueued;
        Some(id)
    } else if pc.rt_bitmap != 0 {
        let q = pc.rt_bitmap.trailing_zeros() as usize;
        pc.rt_pop(table, q)
    } else if let Some(id) = pc.cfs_heap.extract_min(table) {
        let vruntime = table.get(id).vruntime;
        if vruntime > pc.min_vruntime {
            pc.min_vruntime = vruntime;
        }
        if !table.get(id).flags.contains(TaskFlags::IDLE) {
            pc.cfs_nr_running = pc.cfs_nr_running.saturating_sub(1);
        }
        table.get_mut(id).location = TaskLocation::NotQueued;
        Some(id)
    } else {
        None
    };

    if picked.is_some() {
        pc.total_tasks = pc.total_tasks.saturating_sub(1);
        QUEUE_COUNTS[cpu_id].fetch_sub(1, Ordering::Relaxed);
    }
    picked
}

fn time_slice_for(task: &Task, pc: &PerCpuScheduler) -> u32 {
    match task.policy {
        SchedPolicy::Deadline => ((task.dl_runtime / TICK_NS) as u32).max(1),
        SchedPolicy::Fifo => u32::MAX,
        SchedPolicy::Rr => RT_TIME_SLICE_DEFAULT,
        SchedPolicy::Other => {
            let fair = (cfs::slice_ns(pc.cfs_nr_running + 1) / TICK_NS).max(1) as u32;
            fair.min(task.base_time_slice())
        }
    }
}

/// Everything `schedule()` does short of the actual register switch.
pub struct SwitchDecision {
    pub prev: Option<TaskId>,
    pub next: TaskId,
    prev_ctx: *mut TaskContext,
    next_ctx: *const TaskContext,
}

/// Select the next task on `cpu_id` and commit the bookkeeping for the
/// switch. Returns `None` when the current task should simply keep running.
///
/// Both locks are released before this returns, satisfying the rule that no
/// scheduler lock is held across `context_switch`.
pub fn prepare_switch(cpu_id: usize) -> Option<SwitchDecision> {
    let mut table = task::table().lock();
    let mut pc = CPUS[cpu_id].lock();

    let current = pc.current;

    // Put the outgoing task back first, so an RR task whose slice expired
    // rotates to the tail of its queue before selection runs; CFS likewise
    // competes with its freshly accumulated vruntime.
    if let Some(cur) = current {
        let state = table.get(cur).state;
        let is_idle = table.get(cur).flags.contains(TaskFlags::IDLE);
        let throttled = table.get(cur).bw_throttled;
        if state == TaskState::Running {
            table.get_mut(cur).state = TaskState::Ready;
            table.get_mut(cur).location = TaskLocation::NotQueued;
            if !is_idle && !throttled {
                // Re-enqueue; a full CPU is an internal invariant breach we
                // log rather than panic on.
                if let Err(e) = enqueue_locked(&mut table, &mut pc, cpu_id, cur) {
                    log::warn!("re-enqueue of task failed: {:?}", e);
                }
            }
        }
    }

    let next = match pick_next_locked(&mut table, &mut pc, cpu_id) {
        Some(id) => id,
        None => pc.idle?,
    };

    if Some(next) == current {
        // Same task wins again: restore it with a fresh slice, no switch.
        let slice = time_slice_for(table.get(next), &pc);
        let t = table.get_mut(next);
        t.state = TaskState::Running;
        t.location = TaskLocation::Running;
        t.time_slice = slice;
        return None;
    }

    let prev_ctx: *mut TaskContext = match current {
        Some(cur) => &mut table.get_mut(cur).context,
        None => &mut pc.boot_context,
    };

    {
        let slice = time_slice_for(table.get(next), &pc);
        let t = table.get_mut(next);
        t.state = TaskState::Running;
        t.location = TaskLocation::Running;
        t.time_slice = slice;
        t.switch_count += 1;
        t.cpu = cpu_id as u32;
    }
    pc.current = Some(next);
    pc.context_switches += 1;
    CONTEXT_SWITCHES.fetch_add(1, Ordering::Relaxed);

    let next_ctx: *const TaskContext = &table.get(next).context;
    let decision = SwitchDecision {
        prev: current,
        next,
        prev_ctx,
        next_ctx,
    };
    drop(pc);
    drop(table);
    Some(decision)
}

/// Give up the CPU: pick the next task and switch to it. On non-AArch64
/// hosts the bookkeeping happens but no registers change hands.
pub fn schedule() {
    let cpu_id = arch::cpu_id();
    if let Some(decision) = prepare_switch(cpu_id) {
        #[cfg(target_arch = "aarch64")]
        // SAFETY: both contexts live in the static task arena (or the
        // per-CPU boot context) and stay valid across the switch; locks
        // were released by prepare_switch.
        unsafe {
            task::context::context_switch(decision.prev_ctx, decision.next_ctx);
        }
        #[cfg(not(target_arch = "aarch64"))]
        {
            let _ = (decision.prev_ctx, decision.next_ctx);
        }
    }
}

/// Voluntarily yield the CPU; the current task stays runnable.
pub fn yield_now() {
    schedule();
}

/// Terminate the calling task and wake any joiners.
pub fn exit_current(code: i32) -> ! {
    let cpu_id = arch::cpu_id();
    let exited = {
        let mut table = task::table().lock();
        let cur = CPUS[cpu_id].lock().current();
        if let Some(cur) = cur {
            table.mark_exited(cur, code);
        }
        cur
    };
    if let Some(cur) = exited {
        let mut joiners = task::join_queue(cur).lock();
        crate::wait::wake_all(&mut joiners);
    }
    schedule();
    // Unreachable once the switch happens; spin defensively on the host.
    loop {
        arch::wait_for_interrupt();
    }
}

/// Timer tick: account the running task, drive preemption, and run the
/// global sweeps (wait timeouts, bandwidth replenishment, load balancing).
/// Called from interrupt context at tick frequency.
pub fn tick() {
    let now = crate::advance_tick();
    let cpu_id = arch::cpu_id();
    let mut need_resched = false;

    {
        let mut table = task::table().lock();
        let mut pc = CPUS[cpu_id].lock();

        if let Some(cur) = pc.current {
            let is_idle = table.get(cur).flags.contains(TaskFlags::IDLE);
            if is_idle {
                need_resched = pc.total_tasks > 0;
            } else {
                {
                    let t = table.get_mut(cur);
                    t.cpu_ticks += 1;
                    match t.policy {
                        SchedPolicy::Fifo => {}
                        _ => t.time_slice = t.time_slice.saturating_sub(1),
                    }
                    if t.policy == SchedPolicy::Other {
                        t.vruntime += cfs::vruntime_delta(TICK_NS, t.nice);
                    }
                }
                // Deadline accounting precedes bandwidth: the ceiling
                // applies after the floor.
                if table.get(cur).policy == SchedPolicy::Deadline {
                    let t = table.get_mut(cur);
                    if now > t.dl_abs_deadline && t.dl_abs_deadline != 0 {
                        t.dl_missed += 1;
                        t.dl_abs_deadline = now + t.dl_period / TICK_NS;
                    }
                }
                if crate::bandwidth::account_tick(table.get_mut(cur), now) {
                    need_resched = true;
                }
                let t = table.get(cur);
                if t.time_slice == 0 && t.policy != SchedPolicy::Fifo {
                    need_resched = true;
                }
                if t.state == TaskState::Exited {
                    need_resched = true;
                }
                if !need_resched {
                    need_resched = higher_priority_ready(&table, &pc, cur);
                }
            }
        }
        if pc.need_resched {
            pc.need_resched = false;
            need_resched = true;
        }
    }

    crate::wait::timeout_sweep(now);
    crate::bandwidth::replenish_sweep(now);
    crate::balance::on_tick();

    if need_resched {
        schedule();
    }
}

/// Is something queued that outranks the current task?
fn higher_priority_ready(table: &TaskTable, pc: &PerCpuScheduler, cur: TaskId) -> bool {
    let cur = table.get(cur);
    if !pc.deadline_heap.is_empty() && cur.policy != SchedPolicy::Deadline {
        return true;
    }
    if pc.rt_bitmap != 0 {
        if !cur.policy.is_realtime() {
            return true;
        }
        let best = pc.rt_bitmap.trailing_zeros() as u8;
        if best < cur.queue_index() {
            return true;
        }
    }
    false
}

/// Total context switches across all CPUs.
pub fn context_switches() -> u64 {
    CONTEXT_SWITCHES.load(Ordering::Relaxed)
}

/// Point-in-time statistics for one CPU.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuStats {
    pub context_switches: u64,
    pub queue_length: u32,
    pub steals: u32,
    pub migrations: u32,
    pub cfs_nr_running: u32,
    pub min_vruntime: u64,
}

pub fn cpu_stats(cpu_id: usize) -> CpuStats {
    let pc = CPUS[cpu_id].lock();
    CpuStats {
        context_switches: pc.context_switches,
        queue_length: pc.total_tasks,
        steals: pc.steals,
        migrations: pc.migrations,
        cfs_nr_running: pc.cfs_nr_running,
        min_vruntime: pc.min_vruntime,
    }
}

/// Log a statistics report for every initialized CPU.
pub fn dump_stats() {
    for c in 0..MAX_CPUS {
        if !cpu_initialized(c) {
            continue;
        }
        let stats = cpu_stats(c);
        log::info!(
            "cpu{}: switches={} queued={} steals={} migrations={} min_vruntime={}",
            c,
            stats.context_switches,
            stats.queue_length,
            stats.steals,
            stats.migrations,
            stats.min_vruntime
        );
    }
}

/// Verify heap order, back links, and structure exclusivity across all
/// CPUs. Test and debug aid; takes every lock.
pub fn validate_invariants() -> bool {
    let table = task::table().lock();
    for c in 0..MAX_CPUS {
        let pc = CPUS[c].lock();
        if !pc.cfs_heap.check_invariants(&table) || !pc.deadline_heap.check_invariants(&table) {
            return false;
        }
        // Every RT queue member must point back at its queue.
        for q in 0..NUM_PRIORITY_QUEUES {
            let mut cursor = pc.rt_queues[q].head;
            while let Some(id) = cursor {
                if table.get(id).location != TaskLocation::RtQueue(q as u8) {
                    return false;
                }
                cursor = table.get(id).next;
            }
        }
    }
    // Exclusivity: location tags are consistent with heap back-links.
    for id in table.iter_ids() {
        let t = table.get(id);
        let in_heap = t.heap_index != HEAP_INDEX_INVALID;
        let says_heap = matches!(
            t.location,
            TaskLocation::CfsHeap | TaskLocation::DeadlineHeap
        );
        if in_heap != says_heap {
            return false;
        }
    }
    true
}

/// Create a kernel task and enqueue it.
pub fn spawn(
    name: &str,
    entry: task::TaskEntry,
    arg: usize,
    policy: SchedPolicy,
    priority: u8,
) -> Result<TaskId> {
    let id = {
        let mut table = task::table().lock();
        let id = table.create(name, entry, arg, TaskFlags::KERNEL)?;
        let t = table.get_mut(id);
        t.policy = policy;
        t.priority = priority;
        id
    };
    enqueue(id)?;
    Ok(id)
}

/// Change a task's scheduling policy, moving it between structures if it is
/// currently queued.
pub fn set_policy(id: TaskId, policy: SchedPolicy) -> Result<()> {
    requeue_with(id, |t| t.policy = policy)
}

/// Change priority (0 highest, 255 lowest).
pub fn set_priority(id: TaskId, priority: u8) -> Result<()> {
    requeue_with(id, |t| t.priority = priority)
}

/// Change the nice value (-20..=19); affects CFS weight only.
pub fn set_nice(id: TaskId, nice: i8) -> Result<()> {
    requeue_with(id, |t| t.nice = nice.clamp(-20, 19))
}

/// Change CPU affinity. A queued task moves to a permitted CPU on its next
/// enqueue; we force that immediately when its home CPU is now excluded.
pub fn set_affinity(id: TaskId, mask: u32) -> Result<()> {
    if mask == 0 {
        return Err(SchedError::InvalidState);
    }
    requeue_with(id, |t| t.cpu_affinity = mask)
}

/// Configure SCHED_DEADLINE parameters (nanoseconds) and stamp the first
/// absolute deadline.
pub fn set_deadline(id: TaskId, runtime_ns: u64, deadline_ns: u64, period_ns: u64) -> Result<()> {
    requeue_with(id, |t| {
        t.policy = SchedPolicy::Deadline;
        t.dl_runtime = runtime_ns;
        t.dl_deadline = deadline_ns;
        t.dl_period = period_ns;
        t.dl_abs_deadline = crate::current_tick() + (deadline_ns / TICK_NS).max(1);
    })
}

/// Apply a mutation to a task, detaching and re-enqueueing around it when
/// the task sits in a scheduler structure.
fn requeue_with(id: TaskId, mutate: impl FnOnce(&mut Task)) -> Result<()> {
    let was_queued = {
        let mut table = task::table().lock();
        if !table.exists(id) {
            return Err(SchedError::NoSuchTask);
        }
        let home = table.get(id).cpu as usize;
        let queued = matches!(
            table.get(id).location,
            TaskLocation::RtQueue(_) | TaskLocation::CfsHeap | TaskLocation::DeadlineHeap
        );
        if queued {
            let mut pc = CPUS[home].lock();
            detach_locked(&mut table, &mut pc, home, id)?;
        }
        mutate(table.get_mut(id));
        queued
    };
    if was_queued {
        enqueue(id)?;
    }
    Ok(())
}

/// Deliver a signal to a task by unique id. `SIGKILL` terminates
/// immediately, detaching the task from whatever structure holds it; a
/// currently running task dies on its next tick. Fault signals (`SIGILL`,
/// `SIGTRAP`, `SIGBUS`, `SIGSEGV`) are fatal too unless the task installed
/// a handler. Everything else sets the pending bit unless blocked.
pub fn kill(pid: u32, signal: u32) -> Result<()> {
    const FAULT_SIGNALS: [u32; 4] = [4, 5, 7, 11]; // SIGILL SIGTRAP SIGBUS SIGSEGV

    if signal as usize >= task::NUM_SIGNALS {
        return Err(SchedError::InvalidState);
    }
    let mut table = task::table().lock();
    let id = table
        .find_by_unique_id(pid)
        .ok_or(SchedError::NoSuchTask)?;

    let fatal = signal == task::SIGKILL
        || (FAULT_SIGNALS.contains(&signal)
            && table.get(id).signals.handlers[signal as usize] == 0);
    if !fatal {
        let t = table.get_mut(id);
        if t.signals.blocked & (1 << signal) == 0 {
            t.signals.pending |= 1 << signal;
        }
        return Ok(());
    }

    // Fatal: detach from run structures or wait queue, then mark exited.
    let home = table.get(id).cpu as usize;
    match table.get(id).location {
        TaskLocation::RtQueue(_) | TaskLocation::CfsHeap | TaskLocation::DeadlineHeap => {
            let mut pc = CPUS[home].lock();
            detach_locked(&mut table, &mut pc, home, id)?;
        }
        TaskLocation::WaitQueue => {
            let wq = table.get(id).wait_channel;
            if !wq.is_null() {
                // SAFETY: wait channels reference live queues; links are
                // only touched under the table lock we hold.
                let wq = unsafe { &mut *wq };
                let _ = wq.remove(&mut table, id);
            }
        }
        TaskLocation::Running | TaskLocation::NotQueued => {}
    }
    table.mark_exited(id, -(signal as i32));
    let running_remote = table.get(id).location == TaskLocation::Running;
    drop(table);
    {
        let mut joiners = task::join_queue(id).lock();
        crate::wait::wake_all(&mut joiners);
    }
    if running_remote && home != arch::cpu_id() {
        ipi::send_ipi(home, IpiType::Reschedule);
    }
    Ok(())
}

/// Tear down all scheduler state. Test-only.
#[cfg(not(target_arch = "aarch64"))]
pub fn reset_for_test() {
    let mut table = task::table().lock();
    for c in 0..MAX_CPUS {
        let mut pc = CPUS[c].lock();
        *pc = PerCpuScheduler::new();
        QUEUE_COUNTS[c].store(0, Ordering::Relaxed);
        CPU_INITIALIZED[c].store(false, Ordering::Relaxed);
    }
    *table = TaskTable::new();
    CONTEXT_SWITCHES.store(0, Ordering::Relaxed);
    crate::balance::reset_for_test();
    crate::reset_ticks_for_test();
}
