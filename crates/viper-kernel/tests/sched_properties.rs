//! Scheduler property tests.
//!
//! Everything here drives the real scheduler through its public API on the
//! host: the mock IPI backend records deliveries and `prepare_switch` stands
//! in for the hardware context switch. Tests share global kernel state and
//! therefore serialize on one lock.

use std::sync::Mutex;

use viper_kernel::ipi::{self, test_support::RecordingBackend, IpiType};
use viper_kernel::sched::{self, QUEUE_COUNTS};
use viper_kernel::task::{self, SchedPolicy, TaskFlags, TaskId, TaskState};
use viper_kernel::{arch, balance, bandwidth, wait, SchedError};

static TEST_LOCK: Mutex<()> = Mutex::new(());
static IPIS: RecordingBackend = RecordingBackend::new();

fn setup() -> std::sync::MutexGuard<'static, ()> {
    let guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    ipi::set_backend(&IPIS);
    IPIS.take();
    sched::reset_for_test();
    arch::set_cpu_id(0);
    sched::init_cpu(0).unwrap();
    guard
}

fn noop(_arg: usize) {}

fn spawn_with(name: &str, policy: SchedPolicy, priority: u8) -> TaskId {
    let id = {
        let mut table = task::table().lock();
        let id = table.create(name, noop, 0, TaskFlags::KERNEL).unwrap();
        let t = table.get_mut(id);
        t.policy = policy;
        t.priority = priority;
        id
    };
    sched::enqueue_on_cpu(id, 0).unwrap();
    id
}

fn unique_id(id: TaskId) -> u32 {
    task::table().lock().get(id).id
}

#[test]
fn realtime_tasks_run_in_priority_order() {
    let _guard = setup();
    let low = spawn_with("low", SchedPolicy::Fifo, 200);
    let high = spawn_with("high", SchedPolicy::Fifo, 50);
    let mid = spawn_with("mid", SchedPolicy::Fifo, 100);

    let mut order = Vec::new();
    for _ in 0..3 {
        let decision = sched::prepare_switch(0).expect("a task is ready");
        order.push(decision.next);
        // Terminate so the next pick moves down the priority ladder.
        task::table().lock().mark_exited(decision.next, 0);
    }
    assert_eq!(order, vec![high, mid, low]);
    assert!(sched::validate_invariants());
}

#[test]
fn round_robin_keeps_the_cpu_over_fair_tasks() {
    let _guard = setup();
    let rr = spawn_with("rr", SchedPolicy::Rr, 100);
    let fair = spawn_with("fair", SchedPolicy::Other, 128);

    sched::schedule();
    assert_eq!(sched::current_on(0), Some(rr));

    // A full RR slice is 100 ticks; across 250 ticks the RR task must hold
    // the CPU the whole time (it re-queues ahead of any CFS task).
    for _ in 0..250 {
        sched::tick();
        assert_eq!(sched::current_on(0), Some(rr));
    }
    {
        let table = task::table().lock();
        assert_eq!(table.get(fair).cpu_ticks, 0);
        assert!(table.get(rr).cpu_ticks >= 250);
    }

    // Once the RR task exits, the fair task finally runs.
    task::table().lock().mark_exited(rr, 0);
    sched::schedule();
    assert_eq!(sched::current_on(0), Some(fair));
}

#[test]
fn cfs_picks_lowest_vruntime_and_min_vruntime_is_monotone() {
    let _guard = setup();
    // Keys must be in place before the heap insert.
    let (a, b) = {
        let mut table = task::table().lock();
        let a = table.create("a", noop, 0, TaskFlags::KERNEL).unwrap();
        table.get_mut(a).vruntime = 5_000_000;
        let b = table.create("b", noop, 0, TaskFlags::KERNEL).unwrap();
        table.get_mut(b).vruntime = 1_000_000;
        (a, b)
    };
    sched::enqueue_on_cpu(a, 0).unwrap();
    sched::enqueue_on_cpu(b, 0).unwrap();

    sched::schedule();
    assert_eq!(sched::current_on(0), Some(b), "lowest vruntime first");

    let mut last_min = sched::cpu_stats(0).min_vruntime;
    for _ in 0..500 {
        sched::tick();
        let now_min = sched::cpu_stats(0).min_vruntime;
        assert!(now_min >= last_min, "min_vruntime regressed");
        last_min = now_min;
    }
    // Both tasks made progress: CFS alternates as vruntimes leapfrog.
    let table = task::table().lock();
    assert!(table.get(a).cpu_ticks > 0);
    assert!(table.get(b).cpu_ticks > 0);
}

#[test]
fn sleeper_is_bumped_to_min_vruntime_not_rewarded() {
    let _guard = setup();
    let runner = spawn_with("runner", SchedPolicy::Other, 128);
    sched::schedule();
    for _ in 0..200 {
        sched::tick();
    }
    let floor = sched::cpu_stats(0).min_vruntime;
    assert!(floor > 0);

    // A task that slept the whole time enqueues at the floor, not at zero.
    let sleeper = spawn_with("sleeper", SchedPolicy::Other, 128);
    let table = task::table().lock();
    assert!(table.get(sleeper).vruntime >= floor);
    drop(table);
    let _ = runner;
}

#[test]
fn deadline_tasks_preempt_everything_else() {
    let _guard = setup();
    let fair = spawn_with("fair", SchedPolicy::Other, 128);
    sched::schedule();
    assert_eq!(sched::current_on(0), Some(fair));

    let dl = {
        let mut table = task::table().lock();
        let id = table.create("edf", noop, 0, TaskFlags::KERNEL).unwrap();
        id
    };
    sched::set_deadline(dl, 2_000_000, 10_000_000, 10_000_000).unwrap();
    sched::enqueue_on_cpu(dl, 0).unwrap();

    sched::tick();
    assert_eq!(sched::current_on(0), Some(dl));
}

#[test]
fn double_enqueue_is_rejected_and_harmless() {
    let _guard = setup();
    let t = spawn_with("t", SchedPolicy::Other, 128);
    assert_eq!(
        sched::enqueue_on_cpu(t, 0),
        Err(SchedError::InvalidState)
    );
    assert!(sched::validate_invariants());
}

#[test]
fn blocked_tasks_leave_scheduler_structures() {
    let _guard = setup();
    let t = spawn_with("t", SchedPolicy::Other, 128);
    sched::schedule();
    assert_eq!(sched::current_on(0), Some(t));

    let mut wq = wait::WaitQueue::new();
    wait::block_current(&mut wq, None).unwrap();
    sched::schedule();
    assert_ne!(sched::current_on(0), Some(t));
    {
        let table = task::table().lock();
        assert_eq!(table.get(t).state, TaskState::Blocked);
    }
    assert!(sched::validate_invariants());

    let woken = wait::wake_one(&mut wq);
    assert_eq!(woken, Some(t));
    {
        let table = task::table().lock();
        assert_eq!(table.get(t).state, TaskState::Ready);
    }
    assert!(!wait::consume_timeout(t), "plain wake is not a timeout");
    assert!(sched::validate_invariants());
}

#[test]
fn wait_queue_orders_by_priority_and_wakes_head_first() {
    let _guard = setup();
    let mut wq = wait::WaitQueue::new();
    let ids: Vec<TaskId> = [180u8, 40, 90, 220, 90]
        .iter()
        .enumerate()
        .map(|(i, &prio)| {
            let mut table = task::table().lock();
            let id = table
                .create("waiter", noop, i, TaskFlags::KERNEL)
                .unwrap();
            table.get_mut(id).priority = prio;
            id
        })
        .collect();
    {
        let mut table = task::table().lock();
        for &id in &ids {
            wq.insert(&mut table, id);
        }
        let priorities: Vec<u8> = wq.iter(&table).map(|id| table.get(id).priority).collect();
        let mut sorted = priorities.clone();
        sorted.sort();
        assert_eq!(priorities, sorted, "queue scan must be non-decreasing");
        assert_eq!(wq.len(), 5);
    }
    let first = wait::wake_one(&mut wq).unwrap();
    assert_eq!(task::table().lock().get(first).priority, 40);
    assert_eq!(wait::wake_all(&mut wq), 4);
    assert!(wq.is_empty());
}

#[test]
fn wait_timeout_wakes_with_sentinel() {
    let _guard = setup();
    let t = spawn_with("t", SchedPolicy::Other, 128);
    sched::schedule();
    assert_eq!(sched::current_on(0), Some(t));

    let mut wq = wait::WaitQueue::new();
    wait::block_current(&mut wq, Some(5)).unwrap();
    sched::schedule();

    for _ in 0..4 {
        sched::tick();
        assert_eq!(task::table().lock().get(t).state, TaskState::Blocked);
    }
    sched::tick();
    assert_eq!(task::table().lock().get(t).state, TaskState::Ready);
    assert!(wait::consume_timeout(t), "sweep wake must set the sentinel");
    assert!(wq.is_empty());
    assert!(sched::validate_invariants());
}

#[test]
fn bandwidth_caps_runtime_per_period() {
    let _guard = setup();
    let t = spawn_with("capped", SchedPolicy::Other, 128);
    // 50 ms of runtime per 100 ms period, at 1 ms ticks.
    bandwidth::set_budget(t, 50_000_000, 100_000_000);
    sched::schedule();
    assert_eq!(sched::current_on(0), Some(t));

    for _ in 0..100 {
        sched::tick();
    }
    let after_one_period = task::table().lock().get(t).cpu_ticks;
    assert!(
        after_one_period <= 51,
        "ran {after_one_period} ticks in a 100-tick window"
    );
    assert!(after_one_period >= 45, "throttle fired far too early");

    // The budget replenishes at the period boundary and the task runs again.
    for _ in 0..100 {
        sched::tick();
    }
    let after_two_periods = task::table().lock().get(t).cpu_ticks;
    assert!(after_two_periods > after_one_period);
    assert!(after_two_periods <= 102);
}

#[test]
fn load_balancing_converges_to_unit_spread() {
    let _guard = setup();
    sched::init_cpu(1).unwrap();

    for i in 0..6 {
        let id = {
            let mut table = task::table().lock();
            table
                .create("worker", noop, i, TaskFlags::KERNEL)
                .unwrap()
        };
        sched::enqueue_on_cpu(id, 0).unwrap();
    }
    // A realtime task must not be migrated by balancing.
    let rt = spawn_with("rt", SchedPolicy::Fifo, 60);

    assert_eq!(QUEUE_COUNTS[0].load(std::sync::atomic::Ordering::Relaxed), 7);
    for _ in 0..8 {
        balance::balance_once();
    }
    let c0 = QUEUE_COUNTS[0].load(std::sync::atomic::Ordering::Relaxed);
    let c1 = QUEUE_COUNTS[1].load(std::sync::atomic::Ordering::Relaxed);
    assert!(c0.abs_diff(c1) <= 1, "spread {c0}/{c1}");
    {
        let table = task::table().lock();
        assert_eq!(table.get(rt).cpu, 0, "RT tasks stay put");
    }
    assert!(sched::cpu_stats(0).steals > 0);
    assert!(sched::validate_invariants());
}

#[test]
fn remote_enqueue_sends_reschedule_ipi() {
    let _guard = setup();
    sched::init_cpu(1).unwrap();
    IPIS.take();

    let id = {
        let mut table = task::table().lock();
        table.create("remote", noop, 0, TaskFlags::KERNEL).unwrap()
    };
    sched::enqueue_on_cpu(id, 1).unwrap();
    let sent = IPIS.take();
    assert!(sent.contains(&(1, IpiType::Reschedule)), "{sent:?}");
}

#[test]
fn sigkill_terminates_queued_and_blocked_tasks() {
    let _guard = setup();
    let queued = spawn_with("queued", SchedPolicy::Other, 128);
    let queued_pid = unique_id(queued);

    sched::kill(queued_pid, task::SIGKILL).unwrap();
    {
        let table = task::table().lock();
        assert_eq!(table.get(queued).state, TaskState::Exited);
    }
    assert!(sched::validate_invariants());

    // Blocked victim: detached from its wait queue as well.
    let blocked = spawn_with("blocked", SchedPolicy::Other, 128);
    let blocked_pid = unique_id(blocked);
    sched::schedule();
    assert_eq!(sched::current_on(0), Some(blocked));
    let mut wq = wait::WaitQueue::new();
    wait::block_current(&mut wq, None).unwrap();
    sched::schedule();

    sched::kill(blocked_pid, task::SIGKILL).unwrap();
    assert!(wq.is_empty());
    assert_eq!(task::table().lock().get(blocked).state, TaskState::Exited);

    // Reap frees both slots.
    assert_eq!(task::table().lock().reap_exited(), 2);
}

#[test]
fn non_fatal_signals_set_pending_bits() {
    let _guard = setup();
    let t = spawn_with("sig", SchedPolicy::Other, 128);
    let pid = unique_id(t);
    sched::kill(pid, 15).unwrap();
    let table = task::table().lock();
    assert_eq!(table.get(t).signals.pending & (1 << 15), 1 << 15);
    assert_eq!(table.get(t).state, TaskState::Ready);
}

#[test]
fn policy_changes_move_tasks_between_structures() {
    let _guard = setup();
    let t = spawn_with("mover", SchedPolicy::Other, 128);
    sched::set_policy(t, SchedPolicy::Fifo).unwrap();
    {
        let table = task::table().lock();
        assert!(matches!(
            table.get(t).location,
            task::TaskLocation::RtQueue(_)
        ));
    }
    sched::set_priority(t, 10).unwrap();
    {
        let table = task::table().lock();
        assert_eq!(table.get(t).queue_index(), 0);
    }
    assert!(sched::validate_invariants());

    // The RT task now outranks CFS work at the schedule boundary.
    let decision = sched::prepare_switch(0).unwrap();
    assert_eq!(decision.next, t);
}
