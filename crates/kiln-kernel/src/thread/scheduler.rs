//! Multi-level thread scheduler.
//!
//! Ready threads live in one of three queues selected by `priority / 50`:
//! L1 (priority 100-149) dispatches shortest-estimated-burst first, L2
//! (50-99) highest priority first, L3 (0-49) in FIFO order. Dispatch always
//! drains L1 before L2 before L3. Aging raises the priority of threads that
//! have waited 1500 ticks without CPU; demotion drops the priority of a
//! running thread that has monopolised the CPU past its limit. All entry
//! points require interrupts to be disabled by the caller; on a
//! uniprocessor that is the only mutual exclusion needed.

use std::collections::VecDeque;
use std::io::{self, Write};

use kiln_machine::{IntStatus, Machine};
use log::debug;

use super::{Thread, ThreadId, ThreadStatus, ThreadTable};

/// Width of one priority band.
pub const LEVEL_GAP: i32 = 50;

/// Priorities are `0..NUM_PRIORITY_LEVELS`.
pub const NUM_PRIORITY_LEVELS: i32 = 150;

/// A ready thread denied the CPU this long gets a priority boost.
pub const AGING_LIMIT_TICKS: u64 = 1500;

/// Size of one aging boost.
pub const AGING_BOOST: i32 = 10;

/// A running thread that holds the CPU this long is demoted one band.
pub const DEMOTE_LIMIT_TICKS: u64 = 1500;

/// Weight of the newest observed burst in the SJF estimator.
pub const BURST_ALPHA: f64 = 0.5;

const LEVEL_ROUND_ROBIN: usize = 0;
const LEVEL_PRIORITY: usize = 1;
const LEVEL_SJF: usize = 2;

/// Band index for a priority. 0 = round robin, 1 = priority, 2 = SJF.
pub(crate) fn level_of(priority: i32) -> usize {
    (priority / LEVEL_GAP) as usize
}

fn sjf_precedes(a: &Thread, b: &Thread) -> bool {
    a.burst_estimate < b.burst_estimate
        || (a.burst_estimate == b.burst_estimate && a.id() < b.id())
}

fn priority_precedes(a: &Thread, b: &Thread) -> bool {
    a.priority > b.priority || (a.priority == b.priority && a.id() < b.id())
}

/// The capability each ready queue honours. Sort keys are captured at
/// insertion time; aging removes and re-inserts a thread whenever its key
/// changes, so queues never go stale.
pub trait ReadyQueue {
    fn insert(&mut self, thread: &Thread);
    fn pop(&mut self) -> Option<ThreadId>;
    fn remove(&mut self, id: ThreadId) -> bool;
    /// Queued ids in dispatch order.
    fn ids(&self) -> Vec<ThreadId>;
    fn is_empty(&self) -> bool;

    fn contains(&self, id: ThreadId) -> bool {
        self.ids().contains(&id)
    }
}

/// L1: ascending burst estimate, ties broken by ascending id.
#[derive(Default)]
struct SjfQueue {
    entries: Vec<(f64, ThreadId)>,
}

impl ReadyQueue for SjfQueue {
    fn insert(&mut self, thread: &Thread) {
        let key = (thread.burst_estimate, thread.id());
        let at = self
            .entries
            .iter()
            .position(|&(est, id)| est > key.0 || (est == key.0 && id > key.1))
            .unwrap_or(self.entries.len());
        self.entries.insert(at, key);
    }

    fn pop(&mut self) -> Option<ThreadId> {
        if self.entries.is_empty() {
            None
        } else {
            Some(self.entries.remove(0).1)
        }
    }

    fn remove(&mut self, id: ThreadId) -> bool {
        match self.entries.iter().position(|&(_, queued)| queued == id) {
            Some(at) => {
                self.entries.remove(at);
                true
            }
            None => false,
        }
    }

    fn ids(&self) -> Vec<ThreadId> {
        self.entries.iter().map(|&(_, id)| id).collect()
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// L2: descending priority, ties broken by ascending id.
#[derive(Default)]
struct PriorityQueue {
    entries: Vec<(i32, ThreadId)>,
}

impl ReadyQueue for PriorityQueue {
    fn insert(&mut self, thread: &Thread) {
        let key = (thread.priority, thread.id());
        let at = self
            .entries
            .iter()
            .position(|&(pri, id)| pri < key.0 || (pri == key.0 && id > key.1))
            .unwrap_or(self.entries.len());
        self.entries.insert(at, key);
    }

    fn pop(&mut self) -> Option<ThreadId> {
        if self.entries.is_empty() {
            None
        } else {
            Some(self.entries.remove(0).1)
        }
    }

    fn remove(&mut self, id: ThreadId) -> bool {
        match self.entries.iter().position(|&(_, queued)| queued == id) {
            Some(at) => {
                self.entries.remove(at);
                true
            }
            None => false,
        }
    }

    fn ids(&self) -> Vec<ThreadId> {
        self.entries.iter().map(|&(_, id)| id).collect()
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// L3: plain FIFO.
#[derive(Default)]
struct RoundRobinQueue {
    queue: VecDeque<ThreadId>,
}

impl ReadyQueue for RoundRobinQueue {
    fn insert(&mut self, thread: &Thread) {
        self.queue.push_back(thread.id());
    }

    fn pop(&mut self) -> Option<ThreadId> {
        self.queue.pop_front()
    }

    fn remove(&mut self, id: ThreadId) -> bool {
        match self.queue.iter().position(|&queued| queued == id) {
            Some(at) => {
                self.queue.remove(at);
                true
            }
            None => false,
        }
    }

    fn ids(&self) -> Vec<ThreadId> {
        self.queue.iter().copied().collect()
    }

    fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Sink for the scheduling trace: one line per queue insertion, removal,
/// and priority change. Kept separate from the `log` facade because tests
/// and graders consume these lines verbatim.
pub struct SchedulerLog {
    out: Box<dyn Write + Send>,
}

impl SchedulerLog {
    pub fn stdout() -> Self {
        Self {
            out: Box::new(io::stdout()),
        }
    }

    /// Discard the trace.
    pub fn sink() -> Self {
        Self {
            out: Box::new(io::sink()),
        }
    }

    pub fn to_writer(out: impl Write + Send + 'static) -> Self {
        Self { out: Box::new(out) }
    }

    fn inserted(&mut self, tick: u64, thread: &Thread, level: usize) {
        let _ = writeln!(
            self.out,
            "Tick {}: Thread {} is inserted into queue L{} (EST: {:.6}, PRI: {})",
            tick,
            thread.id(),
            3 - level,
            thread.burst_estimate,
            thread.priority
        );
    }

    fn removed(&mut self, tick: u64, thread: &Thread, level: usize) {
        let _ = writeln!(
            self.out,
            "Tick {}: Thread {} is removed from queue L{} (EST: {:.6}, PRI: {})",
            tick,
            thread.id(),
            3 - level,
            thread.burst_estimate,
            thread.priority
        );
    }

    fn priority_changed(&mut self, tick: u64, id: ThreadId, old: i32, new: i32) {
        let _ = writeln!(
            self.out,
            "Tick {}: Thread {} changes its priority from {} to {}",
            tick, id, old, new
        );
    }
}

pub struct Scheduler {
    sjf: SjfQueue,
    priority: PriorityQueue,
    round_robin: RoundRobinQueue,
    /// One-slot delayed-destruction queue: a finishing thread is parked
    /// here so its successor tears it down after the switch completes.
    to_be_destroyed: Option<ThreadId>,
    log: SchedulerLog,
}

impl Scheduler {
    pub fn new(log: SchedulerLog) -> Self {
        Self {
            sjf: SjfQueue::default(),
            priority: PriorityQueue::default(),
            round_robin: RoundRobinQueue::default(),
            to_be_destroyed: None,
            log,
        }
    }

    fn queue_mut(&mut self, level: usize) -> &mut dyn ReadyQueue {
        match level {
            LEVEL_ROUND_ROBIN => &mut self.round_robin,
            LEVEL_PRIORITY => &mut self.priority,
            LEVEL_SJF => &mut self.sjf,
            _ => unreachable!("no queue for level {}", level),
        }
    }

    fn queue(&self, level: usize) -> &dyn ReadyQueue {
        match level {
            LEVEL_ROUND_ROBIN => &self.round_robin,
            LEVEL_PRIORITY => &self.priority,
            LEVEL_SJF => &self.sjf,
            _ => unreachable!("no queue for level {}", level),
        }
    }

    /// Mark a thread ready and queue it in the band selected by its
    /// priority. If the newcomer would preempt the current thread, request
    /// a yield at interrupt return. Returns the band index.
    pub fn ready_to_run(
        &mut self,
        threads: &mut ThreadTable,
        machine: &mut Machine,
        current: Option<ThreadId>,
        id: ThreadId,
    ) -> usize {
        assert_eq!(machine.interrupt.level(), IntStatus::Off);
        let tick = machine.stats.total_ticks;

        let level = {
            let thread = threads.get_mut(id).unwrap();
            debug!("putting thread {} on ready list", thread.name());
            assert!(
                (0..NUM_PRIORITY_LEVELS).contains(&thread.priority),
                "priority {} out of range",
                thread.priority
            );
            thread.last_cpu_tick = tick;
            level_of(thread.priority)
        };

        let thread = threads.get(id).unwrap();
        self.queue_mut(level).insert(thread);
        self.log.inserted(tick, thread, level);
        threads.get_mut(id).unwrap().set_status(ThreadStatus::Ready);

        if let Some(current) = current.filter(|&current| current != id) {
            let current = threads.get(current).unwrap();
            let newcomer = threads.get(id).unwrap();
            if Self::is_preempted(current, newcomer) {
                machine.interrupt.yield_on_return();
            }
        }

        level
    }

    /// Pop the next thread to dispatch: the front of the highest non-empty
    /// queue, L1 before L2 before L3.
    pub fn find_next_to_run(
        &mut self,
        threads: &ThreadTable,
        machine: &Machine,
    ) -> Option<ThreadId> {
        assert_eq!(machine.interrupt.level(), IntStatus::Off);

        let level = if !self.sjf.is_empty() {
            LEVEL_SJF
        } else if !self.priority.is_empty() {
            LEVEL_PRIORITY
        } else if !self.round_robin.is_empty() {
            LEVEL_ROUND_ROBIN
        } else {
            return None;
        };

        let id = self.queue_mut(level).pop().unwrap();
        self.log
            .removed(machine.stats.total_ticks, threads.get(id).unwrap(), level);
        Some(id)
    }

    /// Dispatch `next`. The caller has already moved the current thread out
    /// of the `Running` state (to `Ready`, `Blocked`, or `Zombie`). With
    /// `finishing`, the outgoing thread is parked for destruction and torn
    /// down after the switch, from the successor's side.
    pub fn run(
        &mut self,
        threads: &mut ThreadTable,
        machine: &mut Machine,
        current: &mut Option<ThreadId>,
        next: ThreadId,
        finishing: bool,
    ) {
        let old = current.expect("dispatch without a current thread");
        assert_eq!(machine.interrupt.level(), IntStatus::Off);

        if finishing {
            assert!(self.to_be_destroyed.is_none(), "pending destroy already set");
            self.to_be_destroyed = Some(old);
        }

        {
            let old_thread = threads.get_mut(old).unwrap();
            if old_thread.has_space() {
                old_thread.save_user_state(&machine.cpu);
            }
        }

        {
            let next_thread = threads.get_mut(next).unwrap();
            next_thread.set_status(ThreadStatus::Running);
            next_thread.last_cpu_tick = machine.stats.total_ticks;
        }
        *current = Some(next);

        debug!(
            "switching from {} to {}",
            threads.get(old).unwrap().name(),
            threads.get(next).unwrap().name()
        );

        let mut old_context = threads.get(old).unwrap().context;
        let next_context = threads.get(next).unwrap().context;
        machine.cpu.switch(&mut old_context, &next_context);
        threads.get_mut(old).unwrap().context = old_context;

        // Back on the successor's side of the switch.
        assert_eq!(machine.interrupt.level(), IntStatus::Off);
        self.check_to_be_destroyed(threads);

        let now_current = threads.get(next).unwrap();
        if now_current.has_space() {
            now_current.restore_user_state(&mut machine.cpu);
        }
    }

    /// Tear down a thread parked by a finishing `run`. Runs on the
    /// successor's side, never on the finishing thread's own state.
    pub fn check_to_be_destroyed(&mut self, threads: &mut ThreadTable) {
        if let Some(id) = self.to_be_destroyed.take() {
            let thread = threads.remove(id).unwrap();
            debug!("destroying thread {}", thread.name());
        }
    }

    /// Periodic starvation relief: every ready thread denied the CPU for
    /// [`AGING_LIMIT_TICKS`] gets a [`AGING_BOOST`] priority raise,
    /// saturating at the top priority. A boosted thread whose priority now
    /// reaches the priority or SJF bands is re-queued accordingly; one that
    /// stays in the round-robin band keeps its place and only has its wait
    /// clock reset.
    pub fn aging(
        &mut self,
        threads: &mut ThreadTable,
        machine: &mut Machine,
        current: Option<ThreadId>,
    ) {
        assert_eq!(machine.interrupt.level(), IntStatus::Off);
        let tick = machine.stats.total_ticks;

        for level in [LEVEL_ROUND_ROBIN, LEVEL_PRIORITY, LEVEL_SJF] {
            for id in self.queue(level).ids() {
                let new_priority = {
                    let thread = threads.get_mut(id).unwrap();
                    if tick - thread.last_cpu_tick < AGING_LIMIT_TICKS {
                        continue;
                    }
                    let old_priority = thread.priority;
                    thread.priority =
                        (old_priority + AGING_BOOST).min(NUM_PRIORITY_LEVELS - 1);
                    self.log
                        .priority_changed(tick, id, old_priority, thread.priority);
                    thread.priority
                };

                if new_priority >= LEVEL_GAP {
                    let removed = self.queue_mut(level).remove(id);
                    debug_assert!(removed);
                    self.log.removed(tick, threads.get(id).unwrap(), level);
                    self.ready_to_run(threads, machine, current, id);
                } else {
                    // Stays in the round-robin band; reset the wait clock so
                    // the next boost is another full aging interval away.
                    threads.get_mut(id).unwrap().last_cpu_tick = tick;
                }
            }
        }
    }

    /// Monopolisation penalty for the running thread. Once its continuous
    /// burst reaches [`DEMOTE_LIMIT_TICKS`], the burst is folded into the
    /// SJF estimate, and a thread in the priority or SJF bands drops to the
    /// top of the next band down and must yield at interrupt return.
    pub fn demote(
        &mut self,
        threads: &mut ThreadTable,
        machine: &mut Machine,
        current: ThreadId,
    ) {
        assert_eq!(machine.interrupt.level(), IntStatus::Off);
        let tick = machine.stats.total_ticks;

        let change = {
            let thread = threads.get_mut(current).unwrap();
            let burst = tick - thread.last_cpu_tick;
            if burst < DEMOTE_LIMIT_TICKS {
                return;
            }
            thread.last_cpu_tick = tick;
            thread.cpu_burst += burst;
            thread.burst_estimate = BURST_ALPHA * thread.cpu_burst as f64
                + (1.0 - BURST_ALPHA) * thread.burst_estimate;
            thread.cpu_burst = 0;

            let level = level_of(thread.priority);
            if level > 0 {
                let old_priority = thread.priority;
                thread.priority = level as i32 * LEVEL_GAP - 1;
                Some((old_priority, thread.priority))
            } else {
                None
            }
        };

        if let Some((old_priority, new_priority)) = change {
            machine.interrupt.yield_on_return();
            self.log
                .priority_changed(tick, current, old_priority, new_priority);
        }
    }

    /// Would `newcomer` preempt `current`? Inside the SJF band both threads
    /// compare by burst estimate; anywhere else by priority. Ties always
    /// break towards the smaller id, so the relation is a strict order
    /// within one decision band.
    pub fn is_preempted(current: &Thread, newcomer: &Thread) -> bool {
        let sjf_floor = LEVEL_GAP * 2;
        if current.priority >= sjf_floor && newcomer.priority >= sjf_floor {
            sjf_precedes(newcomer, current)
        } else {
            priority_precedes(newcomer, current)
        }
    }

    /// Band the thread is currently queued in, if it is queued at all.
    pub fn queued_level(&self, id: ThreadId) -> Option<usize> {
        [LEVEL_ROUND_ROBIN, LEVEL_PRIORITY, LEVEL_SJF]
            .into_iter()
            .find(|&level| self.queue(level).contains(id))
    }

    /// Queued ids of one band, in dispatch order.
    pub fn queued_ids(&self, level: usize) -> Vec<ThreadId> {
        self.queue(level).ids()
    }

    pub fn has_ready_threads(&self) -> bool {
        !self.sjf.is_empty() || !self.priority.is_empty() || !self.round_robin.is_empty()
    }

    pub fn pending_destroy(&self) -> Option<ThreadId> {
        self.to_be_destroyed
    }
}
