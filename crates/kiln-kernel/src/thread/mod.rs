//! Thread control blocks and the table that owns them.
//!
//! The scheduler's ready queues hold [`ThreadId`]s, never the blocks
//! themselves; the [`ThreadTable`] is the single owner of every live
//! thread. The running thread is designated by the kernel's current-thread
//! id, and a finishing thread is destroyed from its successor's dispatch
//! epilogue, so no thread ever tears down its own state while using it.

pub mod scheduler;

use std::collections::BTreeMap;
use std::fmt;

use kiln_machine::cpu::{Cpu, ThreadContext, NUM_USER_REGS};

use scheduler::NUM_PRIORITY_LEVELS;

/// Monotonically assigned thread identifier.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ThreadId(u32);

impl ThreadId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn val(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    JustCreated,
    Ready,
    Running,
    Blocked,
    Zombie,
}

/// User address-space handle. Opaque to the scheduler: its only role is to
/// gate the save/restore of user machine state around context switches.
pub struct AddressSpace {
    page_table_base: u32,
}

impl AddressSpace {
    pub fn new(page_table_base: u32) -> Self {
        Self { page_table_base }
    }

    pub fn save_state(&mut self, cpu: &Cpu) {
        self.page_table_base = cpu.page_table_base;
    }

    pub fn restore_state(&self, cpu: &mut Cpu) {
        cpu.page_table_base = self.page_table_base;
    }
}

/// Thread control block.
pub struct Thread {
    id: ThreadId,
    name: String,
    /// Scheduling priority in `[0, 149]`. `priority / 50` selects the
    /// ready-queue band.
    pub(crate) priority: i32,
    /// Exponentially weighted estimate of the next CPU burst, in ticks.
    pub(crate) burst_estimate: f64,
    /// CPU ticks consumed since the last estimator update.
    pub(crate) cpu_burst: u64,
    /// `total_ticks` at the moment this thread last entered the CPU or a
    /// ready queue. Serves both aging and demotion bookkeeping.
    pub(crate) last_cpu_tick: u64,
    status: ThreadStatus,
    pub(crate) context: ThreadContext,
    user_registers: [u32; NUM_USER_REGS],
    space: Option<AddressSpace>,
}

impl Thread {
    fn new(id: ThreadId, name: String, priority: i32) -> Self {
        assert!(
            (0..NUM_PRIORITY_LEVELS).contains(&priority),
            "priority {} out of range",
            priority
        );
        Self {
            id,
            name,
            priority,
            burst_estimate: 0.0,
            cpu_burst: 0,
            last_cpu_tick: 0,
            status: ThreadStatus::JustCreated,
            context: ThreadContext::default(),
            user_registers: [0; NUM_USER_REGS],
            space: None,
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn set_priority(&mut self, priority: i32) {
        assert!(
            (0..NUM_PRIORITY_LEVELS).contains(&priority),
            "priority {} out of range",
            priority
        );
        self.priority = priority;
    }

    pub fn burst_estimate(&self) -> f64 {
        self.burst_estimate
    }

    pub fn set_burst_estimate(&mut self, estimate: f64) {
        self.burst_estimate = estimate;
    }

    pub fn cpu_burst(&self) -> u64 {
        self.cpu_burst
    }

    pub fn last_cpu_tick(&self) -> u64 {
        self.last_cpu_tick
    }

    pub fn status(&self) -> ThreadStatus {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: ThreadStatus) {
        self.status = status;
    }

    pub fn set_space(&mut self, space: Option<AddressSpace>) {
        self.space = space;
    }

    pub fn has_space(&self) -> bool {
        self.space.is_some()
    }

    pub(crate) fn save_user_state(&mut self, cpu: &Cpu) {
        self.user_registers = cpu.registers;
        if let Some(space) = self.space.as_mut() {
            space.save_state(cpu);
        }
    }

    pub(crate) fn restore_user_state(&self, cpu: &mut Cpu) {
        cpu.registers = self.user_registers;
        if let Some(space) = self.space.as_ref() {
            space.restore_state(cpu);
        }
    }
}

/// Owner of every live thread control block, keyed by id.
pub struct ThreadTable {
    threads: BTreeMap<ThreadId, Thread>,
    next_id: u32,
}

impl Default for ThreadTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadTable {
    pub fn new() -> Self {
        Self {
            threads: BTreeMap::new(),
            next_id: 0,
        }
    }

    /// Allocate a new thread in the `JustCreated` state.
    pub fn spawn(&mut self, name: impl Into<String>, priority: i32) -> ThreadId {
        let id = ThreadId::new(self.next_id);
        self.next_id += 1;
        self.threads.insert(id, Thread::new(id, name.into(), priority));
        id
    }

    pub fn get(&self, id: ThreadId) -> Option<&Thread> {
        self.threads.get(&id)
    }

    pub fn get_mut(&mut self, id: ThreadId) -> Option<&mut Thread> {
        self.threads.get_mut(&id)
    }

    pub(crate) fn remove(&mut self, id: ThreadId) -> Option<Thread> {
        self.threads.remove(&id)
    }

    pub fn contains(&self, id: ThreadId) -> bool {
        self.threads.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Thread> {
        self.threads.values()
    }
}
