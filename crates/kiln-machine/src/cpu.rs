use log::trace;

/// Simulated user-mode registers (general registers plus the handful of
/// status registers a user program owns).
pub const NUM_USER_REGS: usize = 40;

/// Callee-saved registers preserved across a context switch.
const NUM_CALLEE_SAVED: usize = 8;

/// Per-thread saved execution context. Filled in by [`Cpu::switch`] when a
/// thread is switched out, consumed when it is switched back in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ThreadContext {
    pub pc: u32,
    pub sp: u32,
    pub callee_saved: [u32; NUM_CALLEE_SAVED],
}

impl ThreadContext {
    pub fn new(entry_point: u32, stack_top: u32) -> Self {
        Self {
            pc: entry_point,
            sp: stack_top,
            callee_saved: [0; NUM_CALLEE_SAVED],
        }
    }
}

/// CPU register state. The interpreter that would advance `registers` lives
/// outside this crate; the kernel saves and restores them around switches.
pub struct Cpu {
    pub registers: [u32; NUM_USER_REGS],
    pub page_table_base: u32,
    current: ThreadContext,
    context_switches: u64,
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

impl Cpu {
    pub fn new() -> Self {
        Self {
            registers: [0; NUM_USER_REGS],
            page_table_base: 0,
            current: ThreadContext::default(),
            context_switches: 0,
        }
    }

    /// The SWITCH primitive: store the running context into `old`, load
    /// `new`. Callers must have interrupts disabled; the scheduler asserts
    /// this on both sides of the call.
    pub fn switch(&mut self, old: &mut ThreadContext, new: &ThreadContext) {
        *old = self.current;
        self.current = *new;
        self.context_switches += 1;
        trace!("context switch #{}", self.context_switches);
    }

    pub fn context_switches(&self) -> u64 {
        self.context_switches
    }
}
