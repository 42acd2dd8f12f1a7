//! The simulated hardware the kernel runs against: a sector disk, a CPU
//! register file with a context-switch primitive, an interrupt controller,
//! a tick counter, and a console. The instruction interpreter itself is out
//! of scope; the kernel only consumes the contracts collected here.

pub mod console;
pub mod cpu;
pub mod disk;
pub mod interrupt;
pub mod stats;

pub use console::Console;
pub use cpu::{Cpu, ThreadContext, NUM_USER_REGS};
pub use disk::{Disk, NUM_SECTORS, SECTOR_SIZE};
pub use interrupt::{IntStatus, Interrupt};
pub use stats::{Statistics, TIMER_INTERVAL_TICKS};

/// All simulated hardware, reachable through one handle. The kernel passes
/// this around explicitly instead of going through globals.
pub struct Machine {
    pub cpu: Cpu,
    pub disk: Disk,
    pub interrupt: Interrupt,
    pub stats: Statistics,
    pub console: Console,
}

impl Machine {
    pub fn new(disk: Disk) -> Self {
        Self {
            cpu: Cpu::new(),
            disk,
            interrupt: Interrupt::new(),
            stats: Statistics::new(),
            console: Console::stdout(),
        }
    }
}
