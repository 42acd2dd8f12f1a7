//! The kiln kernel: a multi-level thread scheduler and a hierarchical file
//! system over a simulated machine.
//!
//! The kernel is single-CPU and cooperative. Mutual exclusion on scheduler
//! and file-system state comes solely from disabling interrupts around each
//! operation; control crosses between threads only at the context-switch
//! primitive, reached through an explicit yield, a sleep, a finish, or a
//! yield-on-return requested from the timer handler.

pub mod error;
pub mod fs;
pub mod thread;

pub use error::KernelError;

use fs::{FileSystem, OpenFileId};
use kiln_machine::{IntStatus, Machine, TIMER_INTERVAL_TICKS};
use log::{debug, error, info};
use thread::scheduler::{Scheduler, SchedulerLog};
use thread::{ThreadId, ThreadStatus, ThreadTable};

/// Process-wide kernel state: the machine handle, the thread table, the
/// scheduler, the mounted file system, and the running thread. Passed
/// around explicitly; there are no globals.
pub struct Kernel {
    pub machine: Machine,
    pub threads: ThreadTable,
    pub scheduler: Scheduler,
    pub file_system: Option<FileSystem>,
    current: Option<ThreadId>,
}

impl Kernel {
    pub fn new(machine: Machine) -> Self {
        Self::with_scheduler_log(machine, SchedulerLog::stdout())
    }

    pub fn with_scheduler_log(machine: Machine, log: SchedulerLog) -> Self {
        Self {
            machine,
            threads: ThreadTable::new(),
            scheduler: Scheduler::new(log),
            file_system: None,
            current: None,
        }
    }

    /// Format the disk and mount the resulting file system.
    pub fn format_file_system(&mut self) -> Result<(), KernelError> {
        self.file_system = Some(FileSystem::format(&mut self.machine.disk)?);
        Ok(())
    }

    /// Mount an already formatted disk.
    pub fn mount_file_system(&mut self) -> Result<(), KernelError> {
        self.file_system = Some(FileSystem::mount(&mut self.machine.disk)?);
        Ok(())
    }

    pub fn current_thread(&self) -> Option<ThreadId> {
        self.current
    }

    /// Register the bootstrap thread: the one already running when the
    /// kernel comes up. It never goes through `fork`.
    pub fn start_main_thread(&mut self, name: impl Into<String>, priority: i32) -> ThreadId {
        assert!(self.current.is_none(), "main thread already started");
        let id = self.threads.spawn(name, priority);
        let thread = self.threads.get_mut(id).unwrap();
        thread.set_status(ThreadStatus::Running);
        thread.last_cpu_tick = self.machine.stats.total_ticks;
        self.current = Some(id);
        id
    }

    /// Allocate a thread in the `JustCreated` state. It does not become
    /// schedulable until [`Kernel::fork`].
    pub fn spawn_thread(&mut self, name: impl Into<String>, priority: i32) -> ThreadId {
        self.threads.spawn(name, priority)
    }

    /// Make a created thread schedulable.
    pub fn fork(&mut self, id: ThreadId) {
        let old_level = self.machine.interrupt.set_level(IntStatus::Off);
        self.scheduler
            .ready_to_run(&mut self.threads, &mut self.machine, self.current, id);
        self.machine.interrupt.set_level(old_level);
    }

    /// Voluntarily relinquish the CPU. The current thread goes back to its
    /// ready queue; if anything else is runnable, it is dispatched.
    pub fn yield_current(&mut self) {
        let old_level = self.machine.interrupt.set_level(IntStatus::Off);
        let current = self.current.expect("yield without a running thread");
        debug!(
            "yielding thread {}",
            self.threads.get(current).unwrap().name()
        );

        if let Some(next) = self
            .scheduler
            .find_next_to_run(&self.threads, &self.machine)
        {
            self.scheduler
                .ready_to_run(&mut self.threads, &mut self.machine, self.current, current);
            self.scheduler.run(
                &mut self.threads,
                &mut self.machine,
                &mut self.current,
                next,
                false,
            );
        }
        self.machine.interrupt.set_level(old_level);
    }

    /// Block the current thread until [`Kernel::wake`].
    pub fn block_current(&mut self) {
        let old_level = self.machine.interrupt.set_level(IntStatus::Off);
        self.sleep_current(false);
        self.machine.interrupt.set_level(old_level);
    }

    /// Terminate the current thread. Its control block is destroyed from
    /// the successor's dispatch epilogue, never from its own.
    pub fn finish_current(&mut self) {
        let old_level = self.machine.interrupt.set_level(IntStatus::Off);
        self.sleep_current(true);
        self.machine.interrupt.set_level(old_level);
    }

    /// Relinquish the CPU without requeueing the current thread. With
    /// `finishing` the thread becomes a zombie awaiting destruction,
    /// otherwise it blocks. Requires interrupts off.
    fn sleep_current(&mut self, finishing: bool) {
        assert_eq!(self.machine.interrupt.level(), IntStatus::Off);
        let current = self.current.expect("sleep without a running thread");
        self.threads.get_mut(current).unwrap().set_status(if finishing {
            ThreadStatus::Zombie
        } else {
            ThreadStatus::Blocked
        });

        match self
            .scheduler
            .find_next_to_run(&self.threads, &self.machine)
        {
            Some(next) => {
                self.scheduler.run(
                    &mut self.threads,
                    &mut self.machine,
                    &mut self.current,
                    next,
                    finishing,
                );
            }
            None if finishing => {
                // The last runnable thread is gone: the machine halts.
                info!("no threads ready; halting. {}", self.machine.stats);
                self.threads.remove(current);
                self.current = None;
                self.machine.interrupt.halt();
            }
            None => {
                panic!("deadlock: current thread blocked with no ready threads");
            }
        }
    }

    /// Unblock a sleeping thread.
    pub fn wake(&mut self, id: ThreadId) {
        let old_level = self.machine.interrupt.set_level(IntStatus::Off);
        assert_eq!(self.threads.get(id).unwrap().status(), ThreadStatus::Blocked);
        self.scheduler
            .ready_to_run(&mut self.threads, &mut self.machine, self.current, id);
        self.machine.interrupt.set_level(old_level);
    }

    /// The periodic timer handler: advance the clock, age the ready
    /// queues, check the running thread for demotion, and honor a pending
    /// yield request at interrupt return.
    pub fn timer_interrupt(&mut self) {
        let old_level = self.machine.interrupt.set_level(IntStatus::Off);
        self.machine.stats.advance(TIMER_INTERVAL_TICKS);
        self.machine.stats.system_ticks += TIMER_INTERVAL_TICKS;

        self.scheduler
            .aging(&mut self.threads, &mut self.machine, self.current);
        if let Some(current) = self.current {
            self.scheduler
                .demote(&mut self.threads, &mut self.machine, current);
        }

        let wants_yield = self.machine.interrupt.take_yield_request();
        self.machine.interrupt.set_level(old_level);

        // The switch happens at interrupt return, never inside the handler.
        if wants_yield && self.current.is_some() {
            self.yield_current();
        }
    }

    pub fn halted(&self) -> bool {
        self.machine.interrupt.halted()
    }

    // ------------------------------------------------------------------
    // System-call surface. Recoverable failures come back in-band: false,
    // 0, or -1 depending on the call. I/O errors against the simulated
    // disk are logged and mapped to the same failure returns.
    // ------------------------------------------------------------------

    pub fn sys_create(&mut self, path: &str, initial_size: u32) -> bool {
        let Some(fs) = self.file_system.as_mut() else {
            return false;
        };
        match fs.create(&mut self.machine.disk, path, initial_size, false) {
            Ok(created) => created,
            Err(e) => {
                error!("create {}: {}", path, e);
                false
            }
        }
    }

    pub fn sys_open(&mut self, path: &str) -> OpenFileId {
        let Some(fs) = self.file_system.as_mut() else {
            return 0;
        };
        match fs.open_id(&mut self.machine.disk, path) {
            Ok(id) => id,
            Err(e) => {
                error!("open {}: {}", path, e);
                0
            }
        }
    }

    pub fn sys_read(&mut self, buf: &mut [u8], id: OpenFileId) -> i32 {
        let Some(fs) = self.file_system.as_mut() else {
            return -1;
        };
        match fs.read(&mut self.machine.disk, buf, id) {
            Ok(count) => count,
            Err(e) => {
                error!("read fd {}: {}", id, e);
                -1
            }
        }
    }

    pub fn sys_write(&mut self, buf: &[u8], id: OpenFileId) -> i32 {
        let Some(fs) = self.file_system.as_mut() else {
            return -1;
        };
        match fs.write(&mut self.machine.disk, buf, id) {
            Ok(count) => count,
            Err(e) => {
                error!("write fd {}: {}", id, e);
                -1
            }
        }
    }

    pub fn sys_close(&mut self, id: OpenFileId) -> i32 {
        match self.file_system.as_mut() {
            Some(fs) => fs.close(id),
            None => -1,
        }
    }

    pub fn sys_yield(&mut self) {
        self.yield_current();
    }

    pub fn sys_halt(&mut self) {
        info!("machine halting. {}", self.machine.stats);
        self.machine.interrupt.halt();
    }

    pub fn sys_print_int(&mut self, value: i32) {
        let _ = self.machine.console.put_string(&format!("{}\n", value));
    }
}
