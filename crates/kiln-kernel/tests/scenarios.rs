//! End-to-end scenarios driving the kernel the way the simulated machine
//! would: threads forked and dispatched through the scheduler, files pushed
//! through the on-disk structures.

use std::io::Write;
use std::sync::{Arc, Mutex};

use kiln_fs::DIRECTORY_FILE_SIZE;
use kiln_kernel::fs::FileSystem;
use kiln_kernel::thread::scheduler::{SchedulerLog, AGING_LIMIT_TICKS};
use kiln_kernel::Kernel;
use kiln_machine::{Disk, IntStatus, Machine, TIMER_INTERVAL_TICKS};

/// Captures the scheduler trace so assertions can read it back.
#[derive(Clone, Default)]
struct SharedTrace(Arc<Mutex<Vec<u8>>>);

impl SharedTrace {
    fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl Write for SharedTrace {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn quiet_kernel() -> Kernel {
    Kernel::with_scheduler_log(Machine::new(Disk::in_memory()), SchedulerLog::sink())
}

fn traced_kernel() -> (Kernel, SharedTrace) {
    let trace = SharedTrace::default();
    let kernel = Kernel::with_scheduler_log(
        Machine::new(Disk::in_memory()),
        SchedulerLog::to_writer(trace.clone()),
    );
    (kernel, trace)
}

#[test]
fn fifo_dispatch_in_the_round_robin_band() {
    let mut kernel = quiet_kernel();
    kernel.start_main_thread("main", 0);
    let t1 = kernel.spawn_thread("t1", 0);
    let t2 = kernel.spawn_thread("t2", 0);
    let t3 = kernel.spawn_thread("t3", 0);
    for id in [t1, t2, t3] {
        kernel.fork(id);
    }

    // Dispatch follows insertion order exactly.
    kernel.yield_current();
    assert_eq!(kernel.current_thread(), Some(t1));
    kernel.yield_current();
    assert_eq!(kernel.current_thread(), Some(t2));
    kernel.yield_current();
    assert_eq!(kernel.current_thread(), Some(t3));
}

#[test]
fn a_higher_priority_arrival_preempts_at_interrupt_return() {
    let mut kernel = quiet_kernel();
    let t1 = kernel.start_main_thread("t1", 60);
    let t2 = kernel.spawn_thread("t2", 90);
    kernel.fork(t2);

    // The handler only sets the bit; t1 keeps the CPU until the return.
    assert_eq!(kernel.current_thread(), Some(t1));
    assert!(kernel.machine.interrupt.yield_requested());

    kernel.timer_interrupt();
    assert_eq!(kernel.current_thread(), Some(t2));
}

#[test]
fn sjf_band_dispatches_shortest_estimate_first() {
    let mut kernel = quiet_kernel();
    kernel.start_main_thread("main", 0);

    // Pad the id sequence so the tie-break threads get distinct ids:
    // a has id 2, b has id 5, c has id 1.
    let c = kernel.spawn_thread("c", 120);
    let a = kernel.spawn_thread("a", 120);
    kernel.spawn_thread("pad3", 0);
    kernel.spawn_thread("pad4", 0);
    let b = kernel.spawn_thread("b", 120);
    assert_eq!(a.val(), 2);
    assert_eq!(b.val(), 5);
    assert_eq!(c.val(), 1);

    kernel.threads.get_mut(a).unwrap().set_burst_estimate(5.0);
    kernel.threads.get_mut(b).unwrap().set_burst_estimate(3.0);
    kernel.threads.get_mut(c).unwrap().set_burst_estimate(3.0);
    for id in [a, b, c] {
        kernel.fork(id);
    }

    kernel.machine.interrupt.set_level(IntStatus::Off);
    let first = kernel
        .scheduler
        .find_next_to_run(&kernel.threads, &kernel.machine);
    let second = kernel
        .scheduler
        .find_next_to_run(&kernel.threads, &kernel.machine);
    let third = kernel
        .scheduler
        .find_next_to_run(&kernel.threads, &kernel.machine);
    kernel.machine.interrupt.set_level(IntStatus::On);

    assert_eq!(first, Some(c));
    assert_eq!(second, Some(b));
    assert_eq!(third, Some(a));
}

#[test]
fn aging_crosses_the_band_boundary_and_traces_the_moves() {
    let (mut kernel, trace) = traced_kernel();
    // Same priority as the newcomer: the id tie-break keeps main running,
    // so the starved thread stays queued in L3 the whole time.
    kernel.start_main_thread("main", 45);
    let starved = kernel.spawn_thread("starved", 45);
    kernel.fork(starved);
    assert!(!kernel.machine.interrupt.yield_requested());

    // Sit through a full aging interval without the starved thread ever
    // getting the CPU.
    let interrupts = AGING_LIMIT_TICKS / TIMER_INTERVAL_TICKS;
    for _ in 0..interrupts {
        kernel.timer_interrupt();
    }

    let thread = kernel.threads.get(starved).unwrap();
    assert_eq!(thread.priority(), 55);
    // The boosted priority preempted main at interrupt return.
    assert_eq!(kernel.current_thread(), Some(starved));

    let trace = trace.contents();
    let change = trace
        .find("Thread 1 changes its priority from 45 to 55")
        .expect("priority change line");
    let removal = trace[change..]
        .find("Thread 1 is removed from queue L3")
        .expect("removal line after the change");
    assert!(
        trace[change + removal..].contains("Thread 1 is inserted into queue L2"),
        "insertion into L2 after leaving L3:\n{}",
        trace
    );
}

#[test]
fn file_round_trip_restores_the_free_map() {
    let mut disk = Disk::in_memory();
    let mut fs = FileSystem::format(&mut disk).unwrap();
    let after_format = fs.allocated_sectors(&mut disk).unwrap();
    assert!(after_format.contains(&0));
    assert!(after_format.contains(&1));

    assert!(fs
        .create(&mut disk, "/a", DIRECTORY_FILE_SIZE as u32, true)
        .unwrap());
    assert!(fs.create(&mut disk, "/a/f", 100, false).unwrap());
    assert!(fs.open(&mut disk, "/a/f").unwrap().is_some());

    assert!(fs.remove(&mut disk, "/a", true).unwrap());
    assert!(fs.open(&mut disk, "/a/f").unwrap().is_none());
    assert!(fs.open(&mut disk, "/a").unwrap().is_none());

    // Bit for bit back to the freshly formatted state: the well-known
    // header sectors and the bootstrap files' blocks, nothing else.
    assert_eq!(fs.allocated_sectors(&mut disk).unwrap(), after_format);
}

#[test]
fn the_sixty_fifth_create_fails_without_leaking() {
    let mut disk = Disk::in_memory();
    let mut fs = FileSystem::format(&mut disk).unwrap();

    for i in 0..64 {
        let path = format!("/f{:02}", i);
        assert!(fs.create(&mut disk, &path, 0, false).unwrap(), "{}", path);
    }
    let before = fs.allocated_sectors(&mut disk).unwrap();

    assert!(!fs.create(&mut disk, "/f64", 0, false).unwrap());
    assert_eq!(fs.allocated_sectors(&mut disk).unwrap(), before);
}

#[test]
fn every_file_accounts_for_its_sectors() {
    let mut disk = Disk::in_memory();
    let mut fs = FileSystem::format(&mut disk).unwrap();
    for (path, size) in [("/tiny", 1u32), ("/page", 128), ("/big", 5000)] {
        assert!(fs.create(&mut disk, path, size, false).unwrap());
        let file = fs.open(&mut disk, path).unwrap().unwrap();
        let header = file.header();
        assert_eq!(header.file_length(), size);
        assert_eq!(header.num_sectors(), size.div_ceil(128));
    }
}
