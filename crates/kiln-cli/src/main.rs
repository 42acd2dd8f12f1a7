use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use kiln_kernel::fs::FileSystem;
use kiln_kernel::thread::scheduler::SchedulerLog;
use kiln_kernel::thread::ThreadId;
use kiln_kernel::Kernel;
use kiln_machine::{Disk, Machine, TIMER_INTERVAL_TICKS};
use log::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Format a disk image, creating it if needed
    Format {
        /// Path to the disk image
        #[arg(short, long)]
        disk: PathBuf,
    },
    /// Copy a host file into the file system
    Copy {
        #[arg(short, long)]
        disk: PathBuf,

        /// Host file to copy from
        source: PathBuf,

        /// Absolute destination path, e.g. /docs/readme
        dest: String,
    },
    /// Create a directory
    Mkdir {
        #[arg(short, long)]
        disk: PathBuf,

        /// Absolute path of the new directory
        path: String,
    },
    /// List a directory
    List {
        #[arg(short, long)]
        disk: PathBuf,

        /// Directory to list
        #[arg(default_value = "/")]
        path: String,

        /// Descend into subdirectories
        #[arg(short, long)]
        recursive: bool,
    },
    /// Remove a file or directory
    Remove {
        #[arg(short, long)]
        disk: PathBuf,

        /// Absolute path to remove
        path: String,

        /// Remove directories and their contents
        #[arg(short, long)]
        recursive: bool,
    },
    /// Dump a file's contents to stdout
    Print {
        #[arg(short, long)]
        disk: PathBuf,

        /// Absolute path to dump
        path: String,
    },
    /// Run a scheduling simulation over synthetic workloads
    Sched {
        /// priority:burst pairs, e.g. 45:3000 120:800
        #[arg(required = true, value_parser = parse_workload)]
        workloads: Vec<Workload>,

        /// Give up after this many timer interrupts
        #[arg(long, default_value_t = 100_000)]
        max_interrupts: u64,
    },
}

#[derive(Clone, Copy, Debug)]
struct Workload {
    priority: i32,
    burst: u64,
}

fn parse_workload(s: &str) -> Result<Workload, String> {
    let (priority, burst) = s
        .split_once(':')
        .ok_or_else(|| format!("expected priority:burst, got {:?}", s))?;
    Ok(Workload {
        priority: priority
            .parse()
            .map_err(|e| format!("bad priority {:?}: {}", priority, e))?,
        burst: burst
            .parse()
            .map_err(|e| format!("bad burst {:?}: {}", burst, e))?,
    })
}

fn open_fs(path: &Path) -> Result<(Disk, FileSystem)> {
    let mut disk =
        Disk::open(path).with_context(|| format!("opening disk image {}", path.display()))?;
    let fs = FileSystem::mount(&mut disk)?;
    Ok((disk, fs))
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Format { disk } => {
            let mut disk_dev = Disk::create(&disk)
                .with_context(|| format!("creating disk image {}", disk.display()))?;
            FileSystem::format(&mut disk_dev)?;
            println!("formatted {}", disk.display());
        }
        Commands::Copy { disk, source, dest } => {
            let data = std::fs::read(&source)
                .with_context(|| format!("reading {}", source.display()))?;
            let (mut disk, mut fs) = open_fs(&disk)?;
            if !fs.create(&mut disk, &dest, data.len() as u32, false)? {
                bail!("could not create {}", dest);
            }
            let mut file = fs
                .open(&mut disk, &dest)?
                .with_context(|| format!("reopening {}", dest))?;
            let written = file.write(&mut disk, &data)?;
            info!("copied {} bytes to {}", written, dest);
        }
        Commands::Mkdir { disk, path } => {
            let (mut disk, mut fs) = open_fs(&disk)?;
            if !fs.create(&mut disk, &path, 0, true)? {
                bail!("could not create directory {}", path);
            }
        }
        Commands::List {
            disk,
            path,
            recursive,
        } => {
            let (mut disk, mut fs) = open_fs(&disk)?;
            fs.list(&mut disk, &path, recursive, &mut io::stdout())?;
        }
        Commands::Remove {
            disk,
            path,
            recursive,
        } => {
            let (mut disk, mut fs) = open_fs(&disk)?;
            if !fs.remove(&mut disk, &path, recursive)? {
                bail!("could not remove {}", path);
            }
        }
        Commands::Print { disk, path } => {
            let (mut disk, mut fs) = open_fs(&disk)?;
            let Some(file) = fs.open(&mut disk, &path)? else {
                bail!("{} not found", path);
            };
            let mut contents = vec![0u8; file.length() as usize];
            file.read_at(&mut disk, &mut contents, 0)?;
            io::stdout().write_all(&contents)?;
        }
        Commands::Sched {
            workloads,
            max_interrupts,
        } => {
            sched(&workloads, max_interrupts)?;
        }
    }

    Ok(())
}

/// Drive the scheduler with synthetic compute-bound threads. Each workload
/// burns `burst` ticks of CPU and finishes; the trace stream goes to
/// stdout. The main thread idles at the bottom of the round-robin band and
/// yields whenever it gets the CPU back.
fn sched(workloads: &[Workload], max_interrupts: u64) -> Result<()> {
    let machine = Machine::new(Disk::in_memory());
    let mut kernel = Kernel::with_scheduler_log(machine, SchedulerLog::stdout());
    let main_id = kernel.start_main_thread("main", 0);

    let mut remaining: HashMap<ThreadId, u64> = HashMap::new();
    for (index, workload) in workloads.iter().enumerate() {
        let id = kernel.spawn_thread(format!("worker-{}", index), workload.priority);
        kernel.fork(id);
        remaining.insert(id, workload.burst);
    }

    let mut interrupts = 0;
    while !remaining.is_empty() {
        if interrupts >= max_interrupts {
            bail!("giving up after {} timer interrupts", interrupts);
        }
        interrupts += 1;

        // Whoever held the CPU for this interval consumed it.
        if let Some(current) = kernel.current_thread() {
            if let Some(left) = remaining.get_mut(&current) {
                *left = left.saturating_sub(TIMER_INTERVAL_TICKS);
                if *left == 0 {
                    remaining.remove(&current);
                    kernel.finish_current();
                    continue;
                }
            }
        }

        kernel.timer_interrupt();

        // The idle main thread hands the CPU straight back.
        if kernel.current_thread() == Some(main_id) && !remaining.is_empty() {
            kernel.sys_yield();
        }
    }

    println!(
        "all workloads finished after {} timer interrupts ({} context switches)",
        interrupts,
        kernel.machine.cpu.context_switches()
    );
    Ok(())
}
