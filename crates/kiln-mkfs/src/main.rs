use anyhow::{bail, Result};
use clap::Parser;
use kiln_kernel::fs::FileSystem;
use kiln_machine::{Disk, NUM_SECTORS, SECTOR_SIZE};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Path to the disk image
    #[arg(short, long)]
    disk: PathBuf,

    /// Overwrite an existing image
    #[arg(short, long)]
    force: bool,
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    if cli.disk.exists() && !cli.force {
        bail!(
            "{} already exists (pass --force to overwrite)",
            cli.disk.display()
        );
    }

    println!(
        "Formatting {} ({} sectors of {} bytes)...",
        cli.disk.display(),
        NUM_SECTORS,
        SECTOR_SIZE
    );

    let mut disk = Disk::create(&cli.disk)?;
    FileSystem::format(&mut disk)?;

    println!("Format complete.");
    Ok(())
}
