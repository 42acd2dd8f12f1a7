use std::fs::OpenOptions;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;

use log::debug;

pub const SECTOR_SIZE: usize = 128;
pub const NUM_SECTORS: usize = 1024;
pub const DISK_SIZE: u64 = (SECTOR_SIZE * NUM_SECTORS) as u64;

trait Media: Read + Write + Seek + Send {}
impl<T: Read + Write + Seek + Send> Media for T {}

/// Simulated sector device. Both operations are synchronous; the kernel
/// blocks for the duration of the transfer.
pub struct Disk {
    media: Box<dyn Media>,
    num_reads: u64,
    num_writes: u64,
}

impl Disk {
    /// Create a fresh, zero-filled image at `path`.
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(DISK_SIZE)?;
        debug!("created disk image {} ({} bytes)", path.display(), DISK_SIZE);
        Ok(Self::with_media(Box::new(file)))
    }

    /// Open an existing image, validating its size.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len != DISK_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("disk image is {} bytes, expected {}", len, DISK_SIZE),
            ));
        }
        Ok(Self::with_media(Box::new(file)))
    }

    /// Volatile disk for tests and simulations without an image file.
    pub fn in_memory() -> Self {
        Self::with_media(Box::new(Cursor::new(vec![0u8; DISK_SIZE as usize])))
    }

    fn with_media(media: Box<dyn Media>) -> Self {
        Self {
            media,
            num_reads: 0,
            num_writes: 0,
        }
    }

    pub fn read_sector(&mut self, sector: usize, buf: &mut [u8; SECTOR_SIZE]) -> io::Result<()> {
        assert!(sector < NUM_SECTORS, "sector {} out of range", sector);
        self.media
            .seek(SeekFrom::Start((sector * SECTOR_SIZE) as u64))?;
        self.media.read_exact(buf)?;
        self.num_reads += 1;
        Ok(())
    }

    pub fn write_sector(&mut self, sector: usize, buf: &[u8; SECTOR_SIZE]) -> io::Result<()> {
        assert!(sector < NUM_SECTORS, "sector {} out of range", sector);
        self.media
            .seek(SeekFrom::Start((sector * SECTOR_SIZE) as u64))?;
        self.media.write_all(buf)?;
        self.num_writes += 1;
        Ok(())
    }

    pub fn num_reads(&self) -> u64 {
        self.num_reads
    }

    pub fn num_writes(&self) -> u64 {
        self.num_writes
    }
}
