use kiln_fs::SECTOR_SIZE;
use kiln_machine::Disk;

use super::file_header::FileHeader;
use crate::error::KernelError;

/// A handle onto one file: the header sector, an in-memory copy of the
/// header chain, and a seek position. Handles are not shared; every open
/// produces a fresh one.
pub struct OpenFile {
    sector: i32,
    header: FileHeader,
    seek_position: u32,
}

impl OpenFile {
    /// Open the file whose header lives at `sector`.
    pub fn open(disk: &mut Disk, sector: i32) -> Result<Self, KernelError> {
        Ok(Self {
            sector,
            header: FileHeader::fetch_from(disk, sector)?,
            seek_position: 0,
        })
    }

    pub fn sector(&self) -> i32 {
        self.sector
    }

    pub fn length(&self) -> u32 {
        self.header.file_length()
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    pub fn seek(&mut self, position: u32) {
        self.seek_position = position;
    }

    /// Read from the seek position, advancing it by the bytes read.
    pub fn read(&mut self, disk: &mut Disk, buf: &mut [u8]) -> Result<i32, KernelError> {
        let count = self.read_at(disk, buf, self.seek_position)?;
        self.seek_position += count as u32;
        Ok(count)
    }

    /// Write at the seek position, advancing it by the bytes written.
    pub fn write(&mut self, disk: &mut Disk, buf: &[u8]) -> Result<i32, KernelError> {
        let count = self.write_at(disk, buf, self.seek_position)?;
        self.seek_position += count as u32;
        Ok(count)
    }

    /// Read up to `buf.len()` bytes starting at `position`, clamped at end
    /// of file. Transfers go through a scratch sector, one sector at a
    /// time. Returns the byte count actually read.
    pub fn read_at(
        &self,
        disk: &mut Disk,
        buf: &mut [u8],
        position: u32,
    ) -> Result<i32, KernelError> {
        let file_length = self.header.file_length();
        if buf.is_empty() || position >= file_length {
            return Ok(0);
        }
        let count = (buf.len() as u32).min(file_length - position);

        let sector_size = SECTOR_SIZE as u32;
        let first = position / sector_size;
        let last = (position + count - 1) / sector_size;
        let mut scratch = [0u8; SECTOR_SIZE];

        for index in first..=last {
            let sector_start = index * sector_size;
            let block = self.header.byte_to_sector(sector_start);
            disk.read_sector(block as usize, &mut scratch)?;

            let copy_from = position.max(sector_start);
            let copy_to = (position + count).min(sector_start + sector_size);
            buf[(copy_from - position) as usize..(copy_to - position) as usize]
                .copy_from_slice(
                    &scratch[(copy_from - sector_start) as usize
                        ..(copy_to - sector_start) as usize],
                );
        }

        Ok(count as i32)
    }

    /// Write up to `buf.len()` bytes starting at `position`. The file size
    /// is fixed at creation, so the transfer is clamped at end of file;
    /// partially covered edge sectors are read, patched, and written back.
    /// Returns the byte count actually written.
    pub fn write_at(
        &self,
        disk: &mut Disk,
        buf: &[u8],
        position: u32,
    ) -> Result<i32, KernelError> {
        let file_length = self.header.file_length();
        if buf.is_empty() || position >= file_length {
            return Ok(0);
        }
        let count = (buf.len() as u32).min(file_length - position);

        let sector_size = SECTOR_SIZE as u32;
        let first = position / sector_size;
        let last = (position + count - 1) / sector_size;
        let mut scratch = [0u8; SECTOR_SIZE];

        for index in first..=last {
            let sector_start = index * sector_size;
            let block = self.header.byte_to_sector(sector_start);

            let copy_from = position.max(sector_start);
            let copy_to = (position + count).min(sector_start + sector_size);
            if copy_from != sector_start || copy_to != sector_start + sector_size {
                // Partially covered sector: keep the bytes around the window.
                disk.read_sector(block as usize, &mut scratch)?;
            }
            scratch[(copy_from - sector_start) as usize..(copy_to - sector_start) as usize]
                .copy_from_slice(
                    &buf[(copy_from - position) as usize..(copy_to - position) as usize],
                );
            disk.write_sector(block as usize, &scratch)?;
        }

        Ok(count as i32)
    }
}
