//! On-disk format of the kiln file system.
//!
//! Everything here is a fixed-layout `repr(C)` record that is read from and
//! written to disk sectors byte for byte. The kernel keeps richer in-memory
//! mirrors of these records; this crate only pins down the layout.

#![no_std]

use core::mem::size_of;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Atomic unit of disk I/O, in bytes.
pub const SECTOR_SIZE: usize = 128;

/// Total number of sectors on a disk image.
pub const NUM_SECTORS: usize = 1024;

/// Direct block slots per file header. The header occupies exactly one
/// sector: three `i32` bookkeeping fields, the rest direct block numbers.
pub const NUM_DIRECT: usize = (SECTOR_SIZE - 3 * size_of::<i32>()) / size_of::<i32>();

/// `next_header` value of the last header in a chain.
pub const NO_NEXT_HEADER: i32 = -1;

/// Sector holding the header of the free-map file.
pub const FREE_MAP_SECTOR: i32 = 0;

/// Sector holding the header of the root directory file.
pub const DIRECTORY_SECTOR: i32 = 1;

/// Size of the free-map file: one bit per sector.
pub const FREE_MAP_FILE_SIZE: usize = NUM_SECTORS / 8;

/// Longest stored name, in bytes, including the leading `/` of the path
/// component.
pub const FILE_NAME_MAX_LEN: usize = 9;

/// Entries per directory file. Every directory has the same table size.
pub const NUM_DIR_ENTRIES: usize = 64;

/// Size of a directory file.
pub const DIRECTORY_FILE_SIZE: usize = size_of::<RawDirEntry>() * NUM_DIR_ENTRIES;

/// File header (inode) as it sits on disk. Exactly one sector.
///
/// Files larger than `NUM_DIRECT` sectors continue in a successor header
/// whose sector number is `next_header`; `num_bytes` and `num_sectors`
/// count from the owning header to the end of the chain, so the first
/// header of a file carries the file's totals.
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Clone, Copy)]
#[repr(C)]
pub struct RawFileHeader {
    pub num_bytes: i32,
    pub num_sectors: i32,
    pub next_header: i32,
    pub sectors: [i32; NUM_DIRECT],
}

const _: () = assert!(size_of::<RawFileHeader>() == SECTOR_SIZE);

impl RawFileHeader {
    pub fn empty() -> Self {
        Self {
            num_bytes: 0,
            num_sectors: 0,
            next_header: NO_NEXT_HEADER,
            sectors: [0; NUM_DIRECT],
        }
    }
}

/// One slot of a directory table. Fixed 24 bytes.
///
/// Stored names keep the leading `/` of the path component ("/etc" not
/// "etc"); the path resolver splits paths so that each component arrives
/// slash first. Names longer than [`FILE_NAME_MAX_LEN`] are truncated on
/// store and on compare.
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Clone, Copy)]
#[repr(C)]
pub struct RawDirEntry {
    pub in_use: i32,
    pub is_directory: i32,
    pub name: [u8; FILE_NAME_MAX_LEN + 1],
    _pad: [u8; 2],
    pub sector: i32,
}

const _: () = assert!(size_of::<RawDirEntry>() == 24);

impl RawDirEntry {
    pub fn vacant() -> Self {
        Self {
            in_use: 0,
            is_directory: 0,
            name: [0; FILE_NAME_MAX_LEN + 1],
            _pad: [0; 2],
            sector: 0,
        }
    }

    pub fn new(name: &str, sector: i32, is_directory: bool) -> Self {
        let mut entry = Self::vacant();
        entry.in_use = 1;
        entry.is_directory = is_directory as i32;
        entry.sector = sector;
        let bytes = name.as_bytes();
        let len = bytes.len().min(FILE_NAME_MAX_LEN);
        entry.name[..len].copy_from_slice(&bytes[..len]);
        entry
    }

    pub fn in_use(&self) -> bool {
        self.in_use != 0
    }

    pub fn is_directory(&self) -> bool {
        self.is_directory != 0
    }

    /// Byte-wise comparison over the first [`FILE_NAME_MAX_LEN`] bytes.
    pub fn name_matches(&self, name: &str) -> bool {
        let mut key = [0u8; FILE_NAME_MAX_LEN];
        let bytes = name.as_bytes();
        let len = bytes.len().min(FILE_NAME_MAX_LEN);
        key[..len].copy_from_slice(&bytes[..len]);
        self.name[..FILE_NAME_MAX_LEN] == key
    }

    pub fn name_as_str(&self) -> &str {
        let end = self
            .name
            .iter()
            .position(|&c| c == 0)
            .unwrap_or(self.name.len());
        core::str::from_utf8(&self.name[..end]).unwrap_or("<invalid>")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_fills_exactly_one_sector() {
        assert_eq!(size_of::<RawFileHeader>(), SECTOR_SIZE);
        assert_eq!(NUM_DIRECT, 29);
    }

    #[test]
    fn entry_names_compare_truncated() {
        let entry = RawDirEntry::new("/verylongname", 7, false);
        assert!(entry.name_matches("/verylongname"));
        // Only the first nine bytes participate in the comparison.
        assert!(entry.name_matches("/verylong"));
        assert!(!entry.name_matches("/other"));
        assert_eq!(entry.name_as_str(), "/verylong");
    }

    #[test]
    fn entry_round_trips_through_bytes() {
        use zerocopy::{FromBytes, IntoBytes};

        let entry = RawDirEntry::new("/a", 42, true);
        let copy = RawDirEntry::read_from_bytes(entry.as_bytes()).unwrap();
        assert!(copy.in_use());
        assert!(copy.is_directory());
        assert_eq!(copy.sector, 42);
        assert_eq!(copy.name_as_str(), "/a");
    }
}
