use kiln_fs::{RawFileHeader, NO_NEXT_HEADER, NUM_DIRECT, SECTOR_SIZE};
use kiln_machine::Disk;
use zerocopy::{FromBytes, IntoBytes};

use super::freemap::FreeMap;
use crate::error::KernelError;

/// Bytes addressable through one header's direct blocks.
const DIRECT_CAPACITY: u32 = (NUM_DIRECT * SECTOR_SIZE) as u32;

/// In-memory mirror of an on-disk file header, with the whole successor
/// chain fetched alongside it. `num_bytes` and `num_sectors` count from
/// this header to the end of the chain, so the first header of a file
/// carries the file's totals.
pub struct FileHeader {
    num_bytes: u32,
    num_sectors: u32,
    sectors: [i32; NUM_DIRECT],
    next: Option<(i32, Box<FileHeader>)>,
}

impl Default for FileHeader {
    fn default() -> Self {
        Self::new()
    }
}

impl FileHeader {
    pub fn new() -> Self {
        Self {
            num_bytes: 0,
            num_sectors: 0,
            sectors: [0; NUM_DIRECT],
            next: None,
        }
    }

    /// Grab data blocks for a file of `file_size` bytes, chaining successor
    /// headers when the size exceeds the direct capacity. On any failure
    /// the free map is left exactly as it was: every sector grabbed along
    /// the way is returned.
    pub fn allocate(&mut self, free_map: &mut FreeMap, file_size: u32) -> bool {
        let mut grabbed = Vec::new();
        if self.allocate_chain(free_map, &mut grabbed, file_size) {
            true
        } else {
            for sector in grabbed {
                free_map.clear(sector);
            }
            false
        }
    }

    fn allocate_chain(
        &mut self,
        free_map: &mut FreeMap,
        grabbed: &mut Vec<i32>,
        file_size: u32,
    ) -> bool {
        self.num_bytes = file_size;
        self.num_sectors = file_size.div_ceil(SECTOR_SIZE as u32);

        let direct = self.num_sectors.min(NUM_DIRECT as u32) as usize;
        for slot in 0..direct {
            match free_map.find_and_set() {
                Some(sector) => {
                    self.sectors[slot] = sector;
                    grabbed.push(sector);
                }
                None => return false,
            }
        }

        if self.num_sectors as usize > NUM_DIRECT {
            let Some(next_sector) = free_map.find_and_set() else {
                return false;
            };
            grabbed.push(next_sector);
            let mut next = FileHeader::new();
            if !next.allocate_chain(free_map, grabbed, file_size - DIRECT_CAPACITY) {
                return false;
            }
            self.next = Some((next_sector, Box::new(next)));
        }

        true
    }

    /// Return every data block of the chain to the free map. The caller is
    /// responsible for the header sectors themselves (the first header's
    /// sector and [`Self::chained_sectors`]).
    pub fn deallocate(&self, free_map: &mut FreeMap) {
        let direct = self.num_sectors.min(NUM_DIRECT as u32) as usize;
        for slot in 0..direct {
            assert!(free_map.test(self.sectors[slot]));
            free_map.clear(self.sectors[slot]);
        }
        if let Some((_, next)) = self.next.as_ref() {
            next.deallocate(free_map);
        }
    }

    /// Data block holding the byte at `offset`, walking the chain until
    /// the offset falls within a header's direct blocks.
    pub fn byte_to_sector(&self, offset: u32) -> i32 {
        if offset < DIRECT_CAPACITY {
            self.sectors[(offset as usize) / SECTOR_SIZE]
        } else {
            let (_, next) = self
                .next
                .as_ref()
                .expect("byte offset beyond the header chain");
            next.byte_to_sector(offset - DIRECT_CAPACITY)
        }
    }

    /// Read the header at `sector`, following and fetching the whole chain.
    pub fn fetch_from(disk: &mut Disk, sector: i32) -> Result<Self, KernelError> {
        let mut buf = [0u8; SECTOR_SIZE];
        disk.read_sector(sector as usize, &mut buf)?;
        let raw = RawFileHeader::read_from_bytes(&buf).expect("header fills a sector");

        let next = if raw.next_header == NO_NEXT_HEADER {
            None
        } else {
            let next = FileHeader::fetch_from(disk, raw.next_header)?;
            Some((raw.next_header, Box::new(next)))
        };

        Ok(Self {
            num_bytes: raw.num_bytes as u32,
            num_sectors: raw.num_sectors as u32,
            sectors: raw.sectors,
            next,
        })
    }

    /// Write the header chain back, bit-exact, starting at `sector`.
    pub fn write_back(&self, disk: &mut Disk, sector: i32) -> Result<(), KernelError> {
        let raw = RawFileHeader {
            num_bytes: self.num_bytes as i32,
            num_sectors: self.num_sectors as i32,
            next_header: self
                .next
                .as_ref()
                .map_or(NO_NEXT_HEADER, |&(next_sector, _)| next_sector),
            sectors: self.sectors,
        };
        let mut buf = [0u8; SECTOR_SIZE];
        buf.copy_from_slice(raw.as_bytes());
        disk.write_sector(sector as usize, &buf)?;

        if let Some((next_sector, next)) = self.next.as_ref() {
            next.write_back(disk, *next_sector)?;
        }
        Ok(())
    }

    pub fn file_length(&self) -> u32 {
        self.num_bytes
    }

    pub fn num_sectors(&self) -> u32 {
        self.num_sectors
    }

    /// Sectors occupied by the successor headers of the chain (not the
    /// first header, whose sector the owner knows).
    pub fn chained_sectors(&self) -> Vec<i32> {
        let mut sectors = Vec::new();
        let mut header = self;
        while let Some((sector, next)) = header.next.as_ref() {
            sectors.push(*sector);
            header = next;
        }
        sectors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_fs::NUM_SECTORS;

    #[test]
    fn small_allocation_stays_in_one_header() {
        let mut free_map = FreeMap::new(NUM_SECTORS);
        let mut header = FileHeader::new();
        assert!(header.allocate(&mut free_map, 300));
        assert_eq!(header.file_length(), 300);
        assert_eq!(header.num_sectors(), 3);
        assert!(header.chained_sectors().is_empty());
        assert_eq!(free_map.num_clear(), NUM_SECTORS - 3);
    }

    #[test]
    fn allocation_chains_past_the_direct_capacity() {
        let mut free_map = FreeMap::new(NUM_SECTORS);
        let mut header = FileHeader::new();
        let size = (NUM_DIRECT as u32 + 11) * SECTOR_SIZE as u32;
        assert!(header.allocate(&mut free_map, size));
        assert_eq!(header.num_sectors(), NUM_DIRECT as u32 + 11);
        assert_eq!(header.chained_sectors().len(), 1);
        // 40 data blocks plus one chained header sector.
        assert_eq!(free_map.num_clear(), NUM_SECTORS - 41);
    }

    #[test]
    fn failed_allocation_leaks_nothing() {
        let mut free_map = FreeMap::new(NUM_SECTORS);
        // Leave too few sectors for the request.
        for sector in 0..(NUM_SECTORS as i32 - 10) {
            free_map.mark(sector);
        }
        let before = free_map.num_clear();

        let mut header = FileHeader::new();
        let size = (NUM_DIRECT as u32 + 5) * SECTOR_SIZE as u32;
        assert!(!header.allocate(&mut free_map, size));
        assert_eq!(free_map.num_clear(), before);
    }

    #[test]
    fn deallocate_returns_every_data_block() {
        let mut free_map = FreeMap::new(NUM_SECTORS);
        let mut header = FileHeader::new();
        let size = (NUM_DIRECT as u32 + 3) * SECTOR_SIZE as u32;
        assert!(header.allocate(&mut free_map, size));

        header.deallocate(&mut free_map);
        for sector in header.chained_sectors() {
            free_map.clear(sector);
        }
        assert_eq!(free_map.num_clear(), NUM_SECTORS);
    }

    #[test]
    fn byte_to_sector_walks_the_chain() {
        let mut free_map = FreeMap::new(NUM_SECTORS);
        let mut header = FileHeader::new();
        let size = (NUM_DIRECT as u32 + 2) * SECTOR_SIZE as u32;
        assert!(header.allocate(&mut free_map, size));

        // Sequential allocation on an empty map: data blocks first, then
        // the chained header, then the successor's blocks.
        assert_eq!(header.byte_to_sector(0), 0);
        assert_eq!(
            header.byte_to_sector((NUM_DIRECT as u32 - 1) * SECTOR_SIZE as u32),
            NUM_DIRECT as i32 - 1
        );
        let past_direct = header.byte_to_sector(DIRECT_CAPACITY);
        assert_eq!(past_direct, NUM_DIRECT as i32 + 1);
    }

    #[test]
    fn header_chain_round_trips_through_the_disk() {
        let mut disk = Disk::in_memory();
        let mut free_map = FreeMap::new(NUM_SECTORS);
        // Reserve a home sector for the first header itself.
        let home = free_map.find_and_set().unwrap();
        let mut header = FileHeader::new();
        let size = (NUM_DIRECT as u32 + 1) * SECTOR_SIZE as u32;
        assert!(header.allocate(&mut free_map, size));
        header.write_back(&mut disk, home).unwrap();

        let fetched = FileHeader::fetch_from(&mut disk, home).unwrap();
        assert_eq!(fetched.file_length(), size);
        assert_eq!(fetched.num_sectors(), header.num_sectors());
        assert_eq!(fetched.chained_sectors(), header.chained_sectors());
        assert_eq!(fetched.byte_to_sector(0), header.byte_to_sector(0));
        assert_eq!(
            fetched.byte_to_sector(DIRECT_CAPACITY),
            header.byte_to_sector(DIRECT_CAPACITY)
        );
    }
}
