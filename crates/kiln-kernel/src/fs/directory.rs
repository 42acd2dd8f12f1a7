use std::io::Write;

use kiln_fs::{RawDirEntry, NUM_DIR_ENTRIES};
use kiln_machine::Disk;
use log::debug;
use zerocopy::{FromBytes, IntoBytes};

use super::open_file::OpenFile;
use crate::error::KernelError;

/// A directory: a fixed-length table of entries, persisted as a regular
/// file. Subdirectories are files of identical layout referenced by
/// entries flagged as directories.
pub struct Directory {
    table: Vec<RawDirEntry>,
}

impl Directory {
    pub fn new(size: usize) -> Self {
        Self {
            table: vec![RawDirEntry::vacant(); size],
        }
    }

    pub fn fetch_from(&mut self, disk: &mut Disk, file: &mut OpenFile) -> Result<(), KernelError> {
        let entry_size = std::mem::size_of::<RawDirEntry>();
        let mut bytes = vec![0u8; self.table.len() * entry_size];
        // A short read leaves the tail zeroed, which parses as vacant
        // entries; fetching a non-directory file degrades the same way the
        // on-disk layout does.
        file.read_at(disk, &mut bytes, 0)?;
        self.table = bytes
            .chunks_exact(entry_size)
            .map(|chunk| RawDirEntry::read_from_bytes(chunk).expect("entry spans the chunk"))
            .collect();
        Ok(())
    }

    pub fn write_back(&self, disk: &mut Disk, file: &mut OpenFile) -> Result<(), KernelError> {
        let written = file.write_at(disk, self.table.as_slice().as_bytes(), 0)?;
        debug_assert_eq!(
            written as usize,
            self.table.len() * std::mem::size_of::<RawDirEntry>()
        );
        Ok(())
    }

    fn find_index(&self, name: &str) -> Option<usize> {
        self.table
            .iter()
            .position(|entry| entry.in_use() && entry.name_matches(name))
    }

    /// Header sector of the named entry.
    pub fn find(&self, name: &str) -> Option<i32> {
        self.find_index(name).map(|at| self.table[at].sector)
    }

    /// Header sector and directory flag of the named entry.
    pub fn find_with_kind(&self, name: &str) -> Option<(i32, bool)> {
        self.find_index(name)
            .map(|at| (self.table[at].sector, self.table[at].is_directory()))
    }

    /// Add an entry. Fails on a duplicate name or a full table.
    pub fn add(&mut self, name: &str, sector: i32, is_directory: bool) -> bool {
        if self.find_index(name).is_some() {
            return false;
        }
        match self.table.iter_mut().find(|entry| !entry.in_use()) {
            Some(slot) => {
                *slot = RawDirEntry::new(name, sector, is_directory);
                debug!("directory add {}", name);
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, name: &str) -> bool {
        match self.find_index(name) {
            Some(at) => {
                self.table[at].in_use = 0;
                true
            }
            None => false,
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = &RawDirEntry> {
        self.table.iter()
    }

    /// Resolve an absolute path starting from this directory, descending a
    /// component at a time. `"/"` resolves to `root_sector`. Returns the
    /// header sector of the final component, or `None` if any component is
    /// missing or the path is not absolute.
    pub fn find_path(
        &self,
        disk: &mut Disk,
        path: &str,
        root_sector: i32,
    ) -> Result<Option<i32>, KernelError> {
        if !path.starts_with('/') {
            return Ok(None);
        }
        if path == "/" {
            return Ok(Some(root_sector));
        }

        // Split "/a/b/c" into the component "/a" and the remainder "/b/c".
        let (component, rest) = match path[1..].find('/') {
            Some(at) => path.split_at(at + 1),
            None => (path, ""),
        };

        for entry in &self.table {
            if entry.in_use() && entry.name_matches(component) {
                if rest.is_empty() {
                    return Ok(Some(entry.sector));
                }
                let mut file = OpenFile::open(disk, entry.sector)?;
                let mut directory = Directory::new(NUM_DIR_ENTRIES);
                directory.fetch_from(disk, &mut file)?;
                return directory.find_path(disk, rest, root_sector);
            }
        }

        Ok(None)
    }

    /// Print the names of every in-use entry.
    pub fn list(&self, out: &mut dyn Write) -> Result<(), KernelError> {
        for entry in self.table.iter().filter(|entry| entry.in_use()) {
            writeln!(out, "{}", entry.name_as_str()).map_err(KernelError::Disk)?;
        }
        Ok(())
    }

    /// Print every in-use entry, indented by depth, descending into
    /// subdirectories.
    pub fn list_recursive(
        &self,
        disk: &mut Disk,
        depth: usize,
        out: &mut dyn Write,
    ) -> Result<(), KernelError> {
        for entry in self.table.iter().filter(|entry| entry.in_use()) {
            writeln!(out, "{:indent$}{}", "", entry.name_as_str(), indent = depth * 4)
                .map_err(KernelError::Disk)?;
            if entry.is_directory() {
                let mut file = OpenFile::open(disk, entry.sector)?;
                let mut directory = Directory::new(NUM_DIR_ENTRIES);
                directory.fetch_from(disk, &mut file)?;
                directory.list_recursive(disk, depth + 1, out)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_find_remove() {
        let mut directory = Directory::new(NUM_DIR_ENTRIES);
        assert!(directory.add("/a", 5, false));
        assert!(directory.add("/b", 9, true));
        assert_eq!(directory.find("/a"), Some(5));
        assert_eq!(directory.find_with_kind("/b"), Some((9, true)));
        assert!(directory.remove("/a"));
        assert_eq!(directory.find("/a"), None);
        assert!(!directory.remove("/a"));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut directory = Directory::new(NUM_DIR_ENTRIES);
        assert!(directory.add("/a", 5, false));
        assert!(!directory.add("/a", 6, false));
        assert_eq!(directory.find("/a"), Some(5));
    }

    #[test]
    fn a_full_table_rejects_new_entries() {
        let mut directory = Directory::new(4);
        for (i, name) in ["/a", "/b", "/c", "/d"].iter().enumerate() {
            assert!(directory.add(name, i as i32, false));
        }
        assert!(!directory.add("/e", 9, false));
        assert!(directory.remove("/b"));
        assert!(directory.add("/e", 9, false));
    }

    #[test]
    fn removed_slots_are_reused() {
        let mut directory = Directory::new(2);
        assert!(directory.add("/a", 1, false));
        assert!(directory.add("/b", 2, false));
        assert!(directory.remove("/a"));
        assert!(directory.add("/c", 3, false));
        assert_eq!(directory.find("/c"), Some(3));
    }
}
