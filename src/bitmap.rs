//! In-memory map of sector allocation state, rebuilt from the on-disk
//! inode graph at mount time.
//!
//! The map is the sole authority on whether a data sector is free; the
//! inode graph is the authority on which file owns it. Freeing always
//! zeroes the sector on disk before its bit is cleared, so a block handed
//! out later starts out blank.

use log::trace;

use crate::error::{FsError, Result};
use crate::layout::{self, BSIZE};
use crate::vdisk::Disk;

const ZEROS: [u8; BSIZE] = [0; BSIZE];

/// Per-sector used/free tracker.
#[derive(Debug, Clone)]
pub struct BlockMap {
    used: Vec<bool>,
    data_start: u32,
}

impl BlockMap {
    /// Creates a map for `num_blocks` sectors with the system area
    /// (superblock and inode table) pre-marked in use.
    pub fn new(num_blocks: u32, num_inode_blocks: u32) -> Self {
        let data_start = 1 + num_inode_blocks;
        let mut used = vec![false; num_blocks as usize];
        for bit in used.iter_mut().take(data_start as usize) {
            *bit = true;
        }
        Self { used, data_start }
    }

    /// First sector of the data region.
    pub fn data_start(&self) -> u32 {
        self.data_start
    }

    /// Marks one sector used or free. Sectors beyond the disk (a malformed
    /// image can reference them) are ignored.
    pub fn mark(&mut self, sector: u32, in_use: bool) {
        if let Some(bit) = self.used.get_mut(sector as usize) {
            *bit = in_use;
        }
    }

    /// Whether `sector` is marked in use.
    pub fn is_used(&self, sector: u32) -> bool {
        self.used.get(sector as usize).copied().unwrap_or(true)
    }

    /// Claims the lowest free data sector.
    pub fn first_free_data_block(&mut self) -> Result<u32> {
        let start = self.data_start as usize;
        let at = self
            .used
            .get(start..)
            .and_then(|tail| tail.iter().position(|bit| !bit))
            .ok_or(FsError::NoSpace)?;
        self.used[start + at] = true;
        let sector = (start + at) as u32;
        trace!("allocated data block {sector}");
        Ok(sector)
    }

    /// Marks an indirect block and every data block it references in use.
    pub fn allocate_indirect<D: Disk>(&mut self, disk: &mut D, sector: u32) -> Result<()> {
        self.update_indirect(disk, sector, true)
    }

    /// Frees an indirect block and every data block it references, zeroing
    /// each freed sector on disk first.
    pub fn free_indirect<D: Disk>(&mut self, disk: &mut D, sector: u32) -> Result<()> {
        self.update_indirect(disk, sector, false)
    }

    /// Marks a double-indirect block and everything reachable through it
    /// in use.
    pub fn allocate_double_indirect<D: Disk>(&mut self, disk: &mut D, sector: u32) -> Result<()> {
        self.update_double_indirect(disk, sector, true)
    }

    /// Frees a double-indirect block and everything reachable through it,
    /// zeroing each freed sector on disk first.
    pub fn free_double_indirect<D: Disk>(&mut self, disk: &mut D, sector: u32) -> Result<()> {
        self.update_double_indirect(disk, sector, false)
    }

    fn update_indirect<D: Disk>(&mut self, disk: &mut D, sector: u32, in_use: bool) -> Result<()> {
        let mut buf = [0u8; BSIZE];
        disk.read(sector, &mut buf)?;
        for entry in layout::decode_table(&buf) {
            if entry != 0 {
                self.set(disk, entry, in_use)?;
            }
        }
        self.set(disk, sector, in_use)
    }

    fn update_double_indirect<D: Disk>(
        &mut self,
        disk: &mut D,
        sector: u32,
        in_use: bool,
    ) -> Result<()> {
        let mut buf = [0u8; BSIZE];
        disk.read(sector, &mut buf)?;
        for entry in layout::decode_table(&buf) {
            if entry != 0 {
                self.update_indirect(disk, entry, in_use)?;
            }
        }
        self.set(disk, sector, in_use)
    }

    /// Single-sector status change; the free direction zeroes the sector
    /// on disk before the bit flips.
    fn set<D: Disk>(&mut self, disk: &mut D, sector: u32, in_use: bool) -> Result<()> {
        if !in_use {
            disk.write(sector, &ZEROS)?;
        }
        self.mark(sector, in_use);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vdisk::MemDisk;

    #[test]
    fn system_sectors_start_in_use() {
        let map = BlockMap::new(64, 1);
        assert!(map.is_used(0));
        assert!(map.is_used(1));
        assert!(!map.is_used(2));
        assert_eq!(map.data_start(), 2);
    }

    #[test]
    fn first_free_walks_upward() {
        let mut map = BlockMap::new(64, 1);
        assert_eq!(map.first_free_data_block().unwrap(), 2);
        assert_eq!(map.first_free_data_block().unwrap(), 3);
        map.mark(2, false);
        assert_eq!(map.first_free_data_block().unwrap(), 2);
    }

    #[test]
    fn exhausted_map_reports_no_space() {
        let mut map = BlockMap::new(4, 1);
        assert_eq!(map.first_free_data_block().unwrap(), 2);
        assert_eq!(map.first_free_data_block().unwrap(), 3);
        assert!(matches!(
            map.first_free_data_block(),
            Err(FsError::NoSpace)
        ));
    }

    #[test]
    fn out_of_range_marks_are_ignored() {
        let mut map = BlockMap::new(8, 1);
        map.mark(1000, true);
        assert!(map.is_used(1000));
    }

    fn table_sector(disk: &mut MemDisk, sector: u32, entries: &[u32]) {
        let mut buf = [0u8; BSIZE];
        for (i, entry) in entries.iter().enumerate() {
            layout::write_u32(&mut buf, i * 4, *entry);
        }
        disk.write(sector, &buf).unwrap();
    }

    #[test]
    fn indirect_walk_marks_children() {
        let mut disk = MemDisk::new(16);
        let mut map = BlockMap::new(16, 1);
        table_sector(&mut disk, 5, &[6, 0, 7]);

        map.allocate_indirect(&mut disk, 5).unwrap();
        assert!(map.is_used(5));
        assert!(map.is_used(6));
        assert!(map.is_used(7));
        assert!(!map.is_used(8));
    }

    #[test]
    fn freeing_indirect_zeroes_children_on_disk() {
        let mut disk = MemDisk::new(16);
        let mut map = BlockMap::new(16, 1);
        table_sector(&mut disk, 5, &[6, 7]);
        let mut payload = [0u8; BSIZE];
        payload.fill(0xaa);
        disk.write(6, &payload).unwrap();
        disk.write(7, &payload).unwrap();
        map.allocate_indirect(&mut disk, 5).unwrap();

        map.free_indirect(&mut disk, 5).unwrap();
        let mut buf = [0u8; BSIZE];
        for sector in [5, 6, 7] {
            assert!(!map.is_used(sector));
            disk.read(sector, &mut buf).unwrap();
            assert!(buf.iter().all(|&b| b == 0), "sector {sector} not zeroed");
        }
    }

    #[test]
    fn double_indirect_walk_covers_both_levels() {
        let mut disk = MemDisk::new(32);
        let mut map = BlockMap::new(32, 1);
        table_sector(&mut disk, 10, &[11, 12]);
        table_sector(&mut disk, 11, &[20, 21]);
        table_sector(&mut disk, 12, &[22]);

        map.allocate_double_indirect(&mut disk, 10).unwrap();
        for sector in [10, 11, 12, 20, 21, 22] {
            assert!(map.is_used(sector), "sector {sector} not marked");
        }

        map.free_double_indirect(&mut disk, 10).unwrap();
        let mut buf = [0u8; BSIZE];
        for sector in [10, 11, 12, 20, 21, 22] {
            assert!(!map.is_used(sector));
            disk.read(sector, &mut buf).unwrap();
            assert!(buf.iter().all(|&b| b == 0), "sector {sector} not zeroed");
        }
    }
}
