//! The file system engine: mount life cycle, the inode table, logical to
//! physical block addressing, and the bounded read / extending write paths.
//!
//! A file is a run of bytes addressed through its inode: four direct block
//! pointers, then a single-indirect block of 256 pointers, then a
//! double-indirect block of 256 single-indirect blocks. A pointer value of
//! 0 means "no sector here". Mounting rebuilds the in-memory allocation
//! map by walking that graph for every valid inode.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info};

use crate::bitmap::BlockMap;
use crate::error::{FsError, Result};
use crate::layout::{
    self, Inode, SuperBlock, BSIZE, IPB, MAXFILE, NDIRECT, NINDIRECT, SUPERBLOCK_SECTOR,
};
use crate::vdisk::{Disk, FileDisk};

/// Set while any [`FileSystem`] handle is live: one mounted disk per
/// process.
static MOUNTED: AtomicBool = AtomicBool::new(false);

const ZEROS: [u8; BSIZE] = [0; BSIZE];

/// Clears the process-wide mount flag when the mount goes away.
#[derive(Debug)]
struct MountGuard;

impl Drop for MountGuard {
    fn drop(&mut self) {
        MOUNTED.store(false, Ordering::SeqCst);
    }
}

/// Formats the image at `path`: zeroes every sector and writes a fresh
/// superblock with room for at least `inodes` inodes (clamped to 1).
/// Refuses to run while a disk is mounted.
pub fn format(path: &Path, inodes: u32) -> Result<()> {
    let mut disk = FileDisk::open(path)?;
    format_disk(&mut disk, inodes)
}

/// Formats an already-open device. See [`format`].
pub fn format_disk<D: Disk>(disk: &mut D, inodes: u32) -> Result<()> {
    if MOUNTED.load(Ordering::SeqCst) {
        return Err(FsError::AlreadyMounted);
    }
    let inode_blocks = inodes.max(1).div_ceil(IPB as u32);

    // superblock + inode table + at least one data block
    if disk.sectors() < inode_blocks + 2 {
        return Err(FsError::NoSpace);
    }

    for sector in 0..disk.sectors() {
        disk.write(sector, &ZEROS)?;
    }

    let sb = SuperBlock {
        num_blocks: disk.sectors(),
        num_inode_blocks: inode_blocks,
        block_size: BSIZE as u32,
    };
    let mut buf = ZEROS;
    sb.encode(&mut buf);
    disk.write(SUPERBLOCK_SECTOR, &buf)?;
    disk.sync()?;

    info!(
        "formatted {} sectors with {inode_blocks} inode blocks",
        sb.num_blocks
    );
    Ok(())
}

/// An active mount: the open device, the superblock read at mount time and
/// the allocation map rebuilt from the inode graph.
#[derive(Debug)]
pub struct FileSystem<D: Disk = FileDisk> {
    disk: D,
    sb: SuperBlock,
    map: BlockMap,
    _guard: MountGuard,
}

impl FileSystem<FileDisk> {
    /// Mounts the image at `path`.
    pub fn mount(path: &Path) -> Result<Self> {
        Self::attach(FileDisk::open(path)?)
    }
}

impl<D: Disk> FileSystem<D> {
    /// Mounts an already-open device: validates the superblock and rebuilds
    /// the allocation map by walking every valid inode's block graph. At
    /// most one disk may be mounted per process; all resources are released
    /// again if anything goes wrong.
    pub fn attach(disk: D) -> Result<Self> {
        if MOUNTED.swap(true, Ordering::SeqCst) {
            return Err(FsError::AlreadyMounted);
        }
        Self::build(disk, MountGuard)
    }

    fn build(mut disk: D, guard: MountGuard) -> Result<Self> {
        let mut buf = [0u8; BSIZE];
        disk.read(SUPERBLOCK_SECTOR, &mut buf)?;
        let sb = SuperBlock::decode(&buf)?;

        let mut map = BlockMap::new(sb.num_blocks, sb.num_inode_blocks);
        for sector in 1..sb.data_start() {
            disk.read(sector, &mut buf)?;
            for slot in 0..IPB {
                let inode = Inode::decode(&buf, slot);
                if !inode.valid {
                    continue;
                }
                for addr in inode.direct {
                    if addr != 0 {
                        map.mark(addr, true);
                    }
                }
                if inode.indirect1 != 0 {
                    map.allocate_indirect(&mut disk, inode.indirect1)?;
                }
                if inode.indirect2 != 0 {
                    map.allocate_double_indirect(&mut disk, inode.indirect2)?;
                }
            }
        }

        debug!(
            "mounted: {} sectors, {} inodes",
            sb.num_blocks,
            sb.num_inodes()
        );
        Ok(Self {
            disk,
            sb,
            map,
            _guard: guard,
        })
    }

    /// Unmounts, releasing the allocation map and handing the device back.
    pub fn unmount(self) -> D {
        let Self { disk, .. } = self;
        disk
    }

    /// The superblock read at mount time.
    pub fn superblock(&self) -> &SuperBlock {
        &self.sb
    }

    /// Whether `sector` is marked in use by the allocation map.
    pub fn block_in_use(&self, sector: u32) -> bool {
        self.map.is_used(sector)
    }

    /// Claims the first free inode. The new file has size zero and no
    /// blocks; its number is stable until deleted.
    pub fn create(&mut self) -> Result<u32> {
        let mut buf = [0u8; BSIZE];
        for sector in 1..self.sb.data_start() {
            self.disk.read(sector, &mut buf)?;
            for slot in 0..IPB {
                let mut inode = Inode::decode(&buf, slot);
                if inode.valid {
                    continue;
                }
                inode.valid = true;
                inode.encode(&mut buf, slot);
                self.disk.write(sector, &buf)?;
                self.disk.sync()?;
                let n = (sector - 1) * IPB as u32 + slot as u32;
                info!("created inode {n}");
                return Ok(n);
            }
        }
        Err(FsError::NoSpace)
    }

    /// Returns the size in bytes of the file at inode `n`.
    pub fn stat(&mut self, n: u32) -> Result<u32> {
        let inode = self.load_inode(n)?;
        if !inode.valid {
            return Err(FsError::Unused);
        }
        Ok(inode.size)
    }

    /// Deletes the file at inode `n`: zeroes and frees every sector it
    /// references, then clears the inode.
    pub fn delete(&mut self, n: u32) -> Result<()> {
        let inode = self.load_inode(n)?;
        if !inode.valid {
            return Err(FsError::Unused);
        }

        for addr in inode.direct {
            if addr != 0 {
                self.disk.write(addr, &ZEROS)?;
                self.map.mark(addr, false);
            }
        }
        if inode.indirect1 != 0 {
            self.map.free_indirect(&mut self.disk, inode.indirect1)?;
        }
        if inode.indirect2 != 0 {
            self.map
                .free_double_indirect(&mut self.disk, inode.indirect2)?;
        }

        self.store_inode(n, &Inode::default())?;
        info!("deleted inode {n}");
        Ok(())
    }

    /// Reads up to `buf.len()` bytes starting at byte `offset` of the file
    /// at inode `n`, returning how many bytes were placed in `buf`. Reads
    /// past the end of the file are clamped; holes inside the file read as
    /// zeros.
    pub fn read(&mut self, n: u32, buf: &mut [u8], offset: u32) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let inode = self.load_inode(n)?;
        if !inode.valid {
            return Err(FsError::Unused);
        }
        if offset >= inode.size {
            return Ok(0);
        }
        let len = buf.len().min((inode.size - offset) as usize);

        let mut sector_buf = [0u8; BSIZE];
        let mut done = 0;
        while done < len {
            let at = offset as usize + done;
            let lbn = at / BSIZE;
            let intra = at % BSIZE;
            let chunk = (BSIZE - intra).min(len - done);

            let phys = self.resolve(&inode, lbn)?;
            if phys == 0 {
                buf[done..done + chunk].fill(0);
            } else {
                self.disk.read(phys, &mut sector_buf)?;
                buf[done..done + chunk].copy_from_slice(&sector_buf[intra..intra + chunk]);
            }
            done += chunk;
        }
        Ok(done)
    }

    /// Writes `data` at byte `offset` of the file at inode `n`, allocating
    /// blocks and growing the file as needed. A write starting past the
    /// current end leaves a zero-filled gap. Returns how many bytes of
    /// `data` were written.
    pub fn write(&mut self, n: u32, data: &[u8], offset: u32) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let mut inode = self.load_inode(n)?;
        if !inode.valid {
            return Err(FsError::Unused);
        }

        let end = offset as u64 + data.len() as u64;
        if end > (MAXFILE * BSIZE) as u64 {
            return Err(FsError::OutOfRange);
        }
        let end = end as u32;

        if end > inode.size {
            self.extend_to(&mut inode, end)?;
        }

        let mut sector_buf = [0u8; BSIZE];
        let mut done = 0;
        while done < data.len() {
            let at = offset as usize + done;
            let lbn = at / BSIZE;
            let intra = at % BSIZE;
            let chunk = (BSIZE - intra).min(data.len() - done);

            let mut phys = self.resolve(&inode, lbn)?;
            if phys == 0 {
                // a hole inside the old file body; give it a sector now
                phys = self.map.first_free_data_block()?;
                self.set_pointer(&mut inode, lbn, phys)?;
            }
            self.disk.read(phys, &mut sector_buf)?;
            sector_buf[intra..intra + chunk].copy_from_slice(&data[done..done + chunk]);
            self.disk.write(phys, &sector_buf)?;
            self.disk.sync()?;
            done += chunk;
        }

        // persist even when the size is unchanged: the loop may have
        // installed new pointers
        self.store_inode(n, &inode)?;
        debug!("wrote {done} bytes at offset {offset} to inode {n}");
        Ok(done)
    }

    /// Every allocated data sector of the file at inode `n`, in logical
    /// order: direct, then the single-indirect entries, then each
    /// double-indirect sub-table. Holes are skipped.
    pub fn blocks(&mut self, n: u32) -> Result<Vec<u32>> {
        let inode = self.load_inode(n)?;
        if !inode.valid {
            return Err(FsError::Unused);
        }
        self.enumerate(&inode, MAXFILE)
    }

    /// Allocates fresh sectors for every logical block the file needs to
    /// reach `new_size` bytes. Newly claimed sectors hold zeros, so any
    /// gap before the written range reads back as zeros.
    fn extend_to(&mut self, inode: &mut Inode, new_size: u32) -> Result<()> {
        let current = (inode.size as usize).div_ceil(BSIZE);
        let needed = (new_size as usize).div_ceil(BSIZE);
        for lbn in current..needed {
            let phys = self.map.first_free_data_block()?;
            self.set_pointer(inode, lbn, phys)?;
        }
        inode.size = new_size;
        Ok(())
    }

    /// Physical sector holding logical block `lbn`, or 0 when no sector is
    /// allocated at that position. Never allocates.
    fn resolve(&mut self, inode: &Inode, lbn: usize) -> Result<u32> {
        if lbn < NDIRECT {
            return Ok(inode.direct[lbn]);
        }
        let lbn = lbn - NDIRECT;
        if lbn < NINDIRECT {
            if inode.indirect1 == 0 {
                return Ok(0);
            }
            return self.table_entry(inode.indirect1, lbn);
        }
        let lbn = lbn - NINDIRECT;
        if lbn < NINDIRECT * NINDIRECT {
            if inode.indirect2 == 0 {
                return Ok(0);
            }
            let inner = self.table_entry(inode.indirect2, lbn / NINDIRECT)?;
            if inner == 0 {
                return Ok(0);
            }
            return self.table_entry(inner, lbn % NINDIRECT);
        }
        Err(FsError::OutOfRange)
    }

    /// Installs `phys` as the sector for logical block `lbn`, allocating
    /// missing indirect blocks on the way. A fresh indirect block is
    /// recorded in its parent before any pointer is written into it, so an
    /// interrupted operation leaves at worst an empty table. The caller
    /// persists the inode afterwards.
    fn set_pointer(&mut self, inode: &mut Inode, lbn: usize, phys: u32) -> Result<()> {
        if lbn < NDIRECT {
            inode.direct[lbn] = phys;
            return Ok(());
        }
        let lbn = lbn - NDIRECT;
        if lbn < NINDIRECT {
            if inode.indirect1 == 0 {
                inode.indirect1 = self.fresh_table()?;
            }
            return self.set_table_entry(inode.indirect1, lbn, phys);
        }
        let lbn = lbn - NINDIRECT;
        if lbn < NINDIRECT * NINDIRECT {
            if inode.indirect2 == 0 {
                inode.indirect2 = self.fresh_table()?;
            }
            let outer_at = lbn / NINDIRECT;
            let mut inner = self.table_entry(inode.indirect2, outer_at)?;
            if inner == 0 {
                inner = self.fresh_table()?;
                self.set_table_entry(inode.indirect2, outer_at, inner)?;
            }
            return self.set_table_entry(inner, lbn % NINDIRECT, phys);
        }
        Err(FsError::OutOfRange)
    }

    /// Claims a zeroed sector to hold a pointer table.
    fn fresh_table(&mut self) -> Result<u32> {
        let sector = self.map.first_free_data_block()?;
        self.disk.write(sector, &ZEROS)?;
        Ok(sector)
    }

    fn table_entry(&mut self, sector: u32, index: usize) -> Result<u32> {
        let mut buf = [0u8; BSIZE];
        self.disk.read(sector, &mut buf)?;
        Ok(layout::read_u32(&buf, index * 4))
    }

    fn set_table_entry(&mut self, sector: u32, index: usize, value: u32) -> Result<()> {
        let mut buf = [0u8; BSIZE];
        self.disk.read(sector, &mut buf)?;
        layout::write_u32(&mut buf, index * 4, value);
        self.disk.write(sector, &buf)
    }

    fn enumerate(&mut self, inode: &Inode, capacity: usize) -> Result<Vec<u32>> {
        let mut out = Vec::new();
        for addr in inode.direct {
            if addr != 0 && out.len() < capacity {
                out.push(addr);
            }
        }
        if inode.indirect1 != 0 {
            self.push_table(inode.indirect1, capacity, &mut out)?;
        }
        if inode.indirect2 != 0 {
            let mut buf = [0u8; BSIZE];
            self.disk.read(inode.indirect2, &mut buf)?;
            for entry in layout::decode_table(&buf) {
                if entry != 0 && out.len() < capacity {
                    self.push_table(entry, capacity, &mut out)?;
                }
            }
        }
        Ok(out)
    }

    fn push_table(&mut self, sector: u32, capacity: usize, out: &mut Vec<u32>) -> Result<()> {
        let mut buf = [0u8; BSIZE];
        self.disk.read(sector, &mut buf)?;
        for entry in layout::decode_table(&buf) {
            if entry != 0 && out.len() < capacity {
                out.push(entry);
            }
        }
        Ok(())
    }

    fn load_inode(&mut self, n: u32) -> Result<Inode> {
        if n >= self.sb.num_inodes() {
            return Err(FsError::InvalidInode);
        }
        let mut buf = [0u8; BSIZE];
        self.disk.read(Inode::sector_of(n), &mut buf)?;
        Ok(Inode::decode(&buf, Inode::slot_of(n)))
    }

    fn store_inode(&mut self, n: u32, inode: &Inode) -> Result<()> {
        let sector = Inode::sector_of(n);
        let mut buf = [0u8; BSIZE];
        self.disk.read(sector, &mut buf)?;
        inode.encode(&mut buf, Inode::slot_of(n));
        self.disk.write(sector, &buf)?;
        self.disk.sync()
    }
}
