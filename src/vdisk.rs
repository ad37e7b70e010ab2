//! Sector-addressed access to a virtual disk: an ordinary host file carved
//! into fixed-size sectors. The device layer is an opaque byte store and
//! knows nothing about the structures kept on it.

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::ops::Range;
use std::os::unix::fs::FileExt;
use std::path::Path;

use log::debug;

use crate::error::{FsError, Result};
use crate::layout::BSIZE;

/// A sector-addressed byte store. Transfers are whole sectors; partial
/// transfers are errors. Closing is dropping.
pub trait Disk {
    /// Number of sectors on the device.
    fn sectors(&self) -> u32;

    /// Reads one full sector.
    fn read(&mut self, sector: u32, buf: &mut [u8; BSIZE]) -> Result<()>;

    /// Writes one full sector.
    fn write(&mut self, sector: u32, buf: &[u8; BSIZE]) -> Result<()>;

    /// Flushes host buffers and requests a durable write-back.
    fn sync(&mut self) -> Result<()>;
}

/// A disk image backed by a host file.
#[derive(Debug)]
pub struct FileDisk {
    file: File,
    sectors: u32,
}

impl FileDisk {
    /// Opens an image file for read/write. The sector count is the file
    /// length divided by the sector size, rounded down; an image smaller
    /// than one sector refuses to open.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|err| match err.kind() {
                ErrorKind::NotFound => FsError::NotExist,
                ErrorKind::PermissionDenied => FsError::NoAccess,
                _ => FsError::Io(err),
            })?;
        let sectors = (file.metadata()?.len() / BSIZE as u64) as u32;
        if sectors == 0 {
            return Err(FsError::NoSpace);
        }
        debug!("opened {} ({sectors} sectors)", path.display());
        Ok(Self { file, sectors })
    }

    fn offset_of(&self, sector: u32) -> Result<u64> {
        if sector >= self.sectors {
            return Err(FsError::OutOfRange);
        }
        Ok(sector as u64 * BSIZE as u64)
    }
}

impl Disk for FileDisk {
    fn sectors(&self) -> u32 {
        self.sectors
    }

    fn read(&mut self, sector: u32, buf: &mut [u8; BSIZE]) -> Result<()> {
        let at = self.offset_of(sector)?;
        if self.file.read_at(buf, at)? != BSIZE {
            return Err(FsError::ShortIo(sector));
        }
        Ok(())
    }

    fn write(&mut self, sector: u32, buf: &[u8; BSIZE]) -> Result<()> {
        let at = self.offset_of(sector)?;
        if self.file.write_at(buf, at)? != BSIZE {
            return Err(FsError::ShortIo(sector));
        }
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// An in-memory disk image, for tests and scripted exercises.
#[derive(Debug, Clone)]
pub struct MemDisk {
    data: Vec<u8>,
}

impl MemDisk {
    /// Creates a zero-filled image of `sectors` sectors.
    pub fn new(sectors: u32) -> Self {
        Self {
            data: vec![0; sectors as usize * BSIZE],
        }
    }

    fn range_of(&self, sector: u32) -> Result<Range<usize>> {
        let at = sector as usize * BSIZE;
        if at >= self.data.len() {
            return Err(FsError::OutOfRange);
        }
        Ok(at..at + BSIZE)
    }
}

impl Disk for MemDisk {
    fn sectors(&self) -> u32 {
        (self.data.len() / BSIZE) as u32
    }

    fn read(&mut self, sector: u32, buf: &mut [u8; BSIZE]) -> Result<()> {
        let range = self.range_of(sector)?;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write(&mut self, sector: u32, buf: &[u8; BSIZE]) -> Result<()> {
        let range = self.range_of(sector)?;
        self.data[range].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::NamedTempFile;

    use super::*;

    fn image(sectors: u64) -> NamedTempFile {
        let file = NamedTempFile::new().unwrap();
        file.as_file().set_len(sectors * BSIZE as u64).unwrap();
        file
    }

    #[test]
    fn open_missing_image() {
        let err = FileDisk::open(Path::new("/no/such/image")).unwrap_err();
        assert!(matches!(err, FsError::NotExist));
    }

    #[test]
    fn open_empty_image() {
        let file = NamedTempFile::new().unwrap();
        assert!(matches!(
            FileDisk::open(file.path()),
            Err(FsError::NoSpace)
        ));
    }

    #[test]
    fn sector_count_rounds_down() {
        let file = NamedTempFile::new().unwrap();
        file.as_file().set_len(3 * BSIZE as u64 + 100).unwrap();
        let disk = FileDisk::open(file.path()).unwrap();
        assert_eq!(disk.sectors(), 3);
    }

    #[test]
    fn file_disk_roundtrip() {
        let file = image(4);
        let mut disk = FileDisk::open(file.path()).unwrap();

        let mut data = [0u8; BSIZE];
        data[0] = 0xab;
        data[BSIZE - 1] = 0xcd;
        disk.write(2, &data).unwrap();
        disk.sync().unwrap();

        let mut back = [0u8; BSIZE];
        disk.read(2, &mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn file_disk_rejects_out_of_range() {
        let file = image(4);
        let mut disk = FileDisk::open(file.path()).unwrap();
        let mut buf = [0u8; BSIZE];
        assert!(matches!(disk.read(4, &mut buf), Err(FsError::OutOfRange)));
        assert!(matches!(disk.write(4, &buf), Err(FsError::OutOfRange)));
    }

    #[test]
    fn mem_disk_roundtrip() {
        let mut disk = MemDisk::new(8);
        assert_eq!(disk.sectors(), 8);

        let mut data = [0u8; BSIZE];
        data[17] = 42;
        disk.write(7, &data).unwrap();

        let mut back = [0u8; BSIZE];
        disk.read(7, &mut back).unwrap();
        assert_eq!(back, data);

        assert!(matches!(disk.read(8, &mut back), Err(FsError::OutOfRange)));
    }
}
