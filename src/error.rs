use std::io;

use thiserror::Error;

/// Failures surfaced by the device adapter and every engine operation.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("no disk is mounted")]
    NotMounted,
    #[error("a disk is already mounted")]
    AlreadyMounted,
    #[error("disk image could not be opened for read/write")]
    NoAccess,
    #[error("disk image does not exist")]
    NotExist,
    #[error("not a valid file system image")]
    BadMagic,
    #[error("no space left on disk")]
    NoSpace,
    #[error("sector or block index out of range")]
    OutOfRange,
    #[error("inode number out of range")]
    InvalidInode,
    #[error("inode is not in use")]
    Unused,
    #[error("invalid argument")]
    BadArgs,
    #[error("short transfer on sector {0}")]
    ShortIo(u32),
    #[error("disk i/o failed: {0}")]
    Io(#[from] io::Error),
}

impl FsError {
    /// Stable negative code reported at the command-line boundary.
    pub fn code(&self) -> i32 {
        match self {
            FsError::NotMounted => -1,
            FsError::NoAccess => -2,
            FsError::NotExist => -3,
            FsError::OutOfRange => -4,
            FsError::ShortIo(_) => -5,
            FsError::AlreadyMounted => -6,
            FsError::NoSpace => -7,
            FsError::BadMagic => -9,
            FsError::InvalidInode => -11,
            FsError::Unused => -12,
            FsError::Io(_) => -13,
            FsError::BadArgs => -15,
        }
    }
}

pub type Result<T> = std::result::Result<T, FsError>;
