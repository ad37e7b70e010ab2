//! A small inode-based file system kept on a virtual disk: an ordinary
//! host file carved into fixed 1024-byte sectors. Files are unnamed and
//! addressed by inode number; each inode maps file bytes onto sectors
//! through four direct pointers, a single-indirect block and a
//! double-indirect block.

pub mod bitmap;
pub mod error;
pub mod fs;
pub mod layout;
pub mod vdisk;
