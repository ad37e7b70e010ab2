use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use log::{error, info};

use ssfs::error::{FsError, Result};
use ssfs::fs::{self, FileSystem};
use ssfs::layout::BSIZE;

#[derive(Parser)]
#[command(name = "ssfs", version, about = "Operate on an ssfs disk image")]
struct Cli {
    #[command(flatten)]
    verbose: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Install a fresh file system on a disk image
    Format {
        image: PathBuf,
        #[arg(allow_negative_numbers = true)]
        inodes: i64,
    },
    /// Check that a disk image mounts cleanly
    Mount { image: PathBuf },
    /// Release the mounted disk
    Unmount,
    /// Allocate a new file and print its inode number
    Create { image: PathBuf },
    /// Print the size in bytes of a file
    Stat { image: PathBuf, inode: u32 },
    /// Delete a file, zeroing and freeing its sectors
    Delete { image: PathBuf, inode: u32 },
    /// Read bytes from a file and hex-dump them
    Read {
        image: PathBuf,
        inode: u32,
        #[arg(allow_negative_numbers = true)]
        len: i64,
        #[arg(allow_negative_numbers = true)]
        offset: i64,
    },
    /// Write bytes to a file
    Write {
        image: PathBuf,
        inode: u32,
        bytes: String,
        #[arg(allow_negative_numbers = true)]
        len: i64,
        #[arg(allow_negative_numbers = true)]
        offset: i64,
    },
    /// Print the physical sectors backing a file
    Blocks { image: PathBuf, inode: u32 },
    /// Run a canned end-to-end exercise against a disk image
    Script { image: PathBuf },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    env_logger::Builder::new()
        .filter_level(cli.verbose.log_level_filter())
        .init();

    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::from(-err.code() as u8)
        }
    }
}

fn run(command: Command) -> Result<()> {
    match command {
        Command::Format { image, inodes } => {
            fs::format(&image, inodes.clamp(1, u32::MAX as i64) as u32)?;
            println!("formatted {}", image.display());
            Ok(())
        }
        Command::Mount { image } => {
            let fs = FileSystem::mount(&image)?;
            println!("{} mounts cleanly", image.display());
            fs.unmount();
            Ok(())
        }
        Command::Unmount => Err(FsError::NotMounted),
        Command::Create { image } => {
            let mut fs = FileSystem::mount(&image)?;
            println!("{}", fs.create()?);
            Ok(())
        }
        Command::Stat { image, inode } => {
            let mut fs = FileSystem::mount(&image)?;
            println!("{}", fs.stat(inode)?);
            Ok(())
        }
        Command::Delete { image, inode } => {
            let mut fs = FileSystem::mount(&image)?;
            fs.delete(inode)
        }
        Command::Read {
            image,
            inode,
            len,
            offset,
        } => {
            let (len, offset) = checked_range(len, offset)?;
            let mut fs = FileSystem::mount(&image)?;
            let mut buf = vec![0u8; len];
            let n = fs.read(inode, &mut buf, offset)?;
            hex_dump(&buf[..n]);
            println!("{n} bytes read");
            Ok(())
        }
        Command::Write {
            image,
            inode,
            bytes,
            len,
            offset,
        } => {
            let (len, offset) = checked_range(len, offset)?;
            let data = bytes.as_bytes();
            let len = len.min(data.len());
            let mut fs = FileSystem::mount(&image)?;
            let n = fs.write(inode, &data[..len], offset)?;
            println!("{n} bytes written");
            Ok(())
        }
        Command::Blocks { image, inode } => {
            let mut fs = FileSystem::mount(&image)?;
            for sector in fs.blocks(inode)? {
                println!("{sector}");
            }
            Ok(())
        }
        Command::Script { image } => script(&image),
    }
}

/// Rejects the negative lengths and offsets the engine's unsigned types
/// cannot express.
fn checked_range(len: i64, offset: i64) -> Result<(usize, u32)> {
    if len < 0 || offset < 0 || offset > u32::MAX as i64 {
        return Err(FsError::BadArgs);
    }
    Ok((len as usize, offset as u32))
}

fn hex_dump(data: &[u8]) {
    for (i, byte) in data.iter().enumerate() {
        print!("{byte:02x}");
        if (i + 1) % 16 == 0 {
            println!();
        }
    }
    if data.len() % 16 != 0 {
        println!();
    }
}

/// A canned exercise: format, fill one file across the direct/indirect
/// boundary, read it back, punch a gapped write into a second file, then
/// delete both.
fn script(image: &Path) -> Result<()> {
    info!("formatting {}", image.display());
    fs::format(image, 34)?;
    let mut fs = FileSystem::mount(image)?;

    let first = fs.create()?;
    let pattern: Vec<u8> = (0..5 * BSIZE).map(|i| (i % 251) as u8).collect();
    let written = fs.write(first, &pattern, 0)?;
    info!(
        "inode {first}: wrote {written} bytes across {} sectors",
        fs.blocks(first)?.len()
    );

    let mut back = vec![0u8; written];
    let read = fs.read(first, &mut back, 0)?;
    if back[..read] == pattern[..read] {
        info!("inode {first}: read back {read} bytes intact");
    } else {
        error!("inode {first}: read back {read} bytes, contents differ");
    }

    let second = fs.create()?;
    fs.write(second, &[0x01], 2048)?;
    info!(
        "inode {second}: {} bytes after a gapped write",
        fs.stat(second)?
    );

    fs.delete(first)?;
    fs.delete(second)?;
    info!("deleted inodes {first} and {second}");

    fs.unmount();
    Ok(())
}
