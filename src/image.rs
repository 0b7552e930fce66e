//! Raw disk image allocation.

use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{HarnessError, Result};
use crate::loopdev;

pub const SECTOR_SIZE: u64 = 512;
pub const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionTable {
    Gpt,
}

/// A raw image file of a fixed size, labeled (or about to be) with GPT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskImage {
    path: PathBuf,
    size_bytes: u64,
    table: PartitionTable,
}

impl DiskImage {
    /// Refer to an image that already exists on disk.
    pub fn open(path: &Path) -> Result<Self> {
        let size_bytes = path.metadata()?.len();
        check_size(path, size_bytes)?;
        Ok(DiskImage {
            path: path.to_path_buf(),
            size_bytes,
            table: PartitionTable::Gpt,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn sectors(&self) -> u64 {
        self.size_bytes / SECTOR_SIZE
    }

    pub fn table(&self) -> PartitionTable {
        self.table
    }
}

fn check_size(path: &Path, size_bytes: u64) -> Result<()> {
    if size_bytes == 0 || size_bytes % SECTOR_SIZE != 0 {
        return Err(HarnessError::Allocation {
            path: path.to_path_buf(),
            source: io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("size {size_bytes} is not a positive multiple of {SECTOR_SIZE} bytes"),
            ),
        });
    }
    Ok(())
}

/// Create (or replace) a zero-filled image of exactly `size_bytes`.
///
/// The file is built under a temporary name next to `path` and renamed into
/// place only once fully reserved, so a failure never leaves a partial image.
pub fn allocate(path: &Path, size_bytes: u64) -> Result<DiskImage> {
    check_size(path, size_bytes)?;
    if loopdev::is_bound(path) {
        return Err(HarnessError::Allocation {
            path: path.to_path_buf(),
            source: io::Error::other("image is bound to a loop device"),
        });
    }

    let wrap = |source: io::Error| HarnessError::Allocation {
        path: path.to_path_buf(),
        source,
    };

    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let staging = tempfile::Builder::new()
        .prefix(".bootdisk-")
        .suffix(".img.partial")
        .tempfile_in(parent)
        .map_err(wrap)?;
    debug!(staging = %staging.path().display(), size_bytes, "reserving image");

    reserve(staging.as_file(), size_bytes).map_err(wrap)?;
    staging.as_file().sync_all().map_err(wrap)?;
    staging.persist(path).map_err(|e| wrap(e.error))?;

    info!(path = %path.display(), size_bytes, "allocated image");
    Ok(DiskImage {
        path: path.to_path_buf(),
        size_bytes,
        table: PartitionTable::Gpt,
    })
}

/// Size the file and make the filesystem commit the blocks, so running out
/// of space surfaces here instead of halfway through formatting.
fn reserve(file: &File, size_bytes: u64) -> io::Result<()> {
    file.set_len(size_bytes)?;
    let len = libc::off_t::try_from(size_bytes)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "image size overflows off_t"))?;
    // SAFETY: the descriptor is open for writing for the duration of the call.
    match unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, len) } {
        0 => Ok(()),
        // Filesystems without fallocate support keep the sparse file.
        libc::EOPNOTSUPP | libc::EINVAL => Ok(()),
        errno => Err(io::Error::from_raw_os_error(errno)),
    }
}
