//! File-backed shared memory mappings

use std::{
    fs::{File, OpenOptions},
    io::ErrorKind as IoErrorKind,
    os::unix::{
        fs::{MetadataExt, OpenOptionsExt},
        io::AsRawFd,
    },
    path::{Path, PathBuf},
    ptr::NonNull,
};

use memmap2::{Mmap, MmapMut, MmapOptions};

use crate::error::{Result, SeuratError};

/// Permissions of newly created segment files
const SEGMENT_MODE: u32 = 0o660;

/// A writable mapping of a segment file
#[derive(Debug)]
pub struct SharedMemoryRegion {
    path: PathBuf,
    mmap: MmapMut,
    base: NonNull<u8>,
    inode: u64,
    _file: File,
}

impl SharedMemoryRegion {
    /// Exclusively create a file of `size` zero bytes and map it.
    ///
    /// Returns `Ok(None)` when the file already exists, i.e. another process
    /// won the creation race.
    pub fn create(path: &Path, size: usize) -> Result<Option<Self>> {
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(SEGMENT_MODE)
            .open(path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == IoErrorKind::AlreadyExists => return Ok(None),
            Err(e) => return Err(SeuratError::from_io(e, "Failed to create segment file")),
        };

        if let Err(e) = file.set_len(size as u64) {
            let _ = std::fs::remove_file(path);
            return Err(SeuratError::from_io(e, "Failed to set segment size"));
        }

        if let Err(e) = reserve(&file, size) {
            let _ = std::fs::remove_file(path);
            return Err(e);
        }

        match Self::map(path, file, size) {
            Ok(region) => Ok(Some(region)),
            Err(e) => {
                let _ = std::fs::remove_file(path);
                Err(e)
            }
        }
    }

    /// Map an existing file in full.
    ///
    /// Returns `Ok(None)` when the file vanished or is still shorter than
    /// `min_len` (its creator has not sized it yet).
    pub fn open(path: &Path, min_len: usize) -> Result<Option<Self>> {
        let file = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SeuratError::from_io(e, "Failed to open segment file")),
        };

        let len = file
            .metadata()
            .map_err(|e| SeuratError::from_io(e, "Failed to stat segment file"))?
            .len() as usize;
        if len < min_len {
            return Ok(None);
        }

        Self::map(path, file, len).map(Some)
    }

    fn map(path: &Path, file: File, len: usize) -> Result<Self> {
        let inode = file
            .metadata()
            .map_err(|e| SeuratError::from_io(e, "Failed to stat segment file"))?
            .ino();

        let mut mmap = unsafe {
            MmapOptions::new()
                .len(len)
                .map_mut(&file)
                .map_err(|e| SeuratError::from_io(e, "Failed to create memory mapping"))?
        };

        let base = NonNull::new(mmap.as_mut_ptr())
            .ok_or_else(|| SeuratError::platform("Memory mapping returned a null pointer"))?;

        Ok(Self {
            path: path.to_path_buf(),
            mmap,
            base,
            inode,
            _file: file,
        })
    }

    /// Base pointer of the mapping
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Get the size of the mapping
    pub fn size(&self) -> usize {
        self.mmap.len()
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Inode of the backing file at open time
    pub fn inode(&self) -> u64 {
        self.inode
    }

    /// Check that the path still names the file this region maps
    pub fn is_linked(&self) -> bool {
        std::fs::metadata(&self.path)
            .map(|meta| meta.ino() == self.inode)
            .unwrap_or(false)
    }
}

// The mapping is shared memory accessed through atomics and raw pointers.
unsafe impl Send for SharedMemoryRegion {}
unsafe impl Sync for SharedMemoryRegion {}

/// A read-only mapping used by discovery
#[derive(Debug)]
pub struct ReadOnlyRegion {
    mmap: Mmap,
}

impl ReadOnlyRegion {
    /// Map a segment file read-only; `Ok(None)` when it is missing or shorter
    /// than `min_len`
    pub fn open(path: &Path, min_len: usize) -> Result<Option<Self>> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SeuratError::from_io(e, "Failed to open segment file")),
        };

        let len = file
            .metadata()
            .map_err(|e| SeuratError::from_io(e, "Failed to stat segment file"))?
            .len() as usize;
        if len < min_len {
            return Ok(None);
        }

        let mmap = unsafe {
            MmapOptions::new()
                .len(len)
                .map(&file)
                .map_err(|e| SeuratError::from_io(e, "Failed to create memory mapping"))?
        };

        Ok(Some(Self { mmap }))
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.mmap.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.mmap.len()
    }
}

/// Allocate every page of a fresh segment file. A full shared memory mount
/// then fails creation with `ResourceExhausted` instead of raising SIGBUS on
/// the first write to a page that cannot be backed.
#[cfg(any(target_os = "linux", target_os = "freebsd"))]
fn reserve(file: &File, size: usize) -> Result<()> {
    if size == 0 {
        return Ok(());
    }
    nix::fcntl::posix_fallocate(file.as_raw_fd(), 0, size as libc::off_t).map_err(|errno| {
        SeuratError::from_io(std::io::Error::from(errno), "Failed to reserve segment memory")
    })
}

#[cfg(not(any(target_os = "linux", target_os = "freebsd")))]
fn reserve(_file: &File, _size: usize) -> Result<()> {
    Ok(())
}
