//! File-backed shared memory regions.
//!
//! A region is created by the supervisor and attached by workers from its
//! path. Every process maps the file itself and derives its own pointers from
//! that mapping; nothing address-dependent ever crosses the process boundary.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use memmap2::{MmapMut, MmapOptions};
use tempfile::NamedTempFile;

use crate::error::RingError;

/// Header alignment; slot payloads start on this boundary.
pub const REGION_ALIGN: usize = 64;

pub const fn align_up(value: usize) -> usize {
    (value + REGION_ALIGN - 1) & !(REGION_ALIGN - 1)
}

/// Preferred directory for backing files (`/dev/shm` keeps pages in RAM).
pub fn shm_dir() -> PathBuf {
    let dev_shm = Path::new("/dev/shm");
    if dev_shm.is_dir() {
        dev_shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}

pub struct SharedRegion {
    path: PathBuf,
    base: NonNull<u8>,
    len: usize,
    _mmap: MmapMut,
    _file: File,
    // Held only by the creating process; dropping it unlinks the file.
    _owner: Option<NamedTempFile>,
}

// The mapping is plain bytes; concurrent access is coordinated through the
// atomics each region type places in its header.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("path", &self.path)
            .field("len", &self.len)
            .field("owner", &self._owner.is_some())
            .finish()
    }
}

impl SharedRegion {
    /// Creates a zero-filled region of `len` bytes.
    pub fn create(prefix: &str, len: usize) -> Result<Self, RingError> {
        let dir = shm_dir();
        let owner = tempfile::Builder::new()
            .prefix(prefix)
            .tempfile_in(&dir)
            .map_err(|source| RingError::Io {
                path: dir.clone(),
                source,
            })?;
        let path = owner.path().to_path_buf();
        let file = owner.reopen().map_err(|source| RingError::Io {
            path: path.clone(),
            source,
        })?;
        file.set_len(len as u64).map_err(|source| RingError::Io {
            path: path.clone(),
            source,
        })?;
        Self::map(path, file, len, Some(owner))
    }

    /// Maps an existing region, checking it holds at least `min_len` bytes.
    pub fn attach(path: &Path, min_len: usize) -> Result<Self, RingError> {
        let file = File::options()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| RingError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let actual = file
            .metadata()
            .map_err(|source| RingError::Io {
                path: path.to_path_buf(),
                source,
            })?
            .len() as usize;
        if actual < min_len {
            return Err(RingError::TooSmall {
                path: path.to_path_buf(),
                expected: min_len,
                actual,
            });
        }
        Self::map(path.to_path_buf(), file, actual, None)
    }

    fn map(
        path: PathBuf,
        file: File,
        len: usize,
        owner: Option<NamedTempFile>,
    ) -> Result<Self, RingError> {
        let mut mmap = unsafe { MmapOptions::new().len(len).map_mut(&file) }.map_err(|source| {
            RingError::Io {
                path: path.clone(),
                source,
            }
        })?;
        let base = NonNull::new(mmap.as_mut_ptr()).ok_or_else(|| RingError::TooSmall {
            path: path.clone(),
            expected: len,
            actual: 0,
        })?;
        Ok(Self {
            path,
            base,
            len,
            _mmap: mmap,
            _file: file,
            _owner: owner,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_owner(&self) -> bool {
        self._owner.is_some()
    }

    /// Base pointer of this process's mapping.
    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }
}
