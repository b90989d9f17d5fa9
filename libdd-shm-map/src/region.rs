// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Owned `MAP_SHARED` mappings, either of a file or anonymous.
//!
//! An anonymous mapping is shared with children forked after it was created.
//! A file mapping is shared with every process that maps the same file, and
//! its contents outlive the processes.

use crate::error::ShmMapError;
use core::ffi::c_void;
use core::ptr::NonNull;
use nix::errno::Errno;
use nix::sys::mman::{mmap, mmap_anonymous, msync, munmap, MapFlags, MsFlags, ProtFlags};
use std::fs::{File, OpenOptions};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use tracing::debug;

enum Backing {
    Anonymous,
    File { path: PathBuf, _file: File },
}

pub struct MappedRegion {
    ptr: NonNull<u8>,
    len: usize,
    backing: Backing,
}

// SAFETY: the region is plain shared memory. Everything that mutates it goes
// through atomics or a segment lock.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

fn map_len(len: usize) -> Result<NonZeroUsize, ShmMapError> {
    NonZeroUsize::new(len).ok_or(ShmMapError::Mmap(Errno::EINVAL))
}

impl MappedRegion {
    /// Zero-filled anonymous shared mapping of `len` bytes.
    pub fn anonymous(len: usize) -> Result<Self, ShmMapError> {
        let ptr = unsafe {
            mmap_anonymous(
                None,
                map_len(len)?,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED | MapFlags::MAP_ANONYMOUS,
            )?
        };
        Ok(MappedRegion {
            ptr: ptr.cast(),
            len,
            backing: Backing::Anonymous,
        })
    }

    /// Creates (or truncates) `path`, sizes it to `len` zero bytes and maps it.
    pub fn create_file(path: &Path, len: usize) -> Result<Self, ShmMapError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len as u64)?;
        Self::map_file(path, file, len)
    }

    /// Maps an existing file in full.
    pub fn open_file(path: &Path) -> Result<Self, ShmMapError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = usize::try_from(file.metadata()?.len())
            .map_err(|_| ShmMapError::Corruption(format!("{} is too large to map", path.display())))?;
        if len == 0 {
            return Err(ShmMapError::Corruption(format!("{} is empty", path.display())));
        }
        Self::map_file(path, file, len)
    }

    fn map_file(path: &Path, file: File, len: usize) -> Result<Self, ShmMapError> {
        let ptr = unsafe {
            mmap(
                None,
                map_len(len)?,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &file,
                0,
            )?
        };
        debug!(path = %path.display(), len, "mapped region file");
        Ok(MappedRegion {
            ptr: ptr.cast(),
            len,
            backing: Backing::File {
                path: path.to_path_buf(),
                _file: file,
            },
        })
    }

    #[inline]
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Backing file, or `None` for an anonymous region.
    pub fn path(&self) -> Option<&Path> {
        match &self.backing {
            Backing::Anonymous => None,
            Backing::File { path, .. } => Some(path),
        }
    }

    /// Writes dirty pages of a file-backed region to disk. No-op for
    /// anonymous regions.
    pub fn flush(&self) -> Result<(), ShmMapError> {
        if matches!(self.backing, Backing::Anonymous) || self.len == 0 {
            return Ok(());
        }
        unsafe { msync(self.ptr.cast::<c_void>(), self.len, MsFlags::MS_SYNC)? };
        Ok(())
    }

    /// Unmaps the region, reporting failure instead of swallowing it as
    /// `Drop` does. A backing file is left in place.
    pub fn close(mut self) -> Result<(), ShmMapError> {
        self.unmap()?;
        Ok(())
    }

    fn unmap(&mut self) -> nix::Result<()> {
        let len = core::mem::replace(&mut self.len, 0);
        if len == 0 {
            return Ok(());
        }
        unsafe { munmap(self.ptr.cast::<c_void>(), len) }
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        if let Err(err) = self.unmap() {
            debug!(%err, "failed to unmap region");
        }
    }
}
