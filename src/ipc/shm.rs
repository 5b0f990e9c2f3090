// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Memory shared between cores.
//!
//! A [`SharedRegion`] is a `MAP_SHARED` mapping, either anonymous (cores are
//! threads of one process) or backed by a file so separate processes can
//! attach the same rings. [`RegionAllocator`] carves it into cache-line
//! aligned pieces.

use crate::status::Status;
use std::{
    fs::OpenOptions,
    io,
    os::fd::AsRawFd,
    path::Path,
    ptr::{self, NonNull},
    sync::{Arc, Mutex, PoisonError},
};
use tracing::{debug, error};

/// Cache line size assumed for every shared structure.
pub const CACHE_LINE: usize = 64;

#[derive(Debug)]
pub struct SharedRegion {
    ptr: NonNull<u8>,
    len: usize,
}

// The mapping is plain memory; every access to it goes through atomics or
// the single-writer ring protocol.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Maps `len` zeroed bytes shared by every thread of the process.
    pub fn anonymous(len: usize) -> io::Result<Self> {
        Self::map(len, libc::MAP_SHARED | libc::MAP_ANONYMOUS, -1)
    }

    /// Maps `len` bytes of `path`, creating and sizing the file as needed.
    pub fn open<P: AsRef<Path>>(path: P, len: usize) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())?;
        if file.metadata()?.len() < len as u64 {
            file.set_len(len as u64)?;
        }
        let region = Self::map(len, libc::MAP_SHARED, file.as_raw_fd())?;
        debug!("mapped {} bytes of {}", len, path.as_ref().display());
        Ok(region)
    }

    fn map(len: usize, flags: libc::c_int, fd: libc::c_int) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty region"));
        }
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                fd,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        match NonNull::new(addr as *mut u8) {
            Some(ptr) => Ok(Self { ptr, len }),
            None => Err(io::Error::other("mmap returned null")),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        let ret = unsafe { libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len) };
        if ret != 0 {
            error!("munmap failed: {}", io::Error::last_os_error());
        }
    }
}

/// A reserved, cache-line aligned window of a [`SharedRegion`].
#[derive(Debug, Clone)]
pub struct RegionSlice {
    region: Arc<SharedRegion>,
    offset: usize,
    len: usize,
}

impl RegionSlice {
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Start of the window. Valid for `len()` bytes while `self` lives.
    pub fn as_ptr(&self) -> *mut u8 {
        unsafe { self.region.as_ptr().add(self.offset) }
    }
}

/// Bump allocator over a region. Offsets are deterministic, so two sides
/// reserving in the same order agree on where each ring lives.
pub struct RegionAllocator {
    region: Arc<SharedRegion>,
    next: Mutex<usize>,
}

impl RegionAllocator {
    pub fn new(region: SharedRegion) -> Self {
        Self {
            region: Arc::new(region),
            next: Mutex::new(0),
        }
    }

    pub fn region(&self) -> &Arc<SharedRegion> {
        &self.region
    }

    /// Bytes not yet reserved.
    pub fn available(&self) -> usize {
        let next = *self.next.lock().unwrap_or_else(PoisonError::into_inner);
        self.region.len().saturating_sub(next)
    }

    pub fn reserve(&self, len: usize) -> Result<RegionSlice, Status> {
        if len == 0 {
            return Err(Status::InvalidArgument);
        }
        let mut next = self.next.lock().unwrap_or_else(PoisonError::into_inner);
        let offset = align_up(*next);
        let end = offset.checked_add(len).ok_or(Status::InvalidArgument)?;
        if end > self.region.len() {
            error!(
                "shared region exhausted: need {} bytes at {}, have {}",
                len,
                offset,
                self.region.len()
            );
            return Err(Status::Fail);
        }
        *next = end;
        Ok(RegionSlice {
            region: self.region.clone(),
            offset,
            len,
        })
    }
}

pub(crate) fn align_up(n: usize) -> usize {
    n.div_ceil(CACHE_LINE) * CACHE_LINE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservations_are_aligned_and_bounded() {
        let alloc = RegionAllocator::new(SharedRegion::anonymous(4096).unwrap());
        let a = alloc.reserve(10).unwrap();
        let b = alloc.reserve(100).unwrap();
        assert_eq!(a.offset(), 0);
        assert_eq!(b.offset(), 64);
        assert_eq!(b.as_ptr() as usize % CACHE_LINE, 0);
        assert_eq!(alloc.available(), 4096 - 164);
        assert_eq!(alloc.reserve(8192).unwrap_err(), Status::Fail);
        assert_eq!(alloc.reserve(0).unwrap_err(), Status::InvalidArgument);
    }

    #[test]
    fn anonymous_mapping_is_zeroed() {
        let region = SharedRegion::anonymous(256).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(region.as_ptr(), region.len()) };
        assert!(bytes.iter().all(|&b| b == 0));
    }
}
