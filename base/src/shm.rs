// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! memfd-backed shared memory and host-side mappings with bounds-checked views.

use std::ffi::CString;
use std::io;
use std::marker::PhantomData;
use std::os::fd::AsRawFd;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;
use std::os::fd::RawFd;
use std::ptr;

use remain::sorted;
use thiserror::Error as ThisError;

use crate::Error as SysError;

#[sorted]
#[derive(ThisError, Debug)]
pub enum MmapError {
    #[error("failed to create memfd: {0}")]
    CreateMemfd(SysError),
    #[error("invalid memfd name")]
    InvalidName,
    #[error("range {offset}+{len} is outside the {size} byte mapping")]
    InvalidRange {
        offset: usize,
        len: usize,
        size: usize,
    },
    #[error("mmap failed: {0}")]
    Mmap(SysError),
    #[error("failed to set memfd size: {0}")]
    SetSize(SysError),
}

pub type Result<T> = std::result::Result<T, MmapError>;

/// An anonymous, sized memfd that can be shared with another process.
#[derive(Debug)]
pub struct SharedMemory {
    fd: OwnedFd,
    size: u64,
}

impl SharedMemory {
    /// Creates a memfd called `name` of `size` bytes.
    pub fn new(name: &str, size: u64) -> Result<SharedMemory> {
        let c_name = CString::new(name).map_err(|_| MmapError::InvalidName)?;
        // SAFETY: `c_name` is a valid nul-terminated string.
        let fd = unsafe { libc::memfd_create(c_name.as_ptr(), libc::MFD_CLOEXEC) };
        if fd < 0 {
            return Err(MmapError::CreateMemfd(SysError::last()));
        }
        // SAFETY: `fd` was just created and is owned by nobody else.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        // SAFETY: ftruncate has no memory side effects.
        let ret = unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) };
        if ret < 0 {
            return Err(MmapError::SetSize(SysError::last()));
        }
        Ok(SharedMemory { fd, size })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Duplicates the descriptor, e.g. to hand it to a peer.
    pub fn try_clone_fd(&self) -> io::Result<OwnedFd> {
        self.fd.try_clone()
    }
}

impl AsRawFd for SharedMemory {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// A read/write `MAP_SHARED` mapping of a [`SharedMemory`] region, unmapped on drop.
#[derive(Debug)]
pub struct MemoryMapping {
    addr: *mut u8,
    size: usize,
}

// SAFETY: the mapping is plain shared memory; every access goes through volatile copies into
// caller owned buffers so no Rust references to the mapped bytes ever exist.
unsafe impl Send for MemoryMapping {}
// SAFETY: see above.
unsafe impl Sync for MemoryMapping {}

impl MemoryMapping {
    /// Maps the whole of `shm`.
    pub fn from_shm(shm: &SharedMemory) -> Result<MemoryMapping> {
        let size = shm.size() as usize;
        // SAFETY: a fresh mapping chosen by the kernel cannot overlap existing Rust memory.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                shm.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(MmapError::Mmap(SysError::last()));
        }
        Ok(MemoryMapping {
            addr: addr as *mut u8,
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns a view of `len` bytes at `offset`, failing unless `offset + len <= size`.
    pub fn slice(&self, offset: usize, len: usize) -> Result<VolatileSlice<'_>> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(VolatileSlice {
                // SAFETY: `offset` is within the mapping.
                addr: unsafe { self.addr.add(offset) },
                len,
                phantom: PhantomData,
            }),
            _ => Err(MmapError::InvalidRange {
                offset,
                len,
                size: self.size,
            }),
        }
    }
}

impl Drop for MemoryMapping {
    fn drop(&mut self) {
        // SAFETY: `addr`/`size` describe a mapping created by `from_shm` and owned by us.
        unsafe {
            libc::munmap(self.addr as *mut libc::c_void, self.size);
        }
    }
}

/// A bounded window into a [`MemoryMapping`].
#[derive(Clone, Copy, Debug)]
pub struct VolatileSlice<'a> {
    addr: *mut u8,
    len: usize,
    phantom: PhantomData<&'a MemoryMapping>,
}

impl VolatileSlice<'_> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns a narrower view, with the same bounds rule as [`MemoryMapping::slice`].
    pub fn sub_slice(&self, offset: usize, len: usize) -> Result<Self> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(VolatileSlice {
                // SAFETY: `offset` is within this slice.
                addr: unsafe { self.addr.add(offset) },
                len,
                phantom: PhantomData,
            }),
            _ => Err(MmapError::InvalidRange {
                offset,
                len,
                size: self.len,
            }),
        }
    }

    /// Copies `min(self.len(), buf.len())` bytes out of the slice, returning the count.
    pub fn copy_to(&self, buf: &mut [u8]) -> usize {
        let count = self.len.min(buf.len());
        for (i, b) in buf.iter_mut().take(count).enumerate() {
            // SAFETY: `i < self.len`, so the read stays inside the mapping.
            *b = unsafe { ptr::read_volatile(self.addr.add(i)) };
        }
        count
    }

    /// Copies `min(self.len(), buf.len())` bytes into the slice, returning the count.
    pub fn copy_from(&self, buf: &[u8]) -> usize {
        let count = self.len.min(buf.len());
        for (i, b) in buf.iter().take(count).enumerate() {
            // SAFETY: `i < self.len`, so the write stays inside the mapping.
            unsafe { ptr::write_volatile(self.addr.add(i), *b) };
        }
        count
    }

    pub fn write_zeroes(&self) {
        for i in 0..self.len {
            // SAFETY: `i < self.len`, so the write stays inside the mapping.
            unsafe { ptr::write_volatile(self.addr.add(i), 0) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_is_shared_through_the_fd() {
        let shm = SharedMemory::new("test_shm", 4096).unwrap();
        let a = MemoryMapping::from_shm(&shm).unwrap();
        let b = MemoryMapping::from_shm(&shm).unwrap();
        a.slice(100, 4).unwrap().copy_from(&[1, 2, 3, 4]);
        let mut out = [0u8; 4];
        assert_eq!(b.slice(100, 4).unwrap().copy_to(&mut out), 4);
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn slice_bounds() {
        let shm = SharedMemory::new("test_shm", 1024).unwrap();
        let mapping = MemoryMapping::from_shm(&shm).unwrap();
        assert!(mapping.slice(0, 1024).is_ok());
        assert!(mapping.slice(1024, 0).is_ok());
        assert!(matches!(
            mapping.slice(1000, 25),
            Err(MmapError::InvalidRange { .. })
        ));
        assert!(mapping.slice(usize::MAX, 2).is_err());
        let s = mapping.slice(512, 16).unwrap();
        assert!(s.sub_slice(8, 8).is_ok());
        assert!(s.sub_slice(8, 9).is_err());
    }

    #[test]
    fn write_zeroes_clears() {
        let shm = SharedMemory::new("test_shm", 64).unwrap();
        let mapping = MemoryMapping::from_shm(&shm).unwrap();
        let s = mapping.slice(0, 8).unwrap();
        s.copy_from(&[0xff; 8]);
        s.write_zeroes();
        let mut out = [1u8; 8];
        s.copy_to(&mut out);
        assert_eq!(out, [0; 8]);
    }
}
