// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 Graft Project Developers

use core::ptr;
use std::ffi::CString;

use log::debug;

use crate::ResolveError;

/// Read-write private mapping of (part of) a file, unmapped on drop.
/// Private so symbol-table fixups applied by tools never reach the disk.
#[derive(Debug)]
pub struct FileMap {
    base: *mut libc::c_void,
    len: usize,
}

impl FileMap {
    /// Maps the whole file at `path`.
    pub fn open(path: &str) -> Result<Self, ResolveError> {
        let (fd, len) = open_sized(path)?;
        Self::from_fd(fd, 0, len)
    }

    /// Maps `len` bytes of the file at `path` starting at `offset`, which
    /// must be page aligned.
    #[cfg(target_os = "macos")]
    pub fn open_range(path: &str, offset: u64, len: usize) -> Result<Self, ResolveError> {
        let (fd, _) = open_sized(path)?;
        Self::from_fd(fd, offset, len)
    }

    fn from_fd(fd: libc::c_int, offset: u64, len: usize) -> Result<Self, ResolveError> {
        // SAFETY: anonymous placement of a private file mapping; the fd is
        // no longer needed once the mapping exists.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE,
                fd,
                offset as libc::off_t,
            )
        };
        // SAFETY: fd came from a successful open.
        unsafe {
            libc::close(fd);
        }
        if base == libc::MAP_FAILED {
            debug!("mmap() failed");
            return Err(ResolveError::Mapping);
        }
        Ok(Self { base, len })
    }

    pub fn bytes(&self) -> &[u8] {
        // SAFETY: the mapping covers `len` readable bytes for the lifetime
        // of self.
        unsafe { core::slice::from_raw_parts(self.base as *const u8, self.len) }
    }

    /// Address the file contents were mapped at.
    pub fn addr(&self) -> usize {
        self.base as usize
    }
}

impl Drop for FileMap {
    fn drop(&mut self) {
        // SAFETY: base/len describe a mapping this struct owns.
        unsafe {
            libc::munmap(self.base, self.len);
        }
    }
}

fn open_sized(path: &str) -> Result<(libc::c_int, usize), ResolveError> {
    let cpath = CString::new(path).map_err(|_| ResolveError::FileIo)?;
    // SAFETY: read-only open of a NUL-terminated path.
    let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_RDONLY) };
    if fd < 0 {
        return Err(ResolveError::FileIo);
    }
    let mut stat = core::mem::MaybeUninit::<libc::stat>::uninit();
    // SAFETY: fstat fills the buffer it is handed.
    let rc = unsafe { libc::fstat(fd, stat.as_mut_ptr()) };
    if rc != 0 {
        // SAFETY: fd came from a successful open.
        unsafe {
            libc::close(fd);
        }
        return Err(ResolveError::FileIo);
    }
    // SAFETY: fstat succeeded, the buffer is initialized.
    let len = unsafe { stat.assume_init() }.st_size as usize;
    Ok((fd, len))
}
