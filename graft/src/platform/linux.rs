// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 Graft Project Developers

use core::ptr;

use log::error;

use super::{MemoryOps, PagePerms, flush_icache_range};
use crate::error::MemError;

fn prot_bits(perms: PagePerms) -> libc::c_int {
    let mut prot = 0;
    if perms.contains(PagePerms::READ) {
        prot |= libc::PROT_READ;
    }
    if perms.contains(PagePerms::WRITE) {
        prot |= libc::PROT_WRITE;
    }
    if perms.contains(PagePerms::EXEC) {
        prot |= libc::PROT_EXEC;
    }
    prot
}

/// `mmap`/`mprotect`-backed capability implementation.
#[derive(Debug)]
pub struct LinuxMemoryOps;

impl MemoryOps for LinuxMemoryOps {
    fn page_size(&self) -> usize {
        // SAFETY: sysconf has no memory-safety preconditions.
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    }

    fn map_anon(&self, len: usize) -> Result<usize, MemError> {
        // SAFETY: anonymous private mapping, kernel-chosen placement.
        let region = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if region == libc::MAP_FAILED {
            error!("mmap() failed");
            return Err(MemError::Mapping);
        }
        Ok(region as usize)
    }

    fn protect(&self, addr: usize, len: usize, perms: PagePerms) -> Result<(), MemError> {
        // SAFETY: mprotect only changes access rights; the caller owns the
        // addressed region.
        let rc = unsafe { libc::mprotect(addr as *mut libc::c_void, len, prot_bits(perms)) };
        if rc != 0 {
            error!("mprotect() failed");
            return Err(MemError::Permission);
        }
        Ok(())
    }

    fn write_perms(&self) -> PagePerms {
        PagePerms::READ | PagePerms::WRITE | PagePerms::EXEC
    }

    fn flush_icache(&self, addr: usize, len: usize) {
        flush_icache_range(addr, len);
    }
}
