// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 Graft Project Developers

use core::ffi::{c_int, c_uint, c_void};
use core::ptr;

use log::error;

use super::{MemoryOps, PagePerms};
use crate::error::MemError;

const VM_PROT_READ: c_int = 0x01;
const VM_PROT_WRITE: c_int = 0x02;
const VM_PROT_EXECUTE: c_int = 0x04;
const VM_PROT_COPY: c_int = 0x10;

const KERN_SUCCESS: c_int = 0;

unsafe extern "C" {
    fn mach_task_self() -> c_uint;
    fn vm_protect(
        task: c_uint,
        address: usize,
        size: usize,
        set_maximum: c_int,
        new_protection: c_int,
    ) -> c_int;
    fn sys_icache_invalidate(start: *mut c_void, len: usize);
}

fn prot_bits(perms: PagePerms) -> c_int {
    let mut prot = 0;
    if perms.contains(PagePerms::READ) {
        prot |= VM_PROT_READ;
    }
    if perms.contains(PagePerms::WRITE) {
        prot |= VM_PROT_WRITE;
    }
    if perms.contains(PagePerms::EXEC) {
        prot |= VM_PROT_EXECUTE;
    }
    if perms.contains(PagePerms::COPY) {
        prot |= VM_PROT_COPY;
    }
    prot
}

/// Mach VM-backed capability implementation.
#[derive(Debug)]
pub struct DarwinMemoryOps;

impl MemoryOps for DarwinMemoryOps {
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
                libc::MAP_PRIVATE | libc::MAP_ANON,
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
        // SAFETY: vm_protect only changes access rights on this task's
        // address space.
        let kr = unsafe { vm_protect(mach_task_self(), addr, len, 0, prot_bits(perms)) };
        if kr != KERN_SUCCESS {
            error!("vm_protect() failed: {kr}");
            return Err(MemError::Permission);
        }
        Ok(())
    }

    fn write_perms(&self) -> PagePerms {
        // Copy-on-write keeps other tenants of a shared page intact.
        PagePerms::READ | PagePerms::WRITE | PagePerms::COPY
    }

    fn flush_icache(&self, addr: usize, len: usize) {
        // SAFETY: the range was just written by this runtime.
        unsafe { sys_icache_invalidate(addr as *mut c_void, len) }
    }

    #[cfg(target_arch = "aarch64")]
    fn strip_ptr_auth(&self, addr: usize) -> usize {
        let stripped: usize;
        // SAFETY: xpaci only rewrites the register it is given.
        unsafe {
            core::arch::asm!(
                "mov x17, {addr}",
                "xpaci x17",
                "mov {stripped}, x17",
                addr = in(reg) addr,
                stripped = out(reg) stripped,
                out("x17") _,
            );
        }
        stripped
    }

    #[cfg(target_arch = "aarch64")]
    fn sign_ptr_auth(&self, addr: usize) -> usize {
        let signed: usize;
        // SAFETY: pacia signs the register pair it is given.
        unsafe {
            core::arch::asm!(
                "mov x17, {addr}",
                "mov x16, xzr",
                "pacia x17, x16",
                "mov {signed}, x17",
                addr = in(reg) addr,
                signed = out(reg) signed,
                out("x16") _,
                out("x17") _,
            );
        }
        signed
    }
}
