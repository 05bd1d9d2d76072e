// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 Graft Project Developers

//! Code patching. Writes are split at page boundaries; each page is
//! raised to the platform's write protections around the copy and ends
//! back at R-X with a synchronized instruction cache.

use crate::error::HookError;
use crate::interceptor::Routing;
use crate::platform::PagePerms;

/// Writes `bytes` over `addr`. Per touched page the sequence is:
/// before-write callback, raise protections, copy, restore to R-X, flush
/// the instruction cache, after-write callback. A failed protection
/// change aborts without undoing already-written prefix pages.
pub fn patch_code(routing: &Routing, addr: usize, bytes: &[u8]) -> Result<(), HookError> {
    let page_size = routing.ops.page_size();
    let page = addr & !(page_size - 1);

    if addr + bytes.len() > page + page_size {
        let head = page + page_size - addr;
        patch_code(routing, addr, &bytes[..head])?;
        return patch_code(routing, addr + head, &bytes[head..]);
    }

    if let Some(callback) = routing.before_write {
        callback(page);
    }

    routing.ops.protect(page, page_size, routing.ops.write_perms())?;

    // SAFETY: the destination lies inside the single page made writable
    // above and cannot overlap the source buffer.
    unsafe {
        core::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len());
    }

    routing.ops.protect(page, page_size, PagePerms::RX)?;
    routing.ops.flush_icache(addr, bytes.len());

    if let Some(callback) = routing.after_write {
        callback(page);
    }

    Ok(())
}
