// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 Graft Project Developers

//! Hook bookkeeping: the process-wide registry of installed hooks and the
//! install/uninstall paths over it.

use std::sync::{LazyLock, Mutex, MutexGuard, PoisonError};

use aarch64::Assembler;
use intrusive_collections::{LinkedList, LinkedListLink, intrusive_adapter};
use log::debug;

use crate::PageWriteFn;
use crate::error::HookError;
use crate::mm::arena::CodeArena;
use crate::mm::patch::patch_code;
use crate::platform::{MemoryOps, platform};
use crate::relocate::relocate_code;
use crate::trampoline::emit_trampoline;
use crate::types::MemRegion;

/// Resolved write-path capabilities carried by each hook.
pub(crate) struct Routing {
    pub ops: &'static dyn MemoryOps,
    pub before_write: Option<PageWriteFn>,
    pub after_write: Option<PageWriteFn>,
    pub replacement: usize,
}

/// One installed hook. `patched` covers the overwritten target entry,
/// `relocated` is the arena slice holding the rewritten prologue handed
/// to the caller, and `original` preserves the displaced bytes.
struct HookEntry {
    link: LinkedListLink,
    patched: MemRegion,
    relocated: MemRegion,
    original: Vec<u8>,
    routing: Routing,
}

// SAFETY: entries are only reachable through the registry mutex; the
// intrusive link pointers never leave it.
unsafe impl Send for HookEntry {}

intrusive_adapter!(HookAdapter = Box<HookEntry>: HookEntry { link: LinkedListLink });

/// The hook table and the executable-region allocator share one lifetime:
/// constructed on first install, reset when the last hook goes away.
struct Registry {
    hooks: LinkedList<HookAdapter>,
    arena: CodeArena,
}

static REGISTRY: LazyLock<Mutex<Registry>> = LazyLock::new(|| {
    Mutex::new(Registry {
        hooks: LinkedList::new(HookAdapter::new()),
        arena: CodeArena::new(),
    })
});

fn registry() -> MutexGuard<'static, Registry> {
    REGISTRY.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn install(
    target: usize,
    replacement: usize,
    before_write: Option<PageWriteFn>,
    after_write: Option<PageWriteFn>,
) -> Result<usize, HookError> {
    if target == 0 || replacement == 0 {
        return Err(HookError::NullArgument);
    }

    let ops = platform();
    let target = ops.strip_ptr_auth(target);
    let replacement = ops.strip_ptr_auth(replacement);
    let routing = Routing {
        ops,
        before_write,
        after_write,
        replacement,
    };

    let mut registry = registry();

    let trampoline = emit_trampoline(target, replacement)?;
    let mut patched = MemRegion::new(target, trampoline.len());

    // Rewrite the displaced instructions, then rejoin the first
    // un-patched one.
    let mut asm = Assembler::new();
    relocate_code(&mut patched, &mut asm)?;
    asm.literal_branch(patched.end() as u64);
    let image = asm.finish();
    if image.is_empty() {
        return Err(HookError::RoutingFailure);
    }

    let relocated = registry.arena.alloc(routing.ops, image.len())?;
    patch_code(&routing, relocated.start, &image)?;

    // The target keeps running its own bytes until the relocated copy is
    // resident; only now is it safe to save and overwrite them.
    // SAFETY: the target entry is mapped code, readable for at least the
    // patched range.
    let original =
        unsafe { core::slice::from_raw_parts(target as *const u8, patched.size) }.to_vec();

    patch_code(&routing, target, &trampoline)?;

    debug!(
        "installed hook at {target:#x} -> {replacement:#x}, original at {:#x}",
        relocated.start
    );

    registry.hooks.push_back(Box::new(HookEntry {
        link: LinkedListLink::new(),
        patched,
        relocated,
        original,
        routing,
    }));

    Ok(ops.sign_ptr_auth(relocated.start))
}

pub(crate) fn uninstall(target: usize) -> Result<(), HookError> {
    if target == 0 {
        return Err(HookError::NullArgument);
    }
    let target = platform().strip_ptr_auth(target);

    let mut registry = registry();
    let mut found = false;
    {
        let mut cursor = registry.hooks.front_mut();
        while let Some(entry) = cursor.get() {
            if entry.patched.start != target {
                cursor.move_next();
                continue;
            }
            patch_code(&entry.routing, entry.patched.start, &entry.original)?;
            cursor.remove();
            found = true;
            break;
        }
    }
    if !found {
        return Err(HookError::NotFound);
    }

    if registry.hooks.is_empty() {
        registry.arena.reset();
    }
    Ok(())
}

pub(crate) fn uninstall_all() {
    let mut registry = registry();
    while let Some(entry) = registry.hooks.pop_front() {
        let _ = patch_code(&entry.routing, entry.patched.start, &entry.original);
    }
    registry.arena.reset();
}

#[cfg(test)]
mod tests {
    use aarch64::opcode::NOP;

    use super::*;
    use crate::platform::PagePerms;

    /// A fake "function" of NOPs in its own pages, so protection flips
    /// never touch unrelated memory.
    fn nop_function(words: usize) -> usize {
        let ops = platform();
        let base = ops.map_anon(ops.page_size()).unwrap();
        ops.protect(base, ops.page_size(), PagePerms::READ | PagePerms::WRITE)
            .unwrap();
        for i in 0..words {
            // SAFETY: freshly mapped RW page sized well above `words`.
            unsafe {
                core::ptr::write((base + 4 * i) as *mut u32, NOP);
            }
        }
        ops.protect(base, ops.page_size(), PagePerms::RX).unwrap();
        base
    }

    fn read_bytes(addr: usize, len: usize) -> Vec<u8> {
        // SAFETY: test mappings stay readable.
        unsafe { core::slice::from_raw_parts(addr as *const u8, len) }.to_vec()
    }

    fn replacement_fn() {}

    #[test]
    fn test_install_uninstall_round_trip() {
        // The registry is a process-wide singleton, so the whole
        // lifecycle runs in one test.
        let target = nop_function(8);
        let replacement = replacement_fn as usize;
        let before = read_bytes(target, 32);

        let original = install(target, replacement, None, None).unwrap();
        assert_ne!(original, 0);
        assert_ne!(original, target);

        // The patched entry is no longer all NOPs, the tail still is.
        let patched_len = if target.abs_diff(replacement) < u32::MAX as usize - 1 {
            12
        } else {
            16
        };
        assert_ne!(read_bytes(target, patched_len), before[..patched_len]);
        assert_eq!(read_bytes(target + 16, 16), before[16..]);

        // The relocated prologue ends with a branch back to the
        // un-patched tail: its pool holds target + patched_len.
        let relocated = read_bytes(original, patched_len + 16);
        let tail = u64::from_le_bytes(
            relocated[patched_len + 8..patched_len + 16].try_into().unwrap(),
        );
        assert_eq!(tail, (target + patched_len) as u64);

        // Double install on another target while the first is active.
        let second = nop_function(8);
        install(second, replacement, None, None).unwrap();

        // Uninstall restores the entry bytes exactly.
        uninstall(target).unwrap();
        assert_eq!(read_bytes(target, 32), before);
        assert_eq!(uninstall(target), Err(HookError::NotFound));

        // destroy-all is idempotent and leaves the table empty.
        uninstall_all();
        assert_eq!(read_bytes(second, 32), before);
        uninstall_all();
        assert_eq!(uninstall(second), Err(HookError::NotFound));
    }

    #[test]
    fn test_null_arguments() {
        assert_eq!(install(0, 1, None, None), Err(HookError::NullArgument));
        assert_eq!(install(1, 0, None, None), Err(HookError::NullArgument));
        assert_eq!(uninstall(0), Err(HookError::NullArgument));
    }
}
