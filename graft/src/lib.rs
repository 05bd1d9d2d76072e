// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 Graft Project Developers

//! Userspace ARM64 inline-hook runtime.
//!
//! Given a target function and a replacement, the runtime overwrites the
//! target's entry with a short branch to the replacement, relocates the
//! displaced instructions into a freshly allocated executable slice, and
//! hands back a pointer to that relocated prologue. Calling it runs the
//! original behavior: the displaced instructions, rewritten to be
//! position correct, followed by a branch into the un-patched tail of the
//! target.
//!
//! Installation and removal are synchronous and internally serialized,
//! but the runtime performs no thread suspension: callers must guarantee
//! that no thread executes a target while its entry is being rewritten.

mod error;
mod interceptor;
mod mm;
mod platform;
mod relocate;
mod trampoline;
mod types;

pub use error::{HookError, MemError};
pub use platform::{MemoryOps, PagePerms, platform};
pub use symres::ResolveError;
pub use types::MemRegion;

/// Callback invoked with the page-aligned base address of every page the
/// patcher mutates: once before the write, once after protections are
/// restored. Platforms with page-based code signing re-hash here.
pub type PageWriteFn = fn(usize);

/// Diverts `target` to `replacement` and returns the address of the
/// relocated prologue, the caller's handle for invoking the original
/// behavior. On arm64e both input addresses are stripped of their
/// pointer-authentication signatures and the returned address is
/// re-signed with the ASIA key.
///
/// A non-`Ok` result means the hook is not active and the target is
/// unchanged; no prologue pointer exists in that case.
pub fn install_inline_hook(
    target: usize,
    replacement: usize,
    before_page_write: Option<PageWriteFn>,
    after_page_write: Option<PageWriteFn>,
) -> Result<usize, HookError> {
    interceptor::install(target, replacement, before_page_write, after_page_write)
}

/// Restores the original entry bytes of a hooked `target` (the address
/// originally passed to [`install_inline_hook`]) and releases the hook's
/// resources. The last removal also releases the executable-region
/// allocator.
pub fn destroy_inline_hook(target: usize) -> Result<(), HookError> {
    interceptor::uninstall(target)
}

/// Removes every installed hook, restoring each target, then releases
/// the executable-region allocator. Calling it with nothing installed is
/// a no-op.
pub fn destroy_all_inline_hooks() {
    interceptor::uninstall_all()
}

/// Resolves `symbol` against the loaded images of this process,
/// optionally restricted to images whose path contains `image`.
pub fn resolve_symbol(symbol: &str, image: Option<&str>) -> Result<usize, HookError> {
    Ok(symres::resolve_symbol(symbol, image)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn test_resolve_symbol_in_libc() {
        let addr = resolve_symbol("open", Some("libc")).unwrap();
        assert_ne!(addr, 0);
    }

    #[test]
    fn test_resolve_symbol_miss_maps_to_hook_error() {
        assert_eq!(
            resolve_symbol("graft_definitely_absent", None),
            Err(HookError::Resolve(ResolveError::NotFound))
        );
    }
}
