// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 Graft Project Developers

//! Runtime symbol resolution over the loaded images of the current
//! process: ELF modules discovered through `/proc/self/maps` on
//! Linux/Android, Mach-O images through the dyld image list and the shared
//! cache on Apple platforms.

mod error;
mod filemap;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod elf;
#[cfg(target_os = "macos")]
mod macho;

pub use error::ResolveError;

/// Lookup of an exported or defined symbol among the images of this
/// process. One implementation per object format, selected at build time.
pub trait SymbolLookup {
    /// Resolves `symbol` to its runtime address, optionally restricted to
    /// images whose path contains `image`.
    fn resolve(&self, symbol: &str, image: Option<&str>) -> Result<usize, ResolveError>;
}

/// Resolves `symbol` with the implementation native to this build.
pub fn resolve_symbol(symbol: &str, image: Option<&str>) -> Result<usize, ResolveError> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    let lookup = elf::ElfSymbols;
    #[cfg(target_os = "macos")]
    let lookup = macho::MachOSymbols;
    lookup.resolve(symbol, image)
}
