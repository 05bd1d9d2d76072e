// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 Graft Project Developers

use core::fmt;

/// Failures of the symbol-resolution subsystem.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolveError {
    /// No image provided a matching symbol.
    NotFound,
    /// Malformed input data (maps line, image header, section table).
    UnexpectedFormat,
    /// A load command or section type the walker cannot use.
    UnhandledType,
    /// open/stat failure on a module or cache file.
    FileIo,
    /// `/proc/self/maps` could not be opened or read.
    ProcMapsOpen,
    /// Mapping a module or cache region failed.
    Mapping,
    /// The shared-cache file path could not be determined.
    BadCacheLocation,
    /// The shared-cache context could not be constructed.
    SharedCacheInit,
    /// The live cache advertises no local-symbols region.
    SymbolSize,
    /// `task_info` failed while locating the shared cache.
    TaskInfo,
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::NotFound => "symbol not found",
            Self::UnexpectedFormat => "data format did not match expectation",
            Self::UnhandledType => "unexpected data type",
            Self::FileIo => "file I/O failure",
            Self::ProcMapsOpen => "failed to open /proc/self/maps",
            Self::Mapping => "failed to map memory region",
            Self::BadCacheLocation => "invalid shared-cache location",
            Self::SharedCacheInit => "failed to initialize shared cache",
            Self::SymbolSize => "invalid local-symbols size",
            Self::TaskInfo => "task_info failed",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for ResolveError {}
