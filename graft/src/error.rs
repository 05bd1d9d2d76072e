// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 Graft Project Developers

use core::fmt;

use symres::ResolveError;

/// Failures of the memory subsystem (arena, patcher, platform calls).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemError {
    /// An allocation could not be satisfied.
    OutOfMemory,
    /// Mapping an anonymous region failed.
    Mapping,
    /// Changing page protections failed.
    Permission,
    /// A request exceeded the capacity of the backing page.
    Overflow,
}

/// Top-level error of the hook runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookError {
    /// A required address argument was zero.
    NullArgument,
    /// An argument had a value outside its contract.
    InvalidArgument,
    /// No installed hook (or no symbol) matched.
    NotFound,
    /// Data of an unexpected kind was encountered.
    UnhandledType,
    /// The instruction form cannot be lowered.
    Unimplemented,
    /// The trampoline routing could not be established.
    RoutingFailure,
    Mem(MemError),
    Resolve(ResolveError),
}

impl From<MemError> for HookError {
    fn from(err: MemError) -> Self {
        HookError::Mem(err)
    }
}

impl From<ResolveError> for HookError {
    fn from(err: ResolveError) -> Self {
        HookError::Resolve(err)
    }
}

impl fmt::Display for MemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::OutOfMemory => "out of memory",
            Self::Mapping => "failed to map memory region",
            Self::Permission => "failed to change memory permissions",
            Self::Overflow => "allocated memory not large enough",
        };
        f.write_str(msg)
    }
}

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NullArgument => f.write_str("an argument is null"),
            Self::InvalidArgument => f.write_str("an argument has a bad value"),
            Self::NotFound => f.write_str("element not found"),
            Self::UnhandledType => f.write_str("unexpected data type"),
            Self::Unimplemented => f.write_str("no implementation for this instruction form"),
            Self::RoutingFailure => f.write_str("failed to set up trampoline routing"),
            Self::Mem(err) => err.fmt(f),
            Self::Resolve(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for HookError {}
