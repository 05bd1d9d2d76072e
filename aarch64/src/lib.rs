// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 Graft Project Developers

//! ARM64 (AArch64, little endian) micro-assembler.
//!
//! This crate provides the small slice of the instruction set an inline-hook
//! runtime needs: materializing absolute addresses, PC-relative literal
//! loads backed by a trailing literal pool, and register branches. The
//! [`decode`] module extracts the sign-extended immediates of the
//! PC-relative forms that may be displaced from a function entry.

#![no_std]

extern crate alloc;

pub mod asm;
pub mod buffer;
pub mod decode;
pub mod opcode;
pub mod pool;
pub mod reg;

pub use asm::{AddrMode, Assembler, EmitError, MemOperand};
pub use buffer::CodeBuffer;
pub use pool::{FixupKind, LitPool, PoolHandle};
pub use reg::{Reg, RegClass};
