// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 Graft Project Developers

//! The short branch written at a target's entry.

use aarch64::{Assembler, Reg};

use crate::error::HookError;

/// Largest displacement routed through the ADRP+ADD form. Kept below the
/// architectural ±4 GiB reach; larger-but-encodable deltas take the far
/// path.
const NEAR_LIMIT: u64 = u32::MAX as u64 - 1;

/// Emits the branch-to-`to` image for a target entry at `from`: either
/// `ADRP X17 / ADD X17 / BR X17` (12 bytes) or, past [`NEAR_LIMIT`],
/// `LDR X17, =to / BR X17` plus the 8-byte literal (16 bytes).
pub fn emit_trampoline(from: usize, to: usize) -> Result<Vec<u8>, HookError> {
    let mut asm = Assembler::new();

    if (from as u64).abs_diff(to as u64) < NEAR_LIMIT {
        asm.adrp_add(Reg::SCRATCH, from as u64, to as u64)
            .map_err(|_| HookError::InvalidArgument)?;
        asm.br(Reg::SCRATCH);
    } else {
        asm.literal_branch(to as u64);
    }

    Ok(asm.finish())
}
