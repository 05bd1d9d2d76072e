// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 Graft Project Developers

//! Relocation of displaced instructions. Each PC-relative form read from
//! the target entry is rewritten into a semantically equivalent
//! absolute-address sequence; everything else is copied verbatim. X17 is
//! the scratch register and is assumed dead across the prologue.

use aarch64::decode::{
    bits, imm14_offset, imm19_offset, imm26_offset, immhi_immlo_offset, immhi_immlo_zero12_offset,
    pc_rel_rd, set_bits,
};
use aarch64::opcode::{
    ADR, ADRP, BL, COMPARE_BRANCH_FIXED, COMPARE_BRANCH_FIXED_MASK, COND_BRANCH_FIXED,
    COND_BRANCH_FIXED_MASK, LDR_LIT_FIXED, LDR_LIT_FIXED_MASK, LDR_W, LDR_X, PC_REL_FIXED,
    PC_REL_FIXED_MASK, PC_REL_OP_MASK, TEST_BRANCH_FIXED, TEST_BRANCH_FIXED_MASK,
    UNCOND_BRANCH_FIXED, UNCOND_BRANCH_FIXED_MASK, UNCOND_BRANCH_OP_MASK,
};
use aarch64::{Assembler, MemOperand, Reg};
use log::warn;

use crate::error::HookError;
use crate::types::MemRegion;

/// `B`/`BL`: pool the absolute destination, branch (and link) through X17.
fn relocate_uncond_branch(asm: &mut Assembler, pc: usize, insn: u32) {
    let dest = (pc as i64 + imm26_offset(insn)) as u64;
    if (insn & UNCOND_BRANCH_OP_MASK) == BL {
        asm.literal_branch_link(dest);
    } else {
        asm.literal_branch(dest);
    }
}

/// `LDR (literal)`: materialize the absolute data address in X17, then
/// load through it with the class-correct width.
fn relocate_literal_load(asm: &mut Assembler, pc: usize, insn: u32) -> Result<(), HookError> {
    let dest = (pc as i64 + imm19_offset(insn)) as u64;
    let rt = bits(insn, 0, 4) as u8;
    let opc = bits(insn, 30, 31);

    asm.mov_imm(Reg::SCRATCH, dest);
    let (op, reg) = match opc {
        0b00 => (LDR_W, Reg::w(rt)),
        0b01 => (LDR_X, Reg::x(rt)),
        _ => {
            warn!("unsupported literal-load operand class {opc:#04b}");
            return Err(HookError::Unimplemented);
        }
    };
    asm.load_store(op, reg, MemOperand::base(Reg::SCRATCH))
        .map_err(|_| HookError::Unimplemented)
}

/// `ADR`: the label address becomes a plain immediate.
fn relocate_adr(asm: &mut Assembler, pc: usize, insn: u32) {
    let value = (pc as i64 + immhi_immlo_offset(insn)) as u64;
    asm.mov_imm(Reg::x(pc_rel_rd(insn)), value);
}

/// `ADRP`: the label page address becomes a plain immediate.
fn relocate_adrp(asm: &mut Assembler, pc: usize, insn: u32) {
    let value = ((pc as i64 + immhi_immlo_zero12_offset(insn)) as u64) & !0xFFF;
    asm.mov_imm(Reg::x(pc_rel_rd(insn)), value);
}

/// `B.cond`: invert the condition to skip the absolute branch pair, so
/// the original condition still reaches the original destination.
fn relocate_cond_branch(asm: &mut Assembler, pc: usize, insn: u32) {
    let dest = (pc as i64 + imm19_offset(insn)) as u64;
    let inverted = set_bits(insn, 0, 3, bits(insn, 0, 3) ^ 1);
    asm.emit(set_bits(inverted, 5, 23, 3));
    asm.literal_branch(dest);
}

/// `CBZ`/`CBNZ`: flip Z/NZ, skip the absolute branch pair.
fn relocate_compare_branch(asm: &mut Assembler, pc: usize, insn: u32) {
    let dest = (pc as i64 + imm19_offset(insn)) as u64;
    asm.emit(set_bits(insn ^ (1 << 24), 5, 23, 3));
    asm.literal_branch(dest);
}

/// `TBZ`/`TBNZ`: flip Z/NZ, skip the absolute branch pair.
fn relocate_test_branch(asm: &mut Assembler, pc: usize, insn: u32) {
    let dest = (pc as i64 + imm14_offset(insn)) as u64;
    asm.emit(set_bits(insn ^ (1 << 24), 5, 18, 3));
    asm.literal_branch(dest);
}

/// Rewrites the instructions of `region` into `asm`. For every source
/// instruction at original address A, the emitted sequence produces the
/// same observable effect as the instruction executed at A, modulo X17.
/// On return the region size is clamped to the bytes consumed.
pub fn relocate_code(region: &mut MemRegion, asm: &mut Assembler) -> Result<(), HookError> {
    let mut cursor = region.start;

    while cursor - region.start < region.size {
        // SAFETY: the cursor stays inside the caller-provided source
        // region, which maps readable target code.
        let insn = unsafe { core::ptr::read_unaligned(cursor as *const u32) };

        if (insn & UNCOND_BRANCH_FIXED_MASK) == UNCOND_BRANCH_FIXED {
            relocate_uncond_branch(asm, cursor, insn);
        } else if (insn & LDR_LIT_FIXED_MASK) == LDR_LIT_FIXED {
            relocate_literal_load(asm, cursor, insn)?;
        } else if (insn & PC_REL_FIXED_MASK) == PC_REL_FIXED && (insn & PC_REL_OP_MASK) == ADR {
            relocate_adr(asm, cursor, insn);
        } else if (insn & PC_REL_FIXED_MASK) == PC_REL_FIXED && (insn & PC_REL_OP_MASK) == ADRP {
            relocate_adrp(asm, cursor, insn);
        } else if (insn & COND_BRANCH_FIXED_MASK) == COND_BRANCH_FIXED {
            relocate_cond_branch(asm, cursor, insn);
        } else if (insn & COMPARE_BRANCH_FIXED_MASK) == COMPARE_BRANCH_FIXED {
            relocate_compare_branch(asm, cursor, insn);
        } else if (insn & TEST_BRANCH_FIXED_MASK) == TEST_BRANCH_FIXED {
            relocate_test_branch(asm, cursor, insn);
        } else {
            asm.emit(insn);
        }

        cursor += 4;
    }

    region.size = cursor - region.start;
    Ok(())
}

#[cfg(test)]
mod tests {
    use aarch64::opcode::NOP;

    use super::*;

    /// Runs the relocator over `insns` placed in a real buffer and
    /// returns (source base address, finished image).
    fn relocate(insns: &[u32]) -> (usize, Vec<u8>) {
        let source: Vec<u8> = insns.iter().flat_map(|i| i.to_le_bytes()).collect();
        let mut region = MemRegion::new(source.as_ptr() as usize, source.len());
        let mut asm = Assembler::new();
        relocate_code(&mut region, &mut asm).unwrap();
        assert_eq!(region.size, source.len());
        (region.start, asm.finish())
    }

    fn words(bytes: &[u8]) -> Vec<u32> {
        bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    fn pool_value(bytes: &[u8], offset: usize) -> u64 {
        u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap())
    }

    const LDR_LIT: u32 = 0x5800_0000; // LDR Xt, label
    const BR_X17: u32 = 0xD61F_0220;
    const BLR_X17: u32 = 0xD63F_0220;

    #[test]
    fn test_nops_copied_verbatim() {
        let (_, image) = relocate(&[NOP, NOP, NOP]);
        assert_eq!(words(&image), vec![NOP, NOP, NOP]);
    }

    #[test]
    fn test_b_becomes_absolute_branch() {
        // B .+0x100 at the very first instruction.
        let (base, image) = relocate(&[0x1400_0000 | (0x100 >> 2)]);
        let code = words(&image[..8]);
        assert_eq!(code[0] & 0xFF00_001F, LDR_LIT | 17);
        assert_eq!(code[1], BR_X17);
        assert_eq!(pool_value(&image, 8), base as u64 + 0x100);
    }

    #[test]
    fn test_bl_preserves_link() {
        let (base, image) = relocate(&[0x9400_0000 | (0x40 >> 2)]);
        let code = words(&image[..8]);
        assert_eq!(code[1], BLR_X17);
        assert_eq!(pool_value(&image, 8), base as u64 + 0x40);
    }

    #[test]
    fn test_ldr_literal_w_and_x() {
        // LDR W3, .+8 / LDR X4, .+16
        let w = 0x1800_0000 | (2 << 5) | 3;
        let x = 0x5800_0000 | (4 << 5) | 4;
        let (base, image) = relocate(&[w, x]);
        let code = words(&image);

        // Four moves of (base + 8) into X17, then LDR W3, [X17].
        assert_eq!(code[0], 0xD280_0000 | ((((base + 8) & 0xFFFF) as u32) << 5) | 17);
        assert_eq!(code[4], 0xB940_0000 | (17 << 5) | 3);
        // Four moves of (base + 4 + 16) into X17, then LDR X4, [X17].
        assert_eq!(code[5], 0xD280_0000 | ((((base + 20) & 0xFFFF) as u32) << 5) | 17);
        assert_eq!(code[9], 0xF940_0000 | (17 << 5) | 4);
    }

    #[test]
    fn test_ldr_literal_simd_unimplemented() {
        // LDR Q0, label: opc = 0b10 with the SIMD bit set.
        let q: u32 = 0x9C00_0000 | (2 << 5);
        let source: Vec<u8> = q.to_le_bytes().to_vec();
        let mut region = MemRegion::new(source.as_ptr() as usize, source.len());
        let mut asm = Assembler::new();
        assert_eq!(
            relocate_code(&mut region, &mut asm),
            Err(HookError::Unimplemented)
        );
    }

    #[test]
    fn test_adr_becomes_mov() {
        // ADR X0, .+0x10 as the second instruction.
        let adr = 0x1000_0000 | ((0x10 >> 2) << 5);
        let (base, image) = relocate(&[NOP, adr]);
        let code = words(&image);
        assert_eq!(code[0], NOP);
        let value = (base + 4 + 0x10) as u64;
        assert_eq!(code[1], 0xD280_0000 | (((value & 0xFFFF) as u32) << 5));
        assert_eq!(
            code[2],
            0xF280_0000 | (1 << 21) | ((((value >> 16) & 0xFFFF) as u32) << 5)
        );
    }

    #[test]
    fn test_adrp_becomes_page_mov() {
        // ADRP X0, .+0x3000: the rewritten value is the page of
        // (pc + 0x3000), with the low bits of pc truncated away.
        let adrp = 0x9000_0000 | (3 << 29);
        let (base, image) = relocate(&[adrp]);
        let code = words(&image);
        let value = ((base as i64 + 0x3000) as u64) & !0xFFF;
        assert_eq!(code[0], 0xD280_0000 | (((value & 0xFFFF) as u32) << 5));
        assert_eq!(
            code[1],
            0xF280_0000 | (1 << 21) | ((((value >> 16) & 0xFFFF) as u32) << 5)
        );
    }

    #[test]
    fn test_cond_branch_inverted() {
        // B.EQ .+0x20 -> B.NE .+12 over the LDR/BR pair.
        let beq = 0x5400_0000 | ((0x20 >> 2) << 5);
        let (base, image) = relocate(&[beq]);
        let code = words(&image[..12]);
        assert_eq!(code[0], 0x5400_0000 | (3 << 5) | 1);
        assert_eq!(code[1] & 0xFF00_001F, LDR_LIT | 17);
        assert_eq!(code[2], BR_X17);
        assert_eq!(pool_value(&image, 12), base as u64 + 0x20);
    }

    #[test]
    fn test_cbz_flipped_to_cbnz() {
        // CBZ X2, .+0x40
        let cbz = 0xB400_0000 | ((0x40 >> 2) << 5) | 2;
        let (base, image) = relocate(&[cbz]);
        let code = words(&image[..12]);
        assert_eq!(code[0], 0xB500_0000 | (3 << 5) | 2);
        assert_eq!(code[2], BR_X17);
        assert_eq!(pool_value(&image, 12), base as u64 + 0x40);
    }

    #[test]
    fn test_tbnz_flipped_to_tbz() {
        // TBNZ W5, #3, .+0x1C
        let tbnz = 0x3700_0000 | (3 << 19) | ((0x1C >> 2) << 5) | 5;
        let (base, image) = relocate(&[tbnz]);
        let code = words(&image[..12]);
        assert_eq!(code[0], 0x3600_0000 | (3 << 19) | (3 << 5) | 5);
        assert_eq!(code[2], BR_X17);
        assert_eq!(pool_value(&image, 12), base as u64 + 0x1C);
    }

    #[test]
    fn test_mixed_prologue_with_tail() {
        // A realistic displaced prologue: ADRP+ADD pair followed by a NOP,
        // with the call-original tail appended by the caller.
        let adrp = 0x9000_0000 | (1 << 29); // ADRP X0, .+0x1000
        let add = 0x9100_0000 | (0x123 << 10); // ADD X0, X0, #0x123
        let source: Vec<u8> = [adrp, add, NOP]
            .iter()
            .flat_map(|i| i.to_le_bytes())
            .collect();

        let mut region = MemRegion::new(source.as_ptr() as usize, source.len());
        let mut asm = Assembler::new();
        relocate_code(&mut region, &mut asm).unwrap();
        asm.literal_branch(region.end() as u64);
        let image = asm.finish();
        let code = words(&image);

        // 4 moves + verbatim ADD + verbatim NOP + LDR/BR tail.
        assert_eq!(code[4], add);
        assert_eq!(code[5], NOP);
        assert_eq!(code[7], BR_X17);
        assert_eq!(pool_value(&image, 32), region.end() as u64);
    }
}
