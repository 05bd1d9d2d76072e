// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 Graft Project Developers

//! Instruction emission. One [`Assembler`] is built per trampoline or
//! relocation, filled front to back, and finished by flushing its literal
//! pool behind the code.

use alloc::vec::Vec;

use crate::buffer::CodeBuffer;
use crate::decode::bits;
use crate::opcode::{
    ADD_W_IMM, ADD_X_IMM, ADRP, BLR, BR, LDR_LIT_D, LDR_LIT_Q, LDR_LIT_S, LDR_LIT_W, LDR_LIT_X,
    LOAD_STORE_UNSIGNED_FIXED, MOVE_WIDE_IMM_FIXED, MOVE_WIDE_SF64, MOVK, MOVZ, RD_SHIFT,
    RN_SHIFT, RT_SHIFT,
};
use crate::pool::{FixupKind, LitPool, PoolHandle};
use crate::reg::{Reg, RegClass};

/// Addressing mode of a load/store memory operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddrMode {
    Offset,
    PreIndex,
    PostIndex,
}

/// Memory operand of a load/store instruction.
#[derive(Clone, Copy, Debug)]
pub struct MemOperand {
    pub base: Reg,
    pub offset: i64,
    pub mode: AddrMode,
}

impl MemOperand {
    /// `[base]` with a zero offset.
    pub const fn base(base: Reg) -> Self {
        Self {
            base,
            offset: 0,
            mode: AddrMode::Offset,
        }
    }
}

/// Emission failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmitError {
    /// The instruction form or addressing mode is not supported.
    Unimplemented,
    /// An operand is outside the encodable range.
    BadOperand,
}

/// Assembler state: the instruction buffer plus the pending literal pool.
#[derive(Debug, Default)]
pub struct Assembler {
    buf: CodeBuffer,
    pool: LitPool,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes emitted so far, excluding unflushed literals.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Emits a raw instruction word.
    pub fn emit(&mut self, word: u32) {
        self.buf.push_u32(word);
    }

    /// Registers a 64-bit literal for the trailing pool.
    pub fn literal(&mut self, value: u64) -> PoolHandle {
        self.pool.push(value)
    }

    /// Load/store with an unsigned scaled offset. Only [`AddrMode::Offset`]
    /// is implemented; the scale comes from bits 30..=31 of ops that carry
    /// the unsigned-offset fixed pattern.
    pub fn load_store(&mut self, op: u32, reg: Reg, addr: MemOperand) -> Result<(), EmitError> {
        if addr.mode != AddrMode::Offset {
            return Err(EmitError::Unimplemented);
        }
        let scale = if (op & LOAD_STORE_UNSIGNED_FIXED) == LOAD_STORE_UNSIGNED_FIXED {
            bits(op, 30, 31)
        } else {
            0
        };
        let imm12 = ((addr.offset >> scale) as u32) & 0xFFF;
        self.emit(
            LOAD_STORE_UNSIGNED_FIXED
                | op
                | (imm12 << 10)
                | (addr.base.id() << RN_SHIFT)
                | (reg.id() << RT_SHIFT),
        );
        Ok(())
    }

    /// `ADD dst, src, #imm12` (immediate form).
    pub fn add_imm(&mut self, dst: Reg, src: Reg, imm: u64) {
        let op = if dst.size() == 64 && src.size() == 64 {
            ADD_X_IMM
        } else {
            ADD_W_IMM
        };
        self.emit(
            op | ((imm as u32 & 0xFFF) << 10) | (src.id() << RN_SHIFT) | (dst.id() << RD_SHIFT),
        );
    }

    /// Materializes `to` into `reg` with `ADRP` + `ADD`, relative to the
    /// `ADRP`'s own address `from`. Requires `|to - from| < 2^32`.
    pub fn adrp_add(&mut self, reg: Reg, from: u64, to: u64) -> Result<(), EmitError> {
        if to.abs_diff(from) >= 1 << 32 {
            return Err(EmitError::BadOperand);
        }
        let from_page = from & !0xFFF;
        let to_page = to & !0xFFF;
        let page_delta = (to_page.wrapping_sub(from_page) >> 12) as u32;
        self.emit(
            ADRP
                | ((page_delta & 0b11) << 29)
                | (((page_delta >> 2) & 0x7FFFF) << 5)
                | (reg.id() << RD_SHIFT),
        );
        self.add_imm(reg, reg, to & 0xFFF);
        Ok(())
    }

    fn move_wide(&mut self, reg: Reg, op: u32, imm16: u16, shift: u32) {
        let sf = if reg.size() == 64 { MOVE_WIDE_SF64 } else { 0 };
        self.emit(
            MOVE_WIDE_IMM_FIXED
                | op
                | sf
                | ((shift / 16) << 21)
                | ((imm16 as u32) << 5)
                | (reg.id() << RD_SHIFT),
        );
    }

    /// Materializes a 64-bit immediate with `MOVZ` plus three `MOVK`s.
    /// Always four instructions, even when upper halves are zero.
    pub fn mov_imm(&mut self, reg: Reg, imm: u64) {
        self.move_wide(reg, MOVZ, imm as u16, 0);
        self.move_wide(reg, MOVK, (imm >> 16) as u16, 16);
        self.move_wide(reg, MOVK, (imm >> 32) as u16, 32);
        self.move_wide(reg, MOVK, (imm >> 48) as u16, 48);
    }

    /// Emits the class-correct literal `LDR` and links it to `entry` for
    /// the imm19 fixup at flush time.
    pub fn ldr_literal(&mut self, reg: Reg, entry: PoolHandle) {
        let op = match reg.class() {
            RegClass::W => LDR_LIT_W,
            RegClass::X => LDR_LIT_X,
            RegClass::S => LDR_LIT_S,
            RegClass::D => LDR_LIT_D,
            RegClass::Q => LDR_LIT_Q,
        };
        self.pool.link(entry, FixupKind::LabelImm19, self.buf.len());
        self.emit(op | (reg.id() << RT_SHIFT));
    }

    /// `BR reg`.
    pub fn br(&mut self, reg: Reg) {
        self.emit(BR | (reg.id() << RN_SHIFT));
    }

    /// `BLR reg`.
    pub fn blr(&mut self, reg: Reg) {
        self.emit(BLR | (reg.id() << RN_SHIFT));
    }

    /// `LDR X17, =addr` followed by `BR X17`.
    pub fn literal_branch(&mut self, addr: u64) {
        let entry = self.literal(addr);
        self.ldr_literal(Reg::SCRATCH, entry);
        self.br(Reg::SCRATCH);
    }

    /// `LDR X17, =addr` followed by `BLR X17`.
    pub fn literal_branch_link(&mut self, addr: u64) {
        let entry = self.literal(addr);
        self.ldr_literal(Reg::SCRATCH, entry);
        self.blr(Reg::SCRATCH);
    }

    /// Read-back of an already emitted word.
    pub fn word_at(&self, offset: usize) -> u32 {
        self.buf.read_u32(offset)
    }

    /// Flushes the literal pool and returns the finished image.
    pub fn finish(mut self) -> Vec<u8> {
        self.pool.flush(&mut self.buf);
        self.buf.into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{imm19_offset, immhi_immlo_zero12_offset};
    use crate::opcode::LDR_X;

    fn words(bytes: &[u8]) -> Vec<u32> {
        bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn test_mov_imm() {
        let mut asm = Assembler::new();
        asm.mov_imm(Reg::SCRATCH, 0x1122_3344_5566_7788);
        let code = words(&asm.finish());
        // MOVZ X17, #0x7788 / MOVK X17, #0x5566, LSL #16 / ...
        assert_eq!(code[0], 0xD280_0000 | (0x7788 << 5) | 17);
        assert_eq!(code[1], 0xF280_0000 | (1 << 21) | (0x5566 << 5) | 17);
        assert_eq!(code[2], 0xF280_0000 | (2 << 21) | (0x3344 << 5) | 17);
        assert_eq!(code[3], 0xF280_0000 | (3 << 21) | (0x1122 << 5) | 17);
    }

    #[test]
    fn test_adrp_add_places_target() {
        // Executing the pair with PC = from must leave `to` in the
        // register: page(from) + decoded page delta + low 12 bits.
        let from = 0x0000_0001_2345_6000u64;
        let to = 0x0000_0001_2388_9ABCu64;
        let mut asm = Assembler::new();
        asm.adrp_add(Reg::x(0), from, to).unwrap();
        let code = words(&asm.finish());

        let page = ((from & !0xFFF) as i64 + immhi_immlo_zero12_offset(code[0])) as u64;
        assert_eq!(page, to & !0xFFF);
        // ADD X0, X0, #(to & 0xFFF)
        assert_eq!(code[1], 0x9100_0000 | (((to & 0xFFF) as u32) << 10));
    }

    #[test]
    fn test_adrp_add_backwards() {
        let from = 0x2000_0000u64;
        let to = 0x1FFF_F123u64;
        let mut asm = Assembler::new();
        asm.adrp_add(Reg::x(3), from, to).unwrap();
        let code = words(&asm.finish());
        let page = ((from & !0xFFF) as i64 + immhi_immlo_zero12_offset(code[0])) as u64;
        assert_eq!(page, to & !0xFFF);
    }

    #[test]
    fn test_adrp_add_range_check() {
        let mut asm = Assembler::new();
        assert_eq!(
            asm.adrp_add(Reg::x(0), 0, 1 << 33),
            Err(EmitError::BadOperand)
        );
    }

    #[test]
    fn test_literal_branch() {
        let mut asm = Assembler::new();
        asm.literal_branch(0xDEAD_BEEF);
        let bytes = asm.finish();
        let code = words(&bytes[..8]);
        // LDR X17, .+8 / BR X17 / .quad 0xDEADBEEF
        assert_eq!(code[0], 0x5800_0000 | (2 << 5) | 17);
        assert_eq!(code[1], 0xD61F_0220);
        assert_eq!(bytes[8..], 0xDEAD_BEEFu64.to_le_bytes());
        assert_eq!(imm19_offset(code[0]), 8);
    }

    #[test]
    fn test_literal_branch_link() {
        let mut asm = Assembler::new();
        asm.literal_branch_link(0x4000);
        let bytes = asm.finish();
        // BLR X17
        assert_eq!(words(&bytes[..8])[1], 0xD63F_0220);
    }

    #[test]
    fn test_load_store() {
        let mut asm = Assembler::new();
        asm.load_store(LDR_X, Reg::x(2), MemOperand::base(Reg::SCRATCH))
            .unwrap();
        let code = words(&asm.finish());
        // LDR X2, [X17]
        assert_eq!(code[0], 0xF940_0000 | (17 << 5) | 2);
    }

    #[test]
    fn test_load_store_rejects_other_modes() {
        let mut asm = Assembler::new();
        let addr = MemOperand {
            base: Reg::SCRATCH,
            offset: 0,
            mode: AddrMode::PreIndex,
        };
        assert_eq!(
            asm.load_store(LDR_X, Reg::x(2), addr),
            Err(EmitError::Unimplemented)
        );
    }
}
