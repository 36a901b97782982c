//! A small eBPF assembler.
//!
//! Instructions are appended to a [`Block`] with symbolic jump targets;
//! `assemble` resolves labels to relative offsets and returns the raw
//! instruction stream. The subset implemented here is exactly what the
//! policy program builder emits.

use ahash::AHashMap as HashMap;
use anyhow::{anyhow, bail, Result};

/// One 64-bit eBPF instruction (a `ld_imm64` occupies two).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Insn {
    pub code: u8,
    pub dst: u8,
    pub src: u8,
    pub off: i16,
    pub imm: i32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Reg(pub u8);

pub const R0: Reg = Reg(0);
pub const R1: Reg = Reg(1);
pub const R2: Reg = Reg(2);
pub const R3: Reg = Reg(3);
pub const R4: Reg = Reg(4);
pub const R5: Reg = Reg(5);
pub const R6: Reg = Reg(6);
pub const R7: Reg = Reg(7);
pub const R8: Reg = Reg(8);
pub const R9: Reg = Reg(9);
/// Frame pointer, read-only.
pub const R10: Reg = Reg(10);

// Instruction classes.
pub const CLS_LD: u8 = 0x00;
pub const CLS_LDX: u8 = 0x01;
pub const CLS_STX: u8 = 0x03;
pub const CLS_ALU: u8 = 0x04;
pub const CLS_JMP: u8 = 0x05;
/// 32-bit conditional jumps: compare the low words, no sign extension.
pub const CLS_JMP32: u8 = 0x06;
pub const CLS_ALU64: u8 = 0x07;

// Operand sizes.
pub const SZ_W: u8 = 0x00;
pub const SZ_H: u8 = 0x08;
pub const SZ_B: u8 = 0x10;
pub const SZ_DW: u8 = 0x18;

// Addressing modes.
pub const MODE_IMM: u8 = 0x00;
pub const MODE_MEM: u8 = 0x60;

// ALU/JMP operations.
pub const OP_ADD: u8 = 0x00;
pub const OP_OR: u8 = 0x40;
pub const OP_AND: u8 = 0x50;
pub const OP_LSH: u8 = 0x60;
pub const OP_RSH: u8 = 0x70;
pub const OP_MOV: u8 = 0xb0;
pub const OP_JA: u8 = 0x00;
pub const OP_JEQ: u8 = 0x10;
pub const OP_JGT: u8 = 0x20;
pub const OP_JGE: u8 = 0x30;
pub const OP_JSET: u8 = 0x40;
pub const OP_JNE: u8 = 0x50;
pub const OP_CALL: u8 = 0x80;
pub const OP_EXIT: u8 = 0x90;
pub const OP_JLT: u8 = 0xa0;
pub const OP_JLE: u8 = 0xb0;

// Operand source: immediate or register.
pub const SRC_K: u8 = 0x00;
pub const SRC_X: u8 = 0x08;

/// Marks a `ld_imm64` as carrying a map file descriptor.
pub const PSEUDO_MAP_FD: u8 = 1;

// Helper function ids.
pub const HELPER_MAP_LOOKUP_ELEM: i32 = 1;
pub const HELPER_TAIL_CALL: i32 = 12;

/// An instruction block under construction.
#[derive(Debug, Default)]
pub struct Block {
    insns: Vec<Insn>,
    labels: HashMap<String, usize>,
    fixups: Vec<Fixup>,
}

#[derive(Debug)]
struct Fixup {
    insn_idx: usize,
    target: String,
}

// === impl Insn ===

impl Insn {
    pub fn to_bytes(self) -> [u8; 8] {
        let mut b = [0u8; 8];
        b[0] = self.code;
        b[1] = (self.src << 4) | (self.dst & 0x0f);
        b[2..4].copy_from_slice(&self.off.to_le_bytes());
        b[4..8].copy_from_slice(&self.imm.to_le_bytes());
        b
    }
}

/// Serializes an instruction stream to the byte form the kernel loads.
pub fn to_bytes(insns: &[Insn]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(insns.len() * 8);
    for insn in insns {
        bytes.extend_from_slice(&insn.to_bytes());
    }
    bytes
}

// === impl Block ===

impl Block {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a label to the next instruction appended.
    pub fn label(&mut self, name: impl Into<String>) {
        let name = name.into();
        if self.labels.insert(name.clone(), self.insns.len()).is_some() {
            // Duplicate labels always indicate a builder bug.
            panic!("duplicate label: {name}");
        }
    }

    pub fn mov64_imm(&mut self, dst: Reg, imm: i32) {
        self.push(CLS_ALU64 | OP_MOV | SRC_K, dst, Reg(0), 0, imm);
    }

    pub fn mov32_imm(&mut self, dst: Reg, imm: i32) {
        self.push(CLS_ALU | OP_MOV | SRC_K, dst, Reg(0), 0, imm);
    }

    pub fn mov64_reg(&mut self, dst: Reg, src: Reg) {
        self.push(CLS_ALU64 | OP_MOV | SRC_X, dst, src, 0, 0);
    }

    pub fn add64_imm(&mut self, dst: Reg, imm: i32) {
        self.push(CLS_ALU64 | OP_ADD | SRC_K, dst, Reg(0), 0, imm);
    }

    pub fn and32_imm(&mut self, dst: Reg, imm: i32) {
        self.push(CLS_ALU | OP_AND | SRC_K, dst, Reg(0), 0, imm);
    }

    pub fn or32_imm(&mut self, dst: Reg, imm: i32) {
        self.push(CLS_ALU | OP_OR | SRC_K, dst, Reg(0), 0, imm);
    }

    pub fn lsh32_imm(&mut self, dst: Reg, imm: i32) {
        self.push(CLS_ALU | OP_LSH | SRC_K, dst, Reg(0), 0, imm);
    }

    pub fn rsh32_imm(&mut self, dst: Reg, imm: i32) {
        self.push(CLS_ALU | OP_RSH | SRC_K, dst, Reg(0), 0, imm);
    }

    pub fn or32_reg(&mut self, dst: Reg, src: Reg) {
        self.push(CLS_ALU | OP_OR | SRC_X, dst, src, 0, 0);
    }

    /// `dst = *(size*)(src + off)`, zero-extended.
    pub fn load(&mut self, size: u8, dst: Reg, src: Reg, off: i16) {
        self.push(CLS_LDX | MODE_MEM | size, dst, src, off, 0);
    }

    /// `*(size*)(dst + off) = src`.
    pub fn store(&mut self, size: u8, dst: Reg, off: i16, src: Reg) {
        self.push(CLS_STX | MODE_MEM | size, dst, src, off, 0);
    }

    /// Loads a 64-bit immediate; occupies two instruction slots.
    pub fn ld_imm64(&mut self, dst: Reg, v: u64) {
        self.push(
            CLS_LD | MODE_IMM | SZ_DW,
            dst,
            Reg(0),
            0,
            (v & 0xffff_ffff) as u32 as i32,
        );
        self.push(0, Reg(0), Reg(0), 0, (v >> 32) as u32 as i32);
    }

    /// References a map by file descriptor, as the loader expects.
    pub fn load_map_fd(&mut self, dst: Reg, fd: u32) {
        self.push(
            CLS_LD | MODE_IMM | SZ_DW,
            dst,
            Reg(PSEUDO_MAP_FD),
            0,
            fd as i32,
        );
        self.push(0, Reg(0), Reg(0), 0, 0);
    }

    pub fn jump(&mut self, target: &str) {
        self.push_jump(CLS_JMP | OP_JA, Reg(0), Reg(0), 0, target);
    }

    pub fn jump_eq_imm(&mut self, reg: Reg, imm: i32, target: &str) {
        self.push_jump(CLS_JMP | OP_JEQ | SRC_K, reg, Reg(0), imm, target);
    }

    pub fn jump_ne_imm(&mut self, reg: Reg, imm: i32, target: &str) {
        self.push_jump(CLS_JMP | OP_JNE | SRC_K, reg, Reg(0), imm, target);
    }

    pub fn jump32_eq_imm(&mut self, reg: Reg, imm: i32, target: &str) {
        self.push_jump(CLS_JMP32 | OP_JEQ | SRC_K, reg, Reg(0), imm, target);
    }

    pub fn jump32_ne_imm(&mut self, reg: Reg, imm: i32, target: &str) {
        self.push_jump(CLS_JMP32 | OP_JNE | SRC_K, reg, Reg(0), imm, target);
    }

    pub fn jump_gt_imm(&mut self, reg: Reg, imm: i32, target: &str) {
        self.push_jump(CLS_JMP | OP_JGT | SRC_K, reg, Reg(0), imm, target);
    }

    pub fn jump_ge_imm(&mut self, reg: Reg, imm: i32, target: &str) {
        self.push_jump(CLS_JMP | OP_JGE | SRC_K, reg, Reg(0), imm, target);
    }

    pub fn jump_lt_imm(&mut self, reg: Reg, imm: i32, target: &str) {
        self.push_jump(CLS_JMP | OP_JLT | SRC_K, reg, Reg(0), imm, target);
    }

    pub fn jump_le_imm(&mut self, reg: Reg, imm: i32, target: &str) {
        self.push_jump(CLS_JMP | OP_JLE | SRC_K, reg, Reg(0), imm, target);
    }

    /// Jump if `reg & imm != 0`.
    pub fn jump_set_imm(&mut self, reg: Reg, imm: i32, target: &str) {
        self.push_jump(CLS_JMP | OP_JSET | SRC_K, reg, Reg(0), imm, target);
    }

    pub fn jump_eq_reg(&mut self, a: Reg, b: Reg, target: &str) {
        self.push_jump(CLS_JMP | OP_JEQ | SRC_X, a, b, 0, target);
    }

    pub fn call(&mut self, helper: i32) {
        self.push(CLS_JMP | OP_CALL, Reg(0), Reg(0), 0, helper);
    }

    pub fn exit(&mut self) {
        self.push(CLS_JMP | OP_EXIT, Reg(0), Reg(0), 0, 0);
    }

    /// Resolves all jump targets and returns the instruction stream.
    pub fn assemble(mut self) -> Result<Vec<Insn>> {
        for fixup in &self.fixups {
            let target_idx = *self
                .labels
                .get(&fixup.target)
                .ok_or_else(|| anyhow!("unresolved jump target: {}", fixup.target))?;
            let rel = target_idx as i64 - fixup.insn_idx as i64 - 1;
            if rel > i16::MAX as i64 || rel < i16::MIN as i64 {
                bail!("jump to {} out of range: {rel}", fixup.target);
            }
            self.insns[fixup.insn_idx].off = rel as i16;
        }

        // A label on the end of the block with no trailing instruction
        // would leave a jump falling off the program.
        for (label, idx) in &self.labels {
            if *idx >= self.insns.len() {
                bail!("label {label} points past the end of the block");
            }
        }
        Ok(self.insns)
    }

    fn push(&mut self, code: u8, dst: Reg, src: Reg, off: i16, imm: i32) {
        self.insns.push(Insn {
            code,
            dst: dst.0,
            src: src.0,
            off,
            imm,
        });
    }

    fn push_jump(&mut self, code: u8, dst: Reg, src: Reg, imm: i32, target: &str) {
        self.fixups.push(Fixup {
            insn_idx: self.insns.len(),
            target: target.to_string(),
        });
        self.push(code, dst, src, 0, imm);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_and_backward_jumps_resolve() {
        let mut b = Block::new();
        b.label("top");
        b.mov64_imm(R0, 0);
        b.jump_eq_imm(R1, 7, "done");
        b.jump("top");
        b.label("done");
        b.exit();

        let insns = b.assemble().unwrap();
        assert_eq!(insns[1].off, 1, "forward jump skips one insn");
        assert_eq!(insns[2].off, -3, "backward jump returns to the top");
    }

    #[test]
    fn unresolved_target_is_an_error() {
        let mut b = Block::new();
        b.jump("nowhere");
        b.exit();
        assert!(b.assemble().is_err());
    }

    #[test]
    fn ld_imm64_spans_two_slots() {
        let mut b = Block::new();
        b.ld_imm64(R1, 0x1122_3344_5566_7788);
        b.exit();
        let insns = b.assemble().unwrap();
        assert_eq!(insns.len(), 3);
        assert_eq!(insns[0].imm, 0x5566_7788);
        assert_eq!(insns[1].imm, 0x1122_3344);
    }

    #[test]
    fn insn_byte_layout() {
        let insn = Insn {
            code: CLS_ALU64 | OP_MOV | SRC_K,
            dst: 2,
            src: 1,
            off: -1,
            imm: 0x0102_0304,
        };
        assert_eq!(
            insn.to_bytes(),
            [0xb7, 0x12, 0xff, 0xff, 0x04, 0x03, 0x02, 0x01]
        );
    }
}
