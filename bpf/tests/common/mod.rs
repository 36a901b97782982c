//! An instruction-level interpreter for the assembled policy programs,
//! covering exactly the opcodes the builder emits. Tests run programs
//! against an in-memory state block, IP-set trie and jump table the same
//! way the kernel test-run facility would.

use palisade_bpf::asm::{Insn, PSEUDO_MAP_FD};
use palisade_bpf::state::{State, STATE_SIZE};
use std::collections::HashMap;

pub const IPSETS_MAP_FD: u32 = 10;
pub const STATE_MAP_FD: u32 = 11;
pub const JUMP_MAP_FD: u32 = 12;

const MEM_SIZE: usize = 1024;
const STACK_TOP: u64 = 512;
const STATE_ADDR: usize = 600;
const STEP_LIMIT: usize = 100_000;

pub struct Vm {
    /// Encoded IP-set trie entries: `prefix_len ‖ data`.
    pub ipset_entries: Vec<Vec<u8>>,
    /// Jump-table slots: terminator programs that return a fixed code.
    pub jump_table: HashMap<i32, i64>,
}

pub struct RunResult {
    pub rc: i64,
    pub state: State,
}

impl Vm {
    pub fn run(&self, insns: &[Insn], state_in: &State) -> RunResult {
        let mut mem = [0u8; MEM_SIZE];
        mem[STATE_ADDR..STATE_ADDR + STATE_SIZE].copy_from_slice(&state_in.to_bytes());

        let mut regs = [0u64; 11];
        regs[1] = 1; // opaque context pointer
        regs[10] = STACK_TOP;

        let mut pc = 0usize;
        let mut steps = 0usize;
        let rc = loop {
            steps += 1;
            assert!(steps < STEP_LIMIT, "program did not terminate");
            let insn = insns[pc];
            let dst = insn.dst as usize;
            let src = insn.src as usize;
            match insn.code {
                // ld_imm64 (possibly a map reference)
                0x18 => {
                    let hi = insns[pc + 1].imm as u32 as u64;
                    let lo = insn.imm as u32 as u64;
                    regs[dst] = if insn.src == PSEUDO_MAP_FD { lo } else { lo | (hi << 32) };
                    pc += 2;
                    continue;
                }
                // alu
                0xb7 => regs[dst] = insn.imm as i64 as u64,
                0xb4 => regs[dst] = insn.imm as u32 as u64,
                0xbf => regs[dst] = regs[src],
                0x07 => regs[dst] = regs[dst].wrapping_add(insn.imm as i64 as u64),
                0x54 => regs[dst] = (regs[dst] as u32 & insn.imm as u32) as u64,
                0x44 => regs[dst] = (regs[dst] as u32 | insn.imm as u32) as u64,
                0x4c => regs[dst] = (regs[dst] as u32 | regs[src] as u32) as u64,
                0x64 => regs[dst] = ((regs[dst] as u32) << (insn.imm as u32)) as u64,
                0x74 => regs[dst] = ((regs[dst] as u32) >> (insn.imm as u32)) as u64,
                // ldx
                0x71 => regs[dst] = read(&mem, regs[src], insn.off, 1),
                0x69 => regs[dst] = read(&mem, regs[src], insn.off, 2),
                0x61 => regs[dst] = read(&mem, regs[src], insn.off, 4),
                0x79 => regs[dst] = read(&mem, regs[src], insn.off, 8),
                // stx
                0x73 => write(&mut mem, regs[dst], insn.off, 1, regs[src]),
                0x6b => write(&mut mem, regs[dst], insn.off, 2, regs[src]),
                0x63 => write(&mut mem, regs[dst], insn.off, 4, regs[src]),
                0x7b => write(&mut mem, regs[dst], insn.off, 8, regs[src]),
                // jumps
                0x05 => {
                    pc = jump_target(pc, insn.off);
                    continue;
                }
                0x15 => {
                    if regs[dst] == insn.imm as i64 as u64 {
                        pc = jump_target(pc, insn.off);
                        continue;
                    }
                }
                0x55 => {
                    if regs[dst] != insn.imm as i64 as u64 {
                        pc = jump_target(pc, insn.off);
                        continue;
                    }
                }
                0x25 => {
                    if regs[dst] > insn.imm as i64 as u64 {
                        pc = jump_target(pc, insn.off);
                        continue;
                    }
                }
                0x35 => {
                    if regs[dst] >= insn.imm as i64 as u64 {
                        pc = jump_target(pc, insn.off);
                        continue;
                    }
                }
                0xa5 => {
                    if regs[dst] < insn.imm as i64 as u64 {
                        pc = jump_target(pc, insn.off);
                        continue;
                    }
                }
                0xb5 => {
                    if regs[dst] <= insn.imm as i64 as u64 {
                        pc = jump_target(pc, insn.off);
                        continue;
                    }
                }
                0x45 => {
                    if regs[dst] & insn.imm as i64 as u64 != 0 {
                        pc = jump_target(pc, insn.off);
                        continue;
                    }
                }
                // 32-bit jumps
                0x16 => {
                    if regs[dst] as u32 == insn.imm as u32 {
                        pc = jump_target(pc, insn.off);
                        continue;
                    }
                }
                0x56 => {
                    if regs[dst] as u32 != insn.imm as u32 {
                        pc = jump_target(pc, insn.off);
                        continue;
                    }
                }
                // call / exit
                0x85 => match insn.imm {
                    1 => regs[0] = self.map_lookup(&mem, regs[1] as u32, regs[2]),
                    12 => {
                        let index = regs[3] as i32;
                        match self.jump_table.get(&index) {
                            Some(&rc) => break rc,
                            // A missing slot makes the helper fail and
                            // execution continue, as in the kernel.
                            None => regs[0] = -1i64 as u64,
                        }
                    }
                    helper => panic!("unsupported helper {helper}"),
                },
                0x95 => break regs[0] as i64,
                code => panic!("unsupported opcode {code:#04x} at {pc}"),
            }
            pc += 1;
        };

        let state_bytes: [u8; STATE_SIZE] =
            mem[STATE_ADDR..STATE_ADDR + STATE_SIZE].try_into().unwrap();
        RunResult {
            rc,
            state: State::from_bytes(&state_bytes),
        }
    }

    fn map_lookup(&self, mem: &[u8], fd: u32, key_ptr: u64) -> u64 {
        match fd {
            STATE_MAP_FD => STATE_ADDR as u64,
            IPSETS_MAP_FD => {
                let key = key_ptr as usize;
                for entry in &self.ipset_entries {
                    let prefix_len =
                        u32::from_le_bytes(entry[..4].try_into().unwrap()) as usize;
                    let data = &entry[4..];
                    let key_data = &mem[key + 4..key + 4 + data.len()];
                    if prefix_bits_match(data, key_data, prefix_len) {
                        return 1;
                    }
                }
                0
            }
            fd => panic!("lookup on unexpected map fd {fd}"),
        }
    }
}

fn jump_target(pc: usize, off: i16) -> usize {
    (pc as i64 + 1 + off as i64) as usize
}

fn read(mem: &[u8], base: u64, off: i16, size: usize) -> u64 {
    let addr = (base as i64 + off as i64) as usize;
    let mut v = 0u64;
    for i in (0..size).rev() {
        v = (v << 8) | mem[addr + i] as u64;
    }
    v
}

fn write(mem: &mut [u8], base: u64, off: i16, size: usize, value: u64) {
    let addr = (base as i64 + off as i64) as usize;
    mem[addr..addr + size].copy_from_slice(&value.to_le_bytes()[..size]);
}

fn prefix_bits_match(entry: &[u8], key: &[u8], prefix_len: usize) -> bool {
    let full_bytes = prefix_len / 8;
    if entry[..full_bytes] != key[..full_bytes] {
        return false;
    }
    let rem = prefix_len % 8;
    if rem == 0 {
        return true;
    }
    let mask = 0xffu8 << (8 - rem);
    entry[full_bytes] & mask == key[full_bytes] & mask
}
