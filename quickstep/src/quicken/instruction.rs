//! The compact step-program instruction set.
//!
//! Each quicken record points at a tiny program that restores the caller's
//! registers from the callee's. The vocabulary is deliberately minimal: set a
//! register to a constant, add a signed offset to a register, load a word
//! from memory into a register, mark the unwind finished. Anything the
//! builder cannot express lowers to the single `Unsupported` opcode, which
//! the unwinder treats as a hard stop.

use std::ops::Range;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::arch::RegisterFile;
use crate::error::UnwindError;
use crate::memory::ProcessMemory;

const OP_FINISH: u8 = 0x00;
const OP_SET_CONST: u8 = 0x01;
const OP_ADD: u8 = 0x02;
const OP_LOAD: u8 = 0x03;
const OP_UNSUPPORTED: u8 = 0xff;

/// One decoded step-program operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    /// No caller frame exists; the unwind is complete.
    Finish,
    /// `reg = value`.
    SetConst { reg: u8, value: u64 },
    /// `reg = reg + offset`.
    Add { reg: u8, offset: i32 },
    /// `dst = *(src + offset)`, one machine word, bounds-checked.
    Load { dst: u8, src: u8, offset: i32 },
    /// The metadata required an operation outside this vocabulary.
    Unsupported,
}

impl Instruction {
    /// Append the encoded form to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match *self {
            Instruction::Finish => out.push(OP_FINISH),
            Instruction::SetConst { reg, value } => {
                out.push(OP_SET_CONST);
                out.push(reg);
                out.extend_from_slice(&value.to_le_bytes());
            }
            Instruction::Add { reg, offset } => {
                out.push(OP_ADD);
                out.push(reg);
                out.extend_from_slice(&offset.to_le_bytes());
            }
            Instruction::Load { dst, src, offset } => {
                out.push(OP_LOAD);
                out.push(dst);
                out.push(src);
                out.extend_from_slice(&offset.to_le_bytes());
            }
            Instruction::Unsupported => out.push(OP_UNSUPPORTED),
        }
    }
}

/// Encode a whole program.
#[must_use]
pub fn encode_stream(instructions: &[Instruction]) -> Vec<u8> {
    let mut out = Vec::with_capacity(instructions.len() * 4);
    for insn in instructions {
        insn.encode(&mut out);
    }
    out
}

/// Decoder over an encoded program. Truncated operands surface as an error
/// item so the executor can fail with `Unsupported` instead of misreading.
pub struct InstructionStream<'a> {
    rest: &'a [u8],
}

impl<'a> InstructionStream<'a> {
    #[must_use]
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { rest: bytes }
    }
}

/// Marker for a stream whose bytes do not decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MalformedStream;

impl Iterator for InstructionStream<'_> {
    type Item = Result<Instruction, MalformedStream>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        let r = &mut self.rest;
        let decoded = (|| {
            let op = r.read_u8().ok()?;
            match op {
                OP_FINISH => Some(Instruction::Finish),
                OP_SET_CONST => {
                    let reg = r.read_u8().ok()?;
                    let value = r.read_u64::<LittleEndian>().ok()?;
                    Some(Instruction::SetConst { reg, value })
                }
                OP_ADD => {
                    let reg = r.read_u8().ok()?;
                    let offset = r.read_i32::<LittleEndian>().ok()?;
                    Some(Instruction::Add { reg, offset })
                }
                OP_LOAD => {
                    let dst = r.read_u8().ok()?;
                    let src = r.read_u8().ok()?;
                    let offset = r.read_i32::<LittleEndian>().ok()?;
                    Some(Instruction::Load { dst, src, offset })
                }
                OP_UNSUPPORTED => Some(Instruction::Unsupported),
                _ => None,
            }
        })();
        match decoded {
            Some(insn) => Some(Ok(insn)),
            None => {
                // Stop decoding; the caller sees one error item.
                self.rest = &[];
                Some(Err(MalformedStream))
            }
        }
    }
}

/// Execute a step program against a register file.
///
/// Loads read through `memory` and are bounds-checked against the current
/// thread's `stack` range; a load outside it fails with `InvalidMemory`.
/// Returns whether the program marked the unwind finished.
pub fn execute(
    stream: &[u8],
    regs: &mut RegisterFile,
    memory: &dyn ProcessMemory,
    stack: &Range<u64>,
) -> Result<bool, UnwindError> {
    let arch = regs.arch();
    let word = arch.word_size() as u64;

    for item in InstructionStream::new(stream) {
        match item.map_err(|MalformedStream| UnwindError::Unsupported)? {
            Instruction::Finish => return Ok(true),
            Instruction::SetConst { reg, value } => regs.set(reg, value),
            Instruction::Add { reg, offset } => {
                let value = regs.get(reg).wrapping_add(offset as i64 as u64);
                regs.set(reg, value);
            }
            Instruction::Load { dst, src, offset } => {
                let addr = regs.get(src).wrapping_add(offset as i64 as u64);
                if addr < stack.start || addr.wrapping_add(word) > stack.end {
                    return Err(UnwindError::InvalidMemory);
                }
                let value =
                    memory.read_word(addr, arch).ok_or(UnwindError::InvalidMemory)?;
                regs.set(dst, value);
            }
            Instruction::Unsupported => return Err(UnwindError::Unsupported),
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Arch;
    use crate::memory::SliceMemory;

    fn decode_all(bytes: &[u8]) -> Vec<Instruction> {
        InstructionStream::new(bytes).map(|i| i.unwrap()).collect()
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let program = [
            Instruction::Load { dst: 30, src: 31, offset: 12 },
            Instruction::Add { reg: 31, offset: 16 },
            Instruction::SetConst { reg: 29, value: 0x1122_3344_5566_7788 },
            Instruction::Finish,
        ];
        let bytes = encode_stream(&program);
        assert_eq!(decode_all(&bytes), program);
    }

    #[test]
    fn test_truncated_stream_is_malformed() {
        let mut bytes = encode_stream(&[Instruction::Add { reg: 13, offset: -4 }]);
        bytes.truncate(bytes.len() - 1);
        let items: Vec<_> = InstructionStream::new(&bytes).collect();
        assert_eq!(items, vec![Err(MalformedStream)]);
    }

    #[test]
    fn test_execute_restores_registers() {
        let arch = Arch::Arm64;
        let mut regs = RegisterFile::new(arch);
        regs.set_sp(0x7fff_0000);

        let mut memory = SliceMemory::new();
        memory.add_word(0x7fff_000c, 0xdead_beef, arch);

        let stream = encode_stream(&[
            Instruction::Load { dst: arch.ra(), src: arch.sp(), offset: 12 },
            Instruction::Add { reg: arch.sp(), offset: 16 },
        ]);
        let finished =
            execute(&stream, &mut regs, &memory, &(0x7fff_0000..0x7fff_1000)).unwrap();

        assert!(!finished);
        assert_eq!(regs.ra(), 0xdead_beef);
        assert_eq!(regs.sp(), 0x7fff_0010);
    }

    #[test]
    fn test_load_outside_stack_fails() {
        let arch = Arch::Arm64;
        let mut regs = RegisterFile::new(arch);
        regs.set_sp(0x9000_0000);

        let memory = SliceMemory::new();
        let stream = encode_stream(&[Instruction::Load {
            dst: arch.ra(),
            src: arch.sp(),
            offset: 0,
        }]);
        let err =
            execute(&stream, &mut regs, &memory, &(0x7fff_0000..0x7fff_1000)).unwrap_err();
        assert_eq!(err, UnwindError::InvalidMemory);
    }

    #[test]
    fn test_finish_stops_execution() {
        let arch = Arch::Arm;
        let mut regs = RegisterFile::new(arch);
        let stream = encode_stream(&[
            Instruction::Finish,
            Instruction::SetConst { reg: 0, value: 7 },
        ]);
        let memory = SliceMemory::new();
        let finished = execute(&stream, &mut regs, &memory, &(0..0)).unwrap();
        assert!(finished);
        assert_eq!(regs.get(0), 0, "instructions after finish must not run");
    }

    #[test]
    fn test_unsupported_opcode_is_a_hard_stop() {
        let arch = Arch::Arm;
        let mut regs = RegisterFile::new(arch);
        let memory = SliceMemory::new();
        let stream = encode_stream(&[Instruction::Unsupported]);
        let err = execute(&stream, &mut regs, &memory, &(0..0)).unwrap_err();
        assert_eq!(err, UnwindError::Unsupported);
    }
}
