//! `AArch64` instruction decoder.
//!
//! Decodes a representative subset: add/subtract immediate, unconditional,
//! conditional and link branches, and the unsigned-immediate 64-bit
//! load/store form. Register data-processing and FP/SIMD encodings are
//! recognized as valid classes but have no decode body, so decoding them
//! fails.
//!
//! The sign-extension casts below are deliberate; immediates are extracted
//! as unsigned fields and reinterpreted per the ISA encoding.

#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

use crate::error::{EmuError, EmuResult};
use crate::isa::instruction::{Cond, InstrKind, Instruction, Opcode, Operand};
use crate::vm::AddressSpace;

/// Top-level encoding class: data processing with immediate.
const CLASS_DP_IMM: u32 = 0x1100_0000;
/// Top-level encoding class: branches and system.
const CLASS_BRANCHES: u32 = 0x1400_0000;
/// Top-level encoding class: loads and stores.
const CLASS_LOAD_STORE: u32 = 0x0800_0000;
/// Top-level encoding class: data processing with registers (no decode body).
const CLASS_DP_REG: u32 = 0x0A00_0000;
/// Top-level encoding class: scalar FP and SIMD (no decode body).
const CLASS_FP_SIMD: u32 = 0x0400_0000;

/// Extract `length` bits of `word` starting at bit `start`.
///
/// The mask is built in 64 bits, so a full-width `length` of 32 is valid.
#[inline]
#[must_use]
pub fn extract_bits(word: u32, start: u32, length: u32) -> u32 {
    (word >> start) & (((1u64 << length) - 1) as u32)
}

/// Sign-extend the low `bits` bits of `value`.
#[inline]
fn sign_extend(value: u32, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((i64::from(value)) << shift) >> shift
}

/// A streaming decoder over an address space.
///
/// Holds the current program counter; `decode_next` advances it by one
/// instruction on success, `decode_at` leaves it untouched.
#[derive(Debug, Clone, Copy)]
pub struct Decoder<'a> {
    space: &'a AddressSpace,
    pc: u64,
}

impl<'a> Decoder<'a> {
    /// Create a decoder positioned at `pc`.
    #[must_use]
    pub fn new(space: &'a AddressSpace, pc: u64) -> Self {
        Decoder { space, pc }
    }

    /// The current program counter.
    #[must_use]
    pub fn pc(&self) -> u64 {
        self.pc
    }

    /// Decode the instruction at the current PC, advancing past it on
    /// success.
    ///
    /// # Errors
    ///
    /// Returns [`EmuError::OutOfBounds`] or [`EmuError::PermissionDenied`]
    /// if the fetch fails, and [`EmuError::InvalidInstruction`] for
    /// encodings outside the decoded subset. The PC does not move on
    /// failure.
    pub fn decode_next(&mut self) -> EmuResult<Instruction> {
        let inst = self.decode_at(self.pc)?;
        self.pc = self.pc.wrapping_add(4);
        Ok(inst)
    }

    /// Decode the instruction at `addr` without moving the current PC.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Decoder::decode_next`].
    pub fn decode_at(&self, addr: u64) -> EmuResult<Instruction> {
        let raw = self.space.fetch_u32(addr)?;
        decode_word(raw, addr)
    }
}

/// Decode one raw instruction word located at `pc`.
///
/// # Errors
///
/// Returns [`EmuError::InvalidInstruction`] for encodings outside the
/// decoded subset.
pub fn decode_word(raw: u32, pc: u64) -> EmuResult<Instruction> {
    if (raw & 0x1F00_0000) == CLASS_DP_IMM {
        decode_dp_immediate(raw, pc)
    } else if (raw & 0x1C00_0000) == CLASS_BRANCHES {
        decode_branch(raw, pc)
    } else if (raw & 0x0A00_0000) == CLASS_LOAD_STORE {
        decode_load_store(raw, pc)
    } else {
        Err(EmuError::InvalidInstruction { raw, pc })
    }
}

/// Whether `raw` belongs to any recognized top-level encoding class.
///
/// This is a classification predicate only: dp-register and FP/SIMD words
/// are valid classes here but still fail [`decode_word`].
#[must_use]
pub fn is_valid_encoding(raw: u32) -> bool {
    (raw & 0x1F00_0000) == CLASS_DP_IMM
        || (raw & 0x1C00_0000) == CLASS_BRANCHES
        || (raw & 0x0A00_0000) == CLASS_LOAD_STORE
        || (raw & 0x0F00_0000) == CLASS_DP_REG
        || (raw & 0x0F00_0000) == CLASS_FP_SIMD
}

/// Add/subtract immediate: the only dp-immediate sub-form in the subset.
fn decode_dp_immediate(raw: u32, pc: u64) -> EmuResult<Instruction> {
    let op0 = extract_bits(raw, 23, 3);
    if op0 != 0b010 {
        return Err(EmuError::InvalidInstruction { raw, pc });
    }

    // Control bits 30 (add/sub) and 31 (flag update).
    let controls = extract_bits(raw, 30, 2);
    let op = if controls & 1 == 1 { Opcode::Sub } else { Opcode::Add };

    let mut inst = Instruction::new(raw, InstrKind::Arithmetic, op);
    inst.dest = extract_bits(raw, 0, 5) as u8;
    inst.sets_flags = controls & 2 != 0;
    inst.set_operand(0, Operand::Register(extract_bits(raw, 5, 5) as u8));
    inst.set_operand(1, Operand::Immediate(u64::from(extract_bits(raw, 10, 12))));
    Ok(inst)
}

/// Branches: B, BL, and B.cond.
fn decode_branch(raw: u32, pc: u64) -> EmuResult<Instruction> {
    let op0 = extract_bits(raw, 29, 3);

    if op0 == 0b000 || op0 == 0b100 {
        let op = if op0 == 0b100 { Opcode::Bl } else { Opcode::B };
        let offset = sign_extend(extract_bits(raw, 0, 26), 26) << 2;
        let mut inst = Instruction::new(raw, InstrKind::Branch, op);
        inst.set_operand(0, Operand::Immediate(offset as u64));
        return Ok(inst);
    }

    if op0 == 0b010 {
        let offset = sign_extend(extract_bits(raw, 5, 19), 19) << 2;
        let mut inst = Instruction::new(raw, InstrKind::Branch, Opcode::BCond);
        inst.condition = Some(Cond::from_bits(extract_bits(raw, 0, 4) as u8));
        inst.set_operand(0, Operand::Immediate(offset as u64));
        return Ok(inst);
    }

    Err(EmuError::InvalidInstruction { raw, pc })
}

/// Loads/stores: only the unsigned-immediate 64-bit register form.
fn decode_load_store(raw: u32, pc: u64) -> EmuResult<Instruction> {
    if (raw & 0x3B00_0000) != 0x3900_0000 {
        return Err(EmuError::InvalidInstruction { raw, pc });
    }

    let size = extract_bits(raw, 30, 2);
    let is_load = extract_bits(raw, 22, 2) & 1 == 1;
    let op = if is_load { Opcode::Ldr } else { Opcode::Str };

    let mut inst = Instruction::new(raw, InstrKind::LoadStore, op);
    inst.dest = extract_bits(raw, 0, 5) as u8;
    inst.set_operand(
        0,
        Operand::Memory {
            base: extract_bits(raw, 5, 5) as u8,
            offset: (extract_bits(raw, 12, 9) << size) as i32,
            index: None,
            shift: 0,
        },
    );
    Ok(inst)
}

/// Whether execution can continue at the next sequential instruction.
///
/// Unconditional and link branches never fall through; conditional branches
/// fall through unless the condition is the reserved "always" value
/// [`Cond::Nv`]. Non-branches always fall through.
#[must_use]
pub fn can_fall_through(inst: &Instruction) -> bool {
    if !inst.is_branch() {
        return true;
    }
    match inst.op {
        Opcode::BCond => inst.condition != Some(Cond::Nv),
        _ => false,
    }
}

/// Compute the next PC after the instruction at `pc`.
///
/// Branches whose target resolves to the 0 sentinel (register-indirect
/// targets outside this subset) fall back to `pc + 4`.
#[must_use]
pub fn next_pc(inst: &Instruction, pc: u64) -> u64 {
    if !inst.is_branch() {
        return pc.wrapping_add(4);
    }
    match inst.branch_target(pc) {
        0 => pc.wrapping_add(4),
        target => target,
    }
}
