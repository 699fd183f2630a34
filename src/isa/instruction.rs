//! Decoded instruction representation.
//!
//! Instructions are produced once by the decoder, read by the code-emission
//! stage, and then discarded; nothing mutates them after decode.

use std::fmt;

/// Broad classification of a decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstrKind {
    /// Not classified (decode never completed).
    #[default]
    Unknown,
    /// Add/subtract data processing.
    Arithmetic,
    /// Bitwise data processing.
    Logical,
    /// Register/immediate moves.
    Move,
    /// Unconditional, conditional, and link branches.
    Branch,
    /// Loads and stores.
    LoadStore,
    /// System instructions.
    System,
    /// Scalar floating point.
    Float,
    /// SIMD.
    Vector,
}

/// Operation discriminant, meaningful only within its [`InstrKind`].
///
/// The numeric values mirror the wire-format discriminants used by the
/// emission stage (arithmetic 0x0x, logical 0x1x, branch 0x2x, memory 0x4x).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Add (0x00).
    Add,
    /// Subtract (0x01).
    Sub,
    /// Bitwise AND (0x10).
    And,
    /// Bitwise OR (0x11).
    Orr,
    /// Bitwise exclusive OR (0x12).
    Eor,
    /// Unconditional branch (0x20).
    B,
    /// Conditional branch (0x22).
    BCond,
    /// Branch with link (0x25).
    Bl,
    /// Load register, 64-bit (0x40).
    Ldr,
    /// Store register, 64-bit (0x41).
    Str,
}

/// `AArch64` condition codes (the 4-bit `cond` field).
///
/// `Nv` (0b1111) is reserved and treated as "always taken, never falls
/// through" for control-flow purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)] // Mnemonics are standard AArch64.
pub enum Cond {
    Eq = 0x0,
    Ne = 0x1,
    Cs = 0x2,
    Cc = 0x3,
    Mi = 0x4,
    Pl = 0x5,
    Vs = 0x6,
    Vc = 0x7,
    Hi = 0x8,
    Ls = 0x9,
    Ge = 0xA,
    Lt = 0xB,
    Gt = 0xC,
    Le = 0xD,
    Al = 0xE,
    Nv = 0xF,
}

impl Cond {
    /// Build a condition from the low 4 bits of `bits`.
    #[must_use]
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0xF {
            0x0 => Cond::Eq,
            0x1 => Cond::Ne,
            0x2 => Cond::Cs,
            0x3 => Cond::Cc,
            0x4 => Cond::Mi,
            0x5 => Cond::Pl,
            0x6 => Cond::Vs,
            0x7 => Cond::Vc,
            0x8 => Cond::Hi,
            0x9 => Cond::Ls,
            0xA => Cond::Ge,
            0xB => Cond::Lt,
            0xC => Cond::Gt,
            0xD => Cond::Le,
            0xE => Cond::Al,
            _ => Cond::Nv,
        }
    }

    /// The raw 4-bit encoding of this condition.
    #[must_use]
    pub fn bits(self) -> u8 {
        self as u8
    }
}

/// One instruction operand, tagged by form.
///
/// Exactly one form is valid per value; the decoder picks it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Operand {
    /// Empty slot.
    #[default]
    None,
    /// A 64-bit immediate. Branch offsets are stored sign-extended in
    /// two's complement.
    Immediate(u64),
    /// A scalar register index.
    Register(u8),
    /// A base + offset memory reference.
    Memory {
        /// Base register index.
        base: u8,
        /// Signed byte offset from the base register.
        offset: i32,
        /// Optional index register (`None` means no index).
        index: Option<u8>,
        /// Shift applied to the index register.
        shift: u8,
    },
    /// A shift descriptor.
    Shift {
        /// Shift amount in bits.
        amount: u8,
    },
    /// A register-extend descriptor.
    Extend {
        /// Raw extend-kind field.
        kind: u8,
    },
}

/// Maximum number of operand slots per instruction.
pub const MAX_OPERANDS: usize = 4;

/// A decoded guest instruction.
///
/// Operand slots at and past `operand_count` are unspecified and must not
/// be read; use [`Instruction::operands`] to get the valid prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    /// The raw 32-bit encoding.
    pub raw: u32,
    /// Broad classification.
    pub kind: InstrKind,
    /// Operation discriminant within `kind`.
    pub op: Opcode,
    /// Condition code, for conditional branches.
    pub condition: Option<Cond>,
    /// Destination register index.
    pub dest: u8,
    /// Operand slots; only the first `operand_count` are valid.
    pub operands: [Operand; MAX_OPERANDS],
    /// Number of valid operand slots.
    pub operand_count: u8,
    /// Whether the instruction updates the NZCV flags.
    pub sets_flags: bool,
}

impl Instruction {
    /// Create an instruction with no operands.
    #[must_use]
    pub fn new(raw: u32, kind: InstrKind, op: Opcode) -> Self {
        Instruction {
            raw,
            kind,
            op,
            condition: None,
            dest: 0,
            operands: [Operand::None; MAX_OPERANDS],
            operand_count: 0,
            sets_flags: false,
        }
    }

    /// Set operand slot `index`, growing the valid count to cover it.
    ///
    /// Indices past [`MAX_OPERANDS`] are ignored.
    pub fn set_operand(&mut self, index: usize, operand: Operand) {
        if index >= MAX_OPERANDS {
            return;
        }
        self.operands[index] = operand;
        if index as u8 >= self.operand_count {
            self.operand_count = index as u8 + 1;
        }
    }

    /// The valid operand slots.
    #[must_use]
    pub fn operands(&self) -> &[Operand] {
        &self.operands[..usize::from(self.operand_count)]
    }

    /// Whether this instruction ends a basic block.
    #[must_use]
    pub fn is_branch(&self) -> bool {
        self.kind == InstrKind::Branch
    }

    /// Whether this instruction accesses guest memory.
    #[must_use]
    pub fn is_memory_access(&self) -> bool {
        self.kind == InstrKind::LoadStore
    }

    /// Resolve the branch target for an instruction at `pc`.
    ///
    /// Returns 0 for non-branches and for targets that cannot be resolved
    /// statically (register-indirect); callers treat 0 as "unresolved".
    #[must_use]
    pub fn branch_target(&self, pc: u64) -> u64 {
        if self.kind != InstrKind::Branch {
            return 0;
        }
        match self.operands().first() {
            Some(Operand::Immediate(offset)) => pc.wrapping_add(*offset),
            _ => 0,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            InstrKind::Arithmetic => "ARITH",
            InstrKind::Logical => "LOGIC",
            InstrKind::Move => "MOVE",
            InstrKind::Branch => "BRANCH",
            InstrKind::LoadStore => "MEM",
            InstrKind::System => "SYS",
            InstrKind::Float => "FLOAT",
            InstrKind::Vector => "VECTOR",
            InstrKind::Unknown => "UNKNOWN",
        };
        write!(f, "{kind} [{:?}] dst=X{}", self.op, self.dest)?;
        for (i, operand) in self.operands().iter().enumerate() {
            let sep = if i == 0 { " " } else { ", " };
            match operand {
                Operand::None => write!(f, "{sep}_")?,
                Operand::Immediate(imm) => write!(f, "{sep}#{imm:#x}")?,
                Operand::Register(reg) => write!(f, "{sep}X{reg}")?,
                Operand::Memory { base, offset, .. } => {
                    write!(f, "{sep}[X{base}, #{offset}]")?;
                }
                Operand::Shift { amount } => write!(f, "{sep}LSL #{amount}")?,
                Operand::Extend { kind } => write!(f, "{sep}EXTEND({kind})")?,
            }
        }
        if let Some(cond) = self.condition {
            write!(f, " {cond:?}")?;
        }
        if self.sets_flags {
            write!(f, " [FLAGS]")?;
        }
        Ok(())
    }
}
