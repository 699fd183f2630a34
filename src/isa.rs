//! Guest instruction set: instruction model and decoder.

pub mod decode;
pub mod instruction;

pub use decode::{Decoder, can_fall_through, decode_word, is_valid_encoding, next_pc};
pub use instruction::{Cond, InstrKind, Instruction, Opcode, Operand};
