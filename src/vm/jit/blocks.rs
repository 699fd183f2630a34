//! Basic block discovery.

use crate::error::EmuResult;
use crate::isa::{self, Decoder, Instruction};
use crate::vm::AddressSpace;

/// Upper bound on instructions collected into one block.
pub const MAX_BLOCK_SIZE: usize = 1024;

/// A straight-line run of guest instructions ending at a branch or at the
/// first undecodable word.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    entry: u64,
    instructions: Vec<Instruction>,
}

impl BasicBlock {
    /// Guest address of the first instruction.
    #[must_use]
    pub fn entry(&self) -> u64 {
        self.entry
    }

    /// The collected instructions, in guest order.
    #[must_use]
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Number of instructions in the block.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    /// Whether the block holds no instructions. Collection never produces
    /// one, but slices of blocks may.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Guest address just past the last instruction.
    #[must_use]
    pub fn end_pc(&self) -> u64 {
        self.entry.wrapping_add(4 * self.instructions.len() as u64)
    }

    /// The final instruction of the block.
    #[must_use]
    pub fn terminator(&self) -> Option<&Instruction> {
        self.instructions.last()
    }

    /// Whether control may continue at [`Self::end_pc`] after the block.
    #[must_use]
    pub fn can_fall_through(&self) -> bool {
        self.terminator().is_none_or(isa::can_fall_through)
    }
}

/// Collect the basic block starting at `entry`.
///
/// Decoding proceeds sequentially and stops after the first branch, after
/// [`MAX_BLOCK_SIZE`] instructions, or at the first word that fails to
/// decode. A decode failure past the first instruction truncates the block
/// there; on the very first instruction it is an error.
///
/// # Errors
///
/// Propagates the decoder's error when not even one instruction decodes.
pub fn collect_block(space: &AddressSpace, entry: u64) -> EmuResult<BasicBlock> {
    let mut decoder = Decoder::new(space, entry);
    let mut instructions = Vec::new();

    while instructions.len() < MAX_BLOCK_SIZE {
        let inst = match decoder.decode_next() {
            Ok(inst) => inst,
            Err(err) if instructions.is_empty() => return Err(err),
            Err(_) => break,
        };
        let is_branch = inst.is_branch();
        instructions.push(inst);
        if is_branch {
            break;
        }
    }

    Ok(BasicBlock { entry, instructions })
}
