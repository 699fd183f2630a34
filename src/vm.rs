//! Virtual machine components: CPU state, guest memory, and the JIT.

pub mod jit;
pub mod memory;
pub mod registers;

pub use jit::JitEngine;
pub use memory::{AddressSpace, Perms};
pub use registers::RegisterFile;
