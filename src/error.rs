//! Error types for the emulator core.

use std::fmt;

/// Memory access type for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    /// Read access (load instructions, data reads).
    Read,
    /// Write access (store instructions, data writes).
    Write,
    /// Execute access (instruction fetch).
    Execute,
}

impl fmt::Display for AccessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessType::Read => write!(f, "read"),
            AccessType::Write => write!(f, "write"),
            AccessType::Execute => write!(f, "execute"),
        }
    }
}

/// Errors reported by the decoder, address space, register file, and
/// translation engine.
///
/// Invalid arguments are caller bugs and never retried. Out-of-bounds,
/// invalid-instruction, and permission errors are failed operations that
/// leave state unchanged. Compile errors mean the block was not cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmuError {
    /// A required argument was missing or structurally invalid.
    InvalidArgument(&'static str),
    /// An address or range fell outside every mapped region.
    OutOfBounds {
        /// The faulting guest address.
        addr: u64,
    },
    /// A mapping request overlapped an existing region.
    RegionOverlap {
        /// Requested start address.
        addr: u64,
        /// Requested size in bytes.
        size: u64,
    },
    /// An access was attempted without the required permission bit.
    PermissionDenied {
        /// The faulting guest address.
        addr: u64,
        /// The type of access attempted.
        access: AccessType,
    },
    /// The decoder could not handle an instruction encoding.
    InvalidInstruction {
        /// The raw 32-bit instruction word.
        raw: u32,
        /// Guest address of the instruction.
        pc: u64,
    },
    /// Block compilation failed in the code-emission stage or the backend.
    CompileFailed {
        /// Entry address of the block being compiled.
        pc: u64,
        /// Description of the failure.
        reason: String,
    },
    /// The code-generation backend could not be initialized.
    Backend(String),
    /// A guest image could not be parsed or loaded.
    BadImage(String),
}

impl fmt::Display for EmuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmuError::InvalidArgument(what) => write!(f, "invalid argument: {what}"),
            EmuError::OutOfBounds { addr } => {
                write!(f, "address {addr:#018x} is not mapped")
            }
            EmuError::RegionOverlap { addr, size } => {
                write!(
                    f,
                    "mapping {size:#x} bytes at {addr:#018x} overlaps an existing region"
                )
            }
            EmuError::PermissionDenied { addr, access } => {
                write!(f, "{access} access denied at {addr:#018x}")
            }
            EmuError::InvalidInstruction { raw, pc } => {
                write!(f, "invalid instruction {raw:#010x} at {pc:#018x}")
            }
            EmuError::CompileFailed { pc, reason } => {
                write!(f, "failed to compile block at {pc:#018x}: {reason}")
            }
            EmuError::Backend(reason) => write!(f, "backend error: {reason}"),
            EmuError::BadImage(reason) => write!(f, "bad guest image: {reason}"),
        }
    }
}

impl std::error::Error for EmuError {}

/// Result type for emulator operations.
pub type EmuResult<T> = Result<T, EmuError>;
