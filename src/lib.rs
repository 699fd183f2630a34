// Allow unwrap and unreadable literals in tests (test code is not production)
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::unreadable_literal))]
#![cfg_attr(test, allow(clippy::cast_sign_loss))]
//! Lyra: a process-level `AArch64` emulator with a Cranelift JIT backend.
//!
//! Guest code is executed by dynamic binary translation: instructions are
//! decoded one basic block at a time, lowered to Cranelift IR, compiled to
//! native code, cached by entry address, and run directly against the guest
//! register file and address space.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────┐
//! │        CLI / Emulator            │
//! ├──────────┬───────────┬───────────┤
//! │  Loader  │  Decoder  │  Profile  │
//! ├──────────┴───────────┴───────────┤
//! │  JIT Engine (Cranelift backend)  │
//! ├──────────────────────────────────┤
//! │  Register File / Address Space   │
//! └──────────────────────────────────┘
//! ```

pub mod error;
pub mod isa;
pub mod loader;
pub mod profile;
pub mod vm;

pub use error::{AccessType, EmuError, EmuResult};
pub use loader::{LoadedImage, load_file};
pub use profile::{Counters, NullSink, ProfileEvent, ProfileSink};
pub use vm::{AddressSpace, JitEngine, Perms, RegisterFile};

/// One emulation session: register file, address space, and translation
/// engine.
///
/// State starts zeroed and empty; load an image, then [`Emulator::run`]
/// until the guest branches to address zero.
#[derive(Debug)]
pub struct Emulator {
    regs: RegisterFile,
    space: AddressSpace,
    engine: JitEngine,
}

impl Emulator {
    /// Create a session with zeroed registers and an empty address space.
    ///
    /// # Errors
    ///
    /// Returns [`EmuError::Backend`] when the code-generation backend
    /// cannot be initialized on this host.
    pub fn new() -> EmuResult<Self> {
        Ok(Emulator {
            regs: RegisterFile::new(),
            space: AddressSpace::new(),
            engine: JitEngine::new()?,
        })
    }

    /// Load a guest image and point the PC at its entry.
    ///
    /// # Errors
    ///
    /// Propagates [`loader::load_file`] failures.
    pub fn load(&mut self, path: &std::path::Path) -> EmuResult<LoadedImage> {
        let image = loader::load_file(path, &mut self.space)?;
        self.regs.set_pc(image.entry);
        Ok(image)
    }

    /// The guest register file.
    #[must_use]
    pub fn regs(&self) -> &RegisterFile {
        &self.regs
    }

    /// The guest register file, mutably.
    pub fn regs_mut(&mut self) -> &mut RegisterFile {
        &mut self.regs
    }

    /// The guest address space.
    #[must_use]
    pub fn space(&self) -> &AddressSpace {
        &self.space
    }

    /// The guest address space, mutably.
    pub fn space_mut(&mut self) -> &mut AddressSpace {
        &mut self.space
    }

    /// Drop any cached translation covering `pc`.
    pub fn invalidate(&mut self, pc: u64) {
        self.engine.invalidate(pc);
    }

    /// Execute one basic block and return the new PC.
    ///
    /// # Errors
    ///
    /// Propagates translation and fetch failures.
    pub fn step<S: ProfileSink>(&mut self, sink: &mut S) -> EmuResult<u64> {
        self.engine.step(&mut self.regs, &mut self.space, sink)
    }

    /// Execute until the guest PC reaches zero.
    ///
    /// # Errors
    ///
    /// Propagates the first [`Emulator::step`] failure.
    pub fn run<S: ProfileSink>(&mut self, sink: &mut S) -> EmuResult<()> {
        self.engine.run(&mut self.regs, &mut self.space, sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_end_to_end() {
        let mut emu = Emulator::new().unwrap();
        let entry = 0x40_0000_u64;
        emu.space_mut()
            .map(entry, 0x100, Perms::READ | Perms::WRITE | Perms::EXEC)
            .unwrap();
        // add x0, x1, #7 then branch to zero.
        emu.space_mut()
            .write_u32(entry, 0x9100_1C20)
            .unwrap();
        emu.space_mut()
            .write_u32(entry + 4, 0x1400_0000 | ((-(0x10_0001_i32) as u32) & 0x03FF_FFFF))
            .unwrap();

        emu.regs_mut().set_pc(entry);
        emu.regs_mut().set_x(1, 5).unwrap();
        emu.run(&mut NullSink).unwrap();

        assert_eq!(emu.regs().pc(), 0);
        assert_eq!(emu.regs().x(0).unwrap(), 12);
    }
}
