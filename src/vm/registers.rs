//! Guest register file.

#![allow(clippy::cast_possible_truncation)]

use std::fmt;

use crate::error::{EmuError, EmuResult};

/// Index of the stack pointer in the general register array.
pub const REG_SP: usize = 31;
/// Index of the program counter in the general register array.
pub const REG_PC: usize = 32;
/// Index of the packed NZCV flag word in the general register array.
pub const REG_NZCV: usize = 33;

/// Number of slots in the general register array, including SP, PC and NZCV.
pub const NUM_REGS: usize = 34;
/// Number of 128-bit vector registers.
pub const NUM_VREGS: usize = 32;

const FLAG_N: u64 = 1 << 31;
const FLAG_Z: u64 = 1 << 30;
const FLAG_C: u64 = 1 << 29;
const FLAG_V: u64 = 1 << 28;

/// The complete architectural register state of a guest core.
///
/// General registers, SP, PC and the packed flag word live in one flat
/// `u64` array so compiled code can address any slot as `base + 8 * index`
/// with a single pointer. The layout is part of the JIT ABI and must not be
/// reordered.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct RegisterFile {
    x: [u64; NUM_REGS],
    v: [[u8; 16]; NUM_VREGS],
    fpsr: u32,
    fpcr: u32,
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterFile {
    /// Create a register file with every register zeroed.
    #[must_use]
    pub fn new() -> Self {
        RegisterFile {
            x: [0; NUM_REGS],
            v: [[0; 16]; NUM_VREGS],
            fpsr: 0,
            fpcr: 0,
        }
    }

    /// Read general register `index` (including SP, PC and NZCV slots).
    ///
    /// # Errors
    ///
    /// Returns [`EmuError::InvalidArgument`] for indices past the array.
    pub fn x(&self, index: usize) -> EmuResult<u64> {
        self.x
            .get(index)
            .copied()
            .ok_or(EmuError::InvalidArgument("register index out of range"))
    }

    /// Write general register `index`.
    ///
    /// # Errors
    ///
    /// Returns [`EmuError::InvalidArgument`] for out-of-range indices and
    /// for the SP slot, which must be written through [`Self::set_sp`].
    pub fn set_x(&mut self, index: usize, value: u64) -> EmuResult<()> {
        if index == REG_SP {
            return Err(EmuError::InvalidArgument(
                "stack pointer must be written through set_sp",
            ));
        }
        let slot = self
            .x
            .get_mut(index)
            .ok_or(EmuError::InvalidArgument("register index out of range"))?;
        *slot = value;
        Ok(())
    }

    /// Read the low 32 bits of general register `index`.
    ///
    /// # Errors
    ///
    /// Returns [`EmuError::InvalidArgument`] for out-of-range indices.
    pub fn w(&self, index: usize) -> EmuResult<u32> {
        Ok(self.x(index)? as u32)
    }

    /// Write the low 32 bits of general register `index`, zeroing the
    /// upper half as a 32-bit architectural write does.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Self::set_x`].
    pub fn set_w(&mut self, index: usize, value: u32) -> EmuResult<()> {
        self.set_x(index, u64::from(value))
    }

    /// The stack pointer.
    #[must_use]
    pub fn sp(&self) -> u64 {
        self.x[REG_SP]
    }

    /// Set the stack pointer.
    pub fn set_sp(&mut self, value: u64) {
        self.x[REG_SP] = value;
    }

    /// The program counter.
    #[must_use]
    pub fn pc(&self) -> u64 {
        self.x[REG_PC]
    }

    /// Set the program counter.
    pub fn set_pc(&mut self, value: u64) {
        self.x[REG_PC] = value;
    }

    /// The packed NZCV flag word.
    #[must_use]
    pub fn nzcv(&self) -> u64 {
        self.x[REG_NZCV]
    }

    /// Set the packed NZCV flag word.
    pub fn set_nzcv(&mut self, value: u64) {
        self.x[REG_NZCV] = value;
    }

    /// The negative flag (bit 31 of NZCV).
    #[must_use]
    pub fn flag_n(&self) -> bool {
        self.x[REG_NZCV] & FLAG_N != 0
    }

    /// The zero flag (bit 30 of NZCV).
    #[must_use]
    pub fn flag_z(&self) -> bool {
        self.x[REG_NZCV] & FLAG_Z != 0
    }

    /// The carry flag (bit 29 of NZCV).
    #[must_use]
    pub fn flag_c(&self) -> bool {
        self.x[REG_NZCV] & FLAG_C != 0
    }

    /// The overflow flag (bit 28 of NZCV).
    #[must_use]
    pub fn flag_v(&self) -> bool {
        self.x[REG_NZCV] & FLAG_V != 0
    }

    /// Set or clear the negative flag.
    pub fn set_flag_n(&mut self, set: bool) {
        self.set_flag(FLAG_N, set);
    }

    /// Set or clear the zero flag.
    pub fn set_flag_z(&mut self, set: bool) {
        self.set_flag(FLAG_Z, set);
    }

    /// Set or clear the carry flag.
    pub fn set_flag_c(&mut self, set: bool) {
        self.set_flag(FLAG_C, set);
    }

    /// Set or clear the overflow flag.
    pub fn set_flag_v(&mut self, set: bool) {
        self.set_flag(FLAG_V, set);
    }

    fn set_flag(&mut self, mask: u64, set: bool) {
        if set {
            self.x[REG_NZCV] |= mask;
        } else {
            self.x[REG_NZCV] &= !mask;
        }
    }

    /// Read vector register `index` as raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EmuError::InvalidArgument`] for out-of-range indices.
    pub fn v(&self, index: usize) -> EmuResult<[u8; 16]> {
        self.v
            .get(index)
            .copied()
            .ok_or(EmuError::InvalidArgument("vector register index out of range"))
    }

    /// Write vector register `index`.
    ///
    /// # Errors
    ///
    /// Returns [`EmuError::InvalidArgument`] for out-of-range indices.
    pub fn set_v(&mut self, index: usize, value: [u8; 16]) -> EmuResult<()> {
        let slot = self
            .v
            .get_mut(index)
            .ok_or(EmuError::InvalidArgument("vector register index out of range"))?;
        *slot = value;
        Ok(())
    }

    /// Read one 64-bit lane (0 or 1) of vector register `index`.
    ///
    /// # Errors
    ///
    /// Returns [`EmuError::InvalidArgument`] for an out-of-range register
    /// or lane.
    pub fn v_lane64(&self, index: usize, lane: usize) -> EmuResult<u64> {
        let reg = self
            .v
            .get(index)
            .ok_or(EmuError::InvalidArgument("vector register index out of range"))?;
        let bytes = reg
            .get(lane * 8..lane * 8 + 8)
            .ok_or(EmuError::InvalidArgument("vector lane out of range"))?;
        Ok(u64::from_le_bytes(bytes.try_into().unwrap_or_default()))
    }

    /// Write one 64-bit lane (0 or 1) of vector register `index`.
    ///
    /// # Errors
    ///
    /// Returns [`EmuError::InvalidArgument`] for an out-of-range register
    /// or lane.
    pub fn set_v_lane64(&mut self, index: usize, lane: usize, value: u64) -> EmuResult<()> {
        let reg = self
            .v
            .get_mut(index)
            .ok_or(EmuError::InvalidArgument("vector register index out of range"))?;
        let bytes = reg
            .get_mut(lane * 8..lane * 8 + 8)
            .ok_or(EmuError::InvalidArgument("vector lane out of range"))?;
        bytes.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// The floating-point status register.
    #[must_use]
    pub fn fpsr(&self) -> u32 {
        self.fpsr
    }

    /// Set the floating-point status register.
    pub fn set_fpsr(&mut self, value: u32) {
        self.fpsr = value;
    }

    /// The floating-point control register.
    #[must_use]
    pub fn fpcr(&self) -> u32 {
        self.fpcr
    }

    /// Set the floating-point control register.
    pub fn set_fpcr(&mut self, value: u32) {
        self.fpcr = value;
    }

    /// Base pointer of the general register array, for compiled code.
    ///
    /// The pointee is `NUM_REGS` consecutive `u64` slots. The pointer is
    /// only valid while the register file is not moved.
    pub fn x_mut_ptr(&mut self) -> *mut u64 {
        self.x.as_mut_ptr()
    }

    /// Serialize the full register state to a flat little-endian byte
    /// vector. Always [`SNAPSHOT_LEN`] bytes.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SNAPSHOT_LEN);
        for reg in &self.x {
            out.extend_from_slice(&reg.to_le_bytes());
        }
        for vreg in &self.v {
            out.extend_from_slice(vreg);
        }
        out.extend_from_slice(&self.fpsr.to_le_bytes());
        out.extend_from_slice(&self.fpcr.to_le_bytes());
        out
    }

    /// Restore state from a [`Self::snapshot`] image.
    ///
    /// # Errors
    ///
    /// Returns [`EmuError::InvalidArgument`] if the image has the wrong
    /// length.
    pub fn restore(&mut self, image: &[u8]) -> EmuResult<()> {
        if image.len() != SNAPSHOT_LEN {
            return Err(EmuError::InvalidArgument("bad register snapshot length"));
        }
        let mut at = 0;
        for reg in &mut self.x {
            *reg = u64::from_le_bytes(image[at..at + 8].try_into().unwrap_or_default());
            at += 8;
        }
        for vreg in &mut self.v {
            vreg.copy_from_slice(&image[at..at + 16]);
            at += 16;
        }
        self.fpsr = u32::from_le_bytes(image[at..at + 4].try_into().unwrap_or_default());
        self.fpcr = u32::from_le_bytes(image[at + 4..at + 8].try_into().unwrap_or_default());
        Ok(())
    }
}

/// Length in bytes of a register snapshot.
pub const SNAPSHOT_LEN: usize = NUM_REGS * 8 + NUM_VREGS * 16 + 8;

impl fmt::Debug for RegisterFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisterFile")
            .field("pc", &self.pc())
            .field("sp", &self.sp())
            .field("nzcv", &self.nzcv())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for RegisterFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, chunk) in self.x[..31].chunks(4).enumerate() {
            for (j, reg) in chunk.iter().enumerate() {
                write!(f, "x{:<2} {reg:#018x}  ", i * 4 + j)?;
            }
            writeln!(f)?;
        }
        writeln!(f, "sp  {:#018x}  pc  {:#018x}", self.sp(), self.pc())?;
        write!(
            f,
            "nzcv {}{}{}{}",
            if self.flag_n() { 'N' } else { '-' },
            if self.flag_z() { 'Z' } else { '-' },
            if self.flag_c() { 'C' } else { '-' },
            if self.flag_v() { 'V' } else { '-' },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registers_start_zeroed() {
        let regs = RegisterFile::new();
        for i in 0..NUM_REGS {
            assert_eq!(regs.x(i).unwrap(), 0);
        }
        assert_eq!(regs.v(0).unwrap(), [0; 16]);
    }

    #[test]
    fn test_general_register_round_trip() {
        let mut regs = RegisterFile::new();
        regs.set_x(0, 0xDEAD_BEEF_CAFE_F00D).unwrap();
        regs.set_x(30, 42).unwrap();
        assert_eq!(regs.x(0).unwrap(), 0xDEAD_BEEF_CAFE_F00D);
        assert_eq!(regs.x(30).unwrap(), 42);
    }

    #[test]
    fn test_sp_rejects_indexed_write() {
        let mut regs = RegisterFile::new();
        assert!(regs.set_x(REG_SP, 1).is_err());
        regs.set_sp(0x8000);
        assert_eq!(regs.sp(), 0x8000);
        assert_eq!(regs.x(REG_SP).unwrap(), 0x8000);
    }

    #[test]
    fn test_out_of_range_index() {
        let mut regs = RegisterFile::new();
        assert!(regs.x(NUM_REGS).is_err());
        assert!(regs.set_x(NUM_REGS, 0).is_err());
        assert!(regs.v(NUM_VREGS).is_err());
    }

    #[test]
    fn test_vector_lane_access() {
        let mut regs = RegisterFile::new();
        regs.set_v_lane64(2, 0, 0x0102_0304_0506_0708).unwrap();
        regs.set_v_lane64(2, 1, 0xAAAA_BBBB_CCCC_DDDD).unwrap();
        assert_eq!(regs.v_lane64(2, 0).unwrap(), 0x0102_0304_0506_0708);
        assert_eq!(regs.v_lane64(2, 1).unwrap(), 0xAAAA_BBBB_CCCC_DDDD);
        assert_eq!(regs.v(2).unwrap()[0], 0x08);
        assert!(regs.v_lane64(2, 2).is_err());
        assert!(regs.set_v_lane64(NUM_VREGS, 0, 0).is_err());
    }

    #[test]
    fn test_narrow_write_zero_extends() {
        let mut regs = RegisterFile::new();
        regs.set_x(5, u64::MAX).unwrap();
        regs.set_w(5, 0x1234_5678).unwrap();
        assert_eq!(regs.x(5).unwrap(), 0x1234_5678);
        assert_eq!(regs.w(5).unwrap(), 0x1234_5678);
    }

    #[test]
    fn test_flag_accessors_pack_nzcv() {
        let mut regs = RegisterFile::new();
        regs.set_flag_n(true);
        regs.set_flag_c(true);
        assert_eq!(regs.nzcv(), (1 << 31) | (1 << 29));
        assert!(regs.flag_n());
        assert!(!regs.flag_z());
        assert!(regs.flag_c());
        assert!(!regs.flag_v());

        regs.set_flag_n(false);
        regs.set_flag_z(true);
        assert_eq!(regs.nzcv(), (1 << 30) | (1 << 29));
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut regs = RegisterFile::new();
        regs.set_x(3, 0x1122_3344_5566_7788).unwrap();
        regs.set_sp(0xFFF0);
        regs.set_pc(0x40_0000);
        regs.set_v(7, [0xAB; 16]).unwrap();
        regs.set_fpsr(0x1);
        regs.set_fpcr(0x2);

        let image = regs.snapshot();
        assert_eq!(image.len(), SNAPSHOT_LEN);

        let mut other = RegisterFile::new();
        other.restore(&image).unwrap();
        assert_eq!(other.x(3).unwrap(), 0x1122_3344_5566_7788);
        assert_eq!(other.sp(), 0xFFF0);
        assert_eq!(other.pc(), 0x40_0000);
        assert_eq!(other.v(7).unwrap(), [0xAB; 16]);
        assert_eq!(other.fpsr(), 0x1);
        assert_eq!(other.fpcr(), 0x2);

        assert!(other.restore(&image[..10]).is_err());
    }

    #[test]
    fn test_snapshot_length_constant() {
        assert_eq!(SNAPSHOT_LEN, 792);
    }
}
