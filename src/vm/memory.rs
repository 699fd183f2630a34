//! Guest address space: a sparse set of permissioned regions.

#![allow(clippy::cast_possible_truncation)]

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use crate::error::{AccessType, EmuError, EmuResult};

/// Region permission bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Perms(u8);

impl Perms {
    /// No access.
    pub const NONE: Perms = Perms(0);
    /// Readable.
    pub const READ: Perms = Perms(1);
    /// Writable.
    pub const WRITE: Perms = Perms(2);
    /// Executable (instruction fetch).
    pub const EXEC: Perms = Perms(4);

    /// Whether every bit of `other` is present in `self`.
    #[must_use]
    pub fn contains(self, other: Perms) -> bool {
        self.0 & other.0 == other.0
    }

    fn allows(self, access: AccessType) -> bool {
        match access {
            AccessType::Read => self.contains(Perms::READ),
            AccessType::Write => self.contains(Perms::WRITE),
            AccessType::Execute => self.contains(Perms::EXEC),
        }
    }
}

impl BitOr for Perms {
    type Output = Perms;

    fn bitor(self, rhs: Perms) -> Perms {
        Perms(self.0 | rhs.0)
    }
}

impl BitOrAssign for Perms {
    fn bitor_assign(&mut self, rhs: Perms) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for Perms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            if self.contains(Perms::READ) { 'r' } else { '-' },
            if self.contains(Perms::WRITE) { 'w' } else { '-' },
            if self.contains(Perms::EXEC) { 'x' } else { '-' },
        )
    }
}

/// One contiguous mapped region.
#[derive(Debug, Clone)]
struct Region {
    start: u64,
    data: Vec<u8>,
    perms: Perms,
}

impl Region {
    fn end(&self) -> u64 {
        self.start + self.data.len() as u64
    }

    fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end()
    }
}

/// Summary of a mapped region, as returned by [`AddressSpace::regions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionInfo {
    /// First guest address of the region.
    pub start: u64,
    /// Region length in bytes.
    pub len: usize,
    /// Access permissions.
    pub perms: Perms,
}

/// A sparse guest address space.
///
/// Regions are kept sorted by start address and never overlap. Multi-byte
/// accesses are composed from single bytes, so they may span adjacent
/// regions, and their byte order follows the configured data endianness.
/// Instruction fetch is always little-endian regardless of that setting.
#[derive(Debug, Clone, Default)]
pub struct AddressSpace {
    regions: Vec<Region>,
    big_endian: bool,
}

impl AddressSpace {
    /// Create an empty little-endian address space.
    #[must_use]
    pub fn new() -> Self {
        AddressSpace::default()
    }

    /// Select big- or little-endian byte order for data accesses.
    pub fn set_big_endian(&mut self, big_endian: bool) {
        self.big_endian = big_endian;
    }

    /// Whether data accesses use big-endian byte order.
    #[must_use]
    pub fn is_big_endian(&self) -> bool {
        self.big_endian
    }

    /// Map a zero-filled region of `size` bytes at `start`.
    ///
    /// # Errors
    ///
    /// Returns [`EmuError::InvalidArgument`] for a zero-sized or
    /// address-wrapping region and [`EmuError::RegionOverlap`] if any byte
    /// of the range is already mapped.
    pub fn map(&mut self, start: u64, size: usize, perms: Perms) -> EmuResult<()> {
        if size == 0 {
            return Err(EmuError::InvalidArgument("cannot map an empty region"));
        }
        let end = start
            .checked_add(size as u64)
            .ok_or(EmuError::InvalidArgument("region wraps the address space"))?;

        let at = self.regions.partition_point(|r| r.start < start);
        let clear_below = at == 0 || self.regions[at - 1].end() <= start;
        let clear_above = at == self.regions.len() || end <= self.regions[at].start;
        if !clear_below || !clear_above {
            return Err(EmuError::RegionOverlap {
                addr: start,
                size: size as u64,
            });
        }

        self.regions.insert(
            at,
            Region {
                start,
                data: vec![0; size],
                perms,
            },
        );
        Ok(())
    }

    /// Replace the permissions of the region starting exactly at `start`.
    ///
    /// # Errors
    ///
    /// Returns [`EmuError::OutOfBounds`] if no region starts there.
    pub fn protect(&mut self, start: u64, perms: Perms) -> EmuResult<()> {
        let region = self
            .regions
            .iter_mut()
            .find(|r| r.start == start)
            .ok_or(EmuError::OutOfBounds { addr: start })?;
        region.perms = perms;
        Ok(())
    }

    /// Remove the region starting exactly at `start`.
    ///
    /// # Errors
    ///
    /// Returns [`EmuError::OutOfBounds`] if no region starts there.
    pub fn unmap(&mut self, start: u64) -> EmuResult<()> {
        let at = self
            .regions
            .iter()
            .position(|r| r.start == start)
            .ok_or(EmuError::OutOfBounds { addr: start })?;
        self.regions.remove(at);
        Ok(())
    }

    /// Enumerate the mapped regions in address order.
    pub fn regions(&self) -> impl Iterator<Item = RegionInfo> + '_ {
        self.regions.iter().map(|r| RegionInfo {
            start: r.start,
            len: r.data.len(),
            perms: r.perms,
        })
    }

    /// Total number of mapped bytes across all regions.
    #[must_use]
    pub fn mapped_size(&self) -> usize {
        self.regions.iter().map(|r| r.data.len()).sum()
    }

    fn region_at(&self, addr: u64) -> Option<&Region> {
        let at = self.regions.partition_point(|r| r.start <= addr);
        let region = self.regions.get(at.checked_sub(1)?)?;
        region.contains(addr).then_some(region)
    }

    /// Verify that every byte of `[addr, addr + len)` is mapped with
    /// permissions allowing `access`.
    fn check_range(&self, addr: u64, len: usize, access: AccessType) -> EmuResult<()> {
        let mut at = addr;
        let end = addr
            .checked_add(len as u64)
            .ok_or(EmuError::OutOfBounds { addr })?;
        while at < end {
            let region = self
                .region_at(at)
                .ok_or(EmuError::OutOfBounds { addr: at })?;
            if !region.perms.allows(access) {
                return Err(EmuError::PermissionDenied { addr: at, access });
            }
            at = region.end().min(end);
        }
        Ok(())
    }

    fn byte_at(&self, addr: u64) -> EmuResult<u8> {
        let region = self
            .region_at(addr)
            .ok_or(EmuError::OutOfBounds { addr })?;
        Ok(region.data[(addr - region.start) as usize])
    }

    fn set_byte_at(&mut self, addr: u64, value: u8) -> EmuResult<()> {
        let at = self.regions.partition_point(|r| r.start <= addr);
        let region = at
            .checked_sub(1)
            .and_then(|i| self.regions.get_mut(i))
            .filter(|r| r.contains(addr))
            .ok_or(EmuError::OutOfBounds { addr })?;
        region.data[(addr - region.start) as usize] = value;
        Ok(())
    }

    /// Read one byte.
    ///
    /// # Errors
    ///
    /// Returns [`EmuError::OutOfBounds`] for unmapped addresses and
    /// [`EmuError::PermissionDenied`] without read permission.
    pub fn read_u8(&self, addr: u64) -> EmuResult<u8> {
        self.check_range(addr, 1, AccessType::Read)?;
        self.byte_at(addr)
    }

    /// Read a 16-bit value in the configured data byte order.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Self::read_u8`].
    pub fn read_u16(&self, addr: u64) -> EmuResult<u16> {
        let mut bytes = [0u8; 2];
        self.read_data(addr, &mut bytes)?;
        Ok(u16::from_le_bytes(bytes))
    }

    /// Read a 32-bit value in the configured data byte order.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Self::read_u8`].
    pub fn read_u32(&self, addr: u64) -> EmuResult<u32> {
        let mut bytes = [0u8; 4];
        self.read_data(addr, &mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }

    /// Read a 64-bit value in the configured data byte order.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Self::read_u8`].
    pub fn read_u64(&self, addr: u64) -> EmuResult<u64> {
        let mut bytes = [0u8; 8];
        self.read_data(addr, &mut bytes)?;
        Ok(u64::from_le_bytes(bytes))
    }

    /// Write one byte.
    ///
    /// # Errors
    ///
    /// Returns [`EmuError::OutOfBounds`] for unmapped addresses and
    /// [`EmuError::PermissionDenied`] without write permission.
    pub fn write_u8(&mut self, addr: u64, value: u8) -> EmuResult<()> {
        self.check_range(addr, 1, AccessType::Write)?;
        self.set_byte_at(addr, value)
    }

    /// Write a 16-bit value in the configured data byte order.
    ///
    /// The whole range is validated first, so a failing write leaves
    /// memory unchanged.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Self::write_u8`].
    pub fn write_u16(&mut self, addr: u64, value: u16) -> EmuResult<()> {
        self.write_data(addr, &value.to_le_bytes())
    }

    /// Write a 32-bit value in the configured data byte order.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Self::write_u8`].
    pub fn write_u32(&mut self, addr: u64, value: u32) -> EmuResult<()> {
        self.write_data(addr, &value.to_le_bytes())
    }

    /// Write a 64-bit value in the configured data byte order.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Self::write_u8`].
    pub fn write_u64(&mut self, addr: u64, value: u64) -> EmuResult<()> {
        self.write_data(addr, &value.to_le_bytes())
    }

    /// Read `bytes` little-endian-ordered data, reversing for big-endian.
    fn read_data(&self, addr: u64, bytes: &mut [u8]) -> EmuResult<()> {
        self.check_range(addr, bytes.len(), AccessType::Read)?;
        let len = bytes.len();
        for (i, byte) in bytes.iter_mut().enumerate() {
            let at = if self.big_endian { len - 1 - i } else { i };
            *byte = self.byte_at(addr + at as u64)?;
        }
        Ok(())
    }

    fn write_data(&mut self, addr: u64, bytes: &[u8]) -> EmuResult<()> {
        self.check_range(addr, bytes.len(), AccessType::Write)?;
        let len = bytes.len();
        for (i, &byte) in bytes.iter().enumerate() {
            let at = if self.big_endian { len - 1 - i } else { i };
            self.set_byte_at(addr + at as u64, byte)?;
        }
        Ok(())
    }

    /// Fetch a 32-bit instruction word. Requires execute permission and
    /// always reads little-endian.
    ///
    /// # Errors
    ///
    /// Returns [`EmuError::OutOfBounds`] for unmapped addresses and
    /// [`EmuError::PermissionDenied`] without execute permission.
    pub fn fetch_u32(&self, addr: u64) -> EmuResult<u32> {
        self.check_range(addr, 4, AccessType::Execute)?;
        let mut bytes = [0u8; 4];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = self.byte_at(addr + i as u64)?;
        }
        Ok(u32::from_le_bytes(bytes))
    }

    /// Copy a host buffer into guest memory, possibly spanning adjacent
    /// regions. The whole range is validated before any byte moves.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Self::write_u8`].
    pub fn copy_to(&mut self, addr: u64, data: &[u8]) -> EmuResult<()> {
        self.check_range(addr, data.len(), AccessType::Write)?;
        for (i, &byte) in data.iter().enumerate() {
            self.set_byte_at(addr + i as u64, byte)?;
        }
        Ok(())
    }

    /// Copy guest memory into a host buffer, possibly spanning adjacent
    /// regions.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Self::read_u8`].
    pub fn copy_from(&self, addr: u64, out: &mut [u8]) -> EmuResult<()> {
        self.check_range(addr, out.len(), AccessType::Read)?;
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.byte_at(addr + i as u64)?;
        }
        Ok(())
    }
}
