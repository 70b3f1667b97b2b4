/*
 *  Copyright (C) 2025  Markus Elias Gerber
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  You should have received a copy of the GNU General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use core::{
    fmt::{self, Display},
    ops::{Add, Sub},
};

use static_assertions::assert_eq_size;

/// First physical address that is *not* reachable by devices with a 32 bit address bus
pub const FOUR_GIB: u64 = 1 << 32;

/// A physical (bus) address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PhysAddr(pub u64);

assert_eq_size!(PhysAddr, u64);

impl PhysAddr {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns `true` if this address is a multiple of `alignment`
    pub fn is_aligned(&self, alignment: usize) -> bool {
        self.0 % alignment as u64 == 0
    }

    /// Byte offset of `self` relative to `base`
    pub fn offset_from(&self, base: PhysAddr) -> usize {
        debug_assert!(self.0 >= base.0, "{} is below {}", self, base);
        (self.0 - base.0) as usize
    }

    pub fn checked_add(&self, bytes: usize) -> Option<PhysAddr> {
        self.0.checked_add(bytes as u64).map(PhysAddr)
    }
}

impl Add<usize> for PhysAddr {
    type Output = PhysAddr;

    fn add(self, rhs: usize) -> Self::Output {
        PhysAddr(self.0 + rhs as u64)
    }
}

impl Sub<PhysAddr> for PhysAddr {
    type Output = usize;

    fn sub(self, rhs: PhysAddr) -> Self::Output {
        self.offset_from(rhs)
    }
}

impl Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A physically contiguous run `[addr, addr + len)`.
///
/// This is the unit every page-list walk hands out, be it for
/// mapping, cache maintenance or a scatter list for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysRun {
    pub addr: PhysAddr,
    pub len: usize,
}

impl PhysRun {
    pub const fn new(addr: PhysAddr, len: usize) -> Self {
        Self { addr, len }
    }

    pub fn end(&self) -> PhysAddr {
        self.addr + self.len
    }

    /// Returns `true` if both runs share at least one byte
    pub fn overlaps(&self, other: &PhysRun) -> bool {
        !(self.end() <= other.addr || other.end() <= self.addr)
    }
}
