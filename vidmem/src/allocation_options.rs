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

use bitflags::bitflags;

use crate::{
    allocation_identifier::RegionId,
    error::{Result, VidmemError},
};

bitflags! {
    /// Flags of an allocation request
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AllocFlags: u32 {
        /// One physically contiguous run
        const CONTIGUOUS = 1 << 0;
        /// Only use physical memory below 4 GiB (narrow device address buses)
        const UNDER_4GIB = 1 << 1;
        /// Use the DMA coherent allocation primitive
        const COHERENT = 1 << 2;
        /// Clear the buffer before it is handed out
        const ZEROED = 1 << 3;
    }
}

bitflags! {
    /// Access rights handed to importers of an exported buffer
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ExportFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

/// Physical memory policy of a buffer. Fixed for the lifetime of the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Policy {
    Contiguous,
    Scattered,
    ReservedRegion,
    CoherentMapped,
}

/// Memory type a CPU mapping of a buffer uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryAttribute {
    Cached,
    WriteCombine,
    Uncached,
}

impl Policy {
    /// The memory type devices consuming buffers of this policy expect
    pub fn memory_attribute(&self) -> MemoryAttribute {
        match self {
            Policy::Contiguous | Policy::ReservedRegion => MemoryAttribute::WriteCombine,
            Policy::Scattered => MemoryAttribute::Cached,
            Policy::CoherentMapped => MemoryAttribute::Uncached,
        }
    }
}

/// Validated form of an [`AllocRequest`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResolvedPolicy {
    Contiguous { under_4gib: bool },
    Scattered { under_4gib: bool },
    Region { region: RegionId },
    Coherent { under_4gib: bool },
}

/// A request for a new buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocRequest {
    pub size: usize,
    pub flags: AllocFlags,
    /// Carve the buffer out of this reserved region
    pub region: Option<RegionId>,
}

impl AllocRequest {
    pub fn new(size: usize, flags: AllocFlags) -> Self {
        AllocRequest {
            size,
            flags,
            region: None,
        }
    }

    pub fn scattered(size: usize) -> Self {
        Self::new(size, AllocFlags::empty())
    }

    pub fn contiguous(size: usize) -> Self {
        Self::new(size, AllocFlags::CONTIGUOUS)
    }

    pub fn coherent(size: usize) -> Self {
        Self::new(size, AllocFlags::COHERENT)
    }

    pub fn from_region(size: usize, region: RegionId) -> Self {
        AllocRequest {
            size,
            flags: AllocFlags::empty(),
            region: Some(region),
        }
    }

    pub fn with_flags(mut self, flags: AllocFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn policy(&self) -> Result<Policy> {
        Ok(match self.resolve()? {
            ResolvedPolicy::Contiguous { .. } => Policy::Contiguous,
            ResolvedPolicy::Scattered { .. } => Policy::Scattered,
            ResolvedPolicy::Region { .. } => Policy::ReservedRegion,
            ResolvedPolicy::Coherent { .. } => Policy::CoherentMapped,
        })
    }

    pub(crate) fn resolve(&self) -> Result<ResolvedPolicy> {
        if self.size == 0 {
            return Err(VidmemError::InvalidArgument("buffer size must not be zero"));
        }

        let under_4gib = self.flags.contains(AllocFlags::UNDER_4GIB);

        if let Some(region) = self.region {
            // a region has a fixed placement, it can neither be coherent
            // nor be moved below 4 GiB
            if self.flags.contains(AllocFlags::COHERENT) {
                return Err(VidmemError::InvalidArgument(
                    "region backed buffers cannot be coherent mapped",
                ));
            }
            if under_4gib {
                return Err(VidmemError::InvalidArgument(
                    "region backed buffers cannot be placed below 4 GiB",
                ));
            }

            return Ok(ResolvedPolicy::Region { region });
        }

        if self.flags.contains(AllocFlags::COHERENT) {
            Ok(ResolvedPolicy::Coherent { under_4gib })
        } else if self.flags.contains(AllocFlags::CONTIGUOUS) {
            Ok(ResolvedPolicy::Contiguous { under_4gib })
        } else {
            Ok(ResolvedPolicy::Scattered { under_4gib })
        }
    }
}
