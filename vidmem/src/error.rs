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

use thiserror::Error;

use crate::{
    allocation_identifier::{BufferId, ExportToken, RegionId, SessionId},
    phys_addr::PhysAddr,
};

/// Result type alias used by every fallible vidmem operation.
pub type Result<T> = std::result::Result<T, VidmemError>;

#[derive(Error, Debug)]
pub enum VidmemError {
    /// Malformed request (zero size, conflicting flags, unaligned values...)
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A reserved region could not be created or does not exist
    #[error("invalid region: {0}")]
    InvalidRegion(String),

    /// The page allocator has no free run/pages left for this request
    #[error("out of memory: could not allocate {requested} bytes")]
    OutOfMemory { requested: usize },

    /// A region pool has no free range big enough for this request
    #[error("region {region} out of space: could not allocate {requested} bytes")]
    OutOfSpace { region: RegionId, requested: usize },

    #[error("buffer {0} not found")]
    NotFound(BufferId),

    /// The export token does not (or no longer) resolve to a buffer
    #[error("invalid or stale export token {0}")]
    InvalidToken(ExportToken),

    #[error("buffer {0} is already mapped")]
    AlreadyMapped(BufferId),

    #[error("range [{offset:#x}, {offset:#x} + {len:#x}) is not valid for a buffer of {size:#x} bytes")]
    InvalidRange {
        offset: usize,
        len: usize,
        size: usize,
    },

    /// Direct free of a buffer that other sessions still reference
    #[error("buffer {id} is still shared ({refs} outstanding references)")]
    StillShared { id: BufferId, refs: u32 },

    /// Double free or free of a range that was never handed out
    #[error("invalid free of [{addr}, {addr} + {size:#x})")]
    InvalidFree { addr: PhysAddr, size: usize },

    #[error("region {region} still has {outstanding} outstanding allocation(s)")]
    ResourceBusy { region: RegionId, outstanding: usize },

    #[error("session {0} does not exist")]
    NoSuchSession(SessionId),

    /// Failure of a host memory primitive (memfd, mmap, ...)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl VidmemError {
    /// Returns `true` for resource exhaustion, which a caller may retry later
    pub fn is_exhaustion(&self) -> bool {
        matches!(
            self,
            VidmemError::OutOfMemory { .. } | VidmemError::OutOfSpace { .. }
        )
    }
}
