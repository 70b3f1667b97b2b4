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

mod free_list;

use std::collections::BTreeMap;

use log::{debug, trace, warn};
use parking_lot::Mutex;

use crate::{
    allocation_identifier::RegionId,
    error::{Result, VidmemError},
    phys_addr::{PhysAddr, PhysRun},
    util::align_up,
};
use free_list::FreeList;

/// Offset allocator over one reserved physical region.
///
/// Hands out page aligned, non overlapping sub ranges of `[base, base + size)`
/// (first fit, lowest address first) and takes them back again.
/// All operations are serialized by a single lock per pool.
pub struct RegionPool {
    id: RegionId,
    base: PhysAddr,
    size: usize,
    page_size: usize,
    inner: Mutex<RegionPoolInner>,
}

struct RegionPoolInner {
    free_list: FreeList,

    /// every range that is currently handed out: base -> size
    allocated: BTreeMap<PhysAddr, usize>,

    destroyed: bool,
}

impl RegionPool {
    /// Registers `[base, base + size)` for carve out allocations
    pub fn create(id: RegionId, base: PhysAddr, size: usize, page_size: usize) -> Result<Self> {
        if size == 0 {
            return Err(VidmemError::InvalidRegion(format!("region {} is empty", id)));
        }
        if !base.is_aligned(page_size) || size % page_size != 0 {
            return Err(VidmemError::InvalidRegion(format!(
                "region {} ({}, {:#x} bytes) is not page aligned",
                id, base, size
            )));
        }
        if base.checked_add(size).is_none() {
            return Err(VidmemError::InvalidRegion(format!("region {} overflows", id)));
        }

        let mut free_list = FreeList::new();
        free_list
            .insert(PhysRun::new(base, size))
            .map_err(|_| VidmemError::InvalidRegion(format!("region {} is invalid", id)))?;

        debug!("Created region pool {}: [{}, {})", id, base, base + size);

        Ok(RegionPool {
            id,
            base,
            size,
            page_size,
            inner: Mutex::new(RegionPoolInner {
                free_list,
                allocated: BTreeMap::new(),
                destroyed: false,
            }),
        })
    }

    pub fn id(&self) -> RegionId {
        self.id
    }

    pub fn base(&self) -> PhysAddr {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns `true` if `run` lies completely inside of this region
    pub fn contains(&self, run: &PhysRun) -> bool {
        run.addr >= self.base && run.end() <= self.base + self.size
    }

    /// Allocates at least `size` bytes. The returned range is page aligned.
    pub fn alloc(&self, size: usize) -> Result<PhysAddr> {
        if size == 0 {
            return Err(VidmemError::InvalidArgument("allocation size must not be zero"));
        }

        let aligned_size = align_up(size, self.page_size).ok_or(VidmemError::OutOfSpace {
            region: self.id,
            requested: size,
        })?;
        let mut inner = self.inner.lock();

        if inner.destroyed {
            return Err(VidmemError::InvalidRegion(format!(
                "region {} was destroyed",
                self.id
            )));
        }

        let addr = inner
            .free_list
            .allocate_first_fit(aligned_size)
            .ok_or(VidmemError::OutOfSpace {
                region: self.id,
                requested: size,
            })?;

        inner.allocated.insert(addr, aligned_size);
        trace!(
            "Region {}: allocated [{}, {})",
            self.id,
            addr,
            addr + aligned_size
        );

        Ok(addr)
    }

    /// Gives back a range that was returned by [`RegionPool::alloc`] with the same `size`.
    ///
    /// Double frees and frees of ranges that were never handed out are rejected
    /// and leave the pool untouched.
    pub fn free(&self, addr: PhysAddr, size: usize) -> Result<()> {
        let aligned_size = align_up(size, self.page_size)
            .ok_or(VidmemError::InvalidFree { addr, size })?;
        let mut inner = self.inner.lock();

        match inner.allocated.get(&addr) {
            Some(&allocated_size) if allocated_size == aligned_size && size != 0 => {}
            _ => {
                warn!(
                    "Region {}: rejected free of [{}, {}) that is not allocated",
                    self.id,
                    addr,
                    addr + aligned_size
                );
                return Err(VidmemError::InvalidFree { addr, size });
            }
        }

        inner
            .free_list
            .insert(PhysRun::new(addr, aligned_size))
            .map_err(|_| VidmemError::InvalidFree { addr, size })?;
        inner.allocated.remove(&addr);

        trace!(
            "Region {}: freed [{}, {})",
            self.id,
            addr,
            addr + aligned_size
        );

        Ok(())
    }

    /// Tears the pool down. Fails with [`VidmemError::ResourceBusy`] while
    /// ranges are still allocated, in which case the pool stays usable.
    pub fn destroy(&self) -> Result<()> {
        let mut inner = self.inner.lock();

        if !inner.allocated.is_empty() {
            return Err(VidmemError::ResourceBusy {
                region: self.id,
                outstanding: inner.allocated.len(),
            });
        }

        inner.destroyed = true;
        debug!("Destroyed region pool {}", self.id);

        Ok(())
    }

    /// Number of ranges that are currently allocated
    pub fn outstanding(&self) -> usize {
        self.inner.lock().allocated.len()
    }

    pub fn free_bytes(&self) -> usize {
        let inner = self.inner.lock();
        if inner.destroyed {
            0
        } else {
            inner.free_list.free_bytes()
        }
    }
}
