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

mod frame_table;
mod system;

pub use system::SystemPageBackend;

#[cfg(test)]
pub(crate) use system::test;

use crate::{
    allocation_identifier::RegionId,
    error::Result,
    phys_addr::{PhysAddr, PhysRun},
};

/// Direction of a cache maintenance operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    /// CPU wrote the buffer, device reads it next (clean)
    ToDevice,
    /// Device wrote the buffer, CPU reads it next (invalidate)
    FromDevice,
    Bidirectional,
}

/// A module that hands out physical memory and gives the CPU access to it.
///
/// Every allocation strategy has its symmetric `free_*` counterpart, which has
/// to be called with the same values the allocation was made with.
/// Content of newly allocated memory is undefined.
///
/// Implementations have to be internally synchronized.
pub trait PageBackendModule: Send + Sync {
    /// Granularity of all allocations in bytes
    fn page_size(&self) -> usize;

    /// Number of reserved regions, valid region ids are `0..region_count()`
    fn region_count(&self) -> usize;

    /// Allocates one physically contiguous run of at least `n_bytes`
    fn alloc_contiguous(&self, n_bytes: usize, under_4gib: bool) -> Result<PhysAddr>;

    /// Allocates `ceil(n_bytes / page_size)` independent pages.
    ///
    /// Either all pages are allocated or none.
    fn alloc_scattered(&self, n_bytes: usize, under_4gib: bool) -> Result<Vec<PhysAddr>>;

    /// Carves at least `n_bytes` out of reserved region `region`
    fn alloc_from_region(&self, region: RegionId, n_bytes: usize) -> Result<PhysAddr>;

    /// Allocates DMA coherent memory of at least `n_bytes`
    fn alloc_coherent(&self, n_bytes: usize, under_4gib: bool) -> Result<PhysAddr>;

    fn free_contiguous(&self, base: PhysAddr, n_bytes: usize) -> Result<()>;

    fn free_scattered(&self, pages: &[PhysAddr]) -> Result<()>;

    fn free_from_region(&self, region: RegionId, base: PhysAddr, n_bytes: usize) -> Result<()>;

    fn free_coherent(&self, base: PhysAddr, n_bytes: usize) -> Result<()>;

    /// Reserves `len` bytes of inaccessible, contiguous virtual address space
    /// and returns its start address
    fn reserve_view(&self, len: usize) -> Result<usize>;

    /// Installs `run` at `vaddr`, which has to be inside of a reserved view
    fn install_run(&self, vaddr: usize, run: PhysRun, writable: bool) -> Result<()>;

    /// Removes a view created by [`PageBackendModule::reserve_view`] including all installed runs
    fn release_view(&self, vaddr: usize, len: usize) -> Result<()>;

    /// Reads physical memory the way a device would (no CPU mapping involved)
    fn read_phys(&self, addr: PhysAddr, dest: &mut [u8]) -> Result<()>;

    /// Writes physical memory the way a device would (no CPU mapping involved)
    fn write_phys(&self, addr: PhysAddr, src: &[u8]) -> Result<()>;

    /// Sets every byte of `run` to `value`
    fn fill_run(&self, run: PhysRun, value: u8) -> Result<()> {
        let chunk = vec![value; self.page_size().min(run.len)];

        let mut offset = 0;
        while offset < run.len {
            let len = chunk.len().min(run.len - offset);
            self.write_phys(run.addr + offset, &chunk[..len])?;
            offset += len;
        }

        Ok(())
    }

    /// Cache maintenance for `run`
    fn sync_run(&self, run: PhysRun, direction: SyncDirection) -> Result<()>;

    /// Number of free pages that are not part of a reserved region
    fn free_pages(&self) -> usize;

    /// Free bytes of region `region` or `None` if it does not exist
    fn region_free_bytes(&self, region: RegionId) -> Option<usize>;

    /// Releases backend resources. Fails if memory is still allocated.
    fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}
