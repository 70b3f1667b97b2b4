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

use crate::{
    allocation_identifier::RegionId,
    allocation_options::{Policy, ResolvedPolicy},
    error::{Result, VidmemError},
    modules::page_backend::PageBackendModule,
    phys_addr::{PhysAddr, PhysRun},
    util::ceil_div,
};

/// What has to be handed back to the page backend, one variant per policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BlockBacking {
    Contiguous { base: PhysAddr, pages: usize },
    Scattered { pages: Vec<PhysAddr> },
    Region { region: RegionId, base: PhysAddr, pages: usize },
    Coherent { base: PhysAddr, pages: usize },
}

/// One allocated buffer.
///
/// The backing covers exactly `ceil(size / page_size)` pages and stays
/// owned by this block until [`MemoryBlock::release_backing`] is called.
#[derive(Debug)]
pub(crate) struct MemoryBlock {
    size: usize,
    page_size: usize,
    backing: BlockBacking,
}

impl MemoryBlock {
    pub(crate) fn allocate<B: PageBackendModule>(
        backend: &B,
        policy: ResolvedPolicy,
        size: usize,
    ) -> Result<Self> {
        let page_size = backend.page_size();
        if size == 0 {
            return Err(VidmemError::InvalidArgument("buffer size must not be zero"));
        }
        let pages = ceil_div(size, page_size).ok_or(VidmemError::OutOfMemory { requested: size })?;
        let n_bytes = pages
            .checked_mul(page_size)
            .ok_or(VidmemError::OutOfMemory { requested: size })?;

        let backing = match policy {
            ResolvedPolicy::Contiguous { under_4gib } => BlockBacking::Contiguous {
                base: backend.alloc_contiguous(n_bytes, under_4gib)?,
                pages,
            },
            ResolvedPolicy::Scattered { under_4gib } => BlockBacking::Scattered {
                pages: backend.alloc_scattered(n_bytes, under_4gib)?,
            },
            ResolvedPolicy::Region { region } => BlockBacking::Region {
                region,
                base: backend.alloc_from_region(region, n_bytes)?,
                pages,
            },
            ResolvedPolicy::Coherent { under_4gib } => BlockBacking::Coherent {
                base: backend.alloc_coherent(n_bytes, under_4gib)?,
                pages,
            },
        };

        Ok(MemoryBlock {
            size,
            page_size,
            backing,
        })
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn page_size(&self) -> usize {
        self.page_size
    }

    pub(crate) fn page_count(&self) -> usize {
        match &self.backing {
            BlockBacking::Contiguous { pages, .. }
            | BlockBacking::Region { pages, .. }
            | BlockBacking::Coherent { pages, .. } => *pages,
            BlockBacking::Scattered { pages } => pages.len(),
        }
    }

    /// Size of all backing pages in bytes
    pub(crate) fn backed_size(&self) -> usize {
        self.page_count() * self.page_size
    }

    pub(crate) fn policy(&self) -> Policy {
        match &self.backing {
            BlockBacking::Contiguous { .. } => Policy::Contiguous,
            BlockBacking::Scattered { .. } => Policy::Scattered,
            BlockBacking::Region { .. } => Policy::ReservedRegion,
            BlockBacking::Coherent { .. } => Policy::CoherentMapped,
        }
    }

    /// Physical address of the first byte
    pub(crate) fn phys_base(&self) -> PhysAddr {
        match &self.backing {
            BlockBacking::Contiguous { base, .. }
            | BlockBacking::Region { base, .. }
            | BlockBacking::Coherent { base, .. } => *base,
            BlockBacking::Scattered { pages } => pages.first().copied().unwrap_or_default(),
        }
    }

    /// Returns `true` if physical address `addr` is backed by this block
    pub(crate) fn contains_phys(&self, addr: PhysAddr) -> bool {
        match &self.backing {
            BlockBacking::Scattered { pages } => pages
                .iter()
                .any(|page| PhysRun::new(*page, self.page_size).overlaps(&PhysRun::new(addr, 1))),
            _ => PhysRun::new(self.phys_base(), self.backed_size())
                .overlaps(&PhysRun::new(addr, 1)),
        }
    }

    /// Walks the physically contiguous runs that back `[offset, offset + len)`.
    ///
    /// `f` is called with the offset of the run inside of the block and the run.
    /// Physically adjacent pages are merged into a single run.
    /// The range may reach into the padding of the last page.
    pub(crate) fn for_each_run_in<F: FnMut(usize, PhysRun) -> Result<()>>(
        &self,
        offset: usize,
        len: usize,
        mut f: F,
    ) -> Result<()> {
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= self.backed_size())
            .ok_or(VidmemError::InvalidRange {
                offset,
                len,
                size: self.size,
            })?;

        if len == 0 {
            return Ok(());
        }

        let pages = match &self.backing {
            BlockBacking::Scattered { pages } => pages,
            _ => return f(offset, PhysRun::new(self.phys_base() + offset, len)),
        };

        let mut current: Option<(usize, PhysRun)> = None;
        let mut pos = offset;

        while pos < end {
            let in_page = pos % self.page_size;
            let chunk = (self.page_size - in_page).min(end - pos);
            let addr = pages[pos / self.page_size] + in_page;

            if let Some((_, run)) = current.as_mut() {
                if run.end() == addr {
                    run.len += chunk;
                    pos += chunk;
                    continue;
                }
            }

            if let Some((run_offset, run)) = current.take() {
                f(run_offset, run)?;
            }
            current = Some((pos, PhysRun::new(addr, chunk)));
            pos += chunk;
        }

        match current {
            Some((run_offset, run)) => f(run_offset, run),
            None => Ok(()),
        }
    }

    /// Clears every backing page
    pub(crate) fn zero<B: PageBackendModule>(&self, backend: &B) -> Result<()> {
        self.for_each_run_in(0, self.backed_size(), |_, run| backend.fill_run(run, 0))
    }

    /// Hands the backing back to `backend`. Must be called exactly once.
    pub(crate) fn release_backing<B: PageBackendModule>(&self, backend: &B) -> Result<()> {
        let n_bytes = self.backed_size();

        match &self.backing {
            BlockBacking::Contiguous { base, .. } => backend.free_contiguous(*base, n_bytes),
            BlockBacking::Scattered { pages } => backend.free_scattered(pages),
            BlockBacking::Region { region, base, .. } => {
                backend.free_from_region(*region, *base, n_bytes)
            }
            BlockBacking::Coherent { base, .. } => backend.free_coherent(*base, n_bytes),
        }
    }
}
