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

use log::{trace, warn};

use crate::{
    allocation_options::MemoryAttribute,
    error::{Result, VidmemError},
    memory_block::MemoryBlock,
    modules::page_backend::PageBackendModule,
    util::align_up,
};

/// A CPU view of (a part of) a buffer.
///
/// The view is virtually contiguous even if the buffer is scattered
/// in physical memory. It stays valid until the buffer is unmapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualRange {
    /// Start of the view
    pub addr: usize,
    /// Length of the view in bytes, always a multiple of the page size
    pub len: usize,
    /// Offset of the first byte of the view inside of the buffer
    pub offset: usize,
    pub attribute: MemoryAttribute,
    pub writable: bool,
}

impl VirtualRange {
    pub fn as_ptr(&self) -> *const u8 {
        self.addr as *const u8
    }

    /// Pointer for writing, `None` for read only views
    pub fn as_mut_ptr(&self) -> Option<*mut u8> {
        if self.writable {
            Some(self.addr as *mut u8)
        } else {
            None
        }
    }

    /// # Safety
    ///
    /// The view must still be mapped for the whole lifetime `'a` and
    /// other views of the same buffer may change its content concurrently.
    pub unsafe fn as_slice<'a>(&self) -> &'a [u8] {
        std::slice::from_raw_parts(self.as_ptr(), self.len)
    }

    /// Mutable byte slice of the view, `None` for read only views.
    ///
    /// # Safety
    ///
    /// Same as [`VirtualRange::as_slice`]. In addition, no other slice of
    /// this view may be alive at the same time.
    pub unsafe fn as_mut_slice<'a>(&self) -> Option<&'a mut [u8]> {
        self.as_mut_ptr()
            .map(|ptr| std::slice::from_raw_parts_mut(ptr, self.len))
    }
}

/// Maps `[offset, offset + len)` of `block` into a new virtually contiguous view.
///
/// `offset` has to be page aligned, `len` is rounded up to whole pages.
/// If installing any run fails, nothing stays mapped.
pub(crate) fn establish<B: PageBackendModule>(
    backend: &B,
    block: &MemoryBlock,
    offset: usize,
    len: usize,
    writable: bool,
) -> Result<VirtualRange> {
    let invalid_range = VidmemError::InvalidRange {
        offset,
        len,
        size: block.size(),
    };

    if len == 0 || offset % block.page_size() != 0 {
        return Err(invalid_range);
    }
    match offset.checked_add(len) {
        Some(end) if end <= block.size() => {}
        _ => return Err(invalid_range),
    }

    let map_len = align_up(len, block.page_size()).ok_or(invalid_range)?;
    let vaddr = backend.reserve_view(map_len)?;

    let res = block.for_each_run_in(offset, map_len, |run_offset, run| {
        backend.install_run(vaddr + (run_offset - offset), run, writable)
    });

    if let Err(err) = res {
        if let Err(release_err) = backend.release_view(vaddr, map_len) {
            warn!("Could not release partially established view at {:#x}: {}", vaddr, release_err);
        }
        return Err(err);
    }

    trace!(
        "Mapped [{:#x}, {:#x}) of a {:#x} byte buffer at {:#x}",
        offset,
        offset + map_len,
        block.size(),
        vaddr
    );

    Ok(VirtualRange {
        addr: vaddr,
        len: map_len,
        offset,
        attribute: block.policy().memory_attribute(),
        writable,
    })
}

pub(crate) fn tear_down<B: PageBackendModule>(backend: &B, range: &VirtualRange) -> Result<()> {
    trace!("Unmapping view at {:#x} ({:#x} bytes)", range.addr, range.len);
    backend.release_view(range.addr, range.len)
}
