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

use log::trace;

use crate::{
    phys_addr::{PhysAddr, FOUR_GIB},
    util::bit_array::BitArray,
};

/// Tracks which page frames of the physical memory window are in use.
///
/// Frames that belong to a reserved region are marked once at start up and
/// can neither be allocated nor freed through this table.
pub(crate) struct FrameTable {
    base: PhysAddr,
    page_size: usize,
    used: BitArray,
    reserved: BitArray,
    free_frames: usize,
}

impl FrameTable {
    pub(crate) fn new(base: PhysAddr, frame_count: usize, page_size: usize) -> Self {
        FrameTable {
            base,
            page_size,
            used: BitArray::new(frame_count),
            reserved: BitArray::new(frame_count),
            free_frames: frame_count,
        }
    }

    pub(crate) fn frame_count(&self) -> usize {
        self.used.len()
    }

    pub(crate) fn free_frames(&self) -> usize {
        self.free_frames
    }

    /// Number of allocated frames, reserved frames not included
    pub(crate) fn allocated_frames(&self) -> usize {
        self.used.count_set() - self.reserved.count_set()
    }

    fn frame_addr(&self, frame: usize) -> PhysAddr {
        self.base + frame * self.page_size
    }

    /// Frame index of `addr` or `None` if it is not a frame of this table
    fn frame_index(&self, addr: PhysAddr) -> Option<usize> {
        if addr < self.base || !addr.is_aligned(self.page_size) {
            return None;
        }

        let frame = (addr - self.base) / self.page_size;
        if frame < self.frame_count() {
            Some(frame)
        } else {
            None
        }
    }

    /// Number of frames (counted from the start) that can be used for an allocation
    fn frame_limit(&self, under_4gib: bool) -> usize {
        if !under_4gib {
            return self.frame_count();
        }

        if self.base.as_u64() >= FOUR_GIB {
            0
        } else {
            let below = ((FOUR_GIB - self.base.as_u64()) / self.page_size as u64) as usize;
            below.min(self.frame_count())
        }
    }

    /// Permanently takes `[addr, addr + count * page_size)` out of the table
    pub(crate) fn reserve(&mut self, addr: PhysAddr, count: usize) -> Result<(), ()> {
        let start = self.frame_index(addr).ok_or(())?;
        if start + count > self.frame_count() || !self.used.is_range_clear(start, count) {
            return Err(());
        }

        self.used.set_range(true, start, count);
        self.reserved.set_range(true, start, count);
        self.free_frames -= count;

        Ok(())
    }

    /// Allocates `count` consecutive frames (first fit, lowest address first)
    pub(crate) fn allocate_run(&mut self, count: usize, under_4gib: bool) -> Option<PhysAddr> {
        debug_assert_ne!(count, 0);

        let limit = self.frame_limit(under_4gib);
        let mut run_start = 0;
        let mut run_len = 0;

        for frame in 0..limit {
            if self.used.is_set(frame) {
                run_len = 0;
                run_start = frame + 1;
                continue;
            }

            run_len += 1;
            if run_len == count {
                self.used.set_range(true, run_start, count);
                self.free_frames -= count;

                trace!(
                    "Allocated run of {} frame(s) at {}",
                    count,
                    self.frame_addr(run_start)
                );
                return Some(self.frame_addr(run_start));
            }
        }

        None
    }

    /// Allocates one frame, starting the search at the top of the window.
    ///
    /// Single frames are taken from the top so that low memory stays
    /// available for contiguous runs.
    pub(crate) fn allocate_single(&mut self, under_4gib: bool) -> Option<PhysAddr> {
        let limit = self.frame_limit(under_4gib);
        let frame = (0..limit).rev().find(|frame| !self.used.is_set(*frame))?;

        self.used.set(true, frame);
        self.free_frames -= 1;

        Some(self.frame_addr(frame))
    }

    /// Frees `count` frames starting at `addr`.
    ///
    /// Fails without modifying the table if any of those frames is not
    /// allocated or belongs to a reserved region.
    pub(crate) fn free_run(&mut self, addr: PhysAddr, count: usize) -> Result<(), ()> {
        let start = self.frame_index(addr).ok_or(())?;
        if count == 0
            || start + count > self.frame_count()
            || !self.used.is_range_set(start, count)
            || !self.reserved.is_range_clear(start, count)
        {
            return Err(());
        }

        self.used.set_range(false, start, count);
        self.free_frames += count;

        trace!("Freed run of {} frame(s) at {}", count, addr);

        Ok(())
    }
}
