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

pub(crate) mod bit_array;

/// Page size of the host, which is also the granularity of the simulated physical memory
pub(crate) fn get_page_size() -> usize {
    use libc::{sysconf, _SC_PAGE_SIZE};

    let size = unsafe { sysconf(_SC_PAGE_SIZE) };
    if size <= 0 {
        // sysconf cannot fail for _SC_PAGE_SIZE on linux, but stay usable anyway
        4096
    } else {
        size as usize
    }
}

pub(crate) fn padding_needed_for(offset: usize, alignment: usize) -> usize {
    let misalignment = offset % alignment;
    if misalignment > 0 {
        // round up to next multiple of `alignment`
        alignment - misalignment
    } else {
        // already a multiple of `alignment`
        0
    }
}

/// Rounds `value` up to the next multiple of `alignment`, `None` on overflow
pub(crate) fn align_up(value: usize, alignment: usize) -> Option<usize> {
    value.checked_add(padding_needed_for(value, alignment))
}

/// efficient way to calculate: ceil(x / y), `None` on overflow
pub(crate) fn ceil_div(x: usize, y: usize) -> Option<usize> {
    x.checked_add(y - 1).map(|sum| sum / y)
}
