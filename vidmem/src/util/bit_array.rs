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

/// Fixed size bit array, one bit per page frame
pub(crate) struct BitArray {
    arr: Vec<u64>,
    len: usize,
}

const BITS: usize = u64::BITS as usize;

impl BitArray {
    /// Creates a new bit array with `len` bits that are all unset
    pub(crate) fn new(len: usize) -> Self {
        BitArray {
            arr: vec![0; (len + BITS - 1) / BITS],
            len,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn set(&mut self, value: bool, index: usize) {
        debug_assert!(index < self.len, "index {} out of bounds ({})", index, self.len);

        let arr_index = index / BITS;
        let internal_index = index % BITS;

        let item = &mut self.arr[arr_index];
        if value {
            // set bit
            *item |= 1u64 << internal_index;
        } else {
            // unset bit
            *item &= !(1u64 << internal_index);
        }
    }

    pub(crate) fn set_range(&mut self, value: bool, start: usize, count: usize) {
        for index in start..start + count {
            self.set(value, index);
        }
    }

    pub(crate) fn is_set(&self, index: usize) -> bool {
        debug_assert!(index < self.len, "index {} out of bounds ({})", index, self.len);

        let arr_index = index / BITS;
        let internal_index = index % BITS;

        let item = self.arr[arr_index];
        (item & (1u64 << internal_index)) != 0
    }

    /// Returns `true` if all bits in `[start, start + count)` are unset
    pub(crate) fn is_range_clear(&self, start: usize, count: usize) -> bool {
        (start..start + count).all(|index| !self.is_set(index))
    }

    /// Returns `true` if all bits in `[start, start + count)` are set
    pub(crate) fn is_range_set(&self, start: usize, count: usize) -> bool {
        (start..start + count).all(|index| self.is_set(index))
    }

    pub(crate) fn count_set(&self) -> usize {
        self.arr.iter().map(|item| item.count_ones() as usize).sum()
    }
}
