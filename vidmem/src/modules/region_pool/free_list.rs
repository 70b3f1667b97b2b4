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

use crate::phys_addr::{PhysAddr, PhysRun};

/// Address ordered list of free ranges.
///
/// Neighbouring ranges are always merged, so no two items of this list touch each other.
pub(crate) struct FreeList {
    ranges: Vec<PhysRun>,
}

impl FreeList {
    pub(crate) fn new() -> Self {
        Self { ranges: Vec::new() }
    }

    /// Return `true` if the list is empty
    pub(crate) fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.ranges.len()
    }

    pub(crate) fn free_bytes(&self) -> usize {
        self.ranges.iter().map(|run| run.len).sum()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &PhysRun> {
        self.ranges.iter()
    }

    /// Takes `size` bytes from the first (lowest) range that is big enough
    pub(crate) fn allocate_first_fit(&mut self, size: usize) -> Option<PhysAddr> {
        debug_assert_ne!(size, 0);

        let index = self.ranges.iter().position(|run| run.len >= size)?;
        let run = &mut self.ranges[index];
        let addr = run.addr;

        if run.len == size {
            self.ranges.remove(index);
            trace!("Allocate: used up free range at {}", addr);
        } else {
            run.addr = run.addr + size;
            run.len -= size;
            trace!("Allocate: split free range at {}, {:#x} bytes remaining", addr, run.len);
        }

        Some(addr)
    }

    /// Puts `run` back into the list and merges it with its neighbours.
    ///
    /// Fails without modifying the list if `run` overlaps any free range.
    pub(crate) fn insert(&mut self, run: PhysRun) -> Result<(), ()> {
        debug_assert_ne!(run.len, 0);

        // index of the first range that starts after `run`
        let index = self.ranges.partition_point(|curr| curr.addr < run.addr);

        let prev = index.checked_sub(1).map(|i| self.ranges[i]);
        let next = self.ranges.get(index).copied();

        if prev.map_or(false, |prev| prev.overlaps(&run))
            || next.map_or(false, |next| next.overlaps(&run))
        {
            return Err(());
        }

        let merge_prev = prev.map_or(false, |prev| prev.end() == run.addr);
        let merge_next = next.map_or(false, |next| run.end() == next.addr);

        match (merge_prev, merge_next) {
            (true, true) => {
                trace!("Free: merge {} with both neighbours", run.addr);
                let next_len = self.ranges.remove(index).len;
                self.ranges[index - 1].len += run.len + next_len;
            }
            (true, false) => {
                trace!("Free: merge {} with lower neighbour", run.addr);
                self.ranges[index - 1].len += run.len;
            }
            (false, true) => {
                trace!("Free: merge {} with upper neighbour", run.addr);
                let next = &mut self.ranges[index];
                next.addr = run.addr;
                next.len += run.len;
            }
            (false, false) => {
                self.ranges.insert(index, run);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::FreeList;
    use crate::phys_addr::{PhysAddr, PhysRun};

    fn run(addr: u64, len: usize) -> PhysRun {
        PhysRun::new(PhysAddr(addr), len)
    }

    fn check_integrity(list: &FreeList) {
        for (a, b) in list.iter().zip(list.iter().skip(1)) {
            assert!(a.end() < b.addr, "ranges are not sorted or not merged: {:?} {:?}", a, b);
        }
    }

    #[test]
    fn test_free_list_merge() {
        let mut list = FreeList::new();
        assert!(list.is_empty());

        list.insert(run(0x3000, 0x1000)).unwrap();
        list.insert(run(0x1000, 0x1000)).unwrap();
        list.insert(run(0x6000, 0x1000)).unwrap();
        check_integrity(&list);
        assert_eq!(list.len(), 3);

        // fills the hole between 0x1000 and 0x3000
        list.insert(run(0x2000, 0x1000)).unwrap();
        check_integrity(&list);
        assert_eq!(list.len(), 2);

        // upper neighbour only
        list.insert(run(0x5000, 0x1000)).unwrap();
        check_integrity(&list);
        assert_eq!(list.len(), 2);

        // lower neighbour only
        list.insert(run(0x7000, 0x1000)).unwrap();
        check_integrity(&list);

        let ranges: Vec<PhysRun> = list.iter().copied().collect();
        assert_eq!(ranges, vec![run(0x1000, 0x3000), run(0x5000, 0x3000)]);
        assert_eq!(list.free_bytes(), 0x6000);
    }

    #[test]
    fn test_free_list_rejects_overlap() {
        let mut list = FreeList::new();
        list.insert(run(0x1000, 0x2000)).unwrap();
        list.insert(run(0x8000, 0x1000)).unwrap();

        for invalid in [
            run(0x1000, 0x1000),
            run(0x2000, 0x2000),
            run(0x0, 0x2000),
            run(0x7000, 0x4000),
        ] {
            list.insert(invalid).expect_err("overlapping insert should fail");
            check_integrity(&list);
        }

        assert_eq!(list.free_bytes(), 0x3000);
    }

    #[test]
    fn test_free_list_first_fit() {
        let mut list = FreeList::new();
        list.insert(run(0x1000, 0x1000)).unwrap();
        list.insert(run(0x4000, 0x4000)).unwrap();

        // too big for the first range
        assert_eq!(list.allocate_first_fit(0x2000), Some(PhysAddr(0x4000)));
        // lowest address wins
        assert_eq!(list.allocate_first_fit(0x1000), Some(PhysAddr(0x1000)));
        assert_eq!(list.allocate_first_fit(0x2000), Some(PhysAddr(0x6000)));
        assert_eq!(list.allocate_first_fit(0x1000), None);
        assert!(list.is_empty());
    }
}
