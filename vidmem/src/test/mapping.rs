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

use std::sync::atomic::{AtomicBool, Ordering};

use super::get_test_service;
use crate::{
    modules::page_backend::{test::get_test_backend, PageBackendModule, SystemPageBackend},
    AllocFlags, AllocRequest, PhysAddr, PhysRun, RegionId, Result, SyncDirection, VidmemError,
    VidmemService,
};

/// Backend whose `release_view` reports an error after doing its work
struct FailingUnmapBackend {
    inner: SystemPageBackend,
    fail_release: AtomicBool,
}

impl PageBackendModule for FailingUnmapBackend {
    fn page_size(&self) -> usize {
        self.inner.page_size()
    }

    fn region_count(&self) -> usize {
        self.inner.region_count()
    }

    fn alloc_contiguous(&self, n_bytes: usize, under_4gib: bool) -> Result<PhysAddr> {
        self.inner.alloc_contiguous(n_bytes, under_4gib)
    }

    fn alloc_scattered(&self, n_bytes: usize, under_4gib: bool) -> Result<Vec<PhysAddr>> {
        self.inner.alloc_scattered(n_bytes, under_4gib)
    }

    fn alloc_from_region(&self, region: RegionId, n_bytes: usize) -> Result<PhysAddr> {
        self.inner.alloc_from_region(region, n_bytes)
    }

    fn alloc_coherent(&self, n_bytes: usize, under_4gib: bool) -> Result<PhysAddr> {
        self.inner.alloc_coherent(n_bytes, under_4gib)
    }

    fn free_contiguous(&self, base: PhysAddr, n_bytes: usize) -> Result<()> {
        self.inner.free_contiguous(base, n_bytes)
    }

    fn free_scattered(&self, pages: &[PhysAddr]) -> Result<()> {
        self.inner.free_scattered(pages)
    }

    fn free_from_region(&self, region: RegionId, base: PhysAddr, n_bytes: usize) -> Result<()> {
        self.inner.free_from_region(region, base, n_bytes)
    }

    fn free_coherent(&self, base: PhysAddr, n_bytes: usize) -> Result<()> {
        self.inner.free_coherent(base, n_bytes)
    }

    fn reserve_view(&self, len: usize) -> Result<usize> {
        self.inner.reserve_view(len)
    }

    fn install_run(&self, vaddr: usize, run: PhysRun, writable: bool) -> Result<()> {
        self.inner.install_run(vaddr, run, writable)
    }

    fn release_view(&self, vaddr: usize, len: usize) -> Result<()> {
        self.inner.release_view(vaddr, len)?;
        if self.fail_release.load(Ordering::Relaxed) {
            return Err(VidmemError::InvalidArgument("view could not be released"));
        }
        Ok(())
    }

    fn read_phys(&self, addr: PhysAddr, dest: &mut [u8]) -> Result<()> {
        self.inner.read_phys(addr, dest)
    }

    fn write_phys(&self, addr: PhysAddr, src: &[u8]) -> Result<()> {
        self.inner.write_phys(addr, src)
    }

    fn sync_run(&self, run: PhysRun, direction: SyncDirection) -> Result<()> {
        self.inner.sync_run(run, direction)
    }

    fn free_pages(&self) -> usize {
        self.inner.free_pages()
    }

    fn region_free_bytes(&self, region: RegionId) -> Option<usize> {
        self.inner.region_free_bytes(region)
    }

    fn shutdown(&self) -> Result<()> {
        self.inner.shutdown()
    }
}

#[test]
fn test_map_rules() {
    let service = get_test_service(16, &[]);
    let page = service.page_size();
    let s = service.open_session();

    let alloc = service.allocate(s, AllocRequest::scattered(3 * page)).unwrap();

    assert!(matches!(
        service.map(s, alloc.id, 1, page),
        Err(VidmemError::InvalidRange { .. })
    ));
    assert!(matches!(
        service.map(s, alloc.id, page, 2 * page + 1),
        Err(VidmemError::InvalidRange { .. })
    ));

    let view = service.map(s, alloc.id, page, page + 1).unwrap();
    assert_eq!(view.offset, page);
    assert_eq!(view.len, 2 * page);
    assert_eq!(service.query(s, alloc.id).unwrap().mapping, Some(view));

    assert!(matches!(
        service.map(s, alloc.id, 0, page),
        Err(VidmemError::AlreadyMapped(id)) if id == alloc.id
    ));

    service.unmap(s, alloc.id).unwrap();
    // unmapping twice is fine
    service.unmap(s, alloc.id).unwrap();
    assert_eq!(service.query(s, alloc.id).unwrap().mapping, None);

    let view = service.map(s, alloc.id, 0, 3 * page).unwrap();
    assert_eq!(view.len, 3 * page);

    service.free(s, alloc.id).unwrap();
    assert!(matches!(
        service.unmap(s, alloc.id),
        Err(VidmemError::NotFound(_))
    ));
}

#[test]
fn test_mapping_offsets_follow_pages() {
    let service = get_test_service(16, &[]);
    let page = service.page_size();
    let s = service.open_session();

    let alloc = service.allocate(s, AllocRequest::scattered(4 * page)).unwrap();
    let runs = service.scatter_list(s, alloc.id).unwrap();

    // tag every page through the device view
    let mut offset = 0;
    for run in &runs {
        for in_run in (0..run.len).step_by(page) {
            let tag = ((offset + in_run) / page) as u8 + 0x10;
            service.backend().write_phys(run.addr + in_run, &[tag]).unwrap();
        }
        offset += run.len;
    }

    let view = service.map(s, alloc.id, 2 * page, 2 * page).unwrap();
    let data = unsafe { view.as_slice() };
    assert_eq!(data[0], 0x12);
    assert_eq!(data[page], 0x13);
}

#[test]
fn test_zeroing() {
    let service = VidmemService::with_backend(get_test_backend(4, &[]), true);
    let page = service.page_size();
    let s = service.open_session();

    let dirty = service.allocate(s, AllocRequest::contiguous(4 * page)).unwrap();
    let view = service.map(s, dirty.id, 0, 4 * page).unwrap();
    unsafe { view.as_mut_slice() }.unwrap().fill(0xCC);
    service.free(s, dirty.id).unwrap();

    // zero_on_alloc clears memory that was used before
    let clean = service.allocate(s, AllocRequest::scattered(4 * page)).unwrap();
    let view = service.map(s, clean.id, 0, 4 * page).unwrap();
    assert!(unsafe { view.as_slice() }.iter().all(|byte| *byte == 0));

    // the same through the allocation flag
    let service = get_test_service(4, &[]);
    let s = service.open_session();
    let dirty = service.allocate(s, AllocRequest::coherent(2 * page)).unwrap();
    service
        .backend()
        .fill_run(crate::PhysRun::new(dirty.phys_base, 2 * page), 0xCC)
        .unwrap();
    service.free(s, dirty.id).unwrap();

    let clean = service
        .allocate(s, AllocRequest::coherent(2 * page).with_flags(AllocFlags::ZEROED))
        .unwrap();
    assert_eq!(clean.phys_base, dirty.phys_base);
    let mut data = vec![0xFFu8; 2 * page];
    service.backend().read_phys(clean.phys_base, &mut data).unwrap();
    assert!(data.iter().all(|byte| *byte == 0));
}

#[test]
fn test_sync() {
    let service = get_test_service(16, &[]);
    let page = service.page_size();
    let s = service.open_session();

    let alloc = service.allocate(s, AllocRequest::scattered(3 * page + 5)).unwrap();
    assert_eq!(
        service.sync(s, alloc.id, SyncDirection::ToDevice).unwrap(),
        3 * page + 5
    );
    assert_eq!(
        service.sync(s, alloc.id, SyncDirection::FromDevice).unwrap(),
        3 * page + 5
    );
    assert_eq!(service.backend().synced_bytes(), 2 * (3 * page + 5) as u64);

    let other = service.open_session();
    assert!(matches!(
        service.sync(other, alloc.id, SyncDirection::Bidirectional),
        Err(VidmemError::NotFound(_))
    ));
}

#[test]
fn test_free_releases_backing_when_unmap_fails() {
    let backend = FailingUnmapBackend {
        inner: get_test_backend(8, &[]),
        fail_release: AtomicBool::new(false),
    };
    let service = VidmemService::with_backend(backend, false);
    let page = service.page_size();
    let s = service.open_session();

    let alloc = service.allocate(s, AllocRequest::contiguous(2 * page)).unwrap();
    service.map(s, alloc.id, 0, 2 * page).unwrap();
    assert_eq!(service.backend().free_pages(), 6);

    service.backend().fail_release.store(true, Ordering::Relaxed);
    assert!(matches!(
        service.free(s, alloc.id),
        Err(VidmemError::InvalidArgument(_))
    ));

    // the error is reported, but the buffer is gone for good
    assert!(matches!(
        service.query(s, alloc.id),
        Err(VidmemError::NotFound(_))
    ));
    assert_eq!(service.stats().live_buffers, 0);
    assert_eq!(service.backend().free_pages(), 8);

    service.backend().fail_release.store(false, Ordering::Relaxed);
    service.shutdown().unwrap();
}
