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

use std::{
    fs::File,
    io,
    os::unix::{
        fs::FileExt,
        io::{AsRawFd, FromRawFd},
    },
    ptr::null_mut,
    sync::atomic::{AtomicU64, Ordering},
};

use libc::{
    c_void, memfd_create, mmap, munmap, off_t, MAP_ANONYMOUS, MAP_FAILED, MAP_FIXED,
    MAP_NORESERVE, MAP_PRIVATE, MAP_SHARED, MFD_CLOEXEC, PROT_NONE, PROT_READ, PROT_WRITE,
};
use log::{debug, info, trace};
use parking_lot::Mutex;

use super::{frame_table::FrameTable, PageBackendModule, SyncDirection};
use crate::{
    allocation_identifier::RegionId,
    error::{Result, VidmemError},
    modules::region_pool::RegionPool,
    phys_addr::{PhysAddr, PhysRun},
    util::{ceil_div, get_page_size},
    vidmem_config::VidmemConfig,
};

/// Page backend that simulates a physical memory window in the current process.
///
/// The window `[memory_base, memory_base + memory_size)` is backed by an
/// anonymous memory file, physical address `addr` lives at file offset
/// `addr - memory_base`. Views map the pages of that file with `MAP_SHARED`,
/// so all views of the same physical page observe the same bytes, no matter
/// in which order the pages were installed.
pub struct SystemPageBackend {
    memory: File,
    base: PhysAddr,
    size: usize,
    page_size: usize,
    frames: Mutex<FrameTable>,
    regions: Vec<RegionPool>,
    synced_bytes: AtomicU64,
}

fn create_memory_file(size: usize) -> io::Result<File> {
    let name = b"vidmem\0";
    let fd = unsafe { memfd_create(name.as_ptr() as *const libc::c_char, MFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    // we are the only owner of this freshly created descriptor
    let file = unsafe { File::from_raw_fd(fd) };
    file.set_len(size as u64)?;

    Ok(file)
}

impl SystemPageBackend {
    pub fn new(config: &VidmemConfig) -> Result<Self> {
        let page_size = get_page_size();
        config.validate(page_size)?;

        let memory = create_memory_file(config.memory_size)?;
        let mut frames = FrameTable::new(
            config.memory_base,
            config.memory_size / page_size,
            page_size,
        );

        let mut regions = Vec::with_capacity(config.reserved_regions.len());
        for (id, region) in config.reserved_regions.iter().enumerate() {
            frames
                .reserve(region.base, region.size / page_size)
                .map_err(|_| {
                    VidmemError::InvalidRegion(format!(
                        "region {} cannot be reserved in the memory window",
                        id
                    ))
                })?;
            regions.push(RegionPool::create(id, region.base, region.size, page_size)?);
        }

        info!(
            "Physical memory window [{}, {}): {} frames of {} bytes, {} reserved region(s)",
            config.memory_base,
            config.memory_base + config.memory_size,
            frames.frame_count(),
            page_size,
            regions.len()
        );

        Ok(SystemPageBackend {
            memory,
            base: config.memory_base,
            size: config.memory_size,
            page_size,
            frames: Mutex::new(frames),
            regions,
            synced_bytes: AtomicU64::new(0),
        })
    }

    /// Total number of bytes that went through cache maintenance
    pub fn synced_bytes(&self) -> u64 {
        self.synced_bytes.load(Ordering::Relaxed)
    }

    pub fn memory_base(&self) -> PhysAddr {
        self.base
    }

    pub fn memory_size(&self) -> usize {
        self.size
    }

    fn region(&self, region: RegionId) -> Result<&RegionPool> {
        self.regions.get(region).ok_or_else(|| {
            VidmemError::InvalidRegion(format!(
                "region {} does not exist ({} configured)",
                region,
                self.regions.len()
            ))
        })
    }

    /// File offset of `run`, if it is completely inside of the window
    fn file_offset(&self, run: PhysRun) -> Result<u64> {
        let end = self.base + self.size;
        if run.addr < self.base || run.addr.checked_add(run.len).map_or(true, |e| e > end) {
            return Err(VidmemError::InvalidArgument(
                "physical range outside of the memory window",
            ));
        }

        Ok((run.addr - self.base) as u64)
    }

    fn free_frames(&self, base: PhysAddr, n_bytes: usize) -> Result<()> {
        let count = ceil_div(n_bytes, self.page_size).ok_or(VidmemError::InvalidFree {
            addr: base,
            size: n_bytes,
        })?;
        self.frames
            .lock()
            .free_run(base, count)
            .map_err(|_| VidmemError::InvalidFree {
                addr: base,
                size: n_bytes,
            })
    }
}

impl PageBackendModule for SystemPageBackend {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn region_count(&self) -> usize {
        self.regions.len()
    }

    fn alloc_contiguous(&self, n_bytes: usize, under_4gib: bool) -> Result<PhysAddr> {
        let count = ceil_div(n_bytes, self.page_size)
            .ok_or(VidmemError::OutOfMemory { requested: n_bytes })?;
        self.frames
            .lock()
            .allocate_run(count, under_4gib)
            .ok_or(VidmemError::OutOfMemory { requested: n_bytes })
    }

    fn alloc_scattered(&self, n_bytes: usize, under_4gib: bool) -> Result<Vec<PhysAddr>> {
        let count = ceil_div(n_bytes, self.page_size)
            .ok_or(VidmemError::OutOfMemory { requested: n_bytes })?;
        let mut frames = self.frames.lock();

        if frames.free_frames() < count {
            return Err(VidmemError::OutOfMemory { requested: n_bytes });
        }

        let mut pages = Vec::with_capacity(count);
        for _ in 0..count {
            match frames.allocate_single(under_4gib) {
                Some(page) => pages.push(page),
                None => {
                    // not enough pages in the allowed range, roll back
                    debug!(
                        "Scattered allocation failed after {} of {} pages, rolling back",
                        pages.len(),
                        count
                    );
                    for page in pages {
                        let res = frames.free_run(page, 1);
                        debug_assert!(res.is_ok(), "rollback of {} failed", page);
                    }

                    return Err(VidmemError::OutOfMemory { requested: n_bytes });
                }
            }
        }

        Ok(pages)
    }

    fn alloc_from_region(&self, region: RegionId, n_bytes: usize) -> Result<PhysAddr> {
        self.region(region)?.alloc(n_bytes)
    }

    fn alloc_coherent(&self, n_bytes: usize, under_4gib: bool) -> Result<PhysAddr> {
        // all memory of this window is coherent, so this is a contiguous run
        // that is only ever mapped uncached
        self.alloc_contiguous(n_bytes, under_4gib)
    }

    fn free_contiguous(&self, base: PhysAddr, n_bytes: usize) -> Result<()> {
        self.free_frames(base, n_bytes)
    }

    fn free_scattered(&self, pages: &[PhysAddr]) -> Result<()> {
        let mut frames = self.frames.lock();
        let mut result = Ok(());

        for page in pages {
            if frames.free_run(*page, 1).is_err() && result.is_ok() {
                result = Err(VidmemError::InvalidFree {
                    addr: *page,
                    size: self.page_size,
                });
            }
        }

        result
    }

    fn free_from_region(&self, region: RegionId, base: PhysAddr, n_bytes: usize) -> Result<()> {
        self.region(region)?.free(base, n_bytes)
    }

    fn free_coherent(&self, base: PhysAddr, n_bytes: usize) -> Result<()> {
        self.free_frames(base, n_bytes)
    }

    fn reserve_view(&self, len: usize) -> Result<usize> {
        let ptr = unsafe {
            mmap(
                null_mut(),
                len,
                PROT_NONE,
                MAP_PRIVATE | MAP_ANONYMOUS | MAP_NORESERVE,
                -1,
                0,
            )
        };

        if ptr == MAP_FAILED {
            return Err(io::Error::last_os_error().into());
        }

        Ok(ptr as usize)
    }

    fn install_run(&self, vaddr: usize, run: PhysRun, writable: bool) -> Result<()> {
        let offset = self.file_offset(run)?;
        let prot = if writable {
            PROT_READ | PROT_WRITE
        } else {
            PROT_READ
        };

        let ptr = unsafe {
            mmap(
                vaddr as *mut c_void,
                run.len,
                prot,
                MAP_SHARED | MAP_FIXED,
                self.memory.as_raw_fd(),
                offset as off_t,
            )
        };

        if ptr == MAP_FAILED {
            return Err(io::Error::last_os_error().into());
        }

        trace!("Installed [{}, {}) at {:#x}", run.addr, run.end(), vaddr);

        Ok(())
    }

    fn release_view(&self, vaddr: usize, len: usize) -> Result<()> {
        let code = unsafe { munmap(vaddr as *mut c_void, len) };
        if code != 0 {
            return Err(io::Error::last_os_error().into());
        }

        Ok(())
    }

    fn read_phys(&self, addr: PhysAddr, dest: &mut [u8]) -> Result<()> {
        let offset = self.file_offset(PhysRun::new(addr, dest.len()))?;
        self.memory.read_exact_at(dest, offset)?;

        Ok(())
    }

    fn write_phys(&self, addr: PhysAddr, src: &[u8]) -> Result<()> {
        let offset = self.file_offset(PhysRun::new(addr, src.len()))?;
        self.memory.write_all_at(src, offset)?;

        Ok(())
    }

    fn sync_run(&self, run: PhysRun, direction: SyncDirection) -> Result<()> {
        self.file_offset(run)?;

        // the window is coherent with every view, so there is nothing to
        // write back; only account for the work a real cache would do
        self.synced_bytes
            .fetch_add(run.len as u64, Ordering::Relaxed);
        trace!("Sync {:?} [{}, {})", direction, run.addr, run.end());

        Ok(())
    }

    fn free_pages(&self) -> usize {
        self.frames.lock().free_frames()
    }

    fn region_free_bytes(&self, region: RegionId) -> Option<usize> {
        self.regions.get(region).map(|pool| pool.free_bytes())
    }

    fn shutdown(&self) -> Result<()> {
        if let Some(pool) = self.regions.iter().find(|pool| pool.outstanding() > 0) {
            return Err(VidmemError::ResourceBusy {
                region: pool.id(),
                outstanding: pool.outstanding(),
            });
        }
        for pool in &self.regions {
            pool.destroy()?;
        }

        let outstanding = self.frames.lock().allocated_frames();
        if outstanding != 0 {
            debug!("Shutdown with {} frame(s) still allocated", outstanding);
        }

        info!("Page backend shut down");

        Ok(())
    }
}
