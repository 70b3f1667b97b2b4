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
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use log::{debug, info, warn};
use parking_lot::RwLock;

use crate::{
    allocation_identifier::{BufferId, ExportToken, RegionId, SessionId},
    allocation_options::{AllocFlags, AllocRequest, ExportFlags, MemoryAttribute, Policy},
    error::{Result, VidmemError},
    mapping::{self, VirtualRange},
    memory_block::MemoryBlock,
    modules::page_backend::{PageBackendModule, SyncDirection, SystemPageBackend},
    owner_registry::{OwnerRegistry, RegistryEntry},
    phys_addr::{PhysAddr, PhysRun},
    session::Session,
    shareable_handle::{ExportTable, SharedBuffer},
    vidmem_config::VidmemConfig,
};

/// Result of a successful allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub id: BufferId,
    /// Physical address of the first byte (of the first page for scattered buffers)
    pub phys_base: PhysAddr,
    pub size: usize,
}

/// Result of a successful import
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Imported {
    pub id: BufferId,
    pub size: usize,
    pub flags: ExportFlags,
}

/// Snapshot of one buffer as seen by one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferInfo {
    pub id: BufferId,
    pub size: usize,
    pub policy: Policy,
    pub attribute: MemoryAttribute,
    pub phys_base: PhysAddr,
    pub page_count: usize,
    pub mapping: Option<VirtualRange>,
    pub imported: bool,
    pub export: Option<ExportToken>,
    /// References on the buffer from all sessions
    pub refs: u32,
    /// References of those held by this session's entry
    pub held: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStats {
    pub sessions: usize,
    /// Buffers whose backing has not been released yet
    pub live_buffers: usize,
    pub live_exports: usize,
    pub free_pages: usize,
    /// Free bytes per reserved region, indexed by region id
    pub region_free_bytes: Vec<usize>,
}

/// The video memory allocator.
///
/// Owns the page backend, all sessions and the export table.
/// Every method can be called concurrently from any number of threads.
pub struct VidmemService<B: PageBackendModule = SystemPageBackend> {
    backend: B,
    zero_on_alloc: bool,
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    next_session: AtomicU64,
    exports: ExportTable,
    live_buffers: AtomicUsize,
}

impl VidmemService<SystemPageBackend> {
    /// Creates a service over a simulated physical memory window described by `config`
    pub fn new(config: VidmemConfig) -> Result<Self> {
        let backend = SystemPageBackend::new(&config)?;
        Ok(Self::with_backend(backend, config.zero_on_alloc))
    }
}

impl<B: PageBackendModule> VidmemService<B> {
    pub fn with_backend(backend: B, zero_on_alloc: bool) -> Self {
        info!(
            "Video memory service started: page size {}, {} free pages, {} region(s)",
            backend.page_size(),
            backend.free_pages(),
            backend.region_count()
        );

        VidmemService {
            backend,
            zero_on_alloc,
            sessions: RwLock::new(HashMap::new()),
            next_session: AtomicU64::new(1),
            exports: ExportTable::new(),
            live_buffers: AtomicUsize::new(0),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn page_size(&self) -> usize {
        self.backend.page_size()
    }

    fn session(&self, id: SessionId) -> Result<Arc<Session>> {
        self.sessions
            .read()
            .get(&id)
            .cloned()
            .ok_or(VidmemError::NoSuchSession(id))
    }

    pub fn open_session(&self) -> SessionId {
        let id = SessionId(self.next_session.fetch_add(1, Ordering::Relaxed));
        self.sessions.write().insert(id, Arc::new(Session::new(id)));

        info!("Opened session {}", id);
        id
    }

    /// Closes session `id` and releases every buffer it still holds.
    ///
    /// Returns the number of registry entries that were reclaimed.
    pub fn close_session(&self, id: SessionId) -> Result<usize> {
        let session = self
            .sessions
            .write()
            .remove(&id)
            .ok_or(VidmemError::NoSuchSession(id))?;

        // waits for in flight operations of this session
        let registry = session.close().ok_or(VidmemError::NoSuchSession(id))?;
        let reclaimed = self.reclaim(session.id(), registry);

        if reclaimed > 0 {
            warn!("Session {} closed with {} buffer(s) still held", id, reclaimed);
        }
        info!("Closed session {}, reclaimed {} entries", id, reclaimed);

        Ok(reclaimed)
    }

    fn reclaim(&self, session: SessionId, mut registry: OwnerRegistry) -> usize {
        let entries = registry.drain();
        let count = entries.len();

        for (id, entry) in entries {
            if let Err(err) = self.drop_entry(entry, None) {
                warn!("Session {}: could not release buffer {}: {}", session, id, err);
            }
        }

        count
    }

    /// Unmaps `entry` and drops the references it holds (all of them for `None`)
    fn drop_entry(&self, entry: RegistryEntry, count: Option<u32>) -> Result<()> {
        let mut result = Ok(());

        if let Some(range) = &entry.mapping {
            result = mapping::tear_down(&self.backend, range);
        }

        for _ in 0..count.unwrap_or(entry.held) {
            if entry.buffer.put() {
                let res = self.retire(&entry.buffer);
                if result.is_ok() {
                    result = res;
                }
            }
        }

        result
    }

    /// Frees a buffer whose reference count just dropped to zero
    fn retire(&self, buffer: &SharedBuffer) -> Result<()> {
        buffer.withdraw(&self.exports);
        self.live_buffers.fetch_sub(1, Ordering::Relaxed);

        let block = buffer.block();
        debug!(
            "Freeing {:?} buffer at {} ({:#x} bytes)",
            block.policy(),
            block.phys_base(),
            block.size()
        );

        block.release_backing(&self.backend)
    }

    /// Allocates a new buffer for `session`
    pub fn allocate(&self, session: SessionId, request: AllocRequest) -> Result<Allocation> {
        let policy = request.resolve()?;
        let session = self.session(session)?;

        let block = MemoryBlock::allocate(&self.backend, policy, request.size)?;

        if self.zero_on_alloc || request.flags.contains(AllocFlags::ZEROED) {
            if let Err(err) = block.zero(&self.backend) {
                block.release_backing(&self.backend)?;
                return Err(err);
            }
        }

        let phys_base = block.phys_base();
        let size = block.size();

        let mut registry = match session.registry() {
            Ok(registry) => registry,
            Err(err) => {
                block.release_backing(&self.backend)?;
                return Err(err);
            }
        };

        self.live_buffers.fetch_add(1, Ordering::Relaxed);
        let id = registry.insert(RegistryEntry::owned(Arc::new(SharedBuffer::new(block))));

        debug!(
            "Session {}: allocated {:?} buffer {} at {} ({:#x} bytes)",
            session.id(),
            policy,
            id,
            phys_base,
            size
        );

        Ok(Allocation {
            id,
            phys_base,
            size,
        })
    }

    /// Frees a buffer this session allocated.
    ///
    /// Exported buffers can be freed as long as no other session imported them,
    /// which also invalidates their token.
    pub fn free(&self, session: SessionId, id: BufferId) -> Result<()> {
        let session = self.session(session)?;
        let mut registry = session.registry()?;

        let entry = registry.get(id).ok_or(VidmemError::NotFound(id))?;
        if entry.imported {
            return Err(VidmemError::InvalidArgument(
                "imported buffers have to be released",
            ));
        }

        if !entry.buffer.try_put_all(entry.held) {
            let refs = entry.buffer.refs().saturating_sub(entry.held);
            debug!("Session {}: buffer {} still has {} import(s)", session.id(), id, refs);
            return Err(VidmemError::StillShared { id, refs });
        }

        let entry = registry.remove(id).ok_or(VidmemError::NotFound(id))?;
        drop(registry);

        // the buffer is gone from the registry and has no references left,
        // so its backing is released even if the view cannot be removed
        let mut result = Ok(());
        if let Some(range) = &entry.mapping {
            result = mapping::tear_down(&self.backend, range);
        }

        debug!("Session {}: freed buffer {}", session.id(), id);
        let retired = self.retire(&entry.buffer);
        result.and(retired)
    }

    /// Maps `[offset, offset + len)` of buffer `id` into the address space of the caller
    pub fn map(
        &self,
        session: SessionId,
        id: BufferId,
        offset: usize,
        len: usize,
    ) -> Result<VirtualRange> {
        let session = self.session(session)?;
        let mut registry = session.registry()?;
        let entry = registry.get_mut(id).ok_or(VidmemError::NotFound(id))?;

        if entry.mapping.is_some() {
            return Err(VidmemError::AlreadyMapped(id));
        }

        let range = mapping::establish(
            &self.backend,
            entry.buffer.block(),
            offset,
            len,
            entry.writable,
        )?;
        entry.mapping = Some(range);

        debug!(
            "Session {}: mapped buffer {} at {:#x} ({:?})",
            session.id(),
            id,
            range.addr,
            range.attribute
        );

        Ok(range)
    }

    /// Removes the mapping of buffer `id`, does nothing if it is not mapped
    pub fn unmap(&self, session: SessionId, id: BufferId) -> Result<()> {
        let session = self.session(session)?;
        let mut registry = session.registry()?;
        let entry = registry.get_mut(id).ok_or(VidmemError::NotFound(id))?;

        if let Some(range) = entry.mapping.take() {
            mapping::tear_down(&self.backend, &range)?;
            debug!("Session {}: unmapped buffer {}", session.id(), id);
        }

        Ok(())
    }

    /// Exports buffer `id`, so that other sessions can import it.
    ///
    /// Exporting the same buffer again returns the same token, but takes an
    /// additional reference that has to be released as well.
    pub fn export(
        &self,
        session: SessionId,
        id: BufferId,
        flags: ExportFlags,
    ) -> Result<ExportToken> {
        if flags.is_empty() {
            return Err(VidmemError::InvalidArgument("export flags must not be empty"));
        }

        let session = self.session(session)?;
        let mut registry = session.registry()?;
        let entry = registry.get_mut(id).ok_or(VidmemError::NotFound(id))?;

        let (state, created) = self.exports.export(&entry.buffer, flags);
        if !created {
            entry.buffer.get();
            entry.held += 1;
        }

        debug!(
            "Session {}: exported buffer {} as {} (refs: {})",
            session.id(),
            id,
            state.token,
            entry.buffer.refs()
        );

        Ok(state.token)
    }

    /// Imports the buffer behind `token` into `session`.
    ///
    /// Importing the same buffer twice yields the same local identity,
    /// holding one more reference.
    pub fn import(&self, session: SessionId, token: ExportToken) -> Result<Imported> {
        let session = self.session(session)?;
        let (buffer, flags) = self.exports.acquire(token)?;

        let mut registry = match session.registry() {
            Ok(registry) => registry,
            Err(err) => {
                if buffer.put() {
                    self.retire(&buffer)?;
                }
                return Err(err);
            }
        };

        let size = buffer.block().size();
        let id = match registry.find_import(&buffer) {
            Some(id) => {
                if let Some(entry) = registry.get_mut(id) {
                    entry.held += 1;
                }
                id
            }
            None => {
                let writable = flags.contains(ExportFlags::WRITE);
                registry.insert(RegistryEntry::imported(buffer.clone(), writable))
            }
        };

        debug!(
            "Session {}: imported {} as buffer {} (refs: {})",
            session.id(),
            token,
            id,
            buffer.refs()
        );

        Ok(Imported { id, size, flags })
    }

    /// Drops one reference held by entry `id`.
    ///
    /// The entry goes away together with its mapping once it holds no more
    /// references, the buffer once nobody holds a reference.
    pub fn release(&self, session: SessionId, id: BufferId) -> Result<()> {
        let session = self.session(session)?;
        let mut registry = session.registry()?;
        let entry = registry.get_mut(id).ok_or(VidmemError::NotFound(id))?;

        entry.held -= 1;
        if entry.held > 0 {
            let buffer = entry.buffer.clone();
            drop(registry);

            debug!("Session {}: released one reference of buffer {}", session.id(), id);
            if buffer.put() {
                return self.retire(&buffer);
            }
            return Ok(());
        }

        let entry = registry.remove(id).ok_or(VidmemError::NotFound(id))?;
        drop(registry);

        debug!("Session {}: released buffer {}", session.id(), id);
        self.drop_entry(entry, Some(1))
    }

    /// Cache maintenance over the whole buffer, returns the number of bytes processed
    pub fn sync(
        &self,
        session: SessionId,
        id: BufferId,
        direction: SyncDirection,
    ) -> Result<usize> {
        let session = self.session(session)?;
        let registry = session.registry()?;
        let entry = registry.get(id).ok_or(VidmemError::NotFound(id))?;
        let block = entry.buffer.block();

        let mut processed = 0;
        block.for_each_run_in(0, block.size(), |_, run| {
            self.backend.sync_run(run, direction)?;
            processed += run.len;
            Ok(())
        })?;

        Ok(processed)
    }

    /// Physical runs of buffer `id` in buffer order, as a device would be programmed with
    pub fn scatter_list(&self, session: SessionId, id: BufferId) -> Result<Vec<PhysRun>> {
        let session = self.session(session)?;
        let registry = session.registry()?;
        let entry = registry.get(id).ok_or(VidmemError::NotFound(id))?;
        let block = entry.buffer.block();

        let mut runs = Vec::new();
        block.for_each_run_in(0, block.size(), |_, run| {
            runs.push(run);
            Ok(())
        })?;

        Ok(runs)
    }

    pub fn query(&self, session: SessionId, id: BufferId) -> Result<BufferInfo> {
        let session = self.session(session)?;
        let registry = session.registry()?;
        let entry = registry.get(id).ok_or(VidmemError::NotFound(id))?;
        let block = entry.buffer.block();

        Ok(BufferInfo {
            id,
            size: block.size(),
            policy: block.policy(),
            attribute: block.policy().memory_attribute(),
            phys_base: block.phys_base(),
            page_count: block.page_count(),
            mapping: entry.mapping,
            imported: entry.imported,
            export: entry.buffer.export_state().map(|state| state.token),
            refs: entry.buffer.refs(),
            held: entry.held,
        })
    }

    /// The buffer of `session` that contains physical address `addr`
    pub fn find_by_phys(&self, session: SessionId, addr: PhysAddr) -> Result<Option<BufferId>> {
        let session = self.session(session)?;
        let registry = session.registry()?;

        Ok(registry.find_by_phys(addr))
    }

    pub fn stats(&self) -> ServiceStats {
        let region_free_bytes = (0..self.backend.region_count())
            .map(|region: RegionId| self.backend.region_free_bytes(region).unwrap_or(0))
            .collect();

        ServiceStats {
            sessions: self.sessions.read().len(),
            live_buffers: self.live_buffers.load(Ordering::Relaxed),
            live_exports: self.exports.len(),
            free_pages: self.backend.free_pages(),
            region_free_bytes,
        }
    }

    fn close_all_sessions(&self) -> usize {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .write()
            .drain()
            .map(|(_, session)| session)
            .collect();

        sessions
            .into_iter()
            .filter_map(|session| {
                let registry = session.close()?;
                Some(self.reclaim(session.id(), registry))
            })
            .sum()
    }

    /// Closes every session and shuts the backend down.
    ///
    /// Fails with [`VidmemError::ResourceBusy`] if a region still has allocations.
    pub fn shutdown(&self) -> Result<()> {
        let reclaimed = self.close_all_sessions();
        if reclaimed > 0 {
            warn!("Shutdown reclaimed {} buffer(s) of open sessions", reclaimed);
        }

        self.backend.shutdown()
    }
}

impl<B: PageBackendModule> Drop for VidmemService<B> {
    fn drop(&mut self) {
        let reclaimed = self.close_all_sessions();
        if reclaimed > 0 {
            warn!("Dropped service with {} buffer(s) still held", reclaimed);
        }
    }
}
