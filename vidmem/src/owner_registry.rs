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

use std::{collections::BTreeMap, sync::Arc};

use crate::{
    allocation_identifier::BufferId, mapping::VirtualRange, phys_addr::PhysAddr,
    shareable_handle::SharedBuffer,
};

/// One buffer as seen by one session
pub(crate) struct RegistryEntry {
    pub(crate) buffer: Arc<SharedBuffer>,

    /// `true` if this entry was created by an import
    pub(crate) imported: bool,

    /// Number of references on `buffer` this entry accounts for
    pub(crate) held: u32,

    /// Whether this session may map the buffer writable
    pub(crate) writable: bool,

    pub(crate) mapping: Option<VirtualRange>,
}

impl RegistryEntry {
    pub(crate) fn owned(buffer: Arc<SharedBuffer>) -> Self {
        RegistryEntry {
            buffer,
            imported: false,
            held: 1,
            writable: true,
            mapping: None,
        }
    }

    pub(crate) fn imported(buffer: Arc<SharedBuffer>, writable: bool) -> Self {
        RegistryEntry {
            buffer,
            imported: true,
            held: 1,
            writable,
            mapping: None,
        }
    }
}

/// Ledger of every buffer a session holds, ordered by local identity
pub(crate) struct OwnerRegistry {
    entries: BTreeMap<BufferId, RegistryEntry>,
    next_id: u64,
}

impl OwnerRegistry {
    pub(crate) fn new() -> Self {
        OwnerRegistry {
            entries: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub(crate) fn insert(&mut self, entry: RegistryEntry) -> BufferId {
        let id = BufferId(self.next_id);
        self.next_id += 1;

        self.entries.insert(id, entry);
        id
    }

    pub(crate) fn get(&self, id: BufferId) -> Option<&RegistryEntry> {
        self.entries.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: BufferId) -> Option<&mut RegistryEntry> {
        self.entries.get_mut(&id)
    }

    pub(crate) fn remove(&mut self, id: BufferId) -> Option<RegistryEntry> {
        self.entries.remove(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// The imported alias of `buffer`, if this session has one
    pub(crate) fn find_import(&self, buffer: &Arc<SharedBuffer>) -> Option<BufferId> {
        self.entries
            .iter()
            .find(|(_, entry)| entry.imported && Arc::ptr_eq(&entry.buffer, buffer))
            .map(|(id, _)| *id)
    }

    /// The buffer whose backing contains `addr`, owned entries first
    pub(crate) fn find_by_phys(&self, addr: PhysAddr) -> Option<BufferId> {
        let mut matches = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.buffer.block().contains_phys(addr));

        let first = matches.next()?;
        if !first.1.imported {
            return Some(*first.0);
        }

        matches
            .find(|(_, entry)| !entry.imported)
            .or(Some(first))
            .map(|(id, _)| *id)
    }

    /// Removes and returns all entries in identity order
    pub(crate) fn drain(&mut self) -> Vec<(BufferId, RegistryEntry)> {
        std::mem::take(&mut self.entries).into_iter().collect()
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::{OwnerRegistry, RegistryEntry};
    use crate::{
        allocation_options::ResolvedPolicy,
        memory_block::MemoryBlock,
        modules::page_backend::{test::get_test_backend, PageBackendModule},
        shareable_handle::SharedBuffer,
    };

    #[test]
    fn test_registry_lookups() {
        let backend = get_test_backend(8, &[]);
        let page = backend.page_size();

        let block = MemoryBlock::allocate(
            &backend,
            ResolvedPolicy::Contiguous { under_4gib: false },
            2 * page,
        )
        .unwrap();
        let base = block.phys_base();
        let buffer = Arc::new(SharedBuffer::new(block));

        let mut registry = OwnerRegistry::new();
        // an import of the same buffer is registered before the owned entry
        let alias = registry.insert(RegistryEntry::imported(buffer.clone(), false));
        let owned = registry.insert(RegistryEntry::owned(buffer.clone()));
        assert_ne!(alias, owned);
        assert_eq!(registry.len(), 2);

        assert_eq!(registry.find_import(&buffer), Some(alias));
        assert_eq!(registry.find_by_phys(base + page + 5), Some(owned));
        assert_eq!(registry.find_by_phys(base + 2 * page), None);

        registry.remove(owned).unwrap();
        assert_eq!(registry.find_by_phys(base), Some(alias));

        let drained = registry.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].0, alias);
        assert!(registry.get(alias).is_none());

        // identities are never reused
        let next = registry.insert(RegistryEntry::owned(buffer));
        assert!(next > owned);
    }
}
