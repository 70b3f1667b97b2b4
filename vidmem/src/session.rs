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

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};

use crate::{
    allocation_identifier::SessionId,
    error::{Result, VidmemError},
    owner_registry::OwnerRegistry,
};

/// An open session. The registry lock serializes all operations of the session.
pub(crate) struct Session {
    id: SessionId,

    /// `None` once the session was closed
    registry: Mutex<Option<OwnerRegistry>>,
}

impl Session {
    pub(crate) fn new(id: SessionId) -> Self {
        Session {
            id,
            registry: Mutex::new(Some(OwnerRegistry::new())),
        }
    }

    pub(crate) fn id(&self) -> SessionId {
        self.id
    }

    /// Locks the registry, fails if the session was closed in the meantime
    pub(crate) fn registry(&self) -> Result<MappedMutexGuard<'_, OwnerRegistry>> {
        MutexGuard::try_map(self.registry.lock(), |registry| registry.as_mut())
            .map_err(|_| VidmemError::NoSuchSession(self.id))
    }

    /// Takes the registry out of the session. Later operations see a closed session.
    pub(crate) fn close(&self) -> Option<OwnerRegistry> {
        self.registry.lock().take()
    }
}
