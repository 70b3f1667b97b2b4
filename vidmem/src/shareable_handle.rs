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
    num::NonZeroU64,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc,
    },
};

use log::trace;
use parking_lot::Mutex;

use crate::{
    allocation_identifier::ExportToken,
    allocation_options::ExportFlags,
    error::{Result, VidmemError},
    memory_block::MemoryBlock,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ExportState {
    pub(crate) token: ExportToken,
    pub(crate) flags: ExportFlags,
}

/// A memory block together with the references that keep it alive.
///
/// Every registry entry holds one or more references. The backing is
/// released by whoever drops the count to zero, exactly once.
pub(crate) struct SharedBuffer {
    block: MemoryBlock,
    refs: AtomicU32,
    export: Mutex<Option<ExportState>>,
}

impl SharedBuffer {
    /// Wraps a freshly allocated block, holding one reference
    pub(crate) fn new(block: MemoryBlock) -> Self {
        SharedBuffer {
            block,
            refs: AtomicU32::new(1),
            export: Mutex::new(None),
        }
    }

    pub(crate) fn block(&self) -> &MemoryBlock {
        &self.block
    }

    pub(crate) fn refs(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    pub(crate) fn export_state(&self) -> Option<ExportState> {
        *self.export.lock()
    }

    /// Takes another reference, the caller has to hold one already
    pub(crate) fn get(&self) {
        let prev = self.refs.fetch_add(1, Ordering::Relaxed);
        debug_assert_ne!(prev, 0, "reference taken on a dead buffer");
    }

    /// Takes another reference unless the count already dropped to zero
    pub(crate) fn try_acquire(&self) -> bool {
        let mut curr = self.refs.load(Ordering::Relaxed);
        loop {
            if curr == 0 {
                return false;
            }

            match self.refs.compare_exchange_weak(
                curr,
                curr + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => curr = actual,
            }
        }
    }

    /// Drops one reference. Returns `true` for the caller that dropped the last one.
    pub(crate) fn put(&self) -> bool {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert_ne!(prev, 0, "reference count underflow");
        prev == 1
    }

    /// Drops all references at once, but only if exactly `held` are left
    pub(crate) fn try_put_all(&self, held: u32) -> bool {
        self.refs
            .compare_exchange(held, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Removes the buffer from `table`. Called once the count reached zero.
    pub(crate) fn withdraw(&self, table: &ExportTable) {
        debug_assert_eq!(self.refs(), 0);

        if let Some(state) = self.export.lock().take() {
            table.withdraw(state.token);
        }
    }
}

/// All currently exported buffers, by token
pub(crate) struct ExportTable {
    handles: Mutex<HashMap<ExportToken, Arc<SharedBuffer>>>,
    next_generation: AtomicU64,
}

impl ExportTable {
    pub(crate) fn new() -> Self {
        ExportTable {
            handles: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
        }
    }

    fn next_token(&self) -> ExportToken {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        ExportToken::from_generation(NonZeroU64::MIN.saturating_add(generation))
    }

    /// Publishes `buffer` under a new token or returns the token it already has.
    ///
    /// Returns the state of the export and `true` if it was created by this call.
    /// Flags of the first export stay in effect for all later exports.
    pub(crate) fn export(
        &self,
        buffer: &Arc<SharedBuffer>,
        flags: ExportFlags,
    ) -> (ExportState, bool) {
        let mut export = buffer.export.lock();

        if let Some(state) = *export {
            return (state, false);
        }

        let state = ExportState {
            token: self.next_token(),
            flags,
        };
        self.handles.lock().insert(state.token, buffer.clone());
        *export = Some(state);

        trace!("Published export {}", state.token);

        (state, true)
    }

    /// Resolves `token` and takes a reference on the buffer behind it
    pub(crate) fn acquire(&self, token: ExportToken) -> Result<(Arc<SharedBuffer>, ExportFlags)> {
        let buffer = self
            .handles
            .lock()
            .get(&token)
            .cloned()
            .ok_or(VidmemError::InvalidToken(token))?;

        // the buffer may be on its way out, in which case its token is stale already
        if !buffer.try_acquire() {
            return Err(VidmemError::InvalidToken(token));
        }

        let flags = buffer
            .export_state()
            .map(|state| state.flags)
            .unwrap_or(ExportFlags::READ_WRITE);

        Ok((buffer, flags))
    }

    fn withdraw(&self, token: ExportToken) {
        self.handles.lock().remove(&token);
        trace!("Withdrew export {}", token);
    }

    /// Number of live exports
    pub(crate) fn len(&self) -> usize {
        self.handles.lock().len()
    }
}
