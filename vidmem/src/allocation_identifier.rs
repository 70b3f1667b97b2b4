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

use core::{
    fmt::{self, Display},
    num::NonZeroU64,
};

/// Index of a reserved region (and of its region pool), `0..N-1`
pub type RegionId = usize;

/// Identifies one open session (the unit of ownership)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub(crate) u64);

/// Session local identity of a buffer.
///
/// Only meaningful together with the session that received it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferId(pub(crate) u64);

/// Opaque token that names an exported buffer across sessions.
///
/// Tokens are drawn from a counter that is never rewound during the lifetime
/// of a service, so a stale token can never resolve to a buffer that was
/// allocated later at the same physical address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExportToken(NonZeroU64);

impl SessionId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl BufferId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl ExportToken {
    pub(crate) fn from_generation(generation: NonZeroU64) -> Self {
        Self(generation)
    }

    /// Raw value, for handing the token to another party out of band
    pub fn as_raw(&self) -> u64 {
        self.0.get()
    }

    /// Rebuilds a token from its raw value. `0` is never a valid token.
    pub fn from_raw(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl Display for ExportToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0.get())
    }
}
