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

mod allocation_identifier;
mod allocation_options;
mod error;
mod mapping;
mod memory_block;
mod owner_registry;
mod phys_addr;
mod session;
mod shareable_handle;
mod util;
mod vidmem_config;
mod vidmem_service;

#[cfg(test)]
mod test;

pub mod modules;

pub use allocation_identifier::{BufferId, ExportToken, RegionId, SessionId};
pub use allocation_options::{AllocFlags, AllocRequest, ExportFlags, MemoryAttribute, Policy};
pub use error::{Result, VidmemError};
pub use mapping::VirtualRange;
pub use modules::page_backend::SyncDirection;
pub use phys_addr::{PhysAddr, PhysRun, FOUR_GIB};
pub use vidmem_config::{RegionConfig, VidmemConfig, DEFAULT_MEMORY_BASE, DEFAULT_MEMORY_SIZE};
pub use vidmem_service::{Allocation, BufferInfo, Imported, ServiceStats, VidmemService};
