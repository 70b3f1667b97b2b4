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

use std::{env, process};

use env_logger::{Builder, Env};
use log::{error, info};
use vidmem::{
    AllocRequest, ExportFlags, RegionConfig, SyncDirection, VidmemConfig, VidmemError,
    VidmemService,
};

const PATTERN: [u8; 4] = [0xDE, 0xAD, 0xBE, 0xEF];

fn main() {
    Builder::from_env(Env::default())
        .filter_level(log::LevelFilter::Debug)
        .format_module_path(false)
        .init();

    // every argument is a reserved region in `size@base` notation, e.g. 16M@0x4200_0000
    let mut config = VidmemConfig::default();
    for arg in env::args().skip(1) {
        match arg.parse::<RegionConfig>() {
            Ok(region) => config = config.with_region(region),
            Err(err) => {
                error!("Invalid region '{}': {}", arg, err);
                process::exit(2);
            }
        }
    }

    if let Err(err) = run(config) {
        error!("{}", err);
        process::exit(1);
    }
}

fn run(config: VidmemConfig) -> vidmem::Result<()> {
    let region_count = config.reserved_regions.len();
    let service = VidmemService::new(config)?;
    let page = service.page_size();

    let producer = service.open_session();
    let consumer = service.open_session();

    let alloc = service.allocate(producer, AllocRequest::scattered(page))?;
    let view = service.map(producer, alloc.id, 0, page)?;
    if let Some(data) = unsafe { view.as_mut_slice() } {
        for chunk in data.chunks_exact_mut(PATTERN.len()) {
            chunk.copy_from_slice(&PATTERN);
        }
    }
    service.sync(producer, alloc.id, SyncDirection::ToDevice)?;

    let token = service.export(producer, alloc.id, ExportFlags::READ)?;
    info!("Producer exported buffer {} as {}", alloc.id, token);

    let imported = service.import(consumer, token)?;
    let view = service.map(consumer, imported.id, 0, imported.size)?;
    let data = unsafe { view.as_slice() };
    info!(
        "Consumer reads {:02X?} through a {:?} mapping at {:#x}",
        &data[..PATTERN.len()],
        view.attribute,
        view.addr
    );

    for region in 0..region_count {
        let carved = service.allocate(producer, AllocRequest::from_region(page, region))?;
        info!("Region {}: carved out {} bytes at {}", region, carved.size, carved.phys_base);
    }

    service.release(consumer, imported.id)?;
    service.release(producer, alloc.id)?;

    match service.import(consumer, token) {
        Err(VidmemError::InvalidToken(_)) => info!("Stale token {} was rejected", token),
        Err(err) => return Err(err),
        Ok(_) => error!("Stale token {} still resolved", token),
    }

    info!("{:?}", service.stats());
    service.shutdown()
}
