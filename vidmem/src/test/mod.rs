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

use crate::{
    modules::page_backend::{test::get_test_backend, SystemPageBackend},
    VidmemService,
};

mod concurrency;
mod mapping;
mod teardown;

/// Service over a fresh memory window of `pages` general pages followed by
/// one reserved region per item of `regions` (sizes in pages)
pub(crate) fn get_test_service(
    pages: usize,
    regions: &[usize],
) -> VidmemService<SystemPageBackend> {
    let _ = env_logger::builder().is_test(true).try_init();

    VidmemService::with_backend(get_test_backend(pages, regions), false)
}
