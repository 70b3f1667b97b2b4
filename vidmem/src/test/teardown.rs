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

use super::get_test_service;
use crate::{AllocRequest, ExportFlags, VidmemError};

#[test]
fn test_leak_free_session_teardown() {
    const K: usize = 6;
    const M: usize = 3;

    let service = get_test_service(64, &[16]);
    let page = service.page_size();
    let a = service.open_session();
    let b = service.open_session();

    let requests = [
        AllocRequest::scattered(3 * page),
        AllocRequest::contiguous(2 * page),
        AllocRequest::from_region(4 * page, 0),
        AllocRequest::coherent(page),
        AllocRequest::scattered(page / 2),
        AllocRequest::contiguous(5 * page),
    ];
    let allocations: Vec<_> = requests
        .iter()
        .map(|request| service.allocate(a, *request).unwrap())
        .collect();
    assert_eq!(allocations.len(), K);

    // some of them are mapped on both sides
    service.map(a, allocations[0].id, 0, 3 * page).unwrap();

    let imported: Vec<_> = allocations
        .iter()
        .take(M)
        .map(|alloc| {
            let token = service.export(a, alloc.id, ExportFlags::READ_WRITE).unwrap();
            service.import(b, token).unwrap()
        })
        .collect();
    service.map(b, imported[0].id, 0, page).unwrap();

    assert_eq!(service.stats().live_exports, M);
    assert_eq!(service.close_session(a).unwrap(), K);

    // A's own buffers are gone, the shared ones only lost A's reference
    let stats = service.stats();
    assert_eq!(stats.sessions, 1);
    assert_eq!(stats.live_buffers, M);
    assert_eq!(stats.live_exports, M);
    for import in &imported {
        let info = service.query(b, import.id).unwrap();
        assert_eq!(info.refs, 1);
        assert!(info.imported);
    }

    assert_eq!(service.close_session(b).unwrap(), M);

    let stats = service.stats();
    assert_eq!(stats.sessions, 0);
    assert_eq!(stats.live_buffers, 0);
    assert_eq!(stats.live_exports, 0);
    assert_eq!(stats.free_pages, 64);
    assert_eq!(stats.region_free_bytes, vec![16 * page]);

    service.shutdown().unwrap();
}

#[test]
fn test_closed_session() {
    let service = get_test_service(16, &[]);
    let a = service.open_session();
    let b = service.open_session();

    let alloc = service.allocate(a, AllocRequest::scattered(100)).unwrap();
    let token = service.export(a, alloc.id, ExportFlags::READ).unwrap();

    service.close_session(b).unwrap();
    assert!(matches!(
        service.close_session(b),
        Err(VidmemError::NoSuchSession(id)) if id == b
    ));
    assert!(matches!(
        service.allocate(b, AllocRequest::scattered(100)),
        Err(VidmemError::NoSuchSession(_))
    ));
    assert!(matches!(
        service.import(b, token),
        Err(VidmemError::NoSuchSession(_))
    ));

    // the failed import did not leak a reference
    assert_eq!(service.query(a, alloc.id).unwrap().refs, 1);
    assert_eq!(service.close_session(a).unwrap(), 1);
    assert_eq!(service.stats().free_pages, 16);
}

#[test]
fn test_shutdown_reclaims_open_sessions() {
    let service = get_test_service(16, &[4]);
    let page = service.page_size();
    let a = service.open_session();

    service.allocate(a, AllocRequest::from_region(page, 0)).unwrap();
    let alloc = service.allocate(a, AllocRequest::contiguous(page)).unwrap();
    service.map(a, alloc.id, 0, page).unwrap();

    // shutdown closes open sessions, after which the regions can be destroyed
    service.shutdown().unwrap();
    assert_eq!(service.stats().sessions, 0);
    assert_eq!(service.stats().live_buffers, 0);
}
