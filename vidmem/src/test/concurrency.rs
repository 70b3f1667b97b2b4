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

use std::thread;

use rand::{rngs::SmallRng, RngCore, SeedableRng};

use super::get_test_service;
use crate::{AllocFlags, AllocRequest, ExportFlags, PhysRun, SessionId, VidmemError};

#[test]
fn test_import_release_race() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 200;

    let service = get_test_service(16, &[]);
    let owner = service.open_session();
    let alloc = service.allocate(owner, AllocRequest::contiguous(4096)).unwrap();
    let token = service.export(owner, alloc.id, ExportFlags::READ_WRITE).unwrap();

    thread::scope(|scope| {
        for _ in 0..THREADS {
            scope.spawn(|| {
                let session = service.open_session();
                for _ in 0..ROUNDS {
                    match service.import(session, token) {
                        Ok(imported) => service.release(session, imported.id).unwrap(),
                        // the owner reference and every import were dropped already
                        Err(VidmemError::InvalidToken(_)) => {}
                        Err(err) => panic!("unexpected error: {}", err),
                    }
                }
                service.close_session(session).unwrap();
            });
        }

        // drop the owner reference while importers come and go
        scope.spawn(|| service.release(owner, alloc.id).unwrap());
    });

    // whoever dropped the last reference freed the buffer exactly once
    let stats = service.stats();
    assert_eq!(stats.live_buffers, 0);
    assert_eq!(stats.live_exports, 0);
    assert_eq!(stats.free_pages, 16);
    assert!(matches!(
        service.import(owner, token),
        Err(VidmemError::InvalidToken(_))
    ));
}

#[test]
fn test_free_import_race() {
    const ROUNDS: usize = 100;

    let service = get_test_service(16, &[]);
    let owner = service.open_session();
    let importer = service.open_session();

    for _ in 0..ROUNDS {
        let alloc = service.allocate(owner, AllocRequest::scattered(4096)).unwrap();
        let token = service.export(owner, alloc.id, ExportFlags::READ).unwrap();

        let (freed, imported) = thread::scope(|scope| {
            let free = scope.spawn(|| service.free(owner, alloc.id));
            let import = scope.spawn(|| service.import(importer, token));
            (free.join().unwrap(), import.join().unwrap())
        });

        // exactly one of both wins
        match (freed, imported) {
            (Ok(()), Err(VidmemError::InvalidToken(_))) => {}
            (Err(VidmemError::StillShared { .. }), Ok(imported)) => {
                service.release(importer, imported.id).unwrap();
                service.free(owner, alloc.id).unwrap();
            }
            (freed, imported) => panic!("unexpected outcome: {:?} {:?}", freed, imported),
        }

        assert_eq!(service.stats().live_buffers, 0);
    }

    assert_eq!(service.stats().free_pages, 16);
}

#[test]
fn test_parallel_sessions_disjoint() {
    const THREADS: u64 = 4;
    const STEPS: usize = 300;

    let service = get_test_service(256, &[32]);
    let page = service.page_size();

    let (sessions, runs): (Vec<SessionId>, Vec<Vec<PhysRun>>) = thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|thread_id| {
                let service = &service;
                scope.spawn(move || {
                    let session = service.open_session();
                    let mut rand = SmallRng::seed_from_u64(0x5eed + thread_id);
                    let mut live = Vec::new();

                    for _ in 0..STEPS {
                        if live.is_empty() || rand.next_u32() % 3 != 0 {
                            let size = (rand.next_u32() as usize % (4 * page)) + 1;
                            let request = match rand.next_u32() % 4 {
                                0 => AllocRequest::scattered(size),
                                1 => AllocRequest::contiguous(size),
                                2 => AllocRequest::from_region(size, 0),
                                _ => AllocRequest::scattered(size).with_flags(AllocFlags::ZEROED),
                            };

                            match service.allocate(session, request) {
                                Ok(alloc) => live.push(alloc.id),
                                Err(err) => {
                                    assert!(err.is_exhaustion(), "unexpected error: {}", err)
                                }
                            }
                        } else {
                            let index = rand.next_u32() as usize % live.len();
                            service.free(session, live.swap_remove(index)).unwrap();
                        }
                    }

                    let runs = live
                        .iter()
                        .flat_map(|id| service.scatter_list(session, *id).unwrap())
                        .collect::<Vec<PhysRun>>();
                    (session, runs)
                })
            })
            .collect();

        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .unzip()
    });
    let runs: Vec<PhysRun> = runs.into_iter().flatten().collect();

    // buffers of all sessions must not overlap anywhere
    for (i, run) in runs.iter().enumerate() {
        for other in runs.iter().skip(i + 1) {
            assert!(!run.overlaps(other), "{:?} overlaps {:?}", run, other);
        }
    }

    let stats = service.stats();
    assert_eq!(stats.sessions, THREADS as usize);
    assert!(stats.live_buffers > 0);

    // closing the sessions gives everything back, the pools are still alive
    for session in sessions {
        service.close_session(session).unwrap();
    }
    let stats = service.stats();
    assert_eq!(stats.sessions, 0);
    assert_eq!(stats.live_buffers, 0);
    assert_eq!(stats.free_pages, 256);
    assert_eq!(stats.region_free_bytes, vec![32 * page]);

    // destroyed pools report no free bytes
    service.shutdown().unwrap();
    assert_eq!(service.stats().region_free_bytes, vec![0]);
}
