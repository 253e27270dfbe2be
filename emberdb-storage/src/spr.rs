// SPDX-License-Identifier: AGPL-3.0-or-later
// EmberDB - Crash-Recoverable Transactional Storage Engine
// Copyright (C) 2026 Sushanth Reddy Vanagala (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Single-page recovery.
//!
//! Given one page and the LSN its image is expected to reach, replay the
//! page's slice of the log and nothing else. Used for corrupted pages
//! found during Redo, for page-driven Redo, and for on-demand recovery of
//! in-doubt pages touched by user transactions during concurrent restart.
//!
//! The engine keeps no per-page backward chain, so the slice is gathered
//! by a forward scan from the caller's floor (the page's `rec_lsn`); a
//! forward scan delivers the records already sorted by LSN.

use emberdb_core::{EngineError, Lsn, Result};

use crate::log_manager::LogManager;
use crate::page::{self, Page};

/// Replay every record targeting `page` with an LSN in
/// `(page.page_lsn, expected_emlsn]`, scanning forward from `scan_floor`.
///
/// Callers recovering a virgin or corrupted page set `page.page_lsn` to
/// null first so the whole slice replays. With `verify` set, the page must
/// land exactly on `expected_emlsn`.
pub fn recover_single_page(
    log: &LogManager,
    page: &mut Page,
    scan_floor: Lsn,
    expected_emlsn: Lsn,
    verify: bool,
) -> Result<()> {
    let target = page.pid;
    let floor = if scan_floor.is_null() { Lsn::new(1, 0) } else { scan_floor };
    let mut scan = log.scan_forward(floor);
    while let Some((lsn, rec)) = scan.next()? {
        if lsn > expected_emlsn {
            break;
        }
        if !rec.is_redo() || rec.null_pid() {
            continue;
        }
        // Allocation state is not page content; the allocation map owns it.
        if rec.is_page_allocate() || rec.is_page_deallocate() {
            continue;
        }
        let touches = rec.pid.vol == target.vol
            && (rec.pid.page == target.page
                || (rec.is_multi_page() && rec.page2 == target.page));
        if !touches {
            continue;
        }
        if page.page_lsn < lsn {
            page::apply_redo(&rec, page)?;
            page.page_lsn = lsn;
        }
    }
    if verify && page.page_lsn != expected_emlsn {
        return Err(EngineError::Fatal(format!(
            "single-page recovery of {} ended at {}, expected {}",
            target, page.page_lsn, expected_emlsn
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use emberdb_core::{EngineConfig, PageId};
    use crate::log_record::{LogRecord, PageOp, RecordType};
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, LogManager) {
        let dir = tempdir().unwrap();
        let cfg = EngineConfig::small_for_test(dir.path());
        let log = LogManager::open(&cfg).unwrap();
        (dir, log)
    }

    fn insert_op(key: &[u8]) -> PageOp {
        PageOp::Insert { key: key.to_vec(), value: b"v".to_vec(), ghost: false }
    }

    #[test]
    fn test_replays_only_target_page() {
        let (_dir, log) = setup();
        let p1 = PageId::new(1, 0, 1);
        let p2 = PageId::new(1, 0, 2);
        let l1 = log
            .insert(LogRecord::page_update(RecordType::BtreeInsert, 1, Lsn::NULL, p1, &insert_op(b"a")))
            .unwrap();
        let _l2 = log
            .insert(LogRecord::page_update(RecordType::BtreeInsert, 1, l1, p2, &insert_op(b"b")))
            .unwrap();
        let l3 = log
            .insert(LogRecord::page_update(RecordType::BtreeInsert, 1, l1, p1, &insert_op(b"c")))
            .unwrap();

        let mut page = Page::new(p1);
        recover_single_page(&log, &mut page, Lsn::new(1, 0), l3, true).unwrap();
        assert!(page.get(b"a").is_some());
        assert!(page.get(b"b").is_none());
        assert!(page.get(b"c").is_some());
        assert_eq!(page.page_lsn, l3);
    }

    #[test]
    fn test_skips_records_already_on_page() {
        let (_dir, log) = setup();
        let p1 = PageId::new(1, 0, 1);
        let l1 = log
            .insert(LogRecord::page_update(RecordType::BtreeInsert, 1, Lsn::NULL, p1, &insert_op(b"a")))
            .unwrap();
        let l2 = log
            .insert(LogRecord::page_update(
                RecordType::BtreeGhostMark,
                1,
                l1,
                p1,
                &PageOp::GhostMark { key: b"a".to_vec() },
            ))
            .unwrap();

        // Page already reflects l1; only the ghost mark replays.
        let mut page = Page::new(p1);
        page::apply_op(&mut page, &insert_op(b"a")).unwrap();
        page.page_lsn = l1;
        recover_single_page(&log, &mut page, Lsn::new(1, 0), l2, true).unwrap();
        assert!(page.get(b"a").is_none());
        assert_eq!(page.page_lsn, l2);
    }

    #[test]
    fn test_bounded_by_expected_emlsn() {
        let (_dir, log) = setup();
        let p1 = PageId::new(1, 0, 1);
        let l1 = log
            .insert(LogRecord::page_update(RecordType::BtreeInsert, 1, Lsn::NULL, p1, &insert_op(b"a")))
            .unwrap();
        let _l2 = log
            .insert(LogRecord::page_update(RecordType::BtreeInsert, 1, l1, p1, &insert_op(b"late")))
            .unwrap();

        let mut page = Page::new(p1);
        recover_single_page(&log, &mut page, Lsn::new(1, 0), l1, true).unwrap();
        assert!(page.get(b"a").is_some());
        // The record past the expected end LSN did not replay.
        assert!(page.get(b"late").is_none());
    }

    #[test]
    fn test_verify_detects_missing_tail() {
        let (_dir, log) = setup();
        let p1 = PageId::new(1, 0, 1);
        let l1 = log
            .insert(LogRecord::page_update(RecordType::BtreeInsert, 1, Lsn::NULL, p1, &insert_op(b"a")))
            .unwrap();
        let mut page = Page::new(p1);
        // Expect an end LSN the log cannot reach for this page.
        let bogus = l1.advance(4096);
        match recover_single_page(&log, &mut page, Lsn::new(1, 0), bogus, true) {
            Err(EngineError::Fatal(_)) => {}
            other => panic!("expected Fatal, got {other:?}"),
        }
    }
}
