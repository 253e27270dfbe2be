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

//! Crash-recovery scenarios, end to end.
//!
//! Each test builds a store, kills it at a chosen point (the durable log
//! prefix survives, in-memory pages are lost), reopens it and checks the
//! recovered state:
//!
//! 1. clean shutdown recovers clean
//! 2. crash between a transaction's updates and its end record
//! 3. two complete checkpoints with the master naming the older one
//! 4. virgin page rebuilt from its format record
//! 5. corrupted on-disk page recovered via single-page recovery
//! 6. compensation chain from a pre-crash savepoint rollback
//!
//! plus torn-write property tests and the recovery invariants (in-doubt
//! closure, transaction completeness, page LSN floors).

use std::sync::Arc;

use proptest::prelude::*;
use tempfile::tempdir;

use emberdb_storage::{
    Engine, EngineConfig, EngineError, Lsn, PageId, RecordType, RecoveryMode, RedoMode,
    UndoMode,
};

fn open(cfg: &EngineConfig) -> Arc<Engine> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    Engine::open(cfg.clone()).unwrap()
}

fn pid(n: u32) -> PageId {
    PageId::new(1, 0, n)
}

/// Every recovered store must satisfy these.
fn assert_recovery_invariants(engine: &Engine) {
    assert_eq!(engine.pool.in_doubt_count(), 0, "in-doubt closure violated");
    assert!(engine.txns.is_empty(), "transaction completeness violated");
    for i in 1..engine.pool.capacity() {
        let meta = engine.pool.meta(i);
        if meta.used && !meta.rec_lsn.is_null() && !meta.page_lsn.is_null() {
            assert!(
                meta.rec_lsn <= meta.page_lsn,
                "rec_lsn {} above page_lsn {} for {}",
                meta.rec_lsn,
                meta.page_lsn,
                meta.pid
            );
        }
    }
}

// ======================================================================
// Scenario 1: clean shutdown, clean recover
// ======================================================================

#[test]
fn test_clean_shutdown_recovers_clean() {
    let dir = tempdir().unwrap();
    let cfg = EngineConfig::small_for_test(dir.path());
    {
        let engine = open(&cfg);
        engine.mount_volume("vol1.db", 1).unwrap();
        engine.alloc_page(pid(1)).unwrap();
        let t1 = engine.begin().unwrap();
        engine.insert_kv(t1, pid(1), b"a", b"1").unwrap();
        engine.commit(t1).unwrap();
        let t2 = engine.begin().unwrap();
        engine.insert_kv(t2, pid(1), b"b", b"2").unwrap();
        engine.commit(t2).unwrap();
        engine.shutdown().unwrap();
    }
    let engine = open(&cfg);
    assert!(!engine.log.master_lsn().is_null());
    assert_recovery_invariants(&engine);
    // Redo and Undo were no-ops; the data reads straight off the volume.
    assert_eq!(engine.read_kv(pid(1), b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(engine.read_kv(pid(1), b"b").unwrap(), Some(b"2".to_vec()));
    engine.shutdown().unwrap();
}

// ======================================================================
// Scenario 2: crash before the end record
// ======================================================================

#[test]
fn test_crash_between_updates_and_end_record() {
    let dir = tempdir().unwrap();
    let cfg = EngineConfig::small_for_test(dir.path());
    {
        let engine = open(&cfg);
        engine.mount_volume("vol1.db", 1).unwrap();
        engine.alloc_page(pid(1)).unwrap();
        engine.alloc_page(pid(2)).unwrap();
        let t0 = engine.begin().unwrap();
        engine.insert_kv(t0, pid(1), b"base", b"0").unwrap();
        engine.insert_kv(t0, pid(2), b"base", b"0").unwrap();
        engine.commit(t0).unwrap();
        engine.checkpoint().unwrap();

        // Three updates of t1 are durable; its end record never is.
        let t1 = engine.begin().unwrap();
        engine.update_kv(t1, pid(1), b"base", b"dirty").unwrap();
        engine.insert_kv(t1, pid(1), b"extra", b"x").unwrap();
        let l3 = engine.insert_kv(t1, pid(2), b"extra", b"y").unwrap();
        engine.log.flush(l3, true).unwrap();
        engine.simulate_crash();
    }

    let engine = open(&cfg);
    assert_recovery_invariants(&engine);
    // t1 was doomed: its updates redone, then compensated away.
    assert_eq!(engine.read_kv(pid(1), b"base").unwrap(), Some(b"0".to_vec()));
    assert_eq!(engine.read_kv(pid(2), b"base").unwrap(), Some(b"0".to_vec()));
    assert_eq!(engine.read_kv(pid(1), b"extra").unwrap(), None);
    assert_eq!(engine.read_kv(pid(2), b"extra").unwrap(), None);

    // The log tail carries the compensation chain and the abort record.
    let mut scan = engine.log.scan_forward(Lsn::new(1, 0));
    let mut clrs = 0;
    let mut aborts = 0;
    while let Some((_, rec)) = scan.next().unwrap() {
        if rec.is_cpsn() {
            clrs += 1;
        }
        if rec.rtype == RecordType::TxnAbort {
            aborts += 1;
        }
    }
    assert_eq!(clrs, 3);
    assert_eq!(aborts, 1);
    engine.shutdown().unwrap();
}

// ======================================================================
// Scenario 3: double checkpoint race
// ======================================================================

#[test]
fn test_double_checkpoint_master_names_older() {
    let dir = tempdir().unwrap();
    let cfg = EngineConfig::small_for_test(dir.path());
    {
        let engine = open(&cfg);
        engine.mount_volume("vol1.db", 1).unwrap();
        engine.alloc_page(pid(1)).unwrap();
        let t = engine.begin().unwrap();
        engine.insert_kv(t, pid(1), b"keep", b"1").unwrap();
        engine.commit(t).unwrap();

        // C1 is published; C2 completes its records but the crash lands
        // before the master pointer moves.
        let c1 = engine.checkpoint().unwrap();
        let c2 = engine
            .chkpt
            .write_records(&engine.log, &engine.pool, &engine.txns, &engine.volumes)
            .unwrap();
        assert_ne!(c2.begin_lsn, c1);
        assert_eq!(engine.log.master_lsn(), c1);

        let t2 = engine.begin().unwrap();
        let l = engine.insert_kv(t2, pid(1), b"doomed", b"2").unwrap();
        engine.log.flush(l, true).unwrap();
        engine.simulate_crash();
    }

    let engine = open(&cfg);
    assert_recovery_invariants(&engine);
    // Identical to a single-checkpoint run: C2's tables were ignored.
    assert_eq!(engine.read_kv(pid(1), b"keep").unwrap(), Some(b"1".to_vec()));
    assert_eq!(engine.read_kv(pid(1), b"doomed").unwrap(), None);
    engine.shutdown().unwrap();
}

// ======================================================================
// Scenario 4: virgin page with format record
// ======================================================================

#[test]
fn test_virgin_page_rebuilt_from_format_record() {
    let dir = tempdir().unwrap();
    let cfg = EngineConfig::small_for_test(dir.path());
    let row_lsn;
    {
        let engine = open(&cfg);
        engine.mount_volume("vol1.db", 1).unwrap();
        engine.checkpoint().unwrap();

        // Page born after the checkpoint, never flushed: the volume has no
        // bytes for it at restart.
        engine.alloc_page(pid(7)).unwrap();
        let t = engine.begin().unwrap();
        row_lsn = engine.insert_kv(t, pid(7), b"row", b"r1").unwrap();
        engine.commit(t).unwrap();
        engine.simulate_crash();
    }

    let engine = open(&cfg);
    assert_recovery_invariants(&engine);
    assert_eq!(engine.read_kv(pid(7), b"row").unwrap(), Some(b"r1".to_vec()));
    let idx = engine.pool.lookup(pid(7)).unwrap();
    assert_eq!(engine.pool.meta(idx).page_lsn, row_lsn);
    engine.shutdown().unwrap();
}

// ======================================================================
// Scenario 5: corrupted page recovered via SPR
// ======================================================================

#[test]
fn test_corrupted_page_recovered_via_spr() {
    let dir = tempdir().unwrap();
    let cfg = EngineConfig::small_for_test(dir.path());
    {
        let engine = open(&cfg);
        engine.mount_volume("vol1.db", 1).unwrap();
        engine.alloc_page(pid(3)).unwrap();
        let t = engine.begin().unwrap();
        engine.insert_kv(t, pid(3), b"old", b"1").unwrap();
        engine.commit(t).unwrap();
        engine.shutdown().unwrap(); // page image lands on disk
    }
    let l5;
    {
        let engine = open(&cfg);
        let t = engine.begin().unwrap();
        l5 = engine.insert_kv(t, pid(3), b"new", b"2").unwrap();
        engine.commit(t).unwrap();
        // The on-disk image rots; the log is the only good copy.
        engine.volumes.corrupt_page_for_test(pid(3)).unwrap();
        engine.simulate_crash();
    }

    let engine = open(&cfg);
    assert_recovery_invariants(&engine);
    assert_eq!(engine.read_kv(pid(3), b"old").unwrap(), Some(b"1".to_vec()));
    assert_eq!(engine.read_kv(pid(3), b"new").unwrap(), Some(b"2".to_vec()));
    let idx = engine.pool.lookup(pid(3)).unwrap();
    assert_eq!(engine.pool.meta(idx).page_lsn, l5);
    engine.shutdown().unwrap();

    // The rewritten image passes its checksum again.
    let engine = open(&cfg);
    assert_eq!(engine.read_kv(pid(3), b"new").unwrap(), Some(b"2".to_vec()));
    engine.shutdown().unwrap();
}

// ======================================================================
// Scenario 6: compensation chain from a savepoint rollback
// ======================================================================

#[test]
fn test_clr_chain_from_savepoint_rollback() {
    let dir = tempdir().unwrap();
    let cfg = EngineConfig::small_for_test(dir.path());
    {
        let engine = open(&cfg);
        engine.mount_volume("vol1.db", 1).unwrap();
        engine.alloc_page(pid(1)).unwrap();
        engine.checkpoint().unwrap();

        let t1 = engine.begin().unwrap();
        let l1 = engine.insert_kv(t1, pid(1), b"k1", b"1").unwrap();
        engine.insert_kv(t1, pid(1), b"k2", b"2").unwrap();
        // Roll back to before k2; the CLR's undo_next points at l1.
        engine.rollback_to_savepoint(t1, l1).unwrap();
        engine.log.flush_all().unwrap();
        engine.simulate_crash();
    }

    let engine = open(&cfg);
    assert_recovery_invariants(&engine);
    // Undo skipped the compensated range via the CLR, undid k1, ended t1:
    // no trace of the transaction remains.
    assert_eq!(engine.read_kv(pid(1), b"k1").unwrap(), None);
    assert_eq!(engine.read_kv(pid(1), b"k2").unwrap(), None);
    engine.shutdown().unwrap();
}

// ======================================================================
// Recovery is stable under repetition
// ======================================================================

#[test]
fn test_recover_twice_yields_identical_pages() {
    let dir = tempdir().unwrap();
    let cfg = EngineConfig::small_for_test(dir.path());
    {
        let engine = open(&cfg);
        engine.mount_volume("vol1.db", 1).unwrap();
        engine.alloc_page(pid(1)).unwrap();
        let t0 = engine.begin().unwrap();
        engine.insert_kv(t0, pid(1), b"committed", b"c").unwrap();
        engine.commit(t0).unwrap();
        engine.checkpoint().unwrap();
        let t1 = engine.begin().unwrap();
        let l = engine.insert_kv(t1, pid(1), b"inflight", b"x").unwrap();
        engine.log.flush(l, true).unwrap();
        engine.simulate_crash();
    }
    let first = {
        let engine = open(&cfg);
        let v = engine.read_kv(pid(1), b"committed").unwrap();
        let g = engine.read_kv(pid(1), b"inflight").unwrap();
        // A second crash right after recovery: the CLRs are durable, the
        // page images may or may not be.
        engine.simulate_crash();
        (v, g)
    };
    let engine = open(&cfg);
    assert_recovery_invariants(&engine);
    assert_eq!(engine.read_kv(pid(1), b"committed").unwrap(), first.0);
    assert_eq!(engine.read_kv(pid(1), b"inflight").unwrap(), first.1);
    assert_eq!(first.0, Some(b"c".to_vec()));
    assert_eq!(first.1, None);
    engine.shutdown().unwrap();
}

// ======================================================================
// Concurrent recovery modes
// ======================================================================

fn crashed_store(cfg: &EngineConfig) {
    let engine = open(cfg);
    engine.mount_volume("vol1.db", 1).unwrap();
    engine.alloc_page(pid(1)).unwrap();
    engine.alloc_page(pid(2)).unwrap();
    let t0 = engine.begin().unwrap();
    engine.insert_kv(t0, pid(1), b"safe", b"1").unwrap();
    engine.commit(t0).unwrap();
    engine.checkpoint().unwrap();
    let t1 = engine.begin().unwrap();
    engine.insert_kv(t1, pid(2), b"doomed", b"2").unwrap();
    let l = engine.update_kv(t1, pid(1), b"safe", b"tainted").unwrap();
    engine.log.flush(l, true).unwrap();
    engine.simulate_crash();
}

#[test]
fn test_concurrent_commit_lsn_recovery_matches_serial() {
    let dir = tempdir().unwrap();
    let mut cfg = EngineConfig::small_for_test(dir.path());
    crashed_store(&cfg);

    cfg.recovery_mode = RecoveryMode::ConcurrentCommitLsn;
    let engine = open(&cfg);
    // The store is open after Analysis; the restart thread finishes Redo
    // and Undo in the background.
    engine.wait_for_restart();
    assert!(!engine.recovery_active());
    assert_recovery_invariants(&engine);
    assert_eq!(engine.read_kv(pid(1), b"safe").unwrap(), Some(b"1".to_vec()));
    assert_eq!(engine.read_kv(pid(2), b"doomed").unwrap(), None);
    engine.shutdown().unwrap();
}

#[test]
fn test_concurrent_access_during_recovery_is_fenced_or_correct() {
    let dir = tempdir().unwrap();
    let mut cfg = EngineConfig::small_for_test(dir.path());
    crashed_store(&cfg);

    cfg.recovery_mode = RecoveryMode::ConcurrentCommitLsn;
    let engine = open(&cfg);
    // A page the doomed transaction touched: access either hits the
    // commit fence or, once Undo is done, sees the rolled-back state.
    // It must never see the doomed value.
    loop {
        match engine.read_kv(pid(2), b"doomed") {
            Ok(v) => {
                assert_eq!(v, None);
                break;
            }
            Err(EngineError::RecoveryConflict(_)) => {
                std::thread::sleep(std::time::Duration::from_millis(5));
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    engine.wait_for_restart();
    assert_recovery_invariants(&engine);
    engine.shutdown().unwrap();
}

#[test]
fn test_page_driven_redo_recovers() {
    let dir = tempdir().unwrap();
    let mut cfg = EngineConfig::small_for_test(dir.path());
    crashed_store(&cfg);

    cfg.recovery_mode = RecoveryMode::ConcurrentCommitLsn;
    cfg.redo_mode = RedoMode::PageDriven;
    let engine = open(&cfg);
    engine.wait_for_restart();
    assert_recovery_invariants(&engine);
    assert_eq!(engine.read_kv(pid(1), b"safe").unwrap(), Some(b"1".to_vec()));
    assert_eq!(engine.read_kv(pid(2), b"doomed").unwrap(), None);
    engine.shutdown().unwrap();
}

#[test]
fn test_transaction_driven_undo_recovers() {
    let dir = tempdir().unwrap();
    let mut cfg = EngineConfig::small_for_test(dir.path());
    crashed_store(&cfg);

    cfg.recovery_mode = RecoveryMode::ConcurrentCommitLsn;
    cfg.undo_mode = UndoMode::Transaction;
    let engine = open(&cfg);
    engine.wait_for_restart();
    assert_recovery_invariants(&engine);
    assert_eq!(engine.read_kv(pid(1), b"safe").unwrap(), Some(b"1".to_vec()));
    assert_eq!(engine.read_kv(pid(2), b"doomed").unwrap(), None);
    engine.shutdown().unwrap();
}

#[test]
fn test_concurrent_lock_recovery_is_gated() {
    let dir = tempdir().unwrap();
    let mut cfg = EngineConfig::small_for_test(dir.path());
    cfg.recovery_mode = RecoveryMode::ConcurrentLock;
    match Engine::open(cfg) {
        Err(EngineError::NotImplemented(_)) => {}
        other => panic!("expected NotImplemented, got {other:?}"),
    }
}

// ======================================================================
// Group commit and the commit point
// ======================================================================

#[test]
fn test_group_commit_survives_crash() {
    let dir = tempdir().unwrap();
    let cfg = EngineConfig::small_for_test(dir.path());
    {
        let engine = open(&cfg);
        engine.mount_volume("vol1.db", 1).unwrap();
        engine.alloc_page(pid(1)).unwrap();
        engine.checkpoint().unwrap();

        let t1 = engine.begin().unwrap();
        let t2 = engine.begin().unwrap();
        engine.insert_kv(t1, pid(1), b"g1", b"1").unwrap();
        engine.insert_kv(t2, pid(1), b"g2", b"2").unwrap();
        // One end-group record commits both; it is durable, so both
        // transactions survive the crash.
        engine.commit_group(&[t1, t2]).unwrap();
        engine.simulate_crash();
    }
    let engine = open(&cfg);
    assert_recovery_invariants(&engine);
    assert_eq!(engine.read_kv(pid(1), b"g1").unwrap(), Some(b"1".to_vec()));
    assert_eq!(engine.read_kv(pid(1), b"g2").unwrap(), Some(b"2".to_vec()));
    engine.shutdown().unwrap();
}

/// The freeing-space record marks the commit point: if it is durable, the
/// transaction recovers as committed even when the end record is lost.
#[test]
fn test_durable_freeing_space_counts_as_committed() {
    let dir = tempdir().unwrap();
    let cfg = EngineConfig::small_for_test(dir.path());
    {
        let engine = open(&cfg);
        engine.mount_volume("vol1.db", 1).unwrap();
        engine.alloc_page(pid(1)).unwrap();
        engine.checkpoint().unwrap();
        let t = engine.begin().unwrap();
        engine.insert_kv(t, pid(1), b"a", b"1").unwrap();
        engine.commit(t).unwrap();
        engine.simulate_crash();
    }
    // Tear only the trailing end record; the freeing-space record stays.
    let parts: Vec<u32> = std::fs::read_dir(&cfg.log_dir)
        .unwrap()
        .filter_map(|e| {
            let name = e.unwrap().file_name().to_string_lossy().into_owned();
            name.strip_prefix("log.").and_then(|n| n.parse::<u32>().ok())
        })
        .collect();
    let last = parts.iter().max().unwrap();
    let path = cfg.log_dir.join(format!("log.{last}"));
    let mut bytes = std::fs::read(&path).unwrap();
    let n = bytes.len();
    bytes[n - 3] ^= 0xFF;
    std::fs::write(&path, &bytes).unwrap();

    let engine = open(&cfg);
    assert_recovery_invariants(&engine);
    assert_eq!(engine.read_kv(pid(1), b"a").unwrap(), Some(b"1".to_vec()));
    engine.shutdown().unwrap();
}

// ======================================================================
// Torn writes
// ======================================================================

/// Chop a byte from the lsn_check trailer of the last durable record: the
/// record must vanish as if never written.
#[test]
fn test_torn_trailer_drops_final_record() {
    let dir = tempdir().unwrap();
    let cfg = EngineConfig::small_for_test(dir.path());
    {
        let engine = open(&cfg);
        engine.mount_volume("vol1.db", 1).unwrap();
        engine.alloc_page(pid(1)).unwrap();
        let t = engine.begin().unwrap();
        engine.insert_kv(t, pid(1), b"a", b"1").unwrap();
        engine.commit(t).unwrap();
        engine.simulate_crash();
    }
    // Flip a byte inside the final record's trailer.
    let parts: Vec<_> = std::fs::read_dir(&cfg.log_dir)
        .unwrap()
        .filter_map(|e| {
            let name = e.unwrap().file_name().to_string_lossy().into_owned();
            name.strip_prefix("log.").and_then(|n| n.parse::<u32>().ok())
        })
        .collect();
    let last = parts.iter().max().unwrap();
    let path = cfg.log_dir.join(format!("log.{last}"));
    let mut bytes = std::fs::read(&path).unwrap();
    let n = bytes.len();
    // The commit wrote freeing-space then end, 48 bytes each, at the tail.
    // Tear the freeing-space record's trailer so the whole commit vanishes.
    bytes[n - 48 - 3] ^= 0xFF;
    std::fs::write(&path, &bytes).unwrap();

    // With its commit gone, t is doomed and rolls back.
    let engine = open(&cfg);
    assert_recovery_invariants(&engine);
    assert_eq!(engine.read_kv(pid(1), b"a").unwrap(), None);
    engine.shutdown().unwrap();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    /// Truncating the durable log at any point after the master checkpoint
    /// leaves an all-or-nothing outcome per committed transaction, and
    /// recovery always completes.
    #[test]
    fn test_committed_prefix_survives_truncation(
        cut_back in 1u64..2000,
        ntxn in 1usize..5,
        writes_per_txn in 1usize..4,
    ) {
        let dir = tempdir().unwrap();
        let cfg = EngineConfig::small_for_test(dir.path());
        let safe_mark;
        {
            let engine = open(&cfg);
            engine.mount_volume("vol1.db", 1).unwrap();
            engine.alloc_page(pid(1)).unwrap();
            engine.checkpoint().unwrap();
            safe_mark = engine.log.curr_lsn();
            for t in 0..ntxn {
                let tid = engine.begin().unwrap();
                for w in 0..writes_per_txn {
                    let key = format!("t{t}_w{w}").into_bytes();
                    engine.insert_kv(tid, pid(1), &key, b"v").unwrap();
                }
                engine.commit(tid).unwrap();
            }
            engine.simulate_crash();
        }

        // Truncate the newest partition, never cutting into the master
        // checkpoint.
        let last_part = {
            let mut parts: Vec<u32> = std::fs::read_dir(&cfg.log_dir)
                .unwrap()
                .filter_map(|e| {
                    let name = e.unwrap().file_name().to_string_lossy().into_owned();
                    name.strip_prefix("log.").and_then(|n| n.parse::<u32>().ok())
                })
                .collect();
            parts.sort_unstable();
            *parts.last().unwrap()
        };
        let path = cfg.log_dir.join(format!("log.{last_part}"));
        let len = std::fs::metadata(&path).unwrap().len();
        let floor = if last_part == safe_mark.partition() {
            safe_mark.offset() as u64
        } else {
            0
        };
        let new_len = len.saturating_sub(cut_back).max(floor);
        let f = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        f.set_len(new_len).unwrap();
        drop(f);

        let engine = open(&cfg);
        assert_recovery_invariants(&engine);
        for t in 0..ntxn {
            let mut present = 0;
            for w in 0..writes_per_txn {
                let key = format!("t{t}_w{w}").into_bytes();
                if engine.read_kv(pid(1), &key).unwrap().is_some() {
                    present += 1;
                }
            }
            prop_assert!(
                present == 0 || present == writes_per_txn,
                "transaction {t} partially visible: {present}/{writes_per_txn}"
            );
        }
        engine.shutdown().unwrap();
    }
}
