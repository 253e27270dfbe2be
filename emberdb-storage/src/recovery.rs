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

//! Restart recovery: Analysis, Redo, Undo.
//!
//! ```text
//!                    master ──▶ begin_chkpt ...... end_chkpt ........ crash
//!                       │                                              │
//!  Analysis:            └────────── forward scan ──────────────────────┘
//!     rebuilds the transaction table (doomed = in flight at crash) and
//!     marks in-doubt pages in the buffer pool, without touching page
//!     bodies or writing any log record.
//!
//!  Redo:      forward from redo_lsn (min rec_lsn of all in-doubt pages),
//!             loads each in-doubt page once and reapplies what is missing;
//!             idempotent via the page_lsn comparison.
//!
//!  Undo:      rolls every doomed transaction back, emitting redo-only
//!             compensation records, then ends them.
//! ```
//!
//! Two post-Analysis schedules are supported. Serial recovery runs all
//! three phases before the store opens. Concurrent recovery opens the
//! store for user transactions right after Analysis: Redo and Undo run on
//! a dedicated restart thread while user transactions are fenced by the
//! commit LSN and recover in-doubt pages on demand.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use emberdb_core::{
    EngineError, Lsn, Result, RecoveryMode, RedoMode, TxnState, UndoMode,
};

use crate::engine::Engine;
use crate::log_record::{
    BeginCheckpointBody, BufferTableBody, DeviceTableBody, EndCheckpointBody, LogRecord,
    RecordType, TxnEndGroupBody, TxnTableBody,
};
use crate::page::Page;
use crate::spr;
use crate::transaction::{self, TxnDescriptor, UndoEntry};
use crate::volume::VolumeManager;

/// What Analysis hands to the later phases.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct AnalysisOutcome {
    /// Where the Redo forward scan starts; may be earlier than master.
    pub redo_lsn: Lsn,
    /// Where a backward Undo scan would stop (informational; both Undo
    /// variants here work off the transaction table).
    pub undo_lsn: Lsn,
    /// Concurrent transactions may not touch state below this point while
    /// recovery is in flight. Null means no doomed work survived.
    pub commit_lsn: Lsn,
    /// The very last LSN in the pre-crash log.
    pub last_lsn: Lsn,
    pub in_doubt_count: u32,
}

impl AnalysisOutcome {
    fn empty() -> AnalysisOutcome {
        AnalysisOutcome {
            redo_lsn: Lsn::NULL,
            undo_lsn: Lsn::NULL,
            commit_lsn: Lsn::NULL,
            last_lsn: Lsn::NULL,
            in_doubt_count: 0,
        }
    }
}

/// Shared recovery state the engine consults while the restart thread is
/// running (concurrent modes).
pub struct RecoveryStatus {
    active: AtomicBool,
    commit_lsn_raw: AtomicU64,
    redo_lsn_raw: AtomicU64,
    redo_end_raw: AtomicU64,
    last_lsn_raw: AtomicU64,
    in_doubt: AtomicU32,
}

impl RecoveryStatus {
    pub fn new() -> RecoveryStatus {
        RecoveryStatus {
            active: AtomicBool::new(false),
            commit_lsn_raw: AtomicU64::new(0),
            redo_lsn_raw: AtomicU64::new(0),
            redo_end_raw: AtomicU64::new(0),
            last_lsn_raw: AtomicU64::new(0),
            in_doubt: AtomicU32::new(0),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn commit_lsn(&self) -> Lsn {
        Lsn::from_raw(self.commit_lsn_raw.load(Ordering::SeqCst))
    }

    pub fn last_lsn(&self) -> Lsn {
        Lsn::from_raw(self.last_lsn_raw.load(Ordering::SeqCst))
    }

    fn arm(&self, outcome: &AnalysisOutcome, redo_end: Lsn) {
        self.commit_lsn_raw.store(outcome.commit_lsn.to_raw(), Ordering::SeqCst);
        self.redo_lsn_raw.store(outcome.redo_lsn.to_raw(), Ordering::SeqCst);
        self.redo_end_raw.store(redo_end.to_raw(), Ordering::SeqCst);
        self.last_lsn_raw.store(outcome.last_lsn.to_raw(), Ordering::SeqCst);
        self.in_doubt.store(outcome.in_doubt_count, Ordering::SeqCst);
        self.active.store(true, Ordering::SeqCst);
    }

    fn clear_commit_lsn(&self) {
        self.commit_lsn_raw.store(0, Ordering::SeqCst);
    }

    fn finish(&self) {
        self.clear_commit_lsn();
        self.active.store(false, Ordering::SeqCst);
    }
}

impl Default for RecoveryStatus {
    fn default() -> Self {
        Self::new()
    }
}

fn fatal(msg: impl Into<String>) -> EngineError {
    EngineError::Fatal(msg.into())
}

// ======================================================================
// Driver
// ======================================================================

/// Run restart recovery per the configured mode. Called once per open,
/// before (serial) or while (concurrent) the store serves transactions.
pub(crate) fn recover(engine: &Arc<Engine>) -> Result<AnalysisOutcome> {
    let master = engine.log.master_lsn();
    tracing::info!(master = %master, "restart recovery");

    let outcome = analysis_pass(engine)?;
    let doomed = engine.txns.active_count() as u32;
    if doomed == 0 && outcome.in_doubt_count == 0 {
        tracing::info!("database is clean");
    } else {
        tracing::info!(
            in_doubt = outcome.in_doubt_count,
            doomed,
            redo_lsn = %outcome.redo_lsn,
            undo_lsn = %outcome.undo_lsn,
            commit_lsn = %outcome.commit_lsn,
            "log analysis complete"
        );
    }

    // Synchronous checkpoint between Analysis and Redo: if we crash again,
    // the next restart starts from here instead of re-reading everything.
    engine.chkpt.take(&engine.log, &engine.pool, &engine.txns, &engine.volumes)?;

    match engine.config.recovery_mode {
        RecoveryMode::Serial => {
            if outcome.in_doubt_count > 0 {
                let end = engine.log.curr_lsn();
                run_redo(engine, &outcome, end, true)?;
                // Serial mode flushes the recovered pages so a re-crash
                // has less to do; rec_lsn floors reset with the flush.
                engine.pool.force_all(&engine.volumes)?;
            }
            if engine.txns.active_count() > 0 {
                run_undo(engine)?;
                engine.chkpt.take(
                    &engine.log,
                    &engine.pool,
                    &engine.txns,
                    &engine.volumes,
                )?;
            }
            engine.recovery.finish();
            tracing::info!("restart successful");
        }
        RecoveryMode::ConcurrentCommitLsn => {
            let redo_end = engine.log.curr_lsn();
            engine.recovery.arm(&outcome, redo_end);
            let engine2 = Arc::clone(engine);
            let handle = std::thread::Builder::new()
                .name("ember-restart".into())
                .spawn(move || {
                    if let Err(e) = restart_thread_body(&engine2) {
                        tracing::error!(error = %e, "restart thread failed");
                    }
                    engine2.recovery.finish();
                })
                .map_err(|e| fatal(format!("spawn restart thread: {e}")))?;
            engine.set_restart_thread(handle);
            tracing::info!("store open during recovery, commit fence at {}", outcome.commit_lsn);
        }
        RecoveryMode::ConcurrentLock => {
            // Contract: doomed transactions' locks would be acquired here
            // during Analysis and released during Undo.
            return Err(EngineError::NotImplemented("concurrent lock recovery"));
        }
    }
    Ok(outcome)
}

/// Body of the restart thread: Redo, then Undo, with a checkpoint after
/// each phase.
fn restart_thread_body(engine: &Arc<Engine>) -> Result<()> {
    let outcome = AnalysisOutcome {
        redo_lsn: Lsn::from_raw(engine.recovery.redo_lsn_raw.load(Ordering::SeqCst)),
        undo_lsn: Lsn::NULL,
        commit_lsn: engine.recovery.commit_lsn(),
        last_lsn: engine.recovery.last_lsn(),
        in_doubt_count: engine.recovery.in_doubt.load(Ordering::SeqCst),
    };
    let redo_end = Lsn::from_raw(engine.recovery.redo_end_raw.load(Ordering::SeqCst));

    if outcome.in_doubt_count > 0 {
        run_redo(engine, &outcome, redo_end, false)?;
    }
    engine.chkpt.take(&engine.log, &engine.pool, &engine.txns, &engine.volumes)?;

    if engine.txns.doomed_count() > 0 {
        run_undo(engine)?;
    }
    engine.recovery.clear_commit_lsn();
    engine.chkpt.take(&engine.log, &engine.pool, &engine.txns, &engine.volumes)?;
    tracing::info!("concurrent restart finished");
    Ok(())
}

fn run_redo(
    engine: &Engine,
    outcome: &AnalysisOutcome,
    redo_end: Lsn,
    serial: bool,
) -> Result<()> {
    match engine.config.redo_mode {
        RedoMode::LogDriven => {
            redo_log_pass(engine, outcome.redo_lsn, redo_end, outcome.in_doubt_count, serial)
        }
        RedoMode::PageDriven => redo_page_pass(engine, outcome.last_lsn, serial),
        RedoMode::SprOnDemand => {
            Err(EngineError::NotImplemented("bulk on-demand redo"))
        }
    }
}

fn run_undo(engine: &Engine) -> Result<()> {
    match engine.config.undo_mode {
        UndoMode::Reverse => undo_reverse_pass(engine),
        UndoMode::Transaction => undo_txn_pass(engine),
    }
}

// ======================================================================
// Analysis
// ======================================================================

fn apply_mount_record(volumes: &VolumeManager, rec: &LogRecord) -> Result<()> {
    let body = DeviceTableBody::decode(&rec.payload)?;
    for (path, vid) in &body.devices {
        match rec.rtype {
            RecordType::MountVolume => volumes.mount(path, *vid)?,
            RecordType::DismountVolume => volumes.dismount(*vid)?,
            _ => return Err(fatal("not a device record")),
        }
    }
    Ok(())
}

/// Forward scan from the master checkpoint. Rebuilds the transaction
/// table and the in-doubt page set; emits no log records.
pub(crate) fn analysis_pass(engine: &Arc<Engine>) -> Result<AnalysisOutcome> {
    let log = &engine.log;
    let pool = &engine.pool;
    let txns = &engine.txns;
    let volumes = &engine.volumes;

    let master = log.master_lsn();
    if master.is_null() {
        // Brand-new database: nothing to analyze.
        return Ok(AnalysisOutcome::empty());
    }

    // Ceiling for commit_lsn and for doomed first_lsn values that get
    // lowered as earlier records are found.
    let max_lsn = log.curr_lsn().advance(1);
    let mut commit_lsn = max_lsn;
    let mut redo_lsn = Lsn::NULL;
    let mut undo_lsn = Lsn::NULL;
    let mut last_lsn;
    let mut in_doubt_count: u32 = 0;
    let mut num_chkpt_end_handled = 0u32;
    let mut mounted_any = false;

    let mut scan = log.scan_forward(master);

    // The first record must be the master's begin_chkpt; anything else
    // means the master pointer is lying and the log is malformed.
    let Some((first_lsn, first)) = scan.next()? else {
        return Err(fatal("master points past the end of the log"));
    };
    if first.rtype != RecordType::BeginCheckpoint {
        return Err(fatal(format!(
            "first record under master is {:?}, not begin_chkpt",
            first.rtype
        )));
    }
    let mut last_mount_lsn = BeginCheckpointBody::decode(&first.payload)?.last_mount_lsn;
    last_lsn = first_lsn;

    while let Some((lsn, rec)) = scan.next()? {
        last_lsn = lsn;

        // Single-log system transactions self-commit: synthesize a
        // descriptor, account their page effects, mark them ended.
        if rec.is_single_sys_xct() {
            let tid = txns.begin();
            txns.with_mut(tid, |d| {
                d.sys_xct = true;
                d.single_log_sys_xct = true;
                d.doomed = true;
                d.last_lsn = lsn;
            })?;

            if rec.is_page_allocate() || rec.is_page_deallocate() {
                // Allocation may be followed by a non-logged use, and
                // deallocation frees the slot: either way the page is no
                // longer in doubt.
                if let Some(idx) = pool.lookup(rec.pid) {
                    if pool.is_in_doubt(idx) {
                        pool.clear_in_doubt(idx, rec.is_page_allocate());
                        if in_doubt_count == 0 {
                            return Err(fatal("in-doubt count underflow in analysis"));
                        }
                        in_doubt_count -= 1;
                    }
                }
            } else if !rec.is_skip() {
                if rec.null_pid() {
                    return Err(fatal(format!(
                        "system transaction record {:?} without a page",
                        rec.rtype
                    )));
                }
                let idx = pool.register_and_mark(rec.pid, lsn, &mut in_doubt_count)?;
                pool.set_expected_emlsn(idx, lsn);
                if rec.is_multi_page() {
                    if rec.page2 == 0 {
                        return Err(fatal("multi-page system record with page2 = 0"));
                    }
                    let idx2 = pool.register_and_mark(rec.pid2(), lsn, &mut in_doubt_count)?;
                    pool.set_expected_emlsn(idx2, lsn);
                }
            }
            txns.set_state(tid, TxnState::Ended)?;
            continue;
        }

        // Any transaction named by the log gets a descriptor, presumed
        // doomed until a terminal record proves otherwise.
        let has_tid = rec.tid != 0;
        if has_tid
            && !txns.contains(rec.tid)
            && rec.rtype != RecordType::Comment
            && !rec.is_skip()
            && rec.rtype != RecordType::Max
        {
            txns.insert(TxnDescriptor::doomed(
                rec.tid,
                lsn,
                if rec.is_undo() { lsn } else { Lsn::NULL },
                max_lsn,
            ));
        } else if has_tid && txns.contains(rec.tid) {
            txns.with_mut(rec.tid, |d| d.last_lsn = lsn)?;
        }

        match rec.rtype {
            // A second (complete or incomplete) checkpoint may follow the
            // master one; everything it wrote is ignored via
            // num_chkpt_end_handled.
            RecordType::BeginCheckpoint => {}

            RecordType::CheckpointBufferTable => {
                if num_chkpt_end_handled == 0 {
                    for e in BufferTableBody::decode(&rec.payload)?.pages {
                        pool.register_and_mark(e.pid, e.rec_lsn, &mut in_doubt_count)?;
                    }
                }
            }

            RecordType::CheckpointTxnTable => {
                if num_chkpt_end_handled == 0 {
                    let body = TxnTableBody::decode(&rec.payload)?;
                    txns.update_youngest(body.youngest);
                    for e in body.txns {
                        match txns.get(e.tid) {
                            None => {
                                // A transaction may end after being captured
                                // but before the checkpoint record was
                                // written; its ended state in the table must
                                // win, so only non-ended entries are added.
                                if e.state != TxnState::Ended {
                                    let mut d = TxnDescriptor::doomed(
                                        e.tid, e.last_lsn, e.undo_nxt, max_lsn,
                                    );
                                    d.first_lsn = e.first_lsn;
                                    txns.insert(d);
                                }
                            }
                            Some(d) => {
                                if d.state != TxnState::Active && d.state != TxnState::Ended {
                                    return Err(fatal(format!(
                                        "transaction {} in state {} during analysis",
                                        d.tid, d.state
                                    )));
                                }
                            }
                        }
                    }
                }
            }

            RecordType::CheckpointDeviceTable => {
                if num_chkpt_end_handled == 0 {
                    // Devices first: mounting is what makes pages readable.
                    for (path, vid) in DeviceTableBody::decode(&rec.payload)?.devices {
                        volumes.mount(&path, vid)?;
                        mounted_any = true;
                    }
                }
            }

            RecordType::MountVolume | RecordType::DismountVolume => {
                // Replay mounts below the redo point so the device set is
                // right when Redo starts; later ones replay during Redo.
                if !redo_lsn.is_null() && lsn < redo_lsn {
                    apply_mount_record(volumes, &rec)?;
                    if rec.rtype == RecordType::MountVolume {
                        mounted_any = true;
                    }
                }
            }

            RecordType::EndCheckpoint => {
                if num_chkpt_end_handled == 0 {
                    let body = EndCheckpointBody::decode(&rec.payload)?;
                    if body.begin_lsn != master {
                        return Err(fatal(format!(
                            "end_chkpt names begin {} but master is {}",
                            body.begin_lsn, master
                        )));
                    }
                    redo_lsn = body.min_rec_lsn;
                    undo_lsn = body.min_xct_lsn;
                }
                num_chkpt_end_handled += 1;
            }

            RecordType::TxnFreeingSpace => {
                // The commit was in flight; during restart the transaction
                // is simply over.
                txns.set_state(rec.tid, TxnState::Ended)?;
            }

            RecordType::TxnEndGroup => {
                for tid in TxnEndGroupBody::decode(&rec.payload)?.tids {
                    if txns.contains(tid) {
                        txns.set_state(tid, TxnState::Ended)?;
                    }
                }
            }

            RecordType::TxnEnd | RecordType::TxnAbort => {
                txns.set_state(rec.tid, TxnState::Ended)?;
            }

            RecordType::Compensate => {
                if rec.is_undo() {
                    return Err(fatal("encountered undoable compensation record"));
                }
                // Reverse Undo resumes at the CLR (and follows its
                // undo_next); transaction-driven Undo treats a trailing CLR
                // as a completed rollback.
                match engine.config.undo_mode {
                    UndoMode::Reverse => txns.with_mut(rec.tid, |d| d.undo_nxt = lsn)?,
                    UndoMode::Transaction => {
                        txns.with_mut(rec.tid, |d| d.undo_nxt = Lsn::NULL)?
                    }
                }
                if rec.is_redo() {
                    let idx = pool.register_and_mark(rec.pid, lsn, &mut in_doubt_count)?;
                    pool.set_expected_emlsn(idx, lsn);
                }
            }

            RecordType::PageSetToBeDeleted
            | RecordType::BtreeInsert
            | RecordType::BtreeInsertNonGhost
            | RecordType::BtreeUpdate
            | RecordType::BtreeOverwrite
            | RecordType::BtreeGhostMark
            | RecordType::BtreeGhostReclaim
            | RecordType::BtreeGhostReserve => {
                if rec.is_undo() {
                    txns.with_mut(rec.tid, |d| d.undo_nxt = lsn)?;
                }
                if !rec.is_redo() {
                    return Err(fatal(format!("page update {:?} not redoable", rec.rtype)));
                }
                if rec.is_page_deallocate() {
                    if let Some(idx) = pool.lookup(rec.pid) {
                        if pool.is_in_doubt(idx) {
                            pool.clear_in_doubt(idx, false);
                            in_doubt_count -= 1;
                        }
                    }
                } else {
                    let idx = pool.register_and_mark(rec.pid, lsn, &mut in_doubt_count)?;
                    pool.set_expected_emlsn(idx, lsn);
                }
            }

            RecordType::Comment | RecordType::Skip | RecordType::Max => {}

            other => {
                return Err(fatal(format!(
                    "unexpected record type {other:?} during analysis"
                )));
            }
        }

        // Earliest record of the transaction seen so far.
        if has_tid {
            if let Some(d) = txns.get(rec.tid) {
                if lsn < d.first_lsn {
                    txns.with_mut(rec.tid, |x| x.first_lsn = lsn)?;
                }
            }
        }
    }

    // The scan always starts at a complete checkpoint, so both floors
    // must have been found.
    if redo_lsn.is_null() {
        return Err(fatal("missing redo_lsn at the end of log analysis"));
    }
    if undo_lsn.is_null() {
        return Err(fatal("missing undo_lsn at the end of log analysis"));
    }
    if redo_lsn > master {
        redo_lsn = master;
    }
    if undo_lsn > master {
        undo_lsn = master;
    }

    // Mounts between redo_lsn and the checkpoint's last mount must be
    // walked back so the device set matches the redo start point. Going
    // backward, a dismount record means the device was mounted before it.
    if in_doubt_count != 0 {
        while !last_mount_lsn.is_null() && last_mount_lsn > redo_lsn {
            let (rec, _) = log.fetch(last_mount_lsn)?;
            let body = DeviceTableBody::decode(&rec.payload)?;
            for (path, vid) in &body.devices {
                match rec.rtype {
                    RecordType::DismountVolume => {
                        let _ = volumes.mount(path, *vid);
                        mounted_any = true;
                    }
                    RecordType::MountVolume => {
                        let _ = volumes.dismount(*vid);
                    }
                    other => {
                        return Err(fatal(format!(
                            "mount chain reached non-device record {other:?}"
                        )));
                    }
                }
            }
            last_mount_lsn = rec.xid_prev;
        }
        volumes.set_last_mount_lsn(last_mount_lsn);
    }

    // Destroy ended descriptors; what survives is doomed and active, and
    // the earliest first_lsn among them fences concurrent commits.
    for d in txns.snapshot() {
        match d.state {
            TxnState::Ended => {
                txns.destroy(d.tid);
            }
            TxnState::Active => {
                if !d.first_lsn.is_null() && d.first_lsn < commit_lsn {
                    commit_lsn = d.first_lsn;
                }
            }
            other => {
                return Err(fatal(format!(
                    "transaction {} in state {other} after analysis",
                    d.tid
                )));
            }
        }
    }
    if commit_lsn == max_lsn {
        commit_lsn = Lsn::NULL;
    }

    if in_doubt_count > 0 && !mounted_any {
        tracing::warn!("in-doubt pages but no device mounted during analysis");
    }

    Ok(AnalysisOutcome { redo_lsn, undo_lsn, commit_lsn, last_lsn, in_doubt_count })
}

// ======================================================================
// Redo
// ======================================================================

/// Log-driven Redo: forward scan from `redo_lsn`, applying each record to
/// its page when the page has not seen it.
pub(crate) fn redo_log_pass(
    engine: &Engine,
    redo_lsn: Lsn,
    end_lsn: Lsn,
    in_doubt_count: u32,
    serial: bool,
) -> Result<()> {
    if in_doubt_count == 0 {
        return Ok(());
    }
    tracing::info!(from = %redo_lsn, to = %end_lsn, "redo (log driven)");

    let mut dirty_count: u32 = 0;
    let mut scan = engine.log.scan_forward(redo_lsn);
    while let Some((lsn, rec)) = scan.next()? {
        // Concurrent user transactions append past the pre-open end; the
        // recovery scan stops there.
        if lsn >= end_lsn {
            break;
        }
        if !rec.is_redo() {
            continue;
        }
        if rec.null_pid() {
            match rec.rtype {
                RecordType::MountVolume | RecordType::DismountVolume => {
                    apply_mount_record(&engine.volumes, &rec)?;
                    engine.volumes.set_last_mount_lsn(lsn);
                }
                _ => {
                    // A tid-bearing redo record with no page replays only
                    // while its transaction is still in the table; none of
                    // the current record family needs body work here.
                    if rec.tid != 0 {
                        if let Some(d) = engine.txns.get(rec.tid) {
                            if d.state != TxnState::Active {
                                return Err(fatal(format!(
                                    "no-page redo for transaction {} in state {}",
                                    rec.tid, d.state
                                )));
                            }
                        }
                    }
                }
            }
            continue;
        }
        redo_record_on_page(engine, &rec, lsn, false, end_lsn, serial, &mut dirty_count)?;
        if rec.is_multi_page() {
            redo_record_on_page(engine, &rec, lsn, true, end_lsn, serial, &mut dirty_count)?;
        }
    }

    if dirty_count != in_doubt_count {
        // In concurrent mode user transactions recover contended pages on
        // demand, so the scan may legitimately convert fewer pages; the
        // count must still close out to zero in-doubt overall.
        if serial || engine.pool.in_doubt_count() > 0 {
            return Err(fatal(format!(
                "redo left {dirty_count} dirty pages for {in_doubt_count} in-doubt"
            )));
        }
    }
    tracing::info!(pages = dirty_count, "redo complete");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn redo_record_on_page(
    engine: &Engine,
    rec: &LogRecord,
    lsn: Lsn,
    second_page: bool,
    end_lsn: Lsn,
    serial: bool,
    dirty_count: &mut u32,
) -> Result<()> {
    let pool = &engine.pool;
    let pid = if second_page { rec.pid2() } else { rec.pid };

    let Some(idx) = pool.lookup(pid) else {
        // Once in doubt a page cannot leave the pool except by
        // deallocation (and an allocated page may simply never have been
        // marked); anything else missing is corruption.
        if rec.is_page_deallocate() || rec.is_page_allocate() {
            return Ok(());
        }
        return Err(fatal(format!("page {pid} not in pool during redo")));
    };

    // Allocation state lives in the allocation map, not the page body:
    // nothing to apply, and the page stays in doubt for its format record.
    if rec.is_page_allocate() {
        return Ok(());
    }
    if rec.is_page_deallocate() {
        return Err(fatal(format!(
            "deallocated page {pid} still registered during redo"
        )));
    }

    // Immediate-timeout latch: uncontended in serial mode; in concurrent
    // mode a miss means some user transaction is recovering the page on
    // demand, and it is skipped here.
    let mut frame = match pool.cb(idx).latch.try_write() {
        Some(g) => g,
        None => {
            if serial {
                return Err(fatal("page latch contended during serial redo"));
            }
            return Ok(());
        }
    };

    let was_in_doubt = pool.is_in_doubt(idx);
    if !was_in_doubt && !pool.is_dirty(idx) {
        return Err(fatal(format!(
            "page {pid} neither in-doubt nor dirty during redo"
        )));
    }

    // A format record (or the second page of a norec-alloc) births the
    // page: there is nothing on disk worth reading for it.
    let virgin_rec = rec.rtype == RecordType::PageImgFormat
        || (rec.rtype == RecordType::BtreeNorecAlloc && second_page);

    let mut loaded_now = false;
    let mut corrupted = false;
    if was_in_doubt && frame.is_none() {
        loaded_now = true;
        if virgin_rec {
            *frame = Some(Page::new(pid));
        } else {
            match pool.load_for_redo(idx, &engine.volumes, &mut frame) {
                Ok(_past_end) => {}
                Err(EngineError::BadChecksum(reason)) => {
                    tracing::warn!(page = %pid, %reason, "corrupted page, recovering via SPR");
                    *frame = Some(Page::new(pid));
                    corrupted = true;
                }
                Err(e) => return Err(e),
            }
        }
    }

    let page = frame
        .as_mut()
        .ok_or_else(|| fatal(format!("page {pid} has no body during redo")))?;

    if corrupted {
        // The record's own LSN is the expected end: everything at or
        // before it must already be in the log. The page's history may
        // predate its rec_lsn (it was flushed and re-dirtied), so the
        // replay starts at the oldest retained partition.
        page.page_lsn = Lsn::NULL;
        let floor = engine.log.earliest_lsn();
        spr::recover_single_page(&engine.log, page, floor, lsn, true)?;
        pool.note_redo(idx, page.page_lsn);
    } else {
        let page_lsn = page.page_lsn;
        if page_lsn < lsn {
            crate::page::apply_redo(rec, page)?;
            page.page_lsn = lsn;
            pool.note_redo(idx, lsn);
        } else if page_lsn >= end_lsn && !page_lsn.is_null() {
            // The page claims a write the log has never seen: WAL was
            // violated somewhere.
            return Err(fatal(format!(
                "page {pid} has lsn {page_lsn} beyond log end {end_lsn}"
            )));
        } else if !page_lsn.is_null() {
            // Already applied. Nudge the page LSN so a rescan cannot
            // reconsider this record.
            page.page_lsn = page_lsn.advance(1);
        }
    }

    drop(frame);
    if loaded_now && pool.is_in_doubt(idx) {
        // The body is in memory and reconciled with the log: the page is
        // recovered, whether or not this particular record applied.
        pool.in_doubt_to_dirty(idx);
        *dirty_count += 1;
    }
    Ok(())
}

/// Page-driven Redo: iterate the control blocks and recover each in-doubt
/// page independently with single-page recovery.
pub(crate) fn redo_page_pass(engine: &Engine, analysis_last: Lsn, serial: bool) -> Result<()> {
    tracing::info!("redo (page driven)");
    let pool = &engine.pool;
    let mut recovered = 0u32;
    for idx in 1..pool.capacity() {
        if !pool.is_in_doubt(idx) {
            continue;
        }
        let mut frame = match pool.cb(idx).latch.try_write() {
            Some(g) => g,
            None => {
                if serial {
                    return Err(fatal("page latch contended during serial redo"));
                }
                // A user transaction holds the page: on-demand recovery
                // will finish it.
                continue;
            }
        };
        if !pool.is_in_doubt(idx) {
            continue;
        }
        recover_cb_via_spr(engine, idx, &mut frame, analysis_last)?;
        drop(frame);
        pool.in_doubt_to_dirty(idx);
        recovered += 1;
    }
    tracing::info!(pages = recovered, "redo complete");
    Ok(())
}

/// Shared by page-driven Redo and on-demand recovery: load one in-doubt
/// page (virgin and corrupted cases included) and replay its log slice.
pub(crate) fn recover_cb_via_spr(
    engine: &Engine,
    idx: usize,
    frame: &mut Option<Page>,
    analysis_last: Lsn,
) -> Result<()> {
    let pool = &engine.pool;
    let meta = pool.meta(idx);
    let pid = meta.pid;

    let mut fresh = false;
    if frame.is_none() {
        match pool.load_for_redo(idx, &engine.volumes, frame) {
            Ok(_past_end) => {}
            Err(EngineError::BadChecksum(reason)) => {
                tracing::warn!(page = %pid, %reason, "corrupted page, recovering via SPR");
                *frame = Some(Page::new(pid));
                fresh = true;
            }
            Err(e) => return Err(e),
        }
    }
    let page = frame
        .as_mut()
        .ok_or_else(|| fatal(format!("page {pid} has no body to recover")))?;
    if fresh {
        page.page_lsn = Lsn::NULL;
    }

    // The last LSN Analysis saw for the page is the expected end; pages
    // known only from the checkpoint's buffer table fall back to the end
    // of the analyzed log, unverified.
    let (emlsn, verify) = match pool.take_expected_emlsn(idx) {
        Some(e) => (e, true),
        None => (analysis_last, false),
    };
    if page.page_lsn >= emlsn && !page.page_lsn.is_null() {
        // On-disk image already covers the whole slice (flushed right
        // before the crash); nothing to replay.
        pool.note_redo(idx, page.page_lsn);
        return Ok(());
    }
    // A corrupted page's history may predate its rec_lsn window; replay
    // from the oldest retained partition. An intact or virgin page needs
    // nothing older than its rec_lsn.
    let floor = if fresh || meta.rec_lsn.is_null() {
        engine.log.earliest_lsn()
    } else {
        meta.rec_lsn
    };
    spr::recover_single_page(&engine.log, page, floor, emlsn, verify)?;
    pool.note_redo(idx, page.page_lsn);
    Ok(())
}

// ======================================================================
// Undo
// ======================================================================

/// Reverse-chronological Undo: interleave the doomed transactions'
/// rollbacks so compensation happens in strictly descending LSN order.
pub(crate) fn undo_reverse_pass(engine: &Engine) -> Result<()> {
    let txns = &engine.txns;
    let mut heap = txns.build_undo_heap();
    if heap.is_empty() {
        tracing::debug!("no doomed transactions to undo");
        return Ok(());
    }
    tracing::info!(count = heap.len(), "undo (reverse chronological)");

    while heap.len() > 1 {
        let top = heap.pop().ok_or_else(|| fatal("undo heap underflow"))?;
        if top.undo_nxt.is_null() {
            heap.push(top);
            break;
        }
        let desc = txns
            .get(top.tid)
            .ok_or_else(|| fatal(format!("doomed transaction {} vanished", top.tid)))?;
        if desc.sys_xct {
            txns.with_mut(top.tid, |d| d.undo_nxt = Lsn::NULL)?;
            heap.push(UndoEntry { undo_nxt: Lsn::NULL, tid: top.tid });
            continue;
        }
        // Roll the top back only as far as the runner-up's resume point,
        // like a rollback to savepoint, then re-enter the heap.
        let stop = heap.peek().map(|e| e.undo_nxt).unwrap_or(Lsn::NULL);
        transaction::rollback_to(&engine.log, &engine.pool, txns, top.tid, stop)?;
        let new_nxt = txns
            .get(top.tid)
            .map(|d| d.undo_nxt)
            .unwrap_or(Lsn::NULL);
        heap.push(UndoEntry { undo_nxt: new_nxt, tid: top.tid });
    }

    // Everything is rolled back (or only one transaction remains, whose
    // rollback happens inside abort); finish them off.
    while let Some(e) = heap.pop() {
        transaction::abort(&engine.log, &engine.pool, txns, e.tid)?;
    }

    engine.log.flush_all()?;
    Ok(())
}

/// Transaction-driven Undo: abort each doomed transaction independently.
pub(crate) fn undo_txn_pass(engine: &Engine) -> Result<()> {
    let doomed = engine.txns.doomed_actives();
    if doomed.is_empty() {
        tracing::debug!("no doomed transactions to undo");
        return Ok(());
    }
    tracing::info!(count = doomed.len(), "undo (transaction driven)");
    for d in doomed {
        transaction::abort(&engine.log, &engine.pool, &engine.txns, d.tid)?;
    }
    engine.log.flush_all()?;
    Ok(())
}
