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

//! Transaction table, descriptors and rollback.
//!
//! Descriptors live in a map keyed by tid; LSN values (`first_lsn`,
//! `last_lsn`, `undo_nxt`) address log content, so there are no pointer
//! cycles anywhere in the transaction graph.
//!
//! Rollback walks the `undo_nxt` chain backward. For every undoable record
//! it emits a compensation record carrying the inverse page operation; the
//! CLR's `undo_next` (its `xid_prev` field) names the undone record's own
//! predecessor, so a later restart skips everything already compensated.
//! Compensation records are redo-only: rollback never undoes an undo.

use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use emberdb_core::{EngineError, Lsn, Result, TxnId, TxnState};

use crate::buffer_pool::BufferPool;
use crate::log_manager::LogManager;
use crate::log_record::LogRecord;
use crate::page;

#[derive(Debug, Clone)]
pub struct TxnDescriptor {
    pub tid: TxnId,
    pub state: TxnState,
    pub first_lsn: Lsn,
    pub last_lsn: Lsn,
    pub undo_nxt: Lsn,
    pub sys_xct: bool,
    pub single_log_sys_xct: bool,
    /// In flight at the crash; will be rolled back during Undo.
    pub doomed: bool,
    /// Log bytes reserved so this transaction's abort can always complete.
    pub log_reserve: u64,
}

impl TxnDescriptor {
    pub fn new(tid: TxnId) -> TxnDescriptor {
        TxnDescriptor {
            tid,
            state: TxnState::Active,
            first_lsn: Lsn::NULL,
            last_lsn: Lsn::NULL,
            undo_nxt: Lsn::NULL,
            sys_xct: false,
            single_log_sys_xct: false,
            doomed: false,
            log_reserve: 0,
        }
    }

    /// A doomed descriptor reconstructed during Analysis. `first_lsn`
    /// starts at the given ceiling and is lowered as earlier records of
    /// the transaction are seen.
    pub fn doomed(tid: TxnId, last_lsn: Lsn, undo_nxt: Lsn, first_ceiling: Lsn) -> TxnDescriptor {
        TxnDescriptor {
            tid,
            state: TxnState::Active,
            first_lsn: first_ceiling,
            last_lsn,
            undo_nxt,
            sys_xct: false,
            single_log_sys_xct: false,
            doomed: true,
            log_reserve: 0,
        }
    }
}

/// Heap entry for reverse-chronological Undo: largest `undo_nxt` first,
/// ties broken by tid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct UndoEntry {
    pub undo_nxt: Lsn,
    pub tid: TxnId,
}

pub struct TransactionTable {
    map: RwLock<HashMap<TxnId, TxnDescriptor>>,
    youngest: AtomicU64,
}

impl TransactionTable {
    pub fn new() -> TransactionTable {
        TransactionTable { map: RwLock::new(HashMap::new()), youngest: AtomicU64::new(0) }
    }

    /// Start a new user transaction with the next tid.
    pub fn begin(&self) -> TxnId {
        let tid = self.youngest.fetch_add(1, Ordering::SeqCst) + 1;
        self.map.write().insert(tid, TxnDescriptor::new(tid));
        tid
    }

    /// Insert a descriptor rebuilt by recovery.
    pub fn insert(&self, desc: TxnDescriptor) {
        self.update_youngest(desc.tid);
        self.map.write().insert(desc.tid, desc);
    }

    pub fn get(&self, tid: TxnId) -> Option<TxnDescriptor> {
        self.map.read().get(&tid).cloned()
    }

    pub fn contains(&self, tid: TxnId) -> bool {
        self.map.read().contains_key(&tid)
    }

    pub fn with_mut<R>(&self, tid: TxnId, f: impl FnOnce(&mut TxnDescriptor) -> R) -> Result<R> {
        let mut map = self.map.write();
        let desc = map.get_mut(&tid).ok_or_else(|| {
            EngineError::Fatal(format!("transaction {tid} not in table"))
        })?;
        Ok(f(desc))
    }

    pub fn set_state(&self, tid: TxnId, state: TxnState) -> Result<()> {
        self.with_mut(tid, |d| d.state = state)
    }

    /// Bookkeeping after this transaction logged a record: advance
    /// `last_lsn`, set `first_lsn` on the first record, remember
    /// `undo_nxt` when the record is undoable.
    pub fn on_log(&self, tid: TxnId, lsn: Lsn, undoable: bool) -> Result<()> {
        self.with_mut(tid, |d| {
            if d.first_lsn.is_null() {
                d.first_lsn = lsn;
            }
            d.last_lsn = lsn;
            if undoable {
                d.undo_nxt = lsn;
            }
        })
    }

    pub fn destroy(&self, tid: TxnId) -> Option<TxnDescriptor> {
        self.map.write().remove(&tid)
    }

    pub fn update_youngest(&self, tid: TxnId) {
        self.youngest.fetch_max(tid, Ordering::SeqCst);
    }

    pub fn youngest(&self) -> TxnId {
        self.youngest.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.map
            .read()
            .values()
            .filter(|d| d.state == TxnState::Active)
            .count()
    }

    pub fn snapshot(&self) -> Vec<TxnDescriptor> {
        let mut out: Vec<_> = self.map.read().values().cloned().collect();
        out.sort_by_key(|d| d.tid);
        out
    }

    pub fn doomed_count(&self) -> usize {
        self.map
            .read()
            .values()
            .filter(|d| d.doomed && d.state == TxnState::Active)
            .count()
    }

    /// The doomed transactions still active: Undo's work list.
    pub fn doomed_actives(&self) -> Vec<TxnDescriptor> {
        let mut out: Vec<_> = self
            .map
            .read()
            .values()
            .filter(|d| d.doomed && d.state == TxnState::Active)
            .cloned()
            .collect();
        out.sort_by_key(|d| d.tid);
        out
    }

    /// Build the reverse-Undo heap. Single-log system transactions never
    /// reach it; defensively, force their `undo_nxt` to null.
    pub fn build_undo_heap(&self) -> BinaryHeap<UndoEntry> {
        let mut map = self.map.write();
        let mut heap = BinaryHeap::new();
        for d in map.values_mut() {
            if d.state != TxnState::Active || !d.doomed {
                continue;
            }
            if d.sys_xct {
                d.undo_nxt = Lsn::NULL;
            }
            heap.push(UndoEntry { undo_nxt: d.undo_nxt, tid: d.tid });
        }
        heap
    }
}

impl Default for TransactionTable {
    fn default() -> Self {
        Self::new()
    }
}

// ======================================================================
// Rollback
// ======================================================================

/// Roll the transaction back to (but not past) `stop_lsn`: undo every
/// record on the `undo_nxt` chain with an LSN strictly above it, emitting
/// one compensation record per undone update. `Lsn::NULL` rolls back the
/// whole transaction.
pub fn rollback_to(
    log: &LogManager,
    pool: &BufferPool,
    txns: &TransactionTable,
    tid: TxnId,
    stop_lsn: Lsn,
) -> Result<()> {
    loop {
        let undo_nxt = txns
            .get(tid)
            .ok_or_else(|| EngineError::Fatal(format!("transaction {tid} not in table")))?
            .undo_nxt;
        if undo_nxt.is_null() || undo_nxt <= stop_lsn {
            return Ok(());
        }
        let (rec, _) = log.fetch(undo_nxt)?;
        if rec.tid != tid {
            return Err(EngineError::Fatal(format!(
                "undo chain of {tid} reached record of transaction {}",
                rec.tid
            )));
        }
        if rec.is_cpsn() {
            // Compensation records are redo-only by contract; one marked
            // undoable means the chain is corrupt, exactly as in Analysis.
            if rec.is_undo() {
                return Err(EngineError::Fatal(
                    "encountered undoable compensation record".into(),
                ));
            }
            // Follow its undo_next and skip the already-compensated range.
            txns.with_mut(tid, |d| d.undo_nxt = rec.xid_prev)?;
            continue;
        }
        if !rec.is_undo() {
            txns.with_mut(tid, |d| d.undo_nxt = rec.xid_prev)?;
            continue;
        }

        let inverse = page::undo_op(&rec)?;
        let idx = pool.lookup(rec.pid).ok_or_else(|| {
            EngineError::Fatal(format!("page {} missing from pool during undo", rec.pid))
        })?;
        let mut frame = pool.cb(idx).latch.write();
        let body = frame.as_mut().ok_or_else(|| {
            EngineError::Fatal(format!("page {} body not loaded during undo", rec.pid))
        })?;

        // The CLR draws on the transaction's reserved space so the abort
        // cannot die for lack of log.
        let clr = LogRecord::compensate(tid, rec.pid, &inverse, rec.xid_prev);
        let clr_lsn = log.insert_reserved(clr)?;
        page::apply_op(body, &inverse)?;
        body.page_lsn = clr_lsn;
        drop(frame);

        pool.note_write(idx, clr_lsn);
        txns.with_mut(tid, |d| {
            d.last_lsn = clr_lsn;
            d.undo_nxt = rec.xid_prev;
        })?;
    }
}

/// Abort a transaction: roll everything back, write the terminal abort
/// record, flush it, release the descriptor.
pub fn abort(
    log: &LogManager,
    pool: &BufferPool,
    txns: &TransactionTable,
    tid: TxnId,
) -> Result<()> {
    txns.set_state(tid, TxnState::Aborting)?;
    rollback_to(log, pool, txns, tid, Lsn::NULL)?;
    let last = txns.get(tid).map(|d| d.last_lsn).unwrap_or(Lsn::NULL);
    let lsn = log.insert_reserved(LogRecord::txn_abort(tid, last))?;
    log.flush(lsn, true)?;
    txns.set_state(tid, TxnState::Ended)?;
    if let Some(desc) = txns.destroy(tid) {
        if desc.log_reserve > 0 {
            log.release_space(desc.log_reserve);
        }
    }
    Ok(())
}
