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

//! Fuzzy checkpoints.
//!
//! A checkpoint runs without quiescing anything. It brackets a snapshot of
//! the device table, the dirty/in-doubt pages and the transaction table
//! between `begin_chkpt` and `end_chkpt`, flushes through the end record,
//! and only then moves the master pointer to the begin LSN.
//!
//! Record order matters: devices come before pages, because mounting is
//! what makes pages resolvable when Analysis replays the tables.
//!
//! The master update is deliberately a separate step (`publish`). A crash
//! after `end_chkpt` hardens but before `publish` leaves two complete
//! checkpoints on disk with the master still naming the older one;
//! Analysis handles that by honoring only the first `end_chkpt` it meets.

use parking_lot::Mutex;
use serde::Serialize;
use emberdb_core::{Lsn, Result, TxnState};

use crate::buffer_pool::BufferPool;
use crate::log_manager::LogManager;
use crate::log_record::{
    BeginCheckpointBody, BufferTableBody, DeviceTableBody, EndCheckpointBody, LogRecord,
    TxnTableBody, XctEntry,
};
use crate::transaction::TransactionTable;
use crate::volume::VolumeManager;

/// Entries per chkpt_bf_tab / chkpt_xct_tab record; large tables span
/// multiple records.
const CHUNK: usize = 64;

/// Result of writing the checkpoint's record bracket.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CheckpointHandle {
    pub begin_lsn: Lsn,
    pub min_rec_lsn: Lsn,
    pub min_xct_lsn: Lsn,
}

pub struct CheckpointManager {
    /// At most one checkpoint writes at a time.
    mu: Mutex<()>,
}

impl CheckpointManager {
    pub fn new() -> CheckpointManager {
        CheckpointManager { mu: Mutex::new(()) }
    }

    /// Take a complete checkpoint: records, flush, master update, then an
    /// opportunistic scavenge of partitions nothing can need anymore.
    pub fn take(
        &self,
        log: &LogManager,
        pool: &BufferPool,
        txns: &TransactionTable,
        volumes: &VolumeManager,
    ) -> Result<Lsn> {
        let handle = self.write_records(log, pool, txns, volumes)?;
        self.publish(log, handle.begin_lsn)?;
        log.scavenge(handle.min_rec_lsn, handle.min_xct_lsn)?;
        Ok(handle.begin_lsn)
    }

    /// Emit the record bracket and flush through `end_chkpt`. The
    /// checkpoint is not yet the master checkpoint until [`publish`].
    ///
    /// [`publish`]: CheckpointManager::publish
    pub fn write_records(
        &self,
        log: &LogManager,
        pool: &BufferPool,
        txns: &TransactionTable,
        volumes: &VolumeManager,
    ) -> Result<CheckpointHandle> {
        let _g = self.mu.lock();

        let begin_lsn = log.insert(LogRecord::begin_checkpoint(&BeginCheckpointBody {
            last_mount_lsn: volumes.last_mount_lsn(),
        }))?;

        // Devices first.
        let devices = volumes.mounted_devices();
        for chunk in devices.chunks(CHUNK) {
            log.insert(LogRecord::chkpt_device_table(&DeviceTableBody {
                devices: chunk.to_vec(),
            }))?;
        }

        // Dirty and in-doubt pages with their recovery floors.
        let pages = pool.snapshot_dirty();
        let min_rec_lsn = pages
            .iter()
            .map(|e| e.rec_lsn)
            .filter(|l| !l.is_null())
            .min()
            .unwrap_or(begin_lsn);
        for chunk in pages.chunks(CHUNK) {
            log.insert(LogRecord::chkpt_buffer_table(&BufferTableBody {
                pages: chunk.to_vec(),
            }))?;
        }

        // Transaction table. Ended entries are captured too; Analysis
        // knows to skip them.
        let snapshot = txns.snapshot();
        let min_xct_lsn = snapshot
            .iter()
            .filter(|d| d.state != TxnState::Ended)
            .map(|d| d.first_lsn)
            .filter(|l| !l.is_null())
            .min()
            .unwrap_or(begin_lsn);
        let youngest = txns.youngest();
        let entries: Vec<XctEntry> = snapshot
            .iter()
            .map(|d| XctEntry {
                tid: d.tid,
                state: d.state,
                first_lsn: d.first_lsn,
                last_lsn: d.last_lsn,
                undo_nxt: d.undo_nxt,
            })
            .collect();
        if entries.is_empty() {
            log.insert(LogRecord::chkpt_txn_table(&TxnTableBody {
                youngest,
                txns: Vec::new(),
            }))?;
        } else {
            for chunk in entries.chunks(CHUNK) {
                log.insert(LogRecord::chkpt_txn_table(&TxnTableBody {
                    youngest,
                    txns: chunk.to_vec(),
                }))?;
            }
        }

        let end_lsn = log.insert(LogRecord::end_checkpoint(&EndCheckpointBody {
            begin_lsn,
            min_rec_lsn,
            min_xct_lsn,
        }))?;
        log.flush(end_lsn, true)?;

        tracing::debug!(
            begin = %begin_lsn,
            min_rec = %min_rec_lsn,
            min_xct = %min_xct_lsn,
            pages = pages.len(),
            txns = snapshot.len(),
            "checkpoint records written"
        );
        Ok(CheckpointHandle { begin_lsn, min_rec_lsn, min_xct_lsn })
    }

    /// Atomically move the master pointer to this checkpoint's begin LSN,
    /// making it the one Analysis starts from.
    pub fn publish(&self, log: &LogManager, begin_lsn: Lsn) -> Result<()> {
        log.set_master(begin_lsn)
    }
}

impl Default for CheckpointManager {
    fn default() -> Self {
        Self::new()
    }
}
