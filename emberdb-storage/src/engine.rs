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

//! The engine context.
//!
//! All subsystems hang off one `Engine` value passed by reference; there
//! are no process-wide singletons. Construction wires them in dependency
//! order (volumes -> log -> buffer pool -> transactions -> checkpoints)
//! and then runs restart recovery; `shutdown` unwinds in reverse.
//!
//! The forward-processing surface here is the minimum a transactional
//! engine needs for its recovery core to be exercised honestly: begin /
//! commit / abort, page allocation, and logged key-value mutations against
//! slotted pages. During concurrent recovery, page access recovers
//! in-doubt pages on demand and is fenced by the commit LSN.

use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use emberdb_core::{
    BfIdx, EngineConfig, EngineError, Lsn, PageId, Result, TxnId, TxnState,
};

use crate::buffer_pool::BufferPool;
use crate::checkpoint::CheckpointManager;
use crate::log_manager::LogManager;
use crate::log_record::{
    DeviceTableBody, LogRecord, PageOp, RecordType, TxnEndGroupBody,
};
use crate::page::{self, Page};
use crate::recovery::{self, RecoveryStatus};
use crate::transaction::{self, TransactionTable};
use crate::volume::VolumeManager;

/// Control blocks in the pool. Recovery cannot evict, so this bounds how
/// many distinct pages one restart can touch.
const POOL_SLOTS: usize = 1024;

/// Log bytes promised to each transaction so its abort can always run.
const TXN_LOG_RESERVE: u64 = 16 * 1024;

pub struct Engine {
    pub config: EngineConfig,
    pub volumes: VolumeManager,
    pub log: LogManager,
    pub pool: BufferPool,
    pub txns: TransactionTable,
    pub chkpt: CheckpointManager,
    pub(crate) recovery: RecoveryStatus,
    restart_thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

impl Engine {
    /// Open the store: build every subsystem, then run restart recovery.
    /// In serial mode this returns only after the store is fully
    /// recovered; in concurrent mode it returns after Analysis with the
    /// restart thread still working.
    pub fn open(config: EngineConfig) -> Result<Arc<Engine>> {
        std::fs::create_dir_all(&config.log_dir)?;
        std::fs::create_dir_all(&config.data_dir)?;
        let volumes = VolumeManager::new(&config.data_dir)?;
        let log = LogManager::open(&config)?;
        let engine = Arc::new(Engine {
            volumes,
            log,
            pool: BufferPool::new(POOL_SLOTS),
            txns: TransactionTable::new(),
            chkpt: CheckpointManager::new(),
            recovery: RecoveryStatus::new(),
            restart_thread: Mutex::new(None),
            config,
        });
        recovery::recover(&engine)?;
        Ok(engine)
    }

    pub(crate) fn set_restart_thread(&self, handle: JoinHandle<()>) {
        *self.restart_thread.lock() = Some(handle);
    }

    /// Block until a concurrent restart thread (if any) finishes.
    pub fn wait_for_restart(&self) {
        if let Some(handle) = self.restart_thread.lock().take() {
            let _ = handle.join();
        }
    }

    pub fn recovery_active(&self) -> bool {
        self.recovery.is_active()
    }

    /// The commit fence while concurrent recovery runs; null once Undo has
    /// cleared it.
    pub fn commit_fence(&self) -> Lsn {
        self.recovery.commit_lsn()
    }

    // ------------------------------------------------------------------
    // devices
    // ------------------------------------------------------------------

    /// Mount a volume and log the mount so recovery can rebuild the
    /// device set.
    pub fn mount_volume(&self, path: &str, vid: u32) -> Result<()> {
        self.volumes.mount(path, vid)?;
        let body = DeviceTableBody::one(path, vid);
        let lsn = self
            .log
            .insert(LogRecord::mount_volume(&body, self.volumes.last_mount_lsn()))?;
        self.volumes.set_last_mount_lsn(lsn);
        Ok(())
    }

    pub fn dismount_volume(&self, path: &str, vid: u32) -> Result<()> {
        self.volumes.dismount(vid)?;
        let body = DeviceTableBody::one(path, vid);
        let lsn = self
            .log
            .insert(LogRecord::dismount_volume(&body, self.volumes.last_mount_lsn()))?;
        self.volumes.set_last_mount_lsn(lsn);
        Ok(())
    }

    // ------------------------------------------------------------------
    // transactions
    // ------------------------------------------------------------------

    pub fn begin(&self) -> Result<TxnId> {
        self.log.reserve_space(TXN_LOG_RESERVE)?;
        let tid = self.txns.begin();
        self.txns.with_mut(tid, |d| d.log_reserve = TXN_LOG_RESERVE)?;
        Ok(tid)
    }

    /// Commit: freeing-space record, terminal end record, flush through
    /// it, then release the descriptor and its log reservation.
    pub fn commit(&self, tid: TxnId) -> Result<()> {
        let last = self.descriptor(tid)?.last_lsn;
        let fs = self.log.insert(LogRecord::txn_freeing_space(tid, last))?;
        self.txns.set_state(tid, TxnState::FreeingSpace)?;
        self.txns.on_log(tid, fs, false)?;
        let end = self.log.insert(LogRecord::txn_end(tid, fs))?;
        self.log.flush(end, true)?;
        self.txns.set_state(tid, TxnState::Ended)?;
        self.release(tid);
        Ok(())
    }

    /// Group commit: one end-group record ends every member with a single
    /// flush.
    pub fn commit_group(&self, tids: &[TxnId]) -> Result<()> {
        if tids.is_empty() {
            return Ok(());
        }
        let body = TxnEndGroupBody { tids: tids.to_vec() };
        let lsn = self
            .log
            .insert(LogRecord::txn_end_group(&body, 0, Lsn::NULL))?;
        self.log.flush(lsn, true)?;
        for &tid in tids {
            self.txns.set_state(tid, TxnState::Ended)?;
            self.release(tid);
        }
        Ok(())
    }

    pub fn abort(&self, tid: TxnId) -> Result<()> {
        transaction::abort(&self.log, &self.pool, &self.txns, tid)
    }

    /// Roll back to a savepoint (an LSN previously returned by one of this
    /// transaction's updates) without ending the transaction.
    pub fn rollback_to_savepoint(&self, tid: TxnId, savepoint: Lsn) -> Result<()> {
        transaction::rollback_to(&self.log, &self.pool, &self.txns, tid, savepoint)
    }

    fn descriptor(&self, tid: TxnId) -> Result<crate::transaction::TxnDescriptor> {
        self.txns
            .get(tid)
            .ok_or_else(|| EngineError::InvalidArgument(format!("unknown transaction {tid}")))
    }

    fn release(&self, tid: TxnId) {
        if let Some(d) = self.txns.destroy(tid) {
            if d.log_reserve > 0 {
                self.log.release_space(d.log_reserve);
            }
        }
    }

    // ------------------------------------------------------------------
    // pages
    // ------------------------------------------------------------------

    /// Allocate and format a fresh page: an alloc record followed by a
    /// page-image format record, both single-log system transactions.
    pub fn alloc_page(&self, pid: PageId) -> Result<()> {
        if self.pool.lookup(pid).is_some() {
            return Err(EngineError::InvalidArgument(format!(
                "page {pid} already allocated"
            )));
        }
        self.log.insert(LogRecord::alloc_page(pid))?;
        let idx = self.pool.install_new(pid)?;
        let image = Page::new(pid).to_bytes()?;
        let lsn = self.log.insert(LogRecord::page_img_format(pid, &image))?;
        {
            let mut frame = self.pool.cb(idx).latch.write();
            if let Some(page) = frame.as_mut() {
                page.page_lsn = lsn;
            }
        }
        self.pool.note_write(idx, lsn);
        Ok(())
    }

    pub fn dealloc_page(&self, pid: PageId) -> Result<()> {
        let idx = self
            .pool
            .lookup(pid)
            .ok_or_else(|| EngineError::InvalidArgument(format!("page {pid} not allocated")))?;
        self.log.insert(LogRecord::dealloc_page(pid))?;
        self.pool.discard(idx);
        Ok(())
    }

    /// Resolve a page for access, paging a clean one in from its volume
    /// if the pool has no control block for it yet. In-doubt pages met
    /// during concurrent recovery are recovered on the spot; access below
    /// the commit fence is refused until Undo clears it.
    fn fix_for_access(&self, pid: PageId) -> Result<BfIdx> {
        let idx = match self.pool.lookup(pid) {
            Some(idx) => idx,
            None => {
                // Clean page fault: the body comes straight off the volume.
                let page = self.volumes.read_page(pid).map_err(|e| match e {
                    EngineError::PastEnd(_) => {
                        EngineError::InvalidArgument(format!("page {pid} not allocated"))
                    }
                    other => other,
                })?;
                let idx = self.pool.install_new(pid)?;
                let mut frame = self.pool.cb(idx).latch.write();
                let lsn = page.page_lsn;
                *frame = Some(page);
                drop(frame);
                self.pool.note_loaded(idx, lsn);
                idx
            }
        };
        if self.pool.is_in_doubt(idx) {
            if !self.recovery.is_active() {
                return Err(EngineError::Fatal(format!(
                    "page {pid} in doubt outside recovery"
                )));
            }
            let mut frame = self.pool.cb(idx).latch.write();
            if self.pool.is_in_doubt(idx) {
                recovery::recover_cb_via_spr(self, idx, &mut frame, self.recovery.last_lsn())?;
                drop(frame);
                self.pool.in_doubt_to_dirty(idx);
                tracing::debug!(page = %pid, "recovered on demand");
            }
        }
        if self.recovery.is_active() {
            let fence = self.recovery.commit_lsn();
            let page_lsn = self.pool.meta(idx).page_lsn;
            if !fence.is_null() && !page_lsn.is_null() && page_lsn >= fence {
                return Err(EngineError::RecoveryConflict(format!(
                    "page {pid} last written at {page_lsn}, fence {fence}"
                )));
            }
        }
        Ok(idx)
    }

    /// Log and apply one page mutation under a single exclusive latch
    /// hold. The builder sees the current page body, so pre-images it
    /// bakes into the operation (and thus into the record's undo payload)
    /// cannot go stale between read and apply.
    fn apply_logged(
        &self,
        tid: TxnId,
        pid: PageId,
        build: impl FnOnce(&Page) -> Result<(RecordType, PageOp)>,
    ) -> Result<Lsn> {
        let idx = self.fix_for_access(pid)?;
        let last = self.descriptor(tid)?.last_lsn;
        let mut frame = self.pool.cb(idx).latch.write();
        let body = frame.as_mut().ok_or_else(|| {
            EngineError::Fatal(format!("page {pid} has no body loaded"))
        })?;
        let (rtype, op) = build(body)?;
        let rec = LogRecord::page_update(rtype, tid, last, pid, &op);
        let lsn = self.log.insert(rec)?;
        page::apply_op(body, &op)?;
        body.page_lsn = lsn;
        drop(frame);
        self.pool.note_write(idx, lsn);
        self.txns.on_log(tid, lsn, true)?;
        Ok(lsn)
    }

    /// Insert a key into a page; returns the update's LSN (usable as a
    /// savepoint).
    pub fn insert_kv(&self, tid: TxnId, pid: PageId, key: &[u8], value: &[u8]) -> Result<Lsn> {
        self.apply_logged(tid, pid, |_| {
            Ok((
                RecordType::BtreeInsert,
                PageOp::Insert { key: key.to_vec(), value: value.to_vec(), ghost: false },
            ))
        })
    }

    pub fn update_kv(&self, tid: TxnId, pid: PageId, key: &[u8], value: &[u8]) -> Result<Lsn> {
        self.apply_logged(tid, pid, |body| {
            let old = body
                .get(key)
                .ok_or_else(|| EngineError::InvalidArgument("update of missing key".into()))?
                .to_vec();
            Ok((
                RecordType::BtreeUpdate,
                PageOp::Update {
                    key: key.to_vec(),
                    new_value: value.to_vec(),
                    old_value: old,
                },
            ))
        })
    }

    /// Logical delete: the slot stays as a ghost until reclaimed.
    pub fn delete_kv(&self, tid: TxnId, pid: PageId, key: &[u8]) -> Result<Lsn> {
        self.apply_logged(tid, pid, |_| {
            Ok((
                RecordType::BtreeGhostMark,
                PageOp::GhostMark { key: key.to_vec() },
            ))
        })
    }

    pub fn read_kv(&self, pid: PageId, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let idx = self.fix_for_access(pid)?;
        let frame = self.pool.cb(idx).latch.read();
        let body = frame
            .as_ref()
            .ok_or_else(|| EngineError::Fatal(format!("page {pid} has no body loaded")))?;
        Ok(body.get(key).map(|v| v.to_vec()))
    }

    // ------------------------------------------------------------------
    // lifecycle
    // ------------------------------------------------------------------

    pub fn checkpoint(&self) -> Result<Lsn> {
        self.chkpt.take(&self.log, &self.pool, &self.txns, &self.volumes)
    }

    /// Clean shutdown: finish recovery, flush pages, checkpoint, stop the
    /// log.
    pub fn shutdown(&self) -> Result<()> {
        self.wait_for_restart();
        self.pool.force_all(&self.volumes)?;
        self.checkpoint()?;
        self.log.shutdown();
        Ok(())
    }

    /// Die without flushing anything the daemon has not already hardened:
    /// page bodies are lost, the durable log prefix survives. Test hook.
    #[doc(hidden)]
    pub fn simulate_crash(&self) {
        self.log.kill_for_test();
    }
}
