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

//! The log manager: durable, totally-ordered record stream.
//!
//! One concrete type owns the whole stack: the partition file set
//! ([`crate::log_storage::LogStorage`]), the insert ring and segment read
//! cache ([`crate::log_buffer`]), the consolidation array for concurrent
//! inserts ([`crate::carray`]) and the background flush daemon
//! ([`crate::flush_daemon`]).
//!
//! Guarantees:
//! - `insert` assigns strictly increasing LSNs; records appear in the log
//!   in LSN order.
//! - `flush(lsn, block=true)` returns only once every record with an LSN
//!   at or below the target is on disk; `durable_lsn` never regresses.
//! - `fetch` returns records byte-identical to what was inserted, serving
//!   from the in-memory ring when the bytes have not left it yet.
//! - A torn tail (bad length or `lsn_check` mismatch) terminates forward
//!   scans; those records never existed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex};
use emberdb_core::{EngineConfig, EngineError, Lsn, Result};

use crate::carray::{ConsolidationArray, Join};
use crate::flush_daemon::{self, DaemonMsg};
use crate::log_buffer::{lsn_of, ring_read, ring_write, vaddr, ReadCache};
use crate::log_record::{LogRecord, MIN_FRAME_BYTES};
use crate::log_storage::LogStorage;

/// How long a blocked flush or space waiter sleeps between re-checks.
const WAIT_TICK: Duration = Duration::from_millis(50);

pub(crate) struct LogCore {
    partition_bytes: u32,
    ring_cap: usize,
    log_max_bytes: u64,
    flush_trigger_bytes: u64,

    pub(crate) storage: LogStorage,

    /// Insert ring. Lock order: `insert_mu` before `ring`.
    ring: Mutex<Vec<u8>>,
    /// Serializes group winners (reservation + copy).
    insert_mu: Mutex<()>,
    /// Segment cache for fetches below the flush frontier.
    cache: Mutex<ReadCache>,

    /// Next byte to reserve.
    reserved_v: AtomicU64,
    /// All bytes below this are completely copied into the ring.
    written_v: AtomicU64,
    /// All bytes below this are durable in the partition files.
    flushed_v: AtomicU64,
    /// Bytes the daemon has claimed for the in-flight flush pass; the
    /// compensate path may not rewrite below this.
    flush_claim_v: AtomicU64,

    curr_lsn_raw: AtomicU64,
    durable_lsn_raw: AtomicU64,
    last_lsn_raw: AtomicU64,
    master_raw: AtomicU64,

    /// Bytes returned to the budget by scavenged partitions.
    space_recycled: AtomicU64,
    /// Bytes promised to transactions for their aborts.
    space_reserved: AtomicU64,

    flush_mu: Mutex<()>,
    flush_cv: Condvar,
    daemon_tx: Mutex<Option<Sender<DaemonMsg>>>,
}

impl LogCore {
    fn base_v(&self) -> u64 {
        // The log is born at Lsn(1, 0); partition 0 backs the null LSN.
        self.partition_bytes as u64
    }

    pub(crate) fn curr_lsn(&self) -> Lsn {
        Lsn::from_raw(self.curr_lsn_raw.load(Ordering::SeqCst))
    }

    pub(crate) fn durable_lsn(&self) -> Lsn {
        Lsn::from_raw(self.durable_lsn_raw.load(Ordering::SeqCst))
    }

    fn space_used(&self) -> u64 {
        self.reserved_v.load(Ordering::SeqCst) - self.base_v()
    }

    pub(crate) fn space_left(&self) -> u64 {
        (self.log_max_bytes + self.space_recycled.load(Ordering::SeqCst))
            .saturating_sub(self.space_used())
    }

    pub(crate) fn wake_daemon(&self) {
        if let Some(tx) = self.daemon_tx.lock().as_ref() {
            let _ = tx.send(DaemonMsg::Wake);
        }
    }

    fn maybe_wake_daemon(&self) {
        let unflushed =
            self.written_v.load(Ordering::SeqCst) - self.flushed_v.load(Ordering::SeqCst);
        if unflushed >= self.flush_trigger_bytes {
            self.wake_daemon();
        }
    }

    pub(crate) fn unflushed_bytes(&self) -> u64 {
        self.written_v.load(Ordering::SeqCst) - self.flushed_v.load(Ordering::SeqCst)
    }

    pub(crate) fn flush_trigger_bytes(&self) -> u64 {
        self.flush_trigger_bytes
    }

    /// Reserve `[v, v + bytes.len())`, blocking while the ring has no room,
    /// then copy and publish. Runs under `insert_mu`.
    fn copy_frame(&self, v: u64, bytes: &[u8]) {
        let end = v + bytes.len() as u64;
        while end > self.flushed_v.load(Ordering::SeqCst) + self.ring_cap as u64 {
            self.wake_daemon();
            let mut g = self.flush_mu.lock();
            if end > self.flushed_v.load(Ordering::SeqCst) + self.ring_cap as u64 {
                self.flush_cv.wait_for(&mut g, WAIT_TICK);
            }
        }
        self.reserved_v.store(end, Ordering::SeqCst);
        {
            let mut ring = self.ring.lock();
            ring_write(&mut ring, v, bytes);
        }
        self.written_v.store(end, Ordering::SeqCst);
        self.curr_lsn_raw
            .store(lsn_of(end, self.partition_bytes).to_raw(), Ordering::SeqCst);
    }

    fn insert_one(&self, record: &LogRecord, reserved: bool) -> Result<Lsn> {
        let len = record.encoded_len();
        let pb = self.partition_bytes as u64;
        let payload_cap = pb - MIN_FRAME_BYTES as u64;
        if len as u64 > payload_cap || len >= self.ring_cap {
            return Err(EngineError::InvalidArgument(format!(
                "record of {len} bytes exceeds partition or buffer cap"
            )));
        }

        // Space accounting: a plain insert may not eat into the bytes
        // transactions reserved for their aborts; an abort-path insert may.
        let free = self.space_left();
        if reserved {
            if len as u64 > free {
                return Err(EngineError::OutOfLogSpace { need: len as u64, available: free });
            }
            let _ = self.space_reserved.fetch_update(
                Ordering::SeqCst,
                Ordering::SeqCst,
                |r| Some(r.saturating_sub(len as u64)),
            );
        } else {
            let promised = self.space_reserved.load(Ordering::SeqCst);
            if len as u64 + promised > free {
                return Err(EngineError::OutOfLogSpace {
                    need: len as u64,
                    available: free.saturating_sub(promised),
                });
            }
        }

        let mut v = self.reserved_v.load(Ordering::SeqCst);
        if v % pb + len as u64 > payload_cap {
            // Partition rollover: pad the tail with the terminal skip,
            // whose xid_prev chains to the last real record.
            let skip_len = (pb - v % pb) as usize;
            let last = Lsn::from_raw(self.last_lsn_raw.load(Ordering::SeqCst));
            let skip = LogRecord::skip(last, skip_len);
            let skip_lsn = lsn_of(v, self.partition_bytes);
            self.copy_frame(v, &skip.encode(skip_lsn));
            v += skip_len as u64;
            debug_assert_eq!(v % pb, 0);
        }

        let lsn = lsn_of(v, self.partition_bytes);
        self.copy_frame(v, &record.encode(lsn));
        self.last_lsn_raw.store(lsn.to_raw(), Ordering::SeqCst);
        Ok(lsn)
    }

    /// Winner path: one lock acquisition for the whole group.
    pub(crate) fn commit_group(&self, group: Vec<Join>) {
        {
            let _g = self.insert_mu.lock();
            for join in group {
                let res = self.insert_one(&join.record, join.reserved);
                let _ = join.reply.send(res);
            }
        }
        self.maybe_wake_daemon();
    }

    /// Read `len` bytes at `v`, choosing ring or files by the flush
    /// frontier.
    fn read_frame_bytes(&self, v: u64, len: usize) -> Result<Vec<u8>> {
        if v >= self.flushed_v.load(Ordering::SeqCst) {
            let ring = self.ring.lock();
            let written = self.written_v.load(Ordering::SeqCst);
            if v + len as u64 > written {
                return Err(EngineError::CorruptLogHeader {
                    lsn: lsn_of(v, self.partition_bytes),
                    reason: "frame extends past written frontier".into(),
                });
            }
            let mut out = vec![0u8; len];
            ring_read(&ring, v, &mut out);
            Ok(out)
        } else {
            let mut cache = self.cache.lock();
            cache.read_bytes(
                &self.storage,
                v,
                len,
                self.reserved_v.load(Ordering::SeqCst),
                self.flushed_v.load(Ordering::SeqCst),
            )
        }
    }

    pub(crate) fn fetch(&self, lsn: Lsn) -> Result<(LogRecord, Lsn)> {
        if lsn >= self.curr_lsn() || lsn.is_null() {
            return Err(EngineError::InvalidArgument(format!(
                "fetch at or past log end: {lsn}"
            )));
        }
        let v = vaddr(lsn, self.partition_bytes);
        let head = self.read_frame_bytes(v, 4)?;
        let len = LogRecord::peek_len(&head).ok_or(EngineError::CorruptLogHeader {
            lsn,
            reason: "bad frame length".into(),
        })?;
        let frame = self.read_frame_bytes(v, len)?;
        let (rec, check) = LogRecord::decode(&frame, lsn)?;
        if check != lsn {
            return Err(EngineError::CorruptLogHeader {
                lsn,
                reason: format!("lsn_check says {check}"),
            });
        }
        let next = if rec.is_skip() {
            Lsn::new(lsn.partition() + 1, 0)
        } else {
            lsn.advance(len as u32)
        };
        Ok((rec, next))
    }

    /// The record immediately preceding `lsn`, or `None` at the log start.
    ///
    /// There is no per-record back pointer, so this walks the partition
    /// forward from its start; backward scans are recovery-time only.
    pub(crate) fn fetch_backward(&self, lsn: Lsn) -> Result<Option<(Lsn, LogRecord)>> {
        let (partition, target_off) = if lsn.offset() == 0 {
            if lsn.partition() <= 1 {
                return Ok(None);
            }
            // The preceding record is the previous partition's skip, which
            // ends exactly at the partition cap.
            (lsn.partition() - 1, self.partition_bytes)
        } else {
            (lsn.partition(), lsn.offset())
        };
        let mut cursor = Lsn::new(partition, 0);
        loop {
            let (rec, next) = self.fetch(cursor)?;
            let end = if rec.is_skip() { self.partition_bytes } else { next.offset() };
            if end == target_off {
                return Ok(Some((cursor, rec)));
            }
            if end > target_off || rec.is_skip() {
                return Err(EngineError::CorruptLogHeader {
                    lsn,
                    reason: "no record boundary at requested position".into(),
                });
            }
            cursor = next;
        }
    }

    /// Rewrite the undo-next link (`xid_prev`) of a record still resident
    /// in the buffer. Fails once the daemon has claimed the record's bytes
    /// for flushing; callers must compensate before the record hardens.
    pub(crate) fn compensate(&self, orig: Lsn, undo: Lsn) -> Result<()> {
        let v = vaddr(orig, self.partition_bytes);
        let mut ring = self.ring.lock();
        if v < self.flush_claim_v.load(Ordering::SeqCst) {
            return Err(EngineError::InvalidArgument(format!(
                "record {orig} already hardened, cannot compensate in place"
            )));
        }
        if v + MIN_FRAME_BYTES as u64 > self.written_v.load(Ordering::SeqCst) {
            return Err(EngineError::InvalidArgument(format!(
                "no record at {orig} to compensate"
            )));
        }
        // Sanity: the trailer must name the record we think we are editing.
        let mut head = vec![0u8; 4];
        ring_read(&ring, v, &mut head);
        let len = LogRecord::peek_len(&head).ok_or(EngineError::CorruptLogHeader {
            lsn: orig,
            reason: "bad frame length".into(),
        })?;
        let mut frame = vec![0u8; len];
        ring_read(&ring, v, &mut frame);
        let (_, check) = LogRecord::decode(&frame, orig)?;
        if check != orig {
            return Err(EngineError::InvalidArgument(format!(
                "record at {orig} fails lsn_check"
            )));
        }
        ring_write(&mut ring, v + 16, &undo.to_raw().to_le_bytes());
        Ok(())
    }

    /// One flush pass: harden everything written as of entry. A single
    /// pass (rather than draining until idle) keeps each flush request's
    /// durability horizon exactly what its requester saw.
    pub(crate) fn flush_pass(&self) -> Result<()> {
        let flushed = self.flushed_v.load(Ordering::SeqCst);
        let written = self.written_v.load(Ordering::SeqCst);
        if flushed == written {
            return Ok(());
        }
        let bytes = {
            let ring = self.ring.lock();
            self.flush_claim_v.store(written, Ordering::SeqCst);
            let mut out = vec![0u8; (written - flushed) as usize];
            ring_read(&ring, flushed, &mut out);
            out
        };
        // Write out, splitting at partition boundaries.
        let pb = self.partition_bytes;
        let mut v = flushed;
        let mut idx = 0usize;
        let mut touched = Vec::new();
        while idx < bytes.len() {
            let lsn = lsn_of(v, pb);
            let take = (bytes.len() - idx).min((pb - lsn.offset()) as usize);
            self.storage
                .write_at(lsn.partition(), lsn.offset(), &bytes[idx..idx + take])?;
            if touched.last() != Some(&lsn.partition()) {
                touched.push(lsn.partition());
            }
            v += take as u64;
            idx += take;
        }
        for p in touched {
            self.storage.sync(p)?;
        }
        self.flushed_v.store(written, Ordering::SeqCst);
        // durable_lsn is monotone: written only grows.
        self.durable_lsn_raw
            .store(lsn_of(written, pb).to_raw(), Ordering::SeqCst);
        drop(self.flush_mu.lock());
        self.flush_cv.notify_all();
        Ok(())
    }
}

/// Public log manager handle. See the module docs for the contract.
pub struct LogManager {
    core: Arc<LogCore>,
    carray: ConsolidationArray,
    daemon: Mutex<Option<JoinHandle<()>>>,
}

impl LogManager {
    /// Open the log under `config.log_dir`, prime the frontiers from the
    /// existing partition files (stopping at any torn tail) and start the
    /// flush daemon.
    pub fn open(config: &EngineConfig) -> Result<LogManager> {
        assert!(
            config.partition_bytes as usize % config.segment_bytes == 0,
            "partition_bytes must be a multiple of segment_bytes"
        );
        let storage = LogStorage::open(&config.log_dir)?;
        let (curr, last) = Self::prime(&storage, config.partition_bytes)?;
        let master = storage.read_master()?;
        let start_v = vaddr(curr, config.partition_bytes);

        let core = Arc::new(LogCore {
            partition_bytes: config.partition_bytes,
            ring_cap: config.buffer_bytes(),
            log_max_bytes: config.log_max_bytes,
            flush_trigger_bytes: (config.flush_trigger_segments as u64)
                .saturating_mul(config.segment_bytes as u64),
            storage,
            ring: Mutex::new(vec![0u8; config.buffer_bytes()]),
            insert_mu: Mutex::new(()),
            cache: Mutex::new(ReadCache::new(
                config.segment_bytes,
                config.partition_bytes,
                config.buffer_segments,
            )),
            reserved_v: AtomicU64::new(start_v),
            written_v: AtomicU64::new(start_v),
            flushed_v: AtomicU64::new(start_v),
            flush_claim_v: AtomicU64::new(start_v),
            curr_lsn_raw: AtomicU64::new(curr.to_raw()),
            durable_lsn_raw: AtomicU64::new(curr.to_raw()),
            last_lsn_raw: AtomicU64::new(last.to_raw()),
            master_raw: AtomicU64::new(master.to_raw()),
            space_recycled: AtomicU64::new(0),
            space_reserved: AtomicU64::new(0),
            flush_mu: Mutex::new(()),
            flush_cv: Condvar::new(),
            daemon_tx: Mutex::new(None),
        });

        let (tx, handle) = flush_daemon::spawn(Arc::clone(&core));
        *core.daemon_tx.lock() = Some(tx);

        tracing::debug!(
            curr = %curr,
            last = %last,
            master = %master,
            "log manager opened"
        );
        Ok(LogManager {
            core,
            carray: ConsolidationArray::new(config.active_slots),
            daemon: Mutex::new(None),
        }
        .with_daemon(handle))
    }

    fn with_daemon(self, handle: JoinHandle<()>) -> Self {
        *self.daemon.lock() = Some(handle);
        self
    }

    /// Scan the newest partition to find the end of the valid log. Bytes
    /// after the last record whose trailer matches its position are a torn
    /// tail and are treated as if they never existed.
    fn prime(storage: &LogStorage, partition_bytes: u32) -> Result<(Lsn, Lsn)> {
        let parts = storage.list_partitions()?;
        let Some(&p) = parts.last() else {
            return Ok((Lsn::new(1, 0), Lsn::NULL));
        };
        let len = storage.partition_len(p)?.min(partition_bytes as u64) as u32;
        let mut data = vec![0u8; len as usize];
        let n = storage.read_at(p, 0, &mut data)?;
        data.truncate(n);

        let mut off = 0u32;
        let mut last = Lsn::NULL;
        let mut curr = Lsn::new(p, 0);
        while (off as usize) < data.len() {
            let rest = &data[off as usize..];
            let Some(flen) = LogRecord::peek_len(rest) else { break };
            if flen > rest.len() {
                break;
            }
            let at = Lsn::new(p, off);
            let Ok((rec, check)) = LogRecord::decode(&rest[..flen], at) else { break };
            if check != at {
                break;
            }
            if rec.is_skip() {
                curr = Lsn::new(p + 1, 0);
                return Ok((curr, if last.is_null() { rec.xid_prev } else { last }));
            }
            last = at;
            off += flen as u32;
            curr = Lsn::new(p, off);
        }
        Ok((curr, last))
    }

    fn submit(&self, record: LogRecord, reserved: bool) -> Result<Lsn> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let core = &self.core;
        self.carray.submit(
            Join { record, reserved, reply: tx },
            |group| core.commit_group(group),
        );
        rx.recv()
            .map_err(|_| EngineError::Fatal("log insert reply channel closed".into()))?
    }

    /// Append a record; returns its LSN.
    pub fn insert(&self, record: LogRecord) -> Result<Lsn> {
        self.submit(record, false)
    }

    /// Append drawing on pre-reserved abort space; used by rollback so an
    /// abort can always complete even when the log is out of free space.
    pub fn insert_reserved(&self, record: LogRecord) -> Result<Lsn> {
        self.submit(record, true)
    }

    /// Make everything with an LSN at or below `lsn` durable. Non-blocking
    /// flavor just nudges the daemon.
    ///
    /// The target is already in the buffer when the wakeup is sent, so one
    /// request suffices; the wait loop only rides out lost notifications.
    pub fn flush(&self, lsn: Lsn, block: bool) -> Result<()> {
        let target = lsn.min(self.core.curr_lsn().predecessor());
        self.core.wake_daemon();
        if block {
            while self.core.durable_lsn() <= target {
                let mut g = self.core.flush_mu.lock();
                if self.core.durable_lsn() <= target {
                    self.core.flush_cv.wait_for(&mut g, WAIT_TICK);
                }
            }
        }
        Ok(())
    }

    /// Flush the whole log; the one-byte back-off avoids depending on a
    /// record that starts exactly at `curr_lsn`.
    pub fn flush_all(&self) -> Result<()> {
        self.flush(self.core.curr_lsn().predecessor(), true)
    }

    /// Fetch the record at `lsn`; returns it and the LSN of its successor.
    pub fn fetch(&self, lsn: Lsn) -> Result<(LogRecord, Lsn)> {
        self.core.fetch(lsn)
    }

    /// Fetch the record immediately preceding `lsn`.
    pub fn fetch_backward(&self, lsn: Lsn) -> Result<Option<(Lsn, LogRecord)>> {
        self.core.fetch_backward(lsn)
    }

    pub fn compensate(&self, orig: Lsn, undo: Lsn) -> Result<()> {
        self.core.compensate(orig, undo)
    }

    /// Reclaim partitions strictly older than every recovery floor.
    /// Returns how many partitions were removed.
    pub fn scavenge(&self, min_rec_lsn: Lsn, min_xct_lsn: Lsn) -> Result<usize> {
        let master = self.master_lsn();
        let mut floor = match (min_rec_lsn.is_null(), min_xct_lsn.is_null()) {
            (true, true) => master,
            (true, false) => min_xct_lsn,
            (false, true) => min_rec_lsn,
            (false, false) => min_rec_lsn.min(min_xct_lsn),
        };
        if !master.is_null() {
            floor = floor.min(master);
        }
        if floor.is_null() {
            return Ok(0);
        }
        let keep = floor.partition();
        let mut removed = 0;
        for p in self.core.storage.list_partitions()? {
            if p < keep && p < self.core.curr_lsn().partition() {
                self.core.storage.remove_partition(p)?;
                self.core
                    .space_recycled
                    .fetch_add(self.core.partition_bytes as u64, Ordering::SeqCst);
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, keep_from = keep, "scavenged log partitions");
            drop(self.core.flush_mu.lock());
            self.core.flush_cv.notify_all();
        }
        Ok(removed)
    }

    /// Pre-account log bytes for a transaction's eventual abort.
    pub fn reserve_space(&self, bytes: u64) -> Result<()> {
        let free = self.core.space_left();
        let promised = self.core.space_reserved.load(Ordering::SeqCst);
        if promised + bytes > free {
            return Err(EngineError::OutOfLogSpace {
                need: bytes,
                available: free.saturating_sub(promised),
            });
        }
        self.core.space_reserved.fetch_add(bytes, Ordering::SeqCst);
        Ok(())
    }

    pub fn release_space(&self, bytes: u64) {
        let _ = self.core.space_reserved.fetch_update(
            Ordering::SeqCst,
            Ordering::SeqCst,
            |r| Some(r.saturating_sub(bytes)),
        );
    }

    /// Block until `bytes` can be reserved, or time out.
    pub fn wait_for_space(&self, bytes: u64, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.reserve_space(bytes) {
                Ok(()) => return Ok(()),
                Err(EngineError::OutOfLogSpace { .. }) => {
                    if Instant::now() >= deadline {
                        return Err(EngineError::Timeout(format!(
                            "waiting for {bytes} bytes of log space"
                        )));
                    }
                    let mut g = self.core.flush_mu.lock();
                    self.core.flush_cv.wait_for(&mut g, WAIT_TICK);
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn curr_lsn(&self) -> Lsn {
        self.core.curr_lsn()
    }

    /// Start of the oldest retained partition: the lowest LSN a scan can
    /// reach. Moves forward as scavenging reclaims partitions.
    pub fn earliest_lsn(&self) -> Lsn {
        match self.core.storage.list_partitions() {
            Ok(parts) => match parts.first() {
                Some(&p) => Lsn::new(p, 0),
                None => Lsn::new(1, 0),
            },
            Err(_) => Lsn::new(1, 0),
        }
    }

    pub fn durable_lsn(&self) -> Lsn {
        self.core.durable_lsn()
    }

    /// LSN of the last record inserted (pre-crash: the last valid record
    /// found while priming).
    pub fn last_lsn(&self) -> Lsn {
        Lsn::from_raw(self.core.last_lsn_raw.load(Ordering::SeqCst))
    }

    pub fn master_lsn(&self) -> Lsn {
        Lsn::from_raw(self.core.master_raw.load(Ordering::SeqCst))
    }

    /// Atomically persist the master pointer.
    pub fn set_master(&self, master: Lsn) -> Result<()> {
        self.core.storage.write_master(master)?;
        self.core.master_raw.store(master.to_raw(), Ordering::SeqCst);
        Ok(())
    }

    pub fn space_left(&self) -> u64 {
        self.core.space_left()
    }

    /// Forward scan from `start` (inclusive) to the current end of log.
    pub fn scan_forward(&self, start: Lsn) -> LogScan<'_> {
        LogScan { log: self, cursor: start, forward: true }
    }

    /// Backward scan yielding records strictly before `start`.
    pub fn scan_backward(&self, start: Lsn) -> LogScan<'_> {
        LogScan { log: self, cursor: start, forward: false }
    }

    /// Stop the flush daemon after a final flush and close.
    pub fn shutdown(&self) {
        if let Some(tx) = self.core.daemon_tx.lock().take() {
            let _ = tx.send(DaemonMsg::Shutdown);
        }
        if let Some(handle) = self.daemon.lock().take() {
            let _ = handle.join();
        }
    }

    /// Stop the daemon *without* a final flush: whatever the daemon has
    /// not hardened is lost, exactly as in a crash. Test hook.
    #[doc(hidden)]
    pub fn kill_for_test(&self) {
        if let Some(tx) = self.core.daemon_tx.lock().take() {
            let _ = tx.send(DaemonMsg::Abandon);
        }
        if let Some(handle) = self.daemon.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for LogManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Log-scan iterator used by restart. Forward scans stop cleanly at the
/// end of the valid log (including a torn tail); backward scans stop at
/// the log's beginning.
pub struct LogScan<'a> {
    log: &'a LogManager,
    cursor: Lsn,
    forward: bool,
}

impl LogScan<'_> {
    pub fn next(&mut self) -> Result<Option<(Lsn, LogRecord)>> {
        if self.forward {
            if self.cursor >= self.log.curr_lsn() {
                return Ok(None);
            }
            match self.log.fetch(self.cursor) {
                Ok((rec, next)) => {
                    let at = self.cursor;
                    self.cursor = next;
                    Ok(Some((at, rec)))
                }
                // Torn tail: the records from here on never existed.
                Err(EngineError::CorruptLogHeader { .. }) => Ok(None),
                Err(e) => Err(e),
            }
        } else {
            match self.log.fetch_backward(self.cursor)? {
                Some((lsn, rec)) => {
                    self.cursor = lsn;
                    Ok(Some((lsn, rec)))
                }
                None => Ok(None),
            }
        }
    }
}
