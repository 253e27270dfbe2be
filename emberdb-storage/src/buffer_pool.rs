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

//! Buffer-pool page control blocks: the bookkeeping recovery consults.
//!
//! Control blocks live in a fixed arena indexed by `BfIdx`; index 0 is
//! reserved so a zero index can mean "not found". A thread-safe hashtable
//! maps `(volume, page)` to the owning control block.
//!
//! Flag invariants:
//! - `in_doubt ⇒ used`, and the page body is NOT loaded: Analysis names
//!   the page from the log without touching the volume.
//! - `dirty ⇒ used`, and the page body IS loaded.
//! - a page is never both `in_doubt` and `dirty`; the only transition
//!   between them is `in_doubt → dirty`, made once per restart when Redo
//!   first recovers the page.
//! - `used` without either flag is an allocated-but-unmodified page.
//!
//! During restart no eviction is possible, so running out of control
//! blocks during Analysis is fatal (`OutOfBufferSlots`).

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use emberdb_core::{BfIdx, EngineError, Lsn, PageId, Result};

use crate::log_record::BufEntry;
use crate::page::Page;
use crate::volume::VolumeManager;

#[derive(Debug, Clone)]
pub struct CbMeta {
    pub pid: PageId,
    pub used: bool,
    pub in_doubt: bool,
    pub dirty: bool,
    /// Earliest LSN that may have dirtied the page: the Redo floor.
    pub rec_lsn: Lsn,
    /// LSN of the last write applied to the in-memory page body.
    pub page_lsn: Lsn,
    /// Last LSN seen for this page during Analysis; page-driven Redo uses
    /// it as the expected end LSN for single-page recovery, then clears it.
    pub expected_emlsn: Option<Lsn>,
}

impl CbMeta {
    fn empty() -> CbMeta {
        CbMeta {
            pid: PageId::NULL,
            used: false,
            in_doubt: false,
            dirty: false,
            rec_lsn: Lsn::NULL,
            page_lsn: Lsn::NULL,
            expected_emlsn: None,
        }
    }
}

/// One page control block: metadata plus the latched frame.
pub struct PageCb {
    meta: Mutex<CbMeta>,
    /// The page latch guards the frame; `None` while the body is not
    /// loaded (free or in-doubt control blocks).
    pub latch: RwLock<Option<Page>>,
}

pub struct BufferPool {
    cbs: Vec<PageCb>,
    free: Mutex<Vec<BfIdx>>,
    table: DashMap<u64, BfIdx>,
}

impl BufferPool {
    pub fn new(slots: usize) -> BufferPool {
        let slots = slots.max(2);
        let cbs = (0..slots)
            .map(|_| PageCb { meta: Mutex::new(CbMeta::empty()), latch: RwLock::new(None) })
            .collect();
        // Index 0 never leaves the arena.
        let free = (1..slots).rev().collect();
        BufferPool { cbs, free: Mutex::new(free), table: DashMap::new() }
    }

    pub fn cb(&self, idx: BfIdx) -> &PageCb {
        &self.cbs[idx]
    }

    pub fn meta(&self, idx: BfIdx) -> CbMeta {
        self.cbs[idx].meta.lock().clone()
    }

    pub fn capacity(&self) -> usize {
        self.cbs.len()
    }

    pub fn lookup(&self, pid: PageId) -> Option<BfIdx> {
        self.table.get(&pid.key()).map(|e| *e.value())
    }

    fn allocate(&self, pid: PageId) -> Result<BfIdx> {
        let idx = self.free.lock().pop().ok_or(EngineError::OutOfBufferSlots)?;
        {
            let mut meta = self.cbs[idx].meta.lock();
            *meta = CbMeta::empty();
            meta.pid = pid;
            meta.used = true;
        }
        self.table.insert(pid.key(), idx);
        Ok(idx)
    }

    /// Analysis-side registration: mark `pid` in-doubt at `lsn`, or lower
    /// an existing control block's `rec_lsn`. Counts newly in-doubt pages
    /// into `in_doubt_count`. The page body is not touched.
    pub fn register_and_mark(
        &self,
        pid: PageId,
        lsn: Lsn,
        in_doubt_count: &mut u32,
    ) -> Result<BfIdx> {
        if pid.is_null() {
            return Err(EngineError::Fatal(
                "page number 0 in a record that must reference a page".into(),
            ));
        }
        let idx = match self.lookup(pid) {
            Some(idx) => idx,
            None => self.allocate(pid)?,
        };
        let mut meta = self.cbs[idx].meta.lock();
        debug_assert!(meta.used);
        if !meta.in_doubt && !meta.dirty {
            meta.in_doubt = true;
            *in_doubt_count += 1;
        }
        if meta.rec_lsn.is_null() || lsn < meta.rec_lsn {
            meta.rec_lsn = lsn;
        }
        Ok(idx)
    }

    pub fn is_in_doubt(&self, idx: BfIdx) -> bool {
        self.cbs[idx].meta.lock().in_doubt
    }

    pub fn is_dirty(&self, idx: BfIdx) -> bool {
        self.cbs[idx].meta.lock().dirty
    }

    pub fn is_used(&self, idx: BfIdx) -> bool {
        self.cbs[idx].meta.lock().used
    }

    /// Clear the in-doubt flag. With `keep_used` the control block stays
    /// allocated (page allocation may be followed by non-logged use);
    /// without it the slot returns to the free list.
    pub fn clear_in_doubt(&self, idx: BfIdx, keep_used: bool) {
        let pid = {
            let mut meta = self.cbs[idx].meta.lock();
            meta.in_doubt = false;
            meta.rec_lsn = Lsn::NULL;
            meta.expected_emlsn = None;
            if keep_used {
                return;
            }
            meta.used = false;
            meta.pid
        };
        self.table.remove(&pid.key());
        *self.cbs[idx].latch.write() = None;
        self.free.lock().push(idx);
    }

    /// Drop a control block entirely (page deallocation): the slot and its
    /// hashtable entry become reusable.
    pub fn discard(&self, idx: BfIdx) {
        let pid = {
            let mut meta = self.cbs[idx].meta.lock();
            let pid = meta.pid;
            *meta = CbMeta::empty();
            pid
        };
        self.table.remove(&pid.key());
        *self.cbs[idx].latch.write() = None;
        self.free.lock().push(idx);
    }

    /// The one-way transition Redo makes after the first successful replay
    /// on a page.
    pub fn in_doubt_to_dirty(&self, idx: BfIdx) {
        let mut meta = self.cbs[idx].meta.lock();
        debug_assert!(meta.in_doubt && !meta.dirty);
        meta.in_doubt = false;
        meta.dirty = true;
    }

    /// Record Analysis' last-seen LSN for the page (page-driven Redo's
    /// expected end LSN).
    pub fn set_expected_emlsn(&self, idx: BfIdx, lsn: Lsn) {
        self.cbs[idx].meta.lock().expected_emlsn = Some(lsn);
    }

    pub fn take_expected_emlsn(&self, idx: BfIdx) -> Option<Lsn> {
        self.cbs[idx].meta.lock().expected_emlsn.take()
    }

    /// Load the page body from its volume into the latched frame the
    /// caller holds. Returns `past_end = true` for a virgin page (the
    /// volume has no bytes for it); `BadChecksum` propagates so the caller
    /// can recover the page via single-page recovery.
    pub fn load_for_redo(
        &self,
        idx: BfIdx,
        volumes: &VolumeManager,
        frame: &mut Option<Page>,
    ) -> Result<bool> {
        let pid = self.cbs[idx].meta.lock().pid;
        match volumes.read_page(pid) {
            Ok(page) => {
                {
                    let mut meta = self.cbs[idx].meta.lock();
                    meta.page_lsn = page.page_lsn;
                }
                *frame = Some(page);
                Ok(false)
            }
            Err(EngineError::PastEnd(_)) => {
                // Virgin page: never flushed before the crash. Its on-disk
                // LSN is null; a format record must appear in the log.
                *frame = Some(Page::new(pid));
                let mut meta = self.cbs[idx].meta.lock();
                meta.page_lsn = Lsn::NULL;
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    /// Bookkeeping for a clean page just paged in from its volume.
    pub fn note_loaded(&self, idx: BfIdx, page_lsn: Lsn) {
        let mut meta = self.cbs[idx].meta.lock();
        meta.page_lsn = page_lsn;
    }

    /// Forward-processing bookkeeping after a logged write to the page:
    /// first write since clean sets `rec_lsn`, every write advances
    /// `page_lsn`.
    pub fn note_write(&self, idx: BfIdx, lsn: Lsn) {
        let mut meta = self.cbs[idx].meta.lock();
        debug_assert!(!meta.in_doubt);
        meta.used = true;
        if !meta.dirty {
            meta.dirty = true;
            meta.rec_lsn = lsn;
        }
        meta.page_lsn = lsn;
    }

    /// Update `rec_lsn`/`page_lsn` from Redo: `page_lsn` follows the
    /// record just applied, `rec_lsn` only ever moves down.
    pub fn note_redo(&self, idx: BfIdx, lsn: Lsn) {
        let mut meta = self.cbs[idx].meta.lock();
        meta.page_lsn = lsn;
        if meta.rec_lsn.is_null() || lsn < meta.rec_lsn {
            meta.rec_lsn = lsn;
        }
    }

    /// Register a brand-new page during forward processing (allocation):
    /// used, clean, body loaded empty.
    pub fn install_new(&self, pid: PageId) -> Result<BfIdx> {
        if let Some(idx) = self.lookup(pid) {
            return Ok(idx);
        }
        let idx = self.allocate(pid)?;
        *self.cbs[idx].latch.write() = Some(Page::new(pid));
        Ok(idx)
    }

    /// Pages a checkpoint must capture: everything dirty or in-doubt, with
    /// its recovery floor.
    pub fn snapshot_dirty(&self) -> Vec<BufEntry> {
        let mut out = Vec::new();
        for cb in &self.cbs {
            let meta = cb.meta.lock();
            if meta.used && (meta.dirty || meta.in_doubt) {
                out.push(BufEntry { pid: meta.pid, rec_lsn: meta.rec_lsn });
            }
        }
        out.sort_by_key(|e| e.pid.key());
        out
    }

    pub fn in_doubt_count(&self) -> u32 {
        self.cbs
            .iter()
            .filter(|cb| cb.meta.lock().in_doubt)
            .count() as u32
    }

    pub fn dirty_count(&self) -> u32 {
        self.cbs.iter().filter(|cb| cb.meta.lock().dirty).count() as u32
    }

    /// Flush every dirty page body to its volume and mark it clean. Used
    /// after serial Redo so a re-crash has less work, and at clean
    /// shutdown.
    pub fn force_all(&self, volumes: &VolumeManager) -> Result<()> {
        for cb in &self.cbs {
            let is_dirty = {
                let meta = cb.meta.lock();
                meta.used && meta.dirty
            };
            if !is_dirty {
                continue;
            }
            let frame = cb.latch.read();
            let Some(page) = frame.as_ref() else {
                return Err(EngineError::Fatal("dirty page with no body loaded".into()));
            };
            volumes.write_page(page)?;
            let mut meta = cb.meta.lock();
            meta.dirty = false;
            meta.rec_lsn = Lsn::NULL;
        }
        volumes.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn pid(n: u32) -> PageId {
        PageId::new(1, 0, n)
    }

    #[test]
    fn test_register_and_mark_sets_floor() {
        let pool = BufferPool::new(8);
        let mut count = 0;
        let idx = pool.register_and_mark(pid(5), Lsn::new(1, 200), &mut count).unwrap();
        assert_eq!(count, 1);
        assert!(pool.is_in_doubt(idx));
        assert!(pool.is_used(idx));
        assert!(!pool.is_dirty(idx));

        // Re-registering lowers rec_lsn but does not recount.
        let idx2 = pool.register_and_mark(pid(5), Lsn::new(1, 100), &mut count).unwrap();
        assert_eq!(idx, idx2);
        assert_eq!(count, 1);
        assert_eq!(pool.meta(idx).rec_lsn, Lsn::new(1, 100));
        // A later LSN does not raise it.
        pool.register_and_mark(pid(5), Lsn::new(1, 300), &mut count).unwrap();
        assert_eq!(pool.meta(idx).rec_lsn, Lsn::new(1, 100));
    }

    #[test]
    fn test_page_zero_is_fatal() {
        let pool = BufferPool::new(8);
        let mut count = 0;
        match pool.register_and_mark(PageId::new(1, 0, 0), Lsn::new(1, 48), &mut count) {
            Err(EngineError::Fatal(_)) => {}
            other => panic!("expected Fatal, got {other:?}"),
        }
    }

    #[test]
    fn test_out_of_slots() {
        let pool = BufferPool::new(3); // slots 1 and 2 usable
        let mut count = 0;
        pool.register_and_mark(pid(1), Lsn::new(1, 48), &mut count).unwrap();
        pool.register_and_mark(pid(2), Lsn::new(1, 48), &mut count).unwrap();
        match pool.register_and_mark(pid(3), Lsn::new(1, 48), &mut count) {
            Err(EngineError::OutOfBufferSlots) => {}
            other => panic!("expected OutOfBufferSlots, got {other:?}"),
        }
    }

    #[test]
    fn test_clear_in_doubt_frees_slot() {
        let pool = BufferPool::new(3);
        let mut count = 0;
        let idx = pool.register_and_mark(pid(1), Lsn::new(1, 48), &mut count).unwrap();

        // keep_used: allocation followed by possible non-logged use.
        pool.clear_in_doubt(idx, true);
        assert!(!pool.is_in_doubt(idx));
        assert!(pool.is_used(idx));
        assert_eq!(pool.lookup(pid(1)), Some(idx));

        // full clear: slot becomes reusable.
        pool.clear_in_doubt(idx, false);
        assert_eq!(pool.lookup(pid(1)), None);
        let idx2 = pool.register_and_mark(pid(9), Lsn::new(1, 96), &mut count).unwrap();
        assert_eq!(idx2, idx);
    }

    #[test]
    fn test_in_doubt_to_dirty_one_way() {
        let pool = BufferPool::new(8);
        let mut count = 0;
        let idx = pool.register_and_mark(pid(4), Lsn::new(1, 48), &mut count).unwrap();
        pool.in_doubt_to_dirty(idx);
        assert!(!pool.is_in_doubt(idx));
        assert!(pool.is_dirty(idx));
        assert_eq!(pool.in_doubt_count(), 0);
        assert_eq!(pool.dirty_count(), 1);
    }

    #[test]
    fn test_load_for_redo_virgin_page() {
        let dir = tempdir().unwrap();
        let volumes = VolumeManager::new(dir.path()).unwrap();
        volumes.mount("vol1.db", 1).unwrap();
        let pool = BufferPool::new(8);
        let mut count = 0;
        let idx = pool.register_and_mark(pid(7), Lsn::new(1, 48), &mut count).unwrap();

        let mut frame = pool.cb(idx).latch.write();
        let past_end = pool.load_for_redo(idx, &volumes, &mut frame).unwrap();
        assert!(past_end);
        assert!(frame.as_ref().unwrap().page_lsn.is_null());
    }

    #[test]
    fn test_force_all_round_trips_through_volume() {
        let dir = tempdir().unwrap();
        let volumes = VolumeManager::new(dir.path()).unwrap();
        volumes.mount("vol1.db", 1).unwrap();
        let pool = BufferPool::new(8);

        let idx = pool.install_new(pid(2)).unwrap();
        {
            let mut frame = pool.cb(idx).latch.write();
            let page = frame.as_mut().unwrap();
            crate::page::apply_op(
                page,
                &crate::log_record::PageOp::Insert {
                    key: b"k".to_vec(),
                    value: b"v".to_vec(),
                    ghost: false,
                },
            )
            .unwrap();
            page.page_lsn = Lsn::new(1, 48);
        }
        pool.note_write(idx, Lsn::new(1, 48));
        assert_eq!(pool.dirty_count(), 1);

        pool.force_all(&volumes).unwrap();
        assert_eq!(pool.dirty_count(), 0);
        let back = volumes.read_page(pid(2)).unwrap();
        assert_eq!(back.get(b"k"), Some(&b"v"[..]));
        assert_eq!(back.page_lsn, Lsn::new(1, 48));
    }

    #[test]
    fn test_snapshot_dirty_covers_both_flags() {
        let pool = BufferPool::new(8);
        let mut count = 0;
        pool.register_and_mark(pid(1), Lsn::new(1, 48), &mut count).unwrap();
        let idx = pool.install_new(pid(2)).unwrap();
        pool.note_write(idx, Lsn::new(1, 96));
        let snap = pool.snapshot_dirty();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].pid, pid(1));
        assert_eq!(snap[0].rec_lsn, Lsn::new(1, 48));
        assert_eq!(snap[1].rec_lsn, Lsn::new(1, 96));
    }
}
