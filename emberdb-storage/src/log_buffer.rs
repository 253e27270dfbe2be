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

//! In-memory log buffer: the insert ring and the segment read cache.
//!
//! The log's byte space is linearized into *virtual addresses*:
//! `vaddr = partition * partition_bytes + offset`. Partitions are padded to
//! their full cap by the terminal skip record, so the address space is
//! contiguous and every LSN maps 1:1 to a vaddr.
//!
//! ```text
//!            ◀──────────── ring capacity ────────────▶
//!  ──────────┬──────────────┬──────────────┬──────────▶ vaddr
//!        flushed_v      written_v      reserved_v
//!            │  flushable   │   reserved,  │
//!            │  (complete)  │  being copied│
//! ```
//!
//! - `[flushed_v, written_v)` holds completely-copied records the flush
//!   daemon may harden and readers may fetch.
//! - `[written_v, reserved_v)` is reserved but possibly still being
//!   copied; nobody reads it.
//! - Reservation blocks while it would overwrite bytes the daemon has not
//!   flushed yet (`reserved_v - flushed_v` may never exceed the capacity).
//!
//! Records older than `flushed_v` have left the ring; fetch serves them
//! through a segment cache keyed by segment base address. On a miss the
//! replacement policy evicts the cached segment farthest from both the
//! insert and flush frontiers.

use std::collections::HashMap;

use emberdb_core::{EngineError, Lsn, Result};

use crate::log_storage::LogStorage;

/// Linearize an LSN into the log's contiguous byte address space.
#[inline]
pub fn vaddr(lsn: Lsn, partition_bytes: u32) -> u64 {
    lsn.partition() as u64 * partition_bytes as u64 + lsn.offset() as u64
}

/// Inverse of [`vaddr`].
#[inline]
pub fn lsn_of(v: u64, partition_bytes: u32) -> Lsn {
    Lsn::new(
        (v / partition_bytes as u64) as u32,
        (v % partition_bytes as u64) as u32,
    )
}

/// Copy `data` into the ring at virtual address `v`, wrapping as needed.
pub fn ring_write(ring: &mut [u8], v: u64, data: &[u8]) {
    let cap = ring.len();
    let pos = (v % cap as u64) as usize;
    let first = data.len().min(cap - pos);
    ring[pos..pos + first].copy_from_slice(&data[..first]);
    if first < data.len() {
        ring[..data.len() - first].copy_from_slice(&data[first..]);
    }
}

/// Copy `out.len()` bytes out of the ring starting at virtual address `v`.
pub fn ring_read(ring: &[u8], v: u64, out: &mut [u8]) {
    let cap = ring.len();
    let pos = (v % cap as u64) as usize;
    let first = out.len().min(cap - pos);
    out[..first].copy_from_slice(&ring[pos..pos + first]);
    if first < out.len() {
        let rest = out.len() - first;
        out[first..].copy_from_slice(&ring[..rest]);
    }
}

struct CachedSeg {
    data: Vec<u8>,
}

/// Fetch-side segment cache over the partition files.
pub struct ReadCache {
    seg_bytes: usize,
    partition_bytes: u32,
    max_segs: usize,
    segs: HashMap<u64, CachedSeg>,
    hits: u64,
    misses: u64,
}

impl ReadCache {
    pub fn new(seg_bytes: usize, partition_bytes: u32, max_segs: usize) -> ReadCache {
        ReadCache {
            seg_bytes,
            partition_bytes,
            max_segs: max_segs.max(2),
            segs: HashMap::new(),
            hits: 0,
            misses: 0,
        }
    }

    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }

    /// Read `len` bytes starting at `v` from the partition files, through
    /// the cache. `insert_v`/`flush_v` drive the replacement policy.
    pub fn read_bytes(
        &mut self,
        storage: &LogStorage,
        v: u64,
        len: usize,
        insert_v: u64,
        flush_v: u64,
    ) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        let mut cur = v;
        while out.len() < len {
            let base = cur - (cur % self.seg_bytes as u64);
            let seg_off = (cur - base) as usize;
            let want = len - out.len();

            let avail = self.seg_data_len(base);
            if avail <= seg_off {
                // Miss, or a partial tail segment that has since grown on
                // disk: (re)load it.
                self.load_segment(storage, base, insert_v, flush_v)?;
            }
            let seg = self.segs.get(&base).expect("just loaded");
            if seg.data.len() <= seg_off {
                return Err(EngineError::CorruptLogHeader {
                    lsn: lsn_of(cur, self.partition_bytes),
                    reason: "read past durable end of partition".into(),
                });
            }
            let take = want.min(seg.data.len() - seg_off).min(self.seg_bytes - seg_off);
            out.extend_from_slice(&seg.data[seg_off..seg_off + take]);
            cur += take as u64;
        }
        Ok(out)
    }

    fn seg_data_len(&mut self, base: u64) -> usize {
        match self.segs.get(&base) {
            Some(seg) => {
                self.hits += 1;
                seg.data.len()
            }
            None => 0,
        }
    }

    fn load_segment(
        &mut self,
        storage: &LogStorage,
        base: u64,
        insert_v: u64,
        flush_v: u64,
    ) -> Result<()> {
        self.misses += 1;
        let lsn = lsn_of(base, self.partition_bytes);
        let mut buf = vec![0u8; self.seg_bytes];
        let n = storage.read_at(lsn.partition(), lsn.offset(), &mut buf)?;
        buf.truncate(n);
        if self.segs.len() >= self.max_segs && !self.segs.contains_key(&base) {
            self.evict(insert_v, flush_v);
        }
        self.segs.insert(base, CachedSeg { data: buf });
        Ok(())
    }

    /// Evict the segment farthest from both frontiers: the one least
    /// likely to be touched by an ongoing forward scan near the flush
    /// point or a backward scan near the insert point.
    fn evict(&mut self, insert_v: u64, flush_v: u64) {
        let victim = self
            .segs
            .keys()
            .copied()
            .max_by_key(|&base| base.abs_diff(insert_v).min(base.abs_diff(flush_v)));
        if let Some(base) = victim {
            self.segs.remove(&base);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_vaddr_roundtrip() {
        let pb = 64 * 1024;
        for lsn in [Lsn::new(1, 0), Lsn::new(1, 48), Lsn::new(9, 65535)] {
            assert_eq!(lsn_of(vaddr(lsn, pb), pb), lsn);
        }
        // Contiguity across the partition boundary.
        assert_eq!(
            vaddr(Lsn::new(2, 0), pb),
            vaddr(Lsn::new(1, pb - 1), pb) + 1
        );
    }

    #[test]
    fn test_ring_wraparound() {
        let mut ring = vec![0u8; 16];
        ring_write(&mut ring, 12, b"abcdefgh");
        let mut out = [0u8; 8];
        ring_read(&ring, 12, &mut out);
        assert_eq!(&out, b"abcdefgh");
        // The wrap landed at the front of the ring.
        assert_eq!(&ring[..4], b"efgh");
        assert_eq!(&ring[12..], b"abcd");
    }

    #[test]
    fn test_read_cache_serves_and_refreshes() {
        let dir = tempdir().unwrap();
        let storage = LogStorage::open(dir.path()).unwrap();
        let pb: u32 = 1024;
        storage.write_at(1, 0, b"0123456789").unwrap();

        let mut cache = ReadCache::new(64, pb, 4);
        let base_v = vaddr(Lsn::new(1, 0), pb);
        let got = cache.read_bytes(&storage, base_v, 10, base_v, base_v).unwrap();
        assert_eq!(&got, b"0123456789");
        let (_, misses) = cache.stats();
        assert_eq!(misses, 1);

        // The tail segment grows on disk; the cache must refresh rather
        // than serve the stale short copy.
        storage.write_at(1, 10, b"abcdef").unwrap();
        let got = cache.read_bytes(&storage, base_v + 10, 6, base_v, base_v).unwrap();
        assert_eq!(&got, b"abcdef");
    }

    #[test]
    fn test_read_cache_eviction_prefers_far_segments() {
        let dir = tempdir().unwrap();
        let storage = LogStorage::open(dir.path()).unwrap();
        let pb: u32 = 1 << 20;
        // Four segments of 64 bytes each at offsets 0, 64, 128, 192.
        storage.write_at(1, 0, &[7u8; 256]).unwrap();

        let mut cache = ReadCache::new(64, pb, 2);
        let v0 = vaddr(Lsn::new(1, 0), pb);
        // Frontiers sit near offset 0: the far segment gets evicted first.
        cache.read_bytes(&storage, v0, 8, v0, v0).unwrap();
        cache.read_bytes(&storage, v0 + 192, 8, v0, v0).unwrap();
        cache.read_bytes(&storage, v0 + 64, 8, v0, v0).unwrap();
        // Segment at 192 was farthest from both frontiers and is gone;
        // segment at 0 is still cached.
        assert!(cache.segs.contains_key(&v0));
        assert!(!cache.segs.contains_key(&(v0 + 192)));
    }
}
