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

//! Page images and the per-record redo/undo dispatch.
//!
//! The page model is a slotted key/value map: just enough structure for
//! every record type in the log to have a real, self-contained redo and
//! undo. The header mirrors what recovery needs from a page: the LSN of
//! the last update applied (`page_lsn`) and a CRC32 over the image so a
//! torn page write surfaces as `BadChecksum` instead of silent corruption.
//!
//! Redo must be idempotent and order-insensitive across pages: multi-page
//! records (foster rebalance, merge) carry every moved entry in their body
//! so either side can be replayed without the other being recovered first.

use std::collections::BTreeMap;

use byteorder::{ByteOrder, LittleEndian};
use emberdb_core::{EngineError, Lsn, PageId, Result};

use crate::log_record::{FosterBody, LogRecord, PageOp, RecordType};

/// On-disk page size. A page image that serializes past this is an engine
/// bug surfaced as an error, not a torn write.
pub const PAGE_BYTES: usize = 8192;

const HEADER_BYTES: usize = 28;

/// One slot: a value plus the ghost bit (logically deleted, space kept).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub value: Vec<u8>,
    pub ghost: bool,
}

/// In-memory page image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub pid: PageId,
    /// LSN of the last update applied to this page.
    pub page_lsn: Lsn,
    slots: BTreeMap<Vec<u8>, Slot>,
}

impl Page {
    /// A freshly formatted, empty page.
    pub fn new(pid: PageId) -> Page {
        Page { pid, page_lsn: Lsn::NULL, slots: BTreeMap::new() }
    }

    /// Live (non-ghost) lookup.
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        match self.slots.get(key) {
            Some(slot) if !slot.ghost => Some(&slot.value),
            _ => None,
        }
    }

    pub fn slot(&self, key: &[u8]) -> Option<&Slot> {
        self.slots.get(key)
    }

    pub fn live_count(&self) -> usize {
        self.slots.values().filter(|s| !s.ghost).count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &Vec<u8>> {
        self.slots.keys()
    }

    /// Serialize to a fixed-size page image with the checksum stamped.
    ///
    /// Layout: `page_lsn(8) | checksum(4) | vol(4) | store(4) | page(4) |
    /// count(4) | entries... | zero padding`. The checksum covers
    /// everything except its own four bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; PAGE_BYTES];
        LittleEndian::write_u64(&mut buf[0..8], self.page_lsn.to_raw());
        LittleEndian::write_u32(&mut buf[12..16], self.pid.vol);
        LittleEndian::write_u32(&mut buf[16..20], self.pid.store);
        LittleEndian::write_u32(&mut buf[20..24], self.pid.page);
        LittleEndian::write_u32(&mut buf[24..28], self.slots.len() as u32);
        let mut pos = HEADER_BYTES;
        for (key, slot) in &self.slots {
            let need = 4 + key.len() + 4 + slot.value.len() + 1;
            if pos + need > PAGE_BYTES {
                return Err(EngineError::InvalidArgument(format!(
                    "page {} image overflows {} bytes",
                    self.pid, PAGE_BYTES
                )));
            }
            LittleEndian::write_u32(&mut buf[pos..pos + 4], key.len() as u32);
            pos += 4;
            buf[pos..pos + key.len()].copy_from_slice(key);
            pos += key.len();
            LittleEndian::write_u32(&mut buf[pos..pos + 4], slot.value.len() as u32);
            pos += 4;
            buf[pos..pos + slot.value.len()].copy_from_slice(&slot.value);
            pos += slot.value.len();
            buf[pos] = slot.ghost as u8;
            pos += 1;
        }
        let crc = page_checksum(&buf);
        LittleEndian::write_u32(&mut buf[8..12], crc);
        Ok(buf)
    }

    /// Deserialize and verify the checksum.
    pub fn from_bytes(buf: &[u8]) -> Result<Page> {
        if buf.len() != PAGE_BYTES {
            return Err(EngineError::BadChecksum("short page image".into()));
        }
        let stored = LittleEndian::read_u32(&buf[8..12]);
        if stored != page_checksum(buf) {
            return Err(EngineError::BadChecksum(format!(
                "page image checksum mismatch (stored {stored:#x})"
            )));
        }
        let page_lsn = Lsn::from_raw(LittleEndian::read_u64(&buf[0..8]));
        let pid = PageId::new(
            LittleEndian::read_u32(&buf[12..16]),
            LittleEndian::read_u32(&buf[16..20]),
            LittleEndian::read_u32(&buf[20..24]),
        );
        let count = LittleEndian::read_u32(&buf[24..28]) as usize;
        let mut slots = BTreeMap::new();
        let mut pos = HEADER_BYTES;
        for _ in 0..count {
            let klen = LittleEndian::read_u32(&buf[pos..pos + 4]) as usize;
            pos += 4;
            let key = buf[pos..pos + klen].to_vec();
            pos += klen;
            let vlen = LittleEndian::read_u32(&buf[pos..pos + 4]) as usize;
            pos += 4;
            let value = buf[pos..pos + vlen].to_vec();
            pos += vlen;
            let ghost = buf[pos] != 0;
            pos += 1;
            slots.insert(key, Slot { value, ghost });
        }
        Ok(Page { pid, page_lsn, slots })
    }

    fn apply_op(&mut self, op: &PageOp) -> Result<()> {
        match op {
            PageOp::Format { image } => {
                let formatted = Page::from_bytes(image)?;
                self.slots = formatted.slots;
            }
            PageOp::Insert { key, value, ghost } => {
                self.slots
                    .insert(key.clone(), Slot { value: value.clone(), ghost: *ghost });
            }
            PageOp::Update { key, new_value, .. } | PageOp::Overwrite { key, new_value, .. } => {
                match self.slots.get_mut(key) {
                    Some(slot) => slot.value = new_value.clone(),
                    // Replaying onto a page that skipped the insert (e.g.
                    // single-page recovery of a partial image) re-creates
                    // the slot.
                    None => {
                        self.slots.insert(
                            key.clone(),
                            Slot { value: new_value.clone(), ghost: false },
                        );
                    }
                }
            }
            PageOp::GhostMark { key } => {
                if let Some(slot) = self.slots.get_mut(key) {
                    slot.ghost = true;
                }
            }
            PageOp::GhostReclaim { key, .. } => {
                self.slots.remove(key);
            }
            PageOp::GhostReserve { key } => {
                self.slots
                    .insert(key.clone(), Slot { value: Vec::new(), ghost: true });
            }
            PageOp::Remove { key } => {
                self.slots.remove(key);
            }
            PageOp::Unmark { key } => {
                if let Some(slot) = self.slots.get_mut(key) {
                    slot.ghost = false;
                }
            }
        }
        Ok(())
    }
}

fn page_checksum(buf: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&buf[0..8]);
    hasher.update(&buf[12..]);
    hasher.finalize()
}

/// Apply the redo action of `rec` to `page`. The caller owns the
/// `page_lsn < lsn` comparison and advances `page_lsn` afterwards; this
/// function only mutates the body.
pub fn apply_redo(rec: &LogRecord, page: &mut Page) -> Result<()> {
    match rec.rtype {
        RecordType::PageImgFormat | RecordType::Compensate => {
            let op = PageOp::decode(&rec.payload)?;
            page.apply_op(&op)
        }
        RecordType::BtreeInsert
        | RecordType::BtreeInsertNonGhost
        | RecordType::BtreeUpdate
        | RecordType::BtreeOverwrite
        | RecordType::BtreeGhostMark
        | RecordType::BtreeGhostReclaim
        | RecordType::BtreeGhostReserve => {
            let op = PageOp::decode(&rec.payload)?;
            page.apply_op(&op)
        }
        RecordType::BtreeNorecAlloc => {
            // The second page is born empty; the first is untouched here.
            if page.pid.page == rec.page2 {
                page.slots.clear();
            }
            Ok(())
        }
        RecordType::BtreeFosterRebalance => {
            let body = FosterBody::decode(&rec.payload)?;
            if page.pid.page == rec.pid.page {
                // Source sheds everything at and above the separator.
                page.slots.retain(|k, _| k.as_slice() < body.sep_key.as_slice());
            } else if page.pid.page == rec.page2 {
                for (k, v) in &body.moved {
                    page.slots
                        .insert(k.clone(), Slot { value: v.clone(), ghost: false });
                }
            }
            Ok(())
        }
        RecordType::BtreeFosterMerge => {
            let body = FosterBody::decode(&rec.payload)?;
            if page.pid.page == rec.pid.page {
                for (k, v) in &body.moved {
                    page.slots
                        .insert(k.clone(), Slot { value: v.clone(), ghost: false });
                }
            } else if page.pid.page == rec.page2 {
                page.slots.clear();
            }
            Ok(())
        }
        // Pointer maintenance between foster parent and child; no slot
        // content moves, so the slotted image is unchanged.
        RecordType::BtreeFosterAdopt | RecordType::BtreeFosterDeadopt => Ok(()),
        // The allocation map owns the deletion; the body is untouched
        // until the dealloc record frees the slot.
        RecordType::PageSetToBeDeleted => Ok(()),
        other => Err(EngineError::Fatal(format!(
            "record type {other:?} has no page redo"
        ))),
    }
}

/// Compute the inverse operation for an undoable record.
///
/// Compensation records are redo-only; asking for their undo means the
/// CLR chain is corrupt, which is fatal.
pub fn undo_op(rec: &LogRecord) -> Result<PageOp> {
    if rec.is_cpsn() {
        return Err(EngineError::Fatal(
            "encountered undoable compensation record".into(),
        ));
    }
    if !rec.is_undo() {
        return Err(EngineError::Fatal(format!(
            "record type {:?} is not undoable",
            rec.rtype
        )));
    }
    let op = PageOp::decode(&rec.payload)?;
    op.inverse().ok_or_else(|| {
        EngineError::Fatal(format!(
            "no inverse for page op of record type {:?}",
            rec.rtype
        ))
    })
}

/// Apply an already-computed inverse operation (rollback path).
pub fn apply_op(page: &mut Page, op: &PageOp) -> Result<()> {
    page.apply_op(op)
}
