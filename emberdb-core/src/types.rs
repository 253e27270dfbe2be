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

//! Shared identifier types and the transaction state machine.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Transaction identifier. Tid 0 is reserved for system records.
pub type TxnId = u64;

/// Volume (device) identifier. Volume 0 is never mounted.
pub type VolumeId = u32;

/// Store (index) number within a volume.
pub type StoreId = u32;

/// Page number within a volume. Page 0 is invalid.
pub type PageNum = u32;

/// Index of a page control block in the buffer pool arena.
/// Index 0 is reserved and never refers to a real control block.
pub type BfIdx = usize;

/// Fully-qualified page identifier: volume + store + page number.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageId {
    pub vol: VolumeId,
    pub store: StoreId,
    pub page: PageNum,
}

impl PageId {
    pub const NULL: PageId = PageId { vol: 0, store: 0, page: 0 };

    #[inline]
    pub fn new(vol: VolumeId, store: StoreId, page: PageNum) -> Self {
        PageId { vol, store, page }
    }

    /// A page is "null" when its page number is zero; records that carry no
    /// page reference use this value.
    #[inline]
    pub fn is_null(self) -> bool {
        self.page == 0
    }

    /// Hashtable key for the buffer pool: `(volume, page)` packed into a
    /// u64. The store number is descriptive, not identifying.
    #[inline]
    pub fn key(self) -> u64 {
        ((self.vol as u64) << 32) | self.page as u64
    }
}

impl fmt::Debug for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.vol, self.store, self.page)
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.vol, self.store, self.page)
    }
}

/// Transaction lifecycle states.
///
/// Normal commit walks `Active -> FreeingSpace -> Ended`; abort walks
/// `Active -> Aborting -> Ended`. During restart, Log Analysis moves a
/// transaction straight to `Ended` when it sees a terminal record, and
/// only `Active` and `Ended` descriptors survive the Analysis pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum TxnState {
    Active = 0,
    FreeingSpace = 1,
    Aborting = 2,
    Ended = 3,
}

impl TxnState {
    pub fn from_u8(v: u8) -> Option<TxnState> {
        match v {
            0 => Some(TxnState::Active),
            1 => Some(TxnState::FreeingSpace),
            2 => Some(TxnState::Aborting),
            3 => Some(TxnState::Ended),
            _ => None,
        }
    }
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TxnState::Active => "active",
            TxnState::FreeingSpace => "freeing_space",
            TxnState::Aborting => "aborting",
            TxnState::Ended => "ended",
        };
        f.write_str(s)
    }
}
