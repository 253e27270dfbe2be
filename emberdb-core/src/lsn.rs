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

//! Log Sequence Numbers
//!
//! An LSN addresses a byte position in the recovery log. It is a pair
//! `(partition, offset)` packed into a single `u64` with the partition in
//! the high 32 bits, so the packed representation orders lexicographically
//! by partition then offset for free.
//!
//! `Lsn::NULL` (all zeros) is the distinguished "no LSN" value: partition 0
//! is never allocated.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A log sequence number: `(partition, byte offset)` packed into 64 bits.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Lsn(u64);

impl Lsn {
    /// The null LSN. Partition 0 is reserved, so no real record has it.
    pub const NULL: Lsn = Lsn(0);

    /// The largest representable LSN, used as an initial value when
    /// computing minimums.
    pub const MAX: Lsn = Lsn(u64::MAX);

    #[inline]
    pub fn new(partition: u32, offset: u32) -> Self {
        Lsn(((partition as u64) << 32) | offset as u64)
    }

    #[inline]
    pub fn partition(self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[inline]
    pub fn offset(self) -> u32 {
        self.0 as u32
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Advance by `n` bytes within the current partition.
    #[inline]
    pub fn advance(self, n: u32) -> Lsn {
        Lsn::new(self.partition(), self.offset() + n)
    }

    /// The LSN one byte before this one in the total order.
    ///
    /// Used by flush-to-end: flushing up to `curr_lsn.predecessor()` hardens
    /// everything inserted so far without depending on a record that starts
    /// exactly at `curr_lsn`.
    #[inline]
    pub fn predecessor(self) -> Lsn {
        Lsn(self.0.saturating_sub(1))
    }

    #[inline]
    pub fn to_raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn from_raw(raw: u64) -> Lsn {
        Lsn(raw)
    }
}

impl fmt::Debug for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Lsn({}.{})", self.partition(), self.offset())
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.partition(), self.offset())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack() {
        let lsn = Lsn::new(7, 4096);
        assert_eq!(lsn.partition(), 7);
        assert_eq!(lsn.offset(), 4096);
        assert!(!lsn.is_null());
    }

    #[test]
    fn test_order_is_partition_then_offset() {
        assert!(Lsn::new(1, u32::MAX) < Lsn::new(2, 0));
        assert!(Lsn::new(2, 10) < Lsn::new(2, 11));
        assert!(Lsn::NULL < Lsn::new(1, 0));
    }

    #[test]
    fn test_advance_and_predecessor() {
        let lsn = Lsn::new(3, 100);
        assert_eq!(lsn.advance(28), Lsn::new(3, 128));
        assert_eq!(lsn.advance(28).predecessor().to_raw(), Lsn::new(3, 127).to_raw());
        // Predecessor of a partition start lands inside the previous
        // partition's address space, which is all the total order needs.
        let boundary = Lsn::new(4, 0).predecessor();
        assert_eq!(boundary.partition(), 3);
        assert!(boundary > Lsn::new(3, u32::MAX - 1));
    }

    #[test]
    fn test_null_is_smallest() {
        assert_eq!(Lsn::NULL, Lsn::default());
        assert!(Lsn::NULL.is_null());
        assert!(Lsn::NULL < Lsn::new(1, 0));
    }
}
