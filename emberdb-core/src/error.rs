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

//! Error types for EmberDB
//!
//! Three tiers of failure share one sum type:
//!
//! - recoverable at the call site (`LatchTimeout`, `BadChecksum`): the
//!   caller switches strategy, e.g. skips a contended page or falls back to
//!   single-page recovery;
//! - recoverable at the transaction (`OutOfLogSpace`, `Timeout`): the
//!   owning transaction aborts, drawing on its log reservation;
//! - fatal (`Fatal`, `UnknownRecordType`, `OutOfBufferSlots` during
//!   restart): propagated with `?` to the top of `recover()`, which logs
//!   and refuses to open the store.

use std::io;

use thiserror::Error;

use crate::lsn::Lsn;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("out of log space: need {need} bytes, {available} available")]
    OutOfLogSpace { need: u64, available: u64 },

    #[error("bad checksum: {0}")]
    BadChecksum(String),

    #[error("read past end of volume: {0}")]
    PastEnd(String),

    #[error("corrupt log header at {lsn}: {reason}")]
    CorruptLogHeader { lsn: Lsn, reason: String },

    #[error("no free buffer pool slot available")]
    OutOfBufferSlots,

    #[error("latch acquisition would block")]
    LatchTimeout,

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    #[error("unknown log record type: {0}")]
    UnknownRecordType(u8),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("volume not mounted: vid {0}")]
    NotMounted(u32),

    #[error("blocked by in-progress recovery: {0}")]
    RecoveryConflict(String),

    #[error("internal invariant violated: {0}")]
    Fatal(String),
}

impl EngineError {
    /// True for failures that abort the restart procedure outright rather
    /// than being handled at the call site or the owning transaction.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::Fatal(_)
                | EngineError::UnknownRecordType(_)
                | EngineError::OutOfBufferSlots
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
