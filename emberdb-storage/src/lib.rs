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

//! EmberDB storage: write-ahead log, buffer-pool bookkeeping and ARIES
//! restart.
//!
//! The crate is organized around three tightly-coupled subsystems:
//!
//! - the **log manager** ([`log_manager`]): an append-only durable record
//!   stream over fixed-size partition files, fronted by an in-memory
//!   buffer with a consolidation array for concurrent inserts and a
//!   background flush daemon;
//! - the **buffer pool's recovery bookkeeping** ([`buffer_pool`]):
//!   in-doubt/dirty page control blocks and the operations restart drives
//!   them with;
//! - the **restart driver** ([`recovery`]): the three-phase
//!   Analysis/Redo/Undo procedure, with serial and concurrent schedules
//!   and single-page recovery ([`spr`]) for corrupted or on-demand pages.
//!
//! [`engine::Engine`] wires everything together behind one context value.

pub mod buffer_pool;
pub mod carray;
pub mod checkpoint;
pub mod engine;
mod flush_daemon;
pub mod log_buffer;
pub mod log_manager;
pub mod log_record;
pub mod log_storage;
pub mod page;
pub mod recovery;
pub mod spr;
pub mod transaction;
pub mod volume;

pub use buffer_pool::{BufferPool, CbMeta, PageCb};
pub use checkpoint::{CheckpointHandle, CheckpointManager};
pub use engine::Engine;
pub use log_manager::{LogManager, LogScan};
pub use log_record::{LogRecord, PageOp, RecordType};
pub use page::{Page, PAGE_BYTES};
pub use recovery::AnalysisOutcome;
pub use transaction::{TransactionTable, TxnDescriptor};
pub use volume::VolumeManager;

pub use emberdb_core::{
    EngineConfig, EngineError, Lsn, PageId, RecoveryMode, RedoMode, Result, TxnId, TxnState,
    UndoMode,
};
