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

//! EmberDB core: shared types, errors and configuration.
//!
//! This crate carries what every subsystem of the storage engine needs to
//! name: LSNs, identifiers, the transaction state machine, the engine error
//! sum type and the engine configuration. The machinery itself lives in
//! `emberdb-storage`.

pub mod config;
pub mod error;
pub mod lsn;
pub mod types;

pub use config::{EngineConfig, RecoveryMode, RedoMode, UndoMode};
pub use error::{EngineError, Result};
pub use lsn::Lsn;
pub use types::{BfIdx, PageId, PageNum, StoreId, TxnId, TxnState, VolumeId};
