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

//! Engine configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// How much of the system is open while restart runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryMode {
    /// One driver thread runs Analysis, Redo and Undo to completion before
    /// any user transaction is admitted.
    Serial,
    /// The store opens for user transactions after Analysis; Redo and Undo
    /// run on a dedicated restart thread. Concurrent transactions are
    /// fenced by the commit LSN computed during Analysis.
    ConcurrentCommitLsn,
    /// Intended contract: locks for doomed transactions are acquired during
    /// Analysis and released during Undo, so user transactions conflict
    /// through the lock manager instead of the commit LSN. Not implemented;
    /// selecting it fails with `EngineError::NotImplemented`.
    ConcurrentLock,
}

/// Which Redo strategy the restart thread uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RedoMode {
    /// Forward log scan from the redo LSN, applying each record to its page.
    LogDriven,
    /// Buffer-pool scan: every in-doubt control block is recovered with
    /// single-page recovery using the last LSN captured for it in Analysis.
    PageDriven,
    /// No bulk Redo; pages recover on first access. Not implemented as a
    /// bulk mode; on-demand recovery of contended pages still happens in
    /// concurrent recovery regardless of this setting.
    SprOnDemand,
}

/// Which Undo strategy the restart thread uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UndoMode {
    /// Strictly reverse chronological: a max-heap over the doomed
    /// transactions' undo-next LSNs interleaves their rollbacks.
    Reverse,
    /// Each doomed transaction is aborted independently.
    Transaction,
}

/// Engine configuration. `Default` gives values sized for tests; real
/// deployments override the directories and the log geometry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory holding `log.<partition>` files and the master pointer.
    pub log_dir: PathBuf,
    /// Directory holding volume (page file) data.
    pub data_dir: PathBuf,
    /// Total log size cap; inserts beyond it fail with OutOfLogSpace
    /// until scavenging reclaims partitions.
    pub log_max_bytes: u64,
    /// Per-partition byte cap. Must be a multiple of `segment_bytes`.
    pub partition_bytes: u32,
    /// Number of in-memory log buffer segments.
    pub buffer_segments: usize,
    /// Bytes per log buffer segment.
    pub segment_bytes: usize,
    /// Write granularity for the flush daemon.
    pub block_bytes: usize,
    /// Width of the insert consolidation array.
    pub active_slots: usize,
    /// Unflushed segments that trigger an unsolicited daemon flush.
    pub flush_trigger_segments: usize,
    pub recovery_mode: RecoveryMode,
    pub redo_mode: RedoMode,
    pub undo_mode: UndoMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("log"),
            data_dir: PathBuf::from("data"),
            log_max_bytes: 256 * 1024 * 1024,
            partition_bytes: 16 * 1024 * 1024,
            buffer_segments: 8,
            segment_bytes: 1024 * 1024,
            block_bytes: 8 * 1024,
            active_slots: 8,
            flush_trigger_segments: 2,
            recovery_mode: RecoveryMode::Serial,
            redo_mode: RedoMode::LogDriven,
            undo_mode: UndoMode::Reverse,
        }
    }
}

impl EngineConfig {
    /// A small geometry for unit tests: tiny partitions force rollover and
    /// a high flush trigger keeps durability under explicit test control.
    pub fn small_for_test(root: &std::path::Path) -> Self {
        Self {
            log_dir: root.join("log"),
            data_dir: root.join("data"),
            log_max_bytes: 8 * 1024 * 1024,
            partition_bytes: 64 * 1024,
            buffer_segments: 4,
            segment_bytes: 16 * 1024,
            block_bytes: 4 * 1024,
            active_slots: 4,
            flush_trigger_segments: usize::MAX,
            ..Self::default()
        }
    }

    /// Buffer capacity in bytes.
    pub fn buffer_bytes(&self) -> usize {
        self.buffer_segments * self.segment_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_geometry_consistent() {
        let c = EngineConfig::default();
        assert_eq!(c.partition_bytes as usize % c.segment_bytes, 0);
        assert!(c.buffer_bytes() >= 2 * c.segment_bytes);
    }

    #[test]
    fn test_small_geometry_consistent() {
        let c = EngineConfig::small_for_test(std::path::Path::new("/tmp/x"));
        assert_eq!(c.partition_bytes as usize % c.segment_bytes, 0);
        assert!(c.log_max_bytes >= c.partition_bytes as u64 * 4);
    }
}
