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

//! Background log flush daemon.
//!
//! One dedicated thread waits on a channel for either an explicit flush
//! request or a periodic tick. Explicit requests always flush; ticks flush
//! only when the unflushed byte count has crossed the configured trigger,
//! so durability stays under the caller's control at low write rates.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::log_manager::LogCore;

const TICK: Duration = Duration::from_millis(100);

pub(crate) enum DaemonMsg {
    /// Explicit flush request: harden everything written.
    Wake,
    /// Final flush, then exit.
    Shutdown,
    /// Exit without flushing; whatever is unflushed is lost (crash
    /// simulation).
    Abandon,
}

pub(crate) fn spawn(core: Arc<LogCore>) -> (Sender<DaemonMsg>, JoinHandle<()>) {
    let (tx, rx) = crossbeam_channel::unbounded();
    let handle = thread::Builder::new()
        .name("ember-log-flush".into())
        .spawn(move || daemon_loop(core, rx))
        .expect("spawn log flush daemon");
    (tx, handle)
}

fn daemon_loop(core: Arc<LogCore>, rx: Receiver<DaemonMsg>) {
    loop {
        match rx.recv_timeout(TICK) {
            Ok(DaemonMsg::Wake) => {
                if let Err(e) = core.flush_pass() {
                    tracing::error!(error = %e, "log flush failed");
                }
            }
            Ok(DaemonMsg::Shutdown) => {
                if let Err(e) = core.flush_pass() {
                    tracing::error!(error = %e, "final log flush failed");
                }
                break;
            }
            Ok(DaemonMsg::Abandon) => break,
            Err(RecvTimeoutError::Timeout) => {
                if core.unflushed_bytes() >= core.flush_trigger_bytes() {
                    if let Err(e) = core.flush_pass() {
                        tracing::error!(error = %e, "log flush failed");
                    }
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}
