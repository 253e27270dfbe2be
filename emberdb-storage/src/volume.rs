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

//! Volume mount table and page file I/O.
//!
//! A volume is one page file; page `n` lives at byte offset
//! `(n - 1) * PAGE_BYTES`. Reads distinguish three outcomes recovery cares
//! about: a good page, `PastEnd` (the file is shorter than the page, or the
//! slot was never written — a virgin page), and `BadChecksum` (a torn or
//! corrupted image, recovered via single-page recovery).

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};
use emberdb_core::{EngineError, Lsn, PageId, Result, VolumeId};

use crate::page::{Page, PAGE_BYTES};

struct Volume {
    path: String,
    file: File,
}

/// The set of mounted volumes plus the LSN of the most recent mount or
/// dismount record, which checkpoints capture so Analysis can rebuild the
/// device set at the redo point.
pub struct VolumeManager {
    data_dir: PathBuf,
    vols: RwLock<HashMap<VolumeId, Volume>>,
    last_mount_lsn: Mutex<Lsn>,
}

impl VolumeManager {
    pub fn new(data_dir: &Path) -> Result<VolumeManager> {
        std::fs::create_dir_all(data_dir)?;
        Ok(VolumeManager {
            data_dir: data_dir.to_path_buf(),
            vols: RwLock::new(HashMap::new()),
            last_mount_lsn: Mutex::new(Lsn::NULL),
        })
    }

    /// Open (creating if absent) the page file at `path` relative to the
    /// data directory and register it as `vid`. Re-mounting a mounted
    /// volume is a no-op; mounts replayed during Analysis hit this case
    /// when the device was already mounted by the checkpoint device table.
    pub fn mount(&self, path: &str, vid: VolumeId) -> Result<()> {
        if vid == 0 {
            return Err(EngineError::InvalidArgument("volume id 0 is reserved".into()));
        }
        let mut vols = self.vols.write();
        if vols.contains_key(&vid) {
            return Ok(());
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(self.data_dir.join(path))?;
        vols.insert(vid, Volume { path: path.to_string(), file });
        Ok(())
    }

    pub fn dismount(&self, vid: VolumeId) -> Result<()> {
        self.vols.write().remove(&vid);
        Ok(())
    }

    pub fn is_mounted(&self, vid: VolumeId) -> bool {
        self.vols.read().contains_key(&vid)
    }

    /// Snapshot of `(path, vid)` pairs for the checkpoint device table.
    pub fn mounted_devices(&self) -> Vec<(String, VolumeId)> {
        let vols = self.vols.read();
        let mut out: Vec<_> = vols.iter().map(|(&v, d)| (d.path.clone(), v)).collect();
        out.sort_by_key(|&(_, v)| v);
        out
    }

    pub fn last_mount_lsn(&self) -> Lsn {
        *self.last_mount_lsn.lock()
    }

    pub fn set_last_mount_lsn(&self, lsn: Lsn) {
        *self.last_mount_lsn.lock() = lsn;
    }

    /// Read a page image. `PastEnd` means the volume has no bytes for this
    /// page (never flushed); an all-zero slot reads the same way.
    pub fn read_page(&self, pid: PageId) -> Result<Page> {
        let vols = self.vols.read();
        let vol = vols.get(&pid.vol).ok_or(EngineError::NotMounted(pid.vol))?;
        let offset = (pid.page as u64 - 1) * PAGE_BYTES as u64;
        let len = vol.file.metadata()?.len();
        if offset + PAGE_BYTES as u64 > len {
            return Err(EngineError::PastEnd(format!("page {pid} beyond volume end")));
        }
        let mut buf = vec![0u8; PAGE_BYTES];
        vol.file.read_exact_at(&mut buf, offset)?;
        if buf.iter().all(|&b| b == 0) {
            return Err(EngineError::PastEnd(format!("page {pid} never written")));
        }
        Page::from_bytes(&buf)
    }

    /// Write a page image, stamping its checksum. Extends the file as
    /// needed; does not sync.
    pub fn write_page(&self, page: &Page) -> Result<()> {
        let bytes = page.to_bytes()?;
        let vols = self.vols.read();
        let vol = vols
            .get(&page.pid.vol)
            .ok_or(EngineError::NotMounted(page.pid.vol))?;
        let offset = (page.pid.page as u64 - 1) * PAGE_BYTES as u64;
        vol.file.write_all_at(&bytes, offset)?;
        Ok(())
    }

    /// fsync every mounted volume.
    pub fn sync_all(&self) -> Result<()> {
        for vol in self.vols.read().values() {
            vol.file.sync_all()?;
        }
        Ok(())
    }

    /// Corrupt one byte of a page image on disk. Test hook for the
    /// bad-checksum recovery path.
    #[doc(hidden)]
    pub fn corrupt_page_for_test(&self, pid: PageId) -> Result<()> {
        let vols = self.vols.read();
        let vol = vols.get(&pid.vol).ok_or(EngineError::NotMounted(pid.vol))?;
        let offset = (pid.page as u64 - 1) * PAGE_BYTES as u64 + 64;
        let mut byte = [0u8; 1];
        vol.file.read_exact_at(&mut byte, offset)?;
        byte[0] ^= 0xFF;
        vol.file.write_all_at(&byte, offset)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_record::PageOp;
    use crate::page::apply_op;
    use tempfile::tempdir;

    #[test]
    fn test_mount_write_read_roundtrip() {
        let dir = tempdir().unwrap();
        let vm = VolumeManager::new(dir.path()).unwrap();
        vm.mount("vol1.db", 1).unwrap();

        let pid = PageId::new(1, 0, 3);
        let mut page = Page::new(pid);
        apply_op(
            &mut page,
            &PageOp::Insert { key: b"k".to_vec(), value: b"v".to_vec(), ghost: false },
        )
        .unwrap();
        page.page_lsn = Lsn::new(1, 48);
        vm.write_page(&page).unwrap();

        let back = vm.read_page(pid).unwrap();
        assert_eq!(back, page);
    }

    #[test]
    fn test_virgin_page_reads_past_end() {
        let dir = tempdir().unwrap();
        let vm = VolumeManager::new(dir.path()).unwrap();
        vm.mount("vol1.db", 1).unwrap();
        match vm.read_page(PageId::new(1, 0, 9)) {
            Err(EngineError::PastEnd(_)) => {}
            other => panic!("expected PastEnd, got {other:?}"),
        }
    }

    #[test]
    fn test_zero_slot_reads_past_end() {
        let dir = tempdir().unwrap();
        let vm = VolumeManager::new(dir.path()).unwrap();
        vm.mount("vol1.db", 1).unwrap();
        // Writing page 2 extends the file past page 1's slot, which stays
        // all-zero: page 1 must still read as never-written.
        let page2 = Page::new(PageId::new(1, 0, 2));
        vm.write_page(&page2).unwrap();
        match vm.read_page(PageId::new(1, 0, 1)) {
            Err(EngineError::PastEnd(_)) => {}
            other => panic!("expected PastEnd, got {other:?}"),
        }
    }

    #[test]
    fn test_corrupted_page_reads_bad_checksum() {
        let dir = tempdir().unwrap();
        let vm = VolumeManager::new(dir.path()).unwrap();
        vm.mount("vol1.db", 1).unwrap();
        let pid = PageId::new(1, 0, 1);
        let mut page = Page::new(pid);
        apply_op(
            &mut page,
            &PageOp::Insert { key: b"k".to_vec(), value: b"v".to_vec(), ghost: false },
        )
        .unwrap();
        vm.write_page(&page).unwrap();
        vm.corrupt_page_for_test(pid).unwrap();
        match vm.read_page(pid) {
            Err(EngineError::BadChecksum(_)) => {}
            other => panic!("expected BadChecksum, got {other:?}"),
        }
    }

    #[test]
    fn test_unmounted_volume_rejected() {
        let dir = tempdir().unwrap();
        let vm = VolumeManager::new(dir.path()).unwrap();
        match vm.read_page(PageId::new(5, 0, 1)) {
            Err(EngineError::NotMounted(5)) => {}
            other => panic!("expected NotMounted, got {other:?}"),
        }
    }
}
