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

//! On-disk log partitions and the master pointer.
//!
//! The log is a directory of fixed-cap files `log.<partition>`. An LSN's
//! partition selects the file and its offset selects the byte. The master
//! pointer is a separate single-LSN file naming the `begin_checkpoint` of
//! the last complete checkpoint; it is updated by write-to-temp-then-rename
//! so a crash leaves either the old or the new value, never a torn one.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;
use emberdb_core::{Lsn, Result};

const MASTER_FILE: &str = "master";
const MASTER_TMP: &str = "master.tmp";

pub struct LogStorage {
    dir: PathBuf,
    files: Mutex<HashMap<u32, File>>,
}

impl LogStorage {
    pub fn open(dir: &Path) -> Result<LogStorage> {
        fs::create_dir_all(dir)?;
        Ok(LogStorage { dir: dir.to_path_buf(), files: Mutex::new(HashMap::new()) })
    }

    fn partition_path(&self, partition: u32) -> PathBuf {
        self.dir.join(format!("log.{partition}"))
    }

    fn with_file<T>(&self, partition: u32, f: impl FnOnce(&File) -> Result<T>) -> Result<T> {
        let mut files = self.files.lock();
        if !files.contains_key(&partition) {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(self.partition_path(partition))?;
            files.insert(partition, file);
        }
        f(files.get(&partition).expect("just inserted"))
    }

    pub fn write_at(&self, partition: u32, offset: u32, data: &[u8]) -> Result<()> {
        self.with_file(partition, |file| {
            file.write_all_at(data, offset as u64)?;
            Ok(())
        })
    }

    /// Read up to `buf.len()` bytes; returns how many were available.
    pub fn read_at(&self, partition: u32, offset: u32, buf: &mut [u8]) -> Result<usize> {
        self.with_file(partition, |file| {
            let len = file.metadata()?.len();
            if offset as u64 >= len {
                return Ok(0);
            }
            let avail = ((len - offset as u64) as usize).min(buf.len());
            file.read_exact_at(&mut buf[..avail], offset as u64)?;
            Ok(avail)
        })
    }

    pub fn sync(&self, partition: u32) -> Result<()> {
        self.with_file(partition, |file| {
            file.sync_data()?;
            Ok(())
        })
    }

    pub fn partition_len(&self, partition: u32) -> Result<u64> {
        if !self.partition_path(partition).exists() {
            return Ok(0);
        }
        self.with_file(partition, |file| Ok(file.metadata()?.len()))
    }

    pub fn partition_exists(&self, partition: u32) -> bool {
        self.partition_path(partition).exists()
    }

    /// Existing partition numbers, ascending.
    pub fn list_partitions(&self) -> Result<Vec<u32>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(num) = name.strip_prefix("log.") {
                if let Ok(p) = num.parse::<u32>() {
                    out.push(p);
                }
            }
        }
        out.sort_unstable();
        Ok(out)
    }

    pub fn remove_partition(&self, partition: u32) -> Result<()> {
        self.files.lock().remove(&partition);
        let path = self.partition_path(partition);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // master pointer
    // ------------------------------------------------------------------

    /// Null means no complete checkpoint exists: a brand-new database.
    pub fn read_master(&self) -> Result<Lsn> {
        let path = self.dir.join(MASTER_FILE);
        if !path.exists() {
            return Ok(Lsn::NULL);
        }
        let bytes = fs::read(path)?;
        if bytes.len() < 8 {
            return Ok(Lsn::NULL);
        }
        Ok(Lsn::from_raw(LittleEndian::read_u64(&bytes[0..8])))
    }

    /// Atomic update: write the temp file, fsync it, rename over the old.
    pub fn write_master(&self, master: Lsn) -> Result<()> {
        let tmp = self.dir.join(MASTER_TMP);
        let mut bytes = [0u8; 8];
        LittleEndian::write_u64(&mut bytes, master.to_raw());
        {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all_at(&bytes, 0)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, self.dir.join(MASTER_FILE))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_read_partition() {
        let dir = tempdir().unwrap();
        let storage = LogStorage::open(dir.path()).unwrap();
        storage.write_at(1, 0, b"hello").unwrap();
        storage.write_at(1, 5, b" world").unwrap();
        let mut buf = vec![0u8; 11];
        let n = storage.read_at(1, 0, &mut buf).unwrap();
        assert_eq!(n, 11);
        assert_eq!(&buf, b"hello world");
        // Reading past the end returns what is there.
        let mut buf = vec![0u8; 32];
        let n = storage.read_at(1, 6, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"world");
    }

    #[test]
    fn test_master_pointer_roundtrip() {
        let dir = tempdir().unwrap();
        let storage = LogStorage::open(dir.path()).unwrap();
        assert!(storage.read_master().unwrap().is_null());
        storage.write_master(Lsn::new(3, 4096)).unwrap();
        assert_eq!(storage.read_master().unwrap(), Lsn::new(3, 4096));
        storage.write_master(Lsn::new(4, 64)).unwrap();
        assert_eq!(storage.read_master().unwrap(), Lsn::new(4, 64));
    }

    #[test]
    fn test_list_and_remove_partitions() {
        let dir = tempdir().unwrap();
        let storage = LogStorage::open(dir.path()).unwrap();
        storage.write_at(1, 0, b"a").unwrap();
        storage.write_at(2, 0, b"b").unwrap();
        storage.write_at(5, 0, b"c").unwrap();
        assert_eq!(storage.list_partitions().unwrap(), vec![1, 2, 5]);
        storage.remove_partition(2).unwrap();
        assert_eq!(storage.list_partitions().unwrap(), vec![1, 5]);
        assert_eq!(storage.partition_len(2).unwrap(), 0);
    }
}
