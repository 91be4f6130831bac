#![allow(dead_code)]

use std::io::Cursor;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use strata_common::error::{Result, StrataError};
use strata_common::hash::md5_hex;
use strata_storage::datatypes::{CompletePart, FileInfo, VolInfo};
use strata_storage::traits::{ReadStream, WriteSink};
use strata_storage::{ErasureObjects, MultipartConfig, NsLockMap, ObjectLayer, StorageAPI, XlStorage};
use tempfile::TempDir;

/// A posix disk that can be switched off. While offline every call fails
/// with `DiskNotFound`.
#[derive(Debug)]
pub struct FaultyDisk {
    inner: XlStorage,
    offline: AtomicBool,
    /// Renames whose source starts with this prefix are refused.
    refused_renames: Mutex<Option<String>>,
}

impl FaultyDisk {
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn refuse_renames_from(&self, prefix: &str) {
        *self.refused_renames.lock().unwrap() = Some(prefix.to_string());
    }

    pub fn root_dir(&self) -> PathBuf {
        self.inner.root_dir().to_path_buf()
    }

    fn check(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StrataError::DiskNotFound);
        }
        Ok(())
    }

    /// Flips every byte of `volume/path` in place, keeping its length.
    pub fn corrupt(&self, volume: &str, path: &str) {
        let file = self.root_dir().join(volume).join(path);
        let mut bytes = std::fs::read(&file).unwrap();
        assert!(!bytes.is_empty(), "nothing to corrupt in {}", file.display());
        bytes.iter_mut().for_each(|byte| *byte = !*byte);
        std::fs::write(&file, bytes).unwrap();
    }

    /// Cuts `volume/path` down to `len` bytes.
    pub fn truncate(&self, volume: &str, path: &str, len: u64) {
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(self.root_dir().join(volume).join(path))
            .unwrap();
        file.set_len(len).unwrap();
    }

    /// Writes `bytes` at `volume/path` behind the storage layer's back.
    pub fn plant(&self, volume: &str, path: &str, bytes: &[u8]) {
        let file = self.root_dir().join(volume).join(path);
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        std::fs::write(file, bytes).unwrap();
    }

    pub fn exists(&self, volume: &str, path: &str) -> bool {
        self.root_dir().join(volume).join(path).exists()
    }
}

#[async_trait]
impl StorageAPI for FaultyDisk {
    fn endpoint(&self) -> String {
        self.inner.endpoint()
    }

    async fn make_vol(&self, volume: &str) -> Result<()> {
        self.check()?;
        self.inner.make_vol(volume).await
    }

    async fn list_vols(&self) -> Result<Vec<VolInfo>> {
        self.check()?;
        self.inner.list_vols().await
    }

    async fn stat_vol(&self, volume: &str) -> Result<VolInfo> {
        self.check()?;
        self.inner.stat_vol(volume).await
    }

    async fn delete_vol(&self, volume: &str) -> Result<()> {
        self.check()?;
        self.inner.delete_vol(volume).await
    }

    async fn list_dir(&self, volume: &str, dir_path: &str) -> Result<Vec<String>> {
        self.check()?;
        self.inner.list_dir(volume, dir_path).await
    }

    async fn read_file(&self, volume: &str, path: &str, offset: u64) -> Result<ReadStream> {
        self.check()?;
        self.inner.read_file(volume, path, offset).await
    }

    async fn create_file(&self, volume: &str, path: &str) -> Result<WriteSink> {
        self.check()?;
        self.inner.create_file(volume, path).await
    }

    async fn read_all(&self, volume: &str, path: &str) -> Result<Vec<u8>> {
        self.check()?;
        self.inner.read_all(volume, path).await
    }

    async fn stat_file(&self, volume: &str, path: &str) -> Result<FileInfo> {
        self.check()?;
        self.inner.stat_file(volume, path).await
    }

    async fn delete_file(&self, volume: &str, path: &str) -> Result<()> {
        self.check()?;
        self.inner.delete_file(volume, path).await
    }

    async fn rename_file(
        &self,
        src_volume: &str,
        src_path: &str,
        dst_volume: &str,
        dst_path: &str,
    ) -> Result<()> {
        self.check()?;
        let refused = self
            .refused_renames
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|prefix| src_path.starts_with(prefix.as_str()));
        if refused {
            return Err(StrataError::FileAccessDenied(src_path.to_string()));
        }
        self.inner
            .rename_file(src_volume, src_path, dst_volume, dst_path)
            .await
    }
}

pub struct TestDisks {
    // Keeps the directories alive for the test's duration.
    _temp_dir: TempDir,
    pub disks: Vec<Arc<FaultyDisk>>,
}

impl TestDisks {
    pub async fn new(count: usize) -> Self {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut disks = Vec::with_capacity(count);
        for idx in 0..count {
            let inner = XlStorage::new(temp_dir.path().join(format!("disk{idx}")))
                .await
                .unwrap();
            disks.push(Arc::new(FaultyDisk {
                inner,
                offline: AtomicBool::new(false),
                refused_renames: Mutex::new(None),
            }));
        }
        Self {
            _temp_dir: temp_dir,
            disks,
        }
    }

    pub fn storage(&self) -> Vec<Arc<dyn StorageAPI>> {
        self.disks
            .iter()
            .map(|disk| Arc::clone(disk) as Arc<dyn StorageAPI>)
            .collect()
    }

    pub fn slots(&self) -> Vec<Option<Arc<dyn StorageAPI>>> {
        self.storage().into_iter().map(Some).collect()
    }

    pub async fn make_vol(&self, volume: &str) {
        for disk in &self.disks {
            disk.make_vol(volume).await.unwrap();
        }
    }

    pub fn set_offline(&self, indices: &[usize]) {
        for idx in indices {
            self.disks[*idx].set_offline(true);
        }
    }

    pub fn count_existing(&self, volume: &str, path: &str) -> usize {
        self.disks
            .iter()
            .filter(|disk| disk.exists(volume, path))
            .count()
    }
}

/// Object layer over `count` test disks with a lowered part-size floor.
pub async fn object_layer(count: usize, block_size: usize, min_part_size: i64) -> (TestDisks, ErasureObjects) {
    let disks = TestDisks::new(count).await;
    let objects = reopen(&disks, block_size, min_part_size).await;
    (disks, objects)
}

/// A fresh object layer over disks that may already hold data.
pub async fn reopen(disks: &TestDisks, block_size: usize, min_part_size: i64) -> ErasureObjects {
    let config = MultipartConfig {
        min_part_size,
        ..MultipartConfig::default()
    };
    ErasureObjects::new(disks.storage(), block_size, config, Arc::new(NsLockMap::new()))
        .await
        .unwrap()
}

pub fn stream(data: &[u8]) -> ReadStream {
    Box::new(Cursor::new(data.to_vec()))
}

/// Deterministic, non-repeating-looking payload.
pub fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|idx| (idx as u32).wrapping_mul(31).wrapping_add(seed as u32) as u8)
        .collect()
}

pub async fn put_part(
    objects: &ErasureObjects,
    bucket: &str,
    key: &str,
    upload_id: &str,
    part_number: i32,
    data: &[u8],
) -> CompletePart {
    let etag = objects
        .put_object_part(
            bucket,
            key,
            upload_id,
            part_number,
            data.len() as i64,
            stream(data),
            Some(&md5_hex(data)),
        )
        .await
        .unwrap();
    CompletePart { part_number, etag }
}
