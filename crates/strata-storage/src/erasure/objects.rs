use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use strata_common::error::{Result, StrataError};
use strata_common::types::{BucketInfo, ObjectInfo};
use tracing::{debug, info, warn};

use crate::datatypes::{CompletePart, ListMultipartsInfo, ListPartsInfo};
use crate::erasure::{Erasure, ErasureReader};
use crate::naming::{SYS_VOLUME, is_valid_bucket_name, is_valid_object_name, parent_dir, path_join, retain_slash};
use crate::nslock::NsLockMap;
use crate::traits::{ObjectLayer, ReadStream, StorageAPI};
use crate::xl::meta::{self, XL_META_FILE, delete_from_disks, list_online_disks, reduce_errs};

pub const DEFAULT_MIN_PART_SIZE: i64 = 5 * 1024 * 1024;
pub const MAX_PARTS_LIST: i32 = 1000;
pub const MAX_UPLOADS_LIST: i32 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartConfig {
    /// Smallest size allowed for every part but the last.
    pub min_part_size: i64,
    pub max_parts_list: i32,
    pub max_uploads_list: i32,
}

impl Default for MultipartConfig {
    fn default() -> Self {
        Self {
            min_part_size: DEFAULT_MIN_PART_SIZE,
            max_parts_list: MAX_PARTS_LIST,
            max_uploads_list: MAX_UPLOADS_LIST,
        }
    }
}

/// Object layer over one erasure set.
#[derive(Debug, Clone)]
pub struct ErasureObjects {
    pub(crate) erasure: Erasure,
    pub(crate) ns_lock: Arc<NsLockMap>,
    pub(crate) config: MultipartConfig,
}

impl ErasureObjects {
    pub async fn new(
        disks: Vec<Arc<dyn StorageAPI>>,
        block_size: usize,
        config: MultipartConfig,
        ns_lock: Arc<NsLockMap>,
    ) -> Result<Self> {
        let erasure = Erasure::new(disks, block_size)?;
        let objects = Self {
            erasure,
            ns_lock,
            config,
        };

        let makes = objects.erasure.disks().iter().map(|disk| async move {
            match disk.make_vol(SYS_VOLUME).await {
                Ok(()) | Err(StrataError::VolumeExists(_)) => Ok(()),
                Err(err) => {
                    warn!(disk = %disk.endpoint(), error = %err, "failed to prepare system volume");
                    Err(err)
                }
            }
        });
        let results = join_all(makes).await;
        reduce_errs(results, objects.write_quorum(), StrataError::InsufficientWriteQuorum)?;

        let config = objects.erasure.config();
        info!(
            disks = objects.erasure.disks().len(),
            data_shards = config.data_shards,
            parity_shards = config.parity_shards,
            block_size = config.block_size,
            "erasure set ready"
        );
        Ok(objects)
    }

    pub fn erasure(&self) -> &Erasure {
        &self.erasure
    }

    pub fn ns_lock(&self) -> &Arc<NsLockMap> {
        &self.ns_lock
    }

    pub fn multipart_config(&self) -> &MultipartConfig {
        &self.config
    }

    pub(crate) fn disk_slots(&self) -> Vec<Option<Arc<dyn StorageAPI>>> {
        self.erasure.disks().iter().cloned().map(Some).collect()
    }

    pub(crate) fn read_quorum(&self) -> usize {
        self.erasure.config().read_quorum()
    }

    pub(crate) fn write_quorum(&self) -> usize {
        self.erasure.config().write_quorum()
    }

    pub async fn is_bucket_exist(&self, bucket: &str) -> bool {
        let stats = self.erasure.disks().iter().map(|disk| disk.stat_vol(bucket));
        let found = join_all(stats)
            .await
            .into_iter()
            .filter(|result| result.is_ok())
            .count();
        found >= self.read_quorum()
    }

    pub(crate) async fn check_bucket(&self, bucket: &str) -> Result<()> {
        if !is_valid_bucket_name(bucket) {
            return Err(StrataError::InvalidBucketName(bucket.to_string()));
        }
        if !self.is_bucket_exist(bucket).await {
            return Err(StrataError::BucketNotFound(bucket.to_string()));
        }
        Ok(())
    }

    /// Number of disks carrying metadata at `volume/path`.
    pub(crate) async fn object_meta_count(&self, volume: &str, path: &str) -> usize {
        let meta_path = path_join(&[path, XL_META_FILE]);
        let stats = self
            .erasure
            .disks()
            .iter()
            .map(|disk| disk.stat_file(volume, &meta_path));
        join_all(stats)
            .await
            .into_iter()
            .filter(|result| result.is_ok())
            .count()
    }

    /// True when a quorum of disks has metadata at `volume/path`.
    pub async fn is_object(&self, volume: &str, path: &str) -> bool {
        self.object_meta_count(volume, path).await >= self.read_quorum()
    }

    /// True when an object sits at `parent` or any directory above it.
    pub async fn parent_dir_is_object(&self, bucket: &str, parent: &str) -> bool {
        let mut current = parent;
        while current != "." && current != "/" && !current.is_empty() {
            if self.is_object(bucket, current).await {
                return true;
            }
            current = parent_dir(current);
        }
        false
    }

    /// Renames an object directory across the set, undoing on quorum loss.
    pub async fn rename_object(
        &self,
        src_bucket: &str,
        src_object: &str,
        dst_bucket: &str,
        dst_object: &str,
    ) -> Result<()> {
        meta::rename_object(
            &self.disk_slots(),
            src_bucket,
            src_object,
            dst_bucket,
            dst_object,
            self.write_quorum(),
        )
        .await
    }
}

pub(crate) fn check_object_name(bucket: &str, object: &str) -> Result<()> {
    if !is_valid_object_name(object) {
        return Err(StrataError::InvalidObjectName {
            bucket: bucket.to_string(),
            object: object.to_string(),
        });
    }
    Ok(())
}

#[async_trait]
impl ObjectLayer for ErasureObjects {
    async fn make_bucket(&self, bucket: &str) -> Result<()> {
        if !is_valid_bucket_name(bucket) {
            return Err(StrataError::InvalidBucketName(bucket.to_string()));
        }

        let makes = self.erasure.disks().iter().map(|disk| disk.make_vol(bucket));
        let results = join_all(makes).await;
        let existing = results
            .iter()
            .filter(|result| matches!(result, Err(StrataError::VolumeExists(_))))
            .count();
        if existing >= self.write_quorum() {
            return Err(StrataError::BucketAlreadyExists(bucket.to_string()));
        }

        reduce_errs(results, self.write_quorum(), StrataError::InsufficientWriteQuorum)
            .map_err(|err| err.into_object_err(bucket, ""))?;
        info!(bucket, "bucket created");
        Ok(())
    }

    async fn get_bucket_info(&self, bucket: &str) -> Result<BucketInfo> {
        if !is_valid_bucket_name(bucket) {
            return Err(StrataError::InvalidBucketName(bucket.to_string()));
        }

        let stats = self.erasure.disks().iter().map(|disk| disk.stat_vol(bucket));
        let results = join_all(stats).await;
        let created = results.iter().flatten().map(|vol| vol.created).min();

        reduce_errs(results, self.read_quorum(), StrataError::InsufficientReadQuorum)
            .map_err(|err| err.into_object_err(bucket, ""))?;
        let created =
            created.ok_or_else(|| StrataError::BucketNotFound(bucket.to_string()))?;
        Ok(BucketInfo {
            name: bucket.to_string(),
            created,
        })
    }

    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<(ObjectInfo, ErasureReader)> {
        self.check_bucket(bucket).await?;
        check_object_name(bucket, key)?;

        let guard = self.ns_lock.rlock(bucket, key).await;
        let online = list_online_disks(&self.disk_slots(), bucket, key, self.read_quorum())
            .await
            .map_err(|err| err.into_object_err(bucket, key))?;
        let object_info = online.meta.to_object_info(bucket, key);

        let size = online.meta.stat.size.max(0) as u64;
        let length = match length {
            Some(length) => length,
            None => size.saturating_sub(offset),
        };
        if offset > size || offset.saturating_add(length) > size {
            return Err(StrataError::InvalidArgument(format!(
                "range {offset}+{length} outside object of {size} bytes"
            )));
        }

        let ranges: Vec<(String, u64, u64)> = online
            .meta
            .part_ranges(offset, length)
            .into_iter()
            .map(|(idx, part_offset, part_length)| {
                (
                    path_join(&[key, &online.meta.parts[idx].name]),
                    part_offset,
                    part_length,
                )
            })
            .collect();

        // Parts are decoded with the layout they were written with.
        let erasure = self.erasure.with_block_size(online.meta.erasure.block_size)?;
        let (tx, reader) = ErasureReader::channel();
        let disks = online.disks;
        let bucket = bucket.to_string();
        tokio::spawn(async move {
            // Writers on this object wait until the stream is drained or dropped.
            let _guard = guard;
            for (part_path, part_offset, part_length) in ranges {
                let mut part = match erasure
                    .read_file_from(&disks, &bucket, &part_path, part_offset, part_length)
                    .await
                {
                    Ok(part) => part,
                    Err(err) => {
                        let _ = tx.send(Err(err)).await;
                        return;
                    }
                };
                loop {
                    match part.next_chunk().await {
                        Ok(Some(chunk)) => {
                            if tx.send(Ok(chunk)).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            let _ = tx.send(Err(err)).await;
                            return;
                        }
                    }
                }
            }
        });

        debug!(bucket = %object_info.bucket, object = key, offset, length, "streaming object");
        Ok((object_info, reader))
    }

    async fn get_object_info(&self, bucket: &str, key: &str) -> Result<ObjectInfo> {
        self.check_bucket(bucket).await?;
        check_object_name(bucket, key)?;

        let _guard = self.ns_lock.rlock(bucket, key).await;
        let online = list_online_disks(&self.disk_slots(), bucket, key, self.read_quorum())
            .await
            .map_err(|err| err.into_object_err(bucket, key))?;
        Ok(online.meta.to_object_info(bucket, key))
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        self.check_bucket(bucket).await?;
        check_object_name(bucket, key)?;

        let _guard = self.ns_lock.lock(bucket, key).await;
        if !self.is_object(bucket, key).await {
            return Err(StrataError::ObjectNotFound {
                bucket: bucket.to_string(),
                object: key.to_string(),
            });
        }
        delete_from_disks(&self.disk_slots(), bucket, &retain_slash(key), self.write_quorum())
            .await
            .map_err(|err| err.into_object_err(bucket, key))?;
        info!(bucket, object = key, "object deleted");
        Ok(())
    }

    async fn new_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        metadata: HashMap<String, String>,
    ) -> Result<String> {
        self.new_upload(bucket, key, metadata).await
    }

    async fn put_object_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        size: i64,
        data: ReadStream,
        md5_hex: Option<&str>,
    ) -> Result<String> {
        self.put_part(bucket, key, upload_id, part_number, size, data, md5_hex)
            .await
    }

    async fn list_object_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number_marker: i32,
        max_parts: i32,
    ) -> Result<ListPartsInfo> {
        self.list_parts(bucket, key, upload_id, part_number_marker, max_parts)
            .await
    }

    async fn list_multipart_uploads(
        &self,
        bucket: &str,
        prefix: &str,
        key_marker: &str,
        upload_id_marker: &str,
        delimiter: &str,
        max_uploads: i32,
    ) -> Result<ListMultipartsInfo> {
        self.list_uploads(bucket, prefix, key_marker, upload_id_marker, delimiter, max_uploads)
            .await
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletePart>,
    ) -> Result<ObjectInfo> {
        self.complete_upload(bucket, key, upload_id, parts).await
    }

    async fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str) -> Result<()> {
        self.abort_upload(bucket, key, upload_id).await
    }
}
