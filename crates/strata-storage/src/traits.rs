use std::collections::HashMap;
use std::fmt::Debug;

use async_trait::async_trait;
use strata_common::error::Result;
use strata_common::types::{BucketInfo, ObjectInfo};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::datatypes::{CompletePart, FileInfo, ListMultipartsInfo, ListPartsInfo, VolInfo};
use crate::erasure::ErasureReader;

pub type ReadStream = Box<dyn AsyncRead + Send + Unpin>;
pub type WriteSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Operations a single disk offers to the erasure layer. Implementations
/// report failures in the disk vocabulary (`DiskNotFound`, `VolumeNotFound`,
/// `FileNotFound`, ...) and leave quorum decisions to the caller.
#[async_trait]
pub trait StorageAPI: Debug + Send + Sync {
    fn endpoint(&self) -> String;

    async fn make_vol(&self, volume: &str) -> Result<()>;
    async fn list_vols(&self) -> Result<Vec<VolInfo>>;
    async fn stat_vol(&self, volume: &str) -> Result<VolInfo>;
    async fn delete_vol(&self, volume: &str) -> Result<()>;

    /// Entries of a directory, sub-directories carrying a trailing `/`.
    async fn list_dir(&self, volume: &str, dir_path: &str) -> Result<Vec<String>>;
    async fn read_file(&self, volume: &str, path: &str, offset: u64) -> Result<ReadStream>;
    async fn create_file(&self, volume: &str, path: &str) -> Result<WriteSink>;
    async fn read_all(&self, volume: &str, path: &str) -> Result<Vec<u8>>;
    async fn stat_file(&self, volume: &str, path: &str) -> Result<FileInfo>;
    /// Removes a file, or a whole directory tree, then prunes parents left empty.
    async fn delete_file(&self, volume: &str, path: &str) -> Result<()>;
    /// Renames a file, or a directory when both paths end in `/`.
    async fn rename_file(
        &self,
        src_volume: &str,
        src_path: &str,
        dst_volume: &str,
        dst_path: &str,
    ) -> Result<()>;
}

#[async_trait]
pub trait ObjectLayer: Send + Sync {
    async fn make_bucket(&self, bucket: &str) -> Result<()>;
    async fn get_bucket_info(&self, bucket: &str) -> Result<BucketInfo>;
    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<(ObjectInfo, ErasureReader)>;
    async fn get_object_info(&self, bucket: &str, key: &str) -> Result<ObjectInfo>;
    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()>;

    async fn new_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        metadata: HashMap<String, String>,
    ) -> Result<String>;
    #[allow(clippy::too_many_arguments)]
    async fn put_object_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        size: i64,
        data: ReadStream,
        md5_hex: Option<&str>,
    ) -> Result<String>;
    async fn list_object_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number_marker: i32,
        max_parts: i32,
    ) -> Result<ListPartsInfo>;
    async fn list_multipart_uploads(
        &self,
        bucket: &str,
        prefix: &str,
        key_marker: &str,
        upload_id_marker: &str,
        delimiter: &str,
        max_uploads: i32,
    ) -> Result<ListMultipartsInfo>;
    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletePart>,
    ) -> Result<ObjectInfo>;
    async fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str) -> Result<()>;
}
