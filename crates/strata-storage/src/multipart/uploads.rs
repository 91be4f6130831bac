use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use strata_common::error::{Result, StrataError};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use super::is_valid_upload_id;
use super::list::{is_upload_leaf, merged_list_dir};
use crate::naming::{MPART_META_PREFIX, SLASH_SEPARATOR, SYS_VOLUME, TMP_META_PREFIX, path_join, retain_slash};
use crate::traits::StorageAPI;
use crate::xl::meta::{DiskSlots, cleanup_on_disks, delete_from_disks, reduce_errs, rename_on_disks};

pub const UPLOADS_JSON_FILE: &str = "uploads.json";
const UPLOADS_JSON_VERSION: &str = "1.0.0";
const UPLOADS_JSON_FORMAT: &str = "xl";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadInfo {
    pub upload_id: String,
    pub initiated: DateTime<Utc>,
}

/// Active upload sessions of one object, in initiation order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadsIndex {
    pub version: String,
    pub format: String,
    #[serde(default)]
    pub uploads: Vec<UploadInfo>,
}

impl Default for UploadsIndex {
    fn default() -> Self {
        Self {
            version: UPLOADS_JSON_VERSION.to_string(),
            format: UPLOADS_JSON_FORMAT.to_string(),
            uploads: Vec::new(),
        }
    }
}

impl UploadsIndex {
    pub fn index(&self, upload_id: &str) -> Option<usize> {
        self.uploads
            .iter()
            .position(|upload| upload.upload_id == upload_id)
    }

    pub fn add_upload_id(&mut self, upload_id: &str, initiated: DateTime<Utc>) {
        if self.index(upload_id).is_some() {
            return;
        }
        self.uploads.push(UploadInfo {
            upload_id: upload_id.to_string(),
            initiated,
        });
    }

    pub fn remove_upload_id(&mut self, upload_id: &str) -> bool {
        match self.index(upload_id) {
            Some(idx) => {
                self.uploads.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.uploads.is_empty()
    }
}

/// `multipart/<bucket>/<object>` inside the system volume.
pub fn object_mpart_path(bucket: &str, object: &str) -> String {
    path_join(&[MPART_META_PREFIX, bucket, object])
}

pub fn uploads_json_path(bucket: &str, object: &str) -> String {
    path_join(&[MPART_META_PREFIX, bucket, object, UPLOADS_JSON_FILE])
}

pub async fn read_uploads_index(
    disk: &Arc<dyn StorageAPI>,
    bucket: &str,
    object: &str,
) -> Result<UploadsIndex> {
    let buf = disk
        .read_all(SYS_VOLUME, &uploads_json_path(bucket, object))
        .await?;
    serde_json::from_slice(&buf).map_err(|err| {
        StrataError::InternalError(format!("corrupt {UPLOADS_JSON_FILE} for {bucket}/{object}: {err}"))
    })
}

/// Reads the index from the first disk that answers.
pub async fn read_uploads_index_any(
    disks: &DiskSlots,
    bucket: &str,
    object: &str,
) -> Result<UploadsIndex> {
    for disk in disks.iter().flatten() {
        match read_uploads_index(disk, bucket, object).await {
            Err(StrataError::DiskNotFound) => continue,
            result => return result,
        }
    }
    Err(StrataError::DiskNotFound)
}

/// Replaces the index on every disk through a staging copy.
pub async fn write_uploads_index(
    disks: &DiskSlots,
    bucket: &str,
    object: &str,
    index: &UploadsIndex,
    write_quorum: usize,
) -> Result<()> {
    let buf = serde_json::to_vec(index)
        .map_err(|err| StrataError::InternalError(format!("encode {UPLOADS_JSON_FILE}: {err}")))?;
    let tmp_dir = path_join(&[TMP_META_PREFIX, &Uuid::new_v4().to_string()]);
    let tmp_path = path_join(&[&tmp_dir, UPLOADS_JSON_FILE]);

    let writes = disks.iter().map(|disk| {
        let buf = buf.as_slice();
        let tmp_path = tmp_path.as_str();
        async move {
            let Some(disk) = disk else {
                return Err(StrataError::DiskNotFound);
            };
            let mut sink = disk.create_file(SYS_VOLUME, tmp_path).await?;
            sink.write_all(buf).await?;
            sink.shutdown().await?;
            Ok(())
        }
    });
    let results = join_all(writes).await;
    if let Err(err) = reduce_errs(results, write_quorum, StrataError::InsufficientWriteQuorum) {
        cleanup_on_disks(disks, SYS_VOLUME, &tmp_dir).await;
        return Err(err);
    }

    let result = rename_on_disks(
        disks,
        SYS_VOLUME,
        &tmp_path,
        SYS_VOLUME,
        &uploads_json_path(bucket, object),
        write_quorum,
        false,
    )
    .await;
    cleanup_on_disks(disks, SYS_VOLUME, &tmp_dir).await;
    result
}

/// Registers a session in the object's index, creating the index if needed.
pub async fn add_upload_id(
    disks: &DiskSlots,
    bucket: &str,
    object: &str,
    upload_id: &str,
    initiated: DateTime<Utc>,
    write_quorum: usize,
) -> Result<()> {
    let mut index = match read_uploads_index_any(disks, bucket, object).await {
        Ok(index) => index,
        Err(StrataError::FileNotFound(_)) => UploadsIndex::default(),
        Err(err) => return Err(err),
    };
    index.add_upload_id(upload_id, initiated);
    write_uploads_index(disks, bucket, object, &index, write_quorum).await
}

/// Drops a session from the object's index. With its last session the
/// object's multipart directory goes away: the index and any session
/// directory left behind by an interrupted operation.
pub async fn remove_upload_id(
    disks: &DiskSlots,
    bucket: &str,
    object: &str,
    upload_id: &str,
    write_quorum: usize,
) -> Result<()> {
    let mut index = read_uploads_index_any(disks, bucket, object).await?;
    index.remove_upload_id(upload_id);
    if index.is_empty() {
        purge_sessions(disks, bucket, object, write_quorum).await;
        return delete_from_disks(disks, SYS_VOLUME, &uploads_json_path(bucket, object), write_quorum)
            .await;
    }
    write_uploads_index(disks, bucket, object, &index, write_quorum).await
}

/// Removes the session directories under `multipart/<bucket>/<object>/`.
/// Directories of nested keys carry their own index and are kept.
async fn purge_sessions(disks: &DiskSlots, bucket: &str, object: &str, write_quorum: usize) {
    let online: Vec<Arc<dyn StorageAPI>> = disks.iter().flatten().cloned().collect();
    let base = retain_slash(&object_mpart_path(bucket, object));
    let entries = match merged_list_dir(&online, &base).await {
        Ok(entries) => entries,
        Err(err) => {
            debug!(bucket, object, error = %err, "no session directories to purge");
            return;
        }
    };

    for entry in entries {
        let Some(child) = entry.strip_suffix(SLASH_SEPARATOR) else {
            continue;
        };
        if !is_valid_upload_id(child) || is_upload_leaf(&online, &base, child).await {
            continue;
        }
        let session = retain_slash(&path_join(&[&base, child]));
        if let Err(err) = delete_from_disks(disks, SYS_VOLUME, &session, write_quorum).await {
            warn!(bucket, object, upload_id = child, error = %err, "failed to purge session directory");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_tracks_sessions_in_order() {
        let mut index = UploadsIndex::default();
        let now = strata_common::time::now();
        index.add_upload_id("a", now);
        index.add_upload_id("b", now);
        index.add_upload_id("a", now);

        assert_eq!(index.uploads.len(), 2);
        assert_eq!(index.index("b"), Some(1));
        assert!(index.remove_upload_id("a"));
        assert!(!index.remove_upload_id("a"));
        assert_eq!(index.index("b"), Some(0));
        assert!(!index.is_empty());
    }

    #[test]
    fn paths_live_under_multipart_prefix() {
        assert_eq!(object_mpart_path("photos", "a/b.jpg"), "multipart/photos/a/b.jpg");
        assert_eq!(
            uploads_json_path("photos", "a/b.jpg"),
            "multipart/photos/a/b.jpg/uploads.json"
        );
    }
}
