use std::collections::BTreeSet;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use strata_common::error::{Result, StrataError};
use tracing::debug;

use crate::datatypes::{ListMultipartsInfo, MultipartUploadInfo};
use crate::erasure::objects::ErasureObjects;
use crate::multipart::is_valid_upload_id;
use crate::multipart::uploads::{UPLOADS_JSON_FILE, object_mpart_path, read_uploads_index_any};
use crate::naming::{
    MPART_META_PREFIX, SLASH_SEPARATOR, SYS_VOLUME, is_valid_bucket_name, is_valid_object_prefix,
    path_join, retain_slash,
};
use crate::traits::StorageAPI;

/// One listing entry: a key with its pending sessions, or a common prefix.
enum Listed {
    Upload(MultipartUploadInfo),
    Prefix(String),
}

/// Directory entries of `dir` merged over every disk, sorted.
pub(crate) async fn merged_list_dir(disks: &[Arc<dyn StorageAPI>], dir: &str) -> Result<BTreeSet<String>> {
    let results = join_all(disks.iter().map(|disk| disk.list_dir(SYS_VOLUME, dir))).await;

    let mut entries = BTreeSet::new();
    let mut answered = false;
    let mut last_err = None;
    for result in results {
        match result {
            Ok(listing) => {
                answered = true;
                entries.extend(listing);
            }
            Err(err) if err.is_disk_transient() => {}
            Err(err) => last_err = Some(err),
        }
    }
    match last_err {
        Some(err) if !answered => Err(err),
        _ => Ok(entries),
    }
}

/// An object directory in the multipart namespace carries an `uploads.json`.
pub(crate) async fn is_upload_leaf(disks: &[Arc<dyn StorageAPI>], base: &str, name: &str) -> bool {
    let index_path = format!("{base}{name}/{UPLOADS_JSON_FILE}");
    let stats = disks
        .iter()
        .map(|disk| disk.stat_file(SYS_VOLUME, &index_path));
    join_all(stats).await.iter().any(Result::is_ok)
}

/// Walks `base + dir` and returns key names relative to `base`, keeping only
/// names under `name_prefix`. Non-recursive walks report subdirectories as
/// `name/` instead of descending into them. Leaves are never descended.
fn walk_dir<'a>(
    disks: &'a [Arc<dyn StorageAPI>],
    base: &'a str,
    dir: String,
    name_prefix: &'a str,
    recursive: bool,
) -> BoxFuture<'a, Result<Vec<String>>> {
    async move {
        let entries = merged_list_dir(disks, &format!("{base}{dir}")).await?;
        let mut names = Vec::new();
        for entry in entries {
            let Some(child) = entry.strip_suffix(SLASH_SEPARATOR) else {
                continue;
            };
            let name = format!("{dir}{child}");
            if !name.starts_with(name_prefix) {
                continue;
            }

            if is_upload_leaf(disks, base, &name).await {
                names.push(name);
            } else if recursive {
                let nested = walk_dir(disks, base, retain_slash(&name), name_prefix, recursive).await?;
                names.extend(nested);
            } else {
                names.push(retain_slash(&name));
            }
        }
        Ok(names)
    }
    .boxed()
}

/// Sorted keys and common prefixes of the multipart namespace of `bucket`
/// that sort after `marker`.
pub async fn tree_walk(
    disks: &[Arc<dyn StorageAPI>],
    bucket: &str,
    prefix: &str,
    marker: &str,
    recursive: bool,
) -> Result<Vec<String>> {
    let base = retain_slash(&path_join(&[MPART_META_PREFIX, bucket]));
    let prefix_dir = match prefix.rfind('/') {
        Some(idx) => prefix[..=idx].to_string(),
        None => String::new(),
    };

    let mut names = walk_dir(disks, &base, prefix_dir, prefix, recursive).await?;
    names.retain(|name| name.as_str() > marker);
    names.sort();
    names.dedup();
    Ok(names)
}

impl ErasureObjects {
    /// Sessions of `object` that follow `upload_id_marker`, at most `limit`.
    /// The flag reports whether the object has nothing left after them.
    async fn object_uploads(
        &self,
        bucket: &str,
        object: &str,
        upload_id_marker: &str,
        limit: usize,
    ) -> Result<(Vec<MultipartUploadInfo>, bool)> {
        let _guard = self
            .ns_lock
            .rlock(SYS_VOLUME, &object_mpart_path(bucket, object))
            .await;
        let index = match read_uploads_index_any(&self.disk_slots(), bucket, object).await {
            Ok(index) => index,
            Err(err) if err.is_disk_transient() => return Ok((Vec::new(), true)),
            Err(err) => return Err(err),
        };

        let start = if upload_id_marker.is_empty() {
            0
        } else {
            // An unknown marker leaves nothing to resume from.
            index
                .index(upload_id_marker)
                .map_or(index.uploads.len(), |idx| idx + 1)
        };
        let remaining = &index.uploads[start..];
        let uploads = remaining
            .iter()
            .take(limit)
            .map(|upload| MultipartUploadInfo {
                key: object.to_string(),
                upload_id: upload.upload_id.clone(),
                initiated: upload.initiated,
            })
            .collect::<Vec<_>>();
        let end = uploads.len() == remaining.len();
        Ok((uploads, end))
    }

    pub(crate) async fn list_uploads(
        &self,
        bucket: &str,
        prefix: &str,
        key_marker: &str,
        upload_id_marker: &str,
        delimiter: &str,
        max_uploads: i32,
    ) -> Result<ListMultipartsInfo> {
        if !is_valid_bucket_name(bucket) {
            return Err(StrataError::InvalidBucketName(bucket.to_string()));
        }
        if !self.is_bucket_exist(bucket).await {
            return Err(StrataError::BucketNotFound(bucket.to_string()));
        }
        if !is_valid_object_prefix(prefix) {
            return Err(StrataError::InvalidObjectName {
                bucket: bucket.to_string(),
                object: prefix.to_string(),
            });
        }
        if !delimiter.is_empty() && delimiter != SLASH_SEPARATOR {
            return Err(StrataError::UnsupportedDelimiter(delimiter.to_string()));
        }
        if !key_marker.is_empty() && !key_marker.starts_with(prefix) {
            return Err(StrataError::InvalidMarkerPrefixCombination {
                marker: key_marker.to_string(),
                prefix: prefix.to_string(),
            });
        }
        if !upload_id_marker.is_empty() {
            if key_marker.is_empty() || key_marker.ends_with(SLASH_SEPARATOR) {
                return Err(StrataError::InvalidUploadIdKeyCombination {
                    upload_id_marker: upload_id_marker.to_string(),
                    key_marker: key_marker.to_string(),
                });
            }
            if !is_valid_upload_id(upload_id_marker) {
                return Err(StrataError::MalformedUploadId(upload_id_marker.to_string()));
            }
        }

        let mut result = ListMultipartsInfo {
            key_marker: key_marker.to_string(),
            upload_id_marker: upload_id_marker.to_string(),
            max_uploads,
            prefix: prefix.to_string(),
            delimiter: delimiter.to_string(),
            ..Default::default()
        };
        if max_uploads <= 0 {
            return Ok(result);
        }

        let mut budget = max_uploads.min(self.config.max_uploads_list) as usize;
        let mut listed = Vec::new();
        let mut eof = false;
        let mut marker_key_done = true;

        if !upload_id_marker.is_empty() {
            let (uploads, end) = self
                .object_uploads(bucket, key_marker, upload_id_marker, budget)
                .await?;
            budget -= uploads.len();
            marker_key_done = end;
            listed.extend(uploads.into_iter().map(Listed::Upload));
        }

        // With the budget spent on the marker key, the walk only tells
        // whether anything follows it.
        if budget > 0 || marker_key_done {
            let recursive = delimiter.is_empty();
            let names = tree_walk(self.erasure.disks(), bucket, prefix, key_marker, recursive).await?;
            debug!(bucket, prefix, key_marker, entries = names.len(), "walked multipart namespace");

            eof = true;
            let total = names.len();
            for (idx, name) in names.into_iter().enumerate() {
                if budget == 0 {
                    eof = false;
                    break;
                }
                let last_entry = idx + 1 == total;

                if name.ends_with(SLASH_SEPARATOR) {
                    listed.push(Listed::Prefix(name));
                    budget -= 1;
                    continue;
                }

                let (uploads, end) = self.object_uploads(bucket, &name, "", budget).await?;
                budget -= uploads.len();
                listed.extend(uploads.into_iter().map(Listed::Upload));
                if !end {
                    eof = false;
                    break;
                }
                if budget == 0 && !last_entry {
                    eof = false;
                    break;
                }
            }
        }

        for entry in listed {
            match entry {
                Listed::Upload(upload) => {
                    result.next_key_marker = upload.key.clone();
                    result.next_upload_id_marker = upload.upload_id.clone();
                    result.uploads.push(upload);
                }
                Listed::Prefix(prefix) => {
                    result.next_key_marker = prefix.clone();
                    result.next_upload_id_marker = String::new();
                    result.common_prefixes.push(prefix);
                }
            }
        }
        result.is_truncated = !eof;
        if !result.is_truncated {
            result.next_key_marker.clear();
            result.next_upload_id_marker.clear();
        }
        Ok(result)
    }
}
