//! The replicated `xl.json` record and the quorum rules around it.
//!
//! Every disk carries its own copy. Copies must agree on `stat`, `meta` and
//! `parts`; the `erasure` section differs per disk (shard index and shard
//! checksums).

use std::collections::HashMap;
use std::mem::discriminant;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use strata_common::error::{Result, StrataError};
use strata_common::mime::DEFAULT_CONTENT_TYPE;
use strata_common::types::ObjectInfo;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::erasure::ErasureConfig;
use crate::naming::{path_join, retain_slash};
use crate::traits::StorageAPI;

pub const XL_META_FILE: &str = "xl.json";
pub const XL_META_VERSION: &str = "1.0.0";
pub const XL_META_FORMAT: &str = "xl";
pub const ERASURE_ALGORITHM: &str = "reed-solomon-simd";
pub const CHECKSUM_ALGORITHM: &str = "sha256";

/// Metadata key holding the object's ETag.
pub const MD5_SUM_KEY: &str = "md5Sum";
pub const CONTENT_TYPE_KEY: &str = "content-type";

pub type DiskSlots = [Option<Arc<dyn StorageAPI>>];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatInfo {
    pub size: i64,
    pub mod_time: DateTime<Utc>,
    pub version: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumInfo {
    pub name: String,
    pub algorithm: String,
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErasureInfo {
    pub algorithm: String,
    pub data_blocks: usize,
    pub parity_blocks: usize,
    pub block_size: usize,
    /// 1-based shard position of the disk holding this copy.
    pub index: usize,
    #[serde(default)]
    pub checksum: Vec<ChecksumInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectPartInfo {
    pub number: i32,
    pub name: String,
    pub etag: String,
    pub size: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XlMetaV1 {
    pub version: String,
    pub format: String,
    pub stat: StatInfo,
    pub erasure: ErasureInfo,
    #[serde(default)]
    pub meta: HashMap<String, String>,
    #[serde(default)]
    pub parts: Vec<ObjectPartInfo>,
}

impl XlMetaV1 {
    pub fn new(config: &ErasureConfig) -> Self {
        Self {
            version: XL_META_VERSION.to_string(),
            format: XL_META_FORMAT.to_string(),
            stat: StatInfo {
                size: 0,
                mod_time: strata_common::time::now(),
                version: 0,
            },
            erasure: ErasureInfo {
                algorithm: ERASURE_ALGORITHM.to_string(),
                data_blocks: config.data_shards,
                parity_blocks: config.parity_shards,
                block_size: config.block_size,
                index: 0,
                checksum: Vec::new(),
            },
            meta: HashMap::new(),
            parts: Vec::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.version == XL_META_VERSION && self.format == XL_META_FORMAT
    }

    /// Copies agree when everything but the per-disk erasure section matches.
    pub fn same_content(&self, other: &Self) -> bool {
        self.stat == other.stat && self.meta == other.meta && self.parts == other.parts
    }

    /// Adds a part, replacing any part with the same number; parts stay
    /// sorted by number.
    pub fn add_object_part(&mut self, number: i32, name: String, etag: String, size: i64) {
        let part = ObjectPartInfo {
            number,
            name,
            etag,
            size,
        };
        match self.parts.binary_search_by_key(&number, |part| part.number) {
            Ok(idx) => self.parts[idx] = part,
            Err(idx) => self.parts.insert(idx, part),
        }
    }

    pub fn object_part_index(&self, number: i32) -> Option<usize> {
        self.parts.iter().position(|part| part.number == number)
    }

    pub fn add_checksum(&mut self, name: &str, hash: String) {
        let checksum = ChecksumInfo {
            name: name.to_string(),
            algorithm: CHECKSUM_ALGORITHM.to_string(),
            hash,
        };
        match self
            .erasure
            .checksum
            .iter_mut()
            .find(|existing| existing.name == name)
        {
            Some(existing) => *existing = checksum,
            None => self.erasure.checksum.push(checksum),
        }
    }

    /// Drops checksums of shard files no longer listed as parts.
    pub fn retain_part_checksums(&mut self) {
        let parts = &self.parts;
        self.erasure
            .checksum
            .retain(|checksum| parts.iter().any(|part| part.name == checksum.name));
    }

    pub fn get_checksum(&self, name: &str) -> Option<&ChecksumInfo> {
        self.erasure.checksum.iter().find(|checksum| checksum.name == name)
    }

    /// Splits an object byte range into `(part index, offset in part, length)`
    /// pieces.
    pub fn part_ranges(&self, offset: u64, length: u64) -> Vec<(usize, u64, u64)> {
        let mut ranges = Vec::new();
        let mut skip = offset;
        let mut remaining = length;
        for (idx, part) in self.parts.iter().enumerate() {
            if remaining == 0 {
                break;
            }
            let part_size = part.size.max(0) as u64;
            if skip >= part_size {
                skip -= part_size;
                continue;
            }
            let take = (part_size - skip).min(remaining);
            ranges.push((idx, skip, take));
            remaining -= take;
            skip = 0;
        }
        ranges
    }

    pub fn to_object_info(&self, bucket: &str, object: &str) -> ObjectInfo {
        ObjectInfo {
            bucket: bucket.to_string(),
            key: object.to_string(),
            size: self.stat.size,
            etag: self.meta.get(MD5_SUM_KEY).cloned().unwrap_or_default(),
            content_type: self
                .meta
                .get(CONTENT_TYPE_KEY)
                .cloned()
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            last_modified: self.stat.mod_time,
            metadata: self.meta.clone(),
        }
    }
}

/// The authoritative record and the disks that carry it.
#[derive(Debug, Clone)]
pub struct OnlineDisks {
    /// Disks whose copy agrees with `meta`, `None` elsewhere.
    pub disks: Vec<Option<Arc<dyn StorageAPI>>>,
    /// Each agreeing disk's own copy, aligned with `disks`.
    pub metas: Vec<Option<XlMetaV1>>,
    pub meta: XlMetaV1,
    /// Version to stamp on the next write.
    pub higher_version: i64,
}

pub async fn read_xl_metadata(
    disk: &Arc<dyn StorageAPI>,
    volume: &str,
    path: &str,
) -> Result<XlMetaV1> {
    let buf = disk
        .read_all(volume, &path_join(&[path, XL_META_FILE]))
        .await?;
    serde_json::from_slice(&buf).map_err(|err| {
        StrataError::InternalError(format!("corrupt {XL_META_FILE} at {volume}/{path}: {err}"))
    })
}

pub async fn read_all_xl_metadata(
    disks: &DiskSlots,
    volume: &str,
    path: &str,
) -> Vec<Result<XlMetaV1>> {
    let reads = disks.iter().map(|disk| async move {
        match disk {
            Some(disk) => read_xl_metadata(disk, volume, path).await,
            None => Err(StrataError::DiskNotFound),
        }
    });
    join_all(reads).await
}

/// Picks the highest version that at least `read_quorum` copies agree on.
pub fn pick_valid_xl_meta(metas: &[Result<XlMetaV1>], read_quorum: usize) -> Option<&XlMetaV1> {
    let mut best: Option<&XlMetaV1> = None;
    for candidate in metas.iter().flatten().filter(|meta| meta.is_valid()) {
        let agreeing = metas
            .iter()
            .flatten()
            .filter(|other| other.same_content(candidate))
            .count();
        if agreeing >= read_quorum
            && best.is_none_or(|current| candidate.stat.version > current.stat.version)
        {
            best = Some(candidate);
        }
    }
    best
}

pub async fn list_online_disks(
    disks: &DiskSlots,
    volume: &str,
    path: &str,
    read_quorum: usize,
) -> Result<OnlineDisks> {
    let results = read_all_xl_metadata(disks, volume, path).await;
    let Some(meta) = pick_valid_xl_meta(&results, read_quorum).cloned() else {
        return Err(reduce_errs(results, read_quorum, StrataError::InsufficientReadQuorum)
            .err()
            .unwrap_or(StrataError::InsufficientReadQuorum));
    };

    let mut online = Vec::with_capacity(disks.len());
    let mut metas = Vec::with_capacity(disks.len());
    for (disk, result) in disks.iter().zip(results) {
        match (disk, result) {
            (Some(disk), Ok(copy)) if copy.same_content(&meta) => {
                online.push(Some(Arc::clone(disk)));
                metas.push(Some(copy));
            }
            (Some(disk), Ok(_)) => {
                debug!(disk = %disk.endpoint(), volume, path, "stale metadata copy");
                online.push(None);
                metas.push(None);
            }
            _ => {
                online.push(None);
                metas.push(None);
            }
        }
    }

    let higher_version = meta.stat.version + 1;
    Ok(OnlineDisks {
        disks: online,
        metas,
        meta,
        higher_version,
    })
}

async fn write_xl_metadata(
    disk: &Arc<dyn StorageAPI>,
    volume: &str,
    path: &str,
    meta: &XlMetaV1,
) -> Result<()> {
    let buf = serde_json::to_vec(meta)
        .map_err(|err| StrataError::InternalError(format!("encode {XL_META_FILE}: {err}")))?;
    let mut sink = disk
        .create_file(volume, &path_join(&[path, XL_META_FILE]))
        .await?;
    sink.write_all(&buf).await?;
    sink.shutdown().await?;
    Ok(())
}

/// Writes `metas[i]` to disk `i`. Below quorum, copies already written are
/// removed again.
pub async fn write_unique_xl_metadata(
    disks: &DiskSlots,
    volume: &str,
    path: &str,
    metas: &[Option<XlMetaV1>],
    write_quorum: usize,
) -> Result<()> {
    let writes = disks.iter().zip(metas).map(|(disk, meta)| async move {
        match (disk, meta) {
            (Some(disk), Some(meta)) => write_xl_metadata(disk, volume, path, meta).await,
            _ => Err(StrataError::DiskNotFound),
        }
    });
    let results = join_all(writes).await;

    let written = results.iter().filter(|result| result.is_ok()).count();
    if written < write_quorum {
        warn!(volume, path, written, write_quorum, "metadata write below quorum");
        let meta_path = path_join(&[path, XL_META_FILE]);
        let cleanups = disks
            .iter()
            .zip(&results)
            .filter_map(|(disk, result)| disk.as_ref().filter(|_| result.is_ok()))
            .map(|disk| {
                let meta_path = meta_path.as_str();
                async move {
                    let _ = disk.delete_file(volume, meta_path).await;
                }
            });
        join_all(cleanups).await;
        return reduce_errs(results, write_quorum, StrataError::InsufficientWriteQuorum);
    }
    Ok(())
}

/// Writes one record everywhere, stamping each copy with its shard index.
pub async fn write_same_xl_metadata(
    disks: &DiskSlots,
    volume: &str,
    path: &str,
    meta: &XlMetaV1,
    write_quorum: usize,
) -> Result<()> {
    let metas: Vec<Option<XlMetaV1>> = (0..disks.len())
        .map(|idx| {
            let mut copy = meta.clone();
            copy.erasure.index = idx + 1;
            Some(copy)
        })
        .collect();
    write_unique_xl_metadata(disks, volume, path, &metas, write_quorum).await
}

/// Moves `src/xl.json` to `dst/xl.json` on every disk, undoing the moves
/// that went through when quorum is not reached.
pub async fn rename_xl_metadata(
    disks: &DiskSlots,
    src_volume: &str,
    src_path: &str,
    dst_volume: &str,
    dst_path: &str,
    write_quorum: usize,
) -> Result<()> {
    let src = path_join(&[src_path, XL_META_FILE]);
    let dst = path_join(&[dst_path, XL_META_FILE]);
    rename_on_disks(disks, src_volume, &src, dst_volume, &dst, write_quorum, false).await
}

/// Renames a whole object directory on every disk. Disks that do not have
/// the source count as done.
pub async fn rename_object(
    disks: &DiskSlots,
    src_volume: &str,
    src_object: &str,
    dst_volume: &str,
    dst_object: &str,
    write_quorum: usize,
) -> Result<()> {
    let src = retain_slash(src_object);
    let dst = retain_slash(dst_object);
    rename_on_disks(disks, src_volume, &src, dst_volume, &dst, write_quorum, true).await
}

pub(crate) async fn rename_on_disks(
    disks: &DiskSlots,
    src_volume: &str,
    src: &str,
    dst_volume: &str,
    dst: &str,
    write_quorum: usize,
    missing_ok: bool,
) -> Result<()> {
    let renames = disks.iter().map(|disk| async move {
        let Some(disk) = disk else {
            return Err(StrataError::DiskNotFound);
        };
        match disk.rename_file(src_volume, src, dst_volume, dst).await {
            Err(StrataError::FileNotFound(_)) if missing_ok => Ok(false),
            Err(err) => Err(err),
            Ok(()) => Ok(true),
        }
    });
    let results = join_all(renames).await;

    let succeeded = results.iter().filter(|result| result.is_ok()).count();
    if succeeded < write_quorum {
        warn!(src_volume, src, dst_volume, dst, succeeded, write_quorum, "rename below quorum, undoing");
        let undos = disks
            .iter()
            .zip(&results)
            .filter_map(|(disk, result)| match result {
                Ok(true) => disk.as_ref(),
                _ => None,
            })
            .map(|disk| async move {
                let _ = disk.rename_file(dst_volume, dst, src_volume, src).await;
            });
        join_all(undos).await;
        return reduce_errs(results, write_quorum, StrataError::InsufficientWriteQuorum);
    }
    Ok(())
}

/// Deletes a file or directory tree on every disk. Disks lacking the path
/// count as done.
pub async fn delete_from_disks(
    disks: &DiskSlots,
    volume: &str,
    path: &str,
    write_quorum: usize,
) -> Result<()> {
    let deletes = disks.iter().map(|disk| async move {
        let Some(disk) = disk else {
            return Err(StrataError::DiskNotFound);
        };
        match disk.delete_file(volume, path).await {
            Ok(()) | Err(StrataError::FileNotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    });
    let results = join_all(deletes).await;
    reduce_errs(results, write_quorum, StrataError::InsufficientWriteQuorum)
}

/// Best-effort removal used for staging areas.
pub async fn cleanup_on_disks(disks: &DiskSlots, volume: &str, path: &str) {
    let deletes = disks.iter().flatten().map(|disk| async move {
        if let Err(err) = disk.delete_file(volume, path).await {
            if !matches!(err, StrataError::FileNotFound(_)) {
                debug!(disk = %disk.endpoint(), volume, path, error = %err, "cleanup failed");
            }
        }
    });
    join_all(deletes).await;
}

/// Succeeds when at least `quorum` results are `Ok`. Otherwise returns the
/// error shared by at least `quorum` disks, or `quorum_err`.
pub fn reduce_errs<T>(results: Vec<Result<T>>, quorum: usize, quorum_err: StrataError) -> Result<()> {
    let succeeded = results.iter().filter(|result| result.is_ok()).count();
    if succeeded >= quorum {
        return Ok(());
    }

    let errors: Vec<StrataError> = results.into_iter().filter_map(Result::err).collect();
    let dominant = errors
        .iter()
        .enumerate()
        .map(|(idx, err)| {
            let count = errors
                .iter()
                .filter(|other| discriminant(*other) == discriminant(err))
                .count();
            (count, idx)
        })
        .max_by_key(|(count, idx)| (*count, std::cmp::Reverse(*idx)));

    match dominant {
        Some((count, idx)) if count >= quorum => {
            Err(errors.into_iter().nth(idx).unwrap_or(quorum_err))
        }
        _ => Err(quorum_err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta_with_parts(sizes: &[i64]) -> XlMetaV1 {
        let mut meta = XlMetaV1::new(&ErasureConfig::for_disks(4, 1024));
        for (idx, size) in sizes.iter().enumerate() {
            let number = idx as i32 + 1;
            meta.add_object_part(number, format!("object{number}"), String::new(), *size);
        }
        meta
    }

    #[test]
    fn parts_stay_sorted_and_replace_by_number() {
        let mut meta = XlMetaV1::new(&ErasureConfig::for_disks(4, 1024));
        meta.add_object_part(3, "object3".into(), "c".into(), 3);
        meta.add_object_part(1, "object1".into(), "a".into(), 1);
        meta.add_object_part(3, "object3".into(), "d".into(), 4);

        let numbers: Vec<i32> = meta.parts.iter().map(|part| part.number).collect();
        assert_eq!(numbers, vec![1, 3]);
        assert_eq!(meta.parts[1].etag, "d");
        assert_eq!(meta.object_part_index(3), Some(1));
        assert_eq!(meta.object_part_index(2), None);
    }

    #[test]
    fn checksums_replace_by_part_name() {
        let mut meta = meta_with_parts(&[5]);
        meta.add_checksum("object1", "aa".into());
        meta.add_checksum("object2", "bb".into());
        meta.add_checksum("object1", "cc".into());

        assert_eq!(meta.erasure.checksum.len(), 2);
        let checksum = meta.get_checksum("object1").unwrap();
        assert_eq!(checksum.hash, "cc");
        assert_eq!(checksum.algorithm, CHECKSUM_ALGORITHM);
        assert!(meta.get_checksum("object3").is_none());
    }

    #[test]
    fn checksums_follow_listed_parts() {
        let mut meta = meta_with_parts(&[5, 5, 5]);
        for name in ["object1", "object2", "object3"] {
            meta.add_checksum(name, name.into());
        }
        meta.parts.remove(1);
        meta.retain_part_checksums();

        let names: Vec<&str> = meta.erasure.checksum.iter().map(|checksum| checksum.name.as_str()).collect();
        assert_eq!(names, vec!["object1", "object3"]);
    }

    #[test]
    fn part_ranges_span_part_boundaries() {
        let meta = meta_with_parts(&[10, 10, 5]);
        assert_eq!(meta.part_ranges(0, 25), vec![(0, 0, 10), (1, 0, 10), (2, 0, 5)]);
        assert_eq!(meta.part_ranges(12, 5), vec![(1, 2, 5)]);
        assert_eq!(meta.part_ranges(8, 4), vec![(0, 8, 2), (1, 0, 2)]);
        assert!(meta.part_ranges(25, 0).is_empty());
    }

    #[test]
    fn pick_requires_quorum_and_prefers_newer_versions() {
        let base = meta_with_parts(&[5]);
        let mut newer = base.clone();
        newer.stat.version = 2;

        let metas = vec![
            Ok(base.clone()),
            Ok(newer.clone()),
            Ok(newer.clone()),
            Err(StrataError::DiskNotFound),
        ];
        assert_eq!(pick_valid_xl_meta(&metas, 2).map(|meta| meta.stat.version), Some(2));
        assert!(pick_valid_xl_meta(&metas, 3).is_none());

        let mut checksum_differs = newer.clone();
        checksum_differs.add_checksum("object1", "abcd".into());
        let metas = vec![Ok(newer), Ok(checksum_differs)];
        assert!(pick_valid_xl_meta(&metas, 2).is_some());
    }

    #[test]
    fn reduce_errs_reports_dominant_error() {
        let results: Vec<Result<()>> = vec![
            Err(StrataError::FileNotFound("a".into())),
            Err(StrataError::FileNotFound("a".into())),
            Err(StrataError::DiskNotFound),
            Ok(()),
        ];
        assert!(matches!(
            reduce_errs(results, 2, StrataError::InsufficientReadQuorum),
            Err(StrataError::FileNotFound(_))
        ));

        let results: Vec<Result<()>> = vec![
            Err(StrataError::FileNotFound("a".into())),
            Err(StrataError::DiskNotFound),
            Ok(()),
        ];
        assert!(matches!(
            reduce_errs(results, 2, StrataError::InsufficientReadQuorum),
            Err(StrataError::InsufficientReadQuorum)
        ));
    }

    #[test]
    fn serializes_with_stable_field_names() {
        let mut meta = meta_with_parts(&[7]);
        meta.meta.insert(MD5_SUM_KEY.into(), "abc-1".into());
        let value = serde_json::to_value(&meta).unwrap();
        assert_eq!(value["format"], "xl");
        assert_eq!(value["parts"][0]["name"], "object1");

        let decoded: XlMetaV1 = serde_json::from_value(value).unwrap();
        let info = decoded.to_object_info("bucket", "key");
        assert_eq!(info.etag, "abc-1");
        assert_eq!(info.content_type, DEFAULT_CONTENT_TYPE);
    }
}
