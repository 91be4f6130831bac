//! Multipart upload sessions.
//!
//! A session lives at `multipart/<bucket>/<object>/<uploadId>/` inside the
//! system volume: an `xl.json` listing committed parts next to one erasure
//! coded file per part. Every metadata change is written under `tmp/` first
//! and renamed into place.
//!
//! Locks are taken in this order: the session (`.../<uploadId>`), then the
//! target object, then the object's upload index (`multipart/<bucket>/<object>`).

use std::collections::HashMap;

use strata_common::error::{Result, StrataError};
use strata_common::hash::{canonical_etag, complete_multipart_md5};
use strata_common::mime::content_type_for;
use strata_common::time;
use strata_common::types::ObjectInfo;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::datatypes::{CompletePart, ListPartsInfo, PartInfo};
use crate::erasure::objects::{ErasureObjects, check_object_name};
use crate::hash::Md5Reader;
use crate::naming::{MPART_META_PREFIX, SYS_VOLUME, TMP_META_PREFIX, parent_dir, path_join, retain_slash};
use crate::traits::ReadStream;
use crate::xl::meta::{
    CONTENT_TYPE_KEY, MD5_SUM_KEY, ObjectPartInfo, OnlineDisks, XlMetaV1, cleanup_on_disks,
    delete_from_disks, list_online_disks, rename_object, rename_on_disks, rename_xl_metadata,
    write_same_xl_metadata, write_unique_xl_metadata,
};

pub mod list;
pub mod uploads;

use uploads::{add_upload_id, object_mpart_path, remove_upload_id};

pub const MAX_PART_ID: i32 = 10_000;
pub const MAX_PART_SIZE: i64 = 5 * 1024 * 1024 * 1024;

pub fn upload_id_path(bucket: &str, object: &str, upload_id: &str) -> String {
    path_join(&[MPART_META_PREFIX, bucket, object, upload_id])
}

pub fn part_file_name(part_number: i32) -> String {
    format!("object{part_number}")
}

/// Session ids are non-nil UUIDs. Anything else is never joined into a path.
pub fn is_valid_upload_id(upload_id: &str) -> bool {
    Uuid::parse_str(upload_id).is_ok_and(|id| !id.is_nil())
}

fn check_upload_id(upload_id: &str) -> Result<()> {
    if !is_valid_upload_id(upload_id) {
        return Err(StrataError::InvalidUploadId(upload_id.to_string()));
    }
    Ok(())
}

fn tmp_path() -> String {
    path_join(&[TMP_META_PREFIX, &Uuid::new_v4().to_string()])
}

/// A session that vanished or never existed reads as an unknown upload id.
fn session_err(err: StrataError, upload_id: &str) -> StrataError {
    match err {
        StrataError::FileNotFound(_) | StrataError::VolumeNotFound(_) => {
            StrataError::InvalidUploadId(upload_id.to_string())
        }
        other => other,
    }
}

impl ErasureObjects {
    pub async fn is_upload_id_exists(&self, bucket: &str, object: &str, upload_id: &str) -> bool {
        if !is_valid_upload_id(upload_id) {
            return false;
        }
        self.is_object(SYS_VOLUME, &upload_id_path(bucket, object, upload_id))
            .await
    }

    async fn session_disks(&self, bucket: &str, object: &str, upload_id: &str) -> Result<OnlineDisks> {
        list_online_disks(
            &self.disk_slots(),
            SYS_VOLUME,
            &upload_id_path(bucket, object, upload_id),
            self.read_quorum(),
        )
        .await
        .map_err(|err| session_err(err, upload_id))
    }

    pub(crate) async fn new_upload(
        &self,
        bucket: &str,
        object: &str,
        mut metadata: HashMap<String, String>,
    ) -> Result<String> {
        self.check_bucket(bucket).await?;
        check_object_name(bucket, object)?;

        if metadata
            .get(CONTENT_TYPE_KEY)
            .is_none_or(|content_type| content_type.is_empty())
        {
            metadata.insert(CONTENT_TYPE_KEY.to_string(), content_type_for(object));
        }

        let mut xl_meta = XlMetaV1::new(self.erasure.config());
        xl_meta.stat.mod_time = time::now();
        xl_meta.stat.version = 1;
        xl_meta.meta = metadata;

        let _guard = self
            .ns_lock
            .lock(SYS_VOLUME, &object_mpart_path(bucket, object))
            .await;

        let upload_id = Uuid::new_v4().to_string();
        let initiated = time::now();
        let disks = self.disk_slots();
        let session_path = upload_id_path(bucket, object, &upload_id);
        let staging = path_join(&[TMP_META_PREFIX, &upload_id]);

        if let Err(err) =
            write_same_xl_metadata(&disks, SYS_VOLUME, &staging, &xl_meta, self.write_quorum()).await
        {
            cleanup_on_disks(&disks, SYS_VOLUME, &staging).await;
            return Err(err);
        }
        if let Err(err) = rename_object(
            &disks,
            SYS_VOLUME,
            &staging,
            SYS_VOLUME,
            &session_path,
            self.write_quorum(),
        )
        .await
        {
            cleanup_on_disks(&disks, SYS_VOLUME, &staging).await;
            return Err(err);
        }

        if let Err(err) =
            add_upload_id(&disks, bucket, object, &upload_id, initiated, self.write_quorum()).await
        {
            cleanup_on_disks(&disks, SYS_VOLUME, &retain_slash(&session_path)).await;
            return Err(err);
        }

        info!(bucket, object, upload_id = %upload_id, "multipart upload created");
        Ok(upload_id)
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn put_part(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
        part_number: i32,
        size: i64,
        data: ReadStream,
        md5_hex: Option<&str>,
    ) -> Result<String> {
        self.check_bucket(bucket).await?;
        check_object_name(bucket, object)?;
        check_upload_id(upload_id)?;
        if !(1..=MAX_PART_ID).contains(&part_number) {
            return Err(StrataError::InvalidArgument(format!(
                "part number {part_number} outside 1..={MAX_PART_ID}"
            )));
        }
        if size < 0 {
            return Err(StrataError::InvalidArgument(format!("negative part size {size}")));
        }
        if size > MAX_PART_SIZE {
            return Err(StrataError::EntityTooLarge {
                size: size as u64,
                max_size: MAX_PART_SIZE as u64,
            });
        }

        let session_path = upload_id_path(bucket, object, upload_id);
        let _guard = self.ns_lock.lock(SYS_VOLUME, &session_path).await;
        if !self.is_upload_id_exists(bucket, object, upload_id).await {
            return Err(StrataError::InvalidUploadId(upload_id.to_string()));
        }
        let online = self.session_disks(bucket, object, upload_id).await?;

        let part_name = part_file_name(part_number);
        let staging = tmp_path();
        let staged_part = path_join(&[&staging, &part_name]);

        // Every part of a session shares the block size it was created with.
        let erasure = self.erasure.with_block_size(online.meta.erasure.block_size)?;
        let mut reader = Md5Reader::new(data);
        let outcome = match erasure
            .create_file(
                &online.disks,
                SYS_VOLUME,
                &staged_part,
                &mut reader,
                self.write_quorum(),
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                cleanup_on_disks(&online.disks, SYS_VOLUME, &staging).await;
                return Err(err);
            }
        };
        let etag = reader.hex_digest();

        if outcome.size != size as u64 {
            cleanup_on_disks(&online.disks, SYS_VOLUME, &staging).await;
            debug!(bucket, object, upload_id, expected = size, read = outcome.size, "part length mismatch");
            return Err(StrataError::SignatureDoesNotMatch);
        }
        let expected = md5_hex
            .map(canonical_etag)
            .filter(|expected| !expected.is_empty());
        if let Some(expected) = expected.filter(|expected| *expected != etag) {
            cleanup_on_disks(&online.disks, SYS_VOLUME, &staging).await;
            return Err(StrataError::BadDigest {
                expected: expected.to_string(),
                calculated: etag,
            });
        }

        // An abort may have slipped in while the data was streaming.
        if !self.is_upload_id_exists(bucket, object, upload_id).await {
            cleanup_on_disks(&online.disks, SYS_VOLUME, &staging).await;
            return Err(StrataError::InvalidUploadId(upload_id.to_string()));
        }

        let part_path = path_join(&[&session_path, &part_name]);
        if let Err(err) = rename_on_disks(
            &online.disks,
            SYS_VOLUME,
            &staged_part,
            SYS_VOLUME,
            &part_path,
            self.write_quorum(),
            false,
        )
        .await
        {
            cleanup_on_disks(&online.disks, SYS_VOLUME, &staging).await;
            return Err(session_err(err, upload_id));
        }

        let mut xl_meta = online.meta.clone();
        xl_meta.stat.version = online.higher_version;
        xl_meta.add_object_part(part_number, part_name.clone(), etag.clone(), size);

        let metas: Vec<Option<XlMetaV1>> = online
            .metas
            .iter()
            .zip(&outcome.checksums)
            .enumerate()
            .map(|(idx, (copy, checksum))| match (copy, checksum) {
                (Some(copy), Some(checksum)) => {
                    let mut copy = copy.clone();
                    copy.stat = xl_meta.stat.clone();
                    copy.parts = xl_meta.parts.clone();
                    copy.erasure.index = idx + 1;
                    copy.add_checksum(&part_name, checksum.clone());
                    Some(copy)
                }
                _ => None,
            })
            .collect();

        let result = async {
            write_unique_xl_metadata(&online.disks, SYS_VOLUME, &staging, &metas, self.write_quorum())
                .await?;
            rename_xl_metadata(
                &online.disks,
                SYS_VOLUME,
                &staging,
                SYS_VOLUME,
                &session_path,
                self.write_quorum(),
            )
            .await
        }
        .await;
        cleanup_on_disks(&online.disks, SYS_VOLUME, &staging).await;
        result.map_err(|err| session_err(err, upload_id))?;

        info!(bucket, object, upload_id, part_number, size, etag = %etag, "part committed");
        Ok(etag)
    }

    pub(crate) async fn list_parts(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
        part_number_marker: i32,
        max_parts: i32,
    ) -> Result<ListPartsInfo> {
        self.check_bucket(bucket).await?;
        check_object_name(bucket, object)?;
        check_upload_id(upload_id)?;

        let session_path = upload_id_path(bucket, object, upload_id);
        let _guard = self.ns_lock.rlock(SYS_VOLUME, &session_path).await;
        if !self.is_upload_id_exists(bucket, object, upload_id).await {
            return Err(StrataError::InvalidUploadId(upload_id.to_string()));
        }
        let online = self.session_disks(bucket, object, upload_id).await?;

        let mut result = ListPartsInfo {
            bucket: bucket.to_string(),
            object: object.to_string(),
            upload_id: upload_id.to_string(),
            part_number_marker,
            max_parts,
            ..Default::default()
        };
        if online.meta.parts.is_empty() || max_parts <= 0 {
            return Ok(result);
        }

        let limit = max_parts.min(self.config.max_parts_list) as usize;
        let candidates: Vec<&ObjectPartInfo> = online
            .meta
            .parts
            .iter()
            .filter(|part| part.number > part_number_marker)
            .collect();

        for part in candidates.iter().take(limit) {
            let part_path = path_join(&[&session_path, &part.name]);
            let mut last_err = StrataError::InsufficientReadQuorum;
            let mut last_modified = None;
            for disk in online.disks.iter().flatten() {
                match disk.stat_file(SYS_VOLUME, &part_path).await {
                    Ok(info) => {
                        last_modified = Some(info.mod_time);
                        break;
                    }
                    Err(err) => last_err = err,
                }
            }
            let last_modified = last_modified.ok_or_else(|| session_err(last_err, upload_id))?;

            result.parts.push(PartInfo {
                part_number: part.number,
                size: part.size,
                etag: part.etag.clone(),
                last_modified,
            });
        }

        if candidates.len() > result.parts.len() {
            result.is_truncated = true;
            if let Some(last) = result.parts.last() {
                result.next_part_number_marker = last.part_number;
            }
        }
        Ok(result)
    }

    pub(crate) async fn complete_upload(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
        parts: Vec<CompletePart>,
    ) -> Result<ObjectInfo> {
        self.check_bucket(bucket).await?;
        check_object_name(bucket, object)?;
        check_upload_id(upload_id)?;
        if parts.is_empty() {
            return Err(StrataError::InvalidArgument(
                "complete requires at least one part".to_string(),
            ));
        }
        if parts
            .windows(2)
            .any(|pair| pair[0].part_number >= pair[1].part_number)
        {
            return Err(StrataError::InvalidPartOrder);
        }

        let session_path = upload_id_path(bucket, object, upload_id);
        let _session_guard = self.ns_lock.lock(SYS_VOLUME, &session_path).await;
        if !self.is_upload_id_exists(bucket, object, upload_id).await {
            return Err(StrataError::InvalidUploadId(upload_id.to_string()));
        }
        let online = self.session_disks(bucket, object, upload_id).await?;
        let current = &online.meta;

        let mut final_parts = Vec::with_capacity(parts.len());
        let mut object_size = 0_i64;
        for (idx, part) in parts.iter().enumerate() {
            let stored = current
                .object_part_index(part.part_number)
                .map(|part_idx| &current.parts[part_idx])
                .ok_or(StrataError::InvalidPart(part.part_number))?;
            if canonical_etag(&part.etag) != stored.etag {
                return Err(StrataError::BadDigest {
                    expected: part.etag.clone(),
                    calculated: stored.etag.clone(),
                });
            }
            if idx + 1 < parts.len() && stored.size < self.config.min_part_size {
                return Err(StrataError::PartTooSmall {
                    part_number: part.part_number,
                    size: stored.size,
                    min_size: self.config.min_part_size,
                });
            }

            object_size += stored.size;
            final_parts.push(stored.clone());
        }
        let s3_md5 = complete_multipart_md5(final_parts.iter().map(|part| part.etag.as_str()))?;

        if self.parent_dir_is_object(bucket, parent_dir(object)).await {
            return Err(StrataError::AccessDenied(format!("{bucket}/{object}")));
        }

        let mut xl_meta = current.clone();
        xl_meta.stat.size = object_size;
        xl_meta.stat.mod_time = time::now();
        xl_meta.stat.version = online.higher_version;
        xl_meta.meta.insert(MD5_SUM_KEY.to_string(), s3_md5.clone());
        xl_meta.parts = final_parts;

        // Per-disk checksums follow the parts that made it into the object.
        let metas: Vec<Option<XlMetaV1>> = online
            .metas
            .iter()
            .enumerate()
            .map(|(idx, copy)| {
                copy.as_ref().map(|copy| {
                    let mut copy = copy.clone();
                    copy.stat = xl_meta.stat.clone();
                    copy.meta = xl_meta.meta.clone();
                    copy.parts = xl_meta.parts.clone();
                    copy.erasure.index = idx + 1;
                    copy.retain_part_checksums();
                    copy
                })
            })
            .collect();

        let staging = tmp_path();
        let result = async {
            write_unique_xl_metadata(&online.disks, SYS_VOLUME, &staging, &metas, self.write_quorum())
                .await?;
            rename_xl_metadata(
                &online.disks,
                SYS_VOLUME,
                &staging,
                SYS_VOLUME,
                &session_path,
                self.write_quorum(),
            )
            .await
        }
        .await;
        cleanup_on_disks(&online.disks, SYS_VOLUME, &staging).await;
        result.map_err(|err| session_err(err, upload_id))?;

        {
            let _object_guard = self.ns_lock.lock(bucket, object).await;
            let all_disks = self.disk_slots();

            // Move any existing object aside so readers never see a mix.
            // Copies below quorum go too, or they would block the rename on
            // the disks holding them.
            let displaced = tmp_path();
            let had_object = self.object_meta_count(bucket, object).await > 0;
            if had_object {
                rename_object(&all_disks, bucket, object, SYS_VOLUME, &displaced, self.write_quorum())
                    .await
                    .map_err(|err| err.into_object_err(bucket, object))?;
            }

            for stale in current
                .parts
                .iter()
                .filter(|part| xl_meta.object_part_index(part.number).is_none())
            {
                let stale_path = path_join(&[&session_path, &stale.name]);
                if let Err(err) =
                    delete_from_disks(&online.disks, SYS_VOLUME, &stale_path, self.write_quorum()).await
                {
                    warn!(bucket, object, upload_id, part = %stale.name, error = %err, "failed to drop unreferenced part");
                }
            }

            if let Err(err) = rename_object(
                &online.disks,
                SYS_VOLUME,
                &session_path,
                bucket,
                object,
                self.write_quorum(),
            )
            .await
            {
                if had_object {
                    if let Err(restore_err) =
                        rename_object(&all_disks, SYS_VOLUME, &displaced, bucket, object, self.write_quorum())
                            .await
                    {
                        warn!(
                            bucket,
                            object,
                            displaced = %displaced,
                            error = %restore_err,
                            "failed to restore displaced object"
                        );
                    }
                }
                return Err(err.into_object_err(bucket, object));
            }

            if had_object {
                cleanup_on_disks(&all_disks, SYS_VOLUME, &displaced).await;
            }
        }

        {
            let _index_guard = self
                .ns_lock
                .lock(SYS_VOLUME, &object_mpart_path(bucket, object))
                .await;
            remove_upload_id(&self.disk_slots(), bucket, object, upload_id, self.write_quorum())
                .await?;
        }

        info!(bucket, object, upload_id, size = object_size, etag = %s3_md5, "multipart upload completed");
        Ok(xl_meta.to_object_info(bucket, object))
    }

    pub(crate) async fn abort_upload(&self, bucket: &str, object: &str, upload_id: &str) -> Result<()> {
        self.check_bucket(bucket).await?;
        check_object_name(bucket, object)?;
        check_upload_id(upload_id)?;

        let session_path = upload_id_path(bucket, object, upload_id);
        let _session_guard = self.ns_lock.lock(SYS_VOLUME, &session_path).await;
        if !self.is_upload_id_exists(bucket, object, upload_id).await {
            return Err(StrataError::InvalidUploadId(upload_id.to_string()));
        }

        let disks = self.disk_slots();
        delete_from_disks(&disks, SYS_VOLUME, &retain_slash(&session_path), self.write_quorum())
            .await
            .map_err(|err| session_err(err, upload_id))?;

        {
            let _index_guard = self
                .ns_lock
                .lock(SYS_VOLUME, &object_mpart_path(bucket, object))
                .await;
            remove_upload_id(&disks, bucket, object, upload_id, self.write_quorum()).await?;
        }

        info!(bucket, object, upload_id, "multipart upload aborted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_ids_are_non_nil_uuids() {
        assert!(is_valid_upload_id(&Uuid::new_v4().to_string()));
        assert!(!is_valid_upload_id("00000000-0000-0000-0000-000000000000"));
        assert!(!is_valid_upload_id("b/0b7c0e54-0000-4000-8000-000000000001"));
        assert!(!is_valid_upload_id(".."));
        assert!(!is_valid_upload_id(""));
    }

    #[test]
    fn session_paths_nest_under_the_object() {
        assert_eq!(
            upload_id_path("photos", "a/b.jpg", "0b7c0e54-0000-4000-8000-000000000001"),
            "multipart/photos/a/b.jpg/0b7c0e54-0000-4000-8000-000000000001"
        );
        assert_eq!(part_file_name(7), "object7");
    }
}
