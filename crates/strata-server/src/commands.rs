use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::Path;

use anyhow::Context;
use strata_storage::datatypes::CompletePart;
use strata_storage::traits::ReadStream;
use strata_storage::{ErasureObjects, ObjectLayer};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{info, warn};

pub async fn make_bucket(objects: &ErasureObjects, bucket: &str) -> anyhow::Result<()> {
    objects.make_bucket(bucket).await?;
    println!("{bucket}");
    Ok(())
}

async fn open_part(file: &Path, offset: u64, len: u64) -> anyhow::Result<ReadStream> {
    let mut handle = File::open(file)
        .await
        .with_context(|| format!("failed to open {}", file.display()))?;
    handle.seek(SeekFrom::Start(offset)).await?;
    Ok(Box::new(handle.take(len)))
}

pub async fn upload(
    objects: &ErasureObjects,
    bucket: &str,
    key: &str,
    file: &Path,
    part_size: u64,
) -> anyhow::Result<()> {
    anyhow::ensure!(part_size > 0, "--part-size must be positive");
    let total = tokio::fs::metadata(file)
        .await
        .with_context(|| format!("failed to stat {}", file.display()))?
        .len();

    let upload_id = objects
        .new_multipart_upload(bucket, key, HashMap::new())
        .await?;
    info!(bucket, key, upload_id = %upload_id, total, "upload started");

    let result = async {
        let mut parts = Vec::new();
        let mut offset = 0_u64;
        let mut part_number = 1_i32;
        loop {
            let len = part_size.min(total - offset);
            let data = open_part(file, offset, len).await?;
            let etag = objects
                .put_object_part(bucket, key, &upload_id, part_number, len as i64, data, None)
                .await?;
            parts.push(CompletePart { part_number, etag });

            offset += len;
            part_number += 1;
            if offset >= total {
                break;
            }
        }
        let info = objects
            .complete_multipart_upload(bucket, key, &upload_id, parts)
            .await?;
        anyhow::Ok(info)
    }
    .await;

    match result {
        Ok(info) => {
            println!("{}\t{}\t{}", info.key, info.size, info.etag);
            Ok(())
        }
        Err(err) => {
            if let Err(abort_err) = objects.abort_multipart_upload(bucket, key, &upload_id).await {
                warn!(upload_id = %upload_id, error = %abort_err, "failed to abort upload");
            }
            Err(err)
        }
    }
}

pub async fn cat(
    objects: &ErasureObjects,
    bucket: &str,
    key: &str,
    offset: u64,
    length: Option<u64>,
) -> anyhow::Result<()> {
    let (info, mut reader) = objects.get_object(bucket, key, offset, length).await?;
    let mut stdout = tokio::io::stdout();
    let copied = tokio::io::copy(&mut reader, &mut stdout).await?;
    stdout.flush().await?;
    info!(bucket, key, size = info.size, copied, "object written to stdout");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub async fn list_uploads(
    objects: &ErasureObjects,
    bucket: &str,
    prefix: &str,
    key_marker: &str,
    upload_id_marker: &str,
    delimiter: &str,
    max_uploads: i32,
) -> anyhow::Result<()> {
    let listing = objects
        .list_multipart_uploads(bucket, prefix, key_marker, upload_id_marker, delimiter, max_uploads)
        .await?;
    for prefix in &listing.common_prefixes {
        println!("PRE\t{prefix}");
    }
    for upload in &listing.uploads {
        println!("{}\t{}\t{}", upload.key, upload.upload_id, upload.initiated.to_rfc3339());
    }
    if listing.is_truncated {
        println!(
            "next: --key-marker {} --upload-id-marker {}",
            listing.next_key_marker, listing.next_upload_id_marker
        );
    }
    Ok(())
}

pub async fn list_parts(
    objects: &ErasureObjects,
    bucket: &str,
    key: &str,
    upload_id: &str,
    part_number_marker: i32,
    max_parts: i32,
) -> anyhow::Result<()> {
    let listing = objects
        .list_object_parts(bucket, key, upload_id, part_number_marker, max_parts)
        .await?;
    for part in &listing.parts {
        println!(
            "{}\t{}\t{}\t{}",
            part.part_number,
            part.size,
            part.etag,
            part.last_modified.to_rfc3339()
        );
    }
    if listing.is_truncated {
        println!("next: --part-number-marker {}", listing.next_part_number_marker);
    }
    Ok(())
}

pub async fn abort(
    objects: &ErasureObjects,
    bucket: &str,
    key: &str,
    upload_id: &str,
) -> anyhow::Result<()> {
    objects.abort_multipart_upload(bucket, key, upload_id).await?;
    info!(bucket, key, upload_id, "upload aborted");
    Ok(())
}
