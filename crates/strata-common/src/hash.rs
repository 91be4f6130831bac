use md5::{Digest, Md5};

use crate::error::{Result, StrataError};

pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// Strips the quotes S3 clients put around ETags.
pub fn canonical_etag(etag: &str) -> &str {
    etag.trim().trim_matches('"')
}

/// S3 composite ETag for a completed multipart upload: the MD5 of the
/// concatenated raw part digests, suffixed with the part count.
pub fn complete_multipart_md5<'a, I>(etags: I) -> Result<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut hasher = Md5::new();
    let mut count = 0_usize;
    for etag in etags {
        let raw = hex::decode(canonical_etag(etag))
            .map_err(|err| StrataError::InvalidArgument(format!("malformed part etag {etag}: {err}")))?;
        hasher.update(&raw);
        count += 1;
    }
    Ok(format!("{}-{count}", hex::encode(hasher.finalize())))
}
