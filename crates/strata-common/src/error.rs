use thiserror::Error;

#[derive(Debug, Error)]
pub enum StrataError {
    // Validation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid bucket name: {0}")]
    InvalidBucketName(String),
    #[error("invalid object name: {bucket}/{object}")]
    InvalidObjectName { bucket: String, object: String },
    #[error("unsupported delimiter: {0}")]
    UnsupportedDelimiter(String),
    #[error("invalid combination of marker '{marker}' and prefix '{prefix}'")]
    InvalidMarkerPrefixCombination { marker: String, prefix: String },
    #[error("invalid combination of upload id marker '{upload_id_marker}' and key marker '{key_marker}'")]
    InvalidUploadIdKeyCombination {
        upload_id_marker: String,
        key_marker: String,
    },
    #[error("malformed upload id: {0}")]
    MalformedUploadId(String),
    #[error("entity too large: size={size}, max_size={max_size}")]
    EntityTooLarge { size: u64, max_size: u64 },

    // Session state.
    #[error("invalid upload id: {0}")]
    InvalidUploadId(String),
    #[error("invalid part: {0}")]
    InvalidPart(i32),
    #[error("parts are not in ascending order")]
    InvalidPartOrder,
    #[error("bad digest: expected {expected}, calculated {calculated}")]
    BadDigest { expected: String, calculated: String },
    #[error("part {part_number} is too small: size={size}, min_size={min_size}")]
    PartTooSmall {
        part_number: i32,
        size: i64,
        min_size: i64,
    },
    #[error("signature does not match")]
    SignatureDoesNotMatch,

    // Namespace.
    #[error("bucket not found: {0}")]
    BucketNotFound(String),
    #[error("bucket already exists: {0}")]
    BucketAlreadyExists(String),
    #[error("object not found: {bucket}/{object}")]
    ObjectNotFound { bucket: String, object: String },
    #[error("access denied: {0}")]
    AccessDenied(String),

    // Quorum and corruption.
    #[error("insufficient read quorum")]
    InsufficientReadQuorum,
    #[error("insufficient write quorum")]
    InsufficientWriteQuorum,
    #[error("data corrupt: every shard of the block is empty")]
    DataCorrupt,
    #[error("verification failed after reconstruction, data likely corrupted")]
    VerificationFailed,

    // Codec.
    #[error("invalid erasure configuration: {0}")]
    ErasureConfig(String),
    #[error("codec error: {0}")]
    Codec(String),

    // Disk transport.
    #[error("disk not found")]
    DiskNotFound,
    #[error("volume not found: {0}")]
    VolumeNotFound(String),
    #[error("volume already exists: {0}")]
    VolumeExists(String),
    #[error("volume not empty: {0}")]
    VolumeNotEmpty(String),
    #[error("file not found: {0}")]
    FileNotFound(String),
    #[error("file access denied: {0}")]
    FileAccessDenied(String),
    #[error("not a regular file: {0}")]
    IsNotRegular(String),

    #[error("internal error: {0}")]
    InternalError(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StrataError {
    pub fn s3_error_code(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "InvalidArgument",
            Self::InvalidBucketName(_) => "InvalidBucketName",
            Self::InvalidObjectName { .. } => "XStrataInvalidObjectName",
            Self::UnsupportedDelimiter(_) => "NotImplemented",
            Self::InvalidMarkerPrefixCombination { .. } => "NotImplemented",
            Self::InvalidUploadIdKeyCombination { .. } => "NotImplemented",
            Self::MalformedUploadId(_) => "NoSuchUpload",
            Self::EntityTooLarge { .. } => "EntityTooLarge",
            Self::InvalidUploadId(_) => "NoSuchUpload",
            Self::InvalidPart(_) => "InvalidPart",
            Self::InvalidPartOrder => "InvalidPartOrder",
            Self::BadDigest { .. } => "BadDigest",
            Self::PartTooSmall { .. } => "EntityTooSmall",
            Self::SignatureDoesNotMatch => "SignatureDoesNotMatch",
            Self::BucketNotFound(_) => "NoSuchBucket",
            Self::BucketAlreadyExists(_) => "BucketAlreadyOwnedByYou",
            Self::ObjectNotFound { .. } => "NoSuchKey",
            Self::AccessDenied(_) => "AccessDenied",
            Self::InsufficientReadQuorum => "XStrataReadQuorum",
            Self::InsufficientWriteQuorum => "XStrataWriteQuorum",
            Self::DataCorrupt | Self::VerificationFailed => "XStrataObjectTampered",
            Self::ErasureConfig(_)
            | Self::Codec(_)
            | Self::DiskNotFound
            | Self::VolumeNotFound(_)
            | Self::VolumeExists(_)
            | Self::VolumeNotEmpty(_)
            | Self::FileNotFound(_)
            | Self::FileAccessDenied(_)
            | Self::IsNotRegular(_)
            | Self::InternalError(_)
            | Self::Io(_) => "InternalError",
        }
    }

    /// Disk level failures the erasure layer absorbs as long as enough
    /// other disks answer.
    pub fn is_disk_transient(&self) -> bool {
        matches!(self, Self::DiskNotFound | Self::FileNotFound(_))
    }

    /// Translates a disk level error into the object level vocabulary.
    pub fn into_object_err(self, bucket: &str, object: &str) -> Self {
        match self {
            Self::VolumeNotFound(_) => Self::BucketNotFound(bucket.to_string()),
            Self::VolumeExists(_) => Self::BucketAlreadyExists(bucket.to_string()),
            Self::FileNotFound(_) | Self::IsNotRegular(_) => Self::ObjectNotFound {
                bucket: bucket.to_string(),
                object: object.to_string(),
            },
            Self::FileAccessDenied(_) => Self::AccessDenied(format!("{bucket}/{object}")),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, StrataError>;

#[cfg(test)]
mod tests {
    use super::StrataError;

    #[test]
    fn disk_errors_map_into_object_errors() {
        let err = StrataError::FileNotFound("a/xl.json".to_string()).into_object_err("photos", "a");
        assert!(matches!(
            err,
            StrataError::ObjectNotFound { ref bucket, ref object } if bucket == "photos" && object == "a"
        ));

        let err = StrataError::VolumeNotFound("photos".to_string()).into_object_err("photos", "a");
        assert!(matches!(err, StrataError::BucketNotFound(ref bucket) if bucket == "photos"));

        let err = StrataError::InsufficientReadQuorum.into_object_err("photos", "a");
        assert!(matches!(err, StrataError::InsufficientReadQuorum));
    }

    #[test]
    fn multipart_errors_use_s3_codes() {
        assert_eq!(
            StrataError::InvalidUploadId("x".to_string()).s3_error_code(),
            "NoSuchUpload"
        );
        assert_eq!(
            StrataError::PartTooSmall {
                part_number: 1,
                size: 1,
                min_size: 5
            }
            .s3_error_code(),
            "EntityTooSmall"
        );
        assert!(StrataError::DiskNotFound.is_disk_transient());
        assert!(!StrataError::VerificationFailed.is_disk_transient());
    }
}
