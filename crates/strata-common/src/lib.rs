pub mod error;
pub mod hash;
pub mod mime;
pub mod time;
pub mod types;

pub use error::{Result, StrataError};
pub use types::{BucketInfo, ObjectInfo};
