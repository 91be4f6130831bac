pub mod datatypes;
pub mod erasure;
pub mod hash;
pub mod multipart;
pub mod naming;
pub mod nslock;
pub mod traits;
pub mod xl;

pub use erasure::objects::{ErasureObjects, MultipartConfig};
pub use erasure::{Erasure, ErasureConfig, ErasureReader};
pub use nslock::NsLockMap;
pub use traits::{ObjectLayer, StorageAPI};
pub use xl::storage::XlStorage;
