pub mod meta;
pub mod storage;
