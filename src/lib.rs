pub mod buffer;
pub mod common;
pub mod concurrency;
pub mod error;
pub mod storage;
pub mod tuple;
