//! Archive sink implementations.
//!
//! The S3 sink writes through the `object_store` crate, so the same code
//! serves any S3-compatible endpoint and the in-memory store used in tests.

pub mod s3;

pub use s3::{build_s3_store, Credentials, ObjectStoreSink};
