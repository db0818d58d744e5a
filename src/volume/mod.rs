//! Storage Volume Module
//!
//! Virtual multi-volume file system used by workflow runs.
//!
//! # Structure
//!
//! - [`base`]: The `StorageVolume` trait and file handles
//! - [`fs`]: Local file system volumes
//! - [`bucket`]: Object-store volumes
//! - [`s3`]: S3 object store
//! - [`factory`]: Serializable volume specifications
//! - [`manager`]: File availability tracking and replication

pub mod base;
pub mod bucket;
pub mod factory;
pub mod fs;
pub mod manager;
pub mod s3;

pub use base::{FsFile, IoBuffer, IoHandle, StorageVolume};
pub use bucket::{BucketVolume, MemoryBucket, ObjectStore};
pub use factory::{open_volume, VolumeKind, VolumeSpec};
pub use fs::FileSystemStorage;
pub use manager::{VolumeManager, DEFAULT_STORE};
pub use s3::S3Bucket;
