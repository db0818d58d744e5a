//! Volume Descriptors
//!
//! Serializable volume specifications used to pass volumes across thread
//! boundaries and to declare additional volumes in engine configuration.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;

use super::base::StorageVolume;
use super::bucket::BucketVolume;
use super::fs::FileSystemStorage;
use super::s3::S3Bucket;

/// Backend-specific part of a volume specification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum VolumeKind {
    Fs {
        basedir: PathBuf,
    },
    Bucket {
        bucket: String,
        #[serde(default)]
        prefix: String,
    },
    /// S3 bucket; credentials are taken from the `AWS_*` environment.
    S3 {
        bucket: String,
        #[serde(default)]
        prefix: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        region: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
    },
}

/// Serialized form of a storage volume.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub id: String,

    #[serde(flatten)]
    pub kind: VolumeKind,

    /// Files that already exist on the volume when a run starts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
}

impl VolumeSpec {
    pub fn new(id: impl Into<String>, kind: VolumeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            files: Vec::new(),
        }
    }

    /// Adds a file that is known to exist on the volume.
    pub fn with_file(mut self, key: impl Into<String>) -> Self {
        self.files.push(key.into());
        self
    }
}

/// Reopens a volume from its specification.
pub fn open_volume(spec: &VolumeSpec) -> Result<Box<dyn StorageVolume>> {
    match &spec.kind {
        VolumeKind::Fs { basedir } => Ok(Box::new(FileSystemStorage::new(
            basedir.clone(),
            Some(&spec.id),
        )?)),
        VolumeKind::Bucket { bucket, prefix } => {
            Ok(Box::new(BucketVolume::open(bucket, prefix, Some(&spec.id))))
        }
        VolumeKind::S3 {
            bucket,
            prefix,
            region,
            endpoint,
        } => {
            let store = S3Bucket::connect(bucket, region.as_deref(), endpoint.as_deref())?;
            Ok(Box::new(BucketVolume::new(
                Arc::new(store),
                prefix,
                Some(&spec.id),
            )))
        }
    }
}
