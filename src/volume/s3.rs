//! S3 Object Store
//!
//! [`ObjectStore`] implementation for Amazon S3 and S3-compatible services.
//! Requests are driven by a private current-thread tokio runtime, so the
//! store can be used from the synchronous volume interface. Credentials are
//! read from the usual `AWS_*` environment variables.

use futures_util::stream::StreamExt;
use log::debug;
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore as _;
use tokio::runtime::Runtime;

use crate::error::{FlowError, Result};

use super::base::IoBuffer;
use super::bucket::ObjectStore;
use super::factory::VolumeKind;

/// Objects in an S3 bucket.
#[derive(Debug)]
pub struct S3Bucket {
    bucket: String,
    region: Option<String>,
    endpoint: Option<String>,
    client: AmazonS3,
    runtime: Runtime,
}

impl S3Bucket {
    /// Connects to `bucket`.
    ///
    /// # Arguments
    ///
    /// * `bucket` - Bucket name
    /// * `region` - AWS region, None to use `AWS_DEFAULT_REGION`
    /// * `endpoint` - Endpoint of an S3-compatible service such as MinIO
    pub fn connect(bucket: &str, region: Option<&str>, endpoint: Option<&str>) -> Result<Self> {
        let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);
        if let Some(region) = region {
            builder = builder.with_region(region);
        }
        if let Some(endpoint) = endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"));
        }
        let client = builder.build()?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        debug!("Connected to S3 bucket {}", bucket);
        Ok(Self {
            bucket: bucket.to_string(),
            region: region.map(str::to_string),
            endpoint: endpoint.map(str::to_string),
            client,
            runtime,
        })
    }
}

/// Folder to list for a key prefix; S3 listings are folder based.
fn list_root(prefix: &str) -> Option<&str> {
    prefix
        .rsplit_once('/')
        .map(|(folder, _)| folder)
        .filter(|folder| !folder.is_empty())
}

impl ObjectStore for S3Bucket {
    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let root = list_root(prefix).map(ObjectPath::from);
        self.runtime.block_on(async {
            let mut keys = Vec::new();
            let mut listing = self.client.list(root.as_ref());
            while let Some(meta) = listing.next().await {
                let key = meta?.location.to_string();
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
            keys.sort();
            Ok::<_, FlowError>(keys)
        })
    }

    fn get(&self, key: &str) -> Result<Option<IoBuffer>> {
        let location = ObjectPath::from(key);
        self.runtime.block_on(async {
            let object = match self.client.get(&location).await {
                Ok(object) => object,
                Err(object_store::Error::NotFound { .. }) => return Ok(None),
                Err(e) => return Err(FlowError::from(e)),
            };
            let bytes = object.bytes().await?;
            Ok::<_, FlowError>(Some(IoBuffer::new(bytes.to_vec())))
        })
    }

    fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        let location = ObjectPath::from(key);
        self.runtime.block_on(self.client.put(&location, data.into()))?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let location = ObjectPath::from(key);
        match self.runtime.block_on(self.client.delete(&location)) {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn to_kind(&self, prefix: &str) -> VolumeKind {
        VolumeKind::S3 {
            bucket: self.bucket.clone(),
            prefix: prefix.to_string(),
            region: self.region.clone(),
            endpoint: self.endpoint.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::{open_volume, BucketVolume, StorageVolume};
    use std::sync::Arc;

    #[test]
    fn test_list_root() {
        assert_eq!(list_root("runs/r1/data"), Some("runs/r1"));
        assert_eq!(list_root("runs/r1/"), Some("runs/r1"));
        assert_eq!(list_root("a.txt"), None);
        assert_eq!(list_root(""), None);
    }

    #[test]
    fn test_volume_spec_round_trip() {
        let store = S3Bucket::connect("results", Some("us-east-1"), Some("http://localhost:9000"))
            .unwrap();
        let volume = BucketVolume::new(Arc::new(store), "runs/r1", Some("archive"));

        let spec = volume.to_spec();
        assert_eq!(
            spec.kind,
            VolumeKind::S3 {
                bucket: "results".into(),
                prefix: "runs/r1".into(),
                region: Some("us-east-1".into()),
                endpoint: Some("http://localhost:9000".into()),
            }
        );
        assert!(volume.describe().contains("S3 bucket results"));
        assert!(volume.local_path().is_none());

        let reopened = open_volume(&spec).unwrap();
        assert_eq!(reopened.identifier(), "archive");
        assert_eq!(reopened.to_spec(), spec);
    }
}
