//! Object Store Volume
//!
//! Storage volume over a flat key/value object store. Folders exist only as
//! key prefixes, so `mkdir` is a no-op. Two stores are provided:
//!
//! - [`MemoryBucket`] keeps named buckets in a process-wide registry, so a
//!   volume descriptor can be reopened on another thread
//! - [`S3Bucket`](super::s3::S3Bucket) stores objects in an S3 bucket

use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::io::Read;
use std::sync::{Arc, Mutex, MutexGuard};

use once_cell::sync::Lazy;
use uuid::Uuid;

use crate::error::{FlowError, Result};

use super::base::{join_key, FileEntry, IoBuffer, IoHandle, StorageVolume};
use super::factory::{VolumeKind, VolumeSpec};

/// Minimal object store interface.
pub trait ObjectStore: Send + Sync + Debug {
    /// Lists all object keys starting with `prefix`, in lexical order.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Reads an object, None if it does not exist.
    fn get(&self, key: &str) -> Result<Option<IoBuffer>>;

    fn put(&self, key: &str, data: Vec<u8>) -> Result<()>;

    /// Removes an object. Missing objects are ignored.
    fn delete(&self, key: &str) -> Result<()>;

    /// Volume descriptor for the given key prefix in this store.
    fn to_kind(&self, prefix: &str) -> VolumeKind;
}

/// In-memory object store.
#[derive(Debug, Default)]
pub struct MemoryBucket {
    name: String,
    objects: Mutex<BTreeMap<String, IoBuffer>>,
}

static BUCKETS: Lazy<Mutex<HashMap<String, Arc<MemoryBucket>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

impl MemoryBucket {
    /// Returns the bucket registered under `name`, creating it if needed.
    pub fn named(name: &str) -> Arc<MemoryBucket> {
        let mut buckets = BUCKETS.lock().unwrap_or_else(|e| e.into_inner());
        let bucket = buckets.entry(name.to_string()).or_insert_with(|| {
            Arc::new(MemoryBucket {
                name: name.to_string(),
                ..Default::default()
            })
        });
        Arc::clone(bucket)
    }

    /// Removes the bucket registered under `name`.
    pub fn drop_named(name: &str) {
        let mut buckets = BUCKETS.lock().unwrap_or_else(|e| e.into_inner());
        buckets.remove(name);
    }

    fn objects(&self) -> MutexGuard<'_, BTreeMap<String, IoBuffer>> {
        self.objects.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ObjectStore for MemoryBucket {
    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .objects()
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }

    fn get(&self, key: &str) -> Result<Option<IoBuffer>> {
        Ok(self.objects().get(key).cloned())
    }

    fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        self.objects().insert(key.to_string(), IoBuffer::new(data));
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.objects().remove(key);
        Ok(())
    }

    fn to_kind(&self, prefix: &str) -> VolumeKind {
        VolumeKind::Bucket {
            bucket: self.name.clone(),
            prefix: prefix.to_string(),
        }
    }
}

/// Storage volume for a key prefix in an object store.
#[derive(Clone, Debug)]
pub struct BucketVolume {
    prefix: String,
    identifier: String,
    objects: Arc<dyn ObjectStore>,
}

impl BucketVolume {
    /// Opens the volume for `prefix` in the in-memory bucket `bucket_id`.
    pub fn open(bucket_id: &str, prefix: &str, identifier: Option<&str>) -> Self {
        Self::new(MemoryBucket::named(bucket_id), prefix, identifier)
    }

    /// Creates a volume for `prefix` in `objects`.
    pub fn new(objects: Arc<dyn ObjectStore>, prefix: &str, identifier: Option<&str>) -> Self {
        Self {
            prefix: prefix.trim_matches('/').to_string(),
            identifier: identifier
                .map(str::to_string)
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            objects,
        }
    }

    fn object_key(&self, key: &str) -> String {
        join_key(&self.prefix, key.trim_matches('/'))
    }

    fn volume_key<'a>(&self, object_key: &'a str) -> &'a str {
        if self.prefix.is_empty() {
            object_key
        } else {
            object_key
                .strip_prefix(self.prefix.as_str())
                .map(|k| k.trim_start_matches('/'))
                .unwrap_or(object_key)
        }
    }

    /// Object keys at `key` itself or below the folder `key`.
    fn matching_keys(&self, key: &str) -> Result<Vec<String>> {
        let target = self.object_key(key);
        let folder = if target.is_empty() {
            String::new()
        } else {
            format!("{}/", target)
        };
        Ok(self
            .objects
            .list(&target)?
            .into_iter()
            .filter(|k| *k == target || k.starts_with(&folder))
            .collect())
    }
}

impl StorageVolume for BucketVolume {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn describe(&self) -> String {
        let bucket = match self.objects.to_kind(&self.prefix) {
            VolumeKind::S3 { bucket, .. } => format!("S3 bucket {}", bucket),
            VolumeKind::Bucket { bucket, .. } => format!("bucket {}", bucket),
            VolumeKind::Fs { basedir } => basedir.display().to_string(),
        };
        format!("{} at prefix '{}'", bucket, self.prefix)
    }

    fn delete(&self, key: &str) -> Result<()> {
        for object in self.matching_keys(key)? {
            self.objects.delete(&object)?;
        }
        Ok(())
    }

    fn erase(&self) -> Result<()> {
        self.delete("")
    }

    fn get_store_for_folder(
        &self,
        key: &str,
        identifier: Option<&str>,
    ) -> Result<Box<dyn StorageVolume>> {
        Ok(Box::new(BucketVolume::new(
            Arc::clone(&self.objects),
            &self.object_key(key),
            identifier,
        )))
    }

    fn load(&self, key: &str) -> Result<Box<dyn IoHandle>> {
        self.objects
            .get(&self.object_key(key))?
            .map(|buf| Box::new(buf) as Box<dyn IoHandle>)
            .ok_or_else(|| FlowError::UnknownFile(key.to_string()))
    }

    fn mkdir(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    fn store(&self, file: &dyn IoHandle, dst: &str) -> Result<()> {
        let mut data = Vec::new();
        file.open()?.read_to_end(&mut data)?;
        self.objects.put(&self.object_key(dst), data)
    }

    fn to_spec(&self) -> VolumeSpec {
        VolumeSpec::new(&self.identifier, self.objects.to_kind(&self.prefix))
    }

    fn walk(&self, prefix: Option<&str>) -> Result<Vec<FileEntry>> {
        let mut files = Vec::new();
        for object in self.matching_keys(prefix.unwrap_or(""))? {
            if let Some(buf) = self.objects.get(&object)? {
                let key = self.volume_key(&object).to_string();
                files.push((key, Box::new(buf) as Box<dyn IoHandle>));
            }
        }
        Ok(files)
    }
}
