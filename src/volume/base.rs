//! Storage Volume Interface
//!
//! Uniform abstraction over a hierarchical file namespace. Keys are
//! `/`-separated logical paths relative to the volume root.

use std::fmt::Debug;
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::debug;

use crate::error::Result;

use super::factory::VolumeSpec;

/// Readable handle for a single file on a storage volume.
pub trait IoHandle: Send + Sync + Debug {
    /// Opens the file for reading.
    fn open(&self) -> Result<Box<dyn Read + Send>>;

    /// Size of the file in bytes.
    fn size(&self) -> Result<u64>;
}

/// Handle for a file on the local file system.
#[derive(Clone, Debug)]
pub struct FsFile {
    path: PathBuf,
}

impl FsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl IoHandle for FsFile {
    fn open(&self) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(&self.path)?))
    }

    fn size(&self) -> Result<u64> {
        Ok(self.path.metadata()?.len())
    }
}

/// In-memory file content.
#[derive(Clone, Debug, Default)]
pub struct IoBuffer {
    data: Arc<Vec<u8>>,
}

impl IoBuffer {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: Arc::new(data.into()),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl IoHandle for IoBuffer {
    fn open(&self) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(Cursor::new(self.data.as_ref().clone())))
    }

    fn size(&self) -> Result<u64> {
        Ok(self.data.len() as u64)
    }
}

/// A file listing entry produced by [`StorageVolume::walk`].
pub type FileEntry = (String, Box<dyn IoHandle>);

/// Storage volume contract shared by all backends.
pub trait StorageVolume: Send + Sync + Debug {
    /// Unique identifier of the volume within a run.
    fn identifier(&self) -> &str;

    /// Human-readable description of the backing storage.
    fn describe(&self) -> String;

    /// Releases any resources held by the volume.
    fn close(&self) {}

    /// Removes the file or subtree at `key`. Missing keys are ignored.
    fn delete(&self, key: &str) -> Result<()>;

    /// Removes the whole backing storage of the volume.
    fn erase(&self) -> Result<()>;

    /// Returns a volume scoped to the subtree at `key` on the same medium.
    fn get_store_for_folder(
        &self,
        key: &str,
        identifier: Option<&str>,
    ) -> Result<Box<dyn StorageVolume>>;

    /// Opens the file at `key`, failing with `UnknownFile` if absent.
    fn load(&self, key: &str) -> Result<Box<dyn IoHandle>>;

    /// Ensures a directory exists at `key`.
    fn mkdir(&self, key: &str) -> Result<()>;

    /// Writes the content of `file` to `dst`.
    fn store(&self, file: &dyn IoHandle, dst: &str) -> Result<()>;

    /// Serializable descriptor from which the volume can be reopened.
    fn to_spec(&self) -> VolumeSpec;

    /// Lists all files whose key starts with `prefix` (all files for None).
    ///
    /// A prefix that names a file yields exactly that file; a prefix that
    /// names a folder yields every file below it.
    fn walk(&self, prefix: Option<&str>) -> Result<Vec<FileEntry>>;

    /// Local directory of the volume, if it lives on the local file system.
    fn local_path(&self) -> Option<&Path> {
        None
    }

    /// Copies files from this volume into `target`.
    ///
    /// # Arguments
    ///
    /// * `src` - Keys of files or folders to copy, None for the whole volume
    /// * `dst` - Optional destination prefix on the target volume
    /// * `target` - Volume that receives the copies
    ///
    /// # Returns
    ///
    /// The keys written on the target volume, in copy order.
    fn copy(
        &self,
        src: Option<&[String]>,
        dst: Option<&str>,
        target: &dyn StorageVolume,
    ) -> Result<Vec<String>> {
        match src {
            None => copy_files(self, None, dst, target),
            Some(keys) => {
                let mut written = Vec::new();
                for key in keys {
                    written.extend(copy_files(self, Some(key), dst, target)?);
                }
                Ok(written)
            }
        }
    }
}

/// Copies a single file or folder `path` from `source` into `target`.
///
/// If walking `path` yields exactly one entry whose key equals `path`, the
/// entry is a file and is stored at `dst` (or at `path` when no destination
/// is given). Otherwise every entry is stored at its key relative to `path`,
/// below `dst`.
pub fn copy_files<S: StorageVolume + ?Sized>(
    source: &S,
    path: Option<&str>,
    dst: Option<&str>,
    target: &dyn StorageVolume,
) -> Result<Vec<String>> {
    let files = source.walk(path)?;
    let mut written = Vec::with_capacity(files.len());

    let single_file = match (path, files.as_slice()) {
        (Some(p), [(key, _)]) => key == p,
        _ => false,
    };

    if single_file {
        if let (Some(p), Some((_, file))) = (path, files.first()) {
            let key = dst.unwrap_or(p).to_string();
            target.store(file.as_ref(), &key)?;
            written.push(key);
        }
    } else {
        let strip = path.map(|p| format!("{}/", p.trim_end_matches('/')));
        for (key, file) in &files {
            let relative = match &strip {
                Some(prefix) => key.strip_prefix(prefix.as_str()).unwrap_or(key),
                None => key.as_str(),
            };
            let target_key = match dst {
                Some(d) => join_key(d, relative),
                None => match path {
                    Some(p) => join_key(p, relative),
                    None => relative.to_string(),
                },
            };
            target.store(file.as_ref(), &target_key)?;
            written.push(target_key);
        }
    }

    debug!(
        "copied {} file(s) from {} to {}",
        written.len(),
        source.identifier(),
        target.identifier()
    );
    Ok(written)
}

/// Joins two logical key fragments with a single separator.
pub fn join_key(parent: &str, child: &str) -> String {
    let parent = parent.trim_end_matches('/');
    let child = child.trim_start_matches('/');
    match (parent.is_empty(), child.is_empty()) {
        (true, _) => child.to_string(),
        (_, true) => parent.to_string(),
        _ => format!("{}/{}", parent, child),
    }
}

/// Reads a whole file from a handle into a string.
pub fn read_to_string(file: &dyn IoHandle) -> Result<String> {
    let mut content = String::new();
    file.open()?.read_to_string(&mut content)?;
    Ok(content)
}
