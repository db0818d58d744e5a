//! Local File System Volume
//!
//! Storage volume backed by a directory on the local file system.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info};
use uuid::Uuid;

use crate::error::{FlowError, Result};

use super::base::{FileEntry, FsFile, IoHandle, StorageVolume};
use super::factory::{VolumeKind, VolumeSpec};

/// Storage volume rooted at a local directory.
#[derive(Clone, Debug)]
pub struct FileSystemStorage {
    basedir: PathBuf,
    identifier: String,
}

impl FileSystemStorage {
    /// Creates a volume for `basedir`, creating the directory if needed.
    ///
    /// The directory is stored as an absolute path, so folders derived from
    /// the volume do not depend on the process working directory. A random
    /// identifier is generated when none is given.
    pub fn new(basedir: impl Into<PathBuf>, identifier: Option<&str>) -> Result<Self> {
        let basedir = basedir.into();
        fs::create_dir_all(&basedir)?;
        let basedir = fs::canonicalize(&basedir)?;
        let identifier = identifier
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Ok(Self {
            basedir,
            identifier,
        })
    }

    pub fn basedir(&self) -> &Path {
        &self.basedir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        key.split('/')
            .filter(|part| !part.is_empty())
            .fold(self.basedir.clone(), |path, part| path.join(part))
    }
}

impl StorageVolume for FileSystemStorage {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn describe(&self) -> String {
        format!("local file system at {}", self.basedir.display())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        let result = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        match result {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn erase(&self) -> Result<()> {
        if self.basedir.exists() {
            fs::remove_dir_all(&self.basedir)?;
            info!("Erased volume {}", self.basedir.display());
        }
        Ok(())
    }

    fn get_store_for_folder(
        &self,
        key: &str,
        identifier: Option<&str>,
    ) -> Result<Box<dyn StorageVolume>> {
        let store = FileSystemStorage::new(self.path_for(key), identifier)?;
        Ok(Box::new(store))
    }

    fn load(&self, key: &str) -> Result<Box<dyn IoHandle>> {
        let path = self.path_for(key);
        if !path.is_file() {
            return Err(FlowError::UnknownFile(key.to_string()));
        }
        Ok(Box::new(FsFile::new(path)))
    }

    fn mkdir(&self, key: &str) -> Result<()> {
        fs::create_dir_all(self.path_for(key))?;
        Ok(())
    }

    fn store(&self, file: &dyn IoHandle, dst: &str) -> Result<()> {
        let path = self.path_for(dst);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut reader = file.open()?;
        let mut out = fs::File::create(&path)?;
        io::copy(&mut reader, &mut out)?;
        debug!("stored {}", path.display());
        Ok(())
    }

    fn to_spec(&self) -> VolumeSpec {
        VolumeSpec::new(
            &self.identifier,
            VolumeKind::Fs {
                basedir: self.basedir.clone(),
            },
        )
    }

    fn walk(&self, prefix: Option<&str>) -> Result<Vec<FileEntry>> {
        let prefix = prefix.map(|p| p.trim_matches('/')).unwrap_or("");
        let start = self.path_for(prefix);
        let mut files = Vec::new();
        if start.is_file() {
            files.push((prefix.to_string(), Box::new(FsFile::new(start)) as Box<dyn IoHandle>));
        } else if start.is_dir() {
            walk_dir(&start, prefix, &mut files)?;
        }
        Ok(files)
    }

    fn local_path(&self) -> Option<&Path> {
        Some(&self.basedir)
    }
}

/// Recursively collects all files below `dir`, keyed relative to the volume.
fn walk_dir(dir: &Path, key: &str, files: &mut Vec<FileEntry>) -> Result<()> {
    let mut entries = fs::read_dir(dir)?.collect::<io::Result<Vec<_>>>()?;
    entries.sort_by_key(|entry| entry.file_name());
    for entry in entries {
        let name = entry.file_name().to_string_lossy().to_string();
        let child_key = if key.is_empty() {
            name
        } else {
            format!("{}/{}", key, name)
        };
        let path = entry.path();
        if path.is_dir() {
            walk_dir(&path, &child_key, files)?;
        } else {
            files.push((child_key, Box::new(FsFile::new(path))));
        }
    }
    Ok(())
}
