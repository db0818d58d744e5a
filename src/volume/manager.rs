//! Volume Manager
//!
//! Tracks which storage volumes hold the latest copy of every file in a
//! run's virtual namespace and replicates files on demand.
//!
//! - `prepare()` stages a step's inputs onto the volume its worker runs on
//!   and creates the folders for its outputs
//! - `update()` marks a volume as the sole holder of freshly written files
//!
//! Stale copies left behind by `update()` are never cleaned up.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::debug;

use crate::error::{FlowError, Result};

use super::base::StorageVolume;
use super::factory::{open_volume, VolumeSpec};

/// Identifier of the volume that every manager must contain.
pub const DEFAULT_STORE: &str = "__default__";

/// File availability index over a set of storage volumes.
#[derive(Debug)]
pub struct VolumeManager {
    specs: HashMap<String, VolumeSpec>,
    stores: HashMap<String, Arc<dyn StorageVolume>>,
    files: HashMap<String, Vec<String>>,
}

impl VolumeManager {
    /// Creates a manager for the given volume specifications.
    ///
    /// # Arguments
    ///
    /// * `specs` - Volume specifications; one must use [`DEFAULT_STORE`]
    /// * `files` - Initial holders of each known file
    ///
    /// # Returns
    ///
    /// * `Err(InvalidConfig)` - No default store was given
    /// * `Err(UnknownObject)` - A file references an unknown volume
    pub fn new(specs: Vec<VolumeSpec>, files: HashMap<String, Vec<String>>) -> Result<Self> {
        let specs: HashMap<String, VolumeSpec> =
            specs.into_iter().map(|s| (s.id.clone(), s)).collect();
        if !specs.contains_key(DEFAULT_STORE) {
            return Err(FlowError::InvalidConfig(
                "missing default storage volume".to_string(),
            ));
        }
        for holders in files.values() {
            if let Some(unknown) = holders.iter().find(|id| !specs.contains_key(*id)) {
                return Err(FlowError::unknown("storage volume", unknown.as_str()));
            }
        }
        Ok(Self {
            specs,
            stores: HashMap::new(),
            files,
        })
    }

    /// Creates a manager from already opened volumes.
    ///
    /// The volumes are registered under their own identifiers and are not
    /// reopened from their specifications.
    pub fn from_stores(
        stores: Vec<Arc<dyn StorageVolume>>,
        files: HashMap<String, Vec<String>>,
    ) -> Result<Self> {
        let specs = stores.iter().map(|s| s.to_spec()).collect();
        let mut manager = Self::new(specs, files)?;
        for store in stores {
            manager.stores.insert(store.identifier().to_string(), store);
        }
        Ok(manager)
    }

    /// Returns the volume for `identifier`, opening it on first access.
    pub fn get(&mut self, identifier: &str) -> Result<Arc<dyn StorageVolume>> {
        if let Some(store) = self.stores.get(identifier) {
            return Ok(Arc::clone(store));
        }
        let spec = self
            .specs
            .get(identifier)
            .ok_or_else(|| FlowError::unknown("storage volume", identifier))?;
        let store: Arc<dyn StorageVolume> = Arc::from(open_volume(spec)?);
        self.stores
            .insert(identifier.to_string(), Arc::clone(&store));
        Ok(store)
    }

    /// Current holders of every tracked file.
    pub fn files(&self) -> &HashMap<String, Vec<String>> {
        &self.files
    }

    /// Stages `inputs` onto `store` and creates folders for `outputs`.
    ///
    /// Input queries ending in `/` match every tracked file below that
    /// folder; all other queries match a single file exactly. Files that
    /// `store` does not hold yet are copied from one of their holders.
    pub fn prepare(
        &mut self,
        store: &dyn StorageVolume,
        inputs: &[String],
        outputs: &[String],
    ) -> Result<()> {
        let mut required: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for query in inputs {
            for key in self.files.keys() {
                if seen.contains(key) {
                    continue;
                }
                let matched = if query.ends_with('/') {
                    prefix_match(key, query)
                } else {
                    exact_match(key, query)
                };
                if matched {
                    seen.insert(key.clone());
                    required.push(key.clone());
                }
            }
        }
        required.sort();

        let target = store.identifier().to_string();
        for key in required {
            let holders = self.files.get(&key).cloned().unwrap_or_default();
            if holders.contains(&target) {
                continue;
            }
            let Some(source_id) = holders.first() else {
                continue;
            };
            let source = self.get(source_id)?;
            debug!("replicating {} from {} to {}", key, source_id, target);
            let written = source.copy(Some(&[key.clone()]), None, store)?;
            for written_key in written {
                let entry = self.files.entry(written_key).or_default();
                if !entry.contains(&target) {
                    entry.push(target.clone());
                }
            }
        }

        for file in outputs {
            let parent = if file.ends_with('/') {
                file.trim_end_matches('/')
            } else {
                file.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
            };
            if !parent.is_empty() {
                store.mkdir(parent)?;
            }
        }
        Ok(())
    }

    /// Records `store` as the only holder of the latest copy of `files`.
    pub fn update(&mut self, store: &dyn StorageVolume, files: &[String]) {
        for key in files {
            self.files
                .insert(key.clone(), vec![store.identifier().to_string()]);
        }
    }
}

/// True if `key` equals `query`.
pub fn exact_match(key: &str, query: &str) -> bool {
    key == query
}

/// True if `key` lies below the folder `query` (which ends in `/`).
pub fn prefix_match(key: &str, query: &str) -> bool {
    key.starts_with(query)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::base::IoBuffer;
    use crate::volume::fs::FileSystemStorage;
    use std::path::Path;
    use tempfile::tempdir;

    const FILES: &[&str] = &[
        "A.json",
        "inputs/B.json",
        "inputs/C.json",
        "inputs/data/data.json",
        "docs/D.json",
    ];

    fn count_files(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| {
                let path = e.unwrap().path();
                if path.is_dir() {
                    count_files(&path)
                } else {
                    1
                }
            })
            .sum()
    }

    fn setup(base: &Path) -> (VolumeManager, FileSystemStorage) {
        let default = FileSystemStorage::new(base.join("s0"), Some(DEFAULT_STORE)).unwrap();
        for key in FILES {
            default.store(&IoBuffer::new(*key), key).unwrap();
        }
        let s1 = FileSystemStorage::new(base.join("s1"), Some("s1")).unwrap();
        let files = FILES
            .iter()
            .map(|k| (k.to_string(), vec![DEFAULT_STORE.to_string()]))
            .collect();
        let manager = VolumeManager::new(vec![default.to_spec(), s1.to_spec()], files).unwrap();
        (manager, s1)
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_match_policies() {
        assert!(prefix_match("data/x.txt", "data/"));
        assert!(!prefix_match("database.txt", "data/"));
        assert!(exact_match("data/x.txt", "data/x.txt"));
        assert!(!exact_match("data/y.txt", "data/x.txt"));
    }

    #[test]
    fn test_manager_requires_default_store() {
        let tmp = tempdir().unwrap();
        let s1 = FileSystemStorage::new(tmp.path(), Some("s1")).unwrap();
        let result = VolumeManager::new(vec![s1.to_spec()], HashMap::new());
        assert!(matches!(result, Err(FlowError::InvalidConfig(_))));
    }

    #[test]
    fn test_manager_rejects_unknown_holder() {
        let tmp = tempdir().unwrap();
        let s0 = FileSystemStorage::new(tmp.path(), Some(DEFAULT_STORE)).unwrap();
        let files = HashMap::from([("a.txt".to_string(), vec!["nowhere".to_string()])]);
        let result = VolumeManager::new(vec![s0.to_spec()], files);
        assert!(matches!(result, Err(FlowError::UnknownObject { .. })));
    }

    #[test]
    fn test_get_unknown_volume() {
        let tmp = tempdir().unwrap();
        let (mut manager, _) = setup(tmp.path());
        assert!(manager.get("s1").is_ok());
        assert!(matches!(manager.get("s9"), Err(FlowError::UnknownObject { .. })));
    }

    #[test]
    fn test_prepare_volume() {
        let tmp = tempdir().unwrap();
        let (mut manager, s1) = setup(tmp.path());

        manager
            .prepare(
                &s1,
                &strings(&["A.json", "docs/"]),
                &strings(&["results/A.json", "docs/"]),
            )
            .unwrap();

        assert!(tmp.path().join("s1/A.json").is_file());
        assert!(tmp.path().join("s1/docs/D.json").is_file());
        assert!(tmp.path().join("s1/results").is_dir());
        assert_eq!(count_files(&tmp.path().join("s1")), 2);

        let both = strings(&[DEFAULT_STORE, "s1"]);
        let default_only = strings(&[DEFAULT_STORE]);
        assert_eq!(manager.files()["A.json"], both);
        assert_eq!(manager.files()["docs/D.json"], both);
        assert_eq!(manager.files()["inputs/B.json"], default_only);
        assert_eq!(manager.files()["inputs/data/data.json"], default_only);

        // Files already on the volume are not copied again.
        std::fs::remove_file(tmp.path().join("s1/A.json")).unwrap();
        manager.prepare(&s1, &strings(&["A.json"]), &[]).unwrap();
        assert!(!tmp.path().join("s1/A.json").exists());
    }

    #[test]
    fn test_update_overwrites_holders() {
        let tmp = tempdir().unwrap();
        let s0 = FileSystemStorage::new(tmp.path().join("s0"), Some(DEFAULT_STORE)).unwrap();
        let s1 = FileSystemStorage::new(tmp.path().join("s1"), Some("s1")).unwrap();
        let files = HashMap::from([("f1".to_string(), strings(&[DEFAULT_STORE]))]);
        let mut manager = VolumeManager::new(vec![s0.to_spec(), s1.to_spec()], files).unwrap();

        manager.update(&s1, &strings(&["f1"]));
        manager.update(&s0, &strings(&["f2"]));
        manager.update(&s1, &strings(&["f2"]));

        let expected = HashMap::from([
            ("f1".to_string(), strings(&["s1"])),
            ("f2".to_string(), strings(&["s1"])),
        ]);
        assert_eq!(manager.files(), &expected);
    }
}
