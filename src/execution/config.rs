//! Engine Configuration
//!
//! Worker, volume and step binding configuration for the serial workflow
//! engine, plus the environment variables that control engine defaults.
//!
//! ```yaml
//! workers:
//!   - {id: w1, type: code, volume: shared}
//! volumes:
//!   - {id: shared, type: fs, basedir: /data/shared, files: [db.sqlite]}
//! workflow:
//!   - {step: train, worker: w1}
//! ```

use std::collections::{HashMap, HashSet};
use std::env;
use std::fs;
use std::path::Path;

use log::info;
use serde::Deserialize;

use crate::error::{FlowError, Result};
use crate::volume::{VolumeSpec, DEFAULT_STORE};
use crate::worker::{WorkerRegistry, WorkerSpec};

/// Base directory for run folders, relative to the engine's base volume.
pub const RUNSDIR_ENV: &str = "FLOWRUNNER_RUNSDIR";

/// Path of the engine configuration file.
pub const ENGINECONFIG_ENV: &str = "FLOWRUNNER_ENGINECONFIG";

/// Selects asynchronous execution (`true`, `1` or `yes`).
pub const ASYNC_ENV: &str = "FLOWRUNNER_ASYNC";

/// Default base directory for run folders.
pub const DEFAULT_RUNSDIR: &str = "runs";

/// Binds a workflow step to a configured worker.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct StepBinding {
    pub step: String,
    pub worker: String,
}

/// Engine or run configuration document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub workers: Option<Vec<WorkerSpec>>,

    #[serde(default)]
    pub volumes: Option<Vec<VolumeSpec>>,

    #[serde(default)]
    pub workflow: Option<Vec<StepBinding>>,
}

impl EngineConfig {
    /// Parses a YAML (or JSON) configuration document.
    pub fn parse(doc: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(doc)?)
    }

    /// Loads a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let doc = fs::read_to_string(path)?;
        let config = Self::parse(&doc)?;
        info!("Loaded engine configuration from {}", path.display());
        Ok(config)
    }

    /// Loads the file named by `FLOWRUNNER_ENGINECONFIG`, if set.
    pub fn from_env() -> Result<Self> {
        match env::var(ENGINECONFIG_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::load(path.trim()),
            _ => Ok(Self::default()),
        }
    }

    /// Overlays `run` on this configuration.
    ///
    /// Every top-level key set in `run` replaces the corresponding key.
    pub fn merge(&self, run: &EngineConfig) -> EngineConfig {
        EngineConfig {
            workers: run.workers.clone().or_else(|| self.workers.clone()),
            volumes: run.volumes.clone().or_else(|| self.volumes.clone()),
            workflow: run.workflow.clone().or_else(|| self.workflow.clone()),
        }
    }

    pub fn workers(&self) -> &[WorkerSpec] {
        self.workers.as_deref().unwrap_or_default()
    }

    pub fn volumes(&self) -> &[VolumeSpec] {
        self.volumes.as_deref().unwrap_or_default()
    }

    /// Step name to worker identifier.
    pub fn bindings(&self) -> HashMap<String, String> {
        self.workflow
            .iter()
            .flatten()
            .map(|b| (b.step.clone(), b.worker.clone()))
            .collect()
    }

    /// Checks worker specifications, volume ids and step bindings.
    pub fn validate(&self, registry: &WorkerRegistry) -> Result<()> {
        let mut workers = HashSet::new();
        for spec in self.workers() {
            spec.validate(registry)?;
            if !workers.insert(spec.id.as_str()) {
                return Err(FlowError::InvalidConfig(format!(
                    "duplicate worker id '{}'",
                    spec.id
                )));
            }
        }

        let mut volumes = HashSet::new();
        for spec in self.volumes() {
            if spec.id.trim().is_empty() {
                return Err(FlowError::InvalidConfig("volume id must not be empty".into()));
            }
            if !volumes.insert(spec.id.as_str()) {
                return Err(FlowError::InvalidConfig(format!(
                    "duplicate volume id '{}'",
                    spec.id
                )));
            }
        }
        for spec in self.workers() {
            if let Some(volume) = &spec.volume {
                if !volumes.contains(volume.as_str()) && volume != DEFAULT_STORE {
                    return Err(FlowError::unknown("storage volume", volume.as_str()));
                }
            }
        }

        for binding in self.workflow.iter().flatten() {
            if !workers.contains(binding.worker.as_str()) {
                return Err(FlowError::unknown("worker", binding.worker.as_str()));
            }
        }
        Ok(())
    }
}

/// Interprets a boolean environment value, `default` if unset.
pub fn parse_flag(value: Option<&str>, default: bool) -> bool {
    match value {
        Some(v) => matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes"),
        None => default,
    }
}

/// Whether runs execute asynchronously, from `FLOWRUNNER_ASYNC`.
pub fn async_from_env() -> bool {
    parse_flag(env::var(ASYNC_ENV).ok().as_deref(), true)
}

/// Base directory for run folders, from `FLOWRUNNER_RUNSDIR`.
pub fn runs_dir_from_env() -> String {
    env::var(RUNSDIR_ENV)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_RUNSDIR.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const CONFIG: &str = r#"
workers:
  - id: w1
    type: code
    volume: shared
  - id: w2
    type: subprocess
    vars: [{key: python, value: python3}]
volumes:
  - id: shared
    type: fs
    basedir: /tmp/shared
    files: [db.json]
workflow:
  - {step: s1, worker: w1}
  - {step: s2, worker: w2}
"#;

    #[test]
    fn test_parse_and_validate() {
        let config = EngineConfig::parse(CONFIG).unwrap();
        assert_eq!(config.workers().len(), 2);
        assert_eq!(config.volumes()[0].files, vec!["db.json"]);
        assert_eq!(config.bindings()["s2"], "w2");
        config.validate(&WorkerRegistry::new()).unwrap();
    }

    #[test]
    fn test_json_document() {
        let config =
            EngineConfig::parse(r#"{"workers": [{"name": "w", "type": "docker"}]}"#).unwrap();
        assert_eq!(config.workers()[0].id, "w");
        assert!(config.volumes.is_none());
    }

    #[test]
    fn test_merge_replaces_top_level_keys() {
        let engine = EngineConfig::parse(CONFIG).unwrap();
        let run = EngineConfig::parse("workflow: [{step: s1, worker: w2}]").unwrap();

        let merged = engine.merge(&run);
        assert_eq!(merged.bindings(), HashMap::from([("s1".into(), "w2".into())]));
        assert_eq!(merged.workers().len(), 2);
        assert_eq!(merged.volumes().len(), 1);
    }

    #[test]
    fn test_validation_errors() {
        let registry = WorkerRegistry::new();
        let unbound = EngineConfig::parse("workflow: [{step: s1, worker: nope}]").unwrap();
        assert!(matches!(
            unbound.validate(&registry),
            Err(FlowError::UnknownObject { .. })
        ));

        let bad_volume =
            EngineConfig::parse("workers: [{id: w, type: code, volume: missing}]").unwrap();
        assert!(bad_volume.validate(&registry).is_err());

        let dupes = EngineConfig::parse(
            "volumes: [{id: a, type: bucket, bucket: b}, {id: a, type: bucket, bucket: c}]",
        )
        .unwrap();
        assert!(dupes.validate(&registry).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("engine.yaml");
        std::fs::write(&path, CONFIG).unwrap();
        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.workers().len(), 2);
        assert!(EngineConfig::load(tmp.path().join("missing.yaml")).is_err());
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag(None, true));
        assert!(!parse_flag(None, false));
        assert!(parse_flag(Some("YES"), false));
        assert!(parse_flag(Some(" 1 "), false));
        assert!(!parse_flag(Some("off"), true));
    }
}
