//! Worker Configuration
//!
//! Worker specifications as they appear in engine configuration documents,
//! the registry mapping type tags to worker constructors, and the factory
//! that instantiates and caches configured workers.
//!
//! # Specification format
//!
//! ```yaml
//! workers:
//!   - id: python
//!     type: subprocess            # or docker, code, {className, moduleName}
//!     vars: [{key: python, value: /usr/bin/python3}]
//!     env: [{key: PYTHONPATH, value: /opt/lib}]
//!     volume: shared
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use log::{debug, info};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::error::{FlowError, Result};

use super::base::Worker;
use super::docker::DockerWorker;
use super::function::FunctionWorker;
use super::subprocess::SubprocessWorker;

/// Tag of the built-in subprocess worker.
pub const SUBPROCESS: &str = "subprocess";

/// Tag of the built-in Docker worker.
pub const DOCKER: &str = "docker";

/// Tag of the built-in function worker.
pub const CODE: &str = "code";

/// Constructor arguments passed to a worker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerArgs {
    pub identifier: String,
    pub variables: HashMap<String, String>,
    pub env: HashMap<String, String>,
    pub volume: Option<String>,
    /// Remaining `args` entries not understood by the built-in workers.
    pub extra: BTreeMap<String, Value>,
}

/// A `{key, value}` pair in a worker specification.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct KeyValue {
    pub key: String,
    pub value: Value,
}

/// Reference to a worker implementation.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum WorkerRef {
    /// One of the built-in type names.
    Tag(String),
    /// A custom class registered in the [`WorkerRegistry`].
    Class {
        #[serde(rename = "className")]
        class_name: String,
        #[serde(rename = "moduleName")]
        module_name: String,
    },
}

impl WorkerRef {
    /// Registry tag for this reference.
    pub fn tag(&self) -> String {
        match self {
            WorkerRef::Tag(tag) => tag.clone(),
            WorkerRef::Class {
                class_name,
                module_name,
            } => format!("{}.{}", module_name, class_name),
        }
    }
}

/// A constructor argument value.
///
/// Deferred values are computed when the worker is instantiated, which lets
/// programmatic configuration use environment-dependent defaults.
#[derive(Debug, Clone)]
pub enum ArgValue {
    Value(Value),
    Deferred(fn() -> Value),
}

impl ArgValue {
    pub fn evaluate(&self) -> Value {
        match self {
            ArgValue::Value(value) => value.clone(),
            ArgValue::Deferred(func) => func(),
        }
    }
}

impl From<Value> for ArgValue {
    fn from(value: Value) -> Self {
        ArgValue::Value(value)
    }
}

impl<'de> Deserialize<'de> for ArgValue {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Value::deserialize(deserializer).map(ArgValue::Value)
    }
}

/// Configuration of a single worker.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSpec {
    #[serde(alias = "name")]
    pub id: String,

    #[serde(rename = "type")]
    pub worker_type: WorkerRef,

    #[serde(default, alias = "variables")]
    pub vars: Vec<KeyValue>,

    #[serde(default)]
    pub env: Vec<KeyValue>,

    #[serde(default)]
    pub volume: Option<String>,

    #[serde(default)]
    pub args: BTreeMap<String, ArgValue>,
}

/// Renders a configuration value as a variable string.
fn as_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn merge_object(target: &mut HashMap<String, String>, value: &Value) {
    if let Value::Object(map) = value {
        for (k, v) in map {
            target.insert(k.clone(), as_string(v));
        }
    }
}

impl WorkerSpec {
    pub fn new(id: impl Into<String>, worker_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            worker_type: WorkerRef::Tag(worker_type.into()),
            vars: Vec::new(),
            env: Vec::new(),
            volume: None,
            args: BTreeMap::new(),
        }
    }

    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.vars.push(KeyValue {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.env.push(KeyValue {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn with_volume(mut self, volume: impl Into<String>) -> Self {
        self.volume = Some(volume.into());
        self
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: ArgValue) -> Self {
        self.args.insert(key.into(), value);
        self
    }

    /// Checks the specification against the registered worker types.
    pub fn validate(&self, registry: &WorkerRegistry) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(FlowError::InvalidConfig("worker id must not be empty".into()));
        }
        let tag = self.worker_type.tag();
        if !registry.contains(&tag) {
            return Err(FlowError::InvalidConfig(format!(
                "worker '{}' has unknown type '{}'",
                self.id, tag
            )));
        }
        for kv in self.vars.iter().chain(self.env.iter()) {
            if kv.key.trim().is_empty() {
                return Err(FlowError::InvalidConfig(format!(
                    "worker '{}' has a variable with an empty key",
                    self.id
                )));
            }
        }
        Ok(())
    }

    /// Resolves the constructor arguments, evaluating deferred values.
    pub fn worker_args(&self) -> WorkerArgs {
        let mut args = WorkerArgs {
            identifier: self.id.clone(),
            variables: self
                .vars
                .iter()
                .map(|kv| (kv.key.clone(), as_string(&kv.value)))
                .collect(),
            env: self
                .env
                .iter()
                .map(|kv| (kv.key.clone(), as_string(&kv.value)))
                .collect(),
            volume: self.volume.clone(),
            extra: BTreeMap::new(),
        };
        for (key, arg) in &self.args {
            let value = arg.evaluate();
            match key.as_str() {
                "variables" | "vars" => merge_object(&mut args.variables, &value),
                "env" => merge_object(&mut args.env, &value),
                "volume" => args.volume = Some(as_string(&value)),
                _ => {
                    args.extra.insert(key.clone(), value);
                }
            }
        }
        args
    }
}

/// Builds a worker from its constructor arguments.
pub type WorkerConstructor = Arc<dyn Fn(WorkerArgs) -> Result<Arc<dyn Worker>> + Send + Sync>;

/// Maps worker type tags to constructors.
#[derive(Clone)]
pub struct WorkerRegistry {
    constructors: HashMap<String, WorkerConstructor>,
}

impl WorkerRegistry {
    /// Registry with the built-in `subprocess`, `docker` and `code` workers.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register(SUBPROCESS, |args| {
            Ok(Arc::new(SubprocessWorker::from_args(args)) as Arc<dyn Worker>)
        });
        registry.register(DOCKER, |args| {
            Ok(Arc::new(DockerWorker::from_args(args)) as Arc<dyn Worker>)
        });
        registry.register(CODE, |args| {
            let mut worker = FunctionWorker::new(args.identifier);
            if let Some(volume) = args.volume {
                worker = worker.with_volume(volume);
            }
            Ok(Arc::new(worker) as Arc<dyn Worker>)
        });
        registry
    }

    /// Registry without any constructors.
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Registers a constructor under `tag`.
    ///
    /// Custom worker classes use the tag `"<moduleName>.<className>"`.
    pub fn register<F>(&mut self, tag: impl Into<String>, constructor: F)
    where
        F: Fn(WorkerArgs) -> Result<Arc<dyn Worker>> + Send + Sync + 'static,
    {
        self.constructors.insert(tag.into(), Arc::new(constructor));
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.constructors.contains_key(tag)
    }

    /// Instantiates the worker described by `spec`.
    pub fn build(&self, spec: &WorkerSpec) -> Result<Arc<dyn Worker>> {
        let tag = spec.worker_type.tag();
        let constructor = self
            .constructors
            .get(&tag)
            .ok_or_else(|| FlowError::unknown("worker type", tag.clone()))?;
        constructor(spec.worker_args())
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<&String> = self.constructors.keys().collect();
        tags.sort();
        f.debug_struct("WorkerRegistry").field("tags", &tags).finish()
    }
}

/// Instantiates workers by identifier.
///
/// Configured workers are created on first use and cached. Identifiers
/// without a specification resolve to the factory's default worker, which
/// is shared and never cached under the queried identifier.
#[derive(Debug)]
pub struct WorkerFactory {
    specs: HashMap<String, WorkerSpec>,
    registry: WorkerRegistry,
    cache: HashMap<String, Arc<dyn Worker>>,
    default: Arc<dyn Worker>,
}

impl WorkerFactory {
    /// Creates a factory for `specs`.
    ///
    /// With `validate` set, every specification is checked up front and
    /// duplicate identifiers are rejected.
    pub fn new(specs: Vec<WorkerSpec>, registry: WorkerRegistry, validate: bool) -> Result<Self> {
        let mut seen = HashSet::new();
        if validate {
            for spec in &specs {
                spec.validate(&registry)?;
                if !seen.insert(spec.id.clone()) {
                    return Err(FlowError::InvalidConfig(format!(
                        "duplicate worker id '{}'",
                        spec.id
                    )));
                }
            }
        }
        Ok(Self {
            specs: specs.into_iter().map(|s| (s.id.clone(), s)).collect(),
            registry,
            cache: HashMap::new(),
            default: Arc::new(SubprocessWorker::with_default_variables("default")),
        })
    }

    /// Whether a specification exists for `identifier`.
    pub fn contains(&self, identifier: &str) -> bool {
        self.specs.contains_key(identifier)
    }

    /// The shared fallback worker.
    pub fn default_worker(&self) -> Arc<dyn Worker> {
        Arc::clone(&self.default)
    }

    /// Returns the worker for `identifier`.
    pub fn get(&mut self, identifier: &str) -> Result<Arc<dyn Worker>> {
        if let Some(worker) = self.cache.get(identifier) {
            return Ok(Arc::clone(worker));
        }
        let Some(spec) = self.specs.get(identifier) else {
            debug!("No worker configured for '{}', using default", identifier);
            return Ok(self.default_worker());
        };
        let worker = self.registry.build(spec)?;
        info!(
            "Created worker '{}' of type '{}'",
            identifier,
            spec.worker_type.tag()
        );
        self.cache.insert(identifier.to_string(), Arc::clone(&worker));
        Ok(worker)
    }
}
