//! Serial Workflow Engine
//!
//! Drives the lifecycle of workflow runs:
//! - Creates a dedicated run folder on the engine's base volume
//! - Copies static template files and file-typed run arguments into it
//! - Assembles the volume manager and worker pool from the merged engine
//!   and run configuration
//! - Executes the steps either in the calling thread or in a dedicated
//!   run thread that reports the terminal state through a callback

use std::collections::HashMap;
use std::fmt;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use log::{error, info, warn};
use serde_json::Value;

use crate::error::{stacktrace, FlowError, Result};
use crate::volume::base::join_key;
use crate::volume::{StorageVolume, VolumeManager, VolumeSpec, DEFAULT_STORE};
use crate::worker::{WorkerFactory, WorkerPool, WorkerRegistry};
use crate::workflow::{
    serialize_state, Context, RunArguments, RunHandle, RunResult, WorkflowState, WorkflowStep,
    WorkflowTemplate,
};

use super::config::{async_from_env, runs_dir_from_env, EngineConfig, DEFAULT_RUNSDIR};
use super::runner::{exec_workflow_cancellable, CancelToken};

/// Receives the terminal state of asynchronously executed runs.
pub trait RunCallback: Send + Sync {
    /// Called once per finished run that was not canceled.
    ///
    /// # Arguments
    ///
    /// * `run_id` - Identifier of the finished run
    /// * `volume` - Descriptor of the run folder
    /// * `state` - Serialized terminal state
    fn on_finish(&self, run_id: &str, volume: VolumeSpec, state: Value);
}

/// Completion message of an asynchronous run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub run_id: String,
    pub volume: VolumeSpec,
    pub state: Value,
}

/// Callback that forwards run reports into a channel.
pub struct ChannelCallback {
    sender: Mutex<Sender<RunReport>>,
}

impl ChannelCallback {
    pub fn new() -> (Self, Receiver<RunReport>) {
        let (tx, rx) = channel();
        (
            Self {
                sender: Mutex::new(tx),
            },
            rx,
        )
    }
}

impl RunCallback for ChannelCallback {
    fn on_finish(&self, run_id: &str, volume: VolumeSpec, state: Value) {
        let report = RunReport {
            run_id: run_id.to_string(),
            volume,
            state,
        };
        let sender = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = sender.send(report) {
            warn!("Failed to deliver report for run {}: {}", run_id, e);
        }
    }
}

/// Everything a run needs once its folder has been populated.
struct PreparedRun {
    steps: Vec<WorkflowStep>,
    outputs: Vec<String>,
    context: Context,
    volumes: VolumeManager,
    workers: WorkerPool,
}

type TaskIndex = Arc<Mutex<HashMap<String, CancelToken>>>;

fn lock_tasks(tasks: &TaskIndex) -> MutexGuard<'_, HashMap<String, CancelToken>> {
    tasks.lock().unwrap_or_else(|e| e.into_inner())
}

/// Engine that executes serial workflows.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use flowrunner::execution::{EngineConfig, SerialWorkflowEngine};
/// use flowrunner::volume::{BucketVolume, FileSystemStorage};
/// use flowrunner::workflow::{RunArguments, RunHandle, WorkflowTemplate};
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let fs = Arc::new(FileSystemStorage::new("/data/flowrunner", None)?);
///     let engine = SerialWorkflowEngine::new(fs, EngineConfig::default(), false, None);
///
///     let staticfs = BucketVolume::open("templates", "hello", None);
///     let template = WorkflowTemplate::new(vec![]);
///     let (state, _runstore) = engine.exec_workflow(
///         &RunHandle::generate(),
///         &template,
///         RunArguments::new(),
///         &staticfs,
///         None,
///     )?;
///     println!("{}", state);
///     Ok(())
/// }
/// ```
pub struct SerialWorkflowEngine {
    fs: Arc<dyn StorageVolume>,
    config: EngineConfig,
    registry: WorkerRegistry,
    runsdir: String,
    is_async: bool,
    callback: Option<Arc<dyn RunCallback>>,
    tasks: TaskIndex,
}

impl SerialWorkflowEngine {
    /// Creates an engine on the base volume `fs`.
    pub fn new(
        fs: Arc<dyn StorageVolume>,
        config: EngineConfig,
        is_async: bool,
        callback: Option<Arc<dyn RunCallback>>,
    ) -> Self {
        Self {
            fs,
            config,
            registry: WorkerRegistry::new(),
            runsdir: DEFAULT_RUNSDIR.to_string(),
            is_async,
            callback,
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Creates an engine configured from the `FLOWRUNNER_*` environment.
    pub fn from_env(
        fs: Arc<dyn StorageVolume>,
        callback: Option<Arc<dyn RunCallback>>,
    ) -> Result<Self> {
        let engine = Self::new(fs, EngineConfig::from_env()?, async_from_env(), callback)
            .with_runs_dir(runs_dir_from_env());
        Ok(engine)
    }

    /// Sets the folder for run folders on the base volume.
    pub fn with_runs_dir(mut self, runsdir: impl Into<String>) -> Self {
        self.runsdir = runsdir.into();
        self
    }

    /// Uses `registry` to instantiate configured workers.
    pub fn with_registry(mut self, registry: WorkerRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn is_async(&self) -> bool {
        self.is_async
    }

    /// Identifiers of asynchronous runs that have not finished yet.
    pub fn active_runs(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock_tasks(&self.tasks).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Executes a pending run.
    ///
    /// # Arguments
    ///
    /// * `run` - The run to start; must be pending
    /// * `template` - Steps and result files of the workflow
    /// * `arguments` - User arguments of the run
    /// * `staticfs` - Static files copied into the run folder
    /// * `config` - Optional run configuration overlaid on the engine's
    ///
    /// # Returns
    ///
    /// * `Ok((state, runstore))` - The terminal state in synchronous mode,
    ///   RUNNING in asynchronous mode, and the run folder volume. If the run
    ///   folder cannot be created the state is ERROR and the base volume is
    ///   returned in its place
    /// * `Err(InvalidState)` - The run is not pending
    pub fn exec_workflow(
        &self,
        run: &RunHandle,
        template: &WorkflowTemplate,
        arguments: RunArguments,
        staticfs: &dyn StorageVolume,
        config: Option<&EngineConfig>,
    ) -> Result<(WorkflowState, Arc<dyn StorageVolume>)> {
        if !run.state.is_pending() {
            return Err(FlowError::InvalidState(format!(
                "run {} is {}, expected PENDING",
                run.run_id, run.state
            )));
        }
        let state = run.state.start()?;
        let folder = join_key(&self.runsdir, &run.run_id);
        let runstore: Arc<dyn StorageVolume> =
            match self.fs.get_store_for_folder(&folder, Some(DEFAULT_STORE)) {
                Ok(store) => Arc::from(store),
                Err(e) => {
                    error!("Failed to create folder for run {}: {}", run.run_id, e);
                    return Ok((state.error(stacktrace(&e))?, Arc::clone(&self.fs)));
                }
            };
        info!("Starting run {} in {}", run.run_id, runstore.describe());

        let config = match config {
            Some(run_config) => self.config.merge(run_config),
            None => self.config.clone(),
        };
        let prepared =
            match self.prepare_run(template, arguments, staticfs, runstore.as_ref(), &config) {
                Ok(prepared) => prepared,
                Err(e) => {
                    error!("Failed to prepare run {}: {}", run.run_id, e);
                    return Ok((state.error(stacktrace(&e))?, runstore));
                }
            };

        if self.is_async {
            let state = self.spawn_run(&run.run_id, state, prepared, runstore.to_spec())?;
            return Ok((state, runstore));
        }

        let outcome = execute(prepared, &state, &CancelToken::new())?;
        info!("Run {} finished: {}", run.run_id, outcome);
        Ok((outcome, runstore))
    }

    /// Cancels an asynchronous run.
    ///
    /// A running subprocess command is killed and the run stops before its
    /// next step; its callback is not invoked. Returns false for unknown or
    /// finished runs.
    pub fn cancel_run(&self, run_id: &str) -> bool {
        match lock_tasks(&self.tasks).remove(run_id) {
            Some(token) => {
                token.cancel();
                info!("Canceled run {}", run_id);
                true
            }
            None => false,
        }
    }

    fn prepare_run(
        &self,
        template: &WorkflowTemplate,
        arguments: RunArguments,
        staticfs: &dyn StorageVolume,
        runstore: &dyn StorageVolume,
        config: &EngineConfig,
    ) -> Result<PreparedRun> {
        let mut copied = staticfs.copy(None, None, runstore)?;
        let mut context = template.parameters.clone();
        for (name, argument) in &arguments {
            for file in argument.files() {
                copied.extend(file.copy(runstore)?);
            }
            context.insert(name.clone(), argument.context_value());
        }

        let mut files: HashMap<String, Vec<String>> = copied
            .into_iter()
            .map(|key| (key, vec![DEFAULT_STORE.to_string()]))
            .collect();
        let mut specs = vec![runstore.to_spec()];
        for spec in config.volumes() {
            if spec.id == DEFAULT_STORE {
                warn!("Ignoring configured volume '{}'", spec.id);
                continue;
            }
            for key in &spec.files {
                files.entry(key.clone()).or_default().push(spec.id.clone());
            }
            specs.push(spec.clone());
        }
        let volumes = VolumeManager::new(specs, files)?;

        let factory = WorkerFactory::new(config.workers().to_vec(), self.registry.clone(), true)?;
        let workers = WorkerPool::new(factory, config.bindings())?;

        Ok(PreparedRun {
            steps: template.steps.clone(),
            outputs: template.outputs.clone(),
            context,
            volumes,
            workers,
        })
    }

    fn spawn_run(
        &self,
        run_id: &str,
        state: WorkflowState,
        prepared: PreparedRun,
        volume: VolumeSpec,
    ) -> Result<WorkflowState> {
        let cancel = CancelToken::new();
        lock_tasks(&self.tasks).insert(run_id.to_string(), cancel.clone());

        let tasks = Arc::clone(&self.tasks);
        let callback = self.callback.clone();
        let running = state.clone();
        let id = run_id.to_string();
        let spawned = thread::Builder::new()
            .name(format!("run-{}", run_id))
            .spawn(move || {
                let outcome = execute(prepared, &running, &cancel);
                if lock_tasks(&tasks).remove(&id).is_none() {
                    info!("Run {} was canceled, dropping result", id);
                    return;
                }
                let doc = outcome.and_then(|state| {
                    info!("Run {} finished: {}", id, state);
                    serialize_state(&state)
                });
                match (doc, callback) {
                    (Ok(doc), Some(callback)) => callback.on_finish(&id, volume, doc),
                    (Ok(_), None) => {}
                    (Err(e), _) => error!("Failed to report run {}: {}", id, e),
                }
            });

        match spawned {
            Ok(_) => Ok(state),
            Err(e) => {
                lock_tasks(&self.tasks).remove(run_id);
                error!("Failed to start thread for run {}: {}", run_id, e);
                state.error(stacktrace(&e))
            }
        }
    }
}

impl fmt::Debug for SerialWorkflowEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialWorkflowEngine")
            .field("fs", &self.fs)
            .field("runsdir", &self.runsdir)
            .field("is_async", &self.is_async)
            .finish_non_exhaustive()
    }
}

/// Runs the prepared steps and maps the outcome to a terminal state.
fn execute(
    prepared: PreparedRun,
    state: &WorkflowState,
    cancel: &CancelToken,
) -> Result<WorkflowState> {
    let PreparedRun {
        steps,
        outputs,
        context,
        mut volumes,
        mut workers,
    } = prepared;

    match exec_workflow_cancellable(&steps, &mut workers, &mut volumes, RunResult::new(context), cancel) {
        Ok(result) if result.returncode().unwrap_or(0) == 0 => state.success(outputs),
        Ok(result) => state.error(result.log()),
        Err(e) => {
            error!("Run failed: {}", e);
            state.error(stacktrace(&e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::{BucketVolume, FileSystemStorage, IoBuffer, MemoryBucket};
    use crate::worker::function::CWD_LOCK;
    use crate::workflow::{
        deserialize_state, ContainerStep, FunctionStep, InputFile, RunArgument, RunDescriptor,
    };
    use serde_json::json;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    fn setup(bucket: &str) -> (TempDir, Arc<dyn StorageVolume>, BucketVolume) {
        let tmp = tempdir().unwrap();
        let fs: Arc<dyn StorageVolume> =
            Arc::new(FileSystemStorage::new(tmp.path(), Some("base")).unwrap());
        let staticfs = BucketVolume::open(bucket, "", Some("static"));
        staticfs
            .store(&IoBuffer::new(r#"{"value": 5}"#), "data.json")
            .unwrap();
        (tmp, fs, staticfs)
    }

    fn multiply_template() -> WorkflowTemplate {
        let step = FunctionStep::new("multiply", &["x"], |args, out| {
            let doc: Value = serde_json::from_str(&std::fs::read_to_string("data.json")?)?;
            let value = doc["value"].as_i64().ok_or("missing value")? * args.int("x")?;
            std::fs::write("result.txt", value.to_string())?;
            out.print(format!("result {}", value));
            Ok(json!(value))
        })
        .with_input("data.json")
        .with_output("y")
        .with_output_file("result.txt");
        WorkflowTemplate::new(vec![step.into()])
            .with_parameter("x", json!(1))
            .with_output("result.txt")
    }

    #[test]
    fn test_sync_run_success() {
        let (tmp, fs, staticfs) = setup("engine-sync-success");
        let engine = SerialWorkflowEngine::new(fs, EngineConfig::default(), false, None);
        let run = RunHandle::new("run1");
        let arguments = RunArguments::from([("x".to_string(), RunArgument::from(json!(3)))]);

        let (state, runstore) = engine
            .exec_workflow(&run, &multiply_template(), arguments, &staticfs, None)
            .unwrap();

        assert!(state.is_success(), "{:?}", state);
        assert_eq!(state.files(), ["result.txt"]);
        let rundir = std::fs::canonicalize(tmp.path().join("runs").join("run1")).unwrap();
        assert_eq!(runstore.local_path(), Some(rundir.as_path()));
        assert_eq!(std::fs::read_to_string(rundir.join("result.txt")).unwrap(), "15");

        let descriptor = RunDescriptor::new(&run.run_id, &state);
        assert_eq!(descriptor.state, "SUCCESS");
        assert_eq!(descriptor.files.unwrap()[0].mime_type, "text/plain");
        MemoryBucket::drop_named("engine-sync-success");
    }

    #[test]
    fn test_sync_run_step_failure() {
        let (_tmp, fs, staticfs) = setup("engine-sync-failure");
        let engine = SerialWorkflowEngine::new(fs, EngineConfig::default(), false, None);
        let step = FunctionStep::new("fail", &[], |_, out| {
            out.print("starting");
            Err("boom".into())
        });
        let template = WorkflowTemplate::new(vec![step.into()]);

        let (state, _) = engine
            .exec_workflow(&RunHandle::new("r"), &template, RunArguments::new(), &staticfs, None)
            .unwrap();
        assert!(state.is_error());
        assert_eq!(state.messages()[0], "starting");
        assert!(state.messages().iter().any(|m| m.contains("boom")));
        MemoryBucket::drop_named("engine-sync-failure");
    }

    #[test]
    fn test_file_arguments_are_copied() {
        let (tmp, fs, staticfs) = setup("engine-file-args");
        let engine = SerialWorkflowEngine::new(fs, EngineConfig::default(), false, None);
        let step = FunctionStep::new("read", &["doc"], |args, _| {
            Ok(json!(std::fs::read_to_string(args.str("doc")?)?))
        })
        .with_input("inputs/")
        .with_output("content");
        let template = WorkflowTemplate::new(vec![step.into()]);
        let upload = InputFile::new(Arc::new(IoBuffer::new("uploaded")), "inputs/doc.txt");
        let arguments = RunArguments::from([("doc".to_string(), RunArgument::File(upload))]);

        let (state, _) = engine
            .exec_workflow(&RunHandle::new("r2"), &template, arguments, &staticfs, None)
            .unwrap();
        assert!(state.is_success(), "{:?}", state);
        assert!(tmp.path().join("runs/r2/inputs/doc.txt").is_file());
        assert!(tmp.path().join("runs/r2/data.json").is_file());
        MemoryBucket::drop_named("engine-file-args");
    }

    #[test]
    fn test_preparation_error_maps_to_error_state() {
        let (_tmp, fs, staticfs) = setup("engine-prep-error");
        let engine = SerialWorkflowEngine::new(fs, EngineConfig::default(), false, None);
        let run_config = EngineConfig::parse("workflow: [{step: multiply, worker: missing}]").unwrap();

        let (state, _) = engine
            .exec_workflow(
                &RunHandle::new("r3"),
                &multiply_template(),
                RunArguments::new(),
                &staticfs,
                Some(&run_config),
            )
            .unwrap();
        assert!(state.is_error());
        assert!(state.messages()[0].contains("missing"));
        MemoryBucket::drop_named("engine-prep-error");
    }

    #[test]
    fn test_run_folder_error_maps_to_error_state() {
        let (tmp, fs, staticfs) = setup("engine-folder-error");
        std::fs::write(tmp.path().join("runs"), "not a folder").unwrap();
        let engine = SerialWorkflowEngine::new(fs, EngineConfig::default(), false, None);

        let (state, store) = engine
            .exec_workflow(
                &RunHandle::new("r7"),
                &multiply_template(),
                RunArguments::new(),
                &staticfs,
                None,
            )
            .unwrap();
        assert!(state.is_error());
        assert!(!state.messages().is_empty());
        assert_eq!(store.identifier(), "base");
        MemoryBucket::drop_named("engine-folder-error");
    }

    #[test]
    fn test_non_pending_run_is_rejected() {
        let (_tmp, fs, staticfs) = setup("engine-non-pending");
        let engine = SerialWorkflowEngine::new(fs, EngineConfig::default(), false, None);
        let run = RunHandle::new("r4").with_state(WorkflowState::pending().start().unwrap());

        let result =
            engine.exec_workflow(&run, &multiply_template(), RunArguments::new(), &staticfs, None);
        assert!(matches!(result, Err(FlowError::InvalidState(_))));
        MemoryBucket::drop_named("engine-non-pending");
    }

    #[test]
    fn test_async_run_reports_through_callback() {
        let (_tmp, fs, staticfs) = setup("engine-async");
        let (callback, reports) = ChannelCallback::new();
        let engine =
            SerialWorkflowEngine::new(fs, EngineConfig::default(), true, Some(Arc::new(callback)));

        let (state, runstore) = engine
            .exec_workflow(
                &RunHandle::new("r5"),
                &multiply_template(),
                RunArguments::new(),
                &staticfs,
                None,
            )
            .unwrap();
        assert!(state.is_running());

        let report = reports.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(report.run_id, "r5");
        assert_eq!(report.volume, runstore.to_spec());
        let terminal = deserialize_state(report.state).unwrap();
        assert!(terminal.is_success(), "{:?}", terminal);
        assert!(engine.active_runs().is_empty());
        assert!(!engine.cancel_run("r5"));
        MemoryBucket::drop_named("engine-async");
    }

    #[test]
    fn test_canceled_run_skips_callback() {
        let (tmp, fs, staticfs) = setup("engine-cancel");
        let (callback, reports) = ChannelCallback::new();
        let engine =
            SerialWorkflowEngine::new(fs, EngineConfig::default(), true, Some(Arc::new(callback)));
        let slow = FunctionStep::new("slow", &[], |_, _| {
            thread::sleep(Duration::from_millis(300));
            Ok(json!(null))
        });
        let second = FunctionStep::new("second", &[], |_, _| {
            std::fs::write("second.txt", "done")?;
            Ok(json!(null))
        });
        let template = WorkflowTemplate::new(vec![slow.into(), second.into()]);

        let (state, _) = engine
            .exec_workflow(&RunHandle::new("r6"), &template, RunArguments::new(), &staticfs, None)
            .unwrap();
        assert!(state.is_running());
        assert_eq!(engine.active_runs(), vec!["r6"]);
        assert!(engine.cancel_run("r6"));

        assert!(reports.recv_timeout(Duration::from_secs(2)).is_err());
        assert!(!tmp.path().join("runs/r6/second.txt").exists());
        MemoryBucket::drop_named("engine-cancel");
    }

    #[test]
    fn test_cancel_kills_running_command() {
        let (tmp, fs, staticfs) = setup("engine-cancel-command");
        let (callback, reports) = ChannelCallback::new();
        let engine =
            SerialWorkflowEngine::new(fs, EngineConfig::default(), true, Some(Arc::new(callback)));
        let step = ContainerStep::new("slow", "test").with_command("sleep 1; echo late > late.txt");
        let template = WorkflowTemplate::new(vec![step.into()]);

        let (state, runstore) = engine
            .exec_workflow(&RunHandle::new("r8"), &template, RunArguments::new(), &staticfs, None)
            .unwrap();
        assert!(state.is_running());
        thread::sleep(Duration::from_millis(200));
        assert!(engine.cancel_run("r8"));

        assert!(reports.recv_timeout(Duration::from_millis(1500)).is_err());
        let rundir = runstore.local_path().unwrap();
        assert!(rundir.starts_with(std::fs::canonicalize(tmp.path()).unwrap()));
        assert!(!rundir.join("late.txt").exists());
        MemoryBucket::drop_named("engine-cancel-command");
    }

    #[test]
    fn test_overlapping_runs_on_relative_base() {
        let (tmp, fs) = {
            let _cwd = CWD_LOCK.lock().unwrap_or_else(|e| e.into_inner());
            let tmp = tempfile::tempdir_in(std::env::current_dir().unwrap()).unwrap();
            let relative = std::path::PathBuf::from(tmp.path().file_name().unwrap());
            let fs: Arc<dyn StorageVolume> =
                Arc::new(FileSystemStorage::new(relative, Some("base")).unwrap());
            (tmp, fs)
        };
        let staticfs = BucketVolume::open("engine-relative-base", "", Some("static"));
        let (callback, reports) = ChannelCallback::new();
        let engine =
            SerialWorkflowEngine::new(fs, EngineConfig::default(), true, Some(Arc::new(callback)));

        let slow = FunctionStep::new("slow", &[], |_, _| {
            thread::sleep(Duration::from_millis(600));
            std::fs::write("a.txt", "a")?;
            Ok(json!(null))
        });
        let write = ContainerStep::new("write", "test").with_command("echo b > b.txt");

        engine
            .exec_workflow(
                &RunHandle::new("A"),
                &WorkflowTemplate::new(vec![slow.into()]),
                RunArguments::new(),
                &staticfs,
                None,
            )
            .unwrap();
        thread::sleep(Duration::from_millis(150));
        engine
            .exec_workflow(
                &RunHandle::new("B"),
                &WorkflowTemplate::new(vec![write.into()]),
                RunArguments::new(),
                &staticfs,
                None,
            )
            .unwrap();

        for _ in 0..2 {
            let report = reports.recv_timeout(Duration::from_secs(10)).unwrap();
            let terminal = deserialize_state(report.state).unwrap();
            assert!(terminal.is_success(), "{}: {:?}", report.run_id, terminal);
        }

        let runs = tmp.path().join("runs");
        assert!(runs.join("A").join("a.txt").is_file());
        assert!(runs.join("B").join("b.txt").is_file());
        assert!(!runs.join("A").join(tmp.path().file_name().unwrap()).exists());
        MemoryBucket::drop_named("engine-relative-base");
    }
}
