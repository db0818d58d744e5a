//! Serial Workflow Runner
//!
//! Executes the steps of a workflow strictly in declared order. Before each
//! step its inputs are staged onto the volume of the step's worker; after
//! each successful step its outputs are recorded as held by that volume.
//! Execution stops after the first step with a non-zero return code.

use log::{debug, info, warn};

use crate::error::Result;
use crate::volume::{VolumeManager, DEFAULT_STORE};
use crate::worker::WorkerPool;
use crate::workflow::{RunResult, WorkflowStep};

pub use crate::worker::CancelToken;

/// Runs `steps` in order and returns the accumulated result.
///
/// # Arguments
///
/// * `steps` - Steps in execution order
/// * `workers` - Worker lookup for the run
/// * `volumes` - File availability index of the run
/// * `result` - Initial result holding the run arguments as context
///
/// # Returns
///
/// * `Ok(RunResult)` - All executed steps; the last one failed if its
///   return code is non-zero
/// * `Err` - Worker resolution or file staging failed
pub fn exec_workflow(
    steps: &[WorkflowStep],
    workers: &mut WorkerPool,
    volumes: &mut VolumeManager,
    result: RunResult,
) -> Result<RunResult> {
    exec_workflow_cancellable(steps, workers, volumes, result, &CancelToken::new())
}

/// Like [`exec_workflow`], checking `cancel` before every step.
///
/// Canceling also kills the process of a running subprocess step.
pub fn exec_workflow_cancellable(
    steps: &[WorkflowStep],
    workers: &mut WorkerPool,
    volumes: &mut VolumeManager,
    mut result: RunResult,
    cancel: &CancelToken,
) -> Result<RunResult> {
    for (index, step) in steps.iter().enumerate() {
        if cancel.is_canceled() {
            warn!("Run canceled before step '{}'", step.name());
            break;
        }

        let worker = workers.get(step)?;
        let store = volumes.get(worker.volume().unwrap_or(DEFAULT_STORE))?;
        info!(
            "[{}/{}] Step '{}' on worker '{}'",
            index + 1,
            steps.len(),
            step.name(),
            worker.identifier()
        );

        volumes.prepare(store.as_ref(), step.inputs(), step.outputs())?;
        let exec = worker.exec_cancellable(step, &mut result.context, store.as_ref(), cancel)?;
        let returncode = exec.returncode;
        result.add(exec);

        if returncode != 0 {
            warn!("Step '{}' failed with return code {}", step.name(), returncode);
            break;
        }
        debug!("Step '{}' finished", step.name());
        volumes.update(store.as_ref(), step.outputs());
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::{FileSystemStorage, IoBuffer, StorageVolume, VolumeKind, VolumeSpec};
    use crate::worker::{WorkerFactory, WorkerRegistry, WorkerSpec};
    use crate::workflow::{Context, FunctionStep};
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::path::Path;
    use tempfile::tempdir;

    fn fs_spec(id: &str, dir: &Path) -> VolumeSpec {
        VolumeSpec::new(
            id,
            VolumeKind::Fs {
                basedir: dir.to_path_buf(),
            },
        )
    }

    fn pool(specs: Vec<WorkerSpec>, bindings: &[(&str, &str)]) -> WorkerPool {
        let factory = WorkerFactory::new(specs, WorkerRegistry::new(), true).unwrap();
        let managers = bindings
            .iter()
            .map(|(s, w)| (s.to_string(), w.to_string()))
            .collect();
        WorkerPool::new(factory, managers).unwrap()
    }

    /// Multiplies the `value` of the JSON file `filename` by `x`.
    fn multiply(name: &str, var: &str, output: &str) -> WorkflowStep {
        FunctionStep::new(name, &["filename", "x"], |args, _| {
            let text = std::fs::read_to_string(args.str("filename")?)?;
            let doc: Value = serde_json::from_str(&text)?;
            let value = doc["value"].as_i64().ok_or("missing value")?;
            Ok(json!(value * args.int("x")?))
        })
        .with_varname("x", var)
        .with_output(output)
        .with_input("data.json")
        .into()
    }

    #[test]
    fn test_stop_after_failing_step() {
        let tmp = tempdir().unwrap();
        let mut volumes =
            VolumeManager::new(vec![fs_spec(DEFAULT_STORE, tmp.path())], HashMap::new()).unwrap();
        let mut workers = pool(vec![], &[]);

        let ok = |name: &str| -> WorkflowStep {
            FunctionStep::new(name, &[], |_, out| {
                out.print("ok");
                Ok(json!(true))
            })
            .into()
        };
        let fail: WorkflowStep =
            FunctionStep::new("fail", &[], |_, _| Err("step failed".into())).into();
        let steps = vec![ok("s0"), ok("s1"), fail, ok("s3"), ok("s4")];

        let result =
            exec_workflow(&steps, &mut workers, &mut volumes, RunResult::new(Context::new()))
                .unwrap();
        assert_eq!(result.steps.len(), 3);
        assert_eq!(result.returncode(), Some(1));
        assert_eq!(result.steps[2].step.name(), "fail");
        assert_eq!(result.stdout(), vec!["ok", "ok"]);
    }

    #[test]
    fn test_context_flows_between_steps() {
        let tmp = tempdir().unwrap();
        let mut volumes =
            VolumeManager::new(vec![fs_spec(DEFAULT_STORE, tmp.path())], HashMap::new()).unwrap();
        let mut workers = pool(vec![], &[]);
        let steps: Vec<WorkflowStep> = vec![
            FunctionStep::new("add", &["x", "y"], |args, _| {
                Ok(json!(args.int("x")? + args.int("y")?))
            })
            .with_output("z")
            .into(),
            FunctionStep::new("double", &["z"], |args, _| Ok(json!(args.int("z")? * 2)))
                .with_output("w")
                .into(),
        ];
        let context: Context = [("x".to_string(), json!(1)), ("y".to_string(), json!(2))]
            .into_iter()
            .collect();

        let result = exec_workflow(&steps, &mut workers, &mut volumes, RunResult::new(context))
            .unwrap();
        assert_eq!(result.get("z").unwrap(), &json!(3));
        assert_eq!(result.get("w").unwrap(), &json!(6));
    }

    #[test]
    fn test_files_replicated_between_volumes() {
        let v1 = tempdir().unwrap();
        let v2 = tempdir().unwrap();
        let source = FileSystemStorage::new(v1.path(), Some(DEFAULT_STORE)).unwrap();
        source
            .store(&IoBuffer::new(r#"{"value": 5}"#), "data.json")
            .unwrap();

        let specs = vec![fs_spec(DEFAULT_STORE, v1.path()), fs_spec("v2", v2.path())];
        let files = HashMap::from([("data.json".to_string(), vec![DEFAULT_STORE.to_string()])]);
        let workers = || {
            pool(
                vec![
                    WorkerSpec::new("w1", "code").with_volume(DEFAULT_STORE),
                    WorkerSpec::new("w2", "code").with_volume("v2"),
                ],
                &[("s1", "w1"), ("s2", "w2")],
            )
        };
        let steps = vec![multiply("s1", "x1", "s1"), multiply("s2", "x2", "s2")];
        let context: Context = [
            ("filename".to_string(), json!("data.json")),
            ("x1".to_string(), json!(2)),
            ("x2".to_string(), json!(3)),
        ]
        .into_iter()
        .collect();

        let mut volumes = VolumeManager::new(specs.clone(), files.clone()).unwrap();
        let result = exec_workflow(
            &steps,
            &mut workers(),
            &mut volumes,
            RunResult::new(context.clone()),
        )
        .unwrap();
        assert_eq!(result.steps.len(), 2);
        assert_eq!(result.get("s1").unwrap(), &json!(10));
        assert_eq!(result.get("s2").unwrap(), &json!(15));
        assert!(v2.path().join("data.json").is_file());
        assert_eq!(
            volumes.files()["data.json"],
            vec![DEFAULT_STORE.to_string(), "v2".to_string()]
        );

        // Without the source file the first step fails and nothing else runs.
        source.delete("data.json").unwrap();
        let mut volumes = VolumeManager::new(specs, files).unwrap();
        let result = exec_workflow(
            &steps,
            &mut workers(),
            &mut volumes,
            RunResult::new(context.clone()),
        )
        .unwrap();
        assert_eq!(result.steps.len(), 1);
        assert_eq!(result.returncode(), Some(1));
        assert_eq!(result.context, context);
    }

    #[test]
    fn test_canceled_run_executes_nothing() {
        let tmp = tempdir().unwrap();
        let mut volumes =
            VolumeManager::new(vec![fs_spec(DEFAULT_STORE, tmp.path())], HashMap::new()).unwrap();
        let steps: Vec<WorkflowStep> =
            vec![FunctionStep::new("s0", &[], |_, _| Ok(json!(1))).into()];
        let cancel = CancelToken::new();
        cancel.cancel();

        let result = exec_workflow_cancellable(
            &steps,
            &mut pool(vec![], &[]),
            &mut volumes,
            RunResult::new(Context::new()),
            &cancel,
        )
        .unwrap();
        assert!(result.steps.is_empty());
        assert_eq!(result.returncode(), None);
    }
}
