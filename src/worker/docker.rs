//! Docker Worker
//!
//! Runs the commands of a container step inside containers created from the
//! step's image. Every top-level folder of the run directory is bind-mounted
//! read-write at `/<folder>` in the container.
//!
//! The container engine is reached through the [`ContainerClient`] trait;
//! [`BollardClient`] talks to the local Docker daemon.

use std::collections::HashMap;
use std::fmt::Debug;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bollard::container::{
    Config as DockerConfig, CreateContainerOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, Mount, MountTypeEnum};
use bollard::Docker;
use futures_util::stream::StreamExt;
use log::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{stacktrace, Result};
use crate::volume::StorageVolume;
use crate::workflow::{ContainerStep, Context, ExecResult, WorkflowStep};

use super::base::{ContainerWorker, Worker};
use super::factory::WorkerArgs;

/// A bind mount from the run directory into the container.
#[derive(Debug, Clone, PartialEq)]
pub struct BindMount {
    pub host_path: PathBuf,
    pub container_path: String,
}

/// A single command to run in a fresh container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerRequest {
    pub image: String,
    pub command: String,
    pub mounts: Vec<BindMount>,
    pub env: Vec<String>,
}

/// Exit status and log output of a finished container.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerOutput {
    pub status_code: i64,
    pub logs: String,
}

/// Client for a container engine.
pub trait ContainerClient: Send + Sync + Debug {
    /// Runs `request` to completion and removes the container.
    fn run(&self, request: &ContainerRequest) -> Result<ContainerOutput>;
}

/// Container client for the local Docker daemon.
#[derive(Debug, Clone, Default)]
pub struct BollardClient;

impl BollardClient {
    fn create_docker_config(request: &ContainerRequest) -> DockerConfig<String> {
        let mounts: Vec<Mount> = request
            .mounts
            .iter()
            .map(|mount| Mount {
                typ: Some(MountTypeEnum::BIND),
                source: Some(mount.host_path.to_string_lossy().to_string()),
                target: Some(mount.container_path.clone()),
                read_only: Some(false),
                ..Default::default()
            })
            .collect();

        DockerConfig {
            image: Some(request.image.clone()),
            cmd: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                request.command.clone(),
            ]),
            env: Some(request.env.clone()),
            host_config: Some(HostConfig {
                mounts: Some(mounts),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn run_async(&self, request: &ContainerRequest) -> Result<ContainerOutput> {
        let client = Docker::connect_with_local_defaults()?;

        let name = format!("flowrunner_{}", Uuid::new_v4().simple());
        let options = || CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };
        let created = client
            .create_container(Some(options()), Self::create_docker_config(request))
            .await;
        let container = match created {
            Err(e) if is_missing_image(&e) => {
                Self::pull_image(&client, &request.image).await?;
                client
                    .create_container(Some(options()), Self::create_docker_config(request))
                    .await?
            }
            created => created?,
        };
        let id = container.id;
        debug!("Created container {} from {}", id, request.image);

        let outcome = Self::wait_and_collect(&client, &id).await;

        let remove = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        if let Err(e) = client.remove_container(&id, Some(remove)).await {
            warn!("Failed to remove container {}: {}", id, e);
        }
        outcome
    }

    async fn pull_image(client: &Docker, image: &str) -> Result<()> {
        info!("Pulling image {}", image);
        let (from_image, tag) = image_reference(image);
        let options = CreateImageOptions {
            from_image,
            tag,
            ..Default::default()
        };
        let mut progress = client.create_image(Some(options), None, None);
        while let Some(update) = progress.next().await {
            if let Some(status) = update?.status {
                debug!("{}: {}", image, status);
            }
        }
        Ok(())
    }

    async fn wait_and_collect(client: &Docker, id: &str) -> Result<ContainerOutput> {
        client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;

        let mut stream = client.wait_container(
            id,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        );
        let status_code = match stream.next().await {
            Some(Ok(response)) => response.status_code,
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => code,
            Some(Err(e)) => return Err(e.into()),
            None => 0,
        };

        let mut logs = String::new();
        let mut log_stream = client.logs(
            id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );
        while let Some(entry) = log_stream.next().await {
            let bytes = entry?.into_bytes();
            logs.push_str(&String::from_utf8_lossy(&bytes));
        }

        Ok(ContainerOutput { status_code, logs })
    }
}

/// Whether creating a container failed because its image is not present.
fn is_missing_image(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// Splits an image name into the reference to pull and its tag.
///
/// Untagged names pull `latest`; names with a tag or digest keep it in the
/// reference and leave the tag empty.
fn image_reference(image: &str) -> (&str, &str) {
    let name = image.rsplit('/').next().unwrap_or(image);
    if name.contains(':') || name.contains('@') {
        (image, "")
    } else {
        (image, "latest")
    }
}

impl ContainerClient for BollardClient {
    fn run(&self, request: &ContainerRequest) -> Result<ContainerOutput> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(self.run_async(request))
    }
}

/// Worker that executes step commands in Docker containers.
#[derive(Debug, Clone)]
pub struct DockerWorker {
    identifier: String,
    variables: HashMap<String, String>,
    env: HashMap<String, String>,
    volume: Option<String>,
    client: Arc<dyn ContainerClient>,
}

impl DockerWorker {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            variables: HashMap::new(),
            env: HashMap::new(),
            volume: None,
            client: Arc::new(BollardClient),
        }
    }

    pub fn from_args(args: WorkerArgs) -> Self {
        Self {
            identifier: args.identifier,
            variables: args.variables,
            env: args.env,
            volume: args.volume,
            client: Arc::new(BollardClient),
        }
    }

    /// Uses `client` instead of the local Docker daemon.
    pub fn with_client(mut self, client: Arc<dyn ContainerClient>) -> Self {
        self.client = client;
        self
    }

    pub fn with_variables(mut self, variables: HashMap<String, String>) -> Self {
        self.variables.extend(variables);
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn with_volume(mut self, volume: impl Into<String>) -> Self {
        self.volume = Some(volume.into());
        self
    }
}

/// Bind mounts for every top-level folder of `rundir`.
fn rundir_mounts(rundir: &Path) -> Result<Vec<BindMount>> {
    let mut mounts = Vec::new();
    for entry in fs::read_dir(rundir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            let name = entry.file_name().to_string_lossy().to_string();
            mounts.push(BindMount {
                host_path: fs::canonicalize(entry.path())?,
                container_path: format!("/{}", name),
            });
        }
    }
    mounts.sort_by(|a, b| a.container_path.cmp(&b.container_path));
    Ok(mounts)
}

impl Worker for DockerWorker {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn volume(&self) -> Option<&str> {
        self.volume.as_deref()
    }

    fn exec(
        &self,
        step: &WorkflowStep,
        context: &mut Context,
        store: &dyn StorageVolume,
    ) -> Result<ExecResult> {
        self.exec_container(step, context, store)
    }
}

impl ContainerWorker for DockerWorker {
    fn variables(&self) -> &HashMap<String, String> {
        &self.variables
    }

    fn env(&self) -> &HashMap<String, String> {
        &self.env
    }

    fn run(&self, step: &ContainerStep, env: &HashMap<String, String>, rundir: &Path) -> ExecResult {
        let mut result = ExecResult::new(step.clone().into());

        let mounts = match rundir_mounts(rundir) {
            Ok(mounts) => mounts,
            Err(e) => {
                result.fail(e.to_string(), stacktrace(&e));
                return result;
            }
        };
        let mut env: Vec<String> = env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        env.sort();

        for cmd in &step.commands {
            let request = ContainerRequest {
                image: step.image.clone(),
                command: cmd.clone(),
                mounts: mounts.clone(),
                env: env.clone(),
            };
            debug!("Running '{}' in {}", cmd, step.image);
            match self.client.run(&request) {
                Ok(output) => {
                    if !output.logs.is_empty() {
                        result.stdout.push(output.logs);
                    }
                    if output.status_code != 0 {
                        let message = format!(
                            "command '{}' in {} exited with status {}",
                            cmd, step.image, output.status_code
                        );
                        error!("Step '{}': {}", step.name, message);
                        result.fail(message.clone(), vec![message]);
                        break;
                    }
                }
                Err(e) => {
                    error!("Step '{}': container error: {}", step.name, e);
                    result.fail(e.to_string(), stacktrace(&e));
                    break;
                }
            }
        }
        result
    }
}
