//! # Runner
//!
//! Executes the automation for one resource and streams its job events back.
//!
//! Each run gets its own private data directory and its own unix socket. The
//! runner's HTTP event plugin posts every job event to that socket; the
//! receiver forwards them, in order, to the [`RunHandle`] returned by
//! [`Runner::run`]. Dropping the handle kills the process and removes the
//! directory.

pub mod aggregate;
pub mod events;
pub mod input;

pub use aggregate::{AnsibleResult, EventLevel, RunSummary};
pub use events::{EventReceiver, JobEvent, TaskEvent, TaskOutcome};

use crate::config::AutomationTarget;
use crate::constants::RUNNER_EVENTS_PATH;
use crate::controller::kind::ResourceKind;
use async_trait::async_trait;
use kube::api::DynamicObject;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, warn};

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("runner executable {bin} not found: {source}")]
    NotFound { bin: String, source: which::Error },
    #[error("failed to prepare private data directory: {0}")]
    Prepare(#[source] std::io::Error),
    #[error("failed to build extra vars: {0}")]
    ExtraVars(#[from] serde_json::Error),
    #[error("failed to start runner: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("runner was terminated by a signal")]
    Killed,
    #[error("run task ended abnormally: {0}")]
    Task(String),
}

/// One automation run against one resource
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub object: DynamicObject,
    pub kind: ResourceKind,
    pub target: AutomationTarget,
    pub vars: Map<String, Value>,
    pub snake_case_parameters: bool,
    pub verbosity: u8,
    pub kubeconfig: PathBuf,
}

/// How the automation process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunExit {
    pub code: i32,
}

impl RunExit {
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// A started run: its ordered job events and its completion
#[derive(Debug)]
pub struct RunHandle {
    pub ident: String,
    pub events: mpsc::UnboundedReceiver<JobEvent>,
    task: JoinHandle<Result<RunExit, RunnerError>>,
}

impl RunHandle {
    /// `events` must close once the run is over and every event was sent
    pub fn new(
        ident: String,
        events: mpsc::UnboundedReceiver<JobEvent>,
        task: JoinHandle<Result<RunExit, RunnerError>>,
    ) -> Self {
        Self {
            ident,
            events,
            task,
        }
    }

    pub async fn wait(&mut self) -> Result<RunExit, RunnerError> {
        match (&mut self.task).await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(RunnerError::Killed),
            Err(e) => Err(RunnerError::Task(e.to_string())),
        }
    }
}

impl Drop for RunHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
pub trait Runner: Send + Sync + std::fmt::Debug {
    async fn run(&self, request: RunRequest) -> Result<RunHandle, RunnerError>;
}

/// Runs `ansible-runner` as a child process
#[derive(Debug, Clone)]
pub struct AnsibleRunner {
    bin: PathBuf,
    extra_args: Vec<String>,
}

impl AnsibleRunner {
    /// Resolve `bin` on `PATH` once, at startup
    pub fn new(bin: &str, extra_args: Vec<String>) -> Result<Self, RunnerError> {
        let resolved = which::which(bin).map_err(|source| RunnerError::NotFound {
            bin: bin.to_string(),
            source,
        })?;
        info!("Using runner executable {}", resolved.display());
        Ok(Self {
            bin: resolved,
            extra_args,
        })
    }

    fn command(&self, request: &RunRequest, ident: &str, dir: &Path, socket: &Path) -> Command {
        let mut cmd = Command::new(&self.bin);
        if request.verbosity > 0 {
            cmd.arg(format!("-{}", "v".repeat(usize::from(request.verbosity))));
        }
        match &request.target {
            AutomationTarget::Role { name, path } => {
                let roles_path = path.parent().unwrap_or(path);
                cmd.arg("--role")
                    .arg(name)
                    .arg("--roles-path")
                    .arg(roles_path)
                    .args(["--hosts", "localhost"]);
            }
            AutomationTarget::Playbook(path) => {
                cmd.arg("-p").arg(path);
            }
        }
        if !self.extra_args.is_empty() {
            cmd.arg("--cmdline").arg(self.extra_args.join(" "));
        }
        cmd.args(["-i", ident]).arg("run").arg(dir);

        cmd.env("K8S_AUTH_KUBECONFIG", &request.kubeconfig)
            .env("KUBECONFIG", &request.kubeconfig)
            .env("RUNNER_HTTP_URL", socket)
            .env("RUNNER_HTTP_PATH", RUNNER_EVENTS_PATH)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Runner for AnsibleRunner {
    async fn run(&self, request: RunRequest) -> Result<RunHandle, RunnerError> {
        let ident = uuid::Uuid::new_v4().to_string();
        let span = tracing::span!(
            tracing::Level::INFO,
            "runner.run",
            runner.ident = ident.as_str(),
            gvk = %request.kind,
            resource.name = request.object.metadata.name.as_deref().unwrap_or("unknown"),
        );

        let dir = tempfile::Builder::new()
            .prefix("ansible-operator-")
            .tempdir()
            .map_err(RunnerError::Prepare)?;
        let extra_vars = input::extra_vars(
            &request.object,
            &request.kind,
            request.snake_case_parameters,
            &request.vars,
        )?;
        input::write_private_data_dir(dir.path(), &extra_vars).map_err(RunnerError::Prepare)?;

        let socket = dir.path().join("events.sock");
        let (receiver, events) = EventReceiver::bind(&socket).map_err(RunnerError::Prepare)?;

        let mut cmd = self.command(&request, &ident, dir.path(), &socket);
        let child = cmd.spawn().map_err(RunnerError::Spawn)?;
        debug!(parent: &span, automation = %request.target.describe(), "Runner started");

        let task = tokio::spawn(
            async move {
                let output = child.wait_with_output().await;
                // drain posts before the directory holding the socket goes away
                receiver.shutdown().await;
                drop(dir);

                let output = output.map_err(RunnerError::Spawn)?;
                let Some(code) = output.status.code() else {
                    return Err(RunnerError::Killed);
                };
                if code != 0 {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
                    warn!(
                        exit_code = code,
                        stderr = %tail.into_iter().rev().collect::<Vec<_>>().join("\n"),
                        "Runner exited with non-zero status"
                    );
                }
                Ok(RunExit { code })
            }
            .instrument(span),
        );

        Ok(RunHandle::new(ident, events, task))
    }
}
