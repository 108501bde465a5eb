// Container run collaborator: runs the tool once and reports where outputs landed
use async_trait::async_trait;
use serde::Serialize;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::manifest::RunOutputs;

/// Everything the runner needs for one invocation, all inside the staging directory
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub descriptor: PathBuf,
    /// Job document rewritten to point at staged inputs
    pub job: PathBuf,
    pub outdir: PathBuf,
    pub logs: PathBuf,
    pub working: PathBuf,
    pub timeout: Option<Duration>,
}

/// How the tool's process ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolExit {
    Exited { code: i32 },
    /// Killed by a signal the launcher did not send
    Terminated,
    TimedOut,
    Cancelled,
    SpawnFailed { message: String },
}

impl ToolExit {
    pub fn succeeded(&self) -> bool {
        matches!(self, ToolExit::Exited { code: 0 })
    }
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub exit: ToolExit,
    /// Captured standard output of the run
    pub stdout: PathBuf,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to read run output {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("run did not report an output object")]
    NoOutputObject,

    #[error("run reported an invalid output object: {0}")]
    InvalidOutputObject(#[from] serde_json::Error),
}

#[async_trait]
pub trait ContainerRunner: Send + Sync {
    /// Run the tool to completion, timeout, or cancellation. Never fails;
    /// problems are reported through [`ToolExit`].
    async fn run(&self, request: &RunRequest, cancel: &CancellationToken) -> RunOutcome;

    /// Output object of a finished run
    async fn collect_outputs(
        &self,
        request: &RunRequest,
        outcome: &RunOutcome,
    ) -> Result<RunOutputs, RunError>;
}

/// Runs a cwltool-compatible executable:
/// `<program> [args..] --outdir <outdir> <descriptor> <job>`
pub struct CwltoolRunner {
    program: String,
    args: Vec<String>,
}

impl CwltoolRunner {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    fn spawn_failed(message: String, stdout: PathBuf) -> RunOutcome {
        tracing::error!("Could not start the run: {}", message);
        RunOutcome {
            exit: ToolExit::SpawnFailed { message },
            stdout,
        }
    }
}

#[async_trait]
impl ContainerRunner for CwltoolRunner {
    async fn run(&self, request: &RunRequest, cancel: &CancellationToken) -> RunOutcome {
        let stdout_path = request.logs.join("stdout.log");
        let stderr_path = request.logs.join("stderr.log");

        let (stdout, stderr) = match (
            std::fs::File::create(&stdout_path),
            std::fs::File::create(&stderr_path),
        ) {
            (Ok(out), Ok(err)) => (out, err),
            (Err(e), _) | (_, Err(e)) => {
                return Self::spawn_failed(format!("cannot create log files: {}", e), stdout_path)
            }
        };

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg("--outdir")
            .arg(&request.outdir)
            .arg(&request.descriptor)
            .arg(&request.job)
            .current_dir(&request.working)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);

        tracing::info!("Running {:?}", command.as_std());
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => return Self::spawn_failed(format!("{}: {}", self.program, e), stdout_path),
        };

        let deadline = async {
            match request.timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending::<()>().await,
            }
        };

        let exit = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => match status.code() {
                    Some(code) => ToolExit::Exited { code },
                    None => ToolExit::Terminated,
                },
                Err(e) => ToolExit::SpawnFailed { message: e.to_string() },
            },
            _ = cancel.cancelled() => ToolExit::Cancelled,
            _ = deadline => ToolExit::TimedOut,
        };

        if matches!(exit, ToolExit::Cancelled | ToolExit::TimedOut) {
            tracing::warn!("Killing run ({:?})", exit);
            if let Err(e) = child.kill().await {
                tracing::warn!("Failed to kill run: {}", e);
            }
        }

        tracing::info!("Run finished: {:?} (stderr at {})", exit, stderr_path.display());
        RunOutcome {
            exit,
            stdout: stdout_path,
        }
    }

    async fn collect_outputs(
        &self,
        _request: &RunRequest,
        outcome: &RunOutcome,
    ) -> Result<RunOutputs, RunError> {
        let content = tokio::fs::read_to_string(&outcome.stdout)
            .await
            .map_err(|source| RunError::Io {
                path: outcome.stdout.clone(),
                source,
            })?;

        // anything printed before the object is log noise
        let start = content.find('{').ok_or(RunError::NoOutputObject)?;
        let mut objects = serde_json::Deserializer::from_str(&content[start..]).into_iter::<RunOutputs>();

        match objects.next() {
            Some(outputs) => Ok(outputs?),
            None => Err(RunError::NoOutputObject),
        }
    }
}
