//! Launch coordinator: drives one launch through
//! `PREPARING -> PROVISIONING_INPUT -> RUNNING -> PROVISIONING_OUTPUT -> DONE`,
//! or into `FAILED`, and produces the launch report.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache::ProvisionCache;
use crate::config::LauncherConfig;
use crate::error::{FailureKind, TransferError};
use crate::manifest::{
    load_document, Direction, EntryKind, JobDocument, ManifestBuilder, ManifestEntry, RunOutputs,
    ToolDescriptor,
};
use crate::provision::{ProvisionEngine, TransferResult};
use crate::registry::{DisabledBackend, PluginRegistry, StrategyTable};
use crate::runner::{ContainerRunner, RunRequest, ToolExit};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LaunchState {
    Preparing,
    ProvisioningInput,
    Running,
    ProvisioningOutput,
    Done,
    Failed,
}

impl LaunchState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LaunchState::Done | LaunchState::Failed)
    }
}

/// Launch-scoped working area, removed on drop unless kept
///
/// Layout: `<working-directory>/launcher-<uuid>/{configs,working,inputs,logs,outputs}`
pub struct StagingDir {
    root: PathBuf,
    keep: bool,
}

impl StagingDir {
    /// The root is absolute: the runner changes into `working/`, so every
    /// path handed to it must resolve from there.
    pub async fn create(parent: &Path, keep: bool) -> Result<Self> {
        let parent = std::path::absolute(parent)
            .with_context(|| format!("Failed to resolve working directory: {}", parent.display()))?;
        let root = parent.join(format!("launcher-{}", Uuid::new_v4()));
        // owned from here on, so a failure below still cleans up
        let staging = Self { root, keep };

        for dir in [staging.configs(), staging.working(), staging.inputs(), staging.logs(), staging.outputs()] {
            tokio::fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("Failed to create staging directory: {}", dir.display()))?;
        }

        tracing::info!("Staging directory: {}", staging.root.display());
        Ok(staging)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The working directory this launch was staged under
    pub fn parent(&self) -> &Path {
        self.root.parent().unwrap_or(&self.root)
    }

    pub fn configs(&self) -> PathBuf {
        self.root.join("configs")
    }

    pub fn working(&self) -> PathBuf {
        self.root.join("working")
    }

    pub fn inputs(&self) -> PathBuf {
        self.root.join("inputs")
    }

    pub fn logs(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn outputs(&self) -> PathBuf {
        self.root.join("outputs")
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if self.keep {
            tracing::info!("Keeping staging directory {}", self.root.display());
            return;
        }

        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => tracing::debug!("Removed staging directory {}", self.root.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove {}: {}", self.root.display(), e),
        }
    }
}

/// A resolved descriptor and job document
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    /// Handed to the runner as-is
    pub descriptor_path: PathBuf,
    pub descriptor: ToolDescriptor,
    pub job: JobDocument,
}

impl LaunchRequest {
    pub async fn from_files(descriptor_path: &Path, job_path: &Path) -> Result<Self> {
        let descriptor = load_document(descriptor_path).await?;
        let job = load_document(job_path).await?;
        let descriptor_path = std::path::absolute(descriptor_path)
            .with_context(|| format!("Failed to resolve {}", descriptor_path.display()))?;

        Ok(Self {
            descriptor_path,
            descriptor,
            job,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LaunchReport {
    pub state: LaunchState,

    /// State the launch was in when it failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<LaunchState>,

    /// Tool succeeded, and every input and declared output was provisioned
    pub success: bool,

    pub disabled_backends: Vec<DisabledBackend>,
    pub inputs: Vec<TransferResult>,
    pub outputs: Vec<TransferResult>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_exit: Option<ToolExit>,

    pub errors: Vec<String>,

    /// Only set when the staging directory is kept
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<PathBuf>,
}

impl LaunchReport {
    fn new() -> Self {
        Self {
            state: LaunchState::Preparing,
            failed_at: None,
            success: false,
            disabled_backends: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            tool_exit: None,
            errors: Vec::new(),
            working_directory: None,
        }
    }

    fn transition(&mut self, next: LaunchState) {
        debug_assert!(!self.state.is_terminal(), "transition out of {:?}", self.state);
        tracing::info!("Launch state {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn fail(mut self, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        tracing::error!("Launch failed during {:?}: {}", self.state, reason);
        self.errors.push(reason);
        self.failed_at = Some(self.state);
        self.state = LaunchState::Failed;
        self.success = false;
        self
    }
}

pub struct Launcher {
    config: LauncherConfig,
    runner: Arc<dyn ContainerRunner>,
    table: StrategyTable,
}

impl Launcher {
    pub fn new(config: LauncherConfig, runner: Arc<dyn ContainerRunner>) -> Self {
        Self {
            config,
            runner,
            table: StrategyTable::builtin(),
        }
    }

    /// Use a custom set of backend kinds instead of the compiled-in ones
    pub fn with_strategy_table(mut self, table: StrategyTable) -> Self {
        self.table = table;
        self
    }

    /// Fresh registry for one launch
    pub fn load_registry(&self) -> PluginRegistry {
        PluginRegistry::load_all_with(&self.table, &self.config.plugins, &self.config.backends)
    }

    async fn engine(&self, registry: Arc<PluginRegistry>) -> ProvisionEngine {
        let engine = ProvisionEngine::new(
            registry,
            self.config.file_provision_threads,
            self.config.retry_policy(),
        );

        let Some(path) = self.config.cache_path() else {
            return engine;
        };
        let cache = ProvisionCache::new(path);
        match cache.initialize().await {
            Ok(()) => engine.with_cache(cache),
            Err(e) => {
                tracing::warn!("Download cache disabled: {:#}", e);
                engine
            }
        }
    }

    /// Run one launch to a terminal state. The staging directory is removed
    /// on every path out of this function unless configured to be kept.
    pub async fn launch(&self, request: &LaunchRequest, cancel: &CancellationToken) -> LaunchReport {
        let mut report = LaunchReport::new();

        let registry = Arc::new(self.load_registry());
        report.disabled_backends = registry.disabled().to_vec();

        let staging = match StagingDir::create(
            &self.config.working_directory,
            self.config.keep_working_directory,
        )
        .await
        {
            Ok(staging) => staging,
            Err(e) => return report.fail(format!("{:#}", e)),
        };
        if self.config.keep_working_directory {
            report.working_directory = Some(staging.root().to_path_buf());
        }

        let builder = ManifestBuilder::new(&registry);
        let inputs = match builder.build_inputs(&request.descriptor, &request.job, &staging.inputs()) {
            Ok(inputs) => inputs,
            Err(e) => return report.fail(e.to_string()),
        };

        let job_path = staging.configs().join("job.json");
        if let Err(e) = write_job(&job_path, &inputs.job).await {
            return report.fail(format!("{:#}", e));
        }

        report.transition(LaunchState::ProvisioningInput);
        let engine = self.engine(Arc::clone(&registry)).await;
        let phase = engine.provision(Direction::Input, &inputs.entries, cancel).await;
        let failed: Vec<String> = phase
            .failures()
            .map(|r| format!("input `{}` ({}) failed", r.field, r.identifier))
            .collect();
        report.inputs = phase.results;

        if !failed.is_empty() {
            report.errors.extend(failed);
            return report.fail("input provisioning failed; the tool was not run");
        }
        if cancel.is_cancelled() {
            return report.fail("launch cancelled");
        }

        report.transition(LaunchState::Running);
        let run_request = RunRequest {
            descriptor: request.descriptor_path.clone(),
            job: job_path,
            outdir: staging.outputs(),
            logs: staging.logs(),
            working: staging.working(),
            timeout: self.config.run_timeout(),
        };
        let outcome = self.runner.run(&run_request, cancel).await;
        report.tool_exit = Some(outcome.exit.clone());

        let produced = match self.runner.collect_outputs(&run_request, &outcome).await {
            Ok(produced) => produced,
            Err(e) => {
                tracing::warn!("Could not collect run outputs: {}", e);
                report.errors.push(format!("could not collect run outputs: {}", e));
                RunOutputs::new()
            }
        };

        report.transition(LaunchState::ProvisioningOutput);
        let outputs = builder.build_outputs(&request.descriptor, &request.job, &produced, staging.parent());
        let phase = engine.provision(Direction::Output, &outputs.entries, cancel).await;
        report.outputs = phase.results;

        for missing in outputs.missing {
            let message = missing.error.to_string();
            report.errors.push(message.clone());
            let entry = ManifestEntry {
                field: missing.field,
                identifier: missing.identifier,
                local_path: missing.expected.unwrap_or_else(|| staging.outputs()),
                direction: Direction::Output,
                kind: EntryKind::File,
                metadata: None,
            };
            report.outputs.push(TransferResult::failed(
                &entry,
                TransferError::new(FailureKind::MissingOutput, message),
                0,
            ));
        }

        report.transition(LaunchState::Done);
        report.success = outcome.exit.succeeded()
            && report.inputs.iter().all(TransferResult::is_success)
            && report.outputs.iter().all(TransferResult::is_success);

        if !outcome.exit.succeeded() {
            report.errors.push(format!("tool did not succeed: {:?}", outcome.exit));
        }

        report
    }
}

async fn write_job(path: &Path, job: &JobDocument) -> Result<()> {
    let body = serde_json::to_vec_pretty(job).context("Failed to serialize job document")?;
    tokio::fs::write(path, body)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))
}
