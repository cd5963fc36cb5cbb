//! Execution orchestration.
//!
//! [`Executor::submit`] drives everything the caller sees synchronously:
//! catalog resolution, filesystem validation, image provisioning, and
//! admission. Once a slot is reserved the execution is handed to a spawned
//! worker task and the caller gets the execution id back immediately; from
//! that point on, every outcome (including infrastructure failures and
//! deadline expiry) is recorded on the execution record rather than
//! returned.
//!
//! ```text
//!       submit
//!         │
//!         ▼
//!      queued ──(worker starts)──▶ running
//!                                    │
//!          ┌─────────────────────────┼────────────────────────┐
//!          ▼                         ▼                        ▼
//!  exit=0  completed        exit≠0  failed          deadline  timeout
//! ```

mod admission;
mod store;

pub use admission::{AdmissionController, AdmissionPermit};
pub use store::{Execution, ExecutionState, ExecutionStore, DEFAULT_RECORD_CAPACITY};

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::catalog::{Catalog, GlobalSettings, Program};
use crate::config::AppConfig;
use crate::docker::{
    detect_hook, parse_cpu_limit, parse_memory_limit, CapturedLogs, ComposeSpec,
    ContainerCommand, ContainerDriver, HookStage, OneshotSpec, RunOutput,
};
use crate::error::SubmitError;

/// Exit code recorded when the infrastructure, not the program, failed.
/// Matches the Docker CLI's own daemon-error convention.
pub const INFRA_FAILURE_EXIT_CODE: i64 = 125;

/// Fallback entry files probed when the declared main file is absent.
pub const MAIN_FILE_FALLBACKS: [&str; 4] = ["main.py", "run.py", "app.py", "index.py"];

/// One submission from the HTTP layer.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionRequest {
    pub program_id: String,
    /// Per-request inputs, surfaced to the program only as `PARAM_<NAME>`
    /// environment variables.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

/// Filesystem layout the executor works against.
///
/// `base_dir` is where this process probes for files; `host_root` is the
/// same tree as the Docker daemon sees it, used as the bind-mount source.
/// The two differ only when the orchestrator itself runs in a container.
#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    pub base_dir: PathBuf,
    pub host_root: PathBuf,
    pub actions_dir: PathBuf,
    pub host_actions_dir: PathBuf,
}

impl From<&AppConfig> for WorkspacePaths {
    fn from(config: &AppConfig) -> Self {
        Self {
            base_dir: config.base_dir.clone(),
            host_root: config.host_root.clone(),
            actions_dir: config.actions_dir(),
            host_actions_dir: config.host_actions_dir(),
        }
    }
}

/// How a validated submission will be launched.
#[derive(Debug, Clone)]
enum LaunchPlan {
    Oneshot { image: String, main_file: String },
    Compose { compose_file: PathBuf },
}

/// The central orchestrator for program executions.
pub struct Executor {
    catalog: Arc<Catalog>,
    driver: Arc<dyn ContainerDriver>,
    store: Arc<ExecutionStore>,
    admission: Arc<AdmissionController>,
    paths: WorkspacePaths,
}

impl Executor {
    pub fn new(
        catalog: Arc<Catalog>,
        driver: Arc<dyn ContainerDriver>,
        store: Arc<ExecutionStore>,
        admission: Arc<AdmissionController>,
        paths: WorkspacePaths,
    ) -> Self {
        Self {
            catalog,
            driver,
            store,
            admission,
            paths,
        }
    }

    /// Validate and admit a submission, then dispatch a worker for it.
    ///
    /// Everything that can be rejected is rejected here, before a record
    /// exists; a returned id means the execution will reach a terminal
    /// state on its own.
    pub async fn submit(&self, request: ExecutionRequest) -> Result<Uuid, SubmitError> {
        let snapshot = self.catalog.snapshot();
        let program = snapshot
            .lookup(&request.program_id)
            .cloned()
            .ok_or_else(|| SubmitError::ProgramNotFound(request.program_id.clone()))?;

        if !program.enabled {
            return Err(SubmitError::ProgramDisabled(program.id));
        }

        let plan = self.plan(&program, &snapshot.settings)?;

        if let LaunchPlan::Oneshot { ref image, .. } = plan {
            self.driver
                .ensure_image(image)
                .await
                .map_err(|e| SubmitError::ImageUnavailable {
                    image: image.clone(),
                    reason: e.to_string(),
                })?;
        }

        let permit = self.admission.reserve()?;

        let execution_id = Uuid::new_v4();
        // a colliding fresh v4 id means something is deeply wrong; give up
        self.store
            .insert(Execution::new(execution_id, &program.id))
            .map_err(|e| SubmitError::Internal(e.to_string()))?;

        tracing::info!(
            execution_id = %execution_id,
            program_id = %program.id,
            in_flight = self.admission.in_flight(),
            "execution admitted"
        );

        let worker = Worker {
            execution_id,
            program,
            plan,
            settings: snapshot.settings.clone(),
            parameters: request.parameters,
            driver: Arc::clone(&self.driver),
            store: Arc::clone(&self.store),
            paths: self.paths.clone(),
        };
        tokio::spawn(worker.run(permit));

        Ok(execution_id)
    }

    /// Resolve launch shape and validate the filesystem for it.
    fn plan(&self, program: &Program, settings: &GlobalSettings) -> Result<LaunchPlan, SubmitError> {
        if let Some(compose_file) = program.compose_file(&self.paths.base_dir) {
            if !compose_file.is_file() {
                return Err(SubmitError::ComposeFileMissing {
                    program_id: program.id.clone(),
                    path: compose_file,
                });
            }
            return Ok(LaunchPlan::Compose { compose_file });
        }

        let program_dir = program.program_dir(&self.paths.base_dir);
        let main_file = resolve_main_file(&program_dir, &program.main_file).ok_or_else(|| {
            SubmitError::MainFileMissing {
                program_id: program.id.clone(),
                dir: program_dir.clone(),
            }
        })?;

        let image = program
            .image
            .clone()
            .unwrap_or_else(|| settings.docker_image.clone());

        Ok(LaunchPlan::Oneshot { image, main_file })
    }

    pub fn store(&self) -> &Arc<ExecutionStore> {
        &self.store
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }
}

/// State moved into the spawned task driving one execution.
struct Worker {
    execution_id: Uuid,
    program: Program,
    plan: LaunchPlan,
    settings: GlobalSettings,
    parameters: HashMap<String, String>,
    driver: Arc<dyn ContainerDriver>,
    store: Arc<ExecutionStore>,
    paths: WorkspacePaths,
}

impl Worker {
    /// Drive the execution to a terminal state. The admission permit is
    /// held for the whole run and released when this function returns.
    async fn run(self, permit: AdmissionPermit) {
        if let Err(e) = self
            .store
            .update(self.execution_id, |e| e.status = ExecutionState::Running)
        {
            tracing::error!(execution_id = %self.execution_id, error = %e, "lost execution record");
            drop(permit);
            return;
        }

        // the deadline is measured from here, not from submission
        let deadline = self.settings.timeout();
        match &self.plan {
            LaunchPlan::Oneshot { image, main_file } => {
                self.run_oneshot(image, main_file, deadline).await;
            }
            LaunchPlan::Compose { compose_file } => {
                self.run_compose(compose_file, deadline).await;
            }
        }

        drop(permit);
    }

    async fn run_oneshot(&self, image: &str, main_file: &str, deadline: Duration) {
        let program_dir = self.program.program_dir(&self.paths.base_dir);
        let pre_hook = detect_hook(&self.paths.actions_dir, HookStage::Before);
        let post_hook = detect_hook(&self.paths.actions_dir, HookStage::After);
        let has_hooks = pre_hook.is_some() || post_hook.is_some();

        let command = ContainerCommand {
            main_file: main_file.to_string(),
            static_params: self.program.parameters.clone(),
            pre_hook,
            post_hook,
        };

        let spec = OneshotSpec {
            container_name: container_name(self.execution_id),
            image: image.to_string(),
            program_dir: self.program.program_dir(&self.paths.host_root),
            actions_dir: has_hooks.then(|| self.paths.host_actions_dir.clone()),
            env: container_env(
                &self.program,
                self.execution_id,
                &self.parameters,
                &program_dir,
            ),
            command: command.as_exec(),
            memory_bytes: parse_memory_limit(&self.settings.memory_limit),
            nano_cpus: parse_cpu_limit(&self.settings.cpu_limit),
        };

        tracing::info!(
            execution_id = %self.execution_id,
            program_id = %self.program.id,
            image,
            main_file,
            "starting container"
        );

        match tokio::time::timeout(deadline, self.driver.run_oneshot(&spec)).await {
            Ok(Ok(output)) => self.finish(output),
            Ok(Err(e)) => self.finish_infra_failure(e.to_string()),
            Err(_) => {
                let captured = self.driver.terminate_oneshot(&spec.container_name).await;
                self.finish_timeout(deadline, captured);
            }
        }
    }

    async fn run_compose(&self, compose_file: &Path, deadline: Duration) {
        let spec = ComposeSpec {
            compose_file: compose_file.to_path_buf(),
            env: vec![
                ("PROGRAM_ID".to_string(), self.program.id.clone()),
                ("EXECUTION_ID".to_string(), self.execution_id.to_string()),
            ],
        };

        tracing::info!(
            execution_id = %self.execution_id,
            program_id = %self.program.id,
            compose_file = %compose_file.display(),
            "starting compose topology"
        );

        match tokio::time::timeout(deadline, self.driver.run_compose(&spec)).await {
            Ok(Ok(output)) => self.finish(output),
            Ok(Err(e)) => self.finish_infra_failure(e.to_string()),
            Err(_) => {
                // `up` was cancelled mid-flight; release the services here
                let captured = self.driver.compose_down(compose_file).await;
                self.finish_timeout(deadline, captured);
            }
        }
    }

    fn finish(&self, output: RunOutput) {
        let status = if output.exit_code == 0 {
            ExecutionState::Completed
        } else {
            ExecutionState::Failed
        };
        let update = self.store.update(self.execution_id, |e| {
            e.status = status;
            e.exit_code = Some(output.exit_code);
            e.output = normalize_output(&output.stdout);
            e.error = normalize_output(&output.stderr);
            e.end_time = Some(Utc::now());
        });
        if let Err(e) = update {
            tracing::error!(execution_id = %self.execution_id, error = %e, "failed to record outcome");
        }
        tracing::info!(
            execution_id = %self.execution_id,
            program_id = %self.program.id,
            exit_code = output.exit_code,
            status = %status,
            "execution finished"
        );
    }

    fn finish_infra_failure(&self, diagnostic: String) {
        tracing::warn!(
            execution_id = %self.execution_id,
            program_id = %self.program.id,
            error = %diagnostic,
            "execution failed before the program could finish"
        );
        let update = self.store.update(self.execution_id, |e| {
            e.status = ExecutionState::Failed;
            e.exit_code = Some(INFRA_FAILURE_EXIT_CODE);
            e.error = diagnostic;
            e.end_time = Some(Utc::now());
        });
        if let Err(e) = update {
            tracing::error!(execution_id = %self.execution_id, error = %e, "failed to record outcome");
        }
    }

    /// Record the timeout, keeping whatever output the container produced
    /// before it was terminated.
    fn finish_timeout(&self, deadline: Duration, captured: CapturedLogs) {
        tracing::warn!(
            execution_id = %self.execution_id,
            program_id = %self.program.id,
            timeout_seconds = deadline.as_secs(),
            "execution exceeded its deadline"
        );
        let update = self.store.update(self.execution_id, |e| {
            e.status = ExecutionState::Timeout;
            e.output = normalize_output(&captured.stdout);
            let diagnostic = format!(
                "execution exceeded the {}s time limit",
                deadline.as_secs()
            );
            let stderr = normalize_output(&captured.stderr);
            e.error = if stderr.is_empty() {
                diagnostic
            } else {
                format!("{diagnostic}\n{stderr}")
            };
            e.end_time = Some(Utc::now());
        });
        if let Err(e) = update {
            tracing::error!(execution_id = %self.execution_id, error = %e, "failed to record outcome");
        }
    }
}

/// Container name for an execution; unique per execution id.
pub fn container_name(execution_id: Uuid) -> String {
    format!("crucible-exec-{execution_id}")
}

/// Resolve the entry file: the declared name when present, otherwise the
/// first existing fallback.
fn resolve_main_file(program_dir: &Path, declared: &str) -> Option<String> {
    if program_dir.join(declared).is_file() {
        return Some(declared.to_string());
    }
    MAIN_FILE_FALLBACKS
        .iter()
        .find(|candidate| program_dir.join(candidate).is_file())
        .map(|candidate| {
            tracing::debug!(declared, fallback = candidate, "using fallback main file");
            candidate.to_string()
        })
}

/// Assemble the container environment: the program's `.env` file first,
/// then the reserved variables and request parameters, which win on
/// conflict. Sorted for deterministic specs.
fn container_env(
    program: &Program,
    execution_id: Uuid,
    parameters: &HashMap<String, String>,
    program_dir: &Path,
) -> Vec<String> {
    let mut env: BTreeMap<String, String> = BTreeMap::new();

    let env_file = program_dir.join(".env");
    if env_file.is_file() {
        match dotenvy::from_path_iter(&env_file) {
            Ok(entries) => {
                for entry in entries {
                    match entry {
                        Ok((key, value)) => {
                            env.insert(key, value);
                        }
                        Err(e) => {
                            tracing::warn!(
                                env_file = %env_file.display(),
                                error = %e,
                                "skipping malformed .env entry"
                            );
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(env_file = %env_file.display(), error = %e, "failed to read .env");
            }
        }
    }

    env.insert("PROGRAM_ID".to_string(), program.id.clone());
    env.insert("EXECUTION_ID".to_string(), execution_id.to_string());
    for (key, value) in parameters {
        env.insert(format!("PARAM_{}", key.to_uppercase()), value.clone());
    }

    env.into_iter().map(|(k, v)| format!("{k}={v}")).collect()
}

/// Expand literal escape sequences in captured output and trim the tail,
/// so multi-line program logs read as written.
fn normalize_output(raw: &str) -> String {
    raw.replace("\\n", "\n")
        .replace("\\t", "\t")
        .replace("\\r", "\r")
        .trim_end()
        .to_string()
}
