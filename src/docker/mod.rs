//! Container runtime driver.
//!
//! [`ContainerDriver`] is the narrow seam between the execution engine and
//! the container runtime; [`DockerDriver`] implements it against the Docker
//! Engine API via bollard, plus `docker compose` as a subprocess for the
//! compose execution shape. Keeping the seam a trait lets the executor be
//! tested against a scripted fake without a daemon.

pub mod command;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::stream::StreamExt;
use serde::Serialize;

use crate::error::DriverError;

pub use command::{
    detect_hook, ContainerCommand, Hook, HookStage, Interpreter, ACTIONS_MOUNT, WORKSPACE_DIR,
};

/// Ceiling for a registry pull before the image is declared unavailable.
pub const DEFAULT_PULL_TIMEOUT: Duration = Duration::from_secs(300);

/// Ceiling for `docker compose down` teardown.
const COMPOSE_DOWN_TIMEOUT: Duration = Duration::from_secs(60);

/// Everything needed to launch one isolated one-shot container.
#[derive(Debug, Clone)]
pub struct OneshotSpec {
    /// Unique container name derived from the execution id.
    pub container_name: String,
    pub image: String,
    /// Host-side program directory, mounted read-only at the workspace.
    pub program_dir: PathBuf,
    /// Host-side hooks directory, mounted read-only at `/actions` when set.
    pub actions_dir: Option<PathBuf>,
    /// Environment entries in `KEY=VALUE` form.
    pub env: Vec<String>,
    /// Container command in exec form.
    pub command: Vec<String>,
    pub memory_bytes: Option<i64>,
    pub nano_cpus: Option<i64>,
}

/// A compose-mode launch: bring the declared topology up, tear it down after.
#[derive(Debug, Clone)]
pub struct ComposeSpec {
    pub compose_file: PathBuf,
    /// Extra environment exported to the compose invocation.
    pub env: Vec<(String, String)>,
}

/// Captured result of a finished container or compose run.
#[derive(Debug, Clone, Default)]
pub struct RunOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

/// Output recovered from an execution that was cut short.
#[derive(Debug, Clone, Default)]
pub struct CapturedLogs {
    pub stdout: String,
    pub stderr: String,
}

/// One row of the active-container listing.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveContainer {
    pub container_id: String,
    pub image: String,
    pub status: String,
    pub name: String,
}

/// Captured log tail of one active container.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerLogs {
    pub container_id: String,
    pub stdout: String,
    pub stderr: String,
}

/// Narrow interface over the container runtime.
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    /// Succeed if the image is locally present, pulling it when it is not.
    async fn ensure_image(&self, image: &str) -> Result<(), DriverError>;

    /// Launch a one-shot container and block until it exits, capturing
    /// stdout and stderr separately. The container is removed on all exit
    /// paths.
    async fn run_oneshot(&self, spec: &OneshotSpec) -> Result<RunOutput, DriverError>;

    /// Forcibly remove a one-shot container, used on deadline expiry. A log
    /// tail is captured first so the output accumulated before termination
    /// survives. Removal failures are logged, not returned; there is
    /// nothing a caller can do.
    async fn terminate_oneshot(&self, container_name: &str) -> CapturedLogs;

    /// Run `compose up` for the given topology and block until it exits,
    /// then unconditionally tear the services down.
    async fn run_compose(&self, spec: &ComposeSpec) -> Result<RunOutput, DriverError>;

    /// Tear down a compose topology, capturing the services' log tail
    /// first. Used directly on deadline expiry, where the recovered output
    /// is all the record gets.
    async fn compose_down(&self, compose_file: &Path) -> CapturedLogs;

    /// Currently running containers.
    async fn list_active(&self) -> Result<Vec<ActiveContainer>, DriverError>;

    /// Log tails of running containers whose image matches `image` exactly.
    async fn logs_for_image(&self, image: &str) -> Result<Vec<ContainerLogs>, DriverError>;
}

/// [`ContainerDriver`] backed by the local Docker daemon.
pub struct DockerDriver {
    docker: Docker,
    pull_timeout: Duration,
}

impl DockerDriver {
    /// Connect using the platform defaults (Unix socket, or the env
    /// overrides Docker clients honour).
    pub fn connect() -> Result<Self, DriverError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| DriverError::Unavailable(e.to_string()))?;
        Ok(Self {
            docker,
            pull_timeout: DEFAULT_PULL_TIMEOUT,
        })
    }

    pub fn with_pull_timeout(mut self, timeout: Duration) -> Self {
        self.pull_timeout = timeout;
        self
    }

    async fn remove_container(&self, name: &str) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = self.docker.remove_container(name, Some(options)).await {
            tracing::warn!(container = name, error = %e, "failed to remove container");
        }
    }

    async fn tail_logs(&self, container_id: &str) -> ContainerLogs {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: "100".to_string(),
            ..Default::default()
        };
        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut stream = self.docker.logs(container_id, Some(options));
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message }) => {
                    stdout.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(LogOutput::StdErr { message }) => {
                    stderr.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(container = container_id, error = %e, "log stream error");
                    break;
                }
            }
        }
        ContainerLogs {
            container_id: container_id.to_string(),
            stdout,
            stderr,
        }
    }
}

#[async_trait]
impl ContainerDriver for DockerDriver {
    async fn ensure_image(&self, image: &str) -> Result<(), DriverError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => return Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => return Err(classify(e)),
        }

        tracing::info!(image, "image not present locally, pulling");
        let pull = async {
            let options = CreateImageOptions {
                from_image: image,
                ..Default::default()
            };
            let mut stream = self.docker.create_image(Some(options), None, None);
            while let Some(progress) = stream.next().await {
                progress.map_err(|e| DriverError::ImageUnavailable {
                    image: image.to_string(),
                    reason: e.to_string(),
                })?;
            }
            Ok(())
        };

        match tokio::time::timeout(self.pull_timeout, pull).await {
            Ok(result) => {
                if result.is_ok() {
                    tracing::info!(image, "image pulled");
                }
                result
            }
            Err(_) => Err(DriverError::ImageUnavailable {
                image: image.to_string(),
                reason: format!(
                    "pull did not complete within {}s",
                    self.pull_timeout.as_secs()
                ),
            }),
        }
    }

    async fn run_oneshot(&self, spec: &OneshotSpec) -> Result<RunOutput, DriverError> {
        let mut binds = vec![format!("{}:{WORKSPACE_DIR}:ro", spec.program_dir.display())];
        if let Some(actions) = &spec.actions_dir {
            binds.push(format!("{}:{ACTIONS_MOUNT}:ro", actions.display()));
        }

        let host_config = HostConfig {
            binds: Some(binds),
            memory: spec.memory_bytes,
            nano_cpus: spec.nano_cpus,
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            env: Some(spec.env.clone()),
            working_dir: Some(WORKSPACE_DIR.to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.container_name.clone(),
            ..Default::default()
        };
        self.docker
            .create_container(Some(options), config)
            .await
            .map_err(classify)?;

        if let Err(e) = self
            .docker
            .start_container::<String>(&spec.container_name, None)
            .await
        {
            self.remove_container(&spec.container_name).await;
            return Err(classify(e));
        }

        // follow the log streams until the container exits
        let mut stdout = String::new();
        let mut stderr = String::new();
        let log_options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: true,
            ..Default::default()
        };
        let mut logs = self.docker.logs(&spec.container_name, Some(log_options));
        while let Some(chunk) = logs.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message }) => {
                    stdout.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(LogOutput::StdErr { message }) => {
                    stderr.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(
                        container = %spec.container_name,
                        error = %e,
                        "log stream ended early"
                    );
                    break;
                }
            }
        }

        let wait_options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut wait = self
            .docker
            .wait_container(&spec.container_name, Some(wait_options));
        let exit_code = match wait.next().await {
            Some(Ok(response)) => response.status_code,
            // bollard surfaces a non-zero exit as this error variant
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => code,
            Some(Err(e)) => {
                self.remove_container(&spec.container_name).await;
                return Err(classify(e));
            }
            None => {
                self.remove_container(&spec.container_name).await;
                return Err(DriverError::Internal(
                    "wait stream closed before the container exited".to_string(),
                ));
            }
        };

        self.remove_container(&spec.container_name).await;

        Ok(RunOutput {
            exit_code,
            stdout,
            stderr,
        })
    }

    async fn terminate_oneshot(&self, container_name: &str) -> CapturedLogs {
        tracing::info!(container = container_name, "terminating container");
        let tail = self.tail_logs(container_name).await;
        self.remove_container(container_name).await;
        CapturedLogs {
            stdout: tail.stdout,
            stderr: tail.stderr,
        }
    }

    async fn run_compose(&self, spec: &ComposeSpec) -> Result<RunOutput, DriverError> {
        let compose_dir = spec
            .compose_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let mut cmd = tokio::process::Command::new("docker");
        cmd.arg("compose")
            .arg("-f")
            .arg(&spec.compose_file)
            .args(["up", "--remove-orphans"])
            .current_dir(&compose_dir)
            .kill_on_drop(true);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        tracing::info!(
            compose_file = %spec.compose_file.display(),
            "running compose up"
        );
        let result = cmd.output().await;

        // services are released no matter how `up` went; the log tail is
        // not needed here because `up` captured the output itself
        let _ = self.compose_down(&spec.compose_file).await;

        let output = result.map_err(|e| {
            DriverError::Unavailable(format!("failed to run docker compose: {e}"))
        })?;

        Ok(RunOutput {
            exit_code: i64::from(output.status.code().unwrap_or(-1)),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn compose_down(&self, compose_file: &Path) -> CapturedLogs {
        let compose_dir = compose_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        // recover what the services printed before they go away
        let mut logs_cmd = tokio::process::Command::new("docker");
        logs_cmd
            .arg("compose")
            .arg("-f")
            .arg(compose_file)
            .args(["logs", "--no-color"])
            .current_dir(&compose_dir)
            .kill_on_drop(true);
        let captured = match tokio::time::timeout(COMPOSE_DOWN_TIMEOUT, logs_cmd.output()).await {
            Ok(Ok(output)) => CapturedLogs {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            },
            Ok(Err(e)) => {
                tracing::warn!(compose_file = %compose_file.display(), error = %e, "compose logs failed to run");
                CapturedLogs::default()
            }
            Err(_) => {
                tracing::warn!(
                    compose_file = %compose_file.display(),
                    "compose logs did not finish within {}s",
                    COMPOSE_DOWN_TIMEOUT.as_secs()
                );
                CapturedLogs::default()
            }
        };

        let mut cmd = tokio::process::Command::new("docker");
        cmd.arg("compose")
            .arg("-f")
            .arg(compose_file)
            .args(["down", "--remove-orphans"])
            .current_dir(&compose_dir)
            .kill_on_drop(true);

        match tokio::time::timeout(COMPOSE_DOWN_TIMEOUT, cmd.output()).await {
            Ok(Ok(output)) if output.status.success() => {
                tracing::info!(compose_file = %compose_file.display(), "compose services torn down");
            }
            Ok(Ok(output)) => {
                tracing::warn!(
                    compose_file = %compose_file.display(),
                    stderr = %String::from_utf8_lossy(&output.stderr),
                    "compose down failed"
                );
            }
            Ok(Err(e)) => {
                tracing::warn!(compose_file = %compose_file.display(), error = %e, "compose down failed to run");
            }
            Err(_) => {
                tracing::warn!(
                    compose_file = %compose_file.display(),
                    "compose down did not finish within {}s",
                    COMPOSE_DOWN_TIMEOUT.as_secs()
                );
            }
        }

        captured
    }

    async fn list_active(&self) -> Result<Vec<ActiveContainer>, DriverError> {
        let options = ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(classify)?;

        Ok(containers
            .into_iter()
            .map(|c| ActiveContainer {
                container_id: c.id.unwrap_or_default().chars().take(12).collect(),
                image: c.image.unwrap_or_default(),
                status: c.status.unwrap_or_default(),
                name: c
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default(),
            })
            .collect())
    }

    async fn logs_for_image(&self, image: &str) -> Result<Vec<ContainerLogs>, DriverError> {
        let active = self.list_active().await?;
        let mut logs = Vec::new();
        for container in active.into_iter().filter(|c| c.image == image) {
            logs.push(self.tail_logs(&container.container_id).await);
        }
        Ok(logs)
    }
}

fn classify(err: bollard::errors::Error) -> DriverError {
    use bollard::errors::Error;
    match err {
        Error::DockerResponseServerError {
            status_code,
            message,
        } if status_code < 500 => DriverError::Rejected(message),
        Error::DockerResponseServerError { message, .. } => DriverError::Internal(message),
        other => DriverError::Unavailable(other.to_string()),
    }
}

/// Parse a memory limit like "1g", "512m", "64k", or plain bytes.
pub fn parse_memory_limit(limit: &str) -> Option<i64> {
    let limit = limit.trim().to_lowercase();
    if limit.is_empty() {
        return None;
    }
    let (number, multiplier) = match limit.strip_suffix(['b', 'k', 'm', 'g']) {
        Some(number) => {
            let multiplier = match limit.as_bytes()[limit.len() - 1] {
                b'b' => 1,
                b'k' => 1024,
                b'm' => 1024 * 1024,
                _ => 1024 * 1024 * 1024,
            };
            (number, multiplier)
        }
        None => (limit.as_str(), 1),
    };
    let value: i64 = number.trim().parse().ok()?;
    (value > 0).then_some(value * multiplier)
}

/// Parse a fractional-core CPU limit like "0.5" into Docker nano-CPUs.
pub fn parse_cpu_limit(limit: &str) -> Option<i64> {
    let cores: f64 = limit.trim().parse().ok()?;
    (cores > 0.0).then_some((cores * 1_000_000_000.0) as i64)
}
