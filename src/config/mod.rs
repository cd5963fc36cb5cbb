//! Application configuration.
//!
//! Settings are loaded with priority: CLI flag > env var > default. The
//! catalog file itself (programs and global settings) is handled separately
//! by [`crate::catalog`]; this module only covers process-level knobs.

pub(crate) mod helpers;

use std::path::PathBuf;

use crate::error::ConfigError;
use crate::executor::DEFAULT_RECORD_CAPACITY;

use self::helpers::{optional_env, parse_optional_env, parse_string_env};

/// Process-level configuration for the orchestrator.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Directory containing the catalog file, program directories, and the
    /// `actions/` hook directory.
    pub base_dir: PathBuf,
    /// Host-side prefix used as the source of bind mounts. Differs from
    /// `base_dir` only when the orchestrator itself runs containerised and
    /// sees the project under a different path than the Docker daemon does.
    pub host_root: PathBuf,
    /// Path to the catalog file.
    pub catalog_path: PathBuf,
    /// Address the REST API binds to.
    pub listen_addr: String,
    /// Port the REST API binds to.
    pub listen_port: u16,
    /// Upper bound on retained execution records.
    pub record_capacity: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        let base_dir = PathBuf::from("/app");
        Self {
            catalog_path: base_dir.join("config.yaml"),
            host_root: base_dir.clone(),
            base_dir,
            listen_addr: "0.0.0.0".to_string(),
            listen_port: 8000,
            record_capacity: DEFAULT_RECORD_CAPACITY,
        }
    }
}

impl AppConfig {
    /// Resolve configuration from the environment.
    pub fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let base_dir = PathBuf::from(parse_string_env("CRUCIBLE_BASE_DIR", "/app"));
        let host_root = optional_env("CRUCIBLE_HOST_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| base_dir.clone());
        let catalog_path = optional_env("CRUCIBLE_CATALOG")
            .map(PathBuf::from)
            .unwrap_or_else(|| base_dir.join("config.yaml"));

        Ok(Self {
            base_dir,
            host_root,
            catalog_path,
            listen_addr: parse_string_env("CRUCIBLE_LISTEN_ADDR", &defaults.listen_addr),
            listen_port: parse_optional_env("CRUCIBLE_LISTEN_PORT", defaults.listen_port)?,
            record_capacity: parse_optional_env(
                "CRUCIBLE_RECORD_CAPACITY",
                defaults.record_capacity,
            )?,
        })
    }

    /// Directory where the pre/post execution hooks live.
    pub fn actions_dir(&self) -> PathBuf {
        self.base_dir.join("actions")
    }

    /// Host-side path of the hooks directory, for bind mounting.
    pub fn host_actions_dir(&self) -> PathBuf {
        self.host_root.join("actions")
    }
}
