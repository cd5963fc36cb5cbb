//! Error types for crucible.
//!
//! Errors are grouped per domain. Everything a caller can act on is a
//! dedicated variant; free-form strings are reserved for diagnostics that
//! only get logged or surfaced to a human.

use std::path::PathBuf;

use uuid::Uuid;

/// Errors raised while resolving application configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {message}")]
    InvalidValue { var: String, message: String },
}

/// Errors raised while loading or parsing the program catalog.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("failed to read catalog file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse catalog file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    /// Two catalog entries resolved to the same program id.
    #[error("duplicate program id in catalog: {0}")]
    DuplicateProgram(String),
}

/// Classified failures from the container runtime driver.
///
/// Callers use the variant to decide whether a failure is the image's fault,
/// the daemon's, or ours.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// The image is neither present locally nor pullable.
    #[error("image '{image}' unavailable: {reason}")]
    ImageUnavailable { image: String, reason: String },

    /// The runtime endpoint could not be reached at all.
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),

    /// The runtime refused the request (bad spec, name conflict, ...).
    #[error("container runtime rejected the request: {0}")]
    Rejected(String),

    /// The runtime accepted the request but failed internally.
    #[error("container runtime internal error: {0}")]
    Internal(String),
}

/// Errors from the in-memory execution store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("execution record already exists: {0}")]
    DuplicateExecution(Uuid),

    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),
}

/// Synchronous rejections returned by `Executor::submit`.
///
/// Every variant here is reported to the caller before any execution record
/// is created; failures after admission are recorded on the execution
/// instead.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("program not found: {0}")]
    ProgramNotFound(String),

    #[error("program '{0}' is disabled")]
    ProgramDisabled(String),

    /// Neither the declared main file nor any fallback exists.
    #[error("no runnable main file for program '{program_id}' in {dir}")]
    MainFileMissing { program_id: String, dir: PathBuf },

    #[error("compose file for program '{program_id}' not found: {path}")]
    ComposeFileMissing { program_id: String, path: PathBuf },

    #[error("image '{image}' unavailable: {reason}")]
    ImageUnavailable { image: String, reason: String },

    /// The concurrency cap is exhausted.
    #[error("maximum concurrent executions reached ({current}/{limit})")]
    Overloaded { current: usize, limit: usize },

    #[error("internal error: {0}")]
    Internal(String),
}

impl SubmitError {
    /// Stable machine-readable kind, used by the HTTP layer.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ProgramNotFound(_) => "not_found",
            Self::ProgramDisabled(_) => "disabled",
            Self::MainFileMissing { .. } => "main_file_missing",
            Self::ComposeFileMissing { .. } => "compose_file_missing",
            Self::ImageUnavailable { .. } => "image_unavailable",
            Self::Overloaded { .. } => "overloaded",
            Self::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_error_kinds_are_stable() {
        assert_eq!(
            SubmitError::ProgramNotFound("x".into()).kind(),
            "not_found"
        );
        assert_eq!(
            SubmitError::Overloaded {
                current: 5,
                limit: 5
            }
            .kind(),
            "overloaded"
        );
    }

    #[test]
    fn overloaded_message_carries_counts() {
        let err = SubmitError::Overloaded {
            current: 3,
            limit: 3,
        };
        assert!(err.to_string().contains("3/3"));
    }
}
