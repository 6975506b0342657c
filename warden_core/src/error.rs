use crate::control::ControlPlaneError;
use crate::process::ExitReport;
use crate::storage::StorageError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that abort a fuzzing session or a CLI command.
///
/// A non-zero engine exit is not an error by itself: it is classified into a
/// [`RunOutcome`](crate::classify::RunOutcome). The variants carrying an
/// [`ExitReport`] are only produced where an exit must surface to the caller
/// (a failed merge, or a local regression run that CI has to observe).
#[derive(Error, Debug)]
pub enum WardenError {
    /// Creating, moving or inspecting working files failed.
    #[error("I/O error while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// The engine executable could not be started.
    #[error("Failed to launch {program:?}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The engine was started but its stdout/stderr could not be captured.
    #[error("Failed to attach to output streams of {0:?}")]
    StreamAttach(String),

    /// Waiting on or killing a live engine process failed.
    #[error("Failed to supervise {program:?}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Fuzzer executable {0:?} does not exist")]
    MissingEngine(PathBuf),

    #[error("Corpus merge failed: engine {0}")]
    MergeFailed(ExitReport),

    /// Engine exited unsuccessfully during a run that reports through the
    /// process exit code instead of the control plane.
    #[error("Fuzzer {0}")]
    EngineFailed(ExitReport),

    #[error("{engine} does not support {run_type} runs")]
    Unsupported { engine: String, run_type: String },

    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Control plane error: {0}")]
    ControlPlane(#[from] ControlPlaneError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl WardenError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        WardenError::Io {
            context: context.into(),
            source,
        }
    }

    /// True when the failure comes from a rejected credential, which the
    /// binary reports with a dedicated exit code.
    pub fn is_permission_denied(&self) -> bool {
        matches!(
            self,
            WardenError::ControlPlane(ControlPlaneError::PermissionDenied(_))
                | WardenError::Storage(StorageError::PermissionDenied(_))
        )
    }
}
