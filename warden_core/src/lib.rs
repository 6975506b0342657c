pub mod classify;
pub mod config;
pub mod control;
pub mod corpus;
pub mod engine;
pub mod error;
pub mod job;
pub mod poller;
pub mod process;
pub mod regression;
pub mod session;
pub mod storage;
pub mod workspace;

#[cfg(test)]
pub(crate) mod testing;

pub use classify::{RunOutcome, classify};
pub use config::WardenConfig;
pub use control::{ControlPlane, ControlPlaneError, CrashRecord, FileControlPlane, JobRecord};
pub use engine::{EngineInvocation, EngineSettings};
pub use error::WardenError;
pub use job::{EngineKind, FuzzJob, JobKey, JobStatus, RunType};
pub use poller::{JobStatusPoller, PollVerdict};
pub use process::{EngineProcess, ExitReport};
pub use session::{Session, SessionEnd, SessionSettings, SessionState};
pub use storage::{LocalObjectStore, ObjectStore, StorageError};
pub use workspace::Workspace;
