//! Recording doubles for the collaborator traits.

use crate::control::{ControlPlane, ControlPlaneError, CrashRecord};
use crate::job::{JobKey, JobStatus};
use crate::storage::{ObjectStore, StorageError};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq)]
pub enum ControlCall {
    RefreshAuth,
    JobStatus,
    UpdateJobStatus(JobStatus),
    AddCrash { crash_id: String, record: CrashRecord },
}

/// Answers `job_status` from a script; once the script runs out the last
/// answer repeats, and an empty script always answers "in progress".
#[derive(Default)]
pub struct ScriptedControlPlane {
    statuses: Mutex<VecDeque<JobStatus>>,
    last: Mutex<Option<JobStatus>>,
    fail_job_status: bool,
    calls: Mutex<Vec<ControlCall>>,
}

impl ScriptedControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_statuses(statuses: Vec<JobStatus>) -> Self {
        Self {
            statuses: Mutex::new(statuses.into()),
            ..Self::default()
        }
    }

    pub fn failing_status() -> Self {
        Self {
            fail_job_status: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<ControlCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn transitions(&self) -> Vec<JobStatus> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                ControlCall::UpdateJobStatus(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    pub fn crashes(&self) -> Vec<(String, CrashRecord)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                ControlCall::AddCrash { crash_id, record } => Some((crash_id, record)),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: ControlCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl ControlPlane for ScriptedControlPlane {
    async fn refresh_auth(&self) -> Result<(), ControlPlaneError> {
        self.record(ControlCall::RefreshAuth);
        Ok(())
    }

    async fn job_status(&self, _key: &JobKey) -> Result<JobStatus, ControlPlaneError> {
        self.record(ControlCall::JobStatus);
        if self.fail_job_status {
            return Err(ControlPlaneError::PermissionDenied("scripted".to_string()));
        }
        let mut last = self.last.lock().unwrap();
        if let Some(next) = self.statuses.lock().unwrap().pop_front() {
            *last = Some(next);
        }
        Ok(last.clone().unwrap_or(JobStatus::InProgress))
    }

    async fn update_job_status(
        &self,
        _key: &JobKey,
        status: &JobStatus,
    ) -> Result<(), ControlPlaneError> {
        self.record(ControlCall::UpdateJobStatus(status.clone()));
        Ok(())
    }

    async fn add_crash(
        &self,
        _key: &JobKey,
        crash_id: &str,
        record: &CrashRecord,
    ) -> Result<(), ControlPlaneError> {
        self.record(ControlCall::AddCrash {
            crash_id: crash_id.to_string(),
            record: record.clone(),
        });
        Ok(())
    }
}

/// In-memory object store that keeps every upload in order.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    uploads: Mutex<Vec<String>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, storage_path: &str, bytes: Vec<u8>) {
        self.objects
            .lock()
            .unwrap()
            .insert(storage_path.to_string(), bytes);
    }

    pub fn object(&self, storage_path: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(storage_path).cloned()
    }

    pub fn uploads(&self) -> Vec<String> {
        self.uploads.lock().unwrap().clone()
    }
}

impl ObjectStore for MemoryObjectStore {
    async fn upload_file(&self, local: &Path, storage_path: &str) -> Result<(), StorageError> {
        let bytes = std::fs::read(local).map_err(|source| StorageError::Io {
            path: local.to_path_buf(),
            source,
        })?;
        self.insert(storage_path, bytes);
        self.uploads.lock().unwrap().push(storage_path.to_string());
        Ok(())
    }

    async fn download_file(&self, storage_path: &str, local: &Path) -> Result<(), StorageError> {
        let bytes = self
            .object(storage_path)
            .ok_or_else(|| StorageError::NotFound(storage_path.to_string()))?;
        std::fs::write(local, bytes).map_err(|source| StorageError::Io {
            path: local.to_path_buf(),
            source,
        })
    }
}

/// Writes an executable `/bin/sh` script.
pub fn write_script(path: &Path, body: &str) {
    use std::os::unix::fs::PermissionsExt;
    std::fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}
