use crate::job::{EngineKind, JobKey, JobStatus, RunType};
use chrono::{DateTime, Utc};
use rand::Rng;
use rand::distr::Alphanumeric;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Name of the file, under the control-plane root, listing accepted API keys.
pub const API_KEYS_FILE: &str = "api_keys";

const DOCUMENT_ID_LEN: usize = 20;

#[derive(Error, Debug)]
pub enum ControlPlaneError {
    /// The configured credential was rejected.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Resource {0} doesn't exist")]
    NotFound(String),

    #[error("Resource {0} already exists")]
    AlreadyExists(String),

    #[error("Invalid resource {0}")]
    InvalidResource(String),

    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed document {path}: {source}")]
    Serialization {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// A crash found during a job, stored under the job's `crashes` collection.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CrashRecord {
    pub target_name: String,
    pub target_id: String,
    pub job_id: String,
    pub org_id: String,
    pub exit_code: i32,
    #[serde(rename = "type")]
    pub kind: String,
    /// Tail of the engine output leading up to the crash.
    #[serde(default)]
    pub last_lines: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl CrashRecord {
    pub const CRASH_KIND: &'static str = "CRASH";

    pub fn new(key: &JobKey, exit_code: i32, last_lines: Vec<String>) -> Self {
        Self {
            target_name: key.target_id.clone(),
            target_id: key.target_id.clone(),
            job_id: key.job_id.clone(),
            org_id: key.org_id.clone(),
            exit_code,
            kind: Self::CRASH_KIND.to_string(),
            last_lines,
            created_at: Utc::now(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TargetRecord {
    pub target_name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub target_id: String,
    pub org_id: String,
    pub engine: EngineKind,
    #[serde(rename = "type")]
    pub run_type: RunType,
    #[serde(default)]
    pub args: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// A freshly created job, waiting for an agent to pick it up.
    pub fn queued(key: &JobKey, engine: EngineKind, run_type: RunType, args: String) -> Self {
        Self {
            target_id: key.target_id.clone(),
            org_id: key.org_id.clone(),
            engine,
            run_type,
            args,
            status: JobStatus::Queued,
            created_at: Utc::now(),
            updated_at: None,
        }
    }
}

/// The remote document store that owns job status and crash records.
///
/// Implementations are used through `&self`; a session issues at most one
/// call at a time.
#[allow(async_fn_in_trait)]
pub trait ControlPlane {
    /// Re-validates the credential before a batch of calls.
    async fn refresh_auth(&self) -> Result<(), ControlPlaneError>;

    async fn job_status(&self, key: &JobKey) -> Result<JobStatus, ControlPlaneError>;

    async fn update_job_status(
        &self,
        key: &JobKey,
        status: &JobStatus,
    ) -> Result<(), ControlPlaneError>;

    async fn add_crash(
        &self,
        key: &JobKey,
        crash_id: &str,
        record: &CrashRecord,
    ) -> Result<(), ControlPlaneError>;
}

/// Random identifier in the shape of an auto-generated document id.
pub fn new_document_id() -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(DOCUMENT_ID_LEN)
        .map(char::from)
        .collect()
}

/// A control plane backed by JSON files.
///
/// A document at `orgs/acme/targets/parser` lives in
/// `<root>/orgs/acme/targets/parser.json`, and its sub-collections are
/// directories next to it, so the resource paths match the hosted service.
#[derive(Debug, Clone)]
pub struct FileControlPlane {
    root: PathBuf,
    api_key: Option<String>,
}

impl FileControlPlane {
    pub fn new(root: impl Into<PathBuf>, api_key: Option<String>) -> Self {
        Self {
            root: root.into(),
            api_key,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn document_file(&self, path: &str) -> PathBuf {
        self.root.join(format!("{path}.json"))
    }

    async fn read_document<T: DeserializeOwned>(&self, path: &str) -> Result<T, ControlPlaneError> {
        let file = self.document_file(path);
        let bytes = match tokio::fs::read(&file).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(ControlPlaneError::NotFound(path.to_string()));
            }
            Err(source) => return Err(ControlPlaneError::Io { path: file, source }),
        };
        serde_json::from_slice(&bytes).map_err(|source| ControlPlaneError::Serialization {
            path: path.to_string(),
            source,
        })
    }

    /// Writes through a sibling temp file and a rename, so readers never see
    /// a partial document.
    async fn write_document<T: Serialize>(
        &self,
        path: &str,
        value: &T,
    ) -> Result<(), ControlPlaneError> {
        let file = self.document_file(path);
        let bytes =
            serde_json::to_vec_pretty(value).map_err(|source| ControlPlaneError::Serialization {
                path: path.to_string(),
                source,
            })?;
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| ControlPlaneError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        let tmp = file.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|source| ControlPlaneError::Io {
                path: tmp.clone(),
                source,
            })?;
        tokio::fs::rename(&tmp, &file)
            .await
            .map_err(|source| ControlPlaneError::Io { path: file, source })?;
        debug!("Wrote document {path}");
        Ok(())
    }

    async fn document_exists(&self, path: &str) -> bool {
        tokio::fs::try_exists(self.document_file(path))
            .await
            .unwrap_or(false)
    }

    pub async fn create_target(
        &self,
        org_id: &str,
        target_name: &str,
    ) -> Result<TargetRecord, ControlPlaneError> {
        check_segment(target_name)?;
        let path = format!("orgs/{org_id}/targets/{target_name}");
        if self.document_exists(&path).await {
            return Err(ControlPlaneError::AlreadyExists(path));
        }
        let record = TargetRecord {
            target_name: target_name.to_string(),
            created_at: Utc::now(),
        };
        self.write_document(&path, &record).await?;
        Ok(record)
    }

    /// Stores a new job document. The target has to exist.
    pub async fn create_job(
        &self,
        key: &JobKey,
        record: &JobRecord,
    ) -> Result<(), ControlPlaneError> {
        let target_path = format!("orgs/{}/targets/{}", key.org_id, key.target_id);
        if !self.document_exists(&target_path).await {
            return Err(ControlPlaneError::NotFound(target_path));
        }
        self.write_document(&key.document_path(), record).await
    }

    /// Reads a resource relative to `orgs/{org_id}/`.
    ///
    /// An even number of path segments names a document and yields exactly
    /// one value; an odd number names a collection and yields each of its
    /// documents with an added `id` field.
    pub async fn get_resource(
        &self,
        org_id: &str,
        resource: &str,
    ) -> Result<Vec<serde_json::Value>, ControlPlaneError> {
        let resource = resource.trim_matches('/');
        let segments: Vec<&str> = resource.split('/').collect();
        for segment in &segments {
            check_segment(segment)
                .map_err(|_| ControlPlaneError::InvalidResource(resource.to_string()))?;
        }
        let path = format!("orgs/{org_id}/{resource}");

        if segments.len() % 2 == 0 {
            let doc: serde_json::Value = self.read_document(&path).await?;
            return Ok(vec![doc]);
        }

        let dir = self.root.join(&path);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(ControlPlaneError::NotFound(resource.to_string()));
            }
            Err(source) => return Err(ControlPlaneError::Io { path: dir, source }),
        };
        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|source| ControlPlaneError::Io {
                path: dir.clone(),
                source,
            })?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(id) = name.strip_suffix(".json") {
                ids.push(id.to_string());
            }
        }
        ids.sort();

        let mut docs = Vec::with_capacity(ids.len());
        for id in ids {
            let mut doc: serde_json::Value = self.read_document(&format!("{path}/{id}")).await?;
            if let serde_json::Value::Object(map) = &mut doc {
                map.insert("id".to_string(), serde_json::Value::String(id));
            }
            docs.push(doc);
        }
        if docs.is_empty() {
            return Err(ControlPlaneError::NotFound(resource.to_string()));
        }
        Ok(docs)
    }
}

fn check_segment(segment: &str) -> Result<(), ControlPlaneError> {
    if segment.is_empty() || segment == "." || segment == ".." || segment.contains(['/', '\\']) {
        return Err(ControlPlaneError::InvalidResource(segment.to_string()));
    }
    Ok(())
}

impl ControlPlane for FileControlPlane {
    /// Accepts any credential unless the root holds an `api_keys` file, in
    /// which case the configured key has to be listed in it.
    async fn refresh_auth(&self) -> Result<(), ControlPlaneError> {
        let keys_file = self.root.join(API_KEYS_FILE);
        let keys = match tokio::fs::read_to_string(&keys_file).await {
            Ok(keys) => keys,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(source) => {
                return Err(ControlPlaneError::Io {
                    path: keys_file,
                    source,
                });
            }
        };
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(ControlPlaneError::PermissionDenied(
                "no API key configured".to_string(),
            ));
        };
        if keys.lines().map(str::trim).any(|k| k == api_key) {
            Ok(())
        } else {
            Err(ControlPlaneError::PermissionDenied(
                "API key is not valid".to_string(),
            ))
        }
    }

    async fn job_status(&self, key: &JobKey) -> Result<JobStatus, ControlPlaneError> {
        let record: JobRecord = self.read_document(&key.document_path()).await?;
        Ok(record.status)
    }

    async fn update_job_status(
        &self,
        key: &JobKey,
        status: &JobStatus,
    ) -> Result<(), ControlPlaneError> {
        let path = key.document_path();
        let mut record: JobRecord = self.read_document(&path).await?;
        record.status = status.clone();
        record.updated_at = Some(Utc::now());
        self.write_document(&path, &record).await
    }

    async fn add_crash(
        &self,
        key: &JobKey,
        crash_id: &str,
        record: &CrashRecord,
    ) -> Result<(), ControlPlaneError> {
        check_segment(crash_id)?;
        let path = format!("{}/crashes/{crash_id}", key.document_path());
        self.write_document(&path, record).await
    }
}
