use crate::job::{EngineKind, JobKey};
use crate::workspace::Workspace;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum StorageError {
    /// Nothing stored at this path yet. Callers decide whether that matters.
    #[error("Object {0} not found")]
    NotFound(String),

    #[error("Permission denied on {0}")]
    PermissionDenied(String),

    #[error("Invalid storage path {0:?}")]
    InvalidPath(String),

    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to pack or unpack archive {path:?}: {source}")]
    Archive {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Blob storage keyed by slash-separated storage paths.
#[allow(async_fn_in_trait)]
pub trait ObjectStore {
    async fn upload_file(&self, local: &Path, storage_path: &str) -> Result<(), StorageError>;

    /// Fails with [`StorageError::NotFound`] when nothing is stored at `storage_path`.
    async fn download_file(&self, storage_path: &str, local: &Path) -> Result<(), StorageError>;
}

/// Storage paths of everything a target or job owns.
pub mod paths {
    use crate::job::JobKey;

    pub fn corpus(org_id: &str, target_id: &str) -> String {
        format!("orgs/{org_id}/targets/{target_id}/corpus.tar.gz")
    }

    pub fn seed(org_id: &str, target_id: &str) -> String {
        format!("orgs/{org_id}/targets/{target_id}/seed")
    }

    pub fn fuzzer(key: &JobKey) -> String {
        format!("{}/fuzzer", key.document_path())
    }

    pub fn crash(key: &JobKey, crash_id: &str) -> String {
        format!("{}/crashes/{crash_id}", key.document_path())
    }

    pub fn go_workdir(key: &JobKey) -> String {
        format!("{}/workdir.tar.gz", key.document_path())
    }
}

/// Object store over a local directory; `orgs/a/b` is stored at `<root>/orgs/a/b`.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, storage_path: &str) -> Result<PathBuf, StorageError> {
        let invalid = storage_path.is_empty()
            || storage_path
                .split('/')
                .any(|s| s.is_empty() || s == "." || s == "..");
        if invalid {
            return Err(StorageError::InvalidPath(storage_path.to_string()));
        }
        Ok(self.root.join(storage_path))
    }
}

fn map_io(storage_path: &str, path: &Path, source: std::io::Error) -> StorageError {
    match source.kind() {
        ErrorKind::NotFound => StorageError::NotFound(storage_path.to_string()),
        ErrorKind::PermissionDenied => StorageError::PermissionDenied(storage_path.to_string()),
        _ => StorageError::io(path, source),
    }
}

async fn ensure_parent(path: &Path) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StorageError::io(parent, e))?;
    }
    Ok(())
}

impl ObjectStore for LocalObjectStore {
    async fn upload_file(&self, local: &Path, storage_path: &str) -> Result<(), StorageError> {
        let object = self.object_path(storage_path)?;
        ensure_parent(&object).await?;
        let tmp = object.with_file_name(format!(
            ".{}.partial",
            object
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        ));
        tokio::fs::copy(local, &tmp)
            .await
            .map_err(|e| StorageError::io(local, e))?;
        tokio::fs::rename(&tmp, &object)
            .await
            .map_err(|e| map_io(storage_path, &object, e))?;
        debug!("Stored {} at {storage_path}", local.display());
        Ok(())
    }

    async fn download_file(&self, storage_path: &str, local: &Path) -> Result<(), StorageError> {
        let object = self.object_path(storage_path)?;
        if !tokio::fs::try_exists(&object).await.unwrap_or(false) {
            return Err(StorageError::NotFound(storage_path.to_string()));
        }
        ensure_parent(local).await?;
        tokio::fs::copy(&object, local)
            .await
            .map_err(|e| map_io(storage_path, &object, e))?;
        Ok(())
    }
}

async fn blocking<T, F>(path: &Path, f: F) -> Result<T, StorageError>
where
    F: FnOnce() -> std::io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let path = path.to_path_buf();
    match tokio::task::spawn_blocking(f).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(source)) => Err(StorageError::Archive { path, source }),
        Err(join) => Err(StorageError::Archive {
            path,
            source: std::io::Error::other(join),
        }),
    }
}

/// Packs the contents of `dir` (not the directory itself) into a tar.gz at `archive`.
pub async fn archive_dir(dir: &Path, archive: &Path) -> Result<(), StorageError> {
    let src = dir.to_path_buf();
    let dest = archive.to_path_buf();
    blocking(archive, move || {
        let encoder = GzEncoder::new(File::create(&dest)?, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.append_dir_all(".", &src)?;
        builder.into_inner()?.finish()?;
        Ok(())
    })
    .await
}

/// Packs individual files into a tar.gz. The first file is stored as
/// `fuzzer_name`, the rest under their own file names.
pub async fn archive_files(
    files: &[PathBuf],
    fuzzer_name: &str,
    archive: &Path,
) -> Result<(), StorageError> {
    let files = files.to_vec();
    let fuzzer_name = PathBuf::from(fuzzer_name);
    let dest = archive.to_path_buf();
    blocking(archive, move || {
        let encoder = GzEncoder::new(File::create(&dest)?, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (i, file) in files.iter().enumerate() {
            let name = if i == 0 {
                fuzzer_name.clone()
            } else {
                file.file_name()
                    .map(PathBuf::from)
                    .ok_or_else(|| std::io::Error::other(format!("{file:?} has no file name")))?
            };
            builder.append_path_with_name(file, name)?;
        }
        builder.into_inner()?.finish()?;
        Ok(())
    })
    .await
}

pub async fn extract_archive(archive: &Path, dir: &Path) -> Result<(), StorageError> {
    let src = archive.to_path_buf();
    let dest = dir.to_path_buf();
    blocking(archive, move || {
        std::fs::create_dir_all(&dest)?;
        let mut unpacker = tar::Archive::new(GzDecoder::new(File::open(&src)?));
        unpacker.set_preserve_permissions(true);
        unpacker.unpack(&dest)
    })
    .await
}

pub async fn archive_and_upload<S: ObjectStore>(
    store: &S,
    dir: &Path,
    storage_path: &str,
) -> Result<(), StorageError> {
    let tmp = tempfile::tempdir().map_err(|e| StorageError::io(std::env::temp_dir(), e))?;
    let archive = tmp.path().join("archive.tar.gz");
    archive_dir(dir, &archive).await?;
    info!("Uploading {} to {storage_path}", dir.display());
    store.upload_file(&archive, storage_path).await
}

pub async fn download_and_extract<S: ObjectStore>(
    store: &S,
    storage_path: &str,
    dir: &Path,
) -> Result<(), StorageError> {
    let tmp = tempfile::tempdir().map_err(|e| StorageError::io(std::env::temp_dir(), e))?;
    let archive = tmp.path().join("archive.tar.gz");
    store.download_file(storage_path, &archive).await?;
    info!("Extracting {storage_path} into {}", dir.display());
    extract_archive(&archive, dir).await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PackageKind {
    Gzip,
    Zip,
    Raw,
}

fn sniff_package(path: &Path) -> std::io::Result<PackageKind> {
    let mut magic = [0u8; 4];
    let mut file = File::open(path)?;
    let n = file.read(&mut magic)?;
    Ok(match &magic[..n] {
        [0x1f, 0x8b, ..] => PackageKind::Gzip,
        [b'P', b'K', 0x03, 0x04] => PackageKind::Zip,
        _ => PackageKind::Raw,
    })
}

/// Downloads the job's fuzzer package and lays it out the way `engine` expects.
///
/// A tar.gz is unpacked into the workspace root, a zip becomes
/// `fuzzer.zip` (go-fuzz) or `fuzzer.jar` (JQF), and anything else is taken
/// as the fuzzer executable itself.
pub async fn install_fuzzer_package<S: ObjectStore>(
    store: &S,
    key: &JobKey,
    engine: EngineKind,
    workspace: &Workspace,
) -> Result<(), StorageError> {
    let tmp = tempfile::tempdir().map_err(|e| StorageError::io(std::env::temp_dir(), e))?;
    let package = tmp.path().join("fuzzer");
    store.download_file(&paths::fuzzer(key), &package).await?;

    let sniff_path = package.clone();
    let kind = blocking(&package, move || sniff_package(&sniff_path)).await?;
    debug!("Fuzzer package is {kind:?}");

    let dest = match kind {
        PackageKind::Gzip => {
            extract_archive(&package, workspace.root()).await?;
            None
        }
        PackageKind::Zip if engine == EngineKind::GoFuzz => Some(workspace.fuzzer_zip()),
        PackageKind::Zip if engine == EngineKind::Jqf => Some(workspace.fuzzer_jar()),
        PackageKind::Zip | PackageKind::Raw => Some(workspace.fuzzer()),
    };
    if let Some(dest) = dest {
        tokio::fs::copy(&package, &dest)
            .await
            .map_err(|e| StorageError::io(&dest, e))?;
    }

    let fuzzer = workspace.fuzzer();
    if tokio::fs::try_exists(&fuzzer).await.unwrap_or(false) {
        make_executable(&fuzzer).await?;
    }
    Ok(())
}

async fn make_executable(path: &Path) -> Result<(), StorageError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o770))
            .await
            .map_err(|e| StorageError::io(path, e))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}
