use crate::error::WardenError;
use crate::job::FuzzJob;
use crate::process::run_to_completion;
use crate::storage::{self, ObjectStore};
use crate::workspace::Workspace;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;

/// What [`merge_corpus`] ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The corpus was empty; nothing ran and nothing was uploaded.
    Skipped,
    Merged { uploaded: bool },
}

/// All regular files below `dir`, sorted. A missing directory has no files.
pub async fn list_files(dir: &Path) -> Result<Vec<PathBuf>, WardenError> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(WardenError::io(format!("reading {dir:?}"), e)),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| WardenError::io(format!("reading entry in {dir:?}"), e))?
        {
            let path = entry.path();
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| WardenError::io(format!("inspecting {path:?}"), e))?;
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

/// True when `dir` is missing or has no entries at all.
pub async fn is_dir_empty(dir: &Path) -> Result<bool, WardenError> {
    match fs::read_dir(dir).await {
        Ok(mut entries) => Ok(entries
            .next_entry()
            .await
            .map_err(|e| WardenError::io(format!("reading {dir:?}"), e))?
            .is_none()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(true),
        Err(e) => Err(WardenError::io(format!("reading {dir:?}"), e)),
    }
}

/// Removes `dir` with everything in it and recreates it empty.
pub async fn reset_dir(dir: &Path) -> Result<(), WardenError> {
    remove_dir_if_exists(dir).await?;
    fs::create_dir_all(dir)
        .await
        .map_err(|e| WardenError::io(format!("creating {dir:?}"), e))
}

async fn remove_dir_if_exists(dir: &Path) -> Result<(), WardenError> {
    match fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(WardenError::io(format!("removing {dir:?}"), e)),
    }
}

pub(crate) async fn remove_file_if_exists(file: &Path) -> Result<(), WardenError> {
    match fs::remove_file(file).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(WardenError::io(format!("removing {file:?}"), e)),
    }
}

/// Swaps `dest` for `src`: `dest` is removed, then `src` is renamed onto it.
pub async fn replace_dir(src: &Path, dest: &Path) -> Result<(), WardenError> {
    remove_dir_if_exists(dest).await?;
    fs::rename(src, dest)
        .await
        .map_err(|e| WardenError::io(format!("renaming {src:?} to {dest:?}"), e))
}

/// Moves every top-level entry of `src` into `dest`.
pub async fn move_entries(src: &Path, dest: &Path) -> Result<usize, WardenError> {
    let mut entries = match fs::read_dir(src).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(WardenError::io(format!("reading {src:?}"), e)),
    };
    let mut moved = 0;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| WardenError::io(format!("reading entry in {src:?}"), e))?
    {
        let target = dest.join(entry.file_name());
        fs::rename(entry.path(), &target)
            .await
            .map_err(|e| WardenError::io(format!("moving {:?} to {target:?}", entry.path()), e))?;
        moved += 1;
    }
    Ok(moved)
}

/// Minimises the workspace corpus with the engine's merge mode and uploads it.
///
/// Skipped entirely when the corpus is empty. For engines without a merge
/// mode the corpus is uploaded as it is. The merge output replaces the
/// corpus directory before anything is archived, so the upload always
/// sees the finished corpus. Uploading only happens when the job reports
/// to the remote side.
pub async fn merge_corpus<S: ObjectStore>(
    job: &FuzzJob,
    workspace: &Workspace,
    store: &S,
) -> Result<MergeOutcome, WardenError> {
    let corpus_dir = workspace.corpus_dir();
    if is_dir_empty(&corpus_dir).await? {
        info!("Corpus is empty, skipping merge");
        return Ok(MergeOutcome::Skipped);
    }

    if let Some(invocation) = job.engine.merge_invocation(workspace) {
        let merge_dir = workspace.merge_dir();
        reset_dir(&merge_dir).await?;
        remove_file_if_exists(&workspace.merge_control_file()).await?;

        let (report, _) = run_to_completion(&invocation, workspace.root()).await?;
        if !report.success() {
            return Err(WardenError::MergeFailed(report));
        }
        replace_dir(&merge_dir, &corpus_dir).await?;
        info!("Corpus merged");
    }

    if !job.remote_updates_enabled() {
        return Ok(MergeOutcome::Merged { uploaded: false });
    }
    storage::archive_and_upload(
        store,
        &corpus_dir,
        &storage::paths::corpus(&job.org_id, &job.target_id),
    )
    .await?;
    Ok(MergeOutcome::Merged { uploaded: true })
}
