use crate::classify::{RunOutcome, classify};
use crate::control::{ControlPlane, CrashRecord};
use crate::corpus::{self, merge_corpus};
use crate::engine::EngineSettings;
use crate::error::WardenError;
use crate::job::{EngineKind, FuzzJob, JobStatus, RunType};
use crate::poller::{DEFAULT_POLL_INTERVAL, JobStatusPoller, PollVerdict};
use crate::process::{EngineProcess, ExitReport, OUTPUT_TAIL_LINES};
use crate::storage::{self, ObjectStore, StorageError, paths};
use crate::workspace::Workspace;
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub poll_interval: Duration,
    /// How often a running go-fuzz session re-uploads its workdir and corpus.
    pub go_fuzz_upload_interval: Duration,
    pub engine: EngineSettings,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            go_fuzz_upload_interval: Duration::from_secs(3600),
            engine: EngineSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotStarted,
    EngineRunning,
    PollingForCancel,
    MergingCorpus,
    Terminal,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::NotStarted => "not started",
            SessionState::EngineRunning => "engine running",
            SessionState::PollingForCancel => "polling for cancel",
            SessionState::MergingCorpus => "merging corpus",
            SessionState::Terminal => "terminal",
        };
        f.write_str(s)
    }
}

/// How a session ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The engine finished and the outcome was reported.
    Completed(RunOutcome),
    /// The job was moved out of "in progress" elsewhere; nothing was reported.
    Cancelled,
}

/// Supervises one fuzzing job from preparation to its final status.
///
/// Exactly one engine process and one poll deadline are live at any time.
/// Status transitions, crash records and uploads are only sent when the job
/// has remote updates enabled.
pub struct Session<'a, C, S> {
    pub(crate) job: FuzzJob,
    pub(crate) workspace: Workspace,
    pub(crate) settings: SessionSettings,
    pub(crate) control: &'a C,
    pub(crate) store: &'a S,
    state: SessionState,
    known_crashers: HashSet<String>,
    last_workdir_upload: Instant,
}

impl<'a, C: ControlPlane, S: ObjectStore> Session<'a, C, S> {
    pub fn new(
        job: FuzzJob,
        workspace: Workspace,
        settings: SessionSettings,
        control: &'a C,
        store: &'a S,
    ) -> Self {
        Self {
            job,
            workspace,
            settings,
            control,
            store,
            state: SessionState::NotStarted,
            known_crashers: HashSet::new(),
            last_workdir_upload: Instant::now(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn job(&self) -> &FuzzJob {
        &self.job
    }

    pub(crate) fn set_state(&mut self, state: SessionState) {
        debug!("Session state: {} -> {state}", self.state);
        self.state = state;
    }

    /// Marks the job as started and lays out the workspace: fuzzer package,
    /// corpus and seed. A target without a stored corpus or seed yet is fine.
    pub async fn prepare(&mut self) -> Result<(), WardenError> {
        if self.job.remote_updates_enabled() {
            self.control.refresh_auth().await?;
            if self.control.job_status(&self.job.key()).await? == JobStatus::Queued {
                self.transition(JobStatus::InProgress).await?;
            }
        }

        for dir in [
            self.workspace.corpus_dir(),
            self.workspace.seed_dir(),
            self.workspace.additional_corpus_dir(),
        ] {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| WardenError::io(format!("creating {dir:?}"), e))?;
        }

        if !self.job.is_local() {
            info!("Downloading fuzzer");
            storage::install_fuzzer_package(
                self.store,
                &self.job.key(),
                self.job.engine,
                &self.workspace,
            )
            .await?;
        }

        let binary = self.job.engine.target_binary(&self.workspace);
        if !tokio::fs::try_exists(&binary).await.unwrap_or(false) {
            self.transition(JobStatus::Failed).await?;
            return Err(WardenError::MissingEngine(binary));
        }

        let (org, target) = (self.job.org_id.clone(), self.job.target_id.clone());
        self.download_soft(&paths::corpus(&org, &target), &self.workspace.corpus_dir(), "corpus")
            .await?;
        self.download_soft(&paths::seed(&org, &target), &self.workspace.seed_dir(), "seed")
            .await?;

        if self.job.engine == EngineKind::GoFuzz {
            self.prepare_go_fuzz().await?;
        }
        Ok(())
    }

    async fn download_soft(
        &self,
        storage_path: &str,
        dir: &Path,
        what: &str,
    ) -> Result<(), WardenError> {
        match storage::download_and_extract(self.store, storage_path, dir).await {
            Ok(()) => Ok(()),
            Err(StorageError::NotFound(_)) => {
                info!("No {what} yet, continuing");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn prepare_go_fuzz(&mut self) -> Result<(), WardenError> {
        if !self.job.is_local() {
            let workdir_path = paths::go_workdir(&self.job.key());
            let workdir = self.workspace.go_workdir();
            self.download_soft(&workdir_path, &workdir, "go-fuzz workdir")
                .await?;
        }
        for dir in [self.workspace.go_corpus_dir(), self.workspace.go_crashers_dir()] {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| WardenError::io(format!("creating {dir:?}"), e))?;
        }
        corpus::move_entries(&self.workspace.corpus_dir(), &self.workspace.go_corpus_dir()).await?;

        self.known_crashers = crasher_names(&self.workspace).await?.into_iter().collect();
        if !self.known_crashers.is_empty() {
            info!("Resuming run with {} crashers", self.known_crashers.len());
        }
        self.last_workdir_upload = Instant::now();
        Ok(())
    }

    /// Runs the job to its end according to its run type.
    pub async fn run(&mut self) -> Result<SessionEnd, WardenError> {
        match self.job.run_type {
            RunType::Fuzzing => self.run_fuzzing().await,
            RunType::Regression => self.run_regression().await,
        }
    }

    /// The restart loop: run the engine while polling for cancellation;
    /// after every clean exit of a restarting engine, merge and go again.
    pub async fn run_fuzzing(&mut self) -> Result<SessionEnd, WardenError> {
        let extra_args = self.job.extra_args();
        let mut poller = JobStatusPoller::new(
            self.control,
            self.job.key(),
            self.job.remote_updates_enabled(),
            self.settings.poll_interval,
        );

        let (report, last_lines) = loop {
            let invocation = self.job.engine.fuzzing_invocation(
                &self.workspace,
                &self.settings.engine,
                &extra_args,
            );
            self.clear_artifact().await?;
            let mut process = EngineProcess::spawn(&invocation, self.workspace.root())?;
            self.set_state(SessionState::EngineRunning);

            let report = loop {
                tokio::select! {
                    exit = process.wait() => break exit?,
                    verdict = poller.tick() => {
                        self.set_state(SessionState::PollingForCancel);
                        match verdict {
                            Ok(PollVerdict::Continue) => {}
                            Ok(PollVerdict::Cancelled { .. }) => {
                                process.kill().await?;
                                self.set_state(SessionState::Terminal);
                                return Ok(SessionEnd::Cancelled);
                            }
                            Err(e) => return Err(abort(&mut process, e.into()).await),
                        }
                        if self.job.engine == EngineKind::GoFuzz {
                            if let Err(e) = self.sync_go_fuzz().await {
                                return Err(abort(&mut process, e).await);
                            }
                        }
                        self.set_state(SessionState::EngineRunning);
                    }
                }
            };

            info!("Fuzzer {report}");
            if report.success() && self.job.engine.restarts_on_clean_exit() {
                self.set_state(SessionState::MergingCorpus);
                merge_corpus(&self.job, &self.workspace, self.store).await?;
                continue;
            }
            break (report, process.recent_output());
        };

        if self.job.engine == EngineKind::GoFuzz {
            self.upload_new_crashers().await?;
        }
        let outcome = self.finish(report, last_lines).await?;
        Ok(SessionEnd::Completed(outcome))
    }

    /// Reports a finished engine run: crash artifact first, then the status.
    pub(crate) async fn finish(
        &mut self,
        report: ExitReport,
        last_lines: Vec<String>,
    ) -> Result<RunOutcome, WardenError> {
        let exit_code = report.exit_code();
        if self.job.remote_updates_enabled() {
            self.control.refresh_auth().await?;
        }
        self.upload_crash(exit_code, last_lines).await?;
        let outcome = classify(self.job.engine, exit_code);
        info!("Run finished with {outcome} (exit code {exit_code})");
        self.transition(outcome.status()).await?;
        self.set_state(SessionState::Terminal);
        Ok(outcome)
    }

    /// Removes an artifact left behind by an earlier run, so only what the
    /// next engine run writes counts as a crash.
    pub(crate) async fn clear_artifact(&self) -> Result<(), WardenError> {
        corpus::remove_file_if_exists(&self.workspace.artifact()).await
    }

    /// Uploads the crash artifact, if the engine left one, and records it.
    /// Returns the crash id.
    pub(crate) async fn upload_crash(
        &self,
        exit_code: i32,
        last_lines: Vec<String>,
    ) -> Result<Option<String>, WardenError> {
        let artifact = self.workspace.artifact();
        if !tokio::fs::try_exists(&artifact).await.unwrap_or(false) {
            return Ok(None);
        }
        if !self.job.remote_updates_enabled() {
            info!("Crash artifact left at {}", artifact.display());
            return Ok(None);
        }

        let bytes = tokio::fs::read(&artifact)
            .await
            .map_err(|e| WardenError::io(format!("reading {artifact:?}"), e))?;
        let crash_id = format!("{:x}", md5::compute(&bytes));
        let key = self.job.key();
        info!("Uploading crash {crash_id}");
        self.store
            .upload_file(&artifact, &paths::crash(&key, &crash_id))
            .await?;
        let record = CrashRecord::new(&key, exit_code, last_lines);
        self.control.add_crash(&key, &crash_id, &record).await?;
        Ok(Some(crash_id))
    }

    /// Sets the job status, or only logs it when remote updates are off.
    pub(crate) async fn transition(&self, status: JobStatus) -> Result<(), WardenError> {
        if !self.job.remote_updates_enabled() {
            debug!("Not reporting status {status} for a local run");
            return Ok(());
        }
        info!("Job {} -> {status}", self.job.job_id);
        self.control
            .update_job_status(&self.job.key(), &status)
            .await?;
        Ok(())
    }

    async fn sync_go_fuzz(&mut self) -> Result<(), WardenError> {
        self.upload_new_crashers().await?;
        if !self.job.remote_updates_enabled()
            || self.last_workdir_upload.elapsed() < self.settings.go_fuzz_upload_interval
        {
            return Ok(());
        }

        info!("Uploading go-fuzz workdir");
        storage::archive_and_upload(
            self.store,
            &self.workspace.go_workdir(),
            &paths::go_workdir(&self.job.key()),
        )
        .await?;
        storage::archive_and_upload(
            self.store,
            &self.workspace.go_corpus_dir(),
            &paths::corpus(&self.job.org_id, &self.job.target_id),
        )
        .await?;
        self.last_workdir_upload = Instant::now();
        Ok(())
    }

    /// Each go-fuzz crasher is uploaded once, keyed by its file name.
    async fn upload_new_crashers(&mut self) -> Result<(), WardenError> {
        if !self.job.remote_updates_enabled() {
            return Ok(());
        }
        let key = self.job.key();
        for name in crasher_names(&self.workspace).await? {
            if self.known_crashers.contains(&name) {
                continue;
            }
            let path = self.workspace.go_crashers_dir().join(&name);
            info!("Uploading go-fuzz crasher {name}");
            self.store
                .upload_file(&path, &paths::crash(&key, &name))
                .await?;
            let output = self
                .workspace
                .go_crashers_dir()
                .join(format!("{name}.output"));
            let record = CrashRecord::new(&key, 0, read_tail(&output).await);
            self.control.add_crash(&key, &name, &record).await?;
            self.known_crashers.insert(name);
        }
        Ok(())
    }
}

async fn abort(process: &mut EngineProcess, err: WardenError) -> WardenError {
    if let Err(kill_err) = process.kill().await {
        warn!("Failed to stop fuzzer after error: {kill_err}");
    }
    err
}

/// Reproducer files in the crashers directory. go-fuzz writes a `.output`
/// and a `.quoted` companion next to each one.
async fn crasher_names(workspace: &Workspace) -> Result<Vec<String>, WardenError> {
    Ok(corpus::list_files(&workspace.go_crashers_dir())
        .await?
        .iter()
        .filter_map(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.contains('.'))
        .collect())
}

async fn read_tail(path: &Path) -> Vec<String> {
    let Ok(bytes) = tokio::fs::read(path).await else {
        return Vec::new();
    };
    let text = String::from_utf8_lossy(&bytes);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(OUTPUT_TAIL_LINES);
    lines[start..].iter().map(|l| l.to_string()).collect()
}
