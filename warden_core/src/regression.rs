use crate::classify::RunOutcome;
use crate::control::ControlPlane;
use crate::corpus::list_files;
use crate::error::WardenError;
use crate::job::JobStatus;
use crate::process::run_to_completion;
use crate::session::{Session, SessionEnd, SessionState};
use crate::storage::ObjectStore;
use tracing::info;

impl<C: ControlPlane, S: ObjectStore> Session<'_, C, S> {
    /// Runs the engine once over every stored input.
    ///
    /// With remote updates off, a failing run is returned as
    /// [`WardenError::EngineFailed`] so the caller's exit code reflects it.
    pub async fn run_regression(&mut self) -> Result<SessionEnd, WardenError> {
        let mut files = Vec::new();
        for dir in [
            self.workspace.corpus_dir(),
            self.workspace.seed_dir(),
            self.workspace.additional_corpus_dir(),
        ] {
            files.extend(list_files(&dir).await?);
        }

        let invocation =
            self.job
                .engine
                .regression_invocation(&self.workspace, &files, &self.job.extra_args())?;

        if files.is_empty() {
            info!("No inputs to run, regression passes");
            self.transition(JobStatus::Pass).await?;
            self.set_state(SessionState::Terminal);
            return Ok(SessionEnd::Completed(RunOutcome::Pass));
        }

        info!("Running regression over {} inputs", files.len());
        self.clear_artifact().await?;
        self.set_state(SessionState::EngineRunning);
        let (report, last_lines) = run_to_completion(&invocation, self.workspace.root()).await?;
        if !report.success() && !self.job.remote_updates_enabled() {
            self.set_state(SessionState::Terminal);
            return Err(WardenError::EngineFailed(report));
        }

        let outcome = self.finish(report, last_lines).await?;
        Ok(SessionEnd::Completed(outcome))
    }
}

#[cfg(test)]
mod tests {
    use crate::classify::RunOutcome;
    use crate::error::WardenError;
    use crate::job::{EngineKind, FuzzJob, JobStatus, RunType};
    use crate::session::{Session, SessionEnd, SessionSettings};
    use crate::testing::{MemoryObjectStore, ScriptedControlPlane, write_script};
    use crate::workspace::Workspace;
    use std::fs;
    use tempfile::tempdir;

    fn job(job_id: &str, update_db: bool) -> FuzzJob {
        FuzzJob {
            org_id: "acme".to_string(),
            target_id: "parser".to_string(),
            job_id: job_id.to_string(),
            engine: EngineKind::LibFuzzer,
            run_type: RunType::Regression,
            args: String::new(),
            update_db,
        }
    }

    #[tokio::test]
    async fn empty_input_set_passes_without_running_engine() {
        let dir = tempdir().unwrap();
        let workspace = Workspace::new(dir.path());
        write_script(&workspace.fuzzer(), "touch ran; exit 1");
        let control = ScriptedControlPlane::new();
        let store = MemoryObjectStore::new();
        let mut session = Session::new(
            job("job1", true),
            workspace.clone(),
            SessionSettings::default(),
            &control,
            &store,
        );

        let end = session.run().await.unwrap();
        assert_eq!(end, SessionEnd::Completed(RunOutcome::Pass));
        assert_eq!(control.transitions(), vec![JobStatus::Pass]);
        assert!(!workspace.root().join("ran").exists());
    }

    #[tokio::test]
    async fn local_failure_is_returned_without_control_calls() {
        let dir = tempdir().unwrap();
        let workspace = Workspace::new(dir.path());
        fs::create_dir_all(workspace.seed_dir()).unwrap();
        fs::write(workspace.seed_dir().join("s1"), b"leak").unwrap();
        write_script(&workspace.fuzzer(), "printf leak > artifact; exit 76");
        let control = ScriptedControlPlane::new();
        let store = MemoryObjectStore::new();
        let mut session = Session::new(
            job("", false),
            workspace,
            SessionSettings::default(),
            &control,
            &store,
        );

        let err = session.run().await.unwrap_err();
        match err {
            WardenError::EngineFailed(report) => assert_eq!(report.exit_code(), 76),
            other => panic!("expected EngineFailed, got {other:?}"),
        }
        assert!(control.calls().is_empty());
        assert!(store.uploads().is_empty());
    }

    #[tokio::test]
    async fn remote_failure_is_classified_and_reported() {
        let dir = tempdir().unwrap();
        let workspace = Workspace::new(dir.path());
        fs::create_dir_all(workspace.corpus_dir().join("nested")).unwrap();
        fs::write(workspace.corpus_dir().join("nested/c1"), b"c").unwrap();
        fs::create_dir_all(workspace.additional_corpus_dir()).unwrap();
        fs::write(workspace.additional_corpus_dir().join("a1"), b"a").unwrap();
        write_script(
            &workspace.fuzzer(),
            r#"echo "$@" > args.txt; printf boom > artifact; exit 1"#,
        );
        let control = ScriptedControlPlane::new();
        let store = MemoryObjectStore::new();
        let mut session = Session::new(
            job("job1", true),
            workspace.clone(),
            SessionSettings::default(),
            &control,
            &store,
        );

        let end = session.run().await.unwrap();
        assert_eq!(end, SessionEnd::Completed(RunOutcome::Crash));
        assert_eq!(control.transitions(), vec![JobStatus::Crash]);
        assert_eq!(control.crashes().len(), 1);
        assert_eq!(control.crashes()[0].1.exit_code, 1);

        let args = fs::read_to_string(workspace.root().join("args.txt")).unwrap();
        assert!(args.contains("nested/c1"), "got: {args}");
        assert!(args.contains("additional-corpus/a1"), "got: {args}");
        assert!(!args.contains("-max_total_time"), "got: {args}");
    }

    #[tokio::test]
    async fn remote_clean_run_passes_despite_leftover_artifact() {
        let dir = tempdir().unwrap();
        let workspace = Workspace::new(dir.path());
        fs::create_dir_all(workspace.seed_dir()).unwrap();
        fs::write(workspace.seed_dir().join("s1"), b"ok").unwrap();
        fs::write(workspace.artifact(), b"from last week").unwrap();
        write_script(&workspace.fuzzer(), "exit 0");
        let control = ScriptedControlPlane::new();
        let store = MemoryObjectStore::new();
        let mut session = Session::new(
            job("job1", true),
            workspace.clone(),
            SessionSettings::default(),
            &control,
            &store,
        );

        let end = session.run().await.unwrap();
        assert_eq!(end, SessionEnd::Completed(RunOutcome::Pass));
        assert_eq!(control.transitions(), vec![JobStatus::Pass]);
        assert!(control.crashes().is_empty());
        assert!(store.uploads().is_empty());
        assert!(!workspace.artifact().exists());
    }

    #[tokio::test]
    async fn other_engines_do_not_support_regression() {
        let dir = tempdir().unwrap();
        let control = ScriptedControlPlane::new();
        let store = MemoryObjectStore::new();
        let mut j = job("job1", true);
        j.engine = EngineKind::Jqf;
        let mut session = Session::new(
            j,
            Workspace::new(dir.path()),
            SessionSettings::default(),
            &control,
            &store,
        );

        let err = session.run().await.unwrap_err();
        assert!(matches!(err, WardenError::Unsupported { .. }), "got: {err}");
        assert!(control.calls().is_empty());
    }
}
