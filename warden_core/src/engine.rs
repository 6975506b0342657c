use crate::classify::{LIBFUZZER_LEAK_EXIT_CODE, LIBFUZZER_TIMEOUT_EXIT_CODE};
use crate::error::WardenError;
use crate::job::{EngineKind, RunType};
use crate::workspace::Workspace;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where the engine binaries live and how long one engine run may fuzz.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub max_total_time: Duration,
    pub java: PathBuf,
    pub zest_jar: PathBuf,
    pub go_fuzz: PathBuf,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_total_time: Duration::from_secs(3600),
            java: PathBuf::from("java"),
            zest_jar: PathBuf::from("zest-cli.jar"),
            go_fuzz: PathBuf::from("./go-fuzz"),
        }
    }
}

/// A fully resolved engine command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineInvocation {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl fmt::Display for EngineInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

impl EngineKind {
    /// Whether a clean engine exit means "one slice done, merge and go again"
    /// rather than the end of the session.
    pub fn restarts_on_clean_exit(&self) -> bool {
        match self {
            EngineKind::LibFuzzer | EngineKind::Jqf => true,
            EngineKind::GoFuzz => false,
        }
    }

    /// File name the engine's build goes by, both in the workspace and as
    /// the first entry of a packaged job.
    pub fn binary_name(&self) -> &'static str {
        match self {
            EngineKind::LibFuzzer => "fuzzer",
            EngineKind::Jqf => "fuzzer.jar",
            EngineKind::GoFuzz => "fuzzer.zip",
        }
    }

    /// The file that has to be present in the workspace before the engine can run.
    pub fn target_binary(&self, workspace: &Workspace) -> PathBuf {
        workspace.root().join(self.binary_name())
    }

    pub fn fuzzing_invocation(
        &self,
        workspace: &Workspace,
        settings: &EngineSettings,
        extra_args: &[String],
    ) -> EngineInvocation {
        let (program, mut args) = match self {
            EngineKind::LibFuzzer => (
                workspace.fuzzer(),
                vec![
                    "-print_final_stats=1".to_string(),
                    format!("-exact_artifact_path={}", path_arg(&workspace.artifact())),
                    format!("-error_exitcode={LIBFUZZER_LEAK_EXIT_CODE}"),
                    format!("-max_total_time={}", settings.max_total_time.as_secs()),
                    path_arg(&workspace.corpus_dir()),
                    path_arg(&workspace.additional_corpus_dir()),
                    path_arg(&workspace.seed_dir()),
                ],
            ),
            EngineKind::Jqf => (
                settings.java.clone(),
                vec![
                    "-jar".to_string(),
                    path_arg(&settings.zest_jar),
                    "--exit-on-crash".to_string(),
                    format!("--exact-crash-path={}", path_arg(&workspace.artifact())),
                    "--libfuzzer-compat-output".to_string(),
                    path_arg(&workspace.fuzzer_jar()),
                ],
            ),
            EngineKind::GoFuzz => (
                settings.go_fuzz.clone(),
                vec![
                    format!("-workdir={}", path_arg(&workspace.go_workdir())),
                    "-procs=1".to_string(),
                    format!("-bin={}", path_arg(&workspace.fuzzer_zip())),
                ],
            ),
        };
        args.extend(extra_args.iter().cloned());
        EngineInvocation { program, args }
    }

    /// One-shot run over an explicit list of inputs. Only libFuzzer supports it.
    pub fn regression_invocation(
        &self,
        workspace: &Workspace,
        files: &[PathBuf],
        extra_args: &[String],
    ) -> Result<EngineInvocation, WardenError> {
        match self {
            EngineKind::LibFuzzer => {
                let mut args = vec![
                    "-print_final_stats=1".to_string(),
                    format!("-exact_artifact_path={}", path_arg(&workspace.artifact())),
                    format!("-error_exitcode={LIBFUZZER_LEAK_EXIT_CODE}"),
                ];
                args.extend(files.iter().map(|f| path_arg(f)));
                args.extend(extra_args.iter().cloned());
                Ok(EngineInvocation {
                    program: workspace.fuzzer(),
                    args,
                })
            }
            other => Err(WardenError::Unsupported {
                engine: other.to_string(),
                run_type: RunType::Regression.to_string(),
            }),
        }
    }

    /// Corpus minimisation pass writing into the merge directory, if the
    /// engine has one.
    pub fn merge_invocation(&self, workspace: &Workspace) -> Option<EngineInvocation> {
        match self {
            EngineKind::LibFuzzer => Some(EngineInvocation {
                program: workspace.fuzzer(),
                args: vec![
                    "-print_final_stats=1".to_string(),
                    format!("-exact_artifact_path={}", path_arg(&workspace.artifact())),
                    format!("-error_exitcode={LIBFUZZER_TIMEOUT_EXIT_CODE}"),
                    format!(
                        "-merge_control_file={}",
                        path_arg(&workspace.merge_control_file())
                    ),
                    "-merge=1".to_string(),
                    path_arg(&workspace.merge_dir()),
                    path_arg(&workspace.corpus_dir()),
                ],
            }),
            EngineKind::Jqf | EngineKind::GoFuzz => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ws() -> Workspace {
        Workspace::new("/work")
    }

    #[test]
    fn libfuzzer_fuzzing_args_put_user_args_last() {
        let extra = vec!["-max_len=128".to_string()];
        let inv = EngineKind::LibFuzzer.fuzzing_invocation(&ws(), &EngineSettings::default(), &extra);
        assert_eq!(inv.program, PathBuf::from("/work/fuzzer"));
        assert_eq!(
            inv.args,
            vec![
                "-print_final_stats=1",
                "-exact_artifact_path=/work/artifact",
                "-error_exitcode=76",
                "-max_total_time=3600",
                "/work/corpus",
                "/work/additional-corpus",
                "/work/seed",
                "-max_len=128",
            ]
        );
    }

    #[test]
    fn target_binary_is_named_after_engine() {
        assert_eq!(EngineKind::LibFuzzer.target_binary(&ws()), PathBuf::from("/work/fuzzer"));
        assert_eq!(EngineKind::Jqf.target_binary(&ws()), ws().fuzzer_jar());
        assert_eq!(EngineKind::GoFuzz.target_binary(&ws()), ws().fuzzer_zip());
    }

    #[test]
    fn max_total_time_follows_settings() {
        let settings = EngineSettings {
            max_total_time: Duration::from_secs(90),
            ..EngineSettings::default()
        };
        let inv = EngineKind::LibFuzzer.fuzzing_invocation(&ws(), &settings, &[]);
        assert!(inv.args.contains(&"-max_total_time=90".to_string()));
    }

    #[test]
    fn jqf_runs_through_java_and_zest() {
        let inv = EngineKind::Jqf.fuzzing_invocation(&ws(), &EngineSettings::default(), &[]);
        assert_eq!(inv.program, PathBuf::from("java"));
        assert_eq!(&inv.args[..3], &["-jar", "zest-cli.jar", "--exit-on-crash"]);
        assert!(inv.args.contains(&"--exact-crash-path=/work/artifact".to_string()));
        assert_eq!(inv.args.last().unwrap(), "/work/fuzzer.jar");
    }

    #[test]
    fn go_fuzz_uses_workdir_and_zip() {
        let extra = vec!["-timeout=20".to_string()];
        let inv = EngineKind::GoFuzz.fuzzing_invocation(&ws(), &EngineSettings::default(), &extra);
        assert_eq!(inv.program, PathBuf::from("./go-fuzz"));
        assert_eq!(
            inv.args,
            vec!["-workdir=/work/workdir", "-procs=1", "-bin=/work/fuzzer.zip", "-timeout=20"]
        );
    }

    #[test]
    fn regression_lists_files_before_user_args() {
        let files = vec![PathBuf::from("/work/corpus/a"), PathBuf::from("/work/seed/b")];
        let extra = vec!["-runs=1".to_string()];
        let inv = EngineKind::LibFuzzer
            .regression_invocation(&ws(), &files, &extra)
            .unwrap();
        assert_eq!(
            inv.args,
            vec![
                "-print_final_stats=1",
                "-exact_artifact_path=/work/artifact",
                "-error_exitcode=76",
                "/work/corpus/a",
                "/work/seed/b",
                "-runs=1",
            ]
        );
    }

    #[test]
    fn regression_is_unsupported_outside_libfuzzer() {
        let err = EngineKind::Jqf
            .regression_invocation(&ws(), &[], &[])
            .unwrap_err();
        assert!(matches!(err, WardenError::Unsupported { .. }));
        assert!(EngineKind::GoFuzz.regression_invocation(&ws(), &[], &[]).is_err());
    }

    #[test]
    fn only_libfuzzer_has_a_merge_mode() {
        let inv = EngineKind::LibFuzzer.merge_invocation(&ws()).unwrap();
        assert!(inv.args.contains(&"-merge=1".to_string()));
        assert!(inv.args.contains(&"-error_exitcode=77".to_string()));
        assert_eq!(
            &inv.args[inv.args.len() - 2..],
            &["/work/merge", "/work/corpus"]
        );
        assert!(EngineKind::Jqf.merge_invocation(&ws()).is_none());
        assert!(EngineKind::GoFuzz.merge_invocation(&ws()).is_none());
    }

    #[test]
    fn invocation_displays_as_command_line() {
        let inv = EngineInvocation {
            program: PathBuf::from("./fuzzer"),
            args: vec!["-runs=0".to_string(), "corpus".to_string()],
        };
        assert_eq!(inv.to_string(), "./fuzzer -runs=0 corpus");
    }
}
