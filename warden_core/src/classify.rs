use crate::job::{EngineKind, JobStatus};
use std::fmt;

/// Exit code libFuzzer uses when `-error_exitcode` is set to it; the merge
/// pass runs with this override, so it reads as a timeout.
pub const LIBFUZZER_TIMEOUT_EXIT_CODE: i32 = 77;
/// Exit code passed through `-error_exitcode` during fuzzing and regression.
/// LeakSanitizer reports land here as well.
pub const LIBFUZZER_LEAK_EXIT_CODE: i32 = 76;
pub const LIBFUZZER_CRASH_EXIT_CODE: i32 = 1;
/// A process killed with SIGKILL, which is how the kernel OOM killer ends it.
pub const LIBFUZZER_OOM_EXIT_CODE: i32 = -9;

/// Zest CLI exits with this code when `--exit-on-crash` fires.
pub const JQF_CRASH_EXIT_CODE: i32 = 3;

pub const SUCCESS_EXIT_CODE: i32 = 0;

/// The semantic result of one engine run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunOutcome {
    Pass,
    Crash,
    Timeout,
    Oom,
    Failed,
}

impl RunOutcome {
    /// The job status the control plane records for this outcome.
    pub fn status(&self) -> JobStatus {
        match self {
            RunOutcome::Pass => JobStatus::Pass,
            RunOutcome::Crash => JobStatus::Crash,
            RunOutcome::Timeout => JobStatus::Timeout,
            RunOutcome::Oom => JobStatus::Oom,
            RunOutcome::Failed => JobStatus::Failed,
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.status().as_str())
    }
}

/// Maps an engine exit code to a [`RunOutcome`].
///
/// Every engine has its own finite table; any code not in the table is
/// [`RunOutcome::Failed`], so every `i32` has exactly one classification.
pub fn classify(engine: EngineKind, exit_code: i32) -> RunOutcome {
    match engine {
        EngineKind::LibFuzzer => match exit_code {
            LIBFUZZER_TIMEOUT_EXIT_CODE => RunOutcome::Timeout,
            LIBFUZZER_LEAK_EXIT_CODE | LIBFUZZER_CRASH_EXIT_CODE => RunOutcome::Crash,
            LIBFUZZER_OOM_EXIT_CODE => RunOutcome::Oom,
            SUCCESS_EXIT_CODE => RunOutcome::Pass,
            _ => RunOutcome::Failed,
        },
        EngineKind::Jqf => match exit_code {
            JQF_CRASH_EXIT_CODE => RunOutcome::Crash,
            SUCCESS_EXIT_CODE => RunOutcome::Pass,
            _ => RunOutcome::Failed,
        },
        // go-fuzz reports findings through its crashers directory, not its exit code.
        EngineKind::GoFuzz => match exit_code {
            SUCCESS_EXIT_CODE => RunOutcome::Pass,
            _ => RunOutcome::Failed,
        },
    }
}
