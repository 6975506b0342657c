use crate::error::WardenError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The fuzzing engines a session knows how to drive.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "kebab-case")]
pub enum EngineKind {
    /// Coverage-guided binary fuzzer (libFuzzer).
    #[default]
    LibFuzzer,
    /// JVM fuzzer driven through the Zest CLI.
    Jqf,
    /// Go-native fuzzer (go-fuzz).
    GoFuzz,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::LibFuzzer => "libfuzzer",
            EngineKind::Jqf => "jqf",
            EngineKind::GoFuzz => "go-fuzz",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineKind {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "libfuzzer" => Ok(EngineKind::LibFuzzer),
            "jqf" => Ok(EngineKind::Jqf),
            "go-fuzz" => Ok(EngineKind::GoFuzz),
            other => Err(WardenError::InvalidJob(format!(
                "engine should be one of libfuzzer, jqf, go-fuzz. Received: {other}"
            ))),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RunType {
    #[default]
    Fuzzing,
    Regression,
}

impl RunType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunType::Fuzzing => "fuzzing",
            RunType::Regression => "regression",
        }
    }
}

impl fmt::Display for RunType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunType {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fuzzing" => Ok(RunType::Fuzzing),
            "regression" => Ok(RunType::Regression),
            other => Err(WardenError::InvalidJob(format!(
                "--type should be either fuzzing or regression. Received: {other}"
            ))),
        }
    }
}

/// Status of a job as stored in the control plane.
///
/// Any value the control plane holds that is not one of the known states is
/// kept verbatim in [`JobStatus::Other`]; the poller treats it like every
/// other non-running status.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(from = "String", into = "String")]
pub enum JobStatus {
    Queued,
    InProgress,
    Pass,
    Crash,
    Timeout,
    Oom,
    Failed,
    Other(String),
}

impl JobStatus {
    pub fn as_str(&self) -> &str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::InProgress => "in progress",
            JobStatus::Pass => "pass",
            JobStatus::Crash => "crash",
            JobStatus::Timeout => "timeout",
            JobStatus::Oom => "oom",
            JobStatus::Failed => "failed",
            JobStatus::Other(s) => s,
        }
    }
}

impl From<String> for JobStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "queued" => JobStatus::Queued,
            "in progress" => JobStatus::InProgress,
            "pass" => JobStatus::Pass,
            "crash" => JobStatus::Crash,
            "timeout" => JobStatus::Timeout,
            "oom" => JobStatus::Oom,
            "failed" => JobStatus::Failed,
            _ => JobStatus::Other(s),
        }
    }
}

impl From<JobStatus> for String {
    fn from(status: JobStatus) -> Self {
        status.as_str().to_string()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Locates one job document in the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobKey {
    pub org_id: String,
    pub target_id: String,
    pub job_id: String,
}

impl JobKey {
    pub fn document_path(&self) -> String {
        format!(
            "orgs/{}/targets/{}/jobs/{}",
            self.org_id, self.target_id, self.job_id
        )
    }
}

/// One supervised session, built by the entry point and never mutated
/// afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuzzJob {
    pub org_id: String,
    pub target_id: String,
    /// Empty for a purely local run.
    pub job_id: String,
    pub engine: EngineKind,
    pub run_type: RunType,
    /// Free-form, space separated arguments appended to the engine command line.
    pub args: String,
    pub update_db: bool,
}

impl FuzzJob {
    pub fn is_local(&self) -> bool {
        self.job_id.is_empty()
    }

    /// Whether status, crash and corpus updates are sent to the remote side.
    pub fn remote_updates_enabled(&self) -> bool {
        self.update_db && !self.is_local()
    }

    pub fn key(&self) -> JobKey {
        JobKey {
            org_id: self.org_id.clone(),
            target_id: self.target_id.clone(),
            job_id: self.job_id.clone(),
        }
    }

    pub fn extra_args(&self) -> Vec<String> {
        split_and_remove_empty(&self.args)
    }
}

/// Splits on single spaces and drops the empty pieces left by repeated ones.
pub fn split_and_remove_empty(s: &str) -> Vec<String> {
    s.split(' ')
        .filter(|piece| !piece.is_empty())
        .map(str::to_string)
        .collect()
}

/// Splits a `[org/]target` reference. More than one `/` is rejected.
pub fn parse_target_ref(reference: &str) -> Result<(Option<String>, String), WardenError> {
    let parts: Vec<&str> = reference.split('/').collect();
    match parts.as_slice() {
        [target] if !target.is_empty() => Ok((None, target.to_string())),
        [org, target] if !org.is_empty() && !target.is_empty() => {
            Ok((Some(org.to_string()), target.to_string()))
        }
        _ => Err(WardenError::InvalidJob(format!(
            "[TARGET] can only be of type 'target' or 'project/target-name'. Received: {reference}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(job_id: &str, update_db: bool) -> FuzzJob {
        FuzzJob {
            org_id: "acme".to_string(),
            target_id: "parser".to_string(),
            job_id: job_id.to_string(),
            engine: EngineKind::LibFuzzer,
            run_type: RunType::Fuzzing,
            args: String::new(),
            update_db,
        }
    }

    #[test]
    fn remote_updates_require_job_id_and_flag() {
        assert!(job("j1", true).remote_updates_enabled());
        assert!(!job("j1", false).remote_updates_enabled());
        assert!(!job("", true).remote_updates_enabled());
        assert!(job("", true).is_local());
    }

    #[test]
    fn extra_args_drop_empty_pieces() {
        let mut j = job("j1", true);
        j.args = "  -max_len=64   -dict=x.dict ".to_string();
        assert_eq!(j.extra_args(), vec!["-max_len=64", "-dict=x.dict"]);
        j.args.clear();
        assert!(j.extra_args().is_empty());
    }

    #[test]
    fn job_status_round_trips_known_and_unknown_values() {
        assert_eq!(JobStatus::from("in progress".to_string()), JobStatus::InProgress);
        assert_eq!(
            JobStatus::from("cancelled".to_string()),
            JobStatus::Other("cancelled".to_string())
        );
        let json = serde_json::to_string(&JobStatus::InProgress).unwrap();
        assert_eq!(json, "\"in progress\"");
        let back: JobStatus = serde_json::from_str("\"timeout\"").unwrap();
        assert_eq!(back, JobStatus::Timeout);
    }

    #[test]
    fn engine_and_run_type_parse_from_cli_names() {
        assert_eq!("go-fuzz".parse::<EngineKind>().unwrap(), EngineKind::GoFuzz);
        assert_eq!("jqf".parse::<EngineKind>().unwrap(), EngineKind::Jqf);
        assert!("afl".parse::<EngineKind>().is_err());
        assert_eq!("regression".parse::<RunType>().unwrap(), RunType::Regression);
        assert!("sanity".parse::<RunType>().is_err());
    }

    #[test]
    fn target_ref_accepts_optional_org() {
        assert_eq!(parse_target_ref("parser").unwrap(), (None, "parser".to_string()));
        assert_eq!(
            parse_target_ref("acme/parser").unwrap(),
            (Some("acme".to_string()), "parser".to_string())
        );
        assert!(parse_target_ref("a/b/c").is_err());
        assert!(parse_target_ref("acme/").is_err());
    }

    #[test]
    fn job_key_builds_document_path() {
        assert_eq!(job("j1", true).key().document_path(), "orgs/acme/targets/parser/jobs/j1");
    }
}
