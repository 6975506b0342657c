use crate::engine::EngineInvocation;
use crate::error::WardenError;
use std::collections::VecDeque;
use std::fmt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How many trailing output lines are kept for crash records.
pub const OUTPUT_TAIL_LINES: usize = 50;
const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// How an engine process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitReport {
    pub fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// The integer the exit classifier works on: the exit code, or the
    /// negated signal number when the process was killed.
    pub fn exit_code(&self) -> i32 {
        match (self.code, self.signal) {
            (Some(code), _) => code,
            (None, Some(signal)) => -signal,
            (None, None) => -1,
        }
    }
}

impl fmt::Display for ExitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exited with code {code}"),
            (None, Some(signal)) => write!(f, "terminated by signal {signal}"),
            (None, None) => f.write_str("exited abnormally"),
        }
    }
}

type OutputTail = Arc<Mutex<VecDeque<String>>>;

/// A live engine subprocess whose stdout and stderr are streamed into the log.
///
/// The child is killed when this handle is dropped, so losing a `select!`
/// race never leaks a running engine.
pub struct EngineProcess {
    child: Child,
    program: String,
    pumps: Vec<JoinHandle<()>>,
    tail: OutputTail,
}

impl EngineProcess {
    pub fn spawn(invocation: &EngineInvocation, cwd: &Path) -> Result<Self, WardenError> {
        let program = invocation.program.to_string_lossy().into_owned();
        info!("Running {invocation}");

        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| WardenError::Launch {
                program: program.clone(),
                source,
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WardenError::StreamAttach(program.clone()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| WardenError::StreamAttach(program.clone()))?;

        let tail: OutputTail = Arc::new(Mutex::new(VecDeque::with_capacity(OUTPUT_TAIL_LINES)));
        let pumps = vec![
            tokio::spawn(pump_lines(stdout, Arc::clone(&tail))),
            tokio::spawn(pump_lines(stderr, Arc::clone(&tail))),
        ];

        Ok(Self {
            child,
            program,
            pumps,
            tail,
        })
    }

    /// Waits for the process to exit and for its output to be fully logged.
    ///
    /// Cancel safe: dropping the future before the child exits leaves the
    /// handle usable.
    pub async fn wait(&mut self) -> Result<ExitReport, WardenError> {
        let status = self.child.wait().await.map_err(|source| WardenError::Wait {
            program: self.program.clone(),
            source,
        })?;
        for pump in self.pumps.drain(..) {
            match tokio::time::timeout(PUMP_DRAIN_TIMEOUT, pump).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Output pump for {} ended abnormally: {e}", self.program),
                // A leftover grandchild still holds the pipe open.
                Err(_) => warn!("Output of {} still open after exit", self.program),
            }
        }
        let report = ExitReport::from_status(status);
        debug!("{} {report}", self.program);
        Ok(report)
    }

    /// Sends SIGKILL and reaps the child. A process that already exited is left alone.
    pub async fn kill(&mut self) -> Result<(), WardenError> {
        if let Ok(Some(_)) = self.child.try_wait() {
            return Ok(());
        }
        info!("Killing {}", self.program);
        self.child.kill().await.map_err(|source| WardenError::Wait {
            program: self.program.clone(),
            source,
        })
    }

    /// The last [`OUTPUT_TAIL_LINES`] lines the process printed, oldest first.
    pub fn recent_output(&self) -> Vec<String> {
        match self.tail.lock() {
            Ok(tail) => tail.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }
}

/// Runs an invocation to the end and returns its exit report with the output tail.
pub async fn run_to_completion(
    invocation: &EngineInvocation,
    cwd: &Path,
) -> Result<(ExitReport, Vec<String>), WardenError> {
    let mut process = EngineProcess::spawn(invocation, cwd)?;
    let report = process.wait().await?;
    Ok((report, process.recent_output()))
}

async fn pump_lines<R>(reader: R, tail: OutputTail)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                info!(target: "warden::engine", "FUZZER: {line}");
                if let Ok(mut tail) = tail.lock() {
                    if tail.len() == OUTPUT_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line.to_string());
                }
            }
            Err(e) => {
                warn!("Error reading engine output: {e}");
                break;
            }
        }
    }
}
