use crate::control::{ControlPlane, ControlPlaneError};
use crate::job::{JobKey, JobStatus};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollVerdict {
    Continue,
    /// The job left "in progress"; the session has to stop without writing status.
    Cancelled { status: JobStatus },
}

/// Periodically re-reads the job record to detect cancellation.
///
/// The poller owns its next deadline, so a [`tick`](Self::tick) future that
/// loses a `select!` race and is recreated waits for the same deadline
/// instead of starting a new period.
pub struct JobStatusPoller<'a, C> {
    control: &'a C,
    key: JobKey,
    updates_enabled: bool,
    period: Duration,
    next_check: Instant,
}

impl<'a, C: ControlPlane> JobStatusPoller<'a, C> {
    pub fn new(control: &'a C, key: JobKey, updates_enabled: bool, period: Duration) -> Self {
        Self {
            control,
            key,
            updates_enabled,
            period,
            next_check: Instant::now() + period,
        }
    }

    /// Sleeps until the next deadline, then checks.
    pub async fn tick(&mut self) -> Result<PollVerdict, ControlPlaneError> {
        tokio::time::sleep_until(self.next_check).await;
        self.check().await
    }

    pub async fn check(&mut self) -> Result<PollVerdict, ControlPlaneError> {
        self.next_check = Instant::now() + self.period;
        if !self.updates_enabled {
            return Ok(PollVerdict::Continue);
        }

        self.control.refresh_auth().await?;
        match self.control.job_status(&self.key).await? {
            JobStatus::InProgress => {
                debug!("Job {} still in progress", self.key.job_id);
                Ok(PollVerdict::Continue)
            }
            status => {
                info!("Job {} is {status}, stopping", self.key.job_id);
                Ok(PollVerdict::Cancelled { status })
            }
        }
    }
}
