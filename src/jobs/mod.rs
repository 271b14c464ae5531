//! Replication job inspection
//!
//! The shutdown monitor only needs one question answered: which
//! replication-relevant jobs are running right now? Two backends answer it:
//!
//! - [`MiddlewareInspector`]: the appliance middleware job list (`midclt`)
//! - [`ProcessInspector`]: the process table (`pgrep -f "zfs recv"`), for
//!   hosts on the receiving end of a push replication, where the middleware
//!   does not track the job

pub mod middleware;
pub mod process;

pub use middleware::MiddlewareInspector;
pub use process::ProcessInspector;

use crate::command::CommandError;
use crate::config::{InspectorBackend, InspectorConfig};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Error, Debug)]
pub enum InspectorError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("{program} exited unsuccessfully: {message}")]
    QueryFailed { program: String, message: String },
    #[error("Unparseable job listing: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Unexpected output from {program}: {line:?}")]
    UnexpectedOutput { program: String, line: String },
    #[error("Job query did not return within {0:?}")]
    TimedOut(Duration),
}

/// Identifier of one active replication job
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum JobId {
    /// Middleware job id
    Job(u64),
    /// Process id of a receive process
    Pid(u32),
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobId::Job(id) => write!(f, "job {}", id),
            JobId::Pid(pid) => write!(f, "pid {}", pid),
        }
    }
}

pub type ActiveJobs = BTreeSet<JobId>;

/// Answers "which replication jobs are active right now"
#[async_trait]
pub trait JobInspector: Send + Sync {
    async fn active_replication_jobs(&self) -> Result<ActiveJobs, InspectorError>;
}

/// Outcome of one inspector query
///
/// A failed query carries no job set at all; it is never read as "idle".
#[derive(Debug)]
pub struct PollResult {
    pub at: Instant,
    pub jobs: Result<ActiveJobs, InspectorError>,
}

impl PollResult {
    /// Query `inspector`, giving up after `limit`.
    pub async fn capture(inspector: &dyn JobInspector, limit: Duration) -> Self {
        let jobs = match tokio::time::timeout(limit, inspector.active_replication_jobs()).await {
            Ok(result) => result,
            Err(_) => Err(InspectorError::TimedOut(limit)),
        };
        Self {
            at: Instant::now(),
            jobs,
        }
    }
}

/// Build the inspector selected in config
pub fn from_config(config: &InspectorConfig) -> Box<dyn JobInspector> {
    match config.backend {
        InspectorBackend::Middleware => Box::new(MiddlewareInspector::new(config)),
        InspectorBackend::Process => Box::new(ProcessInspector::new(config)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Hanging;

    #[async_trait]
    impl JobInspector for Hanging {
        async fn active_replication_jobs(&self) -> Result<ActiveJobs, InspectorError> {
            std::future::pending().await
        }
    }

    struct Fixed(Vec<JobId>);

    #[async_trait]
    impl JobInspector for Fixed {
        async fn active_replication_jobs(&self) -> Result<ActiveJobs, InspectorError> {
            Ok(self.0.iter().copied().collect())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_times_out_hanging_query() {
        let poll = PollResult::capture(&Hanging, Duration::from_secs(2)).await;
        assert!(matches!(
            poll.jobs,
            Err(InspectorError::TimedOut(d)) if d == Duration::from_secs(2)
        ));
    }

    #[tokio::test]
    async fn test_capture_passes_jobs_through() {
        let inspector = Fixed(vec![JobId::Job(7), JobId::Pid(42)]);
        let poll = PollResult::capture(&inspector, Duration::from_secs(2)).await;
        let jobs = poll.jobs.unwrap();
        assert_eq!(jobs.len(), 2);
        assert!(jobs.contains(&JobId::Job(7)));
    }

    #[test]
    fn test_job_id_display() {
        assert_eq!(JobId::Job(12).to_string(), "job 12");
        assert_eq!(JobId::Pid(4242).to_string(), "pid 4242");
    }
}
