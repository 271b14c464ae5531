//! Job inspection through the process table

use super::{ActiveJobs, InspectorError, JobId, JobInspector};
use crate::command::{self, failure_message};
use crate::config::InspectorConfig;
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// `pgrep` exit status when nothing matched
const PGREP_NO_MATCH: i32 = 1;

pub struct ProcessInspector {
    pgrep: String,
    pattern: String,
    timeout: Duration,
}

impl ProcessInspector {
    pub fn new(config: &InspectorConfig) -> Self {
        Self {
            pgrep: config.pgrep.clone(),
            pattern: config.process_pattern.clone(),
            timeout: config.query_timeout(),
        }
    }
}

#[async_trait]
impl JobInspector for ProcessInspector {
    async fn active_replication_jobs(&self) -> Result<ActiveJobs, InspectorError> {
        let output = command::run(&self.pgrep, ["-f", self.pattern.as_str()], self.timeout).await?;

        match output.status.code() {
            Some(0) => {
                let pids = parse_pids(&self.pgrep, &String::from_utf8_lossy(&output.stdout))?;
                debug!("{} processes match {:?}", pids.len(), self.pattern);
                Ok(pids)
            }
            Some(PGREP_NO_MATCH) => Ok(ActiveJobs::new()),
            _ => Err(InspectorError::QueryFailed {
                program: self.pgrep.clone(),
                message: failure_message(&output),
            }),
        }
    }
}

/// Parse one PID per line
pub fn parse_pids(program: &str, stdout: &str) -> Result<ActiveJobs, InspectorError> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            line.parse()
                .map(JobId::Pid)
                .map_err(|_| InspectorError::UnexpectedOutput {
                    program: program.to_string(),
                    line: line.to_string(),
                })
        })
        .collect()
}
