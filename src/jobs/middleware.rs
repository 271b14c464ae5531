//! Job inspection through the appliance middleware client

use super::{ActiveJobs, InspectorError, JobId, JobInspector};
use crate::command::{self, failure_message};
use crate::config::InspectorConfig;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Job states that mean "not finished yet"
const PENDING_STATES: [&str; 2] = ["RUNNING", "WAITING"];

/// One entry of `core.get_jobs`
///
/// Only the fields used for classification are read.
#[derive(Debug, Clone, Deserialize)]
pub struct MiddlewareJob {
    pub id: u64,
    pub method: String,
    pub state: String,
}

impl MiddlewareJob {
    fn is_pending(&self) -> bool {
        PENDING_STATES.contains(&self.state.as_str())
    }

    fn is_replication(&self, method_prefixes: &[String]) -> bool {
        method_prefixes
            .iter()
            .any(|prefix| self.method.starts_with(prefix.as_str()))
    }
}

pub struct MiddlewareInspector {
    midclt: String,
    method_prefixes: Vec<String>,
    timeout: Duration,
}

impl MiddlewareInspector {
    pub fn new(config: &InspectorConfig) -> Self {
        Self {
            midclt: config.midclt.clone(),
            method_prefixes: config.method_prefixes.clone(),
            timeout: config.query_timeout(),
        }
    }
}

#[async_trait]
impl JobInspector for MiddlewareInspector {
    async fn active_replication_jobs(&self) -> Result<ActiveJobs, InspectorError> {
        let filter = serde_json::json!([["state", "in", PENDING_STATES]]).to_string();
        let output = command::run(
            &self.midclt,
            ["call", "core.get_jobs", filter.as_str()],
            self.timeout,
        )
        .await?;

        if !output.status.success() {
            return Err(InspectorError::QueryFailed {
                program: self.midclt.clone(),
                message: failure_message(&output),
            });
        }

        let jobs = parse_jobs(&output.stdout)?;
        debug!("Middleware reports {} pending jobs", jobs.len());
        Ok(classify(&jobs, &self.method_prefixes))
    }
}

pub fn parse_jobs(stdout: &[u8]) -> Result<Vec<MiddlewareJob>, InspectorError> {
    Ok(serde_json::from_slice(stdout)?)
}

/// Pending jobs whose method matches one of `method_prefixes`
pub fn classify(jobs: &[MiddlewareJob], method_prefixes: &[String]) -> ActiveJobs {
    jobs.iter()
        .filter(|job| job.is_pending() && job.is_replication(method_prefixes))
        .map(|job| JobId::Job(job.id))
        .collect()
}
