//! Replication health reporting
//!
//! Checks that every enabled replication task finished successfully within
//! a rolling window and pushes the verdict to an Uptime Kuma push monitor.

use crate::command::{self, failure_message};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum HealthError {
    #[error(transparent)]
    Command(#[from] command::CommandError),
    #[error("replication.query failed: {0}")]
    QueryFailed(String),
    #[error("Failed to parse replication.query output: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Unexpected replication.query output format")]
    UnexpectedFormat,
    #[error("Uptime Kuma push failed: {0}")]
    Push(#[from] reqwest::Error),
    #[error("Uptime Kuma returned HTTP {0}")]
    PushStatus(u16),
}

#[derive(Debug, Deserialize)]
struct RawTask {
    id: u64,
    name: String,
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    state: Option<RawState>,
}

#[derive(Debug, Default, Deserialize)]
struct RawState {
    state: Option<String>,
    datetime: Option<Value>,
    last_snapshot: Option<String>,
    error: Option<String>,
}

/// A replication task and its last known run
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationTask {
    pub id: u64,
    pub name: String,
    pub enabled: bool,
    /// `FINISHED`, `ERROR`, `RUNNING`, ...
    pub state: Option<String>,
    pub last_run: Option<DateTime<Utc>>,
    pub last_snapshot: Option<String>,
    pub error: Option<String>,
}

impl From<RawTask> for ReplicationTask {
    fn from(raw: RawTask) -> Self {
        let state = raw.state.unwrap_or_default();
        // Middleware encodes timestamps as {"$date": <epoch millis>}
        let last_run = state
            .datetime
            .as_ref()
            .and_then(|d| d.get("$date"))
            .and_then(Value::as_i64)
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single());

        Self {
            id: raw.id,
            name: raw.name,
            enabled: raw.enabled,
            state: state.state,
            last_run,
            last_snapshot: state.last_snapshot,
            error: state.error.filter(|e| !e.is_empty()),
        }
    }
}

impl ReplicationTask {
    /// Finished without error
    pub fn ok(&self) -> bool {
        self.state.as_deref() == Some("FINISHED") && self.error.is_none()
    }

    pub fn is_within_window(&self, window: Duration, now: DateTime<Utc>) -> bool {
        let Some(last_run) = self.last_run else {
            return false;
        };
        if !self.ok() {
            return false;
        }
        match (now - last_run).to_std() {
            Ok(age) => age <= window,
            // Clock skew: a run stamped in the future counts as current
            Err(_) => true,
        }
    }

    fn outdated_reason(&self) -> String {
        if let Some(error) = &self.error {
            return error.clone();
        }
        let last_run = self
            .last_run
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        format!(
            "state={} (Last run: {})",
            self.state.as_deref().unwrap_or("unknown"),
            last_run
        )
    }
}

/// Parse `replication.query` output, skipping malformed entries
pub fn parse_tasks(stdout: &[u8]) -> Result<Vec<ReplicationTask>, HealthError> {
    let Value::Array(entries) = serde_json::from_slice::<Value>(stdout)? else {
        return Err(HealthError::UnexpectedFormat);
    };

    let mut tasks = Vec::with_capacity(entries.len());
    for entry in entries {
        match serde_json::from_value::<RawTask>(entry) {
            Ok(raw) => tasks.push(raw.into()),
            Err(e) => warn!("Skipping malformed replication task ({})", e),
        }
    }
    Ok(tasks)
}

pub async fn query_tasks(
    midclt: &str,
    timeout: Duration,
) -> Result<Vec<ReplicationTask>, HealthError> {
    let output = command::run(midclt, ["call", "replication.query"], timeout).await?;
    if !output.status.success() {
        return Err(HealthError::QueryFailed(failure_message(&output)));
    }
    parse_tasks(&output.stdout)
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Every enabled task is current (vacuously so if there are none)
    Healthy { checked: usize },
    /// Enabled tasks that are not current, with the reason for each
    Outdated(Vec<(String, String)>),
}

impl Verdict {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Verdict::Healthy { .. })
    }
}

pub fn evaluate(tasks: &[ReplicationTask], window: Duration, now: DateTime<Utc>) -> Verdict {
    let enabled: Vec<&ReplicationTask> = tasks.iter().filter(|t| t.enabled).collect();
    if enabled.is_empty() {
        info!("No enabled replication tasks found");
        return Verdict::Healthy { checked: 0 };
    }

    let outdated: Vec<(String, String)> = enabled
        .iter()
        .filter(|t| !t.is_within_window(window, now))
        .map(|t| (t.name.clone(), t.outdated_reason()))
        .collect();

    if outdated.is_empty() {
        info!("All {} replication tasks are up to date", enabled.len());
        Verdict::Healthy {
            checked: enabled.len(),
        }
    } else {
        Verdict::Outdated(outdated)
    }
}

/// Hours as a duration; negative or NaN input means an empty window, and
/// windows too large to represent never expire
pub fn window_from_hours(hours: f64) -> Duration {
    let secs = hours * 3600.0;
    if secs > 0.0 {
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    } else {
        Duration::ZERO
    }
}

/// Uptime Kuma push monitor endpoint
pub struct KumaNotifier {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl KumaNotifier {
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self, HealthError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: normalize_base_url(base_url),
            token: token.to_string(),
        })
    }

    pub fn push_url(&self) -> String {
        format!("{}/api/push/{}", self.base_url, self.token)
    }

    pub async fn notify(&self, up: bool, msg: &str) -> Result<(), HealthError> {
        let status = if up { "up" } else { "down" };
        let response = self
            .client
            .get(self.push_url())
            .query(&[("status", status), ("msg", msg), ("ping", "")])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(HealthError::PushStatus(response.status().as_u16()));
        }
        info!("Uptime Kuma notified successfully ({})", status);
        Ok(())
    }
}

/// Accept `kuma.example.com` as well as full URLs
fn normalize_base_url(url: &str) -> String {
    let url = url.trim().trim_end_matches('/');
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("https://{}", url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const HOUR: Duration = Duration::from_secs(3600);

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn millis_ago(hours: i64) -> i64 {
        (now() - chrono::Duration::hours(hours)).timestamp_millis()
    }

    fn sample() -> String {
        format!(
            r#"[
                {{"id": 1, "name": "tank/data -> offsite", "enabled": true,
                  "state": {{"state": "FINISHED", "datetime": {{"$date": {}}},
                             "last_snapshot": "tank/data@auto-2025-06-01"}}}},
                {{"id": 2, "name": "tank/media -> offsite", "enabled": true,
                  "state": {{"state": "ERROR", "datetime": {{"$date": {}}},
                             "error": "No incremental base on dataset"}}}},
                {{"id": 3, "name": "old", "enabled": false, "state": null}},
                {{"name": "no id"}}
            ]"#,
            millis_ago(2),
            millis_ago(3)
        )
    }

    #[test]
    fn test_parse_tasks_skips_malformed() {
        let tasks = parse_tasks(sample().as_bytes()).unwrap();
        assert_eq!(tasks.len(), 3);

        assert!(tasks[0].ok());
        assert_eq!(
            tasks[0].last_snapshot.as_deref(),
            Some("tank/data@auto-2025-06-01")
        );
        assert_eq!(tasks[0].last_run.unwrap().timestamp_millis(), millis_ago(2));

        assert!(!tasks[1].ok());
        assert_eq!(tasks[2].state, None);
        assert_eq!(tasks[2].last_run, None);
    }

    #[test]
    fn test_parse_tasks_rejects_non_list() {
        assert!(matches!(
            parse_tasks(br#"{"error": "nope"}"#),
            Err(HealthError::UnexpectedFormat)
        ));
        assert!(matches!(parse_tasks(b"not json"), Err(HealthError::Parse(_))));
    }

    #[test]
    fn test_evaluate_reports_outdated_tasks() {
        let tasks = parse_tasks(sample().as_bytes()).unwrap();
        let verdict = evaluate(&tasks, 24 * HOUR, now());

        match verdict {
            Verdict::Outdated(outdated) => {
                assert_eq!(outdated.len(), 1);
                assert_eq!(outdated[0].0, "tank/media -> offsite");
                assert_eq!(outdated[0].1, "No incremental base on dataset");
            }
            other => panic!("Expected Outdated, got {:?}", other),
        }
    }

    #[test]
    fn test_window_boundary() {
        let tasks = parse_tasks(sample().as_bytes()).unwrap();
        let task = &tasks[0];

        assert!(task.is_within_window(2 * HOUR, now()));
        assert!(!task.is_within_window(HOUR, now()));
    }

    #[test]
    fn test_no_enabled_tasks_is_healthy() {
        let tasks = parse_tasks(br#"[{"id": 3, "name": "old", "enabled": false}]"#).unwrap();
        assert_eq!(evaluate(&tasks, HOUR, now()), Verdict::Healthy { checked: 0 });
    }

    #[test]
    fn test_running_task_is_not_current() {
        let json = format!(
            r#"[{{"id": 9, "name": "busy", "enabled": true,
                 "state": {{"state": "RUNNING", "datetime": {{"$date": {}}}}}}}]"#,
            millis_ago(1)
        );
        let tasks = parse_tasks(json.as_bytes()).unwrap();
        let verdict = evaluate(&tasks, 24 * HOUR, now());
        assert!(!verdict.is_healthy());
    }

    #[test]
    fn test_window_from_hours() {
        assert_eq!(window_from_hours(24.0), 24 * HOUR);
        assert_eq!(window_from_hours(0.5), Duration::from_secs(1800));
        assert_eq!(window_from_hours(-1.0), Duration::ZERO);
        assert_eq!(window_from_hours(f64::NAN), Duration::ZERO);
    }

    #[test]
    fn test_huge_window_keeps_tasks_current() {
        assert_eq!(window_from_hours(1e300), Duration::MAX);
        assert_eq!(window_from_hours(f64::INFINITY), Duration::MAX);

        let task = ReplicationTask {
            id: 1,
            name: "tank/data".to_string(),
            enabled: true,
            state: Some("FINISHED".to_string()),
            last_run: Some(Utc.with_ymd_and_hms(2001, 1, 1, 0, 0, 0).unwrap()),
            last_snapshot: None,
            error: None,
        };
        assert!(task.is_within_window(window_from_hours(1e300), now()));
    }

    #[test]
    fn test_push_url_normalization() {
        let notifier = KumaNotifier::new("kuma.example.com/", "abc", HOUR).unwrap();
        assert_eq!(notifier.push_url(), "https://kuma.example.com/api/push/abc");

        let notifier = KumaNotifier::new("http://10.0.0.5:3001", "abc", HOUR).unwrap();
        assert_eq!(notifier.push_url(), "http://10.0.0.5:3001/api/push/abc");
    }

    /// Answer a single HTTP request with `status_line`, returning what was sent
    async fn one_shot_server(
        status_line: &'static str,
    ) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = socket.read(&mut buf).await.unwrap();
            let response = format!(
                "{}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                status_line
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&buf[..n]).to_string()
        });
        (format!("http://{}", addr), handle)
    }

    #[tokio::test]
    async fn test_notify_sends_status_and_message() {
        let (url, server) = one_shot_server("HTTP/1.1 200 OK").await;
        let notifier = KumaNotifier::new(&url, "tok", Duration::from_secs(5)).unwrap();

        notifier.notify(false, "Replication not up to date").await.unwrap();

        let request = server.await.unwrap();
        let request_line = request.lines().next().unwrap();
        assert!(request_line.starts_with("GET /api/push/tok?"));
        assert!(request_line.contains("status=down"));
        assert!(request_line.contains("msg=Replication+not+up+to+date"));
    }

    #[tokio::test]
    async fn test_notify_non_success_status() {
        let (url, server) = one_shot_server("HTTP/1.1 404 Not Found").await;
        let notifier = KumaNotifier::new(&url, "tok", Duration::from_secs(5)).unwrap();

        let result = notifier.notify(true, "Replication OK").await;
        assert!(matches!(result, Err(HealthError::PushStatus(404))));
        server.await.unwrap();
    }
}
