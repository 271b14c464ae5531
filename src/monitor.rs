//! Replication-aware tunnel shutdown
//!
//! The monitor decides when it is safe to take the tunnel down:
//!
//! 1. If the tunnel is already down, stop immediately (`already-down`).
//! 2. Otherwise poll the job inspector every `interval` until either no
//!    replication job is active (`settled`) or the grace window runs out
//!    (`timed-out`, or `inspector-unavailable` if no poll ever succeeded).
//! 3. Bring the tunnel down. This happens for every outcome but
//!    `already-down`, including the uncertain ones: closing the tunnel takes
//!    priority over a replication that may still be running.
//!
//! Polls are strictly sequential and a failed poll is never read as "idle".

use crate::config::{ConfigError, DeadlinePolicy, InspectorConfig, MonitorConfig};
use crate::jobs::{JobInspector, PollResult};
use crate::tunnel::{TunnelController, TunnelError, TunnelHandle};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

// Roughly thirty years
const FAR_FUTURE_SECS: u64 = 86_400 * 365 * 30;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("{outcome}, but bringing the tunnel down failed: {source}")]
    Deactivation {
        outcome: Outcome,
        #[source]
        source: TunnelError,
    },
}

/// Terminal state of one monitor run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The tunnel was not up; nothing was polled or changed
    AlreadyDown,
    /// A poll saw no active replication jobs
    Settled,
    /// The grace window ran out while replication was still being reported
    TimedOut,
    /// Every poll in the grace window failed
    InspectorUnavailable,
}

impl Outcome {
    /// Whether reaching this outcome brings the tunnel down
    pub fn deactivates(self) -> bool {
        !matches!(self, Outcome::AlreadyDown)
    }

    /// Outcomes that succeeded but deserve an operator's attention
    pub fn is_warning(self) -> bool {
        matches!(self, Outcome::TimedOut | Outcome::InspectorUnavailable)
    }

    pub fn exit_code(self) -> u8 {
        match self {
            Outcome::AlreadyDown | Outcome::Settled => 0,
            Outcome::TimedOut => 3,
            Outcome::InspectorUnavailable => 4,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Outcome::AlreadyDown => "already-down",
            Outcome::Settled => "settled",
            Outcome::TimedOut => "timed-out",
            Outcome::InspectorUnavailable => "inspector-unavailable",
        };
        f.write_str(name)
    }
}

/// Validated polling parameters
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    timeout: Duration,
    interval: Duration,
    policy: DeadlinePolicy,
    confirm_polls: u32,
    query_timeout: Duration,
}

impl MonitorSettings {
    pub fn new(timeout: Duration, interval: Duration) -> Result<Self, ConfigError> {
        if interval.is_zero() {
            return Err(ConfigError::ZeroInterval);
        }
        Ok(Self {
            timeout,
            interval,
            policy: DeadlinePolicy::default(),
            confirm_polls: 1,
            query_timeout: InspectorConfig::default().query_timeout(),
        })
    }

    pub fn from_config(
        monitor: &MonitorConfig,
        inspector: &InspectorConfig,
    ) -> Result<Self, ConfigError> {
        Self::new(
            Duration::from_secs(monitor.timeout_secs),
            Duration::from_secs(monitor.interval_secs),
        )?
        .with_policy(monitor.policy)
        .with_confirm_polls(monitor.confirm_polls)
        .map(|settings| settings.with_query_timeout(inspector.query_timeout()))
    }

    pub fn with_policy(mut self, policy: DeadlinePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Require `polls` consecutive idle observations before settling.
    pub fn with_confirm_polls(mut self, polls: u32) -> Result<Self, ConfigError> {
        if polls == 0 {
            return Err(ConfigError::ZeroConfirmPolls);
        }
        self.confirm_polls = polls;
        Ok(self)
    }

    pub fn with_query_timeout(mut self, query_timeout: Duration) -> Self {
        self.query_timeout = query_timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn policy(&self) -> DeadlinePolicy {
        self.policy
    }

    /// A single query never outlives the polling interval
    fn query_limit(&self) -> Duration {
        self.query_timeout.min(self.interval)
    }
}

/// What happened during one run
#[derive(Debug, Clone)]
pub struct MonitorReport {
    pub outcome: Outcome,
    pub polls: u32,
    pub query_errors: u32,
    pub last_activity: Option<Instant>,
    pub elapsed: Duration,
}

impl MonitorReport {
    /// One-line classification for the operator
    pub fn summary(&self, handle: &TunnelHandle) -> String {
        let interface = handle.interface();
        match self.outcome {
            Outcome::AlreadyDown => {
                format!("already-down: {} was not up, nothing to do", interface)
            }
            Outcome::Settled => format!(
                "settled: no replication activity after {} poll(s), {} brought down",
                self.polls, interface
            ),
            Outcome::TimedOut => format!(
                "timed-out: WARNING replication may still have been in progress; \
                 {} brought down after {}s",
                interface,
                self.elapsed.as_secs()
            ),
            Outcome::InspectorUnavailable => format!(
                "inspector-unavailable: WARNING replication state unknown \
                 ({} failed queries); {} brought down anyway",
                self.query_errors, interface
            ),
        }
    }
}

/// Per-run bookkeeping, dropped when the run ends
struct MonitorState {
    deadline: Instant,
    last_activity: Option<Instant>,
    polls: u32,
    successful_polls: u32,
    query_errors: u32,
    idle_streak: u32,
}

impl MonitorState {
    fn new(deadline: Instant) -> Self {
        Self {
            deadline,
            last_activity: None,
            polls: 0,
            successful_polls: 0,
            query_errors: 0,
            idle_streak: 0,
        }
    }
}

pub struct ShutdownMonitor<'a> {
    inspector: &'a dyn JobInspector,
    tunnel: &'a dyn TunnelController,
    settings: MonitorSettings,
}

impl<'a> ShutdownMonitor<'a> {
    pub fn new(
        inspector: &'a dyn JobInspector,
        tunnel: &'a dyn TunnelController,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            inspector,
            tunnel,
            settings,
        }
    }

    pub async fn run(&self, handle: &TunnelHandle) -> Result<MonitorReport, MonitorError> {
        let started = Instant::now();

        match self.tunnel.is_active(handle).await {
            Ok(false) => {
                info!(
                    "Interface {} is not up, skipping replication watch",
                    handle.interface()
                );
                return Ok(MonitorReport {
                    outcome: Outcome::AlreadyDown,
                    polls: 0,
                    query_errors: 0,
                    last_activity: None,
                    elapsed: started.elapsed(),
                });
            }
            Ok(true) => {}
            Err(e) => {
                warn!(
                    "Could not tell whether {} is up ({}), assuming it is",
                    handle.interface(),
                    e
                );
            }
        }

        info!(
            "Watching replication for {}: timeout {:?}, interval {:?}, policy {:?}",
            handle.interface(),
            self.settings.timeout,
            self.settings.interval,
            self.settings.policy
        );

        let (outcome, state) = self.watch(started).await;

        if outcome == Outcome::TimedOut {
            warn!(
                "Grace window exhausted, replication may still be in progress on {}",
                handle.interface()
            );
        }

        info!("Outcome {}, bringing {} down", outcome, handle.interface());
        self.tunnel
            .deactivate(handle)
            .await
            .map_err(|source| MonitorError::Deactivation { outcome, source })?;

        Ok(MonitorReport {
            outcome,
            polls: state.polls,
            query_errors: state.query_errors,
            last_activity: state.last_activity,
            elapsed: started.elapsed(),
        })
    }

    /// Poll until settled or out of time
    ///
    /// Polls start on a fixed `interval` schedule, so query time does not
    /// stretch the cycle, and no query runs past `deadline + interval`.
    async fn watch(&self, started: Instant) -> (Outcome, MonitorState) {
        let interval = self.settings.interval;
        let mut state = MonitorState::new(deadline_after(started, self.settings.timeout));
        let mut next_poll = started;

        loop {
            let bound = state.deadline.checked_add(interval).unwrap_or(state.deadline);
            let limit = self
                .settings
                .query_limit()
                .min(bound.saturating_duration_since(Instant::now()));
            let poll = PollResult::capture(self.inspector, limit).await;
            state.polls += 1;

            match poll.jobs {
                Ok(jobs) if jobs.is_empty() => {
                    state.successful_polls += 1;
                    state.idle_streak += 1;
                    info!(
                        "No replication jobs active (idle {}/{})",
                        state.idle_streak, self.settings.confirm_polls
                    );
                    if state.idle_streak >= self.settings.confirm_polls {
                        return (Outcome::Settled, state);
                    }
                }
                Ok(jobs) => {
                    state.successful_polls += 1;
                    state.idle_streak = 0;
                    state.last_activity = Some(poll.at);
                    let ids: Vec<String> = jobs.iter().map(ToString::to_string).collect();
                    info!("{} replication job(s) active: {}", jobs.len(), ids.join(", "));

                    if self.settings.policy == DeadlinePolicy::ExtendOnActivity {
                        state.deadline = deadline_after(poll.at, self.settings.timeout);
                        debug!("Deadline extended by {:?}", self.settings.timeout);
                    }
                }
                Err(e) => {
                    state.query_errors += 1;
                    warn!("Job query {} failed: {}", state.polls, e);
                }
            }

            let now = Instant::now();
            if now >= state.deadline {
                let outcome = if state.successful_polls == 0 {
                    Outcome::InspectorUnavailable
                } else {
                    Outcome::TimedOut
                };
                return (outcome, state);
            }

            // A query that overran its slot delays the schedule instead of
            // firing a burst of catch-up polls
            next_poll = (next_poll + interval).max(now);
            sleep_until(next_poll).await;
        }
    }
}

/// `at + timeout`, or effectively never for timeouts past the clock's range
fn deadline_after(at: Instant, timeout: Duration) -> Instant {
    at.checked_add(timeout)
        .unwrap_or_else(|| at + Duration::from_secs(FAR_FUTURE_SECS))
}
