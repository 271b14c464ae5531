//! Bounded invocation of external tools
//!
//! Every collaborator in this crate is a command-line tool (`wg`, `wg-quick`,
//! `midclt`, `pgrep`). Calls are given a hard time limit and the child is
//! killed if it is still running when the limit expires.

use std::process::{Output, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("{program} did not finish within {after:?}")]
    TimedOut { program: String, after: Duration },
}

/// Run `program args...` and collect its output, giving up after `limit`.
pub async fn run<I, S>(program: &str, args: I, limit: Duration) -> Result<Output, CommandError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<std::ffi::OsStr>,
{
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!("Running {:?}", command.as_std());

    match tokio::time::timeout(limit, command.output()).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(source)) => Err(CommandError::Spawn {
            program: program.to_string(),
            source,
        }),
        Err(_) => Err(CommandError::TimedOut {
            program: program.to_string(),
            after: limit,
        }),
    }
}

/// Trimmed stderr of a finished command, or its exit status if stderr is empty
pub fn failure_message(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.is_empty() {
        output.status.to_string()
    } else {
        stderr
    }
}
