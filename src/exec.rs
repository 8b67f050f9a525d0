//! Checked execution of external tools (`docker`, `ip`) with deadlines

use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} {args} failed: {stderr}")]
    Failed {
        program: String,
        args: String,
        stderr: String,
    },

    #[error("{program} {args} timed out after {after:?}")]
    Timeout {
        program: String,
        args: String,
        after: Duration,
    },
}

impl CommandError {
    /// Standard error output of a command that ran and failed
    pub fn stderr(&self) -> Option<&str> {
        match self {
            CommandError::Failed { stderr, .. } => Some(stderr),
            _ => None,
        }
    }

    /// True if the tool reported that the object it was asked about is gone
    pub fn is_not_found(&self) -> bool {
        self.stderr().is_some_and(|stderr| {
            stderr.contains("No such container")
                || stderr.contains("No such object")
                || stderr.contains("Cannot find device")
                || stderr.contains("does not exist")
        })
    }
}

/// Run `program args...`, returning stdout on success.
///
/// The child is killed if `deadline` passes first.
pub async fn run_checked(
    program: &str,
    args: &[&str],
    deadline: Duration,
) -> Result<String, CommandError> {
    let joined = args.join(" ");
    debug!("Running: {} {}", program, joined);

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(deadline, child).await {
        Ok(result) => result.map_err(|source| CommandError::Spawn {
            program: program.to_string(),
            source,
        })?,
        Err(_) => {
            return Err(CommandError::Timeout {
                program: program.to_string(),
                args: joined,
                after: deadline,
            })
        }
    };

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Err(CommandError::Failed {
            program: program.to_string(),
            args: joined,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}
