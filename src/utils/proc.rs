use anyhow::{bail, Context, Result};
use std::ffi::OsStr;
use std::io::Read;
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::debug;
use wait_timeout::ChildExt;

use crate::error::{GraftError, Stage};

/// Runs an external tool to completion with stdout discarded and stderr
/// captured for the error message. A `None` deadline waits forever; an
/// expired deadline kills the child and reports a stage timeout.
pub fn run_tool<I, S>(
    stage: Stage,
    program: &str,
    args: I,
    remaining: Option<Duration>,
) -> Result<()>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());

    debug!("Running {:?}", command);

    let mut child = command
        .spawn()
        .with_context(|| format!("Failed to spawn '{}'", program))?;

    let status = match remaining {
        Some(timeout) => match child
            .wait_timeout(timeout)
            .with_context(|| format!("Failed to wait for '{}'", program))?
        {
            Some(status) => status,
            None => {
                child
                    .kill()
                    .with_context(|| format!("Failed to kill timed-out '{}'", program))?;
                child
                    .wait()
                    .with_context(|| format!("Failed to reap '{}'", program))?;
                return Err(GraftError::Timeout { stage }.into());
            }
        },
        None => child
            .wait()
            .with_context(|| format!("Failed to wait for '{}'", program))?,
    };

    let mut stderr = String::new();
    if let Some(mut pipe) = child.stderr.take() {
        // The child has exited, so this drains whatever is buffered.
        let _ = pipe.read_to_string(&mut stderr);
    }

    if !status.success() {
        bail!(
            "'{}' exited with {}: {}",
            program,
            status,
            stderr.trim_end()
        );
    }
    Ok(())
}
