use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::runtime::CancelToken;

#[derive(Debug, Clone)]
pub(crate) struct CommandOutput {
    pub(crate) exit_code: i32,
    pub(crate) stdout: String,
    pub(crate) stderr: String,
    pub(crate) timed_out: bool,
    pub(crate) duration: Duration,
}

/// Run a subprocess with a timeout, polling for cancellation.
///
/// On timeout or cancellation the child is killed; the partial output is
/// still collected so failure messages can show what the command printed.
pub(crate) fn run_command_with_timeout(
    program: &str,
    args: &[String],
    working_dir: &Path,
    timeout: Option<Duration>,
    cancel: &CancelToken,
) -> Result<CommandOutput> {
    let start = Instant::now();
    let mut command = Command::new(program);
    command.args(args).current_dir(working_dir);

    let mut child = command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn {program}"))?;

    let deadline = timeout.map(|t| Instant::now() + t);
    let (exit_code, timed_out) = loop {
        match child.try_wait().context("failed to poll command")? {
            Some(status) => break (status.code().unwrap_or(-1), false),
            None => {
                let expired = deadline.is_some_and(|d| Instant::now() >= d);
                if expired || cancel.is_cancelled() {
                    let _ = child.kill();
                    let _ = child.wait();
                    break (-1, expired);
                }
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    };

    let mut stdout_bytes = Vec::new();
    let mut stderr_bytes = Vec::new();
    if let Some(mut out) = child.stdout.take() {
        let _ = out.read_to_end(&mut stdout_bytes);
    }
    if let Some(mut err) = child.stderr.take() {
        let _ = err.read_to_end(&mut stderr_bytes);
    }

    let mut stderr = String::from_utf8_lossy(&stderr_bytes).to_string();
    if timed_out {
        if let Some(timeout) = timeout {
            stderr.push_str(&format!(
                "\ncommand timed out after {}",
                humantime::format_duration(timeout)
            ));
        }
    }

    Ok(CommandOutput {
        exit_code,
        stdout: String::from_utf8_lossy(&stdout_bytes).to_string(),
        stderr,
        timed_out,
        duration: start.elapsed(),
    })
}

/// Last `lines` lines of a block of output.
pub(crate) fn tail_lines(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}
