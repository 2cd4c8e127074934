//! Helper process runner with bounded wait and forced kill.
//!
//! Evidence that needs another program (stack backtraces) is produced by an
//! isolated child whose stdout/stderr are duplicated handles of the artifact
//! sink, so the helper writes straight into the artifact at the shared file
//! offset.
//!
//! - Fixed poll quantum with a fixed ceiling; never an unbounded block
//! - SIGKILL of the helper's process group on timeout or cancellation
//! - The child is always reaped before returning
//! - Command path validation to prevent injection

use crate::cancel::CancelToken;
use std::fs::File;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, instrument, trace, warn};

/// Errors that prevent a helper from running at all.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("empty helper command")]
    EmptyCommand,

    #[error("command not found: {0}")]
    CommandNotFound(String),

    #[error("invalid command path: {0}")]
    InvalidPath(String),

    #[error("command failed to spawn: {0}")]
    SpawnFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Specification for a helper run.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    /// Program followed by its arguments.
    pub argv: Vec<String>,
    /// Sleep between liveness polls.
    pub poll_quantum: Duration,
    /// Wait ceiling before the helper is killed.
    pub timeout: Duration,
}

impl ToolSpec {
    pub fn new(argv: Vec<String>, poll_quantum: Duration, timeout: Duration) -> Self {
        Self {
            argv,
            poll_quantum,
            timeout,
        }
    }
}

/// How a helper run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutcome {
    /// Exit code (None when killed by a signal).
    pub exit_code: Option<i32>,
    /// Killed because the ceiling was reached.
    pub timed_out: bool,
    /// Killed because the cancel token fired.
    pub cancelled: bool,
    pub duration: Duration,
}

/// Run a helper whose output goes into `sink`, waiting at most `spec.timeout`.
#[instrument(skip(sink, cancel), fields(cmd = %spec.argv.first().map(String::as_str).unwrap_or("")))]
pub fn run_into(
    spec: &ToolSpec,
    sink: &File,
    cancel: &CancelToken,
) -> Result<ToolOutcome, ToolError> {
    let (program, args) = spec.argv.split_first().ok_or(ToolError::EmptyCommand)?;
    validate_command(program)?;

    let mut command = build_command(program, args);
    command
        .stdin(Stdio::null())
        .stdout(Stdio::from(sink.try_clone()?))
        .stderr(Stdio::from(sink.try_clone()?));

    let start = Instant::now();
    let mut child = command.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ToolError::CommandNotFound(program.clone())
        } else {
            ToolError::SpawnFailed(e.to_string())
        }
    })?;
    // Release our copies of the sink handles; the child holds its own.
    drop(command);

    debug!(pid = child.id(), timeout_ms = spec.timeout.as_millis() as u64, "helper spawned");
    wait_bounded(&mut child, spec, cancel, start)
}

/// Poll the child until it exits, the ceiling passes, or cancellation fires.
fn wait_bounded(
    child: &mut Child,
    spec: &ToolSpec,
    cancel: &CancelToken,
    start: Instant,
) -> Result<ToolOutcome, ToolError> {
    let deadline = start + spec.timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            trace!(exit_code = ?status.code(), "helper exited");
            return Ok(ToolOutcome {
                exit_code: status.code(),
                timed_out: false,
                cancelled: false,
                duration: start.elapsed(),
            });
        }

        let cancelled = cancel.is_cancelled();
        if cancelled || Instant::now() >= deadline {
            warn!(pid = child.id(), cancelled, "helper unresponsive, killing");
            force_kill(child);
            let status = child.wait()?;
            return Ok(ToolOutcome {
                exit_code: status.code(),
                timed_out: !cancelled,
                cancelled,
                duration: start.elapsed(),
            });
        }

        thread::sleep(spec.poll_quantum);
    }
}

/// Reject commands with shell metacharacters or missing absolute paths.
fn validate_command(cmd: &str) -> Result<(), ToolError> {
    if cmd.contains(['|', '&', ';', '$', '`', '\n', '\r']) {
        return Err(ToolError::InvalidPath(format!(
            "command contains shell metacharacters: {}",
            cmd
        )));
    }
    if cmd.starts_with('/') && !Path::new(cmd).exists() {
        return Err(ToolError::CommandNotFound(cmd.to_string()));
    }
    Ok(())
}

fn build_command(program: &str, args: &[String]) -> Command {
    let mut command = Command::new(program);
    command.args(args);

    command.env_clear();
    if let Ok(path) = std::env::var("PATH") {
        command.env("PATH", path);
    }
    command.env("LC_ALL", "C");
    command.env("LANG", "C");

    // Own process group so a kill also reaches anything the helper forked.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    command
}

#[cfg(unix)]
fn force_kill(child: &mut Child) {
    let pgid = child.id() as i32;
    // SAFETY: kill(2) has no memory-safety preconditions; a stale pgid only
    // yields ESRCH.
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc != 0 {
        let _ = child.kill();
    }
    debug!(pgid, "sent SIGKILL to helper group");
}

#[cfg(not(unix))]
fn force_kill(child: &mut Child) {
    let _ = child.kill();
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom};

    fn sh(script: &str, timeout_ms: u64) -> ToolSpec {
        ToolSpec::new(
            vec!["sh".into(), "-c".into(), script.into()],
            Duration::from_millis(20),
            Duration::from_millis(timeout_ms),
        )
    }

    fn read_back(file: &mut File) -> String {
        file.seek(SeekFrom::Start(0)).unwrap();
        let mut out = String::new();
        file.read_to_string(&mut out).unwrap();
        out
    }

    #[test]
    fn test_helper_writes_into_sink() {
        let mut sink = tempfile::tempfile().unwrap();
        let outcome = run_into(&sh("echo hello; echo oops >&2", 5000), &sink, &CancelToken::new())
            .unwrap();
        assert_eq!(outcome.exit_code, Some(0));
        assert!(!outcome.timed_out && !outcome.cancelled);
        let text = read_back(&mut sink);
        assert!(text.contains("hello"));
        assert!(text.contains("oops"));
    }

    #[test]
    fn test_nonzero_exit_is_reported() {
        let sink = tempfile::tempfile().unwrap();
        let outcome = run_into(&sh("exit 3", 5000), &sink, &CancelToken::new()).unwrap();
        assert_eq!(outcome.exit_code, Some(3));
        assert!(!outcome.timed_out);
    }

    #[test]
    fn test_timeout_kills_and_reaps() {
        let sink = tempfile::tempfile().unwrap();
        let outcome = run_into(&sh("sleep 10", 200), &sink, &CancelToken::new()).unwrap();
        assert!(outcome.timed_out);
        assert!(!outcome.cancelled);
        assert_eq!(outcome.exit_code, None);
        assert!(outcome.duration < Duration::from_secs(3));
    }

    #[test]
    fn test_cancel_kills_helper() {
        let sink = tempfile::tempfile().unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let outcome = run_into(&sh("sleep 10", 5000), &sink, &cancel).unwrap();
        assert!(outcome.cancelled);
        assert!(!outcome.timed_out);
        assert!(outcome.duration < Duration::from_secs(3));
    }

    #[test]
    fn test_rejects_metacharacters_and_missing_paths() {
        let sink = tempfile::tempfile().unwrap();
        let spec = ToolSpec::new(
            vec!["echo; rm -rf /".into()],
            Duration::from_millis(10),
            Duration::from_millis(100),
        );
        assert!(matches!(
            run_into(&spec, &sink, &CancelToken::new()),
            Err(ToolError::InvalidPath(_))
        ));

        let spec = ToolSpec::new(
            vec!["/nonexistent/helper".into()],
            Duration::from_millis(10),
            Duration::from_millis(100),
        );
        assert!(matches!(
            run_into(&spec, &sink, &CancelToken::new()),
            Err(ToolError::CommandNotFound(_))
        ));

        let spec = ToolSpec::new(vec![], Duration::from_millis(10), Duration::from_millis(100));
        assert!(matches!(
            run_into(&spec, &sink, &CancelToken::new()),
            Err(ToolError::EmptyCommand)
        ));
    }
}
