//! Backtrace catcher backed by an isolated helper process.

use super::{clamp_description, sink_len, CatchError, CatchResult, Catcher, CatcherEnv};
use crate::cancel::CancelToken;
use crate::collect::{run_into, ToolSpec};
use el_common::ProcessId;
use std::fs::File;
use std::io::Write;
use std::time::Duration;
use tracing::{debug, warn};

/// Which processes a [`StackCatcher`] dumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StackScope {
    /// The event subject (`s`).
    Subject,
    /// Every resolvable process of the system watch-list (`S`).
    WatchList,
}

/// Dumps backtraces by running the configured helper against each target.
#[derive(Debug)]
pub struct StackCatcher {
    env: CatcherEnv,
    scope: StackScope,
    targets: Vec<(ProcessId, String)>,
}

impl StackCatcher {
    /// Catcher for the event subject.
    pub fn subject(env: CatcherEnv) -> Self {
        Self {
            env,
            scope: StackScope::Subject,
            targets: Vec::new(),
        }
    }

    /// Catcher for the configured system watch-list.
    pub fn watch_list(env: CatcherEnv) -> Self {
        Self {
            env,
            scope: StackScope::WatchList,
            targets: Vec::new(),
        }
    }

    #[cfg(test)]
    fn targets(&self) -> impl Iterator<Item = ProcessId> + '_ {
        self.targets.iter().map(|(pid, _)| *pid)
    }
}

impl Catcher for StackCatcher {
    fn initialize(&mut self, locator: &str, pid: ProcessId, _param: i32) -> bool {
        self.targets.clear();
        match self.scope {
            StackScope::Subject => {
                if let Some(resolved) = self.env.resolve(locator, pid) {
                    let name = self
                        .env
                        .lookup
                        .name_of(resolved)
                        .unwrap_or_else(|| locator.to_string());
                    self.targets.push((resolved, name));
                }
            }
            StackScope::WatchList => {
                for name in &self.env.system_watch_list {
                    match self.env.lookup.find_pid(name) {
                        Some(found) => self.targets.push((found, name.clone())),
                        None => debug!(name = %name, "watch-list process not running"),
                    }
                }
            }
        }
        !self.targets.is_empty()
    }

    fn catch(&mut self, sink: &mut File, cancel: &CancelToken) -> CatchResult {
        if self.targets.is_empty() {
            return Err(CatchError::NotInitialized);
        }

        let single = self.targets.len() == 1;
        let mut total = 0u64;
        let mut last_error = None;
        for (pid, name) in &self.targets {
            if cancel.is_cancelled() {
                last_error = Some(CatchError::Cancelled);
                break;
            }
            if !single {
                let banner = format!("\n----- pid {} ({}) -----\n", pid, name);
                sink.write_all(banner.as_bytes())?;
                total += banner.len() as u64;
            }
            match dump_stack(&self.env, *pid, sink, cancel) {
                Ok(written) => total += written,
                Err(e) => last_error = Some(e),
            }
        }

        // A watch-list dump is useful as long as one target succeeded.
        match last_error {
            Some(e) if single || total == 0 => Err(e),
            _ => Ok(total),
        }
    }

    fn description(&self) -> String {
        let text = match self.scope {
            StackScope::Subject => match self.targets.first() {
                Some((pid, name)) => format!("StackCatcher -- pid=={} name=={}", pid, name),
                None => "StackCatcher -- unresolved".to_string(),
            },
            StackScope::WatchList => {
                let pids: Vec<String> = self.targets.iter().map(|(p, _)| p.to_string()).collect();
                format!("SystemStackCatcher -- pids=={}", pids.join(","))
            }
        };
        clamp_description(text)
    }
}

/// Run the stack helper for `pid` into `sink`.
///
/// On timeout or cancellation the helper is killed and reaped and a note is
/// written in place of the backtrace.
pub(crate) fn dump_stack(
    env: &CatcherEnv,
    pid: ProcessId,
    sink: &mut File,
    cancel: &CancelToken,
) -> CatchResult {
    let start = sink_len(sink)?;
    let timeout = Duration::from_millis(env.stack.timeout_ms);
    let spec = ToolSpec::new(
        env.stack.argv_for(pid.0),
        Duration::from_millis(env.stack.poll_quantum_ms),
        timeout,
    );

    let result = match run_into(&spec, sink, cancel) {
        Ok(outcome) if outcome.timed_out => {
            writeln!(sink, "Stack dump of pid {} timed out after {}ms", pid, timeout.as_millis())?;
            Err(CatchError::TimedOut(timeout))
        }
        Ok(outcome) if outcome.cancelled => {
            writeln!(sink, "Stack dump of pid {} cancelled", pid)?;
            Err(CatchError::Cancelled)
        }
        Ok(outcome) if outcome.exit_code != Some(0) => {
            writeln!(
                sink,
                "Stack helper for pid {} exited with status {:?}",
                pid, outcome.exit_code
            )?;
            Err(CatchError::HelperExit(outcome.exit_code))
        }
        Ok(_) => Ok(sink_len(sink)?.saturating_sub(start)),
        Err(e) => {
            writeln!(sink, "Stack dump of pid {} failed: {}", pid, e)?;
            Err(CatchError::Helper(e))
        }
    };

    if let Err(e) = &result {
        warn!(pid = pid.0, error = %e, "stack dump not successful");
    }
    result
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::catcher::test_support::{echo_env, read_all, FakeLookup};

    #[test]
    fn test_subject_by_pid() {
        let mut catcher = StackCatcher::subject(echo_env(FakeLookup::with_live(&[4321])));
        assert!(catcher.initialize("", ProcessId(4321), 0));
        assert!(catcher.description().starts_with("StackCatcher -- pid==4321"));

        let mut sink = tempfile::tempfile().unwrap();
        let written = catcher.catch(&mut sink, &CancelToken::new()).unwrap();
        let text = read_all(&mut sink);
        assert_eq!(text, "backtrace of 4321\n");
        assert_eq!(written, text.len() as u64);
    }

    #[test]
    fn test_subject_by_name_when_pid_is_stale() {
        let lookup = FakeLookup::with_live(&[]).named("com.example.app", 77);
        let mut catcher = StackCatcher::subject(echo_env(lookup));
        assert!(catcher.initialize("com.example.app", ProcessId(12), 0));
        assert_eq!(catcher.targets().collect::<Vec<_>>(), vec![ProcessId(77)]);
    }

    #[test]
    fn test_unresolvable_subject_fails_initialize() {
        let mut catcher = StackCatcher::subject(echo_env(FakeLookup::default()));
        assert!(!catcher.initialize("ghost", ProcessId(99), 0));
        let mut sink = tempfile::tempfile().unwrap();
        assert!(matches!(
            catcher.catch(&mut sink, &CancelToken::new()),
            Err(CatchError::NotInitialized)
        ));
    }

    #[test]
    fn test_watch_list_skips_missing_processes() {
        let lookup = FakeLookup::default().named("systemd", 1).named("dbus-daemon", 600);
        let mut catcher = StackCatcher::watch_list(echo_env(lookup));
        assert!(catcher.initialize("", ProcessId(0), 0));
        assert_eq!(
            catcher.targets().collect::<Vec<_>>(),
            vec![ProcessId(1), ProcessId(600)]
        );

        let mut sink = tempfile::tempfile().unwrap();
        let written = catcher.catch(&mut sink, &CancelToken::new()).unwrap();
        let text = read_all(&mut sink);
        assert!(text.contains("----- pid 1 (systemd) -----\nbacktrace of 1\n"));
        assert!(text.contains("backtrace of 600"));
        assert_eq!(written, text.len() as u64);
    }

    #[test]
    fn test_timeout_writes_note_and_fails() {
        let mut env = echo_env(FakeLookup::with_live(&[5]));
        env.stack.command = vec!["sleep".into(), "10".into()];
        env.stack.timeout_ms = 150;
        let mut catcher = StackCatcher::subject(env);
        assert!(catcher.initialize("", ProcessId(5), 0));

        let mut sink = tempfile::tempfile().unwrap();
        let result = catcher.catch(&mut sink, &CancelToken::new());
        assert!(matches!(result, Err(CatchError::TimedOut(_))));
        assert!(read_all(&mut sink).contains("Stack dump of pid 5 timed out after 150ms"));
    }

    #[test]
    fn test_missing_helper_is_reported() {
        let mut env = echo_env(FakeLookup::with_live(&[5]));
        env.stack.command = vec!["/nonexistent/stack-helper".into(), "{pid}".into()];
        let mut catcher = StackCatcher::subject(env);
        assert!(catcher.initialize("", ProcessId(5), 0));

        let mut sink = tempfile::tempfile().unwrap();
        assert!(matches!(
            catcher.catch(&mut sink, &CancelToken::new()),
            Err(CatchError::Helper(_))
        ));
        assert!(read_all(&mut sink).contains("Stack dump of pid 5 failed"));
    }
}
