//! Command string parsing.
//!
//! A rule's command such as `c,m,s,pb:2` is turned into an ordered list of
//! initialized catchers. Tokens are matched against a fixed, ordered matcher
//! list; the first match wins and unknown tokens are ignored. A catcher whose
//! `initialize` fails is left out of the queue.

use crate::cancel::CancelToken;
use crate::catcher::{
    CatchResult, Catcher, CatcherEnv, CpuSnapshotCatcher, MemorySnapshotCatcher,
    PeerChainCatcher, RawDumpCatcher, StackCatcher, SubjectResolution,
};
use el_common::{Event, ProcessId};
use std::fs::File;
use tracing::debug;

/// Argument handed to catchers when a token carries none.
pub const DEFAULT_PARAM: i32 = 1;

/// One queued catcher and the token it came from.
pub struct CatcherCommand {
    token: String,
    arg: Option<String>,
    catcher: Box<dyn Catcher>,
    cancel: CancelToken,
}

impl CatcherCommand {
    /// Wrap an already initialized catcher.
    pub fn new(token: impl Into<String>, arg: Option<String>, catcher: Box<dyn Catcher>) -> Self {
        Self {
            token: token.into(),
            arg,
            catcher,
            cancel: CancelToken::new(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn arg(&self) -> Option<&str> {
        self.arg.as_deref()
    }

    pub fn description(&self) -> String {
        self.catcher.description()
    }

    /// Ask an in-flight `catch` to give up at its next poll.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Tie this command's cancellation to `parent`, keeping an earlier
    /// `stop()` in force.
    pub(crate) fn attach(&mut self, parent: &CancelToken) {
        let stopped = self.cancel.is_cancelled();
        self.cancel = parent.child();
        if stopped {
            self.cancel.cancel();
        }
    }

    pub fn catch(&mut self, sink: &mut File) -> CatchResult {
        self.catcher.catch(sink, &self.cancel)
    }

    pub fn publish(&self, event: &mut Event) {
        self.catcher.publish(event);
    }
}

impl std::fmt::Debug for CatcherCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatcherCommand")
            .field("token", &self.token)
            .field("arg", &self.arg)
            .field("description", &self.catcher.description())
            .finish()
    }
}

/// What every catcher of one parse shares.
struct ParseScope {
    resolution: SubjectResolution,
    /// Blocked thread of the subject, 0 when unknown.
    tid: u32,
}

/// Constructs a catcher for one token.
type Build = fn(&CatcherEnv, &ParseScope) -> Box<dyn Catcher>;

struct Matcher {
    token: &'static str,
    takes_arg: bool,
    build: Build,
}

/// Ordered token matchers plus the environment every catcher is built with.
pub struct CatcherRegistry {
    env: CatcherEnv,
    matchers: Vec<Matcher>,
}

impl CatcherRegistry {
    /// Registry with the standard matchers `s`, `S`, `b`, `c`, `m`, `pb`.
    pub fn new(env: CatcherEnv) -> Self {
        let matchers = vec![
            Matcher { token: "s", takes_arg: false, build: build_subject_stack },
            Matcher { token: "S", takes_arg: false, build: build_watch_list_stack },
            Matcher { token: "b", takes_arg: false, build: build_raw_dump },
            Matcher { token: "c", takes_arg: false, build: build_cpu_snapshot },
            Matcher { token: "m", takes_arg: false, build: build_memory_snapshot },
            Matcher { token: "pb", takes_arg: true, build: build_peer_chain },
        ];
        Self { env, matchers }
    }

    pub fn env(&self) -> &CatcherEnv {
        &self.env
    }

    fn matcher_for(&self, name: &str, has_arg: bool) -> Option<&Matcher> {
        self.matchers
            .iter()
            .find(|m| m.token == name && (m.takes_arg || !has_arg))
    }

    /// Turn `command` into initialized catchers for the subject, in token
    /// order. `tid` is the subject thread the event was raised for (0 when
    /// unknown).
    pub fn parse(
        &self,
        command: &str,
        locator: &str,
        pid: ProcessId,
        tid: u32,
    ) -> Vec<CatcherCommand> {
        let scope = ParseScope {
            resolution: SubjectResolution::new(),
            tid,
        };
        let mut queued = Vec::new();

        for raw in command.split(',') {
            let token = raw.trim();
            if token.is_empty() {
                continue;
            }
            let (name, arg) = split_token(token);
            let Some(matcher) = self.matcher_for(name, arg.is_some()) else {
                debug!(token, "ignoring unknown catcher token");
                continue;
            };

            let param = match arg {
                None => DEFAULT_PARAM,
                Some(text) => match text.trim().parse::<i32>() {
                    Ok(value) => value,
                    Err(_) => {
                        debug!(token, "catcher argument is not an integer");
                        continue;
                    }
                },
            };

            let mut catcher = (matcher.build)(&self.env, &scope);
            if !catcher.initialize(locator, pid, param) {
                debug!(token, pid = pid.0, locator, "catcher initialize failed, skipping");
                continue;
            }
            queued.push(CatcherCommand::new(name, arg.map(str::to_string), catcher));
        }
        queued
    }
}

impl std::fmt::Debug for CatcherRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tokens: Vec<&str> = self.matchers.iter().map(|m| m.token).collect();
        f.debug_struct("CatcherRegistry")
            .field("env", &self.env)
            .field("tokens", &tokens)
            .finish()
    }
}

fn build_subject_stack(env: &CatcherEnv, _: &ParseScope) -> Box<dyn Catcher> {
    Box::new(StackCatcher::subject(env.clone()))
}

fn build_watch_list_stack(env: &CatcherEnv, _: &ParseScope) -> Box<dyn Catcher> {
    Box::new(StackCatcher::watch_list(env.clone()))
}

fn build_raw_dump(env: &CatcherEnv, _: &ParseScope) -> Box<dyn Catcher> {
    Box::new(RawDumpCatcher::new(env))
}

fn build_cpu_snapshot(env: &CatcherEnv, scope: &ParseScope) -> Box<dyn Catcher> {
    Box::new(CpuSnapshotCatcher::new(env.clone(), scope.resolution.clone()))
}

fn build_memory_snapshot(env: &CatcherEnv, scope: &ParseScope) -> Box<dyn Catcher> {
    Box::new(MemorySnapshotCatcher::new(env.clone(), scope.resolution.clone()))
}

fn build_peer_chain(env: &CatcherEnv, scope: &ParseScope) -> Box<dyn Catcher> {
    Box::new(PeerChainCatcher::new(env.clone()).on_thread(scope.tid))
}

fn split_token(token: &str) -> (&str, Option<&str>) {
    match token.split_once(':') {
        Some((name, arg)) => (name.trim(), Some(arg)),
        None => (token, None),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::catcher::test_support::{echo_env, FakeLookup};
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    fn registry_with_proc(lookup: FakeLookup) -> (CatcherRegistry, tempfile::TempDir) {
        let proc = tempfile::tempdir().unwrap();
        let mut env = echo_env(lookup);
        env.paths.proc_root = proc.path().to_path_buf();
        (CatcherRegistry::new(env), proc)
    }

    fn tokens(commands: &[CatcherCommand]) -> Vec<String> {
        commands
            .iter()
            .map(|c| match c.arg() {
                Some(arg) => format!("{}:{}", c.token(), arg),
                None => c.token().to_string(),
            })
            .collect()
    }

    #[test]
    fn test_parse_keeps_order_and_ignores_unknown() {
        let (registry, _proc) = registry_with_proc(FakeLookup::with_live(&[42]));
        let commands = registry.parse(" c , m,zz,, s,pb:-1 ,x:3", "", ProcessId(42), 0);
        assert_eq!(tokens(&commands), vec!["c", "m", "s", "pb:-1"]);
    }

    #[test]
    fn test_failed_initialize_is_excluded() {
        let (registry, _proc) = registry_with_proc(FakeLookup::with_live(&[42]));
        // pb:0 is an invalid layer; pb:abc is not an integer; s:1 takes no argument.
        let commands = registry.parse("pb:0,pb:abc,s:1,pb:-3,pb:3", "", ProcessId(42), 0);
        assert_eq!(tokens(&commands), vec!["pb:3"]);
    }

    #[test]
    fn test_unresolvable_subject_queues_only_subjectless_catchers() {
        let (mut registry, _proc) = registry_with_proc(FakeLookup::default().named("systemd", 1));
        registry.env.paths.raw_ipc_files = vec!["/nonexistent/state".into()];
        let commands = registry.parse("s,S,b,c,m,pb", "ghost", ProcessId(99), 0);
        assert_eq!(tokens(&commands), vec!["S", "b"]);
    }

    #[test]
    fn test_cpu_and_memory_resolve_subject_once() {
        let lookup = Arc::new(FakeLookup::default().named("worker", 42));
        let (registry, _proc) = registry_with_proc(FakeLookup::default());
        let env = registry.env().clone().with_lookup(lookup.clone());
        let registry = CatcherRegistry::new(env);

        let commands = registry.parse("c,m", "worker", ProcessId(7), 0);
        assert_eq!(commands.len(), 2);
        assert_eq!(lookup.find_calls.load(Ordering::SeqCst), 1);

        // A fresh parse resolves again.
        registry.parse("c", "worker", ProcessId(7), 0);
        assert_eq!(lookup.find_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_stop_survives_attach() {
        let (registry, _proc) = registry_with_proc(FakeLookup::with_live(&[42]));
        let mut commands = registry.parse("s", "", ProcessId(42), 0);
        let command = &mut commands[0];
        command.stop();
        command.attach(&CancelToken::new());
        assert!(command.is_stopped());

        let parent = CancelToken::new();
        let mut fresh = registry.parse("s", "", ProcessId(42), 0).remove(0);
        fresh.attach(&parent);
        assert!(!fresh.is_stopped());
        parent.cancel();
        assert!(fresh.is_stopped());
    }
}
