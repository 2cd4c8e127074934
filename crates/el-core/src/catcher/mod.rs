//! Evidence catchers.
//!
//! A catcher is an isolated, independently-failable unit of evidence
//! collection. The task runner hands each catcher its own duplicated sink
//! handle and a cancel token; a failing catcher only ever costs its own
//! section of the artifact.
//!
//! | Token | Catcher | Evidence |
//! |-------|---------|----------|
//! | `s`   | [`StackCatcher`] | backtrace of the subject |
//! | `S`   | [`StackCatcher`] | backtraces of the system watch-list |
//! | `b`   | [`RawDumpCatcher`] | kernel IPC debug files |
//! | `c`   | [`CpuSnapshotCatcher`] | subject and system CPU state |
//! | `m`   | [`MemorySnapshotCatcher`] | subject and system memory state |
//! | `pb`  | [`PeerChainCatcher`] | IPC wait chain plus peer backtraces |

mod peer_chain;
mod raw_dump;
mod snapshot;
mod stack;

pub use peer_chain::{resolve_peers, PeerChainCatcher, PeerLayer};
pub use raw_dump::RawDumpCatcher;
pub use snapshot::{CpuSnapshotCatcher, MemorySnapshotCatcher};
pub use stack::StackCatcher;

use crate::cancel::CancelToken;
use crate::collect::{ProcFsLookup, ProcessLookup, ToolError};
use crate::config::{Config, PathsConfig, StackConfig};
use el_common::{Event, ProcessId};
use std::fs::File;
use std::io;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;

/// Upper bound on a catcher description, in bytes.
pub const MAX_DESCRIPTION_BYTES: usize = 256;

/// Why a catcher produced no usable evidence.
#[derive(Debug, Error)]
pub enum CatchError {
    #[error("catcher used before initialize")]
    NotInitialized,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("helper failed: {0}")]
    Helper(#[from] ToolError),

    #[error("helper timed out after {0:?}")]
    TimedOut(Duration),

    #[error("helper exited with status {0:?}")]
    HelperExit(Option<i32>),

    #[error("cancelled")]
    Cancelled,

    #[error("process {0} not found")]
    ProcessGone(u32),
}

impl CatchError {
    /// Negative sentinel written into "not successful" notes.
    pub fn code(&self) -> i64 {
        match self {
            CatchError::NotInitialized => -1,
            CatchError::Io(_) => -2,
            CatchError::Helper(_) => -3,
            CatchError::TimedOut(_) => -4,
            CatchError::HelperExit(_) => -5,
            CatchError::Cancelled => -6,
            CatchError::ProcessGone(_) => -7,
        }
    }
}

/// Bytes written on success.
pub type CatchResult = Result<u64, CatchError>;

/// One evidence source.
pub trait Catcher: Send {
    /// Bind the catcher to its subject. `locator` is a process name used when
    /// `pid` is not usable; `param` is the integer command argument.
    ///
    /// Returns false if the subject cannot be resolved; the catcher is then
    /// never run.
    fn initialize(&mut self, locator: &str, pid: ProcessId, param: i32) -> bool;

    /// Write evidence into `sink`, polling `cancel` during long operations.
    fn catch(&mut self, sink: &mut File, cancel: &CancelToken) -> CatchResult;

    /// Section title, at most [`MAX_DESCRIPTION_BYTES`].
    fn description(&self) -> String;

    /// Annotate the triggering event after the run.
    fn publish(&self, _event: &mut Event) {}
}

/// Shared collaborators handed to every catcher.
#[derive(Clone)]
pub struct CatcherEnv {
    pub stack: StackConfig,
    pub paths: PathsConfig,
    pub system_watch_list: Vec<String>,
    pub lookup: Arc<dyn ProcessLookup>,
}

impl CatcherEnv {
    pub fn from_config(config: &Config) -> Self {
        Self {
            stack: config.stack.clone(),
            paths: config.paths.clone(),
            system_watch_list: config.system_watch_list.clone(),
            lookup: Arc::new(ProcFsLookup::new(config.paths.proc_root.clone())),
        }
    }

    pub fn with_lookup(mut self, lookup: Arc<dyn ProcessLookup>) -> Self {
        self.lookup = lookup;
        self
    }

    /// Resolve a subject: a live pid wins, otherwise look the name up.
    pub fn resolve(&self, locator: &str, pid: ProcessId) -> Option<ProcessId> {
        if self.lookup.exists(pid) {
            return Some(pid);
        }
        self.lookup.find_pid(locator)
    }
}

impl std::fmt::Debug for CatcherEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatcherEnv")
            .field("stack", &self.stack)
            .field("paths", &self.paths)
            .field("system_watch_list", &self.system_watch_list)
            .finish_non_exhaustive()
    }
}

/// Subject pid resolution shared by the catchers of one command parse.
///
/// Clones share the cached answer, so the name lookup behind
/// [`CatcherEnv::resolve`] runs at most once per parse.
#[derive(Debug, Clone, Default)]
pub struct SubjectResolution {
    cell: Arc<OnceLock<Option<ProcessId>>>,
}

impl SubjectResolution {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(&self, env: &CatcherEnv, locator: &str, pid: ProcessId) -> Option<ProcessId> {
        *self.cell.get_or_init(|| env.resolve(locator, pid))
    }

    /// The cached answer, if resolution already ran.
    pub fn cached(&self) -> Option<Option<ProcessId>> {
        self.cell.get().copied()
    }
}

/// Clamp a description to [`MAX_DESCRIPTION_BYTES`] on a char boundary.
pub fn clamp_description(mut description: String) -> String {
    if description.len() > MAX_DESCRIPTION_BYTES {
        let mut end = MAX_DESCRIPTION_BYTES;
        while !description.is_char_boundary(end) {
            end -= 1;
        }
        description.truncate(end);
    }
    description
}

/// Current length of the sink file; helpers write past our own handle.
pub(crate) fn sink_len(sink: &File) -> io::Result<u64> {
    Ok(sink.metadata()?.len())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_description_respects_char_boundary() {
        let long = "é".repeat(200); // 400 bytes
        let clamped = clamp_description(long);
        assert!(clamped.len() <= MAX_DESCRIPTION_BYTES);
        assert_eq!(clamped.chars().count(), 128);
        assert_eq!(clamp_description("short".into()), "short");
    }

    #[test]
    fn test_error_codes_are_negative_and_distinct() {
        let errors = [
            CatchError::NotInitialized,
            CatchError::Io(io::Error::new(io::ErrorKind::Other, "x")),
            CatchError::Helper(ToolError::EmptyCommand),
            CatchError::TimedOut(Duration::from_secs(1)),
            CatchError::HelperExit(Some(1)),
            CatchError::Cancelled,
            CatchError::ProcessGone(1),
        ];
        let mut codes: Vec<i64> = errors.iter().map(CatchError::code).collect();
        assert!(codes.iter().all(|c| *c < 0));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_env_resolve_prefers_live_pid() {
        let env = test_support::echo_env(test_support::FakeLookup::with_live(&[5]).named("svc", 9));
        assert_eq!(env.resolve("svc", ProcessId(5)), Some(ProcessId(5)));
        assert_eq!(env.resolve("svc", ProcessId(6)), Some(ProcessId(9)));
        assert_eq!(env.resolve("nope", ProcessId(6)), None);
    }

    #[test]
    fn test_subject_resolution_runs_once_across_clones() {
        let lookup = Arc::new(test_support::FakeLookup::default().named("svc", 9));
        let env = test_support::echo_env(test_support::FakeLookup::default())
            .with_lookup(lookup.clone());
        let resolution = SubjectResolution::new();
        let shared = resolution.clone();
        assert_eq!(resolution.cached(), None);

        assert_eq!(resolution.resolve(&env, "svc", ProcessId(4)), Some(ProcessId(9)));
        assert_eq!(shared.resolve(&env, "svc", ProcessId(4)), Some(ProcessId(9)));
        assert_eq!(shared.cached(), Some(Some(ProcessId(9))));
        assert_eq!(
            lookup.find_calls.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }
}
