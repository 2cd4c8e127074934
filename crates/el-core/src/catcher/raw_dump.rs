//! Raw kernel IPC debug files.

use super::{clamp_description, CatchError, CatchResult, Catcher, CatcherEnv};
use crate::cancel::CancelToken;
use el_common::ProcessId;
use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use tracing::debug;

/// Streams the configured kernel debug files into the sink.
///
/// An unreadable file is skipped with a note; the catcher still succeeds.
#[derive(Debug)]
pub struct RawDumpCatcher {
    files: Vec<PathBuf>,
    initialized: bool,
}

impl RawDumpCatcher {
    pub fn new(env: &CatcherEnv) -> Self {
        Self {
            files: env.paths.raw_ipc_files.clone(),
            initialized: false,
        }
    }
}

impl Catcher for RawDumpCatcher {
    fn initialize(&mut self, _locator: &str, _pid: ProcessId, _param: i32) -> bool {
        self.initialized = !self.files.is_empty();
        self.initialized
    }

    fn catch(&mut self, sink: &mut File, cancel: &CancelToken) -> CatchResult {
        if !self.initialized {
            return Err(CatchError::NotInitialized);
        }

        let mut total = 0u64;
        for path in &self.files {
            if cancel.is_cancelled() {
                return Err(CatchError::Cancelled);
            }
            match File::open(path) {
                Ok(mut source) => {
                    let header = format!("----- {} -----\n", path.display());
                    sink.write_all(header.as_bytes())?;
                    total += header.len() as u64;
                    total += io::copy(&mut source, sink)?;
                }
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "raw dump source unreadable");
                    let note = format!("skipped {}: {}\n", path.display(), e);
                    sink.write_all(note.as_bytes())?;
                    total += note.len() as u64;
                }
            }
        }
        Ok(total)
    }

    fn description(&self) -> String {
        let names: Vec<String> = self.files.iter().map(|p| p.display().to_string()).collect();
        clamp_description(format!("RawDumpCatcher -- files=={}", names.join(",")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catcher::test_support::{echo_env, read_all, FakeLookup};
    use std::fs;

    #[test]
    fn test_streams_files_and_skips_missing() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("state");
        fs::write(&state, "binder state\nproc 1\n").unwrap();
        let missing = dir.path().join("transactions");

        let mut env = echo_env(FakeLookup::default());
        env.paths.raw_ipc_files = vec![state.clone(), missing.clone()];
        let mut catcher = RawDumpCatcher::new(&env);
        assert!(catcher.initialize("", ProcessId(1), 0));

        let mut sink = tempfile::tempfile().unwrap();
        let written = catcher.catch(&mut sink, &CancelToken::new()).unwrap();
        let text = read_all(&mut sink);
        assert!(text.contains("binder state\nproc 1\n"));
        assert!(text.contains(&format!("skipped {}", missing.display())));
        assert_eq!(written, text.len() as u64);
    }

    #[test]
    fn test_no_sources_fails_initialize() {
        let mut env = echo_env(FakeLookup::default());
        env.paths.raw_ipc_files.clear();
        let mut catcher = RawDumpCatcher::new(&env);
        assert!(!catcher.initialize("", ProcessId(1), 0));
    }

    #[test]
    fn test_cancelled_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("state");
        fs::write(&state, "x").unwrap();
        let mut env = echo_env(FakeLookup::default());
        env.paths.raw_ipc_files = vec![state];
        let mut catcher = RawDumpCatcher::new(&env);
        assert!(catcher.initialize("", ProcessId(1), 0));

        let token = CancelToken::new();
        token.cancel();
        let mut sink = tempfile::tempfile().unwrap();
        assert!(matches!(catcher.catch(&mut sink, &token), Err(CatchError::Cancelled)));
    }
}
