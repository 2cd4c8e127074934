//! pid ↔ name lookup over procfs.

use el_common::ProcessId;
use std::fs;
use std::path::PathBuf;

/// pid/name resolution used by catchers to validate and locate subjects.
pub trait ProcessLookup: Send + Sync {
    /// True if `pid` names a live process.
    fn exists(&self, pid: ProcessId) -> bool;

    /// Lowest pid whose name matches `name`.
    fn find_pid(&self, name: &str) -> Option<ProcessId>;

    /// Short name of `pid`.
    fn name_of(&self, pid: ProcessId) -> Option<String>;
}

/// [`ProcessLookup`] backed by a procfs tree.
#[derive(Debug, Clone)]
pub struct ProcFsLookup {
    root: PathBuf,
}

impl ProcFsLookup {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn pid_dir(&self, pid: ProcessId) -> PathBuf {
        self.root.join(pid.0.to_string())
    }

    /// All numeric entries under the root, ascending.
    fn pids(&self) -> Vec<u32> {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return Vec::new();
        };
        let mut pids: Vec<u32> = entries
            .flatten()
            .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
            .collect();
        pids.sort_unstable();
        pids
    }

    /// argv[0] from cmdline, NUL separated.
    fn argv0(&self, pid: ProcessId) -> Option<String> {
        let raw = fs::read(self.pid_dir(pid).join("cmdline")).ok()?;
        let first = raw.split(|b| *b == 0).next()?;
        if first.is_empty() {
            return None;
        }
        Some(String::from_utf8_lossy(first).into_owned())
    }
}

impl ProcessLookup for ProcFsLookup {
    fn exists(&self, pid: ProcessId) -> bool {
        pid.is_valid() && self.pid_dir(pid).is_dir()
    }

    fn find_pid(&self, name: &str) -> Option<ProcessId> {
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        self.pids().into_iter().map(ProcessId).find(|&pid| {
            // comm is truncated to 15 bytes by the kernel; argv[0] carries
            // the full name (or path).
            if let Some(argv0) = self.argv0(pid) {
                let base = argv0.rsplit('/').next().unwrap_or(&argv0);
                if argv0 == name || base == name {
                    return true;
                }
            }
            self.name_of(pid).is_some_and(|comm| comm == name)
        })
    }

    fn name_of(&self, pid: ProcessId) -> Option<String> {
        let comm = fs::read_to_string(self.pid_dir(pid).join("comm")).ok()?;
        let comm = comm.trim_end_matches('\n').to_string();
        (!comm.is_empty()).then_some(comm)
    }
}
