//! CPU and memory snapshots of the subject and the system.
//!
//! Both catchers read procfs under the configured root. They share a
//! [`SubjectResolution`] so a command such as `c,m` resolves the subject once.

use super::{clamp_description, CatchError, CatchResult, Catcher, CatcherEnv, SubjectResolution};
use crate::cancel::CancelToken;
use crate::collect::proc_parsers::{
    parse_cpu_times, parse_loadavg, parse_meminfo, parse_stat, read_status_memory_lines,
};
use el_common::ProcessId;
use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;

/// Subject scheduler state plus system CPU and load (`c`).
#[derive(Debug)]
pub struct CpuSnapshotCatcher {
    proc_root: PathBuf,
    env: CatcherEnv,
    resolution: SubjectResolution,
    subject: Option<ProcessId>,
}

impl CpuSnapshotCatcher {
    pub fn new(env: CatcherEnv, resolution: SubjectResolution) -> Self {
        Self {
            proc_root: env.paths.proc_root.clone(),
            env,
            resolution,
            subject: None,
        }
    }

    fn render(&self, pid: ProcessId) -> Result<String, CatchError> {
        let stat = parse_stat(&self.proc_root, pid.0).ok_or(CatchError::ProcessGone(pid.0))?;
        let mut out = String::new();
        let _ = writeln!(
            out,
            "pid {} ({}) state={} threads={} utime={} stime={}",
            pid, stat.comm, stat.state, stat.num_threads, stat.utime, stat.stime
        );
        match parse_cpu_times(&self.proc_root) {
            Some(cpu) => {
                let _ = writeln!(
                    out,
                    "system cpu busy={:.1}% total_ticks={} iowait={}",
                    cpu.busy_percent(),
                    cpu.total(),
                    cpu.iowait
                );
            }
            None => out.push_str("system cpu unavailable\n"),
        }
        match parse_loadavg(&self.proc_root) {
            Some(load) => {
                let _ = writeln!(
                    out,
                    "loadavg {:.2} {:.2} {:.2} tasks={}",
                    load.one, load.five, load.fifteen, load.tasks
                );
            }
            None => out.push_str("loadavg unavailable\n"),
        }
        Ok(out)
    }
}

impl Catcher for CpuSnapshotCatcher {
    fn initialize(&mut self, locator: &str, pid: ProcessId, _param: i32) -> bool {
        self.subject = self.resolution.resolve(&self.env, locator, pid);
        self.subject.is_some()
    }

    fn catch(&mut self, sink: &mut File, cancel: &CancelToken) -> CatchResult {
        let pid = self.subject.ok_or(CatchError::NotInitialized)?;
        if cancel.is_cancelled() {
            return Err(CatchError::Cancelled);
        }
        let text = self.render(pid)?;
        sink.write_all(text.as_bytes())?;
        Ok(text.len() as u64)
    }

    fn description(&self) -> String {
        let pid = self.subject.map(|p| p.to_string()).unwrap_or_default();
        clamp_description(format!("CpuSnapshotCatcher -- pid=={}", pid))
    }
}

/// Subject memory lines plus system meminfo (`m`).
#[derive(Debug)]
pub struct MemorySnapshotCatcher {
    proc_root: PathBuf,
    env: CatcherEnv,
    resolution: SubjectResolution,
    subject: Option<ProcessId>,
}

impl MemorySnapshotCatcher {
    pub fn new(env: CatcherEnv, resolution: SubjectResolution) -> Self {
        Self {
            proc_root: env.paths.proc_root.clone(),
            env,
            resolution,
            subject: None,
        }
    }

    fn render(&self, pid: ProcessId) -> Result<String, CatchError> {
        let lines = read_status_memory_lines(&self.proc_root, pid.0)
            .ok_or(CatchError::ProcessGone(pid.0))?;
        let mut out = String::new();
        for line in lines {
            out.push_str(&line);
            out.push('\n');
        }

        let rollup = self.proc_root.join(pid.0.to_string()).join("smaps_rollup");
        if let Ok(content) = fs::read_to_string(rollup) {
            out.push_str("smaps_rollup:\n");
            out.push_str(&content);
            if !content.ends_with('\n') {
                out.push('\n');
            }
        }

        match parse_meminfo(&self.proc_root) {
            Some(mem) => {
                let _ = writeln!(
                    out,
                    "system mem total={}kB free={}kB available={}kB buffers={}kB cached={}kB \
                     swap_total={}kB swap_free={}kB",
                    mem.mem_total_kb,
                    mem.mem_free_kb,
                    mem.mem_available_kb,
                    mem.buffers_kb,
                    mem.cached_kb,
                    mem.swap_total_kb,
                    mem.swap_free_kb
                );
            }
            None => out.push_str("system meminfo unavailable\n"),
        }
        Ok(out)
    }
}

impl Catcher for MemorySnapshotCatcher {
    fn initialize(&mut self, locator: &str, pid: ProcessId, _param: i32) -> bool {
        self.subject = self.resolution.resolve(&self.env, locator, pid);
        self.subject.is_some()
    }

    fn catch(&mut self, sink: &mut File, cancel: &CancelToken) -> CatchResult {
        let pid = self.subject.ok_or(CatchError::NotInitialized)?;
        if cancel.is_cancelled() {
            return Err(CatchError::Cancelled);
        }
        let text = self.render(pid)?;
        sink.write_all(text.as_bytes())?;
        Ok(text.len() as u64)
    }

    fn description(&self) -> String {
        let pid = self.subject.map(|p| p.to_string()).unwrap_or_default();
        clamp_description(format!("MemorySnapshotCatcher -- pid=={}", pid))
    }
}
