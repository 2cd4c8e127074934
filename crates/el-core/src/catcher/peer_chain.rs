//! IPC peer-chain catcher.
//!
//! Resolves the processes the subject is blocked on from its IPC transaction
//! log, dumps a backtrace of each peer and appends the raw log.

use super::stack::dump_stack;
use super::{clamp_description, sink_len, CatchError, CatchResult, Catcher, CatcherEnv};
use crate::cancel::CancelToken;
use crate::config::PathsConfig;
use crate::wait_graph::{self, format_paths, Resolution, WaitGraph};
use el_common::{payload_keys, Event, ProcessId};
use std::fmt;
use std::fs::{self, File};
use std::io::Write;
use tracing::debug;

/// How far to follow the wait graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PeerLayer {
    /// Heaviest direct waits of the subject (`1`, the default).
    #[default]
    Strongest,
    /// Everything reachable (`-1`).
    All,
    /// First and last peer of every reachable path (`-2`).
    HeadTail,
    /// Strongest wait followed thread by thread for N hops (`N >= 2`).
    Hops(u32),
}

impl PeerLayer {
    /// Decode the integer command argument. `0` and values below `-2` are
    /// rejected.
    pub fn from_param(param: i32) -> Option<Self> {
        match param {
            1 => Some(PeerLayer::Strongest),
            -1 => Some(PeerLayer::All),
            -2 => Some(PeerLayer::HeadTail),
            n if n >= 2 => Some(PeerLayer::Hops(n as u32)),
            _ => None,
        }
    }

    pub fn param(self) -> i32 {
        match self {
            PeerLayer::Strongest => 1,
            PeerLayer::All => -1,
            PeerLayer::HeadTail => -2,
            PeerLayer::Hops(n) => n as i32,
        }
    }
}

impl fmt::Display for PeerLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerLayer::Strongest => write!(f, "strongest"),
            PeerLayer::All => write!(f, "all"),
            PeerLayer::HeadTail => write!(f, "head_tail"),
            PeerLayer::Hops(n) => write!(f, "hops:{}", n),
        }
    }
}

/// Resolve the peers of `root` from its transaction log.
///
/// `root_tid` picks the thread the hop walk starts from; 0 means any thread.
/// The other layers look at the whole process. A missing or unreadable log
/// resolves to the root alone.
pub fn resolve_peers(paths: &PathsConfig, root: u32, root_tid: u32, layer: PeerLayer) -> Resolution {
    let log_path = paths.ipc_log_for(root);
    let read_log = || match fs::read_to_string(&log_path) {
        Ok(text) => Some(text),
        Err(e) => {
            debug!(path = %log_path.display(), error = %e, "transaction log unreadable");
            None
        }
    };

    match layer {
        PeerLayer::Hops(hops) => wait_graph::hop_chain(root, root_tid, hops, read_log),
        other => {
            let graph = read_log().map(|text| WaitGraph::parse(&text)).unwrap_or_default();
            match other {
                PeerLayer::Strongest => wait_graph::strongest_peers(&graph, root),
                PeerLayer::HeadTail => {
                    wait_graph::head_tail(&wait_graph::traverse(&graph, root), root)
                }
                _ => wait_graph::traverse(&graph, root),
            }
        }
    }
}

/// Peer-chain resolution plus peer backtraces (`pb[:N]`).
#[derive(Debug)]
pub struct PeerChainCatcher {
    env: CatcherEnv,
    layer: PeerLayer,
    root: Option<ProcessId>,
    thread: u32,
    resolution: Option<Resolution>,
}

impl PeerChainCatcher {
    pub fn new(env: CatcherEnv) -> Self {
        Self {
            env,
            layer: PeerLayer::default(),
            root: None,
            thread: 0,
            resolution: None,
        }
    }

    /// Start hop walks from this thread of the subject (0: any thread).
    pub fn on_thread(mut self, tid: u32) -> Self {
        self.thread = tid;
        self
    }

    /// Peers found by the last run, without the root.
    pub fn peers(&self) -> Vec<u32> {
        match (&self.resolution, self.root) {
            (Some(resolution), Some(root)) => resolution.peers(root.0),
            _ => Vec::new(),
        }
    }
}

impl Catcher for PeerChainCatcher {
    fn initialize(&mut self, locator: &str, pid: ProcessId, param: i32) -> bool {
        let Some(layer) = PeerLayer::from_param(param) else {
            debug!(param, "unsupported peer layer");
            return false;
        };
        self.layer = layer;
        self.root = self.env.resolve(locator, pid);
        self.root.is_some()
    }

    fn catch(&mut self, sink: &mut File, cancel: &CancelToken) -> CatchResult {
        let root = self.root.ok_or(CatchError::NotInitialized)?;
        let start = sink_len(sink)?;

        let resolution = resolve_peers(&self.env.paths, root.0, self.thread, self.layer);
        sink.write_all(format_paths(&resolution.paths).as_bytes())?;
        let peers = resolution.peers(root.0);
        self.resolution = Some(resolution);

        for peer in peers {
            if cancel.is_cancelled() {
                return Err(CatchError::Cancelled);
            }
            let name = self
                .env
                .lookup
                .name_of(ProcessId(peer))
                .unwrap_or_default();
            write!(sink, "\n----- peer pid {} ({}) -----\n", peer, name)?;
            // A peer that cannot be dumped leaves its note and the chain goes on.
            // Failing to write the sink is not.
            if let Err(CatchError::Io(e)) = dump_stack(&self.env, ProcessId(peer), sink, cancel) {
                return Err(CatchError::Io(e));
            }
        }

        writeln!(sink, "\nIPC transactions for {}:", root)?;
        let log_path = self.env.paths.ipc_log_for(root.0);
        match fs::read_to_string(&log_path) {
            Ok(text) => sink.write_all(text.as_bytes())?,
            Err(_) => writeln!(sink, "{} unavailable", log_path.display())?,
        }

        Ok(sink_len(sink)?.saturating_sub(start))
    }

    fn description(&self) -> String {
        let root = self.root.map(|p| p.to_string()).unwrap_or_default();
        let mut description = format!("PeerChainCatcher -- pid=={} layer=={}", root, self.layer);
        if self.thread != 0 {
            description.push_str(&format!(" tid=={}", self.thread));
        }
        clamp_description(description)
    }

    fn publish(&self, event: &mut Event) {
        if self.resolution.is_none() {
            return;
        }
        let joined: Vec<String> = self.peers().iter().map(u32::to_string).collect();
        event.set_value(payload_keys::PEER_CHAIN_PIDS, joined.join(","));
    }
}
