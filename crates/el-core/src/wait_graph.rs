//! IPC wait-graph parsing and traversal.
//!
//! The kernel exposes, per process, a text log of outstanding IPC
//! transactions. Each `outgoing transaction` line names the waiting client
//! thread, the server thread it is blocked on and how long it has waited.
//! Those lines form a directed graph, client pid to server pid, which is walked
//! to find the processes implicated in a hang.
//!
//! Three resolution strategies exist:
//! - [`strongest_peers`]: the root's heaviest direct waits
//! - [`traverse`]: full reachability with cycle-safe path enumeration
//! - [`hop_chain`]: follow the strongest wait thread-by-thread, re-reading
//!   the log on every hop

use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::OnceLock;

/// Direct peers collected by [`strongest_peers`] at most.
pub const STRONGEST_MAX_PEERS: usize = 3;

/// Waits below this many seconds end [`strongest_peers`].
pub const STRONGEST_MIN_WAIT_SECS: f64 = 6.0;

/// Waits below this many seconds end [`hop_chain`].
pub const HOP_MIN_WAIT_SECS: f64 = 1.0;

/// One outstanding transaction: `client` is blocked on `server`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerChainEdge {
    pub client_pid: u32,
    pub client_tid: u32,
    pub server_pid: u32,
    pub server_tid: u32,
    pub wait_secs: f64,
}

fn line_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^\s*outgoing transaction\b.*?\bfrom\s+(\d+):(\d+)\s+to\s+(\d+):(\d+)\b.*?\bwait:\s*(\d+(?:\.\d+)?)",
        )
        .expect("transaction line pattern is valid")
    })
}

/// Parse one log line; anything that is not an outgoing transaction is `None`.
pub fn parse_line(line: &str) -> Option<PeerChainEdge> {
    let caps = line_pattern().captures(line)?;
    let num = |idx: usize| -> Option<u32> { caps.get(idx)?.as_str().parse().ok() };
    Some(PeerChainEdge {
        client_pid: num(1)?,
        client_tid: num(2)?,
        server_pid: num(3)?,
        server_tid: num(4)?,
        wait_secs: caps.get(5)?.as_str().parse().ok()?,
    })
}

/// Client pid to outgoing edges, heaviest wait first.
#[derive(Debug, Clone, Default)]
pub struct WaitGraph {
    edges: BTreeMap<u32, Vec<PeerChainEdge>>,
}

impl WaitGraph {
    pub fn parse(text: &str) -> Self {
        let mut edges: BTreeMap<u32, Vec<PeerChainEdge>> = BTreeMap::new();
        for edge in text.lines().filter_map(parse_line) {
            edges.entry(edge.client_pid).or_default().push(edge);
        }
        for list in edges.values_mut() {
            // Stable: equal waits keep log order.
            list.sort_by(|a, b| b.wait_secs.total_cmp(&a.wait_secs));
        }
        Self { edges }
    }

    pub fn edges_from(&self, pid: u32) -> &[PeerChainEdge] {
        self.edges.get(&pid).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Distinct servers of `pid`, heaviest first.
    fn servers_of(&self, pid: u32) -> Vec<u32> {
        let mut seen = HashSet::new();
        self.edges_from(pid)
            .iter()
            .map(|edge| edge.server_pid)
            .filter(|server| seen.insert(*server))
            .collect()
    }
}

/// Peers plus the paths that led to them.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Resolution {
    /// Root included.
    pub pids: BTreeSet<u32>,
    /// Every terminated path, root first.
    pub paths: Vec<Vec<u32>>,
}

impl Resolution {
    fn root_only(root: u32) -> Self {
        Self {
            pids: BTreeSet::from([root]),
            paths: Vec::new(),
        }
    }

    /// Peers without the root, ascending.
    pub fn peers(&self, root: u32) -> Vec<u32> {
        self.pids.iter().copied().filter(|pid| *pid != root).collect()
    }
}

/// The root's heaviest direct servers: up to [`STRONGEST_MAX_PEERS`]
/// distinct pids, stopping at the first wait under
/// [`STRONGEST_MIN_WAIT_SECS`].
pub fn strongest_peers(graph: &WaitGraph, root: u32) -> Resolution {
    let mut resolution = Resolution::root_only(root);
    let mut collected = 0usize;
    for edge in graph.edges_from(root) {
        if collected >= STRONGEST_MAX_PEERS || edge.wait_secs < STRONGEST_MIN_WAIT_SECS {
            break;
        }
        if edge.server_pid == root || !resolution.pids.insert(edge.server_pid) {
            continue;
        }
        resolution.paths.push(vec![root, edge.server_pid]);
        collected += 1;
    }
    resolution
}

/// Depth-first walk of everything reachable from `root`.
///
/// Uses an explicit frame stack so depth is bounded by memory, not the call
/// stack. A path terminates when it
/// - reaches a pid already on the path (cycle, self-loops included),
/// - reaches a pid with no outgoing edges (leaf), or
/// - reaches a pid whose subtree was already fully explored.
///
/// Each terminated path is recorded including its final pid.
pub fn traverse(graph: &WaitGraph, root: u32) -> Resolution {
    let mut resolution = Resolution::root_only(root);
    let mut adjacency: HashMap<u32, Vec<u32>> = HashMap::new();
    let mut servers = |pid: u32| -> Vec<u32> {
        adjacency
            .entry(pid)
            .or_insert_with(|| graph.servers_of(pid))
            .clone()
    };

    if servers(root).is_empty() {
        resolution.paths.push(vec![root]);
        return resolution;
    }

    let mut explored: HashSet<u32> = HashSet::new();
    let mut on_path: HashSet<u32> = HashSet::from([root]);
    let mut path: Vec<u32> = vec![root];
    // (pid, index of the next server to visit)
    let mut frames: Vec<(u32, usize)> = vec![(root, 0)];

    while let Some(frame) = frames.last_mut() {
        let (pid, next) = *frame;
        let targets = servers(pid);
        let Some(&server) = targets.get(next) else {
            frames.pop();
            path.pop();
            on_path.remove(&pid);
            explored.insert(pid);
            continue;
        };
        frame.1 += 1;
        resolution.pids.insert(server);

        let terminal = on_path.contains(&server) || explored.contains(&server);
        if terminal || servers(server).is_empty() {
            let mut finished = path.clone();
            finished.push(server);
            resolution.paths.push(finished);
            if !terminal {
                explored.insert(server);
            }
            continue;
        }

        frames.push((server, 0));
        path.push(server);
        on_path.insert(server);
    }
    resolution
}

/// Reduce a full traversal to the first and last peer of every path.
pub fn head_tail(traversal: &Resolution, root: u32) -> Resolution {
    let mut pids = BTreeSet::from([root]);
    for path in &traversal.paths {
        let rest = path.get(1..).unwrap_or(&[]);
        if let (Some(first), Some(last)) = (rest.first(), rest.last()) {
            pids.insert(*first);
            pids.insert(*last);
        }
    }
    Resolution {
        pids,
        paths: traversal.paths.clone(),
    }
}

/// Follow the strongest wait hop by hop, for at most `max_hops` hops.
///
/// `read_log` is called once per hop and should return the current text of
/// the root's transaction log. The first hop matches lines whose client is
/// `root_tid` of the root, or any root thread when `root_tid` is 0 or that
/// thread has no outgoing transaction. Later hops match the previous hop's
/// server thread. The chain stops when the strongest match waits less than
/// [`HOP_MIN_WAIT_SECS`], when nothing matches, or when a pid repeats.
pub fn hop_chain<F>(root: u32, root_tid: u32, max_hops: u32, mut read_log: F) -> Resolution
where
    F: FnMut() -> Option<String>,
{
    let mut resolution = Resolution::root_only(root);
    let mut chain = vec![root];
    let mut key = (root, root_tid);

    for hop in 0..max_hops {
        let Some(text) = read_log() else {
            break;
        };
        let edges: Vec<PeerChainEdge> = text.lines().filter_map(parse_line).collect();
        let mut strongest = strongest_from(&edges, key);
        if strongest.is_none() && hop == 0 && key.1 != 0 {
            strongest = strongest_from(&edges, (root, 0));
        }
        let Some(edge) = strongest else {
            break;
        };
        if edge.wait_secs < HOP_MIN_WAIT_SECS || chain.contains(&edge.server_pid) {
            break;
        }
        chain.push(edge.server_pid);
        resolution.pids.insert(edge.server_pid);
        key = (edge.server_pid, edge.server_tid);
    }

    if chain.len() > 1 {
        resolution.paths.push(chain);
    }
    resolution
}

/// Heaviest edge whose client is `(pid, tid)`; tid 0 matches any thread.
/// The earliest line wins a tie.
fn strongest_from(edges: &[PeerChainEdge], (pid, tid): (u32, u32)) -> Option<PeerChainEdge> {
    edges
        .iter()
        .filter(|edge| edge.client_pid == pid && (tid == 0 || edge.client_tid == tid))
        .fold(None::<&PeerChainEdge>, |best, edge| match best {
            Some(best) if best.wait_secs >= edge.wait_secs => Some(best),
            _ => Some(edge),
        })
        .cloned()
}

/// Render paths as `a->b->c` lines.
pub fn format_paths(paths: &[Vec<u32>]) -> String {
    let mut out = String::new();
    for path in paths {
        let joined: Vec<String> = path.iter().map(u32::to_string).collect();
        out.push_str(&joined.join("->"));
        out.push('\n');
    }
    out
}
