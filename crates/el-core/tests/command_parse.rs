//! Command string parsing against a procfs fixture.

#![cfg(unix)]

use el_common::ProcessId;
use el_core::catcher::CatcherEnv;
use el_core::config::Config;
use el_core::CatcherRegistry;
use proptest::prelude::*;
use std::fs;
use std::path::Path;

const SUBJECT: u32 = 42;

/// Tokens paired with whether they produce a queued catcher for a live subject.
const POOL: &[(&str, bool)] = &[
    ("s", true),
    ("S", true),
    ("b", true),
    ("c", true),
    ("m", true),
    ("pb", true),
    ("pb:-1", true),
    ("pb:-2", true),
    ("pb:4", true),
    (" c ", true),
    ("x", false),
    ("s:1", false),
    ("pb:abc", false),
    ("pb:0", false),
    ("pb:-3", false),
    ("", false),
];

struct Fixture {
    _dir: tempfile::TempDir,
    registry: CatcherRegistry,
}

fn write_process(root: &Path, pid: u32, comm: &str) {
    let dir = root.join(pid.to_string());
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("comm"), format!("{}\n", comm)).unwrap();
    fs::write(dir.join("cmdline"), format!("/usr/bin/{}\0", comm)).unwrap();
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let proc_root = dir.path().join("proc");
    write_process(&proc_root, SUBJECT, "worker");
    write_process(&proc_root, 7, "watchdogd");

    let raw = dir.path().join("ipc_state");
    fs::write(&raw, "proc 42\n").unwrap();

    let mut config = Config::default();
    config.paths.proc_root = proc_root;
    config.paths.raw_ipc_files = vec![raw];
    config.paths.ipc_transaction_log = dir.path().join("transactions").display().to_string();
    config.system_watch_list = vec!["watchdogd".to_string()];
    config.stack.command = vec![
        "sh".to_string(),
        "-c".to_string(),
        "echo stack {pid}".to_string(),
    ];

    Fixture {
        registry: CatcherRegistry::new(CatcherEnv::from_config(&config)),
        _dir: dir,
    }
}

proptest! {
    #[test]
    fn queued_count_matches_recognized_tokens(
        picks in prop::collection::vec(0..POOL.len(), 0..12),
    ) {
        let fx = fixture();
        let command = picks.iter().map(|i| POOL[*i].0).collect::<Vec<_>>().join(",");
        let expected: Vec<String> = picks
            .iter()
            .filter(|i| POOL[**i].1)
            .map(|i| POOL[*i].0.trim().split(':').next().unwrap().to_string())
            .collect();

        let queued = fx.registry.parse(&command, "worker", ProcessId(SUBJECT), 0);
        let tokens: Vec<String> = queued.iter().map(|c| c.token().to_string()).collect();
        prop_assert_eq!(tokens, expected);
    }
}

#[test]
fn stale_pid_resolves_by_name() {
    let fx = fixture();
    let queued = fx.registry.parse("s,c,m", "worker", ProcessId(9999), 0);
    assert_eq!(queued.len(), 3);
    for command in &queued {
        assert!(
            command.description().contains("pid==42"),
            "{}",
            command.description()
        );
    }
}

#[test]
fn unresolvable_subject_keeps_system_catchers() {
    let fx = fixture();
    let queued = fx.registry.parse("s,S,b,c,m,pb", "ghost", ProcessId(9999), 0);
    let tokens: Vec<&str> = queued.iter().map(|c| c.token()).collect();
    assert_eq!(tokens, vec!["S", "b"]);
}

#[test]
fn argument_is_preserved_on_queued_command() {
    let fx = fixture();
    let queued = fx.registry.parse("pb:3", "worker", ProcessId(SUBJECT), 0);
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].arg(), Some("3"));
    assert!(queued[0].description().contains("layer==hops:3"));
}

#[test]
fn event_thread_reaches_peer_chain_walk() {
    let fx = fixture();
    let queued = fx.registry.parse("pb:2", "worker", ProcessId(SUBJECT), 43);
    assert_eq!(queued.len(), 1);
    assert!(queued[0].description().ends_with("layer==hops:2 tid==43"));
}
