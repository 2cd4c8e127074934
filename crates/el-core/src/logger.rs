//! Event entry point: rule lookup, throttling, collection, write-back.

use crate::catcher::CatcherEnv;
use crate::command::CatcherRegistry;
use crate::config::{Config, Rule};
use crate::logging::generate_run_id;
use crate::rate_limit::RateLimiter;
use crate::store::{FileLogStore, LogStore};
use crate::task::{CatcherOutcome, TaskOptions, TaskRunner, TaskState};
use el_common::{payload_keys, Event, EventSequence, Result};
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use tracing::{debug, info, info_span};

/// Outcome of one collection run.
#[derive(Debug, Clone, Serialize)]
pub struct CollectionReport {
    pub run_id: String,
    pub event: String,
    pub pid: u32,
    pub seq: u64,
    pub command: String,
    pub state: TaskState,
    pub total_bytes: u64,
    pub log_path: PathBuf,
    pub catchers: Vec<CatcherOutcome>,
    /// Peer pids resolved by the peer-chain catcher, ascending.
    pub peers: Vec<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<String>,
}

/// Receives events and turns the ones with a rule into artifacts.
#[derive(Debug)]
pub struct EventLogger<S: LogStore = FileLogStore> {
    config: Config,
    registry: CatcherRegistry,
    limiter: RateLimiter,
    store: S,
    sequence: EventSequence,
}

/// Throttle table file kept next to the artifacts.
pub const THROTTLE_STATE_FILE: &str = "throttle.json";

impl EventLogger<FileLogStore> {
    /// Logger over procfs and the configured store directory.
    ///
    /// The throttle table persists in the store directory so intervals hold
    /// across separate invocations.
    pub fn from_config(config: Config) -> Self {
        let registry = CatcherRegistry::new(CatcherEnv::from_config(&config));
        let store = FileLogStore::new(config.store.dir.clone(), config.store.max_files);
        let limiter = RateLimiter::with_state(config.store.dir.join(THROTTLE_STATE_FILE));
        Self::new(config, registry, store).with_rate_limiter(limiter)
    }
}

impl<S: LogStore> EventLogger<S> {
    pub fn new(config: Config, registry: CatcherRegistry, store: S) -> Self {
        Self {
            config,
            registry,
            limiter: RateLimiter::new(),
            store,
            sequence: EventSequence::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    /// Collect evidence for `event` according to its configured rule.
    ///
    /// Returns `None` when no rule matches or the trigger is throttled.
    pub fn handle(&self, event: &mut Event) -> Result<Option<CollectionReport>> {
        let Some(rule) = self.config.rule_for(&event.name).cloned() else {
            debug!(event = %event.name, "no collection rule");
            return Ok(None);
        };
        self.handle_rule(event, &rule)
    }

    /// Collect evidence for `event` with an explicit rule.
    pub fn handle_rule(&self, event: &mut Event, rule: &Rule) -> Result<Option<CollectionReport>> {
        if event.seq == 0 {
            self.sequence.assign(event);
        }
        let run_id = generate_run_id();
        let span = info_span!("collect", run_id = %run_id, event = %event.name, seq = event.seq);
        let _guard = span.enter();

        let pid = event.subject_pid();
        if !self.limiter.allow(&event.name, pid, rule.interval_secs) {
            info!(pid = pid.0, interval = rule.interval_secs, "collection throttled");
            return Ok(None);
        }

        let locator = event.subject_name().unwrap_or_default().to_string();
        let commands = self.registry.parse(&rule.command, &locator, pid, event.tid);
        info!(
            pid = pid.0,
            command = %rule.command,
            queued = commands.len(),
            "starting collection"
        );

        let mut artifact = self.store.allocate(event)?;
        write_summary(&mut artifact.file, event)?;

        let mut runner = TaskRunner::new(commands, TaskOptions::from(&self.config.collection));
        let task = runner.run(&mut artifact.file);
        runner.publish(event);
        event.set_value(
            payload_keys::LOG_PATH,
            artifact.path.to_string_lossy().into_owned(),
        );

        let peers = event
            .value(payload_keys::PEER_CHAIN_PIDS)
            .map(|joined| {
                joined
                    .split(',')
                    .filter_map(|pid| pid.trim().parse().ok())
                    .collect()
            })
            .unwrap_or_default();

        info!(
            state = %task.state,
            bytes = task.total_bytes,
            path = %artifact.path.display(),
            "collection finished"
        );
        Ok(Some(CollectionReport {
            run_id,
            event: event.name.clone(),
            pid: pid.0,
            seq: event.seq,
            command: rule.command.clone(),
            state: task.state,
            total_bytes: task.total_bytes,
            log_path: artifact.path,
            catchers: task.outcomes,
            peers,
            stopped_at: task.stopped_at,
        }))
    }
}

/// Event header written before any catcher output.
fn write_summary(out: &mut impl Write, event: &Event) -> std::io::Result<()> {
    writeln!(out, "EVENT_NAME: {}", event.name)?;
    writeln!(out, "PID: {}", event.subject_pid())?;
    writeln!(out, "UID: {}", event.uid)?;
    writeln!(out, "TID: {}", event.tid)?;
    writeln!(out, "HAPPEN_TIME: {}", event.happen_time.to_rfc3339())?;
    writeln!(out, "SEQ: {}", event.seq)?;
    if !event.sender.is_empty() {
        writeln!(out, "SENDER: {}", event.sender)?;
    }
    writeln!(out, "MSG: {}", event.message())?;
    writeln!(out)
}
