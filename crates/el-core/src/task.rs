//! Collection task: runs queued catchers into one artifact under a budget.
//!
//! # State machine
//!
//! ```text
//! Runnable -> Running -> { Success | Timeout | ExceededSize | Fatal }
//!     any state -> Destroyed   (external abort)
//! ```
//!
//! The byte budget is checked between catchers only. An external
//! [`TaskHandle::abort`] is observed before and after every step and also
//! cancels the in-flight catcher.

use crate::cancel::CancelToken;
use crate::command::CatcherCommand;
use crate::config::CollectionConfig;
use el_common::Event;
use serde::Serialize;
use std::fmt;
use std::fs::File;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Lifecycle of a collection task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum TaskState {
    Runnable = 0,
    Running = 1,
    Success = 2,
    Timeout = 3,
    ExceededSize = 4,
    /// Reserved for callers that escalate catcher failures; the runner
    /// itself treats failures as non-fatal.
    SubtaskFailed = 5,
    Fatal = 6,
    Destroyed = 7,
}

impl TaskState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => TaskState::Runnable,
            1 => TaskState::Running,
            2 => TaskState::Success,
            3 => TaskState::Timeout,
            4 => TaskState::ExceededSize,
            5 => TaskState::SubtaskFailed,
            6 => TaskState::Fatal,
            _ => TaskState::Destroyed,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskState::Runnable | TaskState::Running)
    }

    /// Whether `self -> next` is allowed. States never regress; `Destroyed`
    /// is reachable from anywhere.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        match (self, next) {
            (_, TaskState::Destroyed) => self != TaskState::Destroyed,
            (TaskState::Runnable, TaskState::Runnable) => false,
            (TaskState::Runnable, _) => true,
            (TaskState::Running, next) => next.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Runnable => "Runnable",
            TaskState::Running => "Running",
            TaskState::Success => "Success",
            TaskState::Timeout => "Timeout",
            TaskState::ExceededSize => "ExceededSize",
            TaskState::SubtaskFailed => "SubtaskFailed",
            TaskState::Fatal => "Fatal",
            TaskState::Destroyed => "Destroyed",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Atomic state cell shared by a runner and its handles.
#[derive(Debug, Clone)]
struct StateCell(Arc<AtomicU8>);

impl StateCell {
    fn new(state: TaskState) -> Self {
        Self(Arc::new(AtomicU8::new(state as u8)))
    }

    fn get(&self) -> TaskState {
        TaskState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Move to `next` if the transition is legal. Returns whether it happened.
    fn advance(&self, next: TaskState) -> bool {
        self.0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |raw| {
                TaskState::from_u8(raw)
                    .can_transition_to(next)
                    .then_some(next as u8)
            })
            .is_ok()
    }
}

/// Cloneable control surface for a running task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    state: StateCell,
    cancel: CancelToken,
}

impl TaskHandle {
    pub fn state(&self) -> TaskState {
        self.state.get()
    }

    /// Stop the task from outside. Only `Timeout` and `Destroyed` are
    /// accepted; returns whether the state changed.
    pub fn abort(&self, reason: TaskState) -> bool {
        if !matches!(reason, TaskState::Timeout | TaskState::Destroyed) {
            return false;
        }
        let changed = self.state.advance(reason);
        if changed {
            self.cancel.cancel();
        }
        changed
    }
}

/// Budgets applied to one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOptions {
    pub max_bytes: u64,
    /// Pause between stopping the outgoing catcher and writing the trailer.
    pub stop_quantum: Duration,
    /// Wall-clock budget, checked between catchers.
    pub timeout: Option<Duration>,
}

impl From<&CollectionConfig> for TaskOptions {
    fn from(config: &CollectionConfig) -> Self {
        Self {
            max_bytes: config.max_log_bytes,
            stop_quantum: Duration::from_millis(config.stop_quantum_ms),
            timeout: (config.task_timeout_ms > 0)
                .then(|| Duration::from_millis(config.task_timeout_ms)),
        }
    }
}

/// What one catcher contributed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatcherOutcome {
    pub token: String,
    pub description: String,
    pub bytes: u64,
    /// Negative sentinel on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CatcherOutcome {
    pub fn succeeded(&self) -> bool {
        self.code.is_none()
    }
}

/// Result of [`TaskRunner::run`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskReport {
    pub state: TaskState,
    /// Sum of successful catcher byte counts; headers and notes excluded.
    pub total_bytes: u64,
    pub outcomes: Vec<CatcherOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<String>,
}

/// Runs queued catchers strictly in order into one sink.
#[derive(Debug)]
pub struct TaskRunner {
    commands: Vec<CatcherCommand>,
    options: TaskOptions,
    state: StateCell,
    cancel: CancelToken,
}

impl TaskRunner {
    pub fn new(commands: Vec<CatcherCommand>, options: TaskOptions) -> Self {
        let initial = if commands.is_empty() {
            TaskState::Success
        } else {
            TaskState::Runnable
        };
        Self {
            commands,
            options,
            state: StateCell::new(initial),
            cancel: CancelToken::new(),
        }
    }

    pub fn handle(&self) -> TaskHandle {
        TaskHandle {
            state: self.state.clone(),
            cancel: self.cancel.clone(),
        }
    }

    pub fn state(&self) -> TaskState {
        self.state.get()
    }

    pub fn commands(&self) -> &[CatcherCommand] {
        &self.commands
    }

    /// Let every catcher annotate `event`.
    pub fn publish(&self, event: &mut Event) {
        for command in &self.commands {
            command.publish(event);
        }
    }

    /// Run every queued catcher into `sink`.
    ///
    /// Catcher failures are annotated and skipped. Only a failure to write
    /// the artifact itself ends the task as `Fatal`.
    #[instrument(skip_all, fields(catchers = self.commands.len()))]
    pub fn run(&mut self, sink: &mut File) -> TaskReport {
        let mut report = TaskReport {
            state: self.state(),
            total_bytes: 0,
            outcomes: Vec::new(),
            stopped_at: None,
        };
        if self.commands.is_empty() || !self.state.advance(TaskState::Running) {
            report.state = self.state();
            return report;
        }

        let started = Instant::now();
        let count = self.commands.len();
        for index in 0..count {
            let description = self.commands[index].description();

            if let Some(reason) = self.interrupted(started) {
                self.finish_early(sink, &description, reason, &mut report);
                return report;
            }

            match self.run_step(index, sink) {
                Ok(outcome) => {
                    report.total_bytes += outcome.bytes;
                    report.outcomes.push(outcome);
                }
                Err(e) => {
                    warn!(error = %e, catcher = %description, "artifact write failed");
                    self.state.advance(TaskState::Fatal);
                    report.state = self.state();
                    report.stopped_at = Some(description);
                    return report;
                }
            }

            if let Some(reason) = self.aborted() {
                self.finish_early(sink, &description, reason, &mut report);
                return report;
            }

            if report.total_bytes > self.options.max_bytes && index + 1 < count {
                info!(
                    total = report.total_bytes,
                    max = self.options.max_bytes,
                    skipped = count - index - 1,
                    "byte budget exceeded"
                );
                self.state.advance(TaskState::ExceededSize);
                self.commands[index].stop();
                thread::sleep(self.options.stop_quantum);
                let reason = self.state();
                self.finish_early(sink, &description, reason, &mut report);
                return report;
            }
        }

        self.state.advance(TaskState::Success);
        report.state = self.state();
        debug!(state = %report.state, total = report.total_bytes, "task finished");
        report
    }

    /// One catcher: header, catch through a duplicated handle, failure note.
    fn run_step(&mut self, index: usize, sink: &mut File) -> io::Result<CatcherOutcome> {
        let command = &mut self.commands[index];
        command.attach(&self.cancel);
        let description = command.description();

        let mut step_sink = sink.try_clone()?;
        writeln!(step_sink, "{}:", description)?;
        let result = command.catch(&mut step_sink);
        drop(step_sink);

        let outcome = match result {
            Ok(bytes) => CatcherOutcome {
                token: command.token().to_string(),
                description,
                bytes,
                code: None,
                error: None,
            },
            Err(e) => {
                debug!(catcher = %description, error = %e, "catcher not successful");
                write!(
                    sink,
                    "\nCatcher {} is not successful, ret:{}\n",
                    description,
                    e.code()
                )?;
                CatcherOutcome {
                    token: command.token().to_string(),
                    description,
                    bytes: 0,
                    code: Some(e.code()),
                    error: Some(e.to_string()),
                }
            }
        };
        Ok(outcome)
    }

    fn aborted(&self) -> Option<TaskState> {
        match self.state() {
            TaskState::Running => None,
            other => Some(other),
        }
    }

    fn interrupted(&self, started: Instant) -> Option<TaskState> {
        if let Some(state) = self.aborted() {
            return Some(state);
        }
        let budget = self.options.timeout?;
        if started.elapsed() >= budget && self.state.advance(TaskState::Timeout) {
            self.cancel.cancel();
            return Some(TaskState::Timeout);
        }
        self.aborted()
    }

    fn finish_early(
        &self,
        sink: &mut File,
        description: &str,
        reason: TaskState,
        report: &mut TaskReport,
    ) {
        info!(reason = %reason, catcher = %description, "task stopped early");
        if let Err(e) = write!(
            sink,
            "\nTask stopped when running catcher:{}, Reason:{}\n",
            description, reason
        ) {
            warn!(error = %e, "failed to write stop trailer");
        }
        report.state = self.state();
        report.stopped_at = Some(description.to_string());
    }
}
