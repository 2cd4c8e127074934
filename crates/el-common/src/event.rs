//! Fault/trigger events delivered to the collector.
//!
//! An [`Event`] is created by the external event source and handed to the
//! collector for the duration of one call. Collection only ever mutates the
//! payload map; identity fields are fixed at construction.

use crate::id::ProcessId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Well-known payload keys.
pub mod payload_keys {
    /// Subject pid as decimal text (overrides `Event::pid` when present).
    pub const PID: &str = "PID";
    /// Package name of the subject, used for name lookup.
    pub const PACKAGE_NAME: &str = "PACKAGE_NAME";
    /// Process name of the subject, used for name lookup.
    pub const PROCESS_NAME: &str = "PROCESS_NAME";
    /// Free-text message copied into the artifact summary.
    pub const MSG: &str = "MSG";

    /// Comma-joined peer pids resolved from the IPC wait graph.
    pub const PEER_CHAIN_PIDS: &str = "PEER_CHAIN_PIDS";
    /// Path of the artifact written for this event.
    pub const LOG_PATH: &str = "LOG_PATH";
}

/// A fault/trigger event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Identifier of the component that raised the event.
    #[serde(default)]
    pub sender: String,
    /// Event name, e.g. `THREAD_BLOCK_6S`.
    pub name: String,
    /// Subject process.
    #[serde(default = "unknown_pid")]
    pub pid: ProcessId,
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub tid: u32,
    #[serde(default = "Utc::now")]
    pub happen_time: DateTime<Utc>,
    /// Free-form payload.
    #[serde(default)]
    pub payload: BTreeMap<String, String>,
    /// Monotonic sequence number assigned by [`EventSequence`].
    #[serde(default)]
    pub seq: u64,
}

fn unknown_pid() -> ProcessId {
    ProcessId(0)
}

impl Event {
    /// Create an event for `name` about `pid`, stamped now.
    pub fn new(name: impl Into<String>, pid: impl Into<ProcessId>) -> Self {
        Self {
            sender: String::new(),
            name: name.into(),
            pid: pid.into(),
            uid: 0,
            tid: 0,
            happen_time: Utc::now(),
            payload: BTreeMap::new(),
            seq: 0,
        }
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = sender.into();
        self
    }

    pub fn with_uid(mut self, uid: u32) -> Self {
        self.uid = uid;
        self
    }

    pub fn with_tid(mut self, tid: u32) -> Self {
        self.tid = tid;
        self
    }

    /// Insert a payload value, returning self for chaining.
    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.payload.get(key).map(String::as_str)
    }

    pub fn set_value(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.payload.insert(key.into(), value.into());
    }

    /// The subject pid: payload `PID` when it parses, otherwise the header pid.
    pub fn subject_pid(&self) -> ProcessId {
        self.value(payload_keys::PID)
            .and_then(|v| v.parse::<ProcessId>().ok())
            .filter(ProcessId::is_valid)
            .unwrap_or(self.pid)
    }

    /// The subject name used when the pid cannot be trusted.
    ///
    /// Process name wins over package name.
    pub fn subject_name(&self) -> Option<&str> {
        self.value(payload_keys::PROCESS_NAME)
            .or_else(|| self.value(payload_keys::PACKAGE_NAME))
            .filter(|name| !name.trim().is_empty())
    }

    pub fn message(&self) -> &str {
        self.value(payload_keys::MSG).unwrap_or("")
    }
}

/// Monotonic sequence source for events. Sequence 0 means "unassigned",
/// so a fresh source starts at 1.
#[derive(Debug)]
pub struct EventSequence {
    next: AtomicU64,
}

impl Default for EventSequence {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

impl EventSequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start counting from `start` (e.g. restored from a previous run).
    pub fn starting_at(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
        }
    }

    /// Stamp `event` with the next sequence number and return it.
    pub fn assign(&self, event: &mut Event) -> u64 {
        let seq = self.next.fetch_add(1, Ordering::SeqCst);
        event.seq = seq;
        seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_pid_prefers_payload() {
        let event = Event::new("THREAD_BLOCK_6S", 10).with_value(payload_keys::PID, "77");
        assert_eq!(event.subject_pid(), ProcessId(77));

        let event = Event::new("THREAD_BLOCK_6S", 10).with_value(payload_keys::PID, "garbage");
        assert_eq!(event.subject_pid(), ProcessId(10));

        let event = Event::new("THREAD_BLOCK_6S", 10).with_value(payload_keys::PID, "0");
        assert_eq!(event.subject_pid(), ProcessId(10));
    }

    #[test]
    fn test_subject_name_prefers_process_name() {
        let event = Event::new("APP_FREEZE", 0)
            .with_value(payload_keys::PACKAGE_NAME, "com.example")
            .with_value(payload_keys::PROCESS_NAME, "example:render");
        assert_eq!(event.subject_name(), Some("example:render"));

        let event = Event::new("APP_FREEZE", 0).with_value(payload_keys::PROCESS_NAME, "  ");
        assert_eq!(event.subject_name(), None);
    }

    #[test]
    fn test_sequence_is_monotonic() {
        let seq = EventSequence::starting_at(5);
        let mut a = Event::new("A", 1);
        let mut b = Event::new("B", 1);
        assert_eq!(seq.assign(&mut a), 5);
        assert_eq!(seq.assign(&mut b), 6);
        assert!(b.seq > a.seq);

        let mut c = Event::new("C", 1);
        assert_eq!(EventSequence::new().assign(&mut c), 1);
    }

    #[test]
    fn test_event_deserializes_with_defaults() {
        let event: Event = serde_json::from_str(r#"{"name":"THREAD_BLOCK_6S","pid":321}"#).unwrap();
        assert_eq!(event.pid, ProcessId(321));
        assert_eq!(event.uid, 0);
        assert!(event.payload.is_empty());
        assert_eq!(event.message(), "");
    }
}
