//! Per (event, subject) throttle.
//!
//! A trigger is allowed when no run for the same event name and pid happened
//! within the rule's interval. Denial is a policy outcome, never an error.
//!
//! Each CLI invocation is a fresh process, so a limiter built with
//! [`RateLimiter::with_state`] reloads the table from a JSON file on start
//! and rewrites it after every recorded run.

use chrono::Utc;
use el_common::ProcessId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

type Key = (String, u32);

/// On-disk form of one table entry.
#[derive(Debug, Serialize, Deserialize)]
struct StateEntry {
    event: String,
    pid: u32,
    last_run: i64,
}

/// Last-run table keyed by event name and pid.
#[derive(Debug, Default)]
pub struct RateLimiter {
    last_run: Mutex<HashMap<Key, i64>>,
    state_path: Option<PathBuf>,
}

impl RateLimiter {
    /// In-memory limiter; nothing survives the process.
    pub fn new() -> Self {
        Self::default()
    }

    /// Limiter backed by `path`.
    ///
    /// A missing file starts an empty table. An unreadable or corrupt file
    /// is logged and also starts empty, so a damaged state file can never
    /// block collection.
    pub fn with_state(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let table = match load_state(&path) {
            Ok(table) => table,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring unreadable throttle state");
                HashMap::new()
            }
        };
        Self {
            last_run: Mutex::new(table),
            state_path: Some(path),
        }
    }

    /// Check and record a trigger at the current wall-clock second.
    pub fn allow(&self, event: &str, pid: ProcessId, interval_secs: u64) -> bool {
        self.allow_at(event, pid, interval_secs, Utc::now().timestamp())
    }

    /// Check and record a trigger at `now` (unix seconds).
    ///
    /// An interval of zero always allows. A denial leaves the table
    /// untouched. Entries of the same event name older than the interval are
    /// evicted on every call.
    pub fn allow_at(&self, event: &str, pid: ProcessId, interval_secs: u64, now: i64) -> bool {
        if interval_secs == 0 {
            return true;
        }
        let interval = i64::try_from(interval_secs).unwrap_or(i64::MAX);
        let mut table = self.table();

        let key = (event.to_string(), pid.0);
        if let Some(&last) = table.get(&key) {
            if now.saturating_sub(last) < interval {
                debug!(event, pid = pid.0, age = now - last, interval, "trigger throttled");
                return false;
            }
        }

        table.retain(|(name, _), last| name != event || now.saturating_sub(*last) <= interval);
        table.insert(key, now);

        if let Some(path) = &self.state_path {
            if let Err(e) = save_state(path, &table) {
                warn!(path = %path.display(), error = %e, "failed to persist throttle state");
            }
        }
        true
    }

    /// Number of tracked (event, pid) pairs.
    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn table(&self) -> MutexGuard<'_, HashMap<Key, i64>> {
        // Entries are plain timestamps; a poisoned table is still consistent.
        self.last_run.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn load_state(path: &Path) -> io::Result<HashMap<Key, i64>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(e),
    };
    let entries: Vec<StateEntry> = serde_json::from_reader(BufReader::new(file))?;
    Ok(entries
        .into_iter()
        .map(|entry| ((entry.event, entry.pid), entry.last_run))
        .collect())
}

/// Write via a sibling temp file and rename, so readers never see a torn table.
fn save_state(path: &Path, table: &HashMap<Key, i64>) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut entries: Vec<StateEntry> = table
        .iter()
        .map(|((event, pid), last_run)| StateEntry {
            event: event.clone(),
            pid: *pid,
            last_run: *last_run,
        })
        .collect();
    entries.sort_by(|a, b| (&a.event, a.pid).cmp(&(&b.event, b.pid)));

    let temp_path = path.with_extension("tmp");
    let writer = BufWriter::new(File::create(&temp_path)?);
    serde_json::to_writer_pretty(writer, &entries)?;
    fs::rename(&temp_path, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const PID: ProcessId = ProcessId(1234);

    #[test]
    fn test_zero_interval_always_allows_without_recording() {
        let limiter = RateLimiter::new();
        assert!(limiter.allow_at("E", PID, 0, 100));
        assert!(limiter.allow_at("E", PID, 0, 100));
        assert!(limiter.is_empty());
    }

    #[test]
    fn test_denies_within_interval_and_allows_after() {
        let limiter = RateLimiter::new();
        assert!(limiter.allow_at("E", PID, 10, 1000));
        assert!(!limiter.allow_at("E", PID, 10, 1005));
        assert!(!limiter.allow_at("E", PID, 10, 1009));
        assert!(limiter.allow_at("E", PID, 10, 1010));
        assert!(!limiter.allow_at("E", PID, 10, 1015));
    }

    #[test]
    fn test_denial_does_not_refresh_timestamp() {
        let limiter = RateLimiter::new();
        assert!(limiter.allow_at("E", PID, 10, 0));
        assert!(!limiter.allow_at("E", PID, 10, 9));
        // Measured from the allowed run at 0, not the denial at 9.
        assert!(limiter.allow_at("E", PID, 10, 10));
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = RateLimiter::new();
        assert!(limiter.allow_at("E", PID, 10, 0));
        assert!(limiter.allow_at("E", ProcessId(1), 10, 1));
        assert!(limiter.allow_at("F", PID, 10, 2));
        assert_eq!(limiter.len(), 3);
    }

    #[test]
    fn test_stale_entries_of_same_event_are_evicted() {
        let limiter = RateLimiter::new();
        assert!(limiter.allow_at("E", ProcessId(1), 10, 0));
        assert!(limiter.allow_at("E", ProcessId(2), 10, 5));
        assert!(limiter.allow_at("F", ProcessId(3), 10, 0));
        assert_eq!(limiter.len(), 3);

        // pid 1 is 20s old and goes; pid 2 is 15s old and goes; F is untouched.
        assert!(limiter.allow_at("E", ProcessId(4), 10, 20));
        assert_eq!(limiter.len(), 2);
    }

    #[test]
    fn test_shared_across_threads() {
        let limiter = Arc::new(RateLimiter::new());
        let allowed: usize = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                thread::spawn(move || limiter.allow_at("E", PID, 60, 500))
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| usize::from(h.join().unwrap()))
            .sum();
        assert_eq!(allowed, 1);
    }

    #[test]
    fn test_state_survives_a_new_limiter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("throttle.json");

        let first = RateLimiter::with_state(&path);
        assert!(first.allow_at("E", PID, 60, 1000));
        drop(first);
        assert!(path.exists());

        let second = RateLimiter::with_state(&path);
        assert_eq!(second.len(), 1);
        assert!(!second.allow_at("E", PID, 60, 1030));
        assert!(second.allow_at("E", PID, 60, 1060));
        assert!(second.allow_at("E", ProcessId(7), 60, 1030));
    }

    #[test]
    fn test_zero_interval_does_not_touch_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("throttle.json");
        let limiter = RateLimiter::with_state(&path);
        assert!(limiter.allow_at("E", PID, 0, 1000));
        assert!(!path.exists());
    }

    #[test]
    fn test_corrupt_state_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("throttle.json");
        fs::write(&path, "{not json").unwrap();

        let limiter = RateLimiter::with_state(&path);
        assert!(limiter.is_empty());
        assert!(limiter.allow_at("E", PID, 60, 1000));

        let reloaded = RateLimiter::with_state(&path);
        assert!(!reloaded.allow_at("E", PID, 60, 1001));
    }

    #[test]
    fn test_state_dir_is_created_on_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/state/throttle.json");
        let limiter = RateLimiter::with_state(&path);
        assert!(limiter.allow_at("E", PID, 5, 0));
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
    }
}
