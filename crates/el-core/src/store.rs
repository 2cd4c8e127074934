//! Artifact allocation and retention.

use chrono::{DateTime, Utc};
use el_common::Event;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Extension of every artifact file.
pub const ARTIFACT_EXTENSION: &str = "log";

/// Attempts at finding an unused file name before giving up.
const MAX_NAME_ATTEMPTS: u32 = 1000;

#[derive(Debug, Error)]
pub enum LogStoreError {
    #[error("cannot create log directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot create artifact {path}: {source}")]
    CreateFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no free artifact name in {0}")]
    Exhausted(PathBuf),
}

impl From<LogStoreError> for el_common::Error {
    fn from(err: LogStoreError) -> Self {
        el_common::Error::Store(err.to_string())
    }
}

/// A freshly created, empty artifact.
#[derive(Debug)]
pub struct Artifact {
    pub path: PathBuf,
    pub file: File,
}

/// Hands out one new artifact file per collection.
pub trait LogStore {
    fn allocate(&self, event: &Event) -> Result<Artifact, LogStoreError>;
}

/// [`LogStore`] over a directory, keeping at most `max_files` artifacts.
#[derive(Debug, Clone)]
pub struct FileLogStore {
    dir: PathBuf,
    max_files: usize,
}

impl FileLogStore {
    /// `max_files == 0` disables pruning.
    pub fn new(dir: impl Into<PathBuf>, max_files: usize) -> Self {
        Self {
            dir: dir.into(),
            max_files,
        }
    }

    /// Artifacts in the directory, oldest first.
    pub fn artifacts(&self) -> io::Result<Vec<PathBuf>> {
        let mut found: Vec<(std::time::SystemTime, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ARTIFACT_EXTENSION) {
                continue;
            }
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            found.push((meta.modified()?, path));
        }
        found.sort();
        Ok(found.into_iter().map(|(_, path)| path).collect())
    }

    /// Delete the oldest artifacts beyond the retention count, never `keep`.
    fn prune(&self, keep: &Path) {
        if self.max_files == 0 {
            return;
        }
        let artifacts = match self.artifacts() {
            Ok(artifacts) => artifacts,
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "cannot list artifacts");
                return;
            }
        };
        let excess = artifacts.len().saturating_sub(self.max_files);
        for path in artifacts.iter().filter(|p| p.as_path() != keep).take(excess) {
            match fs::remove_file(path) {
                Ok(()) => debug!(path = %path.display(), "pruned artifact"),
                Err(e) => warn!(path = %path.display(), error = %e, "cannot prune artifact"),
            }
        }
    }
}

impl LogStore for FileLogStore {
    fn allocate(&self, event: &Event) -> Result<Artifact, LogStoreError> {
        fs::create_dir_all(&self.dir).map_err(|source| LogStoreError::CreateDir {
            path: self.dir.clone(),
            source,
        })?;

        let stem = artifact_stem(event, Utc::now());
        for attempt in 0..MAX_NAME_ATTEMPTS {
            let name = if attempt == 0 {
                format!("{stem}.{ARTIFACT_EXTENSION}")
            } else {
                format!("{stem}-{attempt}.{ARTIFACT_EXTENSION}")
            };
            let path = self.dir.join(name);
            match OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(file) => {
                    self.prune(&path);
                    return Ok(Artifact { path, file });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(source) => return Err(LogStoreError::CreateFile { path, source }),
            }
        }
        Err(LogStoreError::Exhausted(self.dir.clone()))
    }
}

/// `<event>-<pid>-<yyyymmddHHMMSS>-<seq>`, event name reduced to a safe
/// file-name alphabet.
fn artifact_stem(event: &Event, now: DateTime<Utc>) -> String {
    let name: String = event
        .name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let name = if name.is_empty() { "event".to_string() } else { name };
    format!(
        "{}-{}-{}-{}",
        name,
        event.subject_pid(),
        now.format("%Y%m%d%H%M%S"),
        event.seq
    )
}
