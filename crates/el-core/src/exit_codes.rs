//! Exit codes for the event-logger CLI.
//!
//! Exit code ranges:
//! - 0-9: operational outcomes (a report or an explicit "nothing done")
//! - 10-19: user/environment errors (recoverable by user action)
//! - 20-29: internal errors

use crate::task::TaskState;
use el_common::{Error, ErrorCategory};

/// Exit codes for event-logger operations.
///
/// These codes are a stable contract for automation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    // ========================================================================
    // Operational Outcomes (0-9)
    // ========================================================================
    /// Collection ran to completion
    Clean = 0,

    /// No rule for the event, or the trigger was throttled
    NotCollected = 1,

    /// Artifact written but collection stopped early (budget, timeout, abort)
    Truncated = 2,

    // ========================================================================
    // User / Environment Errors (10-19)
    // ========================================================================
    /// Invalid arguments or event input
    ArgsError = 10,

    /// Configuration file missing, unparsable or invalid
    ConfigError = 11,

    // ========================================================================
    // Internal Errors (20-29)
    // ========================================================================
    /// Internal error (bug - please report)
    InternalError = 20,

    /// I/O error, including artifact allocation
    IoError = 21,
}

impl ExitCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Exit code for a finished collection task.
    pub fn for_task(state: TaskState) -> Self {
        match state {
            TaskState::Success => ExitCode::Clean,
            TaskState::ExceededSize | TaskState::Timeout | TaskState::Destroyed => {
                ExitCode::Truncated
            }
            TaskState::Fatal => ExitCode::IoError,
            TaskState::Runnable | TaskState::Running | TaskState::SubtaskFailed => {
                ExitCode::InternalError
            }
        }
    }
}

impl From<&Error> for ExitCode {
    fn from(err: &Error) -> Self {
        match err.category() {
            ErrorCategory::Config => ExitCode::ConfigError,
            ErrorCategory::Store | ErrorCategory::Io => ExitCode::IoError,
        }
    }
}
