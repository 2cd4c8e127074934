//! Evidence collection primitives.
//!
//! This module provides the low-level pieces catchers are built from:
//! - procfs parsers for CPU and memory snapshots
//! - pid/name lookup over procfs
//! - helper process runner with bounded wait and forced kill

pub mod proc_parsers;
pub mod process_lookup;
pub mod tool_runner;

pub use proc_parsers::{CpuTimes, LoadAvg, MemInfo, ProcStat};
pub use process_lookup::{ProcFsLookup, ProcessLookup};
pub use tool_runner::{run_into, ToolError, ToolOutcome, ToolSpec};
