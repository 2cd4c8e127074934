//! Event Logger Core Library
//!
//! Fault-triggered evidence collection:
//! - Catchers for stacks, kernel IPC state, CPU/memory snapshots and IPC
//!   peer chains
//! - Command parsing into ordered catcher lists
//! - A budgeted task runner writing one artifact per event
//! - Per (event, pid) throttling and artifact retention
//!
//! The binary entry point is in `main.rs`.

pub mod cancel;
pub mod catcher;
pub mod collect;
pub mod command;
pub mod config;
pub mod exit_codes;
pub mod logger;
pub mod logging;
pub mod rate_limit;
pub mod store;
pub mod task;
pub mod wait_graph;

pub use cancel::CancelToken;
pub use command::{CatcherCommand, CatcherRegistry};
pub use logger::{CollectionReport, EventLogger};
pub use task::{TaskHandle, TaskRunner, TaskState};
