//! Event logger common types and errors.
//!
//! This crate provides the foundational types shared by the collection core:
//! - Fault/trigger events and their payload keys
//! - Process identity wrapper
//! - Common error type with stable codes

pub mod error;
pub mod event;
pub mod id;

pub use error::{Error, ErrorCategory, Result};
pub use event::{payload_keys, Event, EventSequence};
pub use id::ProcessId;
