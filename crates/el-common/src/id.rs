//! Process identity types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Process ID wrapper with display formatting.
///
/// Zero is never a valid subject; it marks "unknown, resolve by name".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(pub u32);

impl ProcessId {
    /// Returns true if this pid can name a live process.
    pub fn is_valid(&self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ProcessId {
    fn from(pid: u32) -> Self {
        ProcessId(pid)
    }
}

impl std::str::FromStr for ProcessId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u32>().map(ProcessId)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_id_display_and_parse() {
        let pid: ProcessId = " 1234 ".parse().unwrap();
        assert_eq!(pid, ProcessId(1234));
        assert_eq!(pid.to_string(), "1234");
        assert!(pid.is_valid());
        assert!(!ProcessId(0).is_valid());
        assert!("abc".parse::<ProcessId>().is_err());
    }

    #[test]
    fn test_process_id_serializes_transparently() {
        let json = serde_json::to_string(&ProcessId(42)).unwrap();
        assert_eq!(json, "42");
    }
}
