//! Parsers for procfs files used by the snapshot catchers.
//!
//! Every reader takes the procfs root explicitly so collectors can be pointed
//! at a fixture tree. `*_content` variants parse already-read text.
//!
//! # Files Parsed
//! - `<root>/[pid]/stat` - scheduler state and CPU ticks
//! - `<root>/[pid]/status` - memory and thread lines
//! - `<root>/stat` - aggregate CPU line
//! - `<root>/loadavg` - load averages
//! - `<root>/meminfo` - system memory headline

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Fields from `/proc/[pid]/stat`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcStat {
    pub comm: String,
    pub state: char,
    pub ppid: u32,
    /// User-mode ticks.
    pub utime: u64,
    /// Kernel-mode ticks.
    pub stime: u64,
    pub num_threads: u64,
    /// Start time in ticks since boot.
    pub starttime: u64,
    /// Virtual memory size in bytes.
    pub vsize: u64,
    /// Resident set size in pages.
    pub rss_pages: u64,
}

/// Aggregate CPU line from `/proc/stat`, in ticks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuTimes {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
}

impl CpuTimes {
    /// Sum of all fields, saturating at `u64::MAX`.
    pub fn total(&self) -> u64 {
        [
            self.user,
            self.nice,
            self.system,
            self.idle,
            self.iowait,
            self.irq,
            self.softirq,
        ]
        .into_iter()
        .fold(0u64, u64::saturating_add)
    }

    /// Busy share of total ticks since boot, in percent.
    pub fn busy_percent(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        let idle = self.idle.saturating_add(self.iowait);
        (total.saturating_sub(idle)) as f64 * 100.0 / total as f64
    }
}

/// Load averages from `/proc/loadavg`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadAvg {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
    /// `running/total` scheduling entities.
    pub tasks: String,
}

/// Headline fields of `/proc/meminfo`, in kB.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemInfo {
    pub mem_total_kb: u64,
    pub mem_free_kb: u64,
    pub mem_available_kb: u64,
    pub buffers_kb: u64,
    pub cached_kb: u64,
    pub swap_total_kb: u64,
    pub swap_free_kb: u64,
}

/// Status lines worth copying verbatim into a memory snapshot.
const STATUS_MEMORY_KEYS: &[&str] = &[
    "Name", "State", "Threads", "VmPeak", "VmSize", "VmHWM", "VmRSS", "RssAnon", "RssFile",
    "RssShmem", "VmData", "VmStk", "VmSwap",
];

/// Parse `/proc/[pid]/stat`.
pub fn parse_stat(proc_root: &Path, pid: u32) -> Option<ProcStat> {
    let content = fs::read_to_string(proc_root.join(pid.to_string()).join("stat")).ok()?;
    parse_stat_content(&content)
}

/// Parse stat file content.
///
/// Format: `pid (comm) state ppid ...`. The comm may contain spaces and
/// parentheses, so fields are split after the last `)`.
pub fn parse_stat_content(content: &str) -> Option<ProcStat> {
    let open = content.find('(')?;
    let close = content.rfind(')')?;
    if close < open {
        return None;
    }
    let comm = content[open + 1..close].to_string();
    let fields: Vec<&str> = content.get(close + 1..)?.split_whitespace().collect();

    // Indices are relative to the state field (field 3 in proc(5)).
    let field = |idx: usize| -> Option<u64> { fields.get(idx)?.parse().ok() };
    Some(ProcStat {
        comm,
        state: fields.first()?.chars().next()?,
        ppid: fields.get(1)?.parse().ok()?,
        utime: field(11)?,
        stime: field(12)?,
        num_threads: field(17).unwrap_or(0),
        starttime: field(19).unwrap_or(0),
        vsize: field(20).unwrap_or(0),
        rss_pages: field(21).unwrap_or(0),
    })
}

/// Parse the aggregate `cpu` line of `/proc/stat`.
pub fn parse_cpu_times(proc_root: &Path) -> Option<CpuTimes> {
    let content = fs::read_to_string(proc_root.join("stat")).ok()?;
    parse_cpu_times_content(&content)
}

pub fn parse_cpu_times_content(content: &str) -> Option<CpuTimes> {
    let line = content.lines().find(|line| line.starts_with("cpu "))?;
    let values: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|v| v.parse().ok())
        .collect();
    if values.len() < 4 {
        return None;
    }
    let at = |idx: usize| values.get(idx).copied().unwrap_or(0);
    Some(CpuTimes {
        user: at(0),
        nice: at(1),
        system: at(2),
        idle: at(3),
        iowait: at(4),
        irq: at(5),
        softirq: at(6),
    })
}

/// Parse `/proc/loadavg`.
pub fn parse_loadavg(proc_root: &Path) -> Option<LoadAvg> {
    let content = fs::read_to_string(proc_root.join("loadavg")).ok()?;
    parse_loadavg_content(&content)
}

pub fn parse_loadavg_content(content: &str) -> Option<LoadAvg> {
    let parts: Vec<&str> = content.split_whitespace().collect();
    if parts.len() < 4 {
        return None;
    }
    Some(LoadAvg {
        one: parts[0].parse().ok()?,
        five: parts[1].parse().ok()?,
        fifteen: parts[2].parse().ok()?,
        tasks: parts[3].to_string(),
    })
}

/// Parse `/proc/meminfo`.
pub fn parse_meminfo(proc_root: &Path) -> Option<MemInfo> {
    let content = fs::read_to_string(proc_root.join("meminfo")).ok()?;
    parse_meminfo_content(&content)
}

pub fn parse_meminfo_content(content: &str) -> Option<MemInfo> {
    let mut info = MemInfo::default();
    let mut seen = false;

    for line in content.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        let Some(value) = rest.split_whitespace().next().and_then(|v| v.parse::<u64>().ok())
        else {
            continue;
        };
        let slot = match key.trim() {
            "MemTotal" => &mut info.mem_total_kb,
            "MemFree" => &mut info.mem_free_kb,
            "MemAvailable" => &mut info.mem_available_kb,
            "Buffers" => &mut info.buffers_kb,
            "Cached" => &mut info.cached_kb,
            "SwapTotal" => &mut info.swap_total_kb,
            "SwapFree" => &mut info.swap_free_kb,
            _ => continue,
        };
        *slot = value;
        seen = true;
    }

    seen.then_some(info)
}

/// Memory-related lines of `/proc/[pid]/status`, in file order.
pub fn read_status_memory_lines(proc_root: &Path, pid: u32) -> Option<Vec<String>> {
    let content = fs::read_to_string(proc_root.join(pid.to_string()).join("status")).ok()?;
    Some(status_memory_lines(&content))
}

pub fn status_memory_lines(content: &str) -> Vec<String> {
    content
        .lines()
        .filter(|line| {
            line.split_once(':')
                .is_some_and(|(key, _)| STATUS_MEMORY_KEYS.contains(&key.trim()))
        })
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT: &str = "1234 (my (odd) proc) S 1 1234 1234 0 -1 4194560 500 0 0 0 \
                        150 75 0 0 20 0 4 0 98765 123456789 2048 18446744073709551615";

    #[test]
    fn test_parse_stat_content_handles_parens_in_comm() {
        let stat = parse_stat_content(STAT).unwrap();
        assert_eq!(stat.comm, "my (odd) proc");
        assert_eq!(stat.state, 'S');
        assert_eq!(stat.ppid, 1);
        assert_eq!(stat.utime, 150);
        assert_eq!(stat.stime, 75);
        assert_eq!(stat.num_threads, 4);
        assert_eq!(stat.starttime, 98765);
        assert_eq!(stat.vsize, 123456789);
        assert_eq!(stat.rss_pages, 2048);
    }

    #[test]
    fn test_parse_stat_content_rejects_truncated() {
        assert!(parse_stat_content("1234 (x) S 1").is_none());
        assert!(parse_stat_content("garbage").is_none());
    }

    #[test]
    fn test_parse_cpu_times_content() {
        let content = "cpu  100 0 50 800 50 0 0 0 0 0\ncpu0 50 0 25 400 25 0 0 0 0 0\n";
        let cpu = parse_cpu_times_content(content).unwrap();
        assert_eq!(cpu.total(), 1000);
        assert!((cpu.busy_percent() - 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_cpu_totals_saturate_on_huge_counters() {
        let content = "cpu  18446744073709551615 5 18446744073709551615 10 18446744073709551615 0 0\n";
        let cpu = parse_cpu_times_content(content).unwrap();
        assert_eq!(cpu.total(), u64::MAX);
        let busy = cpu.busy_percent();
        assert!((0.0..=100.0).contains(&busy), "{}", busy);
    }

    #[test]
    fn test_parse_loadavg_content() {
        let load = parse_loadavg_content("0.52 0.58 0.59 2/812 4242\n").unwrap();
        assert!((load.one - 0.52).abs() < 1e-9);
        assert_eq!(load.tasks, "2/812");
        assert!(parse_loadavg_content("0.1").is_none());
    }

    #[test]
    fn test_parse_meminfo_content() {
        let content = "MemTotal:       16000000 kB\nMemFree:         1000000 kB\n\
                       MemAvailable:    8000000 kB\nHugePages_Total:       0\n";
        let mem = parse_meminfo_content(content).unwrap();
        assert_eq!(mem.mem_total_kb, 16_000_000);
        assert_eq!(mem.mem_available_kb, 8_000_000);
        assert_eq!(mem.swap_total_kb, 0);
        assert!(parse_meminfo_content("nothing here").is_none());
    }

    #[test]
    fn test_status_memory_lines_keeps_order_and_filters() {
        let content = "Name:\tworker\nUmask:\t0022\nState:\tS (sleeping)\n\
                       VmRSS:\t   2048 kB\nSigQ:\t0/1\nThreads:\t4\n";
        assert_eq!(
            status_memory_lines(content),
            vec!["Name: worker", "State: S (sleeping)", "VmRSS: 2048 kB", "Threads: 4"]
        );
    }
}
