//! Process memory usage from the procfs status file. The watchdog compares
//! resident size against the configured bound and asks for a clean exit
//! when it is exceeded; the orchestrator restarts the agent.

use std::fs;
use std::path::Path;

use tracing::warn;

use crate::error::Result;

/// Counters in kB, as procfs reports them.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemUsage {
    pub curr_real_mem: u64,
    pub peak_real_mem: u64,
    pub curr_virt_mem: u64,
    pub peak_virt_mem: u64,
}

fn parse_kb_line(value: &str, field: &str) -> u64 {
    let mut parts = value.split_whitespace();
    let number = parts.next().and_then(|n| n.parse().ok()).unwrap_or(0);
    match parts.next() {
        Some("kB") => {}
        Some(unit) => {
            warn!(target: "fcm", field, unit, "expected kB units");
        }
        None => {}
    }
    number
}

/// Parses the VmRSS/VmHWM/VmSize/VmPeak fields of a status file. A unit
/// other than kB warns and the value is taken as-is.
pub fn parse_status(content: &str) -> MemUsage {
    let mut mem = MemUsage::default();
    for line in content.lines() {
        let Some((field, value)) = line.split_once(':') else {
            continue;
        };
        match field {
            "VmRSS" => mem.curr_real_mem = parse_kb_line(value, field),
            "VmHWM" => mem.peak_real_mem = parse_kb_line(value, field),
            "VmSize" => mem.curr_virt_mem = parse_kb_line(value, field),
            "VmPeak" => mem.peak_virt_mem = parse_kb_line(value, field),
            _ => {}
        }
    }
    mem
}

/// Reads the given status file; `/proc/self/status` in production, a
/// fixture path in tests.
pub fn read_status(path: impl AsRef<Path>) -> Result<MemUsage> {
    let content = fs::read_to_string(path)?;
    Ok(parse_status(&content))
}

pub fn self_status_path() -> String {
    format!("/proc/{}/status", std::process::id())
}

/// `max_mem = total_ram x percent / 100`, published in kB.
pub fn max_mem_from_percent(total_ram_bytes: u64, percent: u64) -> u64 {
    (total_ram_bytes * percent) / 100 / 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_fields_parse() {
        let status = "Name:\tflowmond\nVmPeak:\t  201000 kB\nVmSize:\t  200000 kB\nVmHWM:\t   52000 kB\nVmRSS:\t   51000 kB\n";
        let mem = parse_status(status);
        assert_eq!(mem.curr_real_mem, 51000);
        assert_eq!(mem.peak_real_mem, 52000);
        assert_eq!(mem.curr_virt_mem, 200000);
        assert_eq!(mem.peak_virt_mem, 201000);
    }

    #[test]
    fn non_kb_unit_warns_but_parses() {
        let mem = parse_status("VmRSS:\t 1024 mB\n");
        assert_eq!(mem.curr_real_mem, 1024);
    }

    #[test]
    fn max_mem_percent_math() {
        // 1 GiB at 50% is ~536870 kB
        assert_eq!(max_mem_from_percent(1 << 30, 50), 536_870);
        assert_eq!(max_mem_from_percent(0, 50), 0);
    }
}
