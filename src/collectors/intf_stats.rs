//! Interface byte/packet counter collector. Each sample reads every
//! monitored interface's cumulative counters; report windows carry either
//! the cumulative values or wrap-tolerant deltas depending on the report
//! format. Counter sources are pluggable; the default reads the kernel's
//! per-interface statistics files.

use std::collections::BTreeMap;
use std::fs;

use tracing::{debug, warn};

use crate::aggregator::counter_delta;
use crate::config::{ReportFormat, OTHER_CONFIG_INTF_LIST};
use crate::error::Result;
use crate::fcm::collector::{CollectorPlugin, PluginCtx};
use crate::report::intf::{encode_intf_report, IntfStats, IntfStatsReport, IntfStatsWindow};

/// One interface's cumulative counters at a sample instant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntfSample {
    pub if_name: String,
    pub role: String,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
    pub rx_packets: u64,
}

/// Counter source; the dpctl/target plumbing is external, so samples come
/// through this seam.
pub trait IntfStatsSource: Send {
    fn sample(&mut self, interfaces: &[String]) -> Vec<IntfSample>;
}

/// Reads `/sys/class/net/<if>/statistics/` counters.
#[derive(Default)]
pub struct SysClassNetSource;

fn read_counter(if_name: &str, counter: &str) -> u64 {
    let path = format!("/sys/class/net/{if_name}/statistics/{counter}");
    fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}

impl IntfStatsSource for SysClassNetSource {
    fn sample(&mut self, interfaces: &[String]) -> Vec<IntfSample> {
        interfaces
            .iter()
            .map(|if_name| IntfSample {
                if_name: if_name.clone(),
                role: String::new(),
                tx_bytes: read_counter(if_name, "tx_bytes"),
                rx_bytes: read_counter(if_name, "rx_bytes"),
                tx_packets: read_counter(if_name, "tx_packets"),
                rx_packets: read_counter(if_name, "rx_packets"),
            })
            .collect()
    }
}

pub struct IntfStatsCollector {
    source: Box<dyn IntfStatsSource>,
    interfaces: Vec<String>,
    /// latest cumulative counters per interface
    current: BTreeMap<String, IntfSample>,
    /// counters at the previous report boundary
    previous: BTreeMap<String, IntfSample>,
    window_started_at: u64,
}

impl Default for IntfStatsCollector {
    fn default() -> Self {
        IntfStatsCollector {
            source: Box::new(SysClassNetSource),
            interfaces: Vec::new(),
            current: BTreeMap::new(),
            previous: BTreeMap::new(),
            window_started_at: 0,
        }
    }
}

impl IntfStatsCollector {
    pub fn with_source(source: Box<dyn IntfStatsSource>) -> Self {
        IntfStatsCollector {
            source,
            ..Default::default()
        }
    }

    fn window_stats(&self, format: ReportFormat) -> Vec<IntfStats> {
        self.current
            .values()
            .map(|cur| {
                let stats = match format {
                    ReportFormat::Delta => {
                        let prev = self.previous.get(&cur.if_name);
                        IntfStats {
                            if_name: cur.if_name.clone(),
                            role: cur.role.clone(),
                            tx_bytes: counter_delta(
                                cur.tx_bytes,
                                prev.map_or(0, |p| p.tx_bytes),
                            ),
                            rx_bytes: counter_delta(
                                cur.rx_bytes,
                                prev.map_or(0, |p| p.rx_bytes),
                            ),
                            tx_packets: counter_delta(
                                cur.tx_packets,
                                prev.map_or(0, |p| p.tx_packets),
                            ),
                            rx_packets: counter_delta(
                                cur.rx_packets,
                                prev.map_or(0, |p| p.rx_packets),
                            ),
                        }
                    }
                    _ => IntfStats {
                        if_name: cur.if_name.clone(),
                        role: cur.role.clone(),
                        tx_bytes: cur.tx_bytes,
                        rx_bytes: cur.rx_bytes,
                        tx_packets: cur.tx_packets,
                        rx_packets: cur.rx_packets,
                    },
                };
                stats
            })
            .collect()
    }
}

impl CollectorPlugin for IntfStatsCollector {
    fn init(&mut self, ctx: &mut PluginCtx<'_>) -> Result<()> {
        if let Some(list) = ctx.other_config.get(OTHER_CONFIG_INTF_LIST) {
            self.interfaces = list
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if self.interfaces.is_empty() {
            warn!(target: "intf_stats", "no interfaces configured");
        }
        self.window_started_at = ctx.now;
        debug!(
            target: "intf_stats",
            interfaces = self.interfaces.len(),
            "collector initialized"
        );
        Ok(())
    }

    fn collect_periodic(&mut self, _ctx: &mut PluginCtx<'_>) {
        for sample in self.source.sample(&self.interfaces) {
            self.current.insert(sample.if_name.clone(), sample);
        }
    }

    fn send_report(&mut self, ctx: &mut PluginCtx<'_>) {
        let report = IntfStatsReport {
            reported_at: ctx.now,
            observation_point: ctx.observation_point.clone(),
            windows: vec![IntfStatsWindow {
                started_at: self.window_started_at,
                ended_at: ctx.now,
                intf_stats: self.window_stats(ctx.params.format),
            }],
        };
        let payload = encode_intf_report(&report);
        ctx.emitter.emit(&ctx.params.mqtt_topic, payload);

        // next window baseline
        self.previous = self.current.clone();
        self.window_started_at = ctx.now;
    }

    fn close(&mut self, _ctx: &mut PluginCtx<'_>) {
        self.current.clear();
        self.previous.clear();
    }
}

/// Fixed scripted source for exercising the collector without a kernel.
pub struct ScriptedSource {
    pub samples: Vec<Vec<IntfSample>>,
    pub at: usize,
}

impl IntfStatsSource for ScriptedSource {
    fn sample(&mut self, _interfaces: &[String]) -> Vec<IntfSample> {
        let out = self
            .samples
            .get(self.at)
            .cloned()
            .or_else(|| self.samples.last().cloned())
            .unwrap_or_default();
        self.at += 1;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReportFormat;

    fn sample(name: &str, tx_packets: u64, rx_packets: u64) -> IntfSample {
        IntfSample {
            if_name: name.into(),
            role: "lan".into(),
            tx_bytes: tx_packets * 100,
            rx_bytes: rx_packets * 100,
            tx_packets,
            rx_packets,
        }
    }

    #[test]
    fn delta_format_wraps_on_narrow_counters() {
        let mut collector = IntfStatsCollector::with_source(Box::new(ScriptedSource {
            samples: vec![],
            at: 0,
        }));
        collector
            .current
            .insert("eth0".into(), sample("eth0", 150, 195));
        collector
            .previous
            .insert("eth0".into(), sample("eth0", 100, 200));

        let stats = collector.window_stats(ReportFormat::Delta);
        assert_eq!(stats[0].tx_packets, 50);
        assert_eq!(stats[0].rx_packets, u32::MAX as u64 - 4);
    }

    #[test]
    fn cumulative_format_reports_raw_counters() {
        let mut collector = IntfStatsCollector::with_source(Box::new(ScriptedSource {
            samples: vec![],
            at: 0,
        }));
        collector
            .current
            .insert("eth0".into(), sample("eth0", 150, 195));
        collector
            .previous
            .insert("eth0".into(), sample("eth0", 100, 200));

        let stats = collector.window_stats(ReportFormat::Cumulative);
        assert_eq!(stats[0].tx_packets, 150);
        assert_eq!(stats[0].rx_packets, 195);
    }
}
