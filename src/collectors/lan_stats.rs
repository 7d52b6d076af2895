//! LAN flow collector. Enumerates datapath flows (the `ovs-dpctl
//! dump-flows -m` surface), parses the layer-2 fields and counters out of
//! each line, runs them through the collect filter, and feeds the shared
//! aggregator. Flow reports ride the common flow-report encoder with the
//! active uplink annotation.

use tracing::{debug, trace};

use crate::aggregator::{FlowCounters, FlowKey, MacAddr};
use crate::config::OTHER_CONFIG_PARENT_TAG;
use crate::error::Result;
use crate::fcm::collector::{CollectorPlugin, PluginCtx};
use crate::filter::{FilterReq, L2Info, PacketStats};
use crate::report::encode_flow_report;

const OVS_DPCTL_DUMP_FLOWS: &str = "ovs-dpctl dump-flows -m";

/// Datapath flow dump feed; process execution is external plumbing.
pub trait FlowDumpSource: Send {
    fn dump(&mut self) -> Vec<String>;
}

/// Placeholder production source; the dpctl pipe is wired up by the
/// integration, so an unwired agent collects nothing.
#[derive(Default)]
pub struct NullDumpSource;

impl FlowDumpSource for NullDumpSource {
    fn dump(&mut self) -> Vec<String> {
        trace!(target: "lan_stats", cmd = OVS_DPCTL_DUMP_FLOWS, "no dump source wired");
        Vec::new()
    }
}

/// Fields parsed out of one dump line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DpFlowStats {
    pub smac: MacAddr,
    pub dmac: MacAddr,
    pub eth_type: u16,
    pub vlan_id: u16,
    pub pkts: u64,
    pub bytes: u64,
}

fn parse_mac_field(chunk: &str) -> Option<MacAddr> {
    chunk
        .chars()
        .take_while(|c| c.is_ascii_hexdigit() || *c == ':')
        .collect::<String>()
        .parse()
        .ok()
}

fn parse_hex_field(chunk: &str) -> Option<u16> {
    let hex: String = chunk
        .trim_start_matches("0x")
        .chars()
        .take_while(|c| c.is_ascii_hexdigit())
        .collect();
    u16::from_str_radix(&hex, 16).ok()
}

fn parse_dec_field(chunk: &str) -> Option<u64> {
    let dec: String = chunk.chars().take_while(|c| c.is_ascii_digit()).collect();
    dec.parse().ok()
}

/// Parses one `dump-flows -m` line. Lines missing the ethernet addresses
/// or counters yield nothing.
pub fn parse_flow_line(line: &str) -> Option<DpFlowStats> {
    let mut stats = DpFlowStats::default();

    let src_at = line.find("eth(src=")?;
    stats.smac = parse_mac_field(&line[src_at + "eth(src=".len()..])?;
    let dst_at = line[src_at..].find("dst=")? + src_at;
    stats.dmac = parse_mac_field(&line[dst_at + "dst=".len()..])?;

    if let Some(at) = line.find("encap(eth_type(") {
        stats.eth_type = parse_hex_field(&line[at + "encap(eth_type(".len()..])?;
    } else if let Some(at) = line.find("eth_type(") {
        stats.eth_type = parse_hex_field(&line[at + "eth_type(".len()..])?;
    }

    if let Some(at) = line.find("vlan(vid=") {
        stats.vlan_id = parse_dec_field(&line[at + "vlan(vid=".len()..])? as u16;
    }

    let pkts_at = line.find(" packets:")?;
    stats.pkts = parse_dec_field(&line[pkts_at + " packets:".len()..])?;
    let bytes_at = line.find(" bytes:")?;
    stats.bytes = parse_dec_field(&line[bytes_at + " bytes:".len()..])?;

    Some(stats)
}

pub struct LanStatsCollector {
    source: Box<dyn FlowDumpSource>,
    parent_tag: Option<String>,
    flows_seen: u64,
    flows_filtered: u64,
}

impl Default for LanStatsCollector {
    fn default() -> Self {
        LanStatsCollector {
            source: Box::new(NullDumpSource),
            parent_tag: None,
            flows_seen: 0,
            flows_filtered: 0,
        }
    }
}

impl LanStatsCollector {
    pub fn with_source(source: Box<dyn FlowDumpSource>) -> Self {
        LanStatsCollector {
            source,
            ..Default::default()
        }
    }

    fn feed(&mut self, stats: &DpFlowStats, ctx: &mut PluginCtx<'_>) {
        self.flows_seen += 1;

        if let Some(filter_name) = ctx.params.filters.collect.as_deref() {
            let l2 = L2Info {
                src_mac: Some(stats.smac.to_string()),
                dst_mac: Some(stats.dmac.to_string()),
                vlan_id: (stats.vlan_id != 0).then_some(stats.vlan_id),
                eth_type: Some(stats.eth_type),
            };
            let pkts = PacketStats {
                pkt_cnt: Some(stats.pkts),
                bytes: Some(stats.bytes),
            };
            let req = FilterReq {
                l2: Some(&l2),
                pkts: Some(&pkts),
                ..Default::default()
            };
            if !ctx.filter_engine.apply(filter_name, &req) {
                self.flows_filtered += 1;
                return;
            }
        }

        let key = FlowKey {
            smac: stats.smac,
            dmac: stats.dmac,
            vlan_id: stats.vlan_id,
            ethertype: stats.eth_type,
            ..Default::default()
        };
        let counters = FlowCounters {
            packets_count: stats.pkts,
            bytes_count: stats.bytes,
            payload_bytes_count: 0,
        };
        ctx.aggr.add_sample(&key, counters, ctx.now);
    }
}

impl CollectorPlugin for LanStatsCollector {
    fn init(&mut self, ctx: &mut PluginCtx<'_>) -> Result<()> {
        self.parent_tag = ctx
            .other_config
            .get(OTHER_CONFIG_PARENT_TAG)
            .cloned();
        ctx.aggr.activate_window(ctx.now);
        debug!(
            target: "lan_stats",
            parent_tag = self.parent_tag.as_deref().unwrap_or(""),
            "collector initialized"
        );
        Ok(())
    }

    fn collect_periodic(&mut self, ctx: &mut PluginCtx<'_>) {
        let lines = self.source.dump();
        for line in lines {
            if let Some(stats) = parse_flow_line(&line) {
                self.feed(&stats, ctx);
            }
        }
    }

    fn send_report(&mut self, ctx: &mut PluginCtx<'_>) {
        ctx.aggr.close_active_window(ctx.now);
        let mut report = ctx.aggr.report(ctx.now, ctx.observation_point);

        // the report filter prunes stats at emission time
        if let Some(filter_name) = ctx.params.filters.report.as_deref() {
            for window in &mut report.windows {
                window.stats.retain(|stats| {
                    let l2 = L2Info {
                        src_mac: Some(stats.key.smac.to_string()),
                        dst_mac: Some(stats.key.dmac.to_string()),
                        vlan_id: (stats.key.vlan_id != 0).then_some(stats.key.vlan_id),
                        eth_type: Some(stats.key.ethertype),
                    };
                    let pkts = PacketStats {
                        pkt_cnt: Some(stats.counters.packets_count),
                        bytes: Some(stats.counters.bytes_count),
                    };
                    let req = FilterReq {
                        l2: Some(&l2),
                        pkts: Some(&pkts),
                        ..Default::default()
                    };
                    ctx.filter_engine.apply(filter_name, &req)
                });
            }
        }

        let payload = encode_flow_report(&report);
        ctx.emitter.emit(&ctx.params.mqtt_topic, payload);
        debug!(
            target: "lan_stats",
            seen = self.flows_seen,
            filtered = self.flows_filtered,
            "report sent"
        );
    }

    fn close(&mut self, ctx: &mut PluginCtx<'_>) {
        ctx.aggr.reset();
    }
}

/// Canned dump lines for tests.
pub struct ScriptedDump {
    pub lines: Vec<String>,
}

impl FlowDumpSource for ScriptedDump {
    fn dump(&mut self) -> Vec<String> {
        self.lines.clone()
    }
}
