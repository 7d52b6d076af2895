//! Interface report format semantics: delta windows with 32-bit wrap
//! tolerance versus cumulative windows.

use std::collections::BTreeMap;

use flowmon::aggregator::{Aggregator, AggregatorSet, ObservationPoint};
use flowmon::config::ReportFormat;
use flowmon::collectors::intf_stats::{IntfSample, IntfStatsCollector, ScriptedSource};
use flowmon::fcm::collector::{CollectorPlugin, PluginCtx, PluginParams};
use flowmon::filter::FilterEngine;
use flowmon::gatekeeper::GkCache;
use flowmon::report::intf::decode_intf_report;
use flowmon::report::CaptureEmitter;

fn eth0(tx_packets: u64, rx_packets: u64) -> IntfSample {
    IntfSample {
        if_name: "eth0".into(),
        role: "uplink".into(),
        tx_bytes: tx_packets * 100,
        rx_bytes: rx_packets * 100,
        tx_packets,
        rx_packets,
    }
}

struct Rig {
    aggr: Aggregator,
    filter_engine: FilterEngine,
    emitter: CaptureEmitter,
    observation_point: ObservationPoint,
    gk_cache: GkCache,
    other_config: BTreeMap<String, String>,
    params: PluginParams,
}

impl Rig {
    fn new(format: ReportFormat) -> Self {
        let mut other_config = BTreeMap::new();
        other_config.insert("intf_list".to_string(), "eth0".to_string());
        Rig {
            aggr: Aggregator::new(AggregatorSet::default()),
            filter_engine: FilterEngine::new(),
            emitter: CaptureEmitter::default(),
            observation_point: ObservationPoint {
                node_id: "node".into(),
                location_id: "loc".into(),
            },
            gk_cache: GkCache::new(),
            other_config,
            params: PluginParams {
                sample_interval: 10,
                report_interval: 60,
                format,
                mqtt_topic: "telemetry/intf".into(),
                ..Default::default()
            },
        }
    }

    fn ctx(&mut self, now: u64) -> PluginCtx<'_> {
        PluginCtx {
            name: "intfstats",
            params: &self.params,
            other_config: &self.other_config,
            aggr: &mut self.aggr,
            filter_engine: &self.filter_engine,
            emitter: &mut self.emitter,
            observation_point: &self.observation_point,
            gatekeeper: None,
            gk_cache: &mut self.gk_cache,
            now,
        }
    }
}

fn run_two_samples(format: ReportFormat) -> flowmon::report::intf::IntfStatsReport {
    let mut rig = Rig::new(format);
    let mut collector = IntfStatsCollector::with_source(Box::new(ScriptedSource {
        samples: vec![vec![eth0(100, 200)], vec![eth0(150, 195)]],
        at: 0,
    }));

    collector.init(&mut rig.ctx(0)).unwrap();
    // first reporting cycle establishes the baseline
    collector.collect_periodic(&mut rig.ctx(10));
    collector.send_report(&mut rig.ctx(20));
    // second cycle observes the wrapped rx counter
    collector.collect_periodic(&mut rig.ctx(30));
    collector.send_report(&mut rig.ctx(40));

    let (topic, payload) = rig.emitter.emissions.pop().unwrap();
    assert_eq!(topic, "telemetry/intf");
    decode_intf_report(&payload).unwrap()
}

#[test]
fn delta_format_reports_wrap_tolerant_deltas() {
    let report = run_two_samples(ReportFormat::Delta);
    let stats = &report.windows[0].intf_stats[0];
    assert_eq!(stats.if_name, "eth0");
    assert_eq!(stats.tx_packets, 50);
    // rx went 200 -> 195: a 32-bit wrap, not a reset
    assert_eq!(stats.rx_packets, u32::MAX as u64 - 4);
}

#[test]
fn cumulative_format_reports_observed_counters() {
    let report = run_two_samples(ReportFormat::Cumulative);
    let stats = &report.windows[0].intf_stats[0];
    assert_eq!(stats.tx_packets, 150);
    assert_eq!(stats.rx_packets, 195);
}

#[test]
fn report_window_bounds_follow_the_clock() {
    let report = run_two_samples(ReportFormat::Cumulative);
    assert_eq!(report.reported_at, 40);
    assert_eq!(report.windows[0].started_at, 20);
    assert_eq!(report.windows[0].ended_at, 40);
    assert_eq!(report.observation_point.node_id, "node");
}
