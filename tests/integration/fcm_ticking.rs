//! Scheduler behavior: sample/report tick arithmetic, parked collectors,
//! the shared sample cadence, and the memory watchdog.

use std::io::Write;
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use flowmon::config::{CollectorConfig, ConfigEvent, NodeConfig, ReportConfig};
use flowmon::error::Result;
use flowmon::fcm::collector::{CollectorPlugin, PluginCtx, PluginTable};
use flowmon::fcm::{FcmConfig, FcmManager};
use flowmon::report::ReportEmitter;

struct ProbePlugin;

impl CollectorPlugin for ProbePlugin {
    fn init(&mut self, _ctx: &mut PluginCtx<'_>) -> Result<()> {
        Ok(())
    }

    fn collect_periodic(&mut self, _ctx: &mut PluginCtx<'_>) {}

    fn send_report(&mut self, ctx: &mut PluginCtx<'_>) {
        ctx.emitter.emit(&ctx.params.mqtt_topic, Bytes::from_static(b"r"));
    }
}

#[derive(Clone, Default)]
struct SharedEmitter {
    emissions: Arc<Mutex<Vec<String>>>,
}

impl ReportEmitter for SharedEmitter {
    fn emit(&mut self, topic: &str, _payload: Bytes) {
        self.emissions.lock().unwrap().push(topic.to_string());
    }
}

fn manager_with_probe() -> (FcmManager, Arc<Mutex<Vec<String>>>) {
    let mut mgr = FcmManager::new(FcmConfig::default());
    let mut table = PluginTable::builtin();
    table.register("probe", || Box::new(ProbePlugin));
    mgr.set_plugin_table(table);
    let emitter = SharedEmitter::default();
    let emissions = emitter.emissions.clone();
    mgr.set_emitter(Box::new(emitter));
    (mgr, emissions)
}

fn report(name: &str, interval: u64) -> ReportConfig {
    ReportConfig {
        name: name.into(),
        report_interval: interval,
        mqtt_topic: format!("telemetry/{name}"),
        ..Default::default()
    }
}

fn collector(name: &str, sample: u64, report_name: &str) -> CollectorConfig {
    CollectorConfig {
        name: name.into(),
        sample_interval: sample,
        report_name: report_name.into(),
        ..Default::default()
    }
}

#[test]
fn two_reports_in_seven_seconds() {
    let (mut mgr, emissions) = manager_with_probe();
    mgr.apply_report_event(ConfigEvent::New(report("r3", 3)));
    mgr.apply_collector_event(ConfigEvent::New(collector("probe", 1, "r3")));
    assert!(mgr.collector_initialized("probe"));

    mgr.step(0); // arm the sample timer
    for t in 1..=7 {
        mgr.step(t);
    }

    assert_eq!(mgr.collector_report_count("probe"), 2);
    assert_eq!(emissions.lock().unwrap().len(), 2);
}

#[test]
fn zero_report_interval_never_fires() {
    let (mut mgr, emissions) = manager_with_probe();
    mgr.apply_report_event(ConfigEvent::New(report("r0", 0)));
    mgr.apply_collector_event(ConfigEvent::New(collector("probe", 1, "r0")));
    assert!(mgr.collector_initialized("probe"));

    mgr.step(0);
    for t in 1..=20 {
        mgr.step(t);
    }
    assert_eq!(mgr.collector_report_count("probe"), 0);
    assert!(emissions.lock().unwrap().is_empty());
}

#[test]
fn collector_parks_until_report_config_arrives() {
    let (mut mgr, _emissions) = manager_with_probe();
    mgr.apply_collector_event(ConfigEvent::New(collector("probe", 1, "late")));
    assert!(!mgr.collector_initialized("probe"));

    mgr.apply_report_event(ConfigEvent::New(report("late", 5)));
    assert!(mgr.collector_initialized("probe"));
}

#[test]
fn sample_period_is_global_minimum() {
    let (mut mgr, _emissions) = manager_with_probe();
    mgr.apply_report_event(ConfigEvent::New(report("r", 60)));
    mgr.apply_collector_event(ConfigEvent::New(collector("probe_slow", 30, "r")));
    mgr.apply_collector_event(ConfigEvent::New(collector("probe_fast", 10, "r")));
    assert_eq!(mgr.sample_period(), 10);

    mgr.apply_collector_event(ConfigEvent::Delete(collector("probe_fast", 10, "r")));
    assert_eq!(mgr.sample_period(), 30);
}

#[test]
fn purge_interval_tracks_slowest_report() {
    let (mut mgr, _emissions) = manager_with_probe();
    mgr.apply_report_event(ConfigEvent::New(report("a", 60)));
    mgr.apply_report_event(ConfigEvent::New(report("b", 600)));
    assert_eq!(mgr.purge_interval(), 600);
    mgr.apply_report_event(ConfigEvent::Delete(report("b", 600)));
    assert_eq!(mgr.purge_interval(), 60);
}

#[test]
fn unknown_plugin_leaves_collector_uninitialized() {
    let (mut mgr, _emissions) = manager_with_probe();
    mgr.apply_report_event(ConfigEvent::New(report("r", 10)));
    mgr.apply_collector_event(ConfigEvent::New(collector("mystery", 1, "r")));
    assert!(!mgr.collector_initialized("mystery"));
}

#[test]
fn memory_watchdog_requests_exit() {
    let mut status = tempfile::NamedTempFile::new().unwrap();
    writeln!(status, "VmRSS:\t  90000 kB").unwrap();
    writeln!(status, "VmSize:\t 120000 kB").unwrap();
    status.flush().unwrap();

    let mut mgr = FcmManager::new(FcmConfig {
        proc_status_path: status.path().to_string_lossy().into_owned(),
        default_max_mem_kb: 80_000,
        mgr_interval: 120,
        ..Default::default()
    });

    mgr.step(0); // arm the manager periodic timer
    assert!(!mgr.exit_requested());
    mgr.step(120);
    assert!(mgr.exit_requested());
}

#[test]
fn max_mem_percent_recomputes_and_publishes_node_state() {
    let published: Arc<Mutex<Vec<(String, String, String)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = published.clone();

    let mut mgr = FcmManager::new(FcmConfig {
        total_ram_bytes: 1 << 30,
        ..Default::default()
    });
    mgr.set_node_state_publisher(Box::new(move |module, key, value| {
        sink.lock()
            .unwrap()
            .push((module.into(), key.into(), value.into()));
    }));

    mgr.apply_node_config(ConfigEvent::New(NodeConfig {
        module: "fcm".into(),
        key: "max_mem_percent".into(),
        value: "50".into(),
    }));

    assert_eq!(mgr.max_mem_kb(), 536_870);
    let published = published.lock().unwrap();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, "fcm");
    assert_eq!(published[0].1, "max_mem");
    assert_eq!(published[0].2, "536870 kB");
}

#[test]
fn out_of_range_percent_is_ignored() {
    let mut mgr = FcmManager::new(FcmConfig {
        total_ram_bytes: 1 << 30,
        ..Default::default()
    });
    let before = mgr.max_mem_kb();
    mgr.apply_node_config(ConfigEvent::New(NodeConfig {
        module: "fcm".into(),
        key: "max_mem_percent".into(),
        value: "150".into(),
    }));
    assert_eq!(mgr.max_mem_kb(), before);
}
