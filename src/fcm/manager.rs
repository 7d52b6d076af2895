//! The collection manager: a single-threaded cooperative scheduler that
//! owns the collector and report-config trees, the shared aggregator, the
//! filter engine and the gatekeeper state. Three timers are live: the
//! coarse manager periodic (memory watchdog, plugin periodic hooks,
//! neighbor expiry), the shared sample timer, and the aggregator purge
//! timer.
//!
//! The scheduler is clock-injected: [`FcmManager::step`] fires whatever is
//! due at the given time. The agent binary drives it with wall-clock
//! sleeps; tests drive it with a synthetic clock over the same code paths.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::aggregator::tags::TagRegistry;
use crate::aggregator::{Aggregator, AggregatorSet, MacAddr, ObservationPoint, ReportType};
use crate::config::{
    AwlanNode, CollectorConfig, ConfigEvent, ConnectionManagerUplink, FilterRuleConfig,
    FlowServiceManagerConfig, NodeConfig, OpenFlowTag, ReportConfig, ReportFormat, Ssl,
};
use crate::error::{FlowError, Result};
use crate::fcm::collector::{
    CollectorPlugin, PluginCtx, PluginFilters, PluginParams, PluginTable, SharedTagRegistry,
};
use crate::fcm::memory::{self, MemUsage};
use crate::filter::{FilterClient, FilterEngine};
use crate::gatekeeper::{persist, GatekeeperClient, GkCache, PersistentStore};
use crate::report::{LogEmitter, ReportEmitter};

/// Coarse manager-periodic interval in seconds.
pub const FCM_MGR_INTERVAL: u64 = 120;
/// Default neighbor-table entry TTL.
pub const FCM_NEIGH_SYS_ENTRY_TTL: u64 = 36 * 60 * 60;

pub struct FcmConfig {
    pub mgr_interval: u64,
    /// status file consulted by the watchdog; `/proc/self/status` normally
    pub proc_status_path: String,
    pub total_ram_bytes: u64,
    /// watchdog bound in kB before any Node_Config override
    pub default_max_mem_kb: u64,
    pub neigh_cache_ttl: u64,
    pub aggr: AggregatorSet,
}

impl Default for FcmConfig {
    fn default() -> Self {
        FcmConfig {
            mgr_interval: FCM_MGR_INTERVAL,
            proc_status_path: memory::self_status_path(),
            total_ram_bytes: 0,
            default_max_mem_kb: 60 * 1024,
            neigh_cache_ttl: FCM_NEIGH_SYS_ENTRY_TTL,
            aggr: AggregatorSet::default(),
        }
    }
}

/// Node_State upserts go through this; the OVSDB binding is external.
pub type NodeStatePublisher = Box<dyn FnMut(&str, &str, &str) + Send>;

/// External flow feed (conntrack / dpctl plumbing) invoked on every
/// sample tick to refresh the shared aggregator.
pub type FlowSource = Box<dyn FnMut(&mut Aggregator, u64) + Send>;

struct Collector {
    config: CollectorConfig,
    plugin: Option<Box<dyn CollectorPlugin>>,
    initialized: bool,
    params: PluginParams,
    report_ticks: u64,
    curr_ticks: u64,
    report_time: u64,
    report_count: u64,
}

impl Collector {
    fn new(config: CollectorConfig) -> Self {
        Collector {
            config,
            plugin: None,
            initialized: false,
            params: PluginParams::default(),
            report_ticks: 0,
            curr_ticks: 0,
            report_time: 0,
            report_count: 0,
        }
    }

    fn clear_report_ticks(&mut self) {
        self.report_ticks = 0;
        self.curr_ticks = 0;
        self.report_time = 0;
    }
}

#[derive(Debug, Clone)]
struct NeighborEntry {
    mac: MacAddr,
    added_at: u64,
}

pub struct FcmManager {
    config: FcmConfig,
    collect_tree: BTreeMap<String, Collector>,
    report_conf_tree: BTreeMap<String, ReportConfig>,
    aggr: Aggregator,
    filter_engine: FilterEngine,
    tag_registry: SharedTagRegistry,
    plugin_table: PluginTable,
    emitter: Box<dyn ReportEmitter>,
    observation_point: ObservationPoint,
    uplink: Option<ConnectionManagerUplink>,
    neighbors: BTreeMap<String, NeighborEntry>,
    gk_cache: GkCache,
    gk_client: Option<GatekeeperClient>,
    gk_store: Option<Box<dyn PersistentStore + Send>>,
    node_state: Option<NodeStatePublisher>,
    flow_source: Option<FlowSource>,
    max_mem_kb: u64,
    sample_period: u64,
    next_sample_at: Option<u64>,
    periodic_ts: Option<u64>,
    purge_interval: u64,
    purge_ts: u64,
    exit_requested: bool,
}

impl FcmManager {
    pub fn new(config: FcmConfig) -> Self {
        let tag_registry: SharedTagRegistry = Arc::new(RwLock::new(TagRegistry::new()));
        let mut aggr = Aggregator::new(config.aggr.clone());
        let tags_for_reports = tag_registry.clone();
        aggr.on_acc_report(Box::new(move |acc| {
            tags_for_reports.read().tag_accumulator(acc);
        }));
        let max_mem_kb = config.default_max_mem_kb;
        info!(target: "fcm", max_mem_kb, "manager initialized");
        FcmManager {
            config,
            collect_tree: BTreeMap::new(),
            report_conf_tree: BTreeMap::new(),
            aggr,
            filter_engine: FilterEngine::new(),
            tag_registry,
            plugin_table: PluginTable::builtin(),
            emitter: Box::new(LogEmitter),
            observation_point: ObservationPoint::default(),
            uplink: None,
            neighbors: BTreeMap::new(),
            gk_cache: GkCache::new(),
            gk_client: None,
            gk_store: None,
            node_state: None,
            flow_source: None,
            max_mem_kb,
            sample_period: 0,
            next_sample_at: None,
            periodic_ts: None,
            purge_interval: 0,
            purge_ts: 0,
            exit_requested: false,
        }
    }

    // ---- wiring --------------------------------------------------------

    pub fn set_emitter(&mut self, emitter: Box<dyn ReportEmitter>) {
        self.emitter = emitter;
    }

    pub fn set_plugin_table(&mut self, table: PluginTable) {
        self.plugin_table = table;
    }

    pub fn set_node_state_publisher(&mut self, publisher: NodeStatePublisher) {
        self.node_state = Some(publisher);
    }

    pub fn set_flow_source(&mut self, source: FlowSource) {
        self.flow_source = Some(source);
    }

    pub fn set_gatekeeper_transport(
        &mut self,
        transport: Box<dyn crate::gatekeeper::GatekeeperTransport>,
    ) {
        self.gk_client = Some(GatekeeperClient::new(transport));
    }

    /// Attaches the persistent store and restores the cache from it.
    pub fn set_gatekeeper_store(&mut self, store: Box<dyn PersistentStore + Send>) {
        self.gk_store = Some(store);
        if let Some(store) = self.gk_store.as_deref() {
            let counts = persist::restore(&mut self.gk_cache, store);
            info!(
                target: "fcm",
                added = counts.added,
                failed = counts.failed,
                "gatekeeper cache restored"
            );
        }
    }

    pub fn exit_requested(&self) -> bool {
        self.exit_requested
    }

    pub fn max_mem_kb(&self) -> u64 {
        self.max_mem_kb
    }

    pub fn observation_point(&self) -> &ObservationPoint {
        &self.observation_point
    }

    pub fn aggregator(&mut self) -> &mut Aggregator {
        &mut self.aggr
    }

    pub fn filter_engine(&mut self) -> &mut FilterEngine {
        &mut self.filter_engine
    }

    pub fn gk_cache(&mut self) -> &mut GkCache {
        &mut self.gk_cache
    }

    pub fn collector_report_count(&self, name: &str) -> u64 {
        self.collect_tree
            .get(name)
            .map_or(0, |c| c.report_count)
    }

    pub fn collector_initialized(&self, name: &str) -> bool {
        self.collect_tree
            .get(name)
            .is_some_and(|c| c.initialized)
    }

    pub fn sample_period(&self) -> u64 {
        self.sample_period
    }

    pub fn purge_interval(&self) -> u64 {
        self.purge_interval
    }

    // ---- config events -------------------------------------------------

    pub fn apply_collector_event(&mut self, event: ConfigEvent<CollectorConfig>) {
        match event {
            ConfigEvent::New(cfg) => {
                if let Err(e) = self.init_collect_config(cfg) {
                    if e.is_soft() {
                        debug!(target: "fcm", error = %e, "collector parked");
                    } else {
                        error!(target: "fcm", error = %e, "collector config failed");
                    }
                }
            }
            ConfigEvent::Modify(cfg) => self.update_collect_config(cfg),
            ConfigEvent::Delete(cfg) => self.delete_collect_config(&cfg.name),
        }
        self.reset_sample_period();
    }

    /// Idempotent create: resolve the plugin, resolve the referenced
    /// report config, and initialize. A missing report config parks the
    /// collector for the next report-config event.
    fn init_collect_config(&mut self, cfg: CollectorConfig) -> Result<()> {
        let name = cfg.name.clone();
        let collector = self
            .collect_tree
            .entry(name.clone())
            .or_insert_with(|| Collector::new(cfg.clone()));
        collector.config = cfg;
        debug!(target: "fcm", collector = %name, "collector config added");

        let plugin = self.plugin_table.resolve(&self.collect_tree[&name].config)?;
        let collector = self
            .collect_tree
            .get_mut(&name)
            .expect("collector just inserted");
        collector.plugin = Some(plugin);

        if !self.apply_report_config_changes(&name) {
            return Err(FlowError::MissingReportConfig(
                self.collect_tree[&name].config.report_name.clone(),
            ));
        }
        self.init_collector_plugin(&name);
        Ok(())
    }

    fn update_collect_config(&mut self, cfg: CollectorConfig) {
        let name = cfg.name.clone();
        match self.collect_tree.get_mut(&name) {
            Some(collector) => collector.config = cfg,
            None => {
                let _ = self.init_collect_config(cfg);
                return;
            }
        }
        self.apply_report_config_changes(&name);
    }

    fn delete_collect_config(&mut self, name: &str) {
        let Some(mut collector) = self.collect_tree.remove(name) else {
            return;
        };
        if let Some(mut plugin) = collector.plugin.take() {
            if collector.initialized {
                let Self {
                    aggr,
                    filter_engine,
                    emitter,
                    observation_point,
                    gk_client,
                    gk_cache,
                    ..
                } = &mut *self;
                let mut ctx = PluginCtx {
                    name,
                    params: &collector.params,
                    other_config: &collector.config.other_config,
                    aggr,
                    filter_engine,
                    emitter: emitter.as_mut(),
                    observation_point,
                    gatekeeper: gk_client.as_mut(),
                    gk_cache,
                    now: 0,
                };
                plugin.close(&mut ctx);
                debug!(target: "fcm", collector = name, "plugin closed");
            }
        }
        for filter in [
            collector.params.filters.collect.as_deref(),
            collector.params.filters.report.as_deref(),
        ]
        .into_iter()
        .flatten()
        {
            self.filter_engine.deregister_client(filter, name);
        }
    }

    pub fn apply_report_event(&mut self, event: ConfigEvent<ReportConfig>) {
        match event {
            ConfigEvent::New(cfg) | ConfigEvent::Modify(cfg) => {
                debug!(target: "fcm", report = %cfg.name, "report config updated");
                self.report_conf_tree.insert(cfg.name.clone(), cfg);
                self.init_pending_collectors();
            }
            ConfigEvent::Delete(cfg) => {
                self.report_conf_tree.remove(&cfg.name);
                let names: Vec<String> = self.collect_tree.keys().cloned().collect();
                for name in names {
                    self.apply_report_config_changes(&name);
                }
            }
        }
        self.set_aggr_purge_interval();
    }

    pub fn apply_filter_event(&mut self, event: ConfigEvent<FilterRuleConfig>) {
        match event {
            ConfigEvent::New(cfg) | ConfigEvent::Modify(cfg) => {
                self.filter_engine.upsert_rule(&cfg.name, cfg.to_rule());
            }
            ConfigEvent::Delete(cfg) => {
                self.filter_engine.remove_rule(&cfg.name, cfg.index);
            }
        }
    }

    /// Node_Config: `module="fcm", key="max_mem_percent"` adjusts the
    /// watchdog bound; the result is published back as Node_State.
    pub fn apply_node_config(&mut self, event: ConfigEvent<NodeConfig>) {
        let record = event.record().clone();
        if record.module != "fcm" || record.key != "max_mem_percent" {
            return;
        }
        match event {
            ConfigEvent::New(_) | ConfigEvent::Modify(_) => {
                let Ok(percent) = record.value.parse::<u64>() else {
                    warn!(target: "fcm", value = %record.value, "bad max_mem_percent");
                    return;
                };
                if percent > 100 {
                    warn!(target: "fcm", percent, "max_mem_percent out of range");
                    return;
                }
                if self.config.total_ram_bytes == 0 {
                    return;
                }
                self.max_mem_kb =
                    memory::max_mem_from_percent(self.config.total_ram_bytes, percent);
            }
            ConfigEvent::Delete(_) => {
                self.max_mem_kb = self.config.default_max_mem_kb;
            }
        }
        info!(target: "fcm", max_mem_kb = self.max_mem_kb, "max mem updated");
        self.publish_max_mem();
    }

    fn publish_max_mem(&mut self) {
        let value = format!("{} kB", self.max_mem_kb);
        if let Some(publish) = self.node_state.as_mut() {
            publish("fcm", "max_mem", &value);
        }
    }

    pub fn apply_awlan_event(&mut self, event: ConfigEvent<AwlanNode>) {
        let node = event.record();
        if let Some(id) = node.node_id() {
            self.observation_point.node_id = id.to_string();
        }
        if let Some(id) = node.location_id() {
            self.observation_point.location_id = id.to_string();
        }
    }

    pub fn apply_uplink_event(&mut self, event: ConfigEvent<ConnectionManagerUplink>) {
        match event {
            ConfigEvent::New(uplink) | ConfigEvent::Modify(uplink) => {
                if !uplink.is_used {
                    return;
                }
                let changed = self
                    .uplink
                    .as_ref()
                    .map(|prev| prev.if_name != uplink.if_name || prev.if_type != uplink.if_type)
                    .unwrap_or(false);
                self.aggr.add_uplink(uplink.uplink_type(), changed);
                self.uplink = Some(uplink);
            }
            ConfigEvent::Delete(uplink) => {
                if self
                    .uplink
                    .as_ref()
                    .is_some_and(|prev| prev.if_name == uplink.if_name)
                {
                    self.uplink = None;
                }
            }
        }
    }

    pub fn apply_fsm_event(&mut self, event: ConfigEvent<FlowServiceManagerConfig>) {
        let Some(url) = event.record().gatekeeper_url() else {
            return;
        };
        match event {
            ConfigEvent::New(_) | ConfigEvent::Modify(_) => {
                if let Some(client) = self.gk_client.as_mut() {
                    client.set_url(url);
                }
            }
            ConfigEvent::Delete(_) => {}
        }
    }

    pub fn apply_ssl_event(&mut self, event: ConfigEvent<Ssl>) {
        if let ConfigEvent::New(ssl) | ConfigEvent::Modify(ssl) = event {
            if let Some(client) = self.gk_client.as_mut() {
                client.set_ssl(ssl);
            }
        }
    }

    pub fn apply_openflow_tag_event(&mut self, event: ConfigEvent<OpenFlowTag>) {
        let Ok(mac) = event.record().mac.parse::<MacAddr>() else {
            warn!(target: "fcm", mac = %event.record().mac, "bad tag mac");
            return;
        };
        match event {
            ConfigEvent::New(tag) | ConfigEvent::Modify(tag) => {
                self.tag_registry.write().update(mac, tag.tags);
            }
            ConfigEvent::Delete(_) => {
                self.tag_registry.write().remove(&mac);
            }
        }
    }

    pub fn add_neighbor(&mut self, ip: &str, mac: MacAddr, now: u64) {
        self.neighbors.insert(
            ip.to_string(),
            NeighborEntry { mac, added_at: now },
        );
    }

    pub fn neighbor(&self, ip: &str) -> Option<MacAddr> {
        self.neighbors.get(ip).map(|e| e.mac)
    }

    // ---- internal plumbing ---------------------------------------------

    /// Re-resolves the referenced report config into the collector's
    /// plugin parameters and tick counts. False when the report config is
    /// not present; the collector's reporting is cleared.
    fn apply_report_config_changes(&mut self, name: &str) -> bool {
        let Some(collector) = self.collect_tree.get_mut(name) else {
            return false;
        };
        let report = self.report_conf_tree.get(&collector.config.report_name);
        let ok = match report {
            Some(report) => {
                collector.params = PluginParams {
                    sample_interval: collector.config.sample_interval,
                    report_interval: report.report_interval,
                    format: report.format,
                    mqtt_topic: report.mqtt_topic.clone(),
                    filters: PluginFilters {
                        collect: none_if_empty(&collector.config.filter_name),
                        hist: none_if_empty(&report.hist_filter),
                        report: none_if_empty(&report.report_filter),
                    },
                };
                if collector.config.sample_interval == 0 || report.report_interval == 0 {
                    collector.clear_report_ticks();
                } else if collector.report_time != report.report_interval {
                    collector.report_ticks =
                        report.report_interval / collector.config.sample_interval;
                    collector.report_time = report.report_interval;
                }
                // the aggregator's report semantics follow the format
                if collector.initialized {
                    let report_type = match report.format {
                        ReportFormat::Delta => ReportType::Relative,
                        _ => ReportType::Absolute,
                    };
                    self.aggr.set_report_type(report_type);
                }
                true
            }
            None => {
                collector.params = PluginParams::default();
                collector.clear_report_ticks();
                debug!(
                    target: "fcm",
                    collector = name,
                    "report config not found"
                );
                false
            }
        };
        self.set_aggr_purge_interval();
        ok
    }

    /// Revisits parked collectors once a report config lands.
    fn init_pending_collectors(&mut self) {
        let names: Vec<String> = self
            .collect_tree
            .iter()
            .filter(|(_, c)| !c.initialized)
            .map(|(n, _)| n.clone())
            .collect();
        for name in names {
            if self.apply_report_config_changes(&name) {
                self.init_collector_plugin(&name);
            }
        }
    }

    fn init_collector_plugin(&mut self, name: &str) {
        let Some(collector) = self.collect_tree.get_mut(name) else {
            return;
        };
        if collector.initialized || collector.plugin.is_none() {
            return;
        }
        let mut plugin = collector.plugin.take().expect("plugin present");
        let params = collector.params.clone();
        let other_config = collector.config.other_config.clone();
        {
            let Self {
                aggr,
                filter_engine,
                emitter,
                observation_point,
                gk_client,
                gk_cache,
                ..
            } = &mut *self;
            let mut ctx = PluginCtx {
                name,
                params: &params,
                other_config: &other_config,
                aggr,
                filter_engine,
                emitter: emitter.as_mut(),
                observation_point,
                gatekeeper: gk_client.as_mut(),
                gk_cache,
                now: 0,
            };
            if let Err(e) = plugin.init(&mut ctx) {
                error!(target: "fcm", collector = name, error = %e, "plugin init failed");
                return;
            }
        }

        for filter in [
            params.filters.collect.as_deref(),
            params.filters.report.as_deref(),
        ]
        .into_iter()
        .flatten()
        {
            self.filter_engine.register_client(FilterClient {
                name: filter.to_string(),
                session: name.to_string(),
            });
        }

        let collector = self
            .collect_tree
            .get_mut(name)
            .expect("collector still present");
        collector.plugin = Some(plugin);
        collector.initialized = true;
        info!(target: "fcm", collector = name, "collector initialized");
        self.reset_sample_period();
    }

    /// All collectors share one sample cadence: the minimum configured
    /// sample interval.
    fn reset_sample_period(&mut self) {
        let min = self
            .collect_tree
            .values()
            .filter(|c| c.initialized && c.config.sample_interval > 0)
            .map(|c| c.config.sample_interval)
            .min()
            .unwrap_or(0);
        if min != self.sample_period {
            self.sample_period = min;
            self.next_sample_at = None;
            debug!(target: "fcm", period = min, "sample period reset");
        }
    }

    /// Purge cadence tracks the slowest report.
    fn set_aggr_purge_interval(&mut self) {
        let max = self
            .report_conf_tree
            .values()
            .map(|r| r.report_interval)
            .max()
            .unwrap_or(0);
        if max != self.purge_interval {
            self.purge_interval = max;
            debug!(target: "fcm", interval = max, "aggregator purge interval set");
        }
    }

    // ---- timers --------------------------------------------------------

    /// Fires everything due at `now` (seconds). The cooperative core: all
    /// collector callbacks run here, on this thread.
    pub fn step(&mut self, now: u64) {
        if self.sample_period > 0 {
            let due = match self.next_sample_at {
                Some(at) => now >= at,
                None => {
                    self.next_sample_at = Some(now + self.sample_period);
                    false
                }
            };
            if due {
                self.next_sample_at = Some(now + self.sample_period);
                self.sample_tick(now);
            }
        }

        let mgr_due = match self.periodic_ts {
            Some(ts) => now.saturating_sub(ts) >= self.config.mgr_interval,
            None => {
                self.periodic_ts = Some(now);
                false
            }
        };
        if mgr_due {
            self.periodic_ts = Some(now);
            self.manager_tick(now);
        }

        if self.purge_interval > 0 && now.saturating_sub(self.purge_ts) >= self.purge_interval {
            self.purge_ts = now;
            self.aggr.purge(now);
        }
    }

    fn sample_tick(&mut self, now: u64) {
        let names: Vec<String> = self.collect_tree.keys().cloned().collect();
        for name in names {
            // pick up report config changes made since the last tick
            self.apply_report_config_changes(&name);

            if !self.collect_tree.get(&name).is_some_and(|c| c.initialized) {
                continue;
            }

            if let Some(source) = self.flow_source.as_mut() {
                source(&mut self.aggr, now);
            }

            let Some(collector) = self.collect_tree.get_mut(&name) else {
                continue;
            };
            let mut plugin = match collector.plugin.take() {
                Some(p) => p,
                None => continue,
            };
            let params = collector.params.clone();
            let other_config = collector.config.other_config.clone();
            let report_ticks = collector.report_ticks;

            {
                let Self {
                    aggr,
                    filter_engine,
                    emitter,
                    observation_point,
                    gk_client,
                    gk_cache,
                    ..
                } = &mut *self;
                let mut ctx = PluginCtx {
                    name: &name,
                    params: &params,
                    other_config: &other_config,
                    aggr,
                    filter_engine,
                    emitter: emitter.as_mut(),
                    observation_point,
                    gatekeeper: gk_client.as_mut(),
                    gk_cache,
                    now,
                };
                plugin.collect_periodic(&mut ctx);
            }

            let fire_report = if report_ticks == 0 {
                collector_mut(&mut self.collect_tree, &name).curr_ticks = 0;
                false
            } else {
                let collector = collector_mut(&mut self.collect_tree, &name);
                collector.curr_ticks += 1;
                collector.curr_ticks >= report_ticks
            };

            if fire_report {
                {
                    let Self {
                        aggr,
                        filter_engine,
                        emitter,
                        observation_point,
                        gk_client,
                        gk_cache,
                        ..
                    } = &mut *self;
                    let mut ctx = PluginCtx {
                        name: &name,
                        params: &params,
                        other_config: &other_config,
                        aggr,
                        filter_engine,
                        emitter: emitter.as_mut(),
                        observation_point,
                        gatekeeper: gk_client.as_mut(),
                        gk_cache,
                        now,
                    };
                    plugin.send_report(&mut ctx);
                }
                let collector = collector_mut(&mut self.collect_tree, &name);
                collector.report_count += 1;
                collector.curr_ticks = 0;
                debug!(
                    target: "fcm",
                    collector = %name,
                    count = collector.report_count,
                    "report sent"
                );
            }

            if let Some(collector) = self.collect_tree.get_mut(&name) {
                collector.plugin = Some(plugin);
            }
        }
    }

    fn manager_tick(&mut self, now: u64) {
        match memory::read_status(&self.config.proc_status_path) {
            Ok(mem) => {
                info!(
                    target: "fcm",
                    real_kb = mem.curr_real_mem,
                    virt_kb = mem.curr_virt_mem,
                    "memory usage"
                );
                if self.watchdog_tripped(&mem) {
                    error!(
                        target: "fcm",
                        max_mem_kb = self.max_mem_kb,
                        "max mem usage reached, requesting restart"
                    );
                    self.exit_requested = true;
                    return;
                }
            }
            Err(e) => debug!(target: "fcm", error = %e, "status read failed"),
        }

        // plugin periodic hooks
        let names: Vec<String> = self.collect_tree.keys().cloned().collect();
        for name in names {
            let Some(collector) = self.collect_tree.get_mut(&name) else {
                continue;
            };
            if !collector.initialized {
                continue;
            }
            let mut plugin = match collector.plugin.take() {
                Some(p) => p,
                None => continue,
            };
            let params = collector.params.clone();
            let other_config = collector.config.other_config.clone();
            {
                let Self {
                    aggr,
                    filter_engine,
                    emitter,
                    observation_point,
                    gk_client,
                    gk_cache,
                    ..
                } = &mut *self;
                let mut ctx = PluginCtx {
                    name: &name,
                    params: &params,
                    other_config: &other_config,
                    aggr,
                    filter_engine,
                    emitter: emitter.as_mut(),
                    observation_point,
                    gatekeeper: gk_client.as_mut(),
                    gk_cache,
                    now,
                };
                plugin.periodic(&mut ctx);
            }
            if let Some(collector) = self.collect_tree.get_mut(&name) {
                collector.plugin = Some(plugin);
            }
        }

        // neighbor table expiry
        let ttl = self.config.neigh_cache_ttl;
        self.neighbors.retain(|_, e| e.added_at + ttl >= now);
    }

    fn watchdog_tripped(&self, mem: &MemUsage) -> bool {
        self.max_mem_kb > 0 && mem.curr_real_mem > self.max_mem_kb
    }

    /// Serializes the gatekeeper cache into the persistent store.
    pub fn persist_gatekeeper_cache(&mut self) {
        let Some(store) = self.gk_store.as_deref_mut() else {
            return;
        };
        let image = persist::serialize_cache(&self.gk_cache);
        persist::persist(store, &image);
    }
}

fn none_if_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

fn collector_mut<'a>(tree: &'a mut BTreeMap<String, Collector>, name: &str) -> &'a mut Collector {
    tree.get_mut(name).expect("collector present during tick")
}
