//! Collector plugin contract and the static plugin table. Dynamic shared
//! objects are replaced by compile-time registration: a collector config
//! resolves its plugin by name prefix against the table, and resolution
//! failure leaves the collector uninitialized until a later config event
//! recreates it.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::aggregator::{Aggregator, ObservationPoint};
use crate::config::{CollectorConfig, ReportFormat};
use crate::error::{FlowError, Result};
use crate::filter::FilterEngine;
use crate::gatekeeper::{GatekeeperClient, GkCache};
use crate::report::ReportEmitter;

/// Filter names resolved from the collector and report configs.
#[derive(Debug, Clone, Default)]
pub struct PluginFilters {
    pub collect: Option<String>,
    pub hist: Option<String>,
    pub report: Option<String>,
}

/// Report-config-driven parameters, reapplied before every sample tick so
/// config changes land without restarting the collector.
#[derive(Debug, Clone, Default)]
pub struct PluginParams {
    pub sample_interval: u64,
    pub report_interval: u64,
    pub format: ReportFormat,
    pub mqtt_topic: String,
    pub filters: PluginFilters,
}

/// Everything a plugin callback may touch. All callbacks run on the
/// manager thread and must not block.
pub struct PluginCtx<'a> {
    pub name: &'a str,
    pub params: &'a PluginParams,
    pub other_config: &'a BTreeMap<String, String>,
    pub aggr: &'a mut Aggregator,
    pub filter_engine: &'a FilterEngine,
    pub emitter: &'a mut dyn ReportEmitter,
    pub observation_point: &'a ObservationPoint,
    pub gatekeeper: Option<&'a mut GatekeeperClient>,
    pub gk_cache: &'a mut GkCache,
    pub now: u64,
}

pub trait CollectorPlugin: Send {
    fn init(&mut self, ctx: &mut PluginCtx<'_>) -> Result<()>;
    fn collect_periodic(&mut self, ctx: &mut PluginCtx<'_>);
    fn send_report(&mut self, ctx: &mut PluginCtx<'_>);
    /// Coarse manager-interval hook.
    fn periodic(&mut self, _ctx: &mut PluginCtx<'_>) {}
    fn close(&mut self, _ctx: &mut PluginCtx<'_>) {}
}

pub type PluginCtor = fn() -> Box<dyn CollectorPlugin>;

/// Compile-time plugin registry. Collector names resolve by prefix, so
/// `lanstats_home` binds the `lanstats` plugin.
#[derive(Clone, Default)]
pub struct PluginTable {
    entries: Vec<(String, PluginCtor)>,
}

impl PluginTable {
    pub fn new() -> Self {
        PluginTable::default()
    }

    /// The built-in collectors.
    pub fn builtin() -> Self {
        let mut table = PluginTable::new();
        table.register("intfstats", || {
            Box::new(crate::collectors::intf_stats::IntfStatsCollector::default())
        });
        table.register("lanstats", || {
            Box::new(crate::collectors::lan_stats::LanStatsCollector::default())
        });
        table
    }

    pub fn register(&mut self, name: &str, ctor: PluginCtor) {
        self.entries.push((name.to_string(), ctor));
    }

    /// Resolves a collector config to a plugin instance.
    pub fn resolve(&self, config: &CollectorConfig) -> Result<Box<dyn CollectorPlugin>> {
        let wanted = config.plugin_name();
        self.entries
            .iter()
            .find(|(name, _)| wanted.starts_with(name.as_str()))
            .map(|(_, ctor)| ctor())
            .ok_or_else(|| FlowError::PluginResolve(wanted.to_string()))
    }
}

/// Shared handle to the data-report tag registry; the manager updates it
/// on OpenFlow-Tag events and the aggregator's report hook reads it.
pub type SharedTagRegistry = Arc<RwLock<crate::aggregator::tags::TagRegistry>>;
