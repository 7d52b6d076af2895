//! Flow aggregation: five-tuple accumulators collected into observation
//! windows. An accumulator is created on first observation of a flow in
//! the active window and evicted once its TTL passes without traffic.
//! Closing a window snapshots every accumulator whose counters moved since
//! the window opened; unchanged accumulators are held, not reported.

pub mod tags;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::debug;

use crate::error::{FlowError, Result};

/// Ethernet address, formatted lowercase colon-separated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct MacAddr(pub [u8; 6]);

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self> {
        let cleaned: String = s.split(':').collect();
        let bytes = hex::decode(&cleaned)
            .map_err(|_| FlowError::InvalidArg(format!("bad mac address {s}")))?;
        if bytes.len() != 6 {
            return Err(FlowError::InvalidArg(format!("bad mac address {s}")));
        }
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&bytes);
        Ok(MacAddr(mac))
    }
}

impl MacAddr {
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 6]
    }
}

/// Five-tuple key plus the layer-2 context. IPv4 addresses are carried as
/// v4-mapped v6 for uniform keying; the unspecified address is all zero.
/// Immutable once installed in the aggregator.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct FlowKey {
    pub smac: MacAddr,
    pub dmac: MacAddr,
    pub vlan_id: u16,
    pub ethertype: u16,
    pub ip_version: u8,
    pub saddr: [u8; 16],
    pub daddr: [u8; 16],
    pub protocol: u8,
    pub sport: u16,
    pub dport: u16,
}

impl FlowKey {
    pub fn has_ip(&self) -> bool {
        self.ip_version != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlowCounters {
    pub packets_count: u64,
    pub bytes_count: u64,
    pub payload_bytes_count: u64,
}

/// Delta with 32-bit wrap tolerance. Kernel counters are u32; a current
/// value below the previous one is a wrap, not a reset, when both fit the
/// narrow width.
pub fn counter_delta(current: u64, previous: u64) -> u64 {
    if current >= previous {
        current - previous
    } else if previous <= u32::MAX as u64 {
        (current as u32).wrapping_sub(previous as u32) as u64
    } else {
        0
    }
}

impl FlowCounters {
    pub fn delta(&self, previous: &FlowCounters) -> FlowCounters {
        FlowCounters {
            packets_count: counter_delta(self.packets_count, previous.packets_count),
            bytes_count: counter_delta(self.bytes_count, previous.bytes_count),
            payload_bytes_count: counter_delta(
                self.payload_bytes_count,
                previous.payload_bytes_count,
            ),
        }
    }
}

/// Vendor/application classification attached to a flow.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FlowTags {
    pub vendor: String,
    pub app_name: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VendorValue {
    Str(String),
    U32(u32),
    U64(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VendorKvPair {
    pub key: String,
    pub value: VendorValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VendorData {
    pub vendor: String,
    pub kv_pairs: Vec<VendorKvPair>,
}

/// Per-MAC report annotation resolved at serialization time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataReportTags {
    /// the MAC string the tags were registered under
    pub id: String,
    pub features: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlowState {
    pub first_obs: u64,
    pub last_obs: u64,
    pub fstart: bool,
    pub fend: bool,
    pub report_attrs: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Accumulator {
    pub key: FlowKey,
    pub counters: FlowCounters,
    pub prev_counters: FlowCounters,
    pub state: FlowState,
    pub tags: Vec<FlowTags>,
    pub vendor_data: Vec<VendorData>,
    pub data_report_tags: SmallVec<[DataReportTags; 2]>,
}

impl Accumulator {
    fn new(key: FlowKey, now: u64) -> Self {
        Accumulator {
            key,
            state: FlowState {
                first_obs: now,
                last_obs: now,
                fstart: true,
                fend: false,
                report_attrs: true,
            },
            ..Default::default()
        }
    }

    fn changed(&self) -> bool {
        self.counters != self.prev_counters
    }
}

/// Snapshot of one accumulator appended to a closed window.
#[derive(Debug, Clone)]
pub struct FlowStats {
    pub key: FlowKey,
    pub counters: FlowCounters,
    pub tags: Vec<FlowTags>,
    pub vendor_data: Vec<VendorData>,
    pub data_report_tags: Vec<DataReportTags>,
    pub state: FlowState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UplinkType {
    #[default]
    Unknown,
    Eth,
    Lte,
}

impl UplinkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UplinkType::Unknown => "unknown",
            UplinkType::Eth => "eth",
            UplinkType::Lte => "lte",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Uplink {
    pub if_type: UplinkType,
    pub changed: bool,
}

#[derive(Debug, Default)]
pub struct Window {
    pub started_at: u64,
    pub ended_at: u64,
    pub stats: Vec<FlowStats>,
    pub uplink: Option<Uplink>,
    pub dropped_stats: u64,
}

/// Identifies the emitting device in every report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObservationPoint {
    pub node_id: String,
    pub location_id: String,
}

#[derive(Debug, Default)]
pub struct FlowReport {
    pub reported_at: u64,
    pub observation_point: ObservationPoint,
    pub windows: Vec<Window>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportType {
    #[default]
    Absolute,
    Relative,
}

#[derive(Debug, Clone)]
pub struct AggregatorSet {
    /// seconds without observation before an accumulator is evicted
    pub acc_ttl: u64,
    pub report_type: ReportType,
    /// cap on accumulators created per active window; None is unbounded
    pub max_accs: Option<usize>,
}

impl Default for AggregatorSet {
    fn default() -> Self {
        AggregatorSet {
            acc_ttl: 120,
            report_type: ReportType::Absolute,
            max_accs: None,
        }
    }
}

type ReportCb = Box<dyn FnMut(&mut Accumulator) + Send>;

/// The shared accumulator store. One window is active at any time; closed
/// windows queue until the next report drains them.
pub struct Aggregator {
    set: AggregatorSet,
    accs: BTreeMap<FlowKey, Accumulator>,
    /// flows with no IP header aggregate under their MAC pair
    eth_pairs: BTreeMap<(MacAddr, MacAddr), Accumulator>,
    active: Option<Window>,
    closed: Vec<Window>,
    pending_uplink: Option<Uplink>,
    on_acc_report: Option<ReportCb>,
    dropped_in_window: u64,
}

impl Aggregator {
    pub fn new(set: AggregatorSet) -> Self {
        Aggregator {
            set,
            accs: BTreeMap::new(),
            eth_pairs: BTreeMap::new(),
            active: None,
            closed: Vec::new(),
            pending_uplink: None,
            on_acc_report: None,
            dropped_in_window: 0,
        }
    }

    pub fn total_flows(&self) -> usize {
        self.accs.len()
    }

    pub fn total_eth_pairs(&self) -> usize {
        self.eth_pairs.len()
    }

    pub fn report_type(&self) -> ReportType {
        self.set.report_type
    }

    pub fn set_report_type(&mut self, report_type: ReportType) {
        self.set.report_type = report_type;
    }

    /// Callback run per accumulator just before it is appended to a
    /// window's stats list; the report tagger hangs off this.
    pub fn on_acc_report(&mut self, cb: ReportCb) {
        self.on_acc_report = Some(cb);
    }

    /// Opens a new active window. A window is already active between
    /// activate/close pairs; calling again is a no-op.
    pub fn activate_window(&mut self, now: u64) {
        if self.active.is_some() {
            return;
        }
        self.active = Some(Window {
            started_at: now,
            ..Default::default()
        });
        self.dropped_in_window = 0;
    }

    /// Attaches the uplink descriptor to the window being closed.
    pub fn add_uplink(&mut self, if_type: UplinkType, changed: bool) {
        self.pending_uplink = Some(Uplink { if_type, changed });
    }

    /// Records an observation. Counters are cumulative per flow source;
    /// the accumulator tracks the latest value.
    pub fn add_sample(&mut self, key: &FlowKey, counters: FlowCounters, now: u64) {
        if self.active.is_none() {
            self.activate_window(now);
        }
        let (cap_hit, acc) = if key.has_ip() {
            let exists = self.accs.contains_key(key);
            if !exists && self.at_capacity() {
                (true, None)
            } else {
                (
                    false,
                    Some(
                        self.accs
                            .entry(key.clone())
                            .or_insert_with(|| Accumulator::new(key.clone(), now)),
                    ),
                )
            }
        } else {
            let pair = (key.smac, key.dmac);
            let exists = self.eth_pairs.contains_key(&pair);
            if !exists && self.at_capacity() {
                (true, None)
            } else {
                (
                    false,
                    Some(
                        self.eth_pairs
                            .entry(pair)
                            .or_insert_with(|| Accumulator::new(key.clone(), now)),
                    ),
                )
            }
        };
        if cap_hit {
            self.dropped_in_window += 1;
            return;
        }
        let acc = acc.expect("capacity checked");
        acc.counters = counters;
        acc.state.last_obs = now;
    }

    /// Attaches classification tags to an existing flow.
    pub fn add_tags(&mut self, key: &FlowKey, tags: FlowTags) {
        if let Some(acc) = self.accs.get_mut(key) {
            acc.tags.push(tags);
            acc.state.report_attrs = true;
        }
    }

    pub fn add_vendor_data(&mut self, key: &FlowKey, data: VendorData) {
        if let Some(acc) = self.accs.get_mut(key) {
            acc.vendor_data.push(data);
            acc.state.report_attrs = true;
        }
    }

    fn at_capacity(&self) -> bool {
        self.set
            .max_accs
            .is_some_and(|cap| self.accs.len() + self.eth_pairs.len() >= cap)
    }

    /// Closes the active window: accumulators whose counters moved since
    /// the window opened are snapshotted into the window stats; the rest
    /// are held for a later window. Relative reports carry deltas.
    pub fn close_active_window(&mut self, now: u64) {
        let Some(mut window) = self.active.take() else {
            return;
        };
        window.ended_at = now;
        window.uplink = self.pending_uplink.take();
        window.dropped_stats = std::mem::take(&mut self.dropped_in_window);

        let report_type = self.set.report_type;
        let cb = &mut self.on_acc_report;
        let mut held = 0usize;

        let mut snap = |acc: &mut Accumulator| -> Option<FlowStats> {
            if !acc.changed() {
                return None;
            }
            if let Some(cb) = cb.as_mut() {
                cb(acc);
            }
            let counters = match report_type {
                ReportType::Absolute => acc.counters,
                ReportType::Relative => acc.counters.delta(&acc.prev_counters),
            };
            let stats = FlowStats {
                key: acc.key.clone(),
                counters,
                tags: acc.tags.clone(),
                vendor_data: acc.vendor_data.clone(),
                data_report_tags: acc.data_report_tags.to_vec(),
                state: acc.state,
            };
            acc.prev_counters = acc.counters;
            acc.state.fstart = false;
            acc.state.report_attrs = false;
            Some(stats)
        };

        for acc in self.accs.values_mut() {
            match snap(acc) {
                Some(stats) => window.stats.push(stats),
                None => held += 1,
            }
        }
        for acc in self.eth_pairs.values_mut() {
            match snap(acc) {
                Some(stats) => window.stats.push(stats),
                None => held += 1,
            }
        }

        debug!(
            target: "aggregator",
            reported = window.stats.len(),
            held,
            dropped = window.dropped_stats,
            "window closed"
        );
        self.closed.push(window);
    }

    /// Evicts accumulators whose TTL lapsed without observation. Safe to
    /// call between any window operations.
    pub fn purge(&mut self, now: u64) {
        let ttl = self.set.acc_ttl;
        let before = self.accs.len() + self.eth_pairs.len();
        self.accs
            .retain(|_, acc| acc.state.last_obs + ttl >= now);
        self.eth_pairs
            .retain(|_, acc| acc.state.last_obs + ttl >= now);
        let evicted = before - self.accs.len() - self.eth_pairs.len();
        if evicted > 0 {
            debug!(target: "aggregator", evicted, "purged idle accumulators");
        }
    }

    /// Drains the closed windows into a report and reopens an active
    /// window for the next cycle.
    pub fn report(&mut self, now: u64, observation_point: &ObservationPoint) -> FlowReport {
        if self.active.is_some() {
            self.close_active_window(now);
        }
        let report = FlowReport {
            reported_at: now,
            observation_point: observation_point.clone(),
            windows: std::mem::take(&mut self.closed),
        };
        self.activate_window(now);
        report
    }

    /// Drops all state: accumulators, windows, pending annotations.
    pub fn reset(&mut self) {
        self.accs.clear();
        self.eth_pairs.clear();
        self.active = None;
        self.closed.clear();
        self.pending_uplink = None;
        self.dropped_in_window = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(sport: u16) -> FlowKey {
        FlowKey {
            smac: MacAddr([0, 1, 2, 3, 4, 5]),
            dmac: MacAddr([6, 7, 8, 9, 10, 11]),
            ethertype: 0x0800,
            ip_version: 4,
            protocol: 6,
            sport,
            dport: 443,
            ..Default::default()
        }
    }

    fn counters(packets: u64, bytes: u64) -> FlowCounters {
        FlowCounters {
            packets_count: packets,
            bytes_count: bytes,
            payload_bytes_count: 0,
        }
    }

    #[test]
    fn changed_accumulators_report_and_reset() {
        let mut aggr = Aggregator::new(AggregatorSet::default());
        aggr.activate_window(100);
        aggr.add_sample(&key(1), counters(10, 1000), 101);
        aggr.close_active_window(110);

        let report = aggr.report(110, &ObservationPoint::default());
        assert_eq!(report.windows.len(), 1);
        assert_eq!(report.windows[0].stats.len(), 1);
        assert_eq!(report.windows[0].stats[0].counters.packets_count, 10);

        // unchanged since last close: held, not reported
        aggr.close_active_window(120);
        let report = aggr.report(120, &ObservationPoint::default());
        assert!(report.windows.iter().all(|w| w.stats.is_empty()));
    }

    #[test]
    fn relative_report_carries_deltas() {
        let mut aggr = Aggregator::new(AggregatorSet {
            report_type: ReportType::Relative,
            ..Default::default()
        });
        aggr.activate_window(0);
        aggr.add_sample(&key(1), counters(100, 5000), 1);
        aggr.close_active_window(10);
        aggr.activate_window(10);
        aggr.add_sample(&key(1), counters(150, 7000), 11);
        aggr.close_active_window(20);

        let report = aggr.report(20, &ObservationPoint::default());
        let second = &report.windows[1].stats[0];
        assert_eq!(second.counters.packets_count, 50);
        assert_eq!(second.counters.bytes_count, 2000);
    }

    #[test]
    fn wrap_tolerant_delta() {
        assert_eq!(counter_delta(195, 200), u32::MAX as u64 - 4);
        assert_eq!(counter_delta(200, 195), 5);
        // wide counters do not wrap
        assert_eq!(counter_delta(5, u32::MAX as u64 + 10), 0);
    }

    #[test]
    fn purge_evicts_idle_flows() {
        let mut aggr = Aggregator::new(AggregatorSet {
            acc_ttl: 60,
            ..Default::default()
        });
        aggr.add_sample(&key(1), counters(1, 100), 0);
        aggr.add_sample(&key(2), counters(1, 100), 50);
        aggr.purge(70);
        assert_eq!(aggr.total_flows(), 1);
    }

    #[test]
    fn capacity_cap_counts_drops() {
        let mut aggr = Aggregator::new(AggregatorSet {
            max_accs: Some(1),
            ..Default::default()
        });
        aggr.add_sample(&key(1), counters(1, 1), 0);
        aggr.add_sample(&key(2), counters(1, 1), 0);
        aggr.close_active_window(5);
        let report = aggr.report(5, &ObservationPoint::default());
        assert_eq!(report.windows[0].dropped_stats, 1);
        assert_eq!(report.windows[0].stats.len(), 1);
    }

    #[test]
    fn flows_without_ip_aggregate_by_mac_pair() {
        let mut aggr = Aggregator::new(AggregatorSet::default());
        let mut k = key(0);
        k.ip_version = 0;
        aggr.add_sample(&k, counters(2, 200), 0);
        aggr.add_sample(&k, counters(4, 400), 1);
        assert_eq!(aggr.total_flows(), 0);
        assert_eq!(aggr.total_eth_pairs(), 1);
    }

    #[test]
    fn mac_addr_round_trip() {
        let mac: MacAddr = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        assert_eq!(mac.to_string(), "aa:bb:cc:dd:ee:ff");
        assert!("aa:bb:cc".parse::<MacAddr>().is_err());
    }
}
