//! Rule-indexed predicate engine. A filter table is an ordered rule list;
//! a rule is a set of optional predicates with in/out semantics over the
//! layer-2/layer-3 fields, packet counters, and attached application tags.
//! The first rule whose every present predicate matches decides the
//! request; a missing predicate always matches; no decision falls through
//! to allow.

use std::collections::BTreeMap;

use smallvec::SmallVec;
use tracing::debug;

use crate::aggregator::FlowKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SetOp {
    #[default]
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MathOp {
    Lt,
    Leq,
    Gt,
    Geq,
    Eq,
    Neq,
}

impl MathOp {
    fn eval(&self, lhs: u64, rhs: u64) -> bool {
        match self {
            MathOp::Lt => lhs < rhs,
            MathOp::Leq => lhs <= rhs,
            MathOp::Gt => lhs > rhs,
            MathOp::Geq => lhs >= rhs,
            MathOp::Eq => lhs == rhs,
            MathOp::Neq => lhs != rhs,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Action {
    Exclude,
    #[default]
    Include,
    /// keep walking the rule list; include if nothing else decides
    DefaultInclude,
}

/// Port set member; `port_max == 0` means exact match on `port_min`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub port_min: u16,
    pub port_max: u16,
}

impl PortRange {
    fn contains(&self, port: u16) -> bool {
        if self.port_max == 0 {
            port == self.port_min
        } else {
            self.port_min <= port && port <= self.port_max
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SetPredicate<T> {
    pub op: SetOp,
    pub values: Vec<T>,
}

impl<T: PartialEq> SetPredicate<T> {
    fn matches(&self, value: &T) -> bool {
        let present = self.values.contains(value);
        match self.op {
            SetOp::In => present,
            SetOp::Out => !present,
        }
    }

    fn matches_any<'b>(&self, mut values: impl Iterator<Item = &'b T>) -> bool
    where
        T: 'b,
    {
        let hit = values.any(|v| self.values.contains(v));
        match self.op {
            SetOp::In => hit,
            SetOp::Out => !hit,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FilterRule {
    pub name: String,
    pub index: u32,
    pub smac: Option<SetPredicate<String>>,
    pub dmac: Option<SetPredicate<String>>,
    pub vlan_id: Option<SetPredicate<u16>>,
    pub src_ip: Option<SetPredicate<String>>,
    pub dst_ip: Option<SetPredicate<String>>,
    pub src_port: Option<(SetOp, Vec<PortRange>)>,
    pub dst_port: Option<(SetOp, Vec<PortRange>)>,
    pub proto: Option<SetPredicate<u8>>,
    pub pktcnt: Option<(MathOp, u64)>,
    pub app_names: Option<SetPredicate<String>>,
    pub app_tags: Option<SetPredicate<String>>,
    pub action: Action,
}

/// Layer-2 request fields; any may be absent.
#[derive(Debug, Clone, Default)]
pub struct L2Info {
    pub src_mac: Option<String>,
    pub dst_mac: Option<String>,
    pub vlan_id: Option<u16>,
    pub eth_type: Option<u16>,
}

#[derive(Debug, Clone, Default)]
pub struct L3Info {
    pub src_ip: Option<String>,
    pub dst_ip: Option<String>,
    pub sport: Option<u16>,
    pub dport: Option<u16>,
    pub proto: Option<u8>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PacketStats {
    pub pkt_cnt: Option<u64>,
    pub bytes: Option<u64>,
}

/// A filter request. The engine never mutates it.
#[derive(Debug, Default)]
pub struct FilterReq<'a> {
    pub l2: Option<&'a L2Info>,
    pub l3: Option<&'a L3Info>,
    pub pkts: Option<&'a PacketStats>,
    pub fkey: Option<&'a FlowKey>,
    /// app name/tag context from the flow key's attached tags
    pub app_names: &'a [String],
    pub app_tags: &'a [String],
}

fn port_match(pred: &(SetOp, Vec<PortRange>), port: Option<u16>) -> bool {
    let Some(port) = port else { return true };
    let present = pred.1.iter().any(|r| r.contains(port));
    match pred.0 {
        SetOp::In => present,
        SetOp::Out => !present,
    }
}

impl FilterRule {
    /// Every present predicate must match; absent predicates and absent
    /// request fields always match.
    pub fn matches(&self, req: &FilterReq<'_>) -> bool {
        if let (Some(pred), Some(l2)) = (&self.smac, req.l2) {
            if let Some(mac) = &l2.src_mac {
                if !pred.matches(mac) {
                    return false;
                }
            }
        }
        if let (Some(pred), Some(l2)) = (&self.dmac, req.l2) {
            if let Some(mac) = &l2.dst_mac {
                if !pred.matches(mac) {
                    return false;
                }
            }
        }
        if let (Some(pred), Some(l2)) = (&self.vlan_id, req.l2) {
            if let Some(vlan) = l2.vlan_id {
                if !pred.matches(&vlan) {
                    return false;
                }
            }
        }
        if let (Some(pred), Some(l3)) = (&self.src_ip, req.l3) {
            if let Some(ip) = &l3.src_ip {
                if !pred.matches(ip) {
                    return false;
                }
            }
        }
        if let (Some(pred), Some(l3)) = (&self.dst_ip, req.l3) {
            if let Some(ip) = &l3.dst_ip {
                if !pred.matches(ip) {
                    return false;
                }
            }
        }
        if let (Some(pred), Some(l3)) = (&self.src_port, req.l3) {
            if !port_match(pred, l3.sport) {
                return false;
            }
        }
        if let (Some(pred), Some(l3)) = (&self.dst_port, req.l3) {
            if !port_match(pred, l3.dport) {
                return false;
            }
        }
        if let (Some(pred), Some(l3)) = (&self.proto, req.l3) {
            if let Some(proto) = l3.proto {
                if !pred.matches(&proto) {
                    return false;
                }
            }
        }
        if let (Some((op, threshold)), Some(pkts)) = (&self.pktcnt, req.pkts) {
            if let Some(cnt) = pkts.pkt_cnt {
                if !op.eval(cnt, *threshold) {
                    return false;
                }
            }
        }
        if let Some(pred) = &self.app_names {
            if !pred.matches_any(req.app_names.iter()) {
                return false;
            }
        }
        if let Some(pred) = &self.app_tags {
            if !pred.matches_any(req.app_tags.iter()) {
                return false;
            }
        }
        true
    }
}

/// Named, ordered rule list with O(1) by-index access.
#[derive(Debug, Default)]
pub struct FilterTable {
    pub name: String,
    rules: Vec<FilterRule>,
}

impl FilterTable {
    pub fn new(name: &str) -> Self {
        FilterTable {
            name: name.to_string(),
            rules: Vec::new(),
        }
    }

    /// Inserts or replaces the rule at its index, keeping index order.
    pub fn upsert_rule(&mut self, rule: FilterRule) {
        match self.rules.binary_search_by_key(&rule.index, |r| r.index) {
            Ok(pos) => self.rules[pos] = rule,
            Err(pos) => self.rules.insert(pos, rule),
        }
    }

    pub fn remove_rule(&mut self, index: u32) {
        self.rules.retain(|r| r.index != index);
    }

    pub fn rule_by_index(&self, index: u32) -> Option<&FilterRule> {
        self.rules
            .binary_search_by_key(&index, |r| r.index)
            .ok()
            .map(|pos| &self.rules[pos])
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// First-match evaluation. `DefaultInclude` keeps walking; with no
    /// decisive rule the request is allowed.
    pub fn apply(&self, req: &FilterReq<'_>) -> bool {
        for rule in &self.rules {
            if !rule.matches(req) {
                continue;
            }
            match rule.action {
                Action::Include => return true,
                Action::Exclude => return false,
                Action::DefaultInclude => continue,
            }
        }
        true
    }
}

/// A registered consumer of one named table; rebound when the table is
/// added or replaced.
pub struct FilterClient {
    pub name: String,
    pub session: String,
}

/// Holds every named filter table plus the client registry so config
/// updates rebind consumers atomically.
#[derive(Default)]
pub struct FilterEngine {
    tables: BTreeMap<String, FilterTable>,
    clients: Vec<FilterClient>,
}

impl FilterEngine {
    pub fn new() -> Self {
        FilterEngine::default()
    }

    pub fn table(&self, name: &str) -> Option<&FilterTable> {
        self.tables.get(name)
    }

    pub fn upsert_rule(&mut self, table_name: &str, rule: FilterRule) {
        let table = self
            .tables
            .entry(table_name.to_string())
            .or_insert_with(|| FilterTable::new(table_name));
        table.upsert_rule(rule);
        self.notify_clients(table_name);
    }

    pub fn remove_rule(&mut self, table_name: &str, index: u32) {
        if let Some(table) = self.tables.get_mut(table_name) {
            table.remove_rule(index);
            if table.is_empty() {
                self.tables.remove(table_name);
            }
            self.notify_clients(table_name);
        }
    }

    /// Evaluates the named table; an unknown name allows everything.
    pub fn apply(&self, table_name: &str, req: &FilterReq<'_>) -> bool {
        match self.tables.get(table_name) {
            Some(table) => table.apply(req),
            None => true,
        }
    }

    pub fn register_client(&mut self, client: FilterClient) {
        debug!(target: "filter", name = %client.name, "client registered");
        self.clients.push(client);
    }

    pub fn deregister_client(&mut self, name: &str, session: &str) {
        self.clients
            .retain(|c| !(c.name == name && c.session == session));
    }

    pub fn clients_of(&self, table_name: &str) -> SmallVec<[&FilterClient; 4]> {
        self.clients
            .iter()
            .filter(|c| c.name == table_name)
            .collect()
    }

    fn notify_clients(&self, table_name: &str) {
        let n = self.clients_of(table_name).len();
        if n > 0 {
            debug!(target: "filter", table = table_name, clients = n, "table updated");
        }
    }
}
