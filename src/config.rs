//! Config-change event surface. The configuration layer itself (OVSDB) is
//! an external collaborator; the agent consumes typed change events for
//! the logical tables below and reacts to them. Records deserialize from
//! the bridge's JSON feed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::aggregator::UplinkType;
use crate::filter::{Action, FilterRule, MathOp, PortRange, SetOp, SetPredicate};

/// Change kind attached to every record event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigEvent<T> {
    New(T),
    Modify(T),
    Delete(T),
}

impl<T> ConfigEvent<T> {
    pub fn record(&self) -> &T {
        match self {
            ConfigEvent::New(r) | ConfigEvent::Modify(r) | ConfigEvent::Delete(r) => r,
        }
    }
}

/// `other_config` keys the collector host recognizes.
pub const OTHER_CONFIG_DSO_PATH: &str = "dso_path";
pub const OTHER_CONFIG_DSO_INIT: &str = "dso_init";
pub const OTHER_CONFIG_DSO: &str = "dso";
pub const OTHER_CONFIG_PARENT_TAG: &str = "parent_tag";
pub const OTHER_CONFIG_ACTIVE: &str = "active";
pub const OTHER_CONFIG_CT_ZONE: &str = "ct_zone";
pub const OTHER_CONFIG_INTF_LIST: &str = "intf_list";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectorConfig {
    pub name: String,
    /// sample interval in seconds
    #[serde(default)]
    pub sample_interval: u64,
    #[serde(default)]
    pub filter_name: String,
    #[serde(default)]
    pub report_name: String,
    #[serde(default)]
    pub other_config: BTreeMap<String, String>,
}

impl CollectorConfig {
    pub fn other(&self, key: &str) -> Option<&str> {
        self.other_config.get(key).map(|s| s.as_str())
    }

    /// The static plugin table entry this collector binds to: an explicit
    /// `dso` override, else the collector name.
    pub fn plugin_name(&self) -> &str {
        self.other(OTHER_CONFIG_DSO).unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    #[default]
    Cumulative,
    Delta,
    Raw,
}

impl ReportFormat {
    pub fn parse(s: &str) -> ReportFormat {
        match s.to_ascii_lowercase().as_str() {
            "delta" => ReportFormat::Delta,
            "raw" => ReportFormat::Raw,
            _ => ReportFormat::Cumulative,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportConfig {
    pub name: String,
    /// report interval in seconds; zero disables reporting
    #[serde(default)]
    pub report_interval: u64,
    #[serde(default)]
    pub format: ReportFormat,
    #[serde(default)]
    pub mqtt_topic: String,
    #[serde(default)]
    pub hist_filter: String,
    #[serde(default)]
    pub hist_interval: u64,
    #[serde(default)]
    pub report_filter: String,
    #[serde(default)]
    pub other_config: BTreeMap<String, String>,
}

/// Flat FCM_Filter row; converts into the engine's rule form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRuleConfig {
    pub name: String,
    pub index: u32,
    #[serde(default)]
    pub smac: Vec<String>,
    #[serde(default)]
    pub smac_op: Option<String>,
    #[serde(default)]
    pub dmac: Vec<String>,
    #[serde(default)]
    pub dmac_op: Option<String>,
    #[serde(default)]
    pub vlanid: Vec<u16>,
    #[serde(default)]
    pub vlanid_op: Option<String>,
    #[serde(default)]
    pub src_ip: Vec<String>,
    #[serde(default)]
    pub src_ip_op: Option<String>,
    #[serde(default)]
    pub dst_ip: Vec<String>,
    #[serde(default)]
    pub dst_ip_op: Option<String>,
    #[serde(default)]
    pub src_port: Vec<String>,
    #[serde(default)]
    pub src_port_op: Option<String>,
    #[serde(default)]
    pub dst_port: Vec<String>,
    #[serde(default)]
    pub dst_port_op: Option<String>,
    #[serde(default)]
    pub proto: Vec<u8>,
    #[serde(default)]
    pub proto_op: Option<String>,
    #[serde(default)]
    pub pktcnt: Option<u64>,
    #[serde(default)]
    pub pktcnt_op: Option<String>,
    #[serde(default)]
    pub appnames: Vec<String>,
    #[serde(default)]
    pub appname_op: Option<String>,
    #[serde(default)]
    pub apptags: Vec<String>,
    #[serde(default)]
    pub apptag_op: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
}

fn set_op(op: &Option<String>) -> SetOp {
    match op.as_deref() {
        Some("out") => SetOp::Out,
        _ => SetOp::In,
    }
}

fn set_pred<T: Clone>(values: &[T], op: &Option<String>) -> Option<SetPredicate<T>> {
    if values.is_empty() {
        return None;
    }
    Some(SetPredicate {
        op: set_op(op),
        values: values.to_vec(),
    })
}

/// "1000-2000" is a range; a bare number matches exactly.
fn parse_port(s: &str) -> Option<PortRange> {
    match s.split_once('-') {
        Some((lo, hi)) => Some(PortRange {
            port_min: lo.trim().parse().ok()?,
            port_max: hi.trim().parse().ok()?,
        }),
        None => Some(PortRange {
            port_min: s.trim().parse().ok()?,
            port_max: 0,
        }),
    }
}

fn port_pred(values: &[String], op: &Option<String>) -> Option<(SetOp, Vec<PortRange>)> {
    if values.is_empty() {
        return None;
    }
    let ranges: Vec<PortRange> = values.iter().filter_map(|s| parse_port(s)).collect();
    if ranges.is_empty() {
        return None;
    }
    Some((set_op(op), ranges))
}

fn math_op(op: &Option<String>) -> MathOp {
    match op.as_deref() {
        Some("lt") => MathOp::Lt,
        Some("leq") => MathOp::Leq,
        Some("geq") => MathOp::Geq,
        Some("eq") => MathOp::Eq,
        Some("neq") => MathOp::Neq,
        _ => MathOp::Gt,
    }
}

impl FilterRuleConfig {
    pub fn to_rule(&self) -> FilterRule {
        FilterRule {
            name: self.name.clone(),
            index: self.index,
            smac: set_pred(&self.smac, &self.smac_op),
            dmac: set_pred(&self.dmac, &self.dmac_op),
            vlan_id: set_pred(&self.vlanid, &self.vlanid_op),
            src_ip: set_pred(&self.src_ip, &self.src_ip_op),
            dst_ip: set_pred(&self.dst_ip, &self.dst_ip_op),
            src_port: port_pred(&self.src_port, &self.src_port_op),
            dst_port: port_pred(&self.dst_port, &self.dst_port_op),
            proto: set_pred(&self.proto, &self.proto_op),
            pktcnt: self.pktcnt.map(|n| (math_op(&self.pktcnt_op), n)),
            app_names: set_pred(&self.appnames, &self.appname_op),
            app_tags: set_pred(&self.apptags, &self.apptag_op),
            action: match self.action.as_deref() {
                Some("exclude") => Action::Exclude,
                Some("default_include") | Some("default-include") => Action::DefaultInclude,
                _ => Action::Include,
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub module: String,
    pub key: String,
    pub value: String,
}

/// Observation-point identifiers from the AWLAN_Node mqtt headers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwlanNode {
    #[serde(default)]
    pub mqtt_headers: BTreeMap<String, String>,
}

impl AwlanNode {
    pub fn node_id(&self) -> Option<&str> {
        self.mqtt_headers.get("nodeId").map(|s| s.as_str())
    }

    pub fn location_id(&self) -> Option<&str> {
        self.mqtt_headers.get("locationId").map(|s| s.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionManagerUplink {
    pub if_name: String,
    #[serde(default)]
    pub if_type: String,
    #[serde(default)]
    pub is_used: bool,
}

impl ConnectionManagerUplink {
    pub fn uplink_type(&self) -> UplinkType {
        match self.if_type.as_str() {
            "eth" => UplinkType::Eth,
            "lte" => UplinkType::Lte,
            _ => UplinkType::Unknown,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowServiceManagerConfig {
    pub handler: String,
    #[serde(default)]
    pub other_config: BTreeMap<String, String>,
}

impl FlowServiceManagerConfig {
    pub fn gatekeeper_url(&self) -> Option<&str> {
        if self.handler != "gatekeeper" {
            return None;
        }
        self.other_config.get("gk_url").map(|s| s.as_str())
    }
}

/// Gatekeeper mTLS material.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ssl {
    #[serde(default)]
    pub certificate: String,
    #[serde(default)]
    pub private_key: String,
    #[serde(default)]
    pub ca_cert: String,
}

/// Per-MAC tag update from the OpenFlow tag table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenFlowTag {
    pub mac: String,
    #[serde(default)]
    pub tags: Vec<String>,
}
