//! In-memory attribute cache. A device (keyed by MAC) carries up to five
//! attribute subtrees; hostname entries remember which request kind added
//! them since FQDN, HTTP Host and HTTPS SNI verdicts are reported apart.

use std::collections::BTreeMap;

use tracing::debug;

use crate::aggregator::MacAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum GkAction {
    #[default]
    Unspecified = 0,
    Accept = 1,
    Block = 2,
    Redirect = 3,
    RedirectAllow = 4,
    NoAnswer = 5,
}

impl GkAction {
    pub fn from_u8(v: u8) -> GkAction {
        match v {
            1 => GkAction::Accept,
            2 => GkAction::Block,
            3 => GkAction::Redirect,
            4 => GkAction::RedirectAllow,
            5 => GkAction::NoAnswer,
            _ => GkAction::Unspecified,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum HostnameOrigin {
    Fqdn = 0,
    HttpHost = 1,
    HttpsSni = 2,
}

/// Redirect target attached to FQDN verdicts.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RedirectInfo {
    pub redirect_ipv4: Option<[u8; 4]>,
    pub redirect_ipv6: Option<[u8; 16]>,
    pub redirect_cname: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribute {
    Url(String),
    Hostname(HostnameOrigin, String),
    Ipv4(u32),
    Ipv6([u8; 16]),
    App(String),
}

/// One cached verdict, the unit of the cache's public add API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub device_mac: MacAddr,
    pub attribute: Attribute,
    pub action: GkAction,
    pub ttl: u64,
    pub policy: String,
    pub category_id: u32,
    pub confidence: u32,
    pub flow_marker: u32,
    pub network_id: String,
    pub redirect: Option<RedirectInfo>,
}

/// Verdict fields common to every attribute kind.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Verdict {
    pub action: GkAction,
    pub ttl: u64,
    pub policy: String,
    pub category_id: u32,
    pub confidence: u32,
    pub flow_marker: u32,
    pub network_id: String,
    pub redirect: Option<RedirectInfo>,
}

#[derive(Debug, Default)]
pub struct DeviceCache {
    pub mac: MacAddr,
    pub url_tree: BTreeMap<String, Verdict>,
    pub hostname_tree: BTreeMap<(HostnameOrigin, String), Verdict>,
    pub ipv4_tree: BTreeMap<u32, Verdict>,
    pub ipv6_tree: BTreeMap<[u8; 16], Verdict>,
    pub app_tree: BTreeMap<String, Verdict>,
}

impl DeviceCache {
    pub fn entry_count(&self) -> usize {
        self.url_tree.len()
            + self.hostname_tree.len()
            + self.ipv4_tree.len()
            + self.ipv6_tree.len()
            + self.app_tree.len()
    }
}

#[derive(Debug, Default)]
pub struct GkCache {
    devices: BTreeMap<MacAddr, DeviceCache>,
}

impl GkCache {
    pub fn new() -> Self {
        GkCache::default()
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn entry_count(&self) -> usize {
        self.devices.values().map(|d| d.entry_count()).sum()
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceCache> {
        self.devices.values()
    }

    pub fn device(&self, mac: &MacAddr) -> Option<&DeviceCache> {
        self.devices.get(mac)
    }

    /// Inserts or refreshes one verdict; the public add API used by both
    /// the reply handler and the restore path.
    pub fn add_entry(&mut self, entry: CacheEntry) {
        let device = self
            .devices
            .entry(entry.device_mac)
            .or_insert_with(|| DeviceCache {
                mac: entry.device_mac,
                ..Default::default()
            });
        let verdict = Verdict {
            action: entry.action,
            ttl: entry.ttl,
            policy: entry.policy,
            category_id: entry.category_id,
            confidence: entry.confidence,
            flow_marker: entry.flow_marker,
            network_id: entry.network_id,
            redirect: entry.redirect,
        };
        match entry.attribute {
            Attribute::Url(url) => {
                device.url_tree.insert(url, verdict);
            }
            Attribute::Hostname(origin, name) => {
                device.hostname_tree.insert((origin, name), verdict);
            }
            Attribute::Ipv4(addr) => {
                device.ipv4_tree.insert(addr, verdict);
            }
            Attribute::Ipv6(addr) => {
                device.ipv6_tree.insert(addr, verdict);
            }
            Attribute::App(app) => {
                device.app_tree.insert(app, verdict);
            }
        }
    }

    pub fn lookup(&self, mac: &MacAddr, attribute: &Attribute) -> Option<&Verdict> {
        let device = self.devices.get(mac)?;
        match attribute {
            Attribute::Url(url) => device.url_tree.get(url),
            Attribute::Hostname(origin, name) => {
                device.hostname_tree.get(&(*origin, name.clone()))
            }
            Attribute::Ipv4(addr) => device.ipv4_tree.get(addr),
            Attribute::Ipv6(addr) => device.ipv6_tree.get(addr),
            Attribute::App(app) => device.app_tree.get(app),
        }
    }

    pub fn remove_device(&mut self, mac: &MacAddr) {
        self.devices.remove(mac);
    }

    pub fn clear(&mut self) {
        let n = self.entry_count();
        if n > 0 {
            debug!(target: "gatekeeper", entries = n, "cache cleared");
        }
        self.devices.clear();
    }
}
