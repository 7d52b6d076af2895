//! Data-report tag registry. OpenFlow-Tag configuration updates populate a
//! per-MAC tag set; the tagger resolves both MACs of every accumulator
//! being reported and attaches the matching records up front, so the
//! serialization path never allocates mid-encode.

use std::collections::BTreeMap;

use smallvec::SmallVec;

use super::{Accumulator, DataReportTags, MacAddr};

#[derive(Debug, Default)]
pub struct TagRegistry {
    by_mac: BTreeMap<MacAddr, Vec<String>>,
}

impl TagRegistry {
    pub fn new() -> Self {
        TagRegistry::default()
    }

    /// Replaces the tag set for a MAC; an empty set removes the entry.
    pub fn update(&mut self, mac: MacAddr, tags: Vec<String>) {
        if tags.is_empty() {
            self.by_mac.remove(&mac);
        } else {
            self.by_mac.insert(mac, tags);
        }
    }

    pub fn remove(&mut self, mac: &MacAddr) {
        self.by_mac.remove(mac);
    }

    pub fn lookup(&self, mac: &MacAddr) -> Option<&[String]> {
        self.by_mac.get(mac).map(|v| v.as_slice())
    }

    pub fn len(&self) -> usize {
        self.by_mac.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_mac.is_empty()
    }

    /// The report tagger: prepares data-report tag records for both MACs
    /// of the accumulator. Wired into the aggregator's per-accumulator
    /// report hook.
    pub fn tag_accumulator(&self, acc: &mut Accumulator) {
        let mut out: SmallVec<[DataReportTags; 2]> = SmallVec::new();
        for mac in [&acc.key.smac, &acc.key.dmac] {
            if mac.is_zero() {
                continue;
            }
            if let Some(tags) = self.lookup(mac) {
                if !tags.is_empty() {
                    out.push(DataReportTags {
                        id: mac.to_string(),
                        features: tags.to_vec(),
                    });
                }
            }
        }
        acc.data_report_tags = out;
    }
}
