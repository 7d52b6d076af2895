//! Flow traps. A trap is a pre-registered expectation that a future flow
//! matching certain five-tuple fields should trigger code when its stream is
//! created. Any field may be wildcard; matches are scored so the most
//! specific trap wins.

use crate::rts::ipaddr::IpAddrKey;
use crate::rts::lruhash::{EntryId, LruHash};
use crate::rts::pool::BlockId;

pub const DADDR_WEIGHT: u8 = 16;
pub const DPORT_WEIGHT: u8 = 8;
pub const SPORT_WEIGHT: u8 = 4;
pub const PROTO_WEIGHT: u8 = 2;
pub const SADDR_WEIGHT: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FtEntry {
    pub saddr: IpAddrKey,
    pub daddr: IpAddrKey,
    pub sport: u16,
    pub dport: u16,
    pub proto: u16,
    /// bytecode offset to run when the trap fires
    pub pc: u32,
}

impl FtEntry {
    /// Score against a concrete five-tuple. A present field that does not
    /// match disqualifies the trap; wildcards contribute nothing.
    pub fn score(
        &self,
        proto: u16,
        saddr: &IpAddrKey,
        sport: u16,
        daddr: &IpAddrKey,
        dport: u16,
    ) -> u8 {
        let mut score = 0;
        if self.proto != 0 {
            if self.proto != proto {
                return 0;
            }
            score += PROTO_WEIGHT;
        }
        if self.dport != 0 {
            if self.dport != dport {
                return 0;
            }
            score += DPORT_WEIGHT;
        }
        if self.sport != 0 {
            if self.sport != sport {
                return 0;
            }
            score += SPORT_WEIGHT;
        }
        if !self.daddr.is_unspec() {
            if self.daddr != *daddr {
                return 0;
            }
            score += DADDR_WEIGHT;
        }
        if !self.saddr.is_unspec() {
            if self.saddr != *saddr {
                return 0;
            }
            score += SADDR_WEIGHT;
        }
        score
    }

    /// Hash seed: the most specific present field, matching the lookup
    /// bucket sequence in [`ft_find`].
    pub fn hashval(&self) -> u32 {
        if !self.daddr.is_unspec() {
            self.daddr.low32()
        } else if self.dport != 0 {
            self.dport as u32
        } else if self.sport != 0 {
            self.sport as u32
        } else {
            self.saddr.low32()
        }
    }
}

/// Table record: the trap plus its pool charge, so trap memory counts
/// against the handle arena and exhaustion drops the save.
#[derive(Debug, Clone, Copy)]
pub struct TrapRec {
    pub entry: FtEntry,
    pub mem: Option<BlockId>,
}

pub type FlowTable = LruHash<TrapRec>;

fn best_in_bucket(
    ft: &FlowTable,
    hashval: u32,
    proto: u16,
    saddr: &IpAddrKey,
    sport: u16,
    daddr: &IpAddrKey,
    dport: u16,
    now: u64,
) -> Option<EntryId> {
    let mut best: Option<(EntryId, u8)> = None;
    ft.scan_bucket(hashval, now, |id, rec| {
        let s = rec.entry.score(proto, saddr, sport, daddr, dport);
        if s > best.map_or(0, |(_, b)| b) {
            best = Some((id, s));
        }
    });
    best.map(|(id, _)| id)
}

/// Scored wildcard lookup. Buckets are probed from the most specific hash
/// seed down; the first bucket holding any qualifying trap decides.
pub fn ft_find(
    ft: &FlowTable,
    proto: u16,
    saddr: &IpAddrKey,
    sport: u16,
    daddr: &IpAddrKey,
    dport: u16,
    now: u64,
) -> Option<EntryId> {
    for hashval in [
        daddr.low32(),
        dport as u32,
        sport as u32,
        saddr.low32(),
    ] {
        if let Some(id) =
            best_in_bucket(ft, hashval, proto, saddr, sport, daddr, dport, now)
        {
            return Some(id);
        }
    }
    None
}

pub fn ft_save(ft: &mut FlowTable, rec: TrapRec, ttl_ms: u32, now: u64) -> EntryId {
    let hashval = rec.entry.hashval();
    ft.insert(rec, hashval, ttl_ms, now)
}
