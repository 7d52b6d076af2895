//! Gatekeeper policy cache: per-device categorization verdicts for URLs,
//! hostnames, IP addresses and applications, with a persistence engine
//! that survives reboots and a bulk request/reply contract toward the
//! gatekeeper service. The HTTP transport itself is an external
//! collaborator behind [`client::GatekeeperTransport`].

pub mod cache;
pub mod client;
pub mod persist;

pub use cache::{
    Attribute, CacheEntry, DeviceCache, GkAction, GkCache, HostnameOrigin, RedirectInfo, Verdict,
};
pub use client::{BulkReply, BulkRequest, GatekeeperClient, GatekeeperTransport};
pub use persist::{DirStore, PersistentStore, GK_STORE_KEY, GK_STORE_NAME};
