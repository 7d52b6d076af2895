//! Bulk request/reply contract toward the gatekeeper service. The client
//! batches attribute lookups per device, hands them to a pluggable
//! transport (the HTTP/2 pipeline is an external collaborator), and folds
//! replies into the cache. Connect and total timeouts are 2 seconds each
//! at the transport.

use tracing::{debug, warn};

use crate::aggregator::MacAddr;
use crate::config::Ssl;
use crate::error::{FlowError, Result};
use crate::gatekeeper::cache::{Attribute, CacheEntry, GkCache, Verdict};

pub const GK_CONNECT_TIMEOUT_SECS: u64 = 2;
pub const GK_TOTAL_TIMEOUT_SECS: u64 = 2;

/// One batched lookup request: attributes to categorize per device.
#[derive(Debug, Clone, Default)]
pub struct BulkRequest {
    pub entries: Vec<(MacAddr, Attribute)>,
}

impl BulkRequest {
    pub fn new() -> Self {
        BulkRequest::default()
    }

    pub fn add(&mut self, mac: MacAddr, attribute: Attribute) {
        self.entries.push((mac, attribute));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Per-entry reply: the attribute echoed with its verdict.
#[derive(Debug, Clone, Default)]
pub struct BulkReply {
    pub entries: Vec<(MacAddr, Attribute, Verdict)>,
}

/// The request/reply wire contract. Implementations own connection
/// management, mTLS material and timeouts.
pub trait GatekeeperTransport: Send {
    fn bulk_lookup(&mut self, url: &str, request: &BulkRequest) -> Result<BulkReply>;
}

/// Server coordinates plus transport; folds verdicts into the cache.
pub struct GatekeeperClient {
    url: Option<String>,
    ssl: Option<Ssl>,
    transport: Box<dyn GatekeeperTransport>,
}

impl GatekeeperClient {
    pub fn new(transport: Box<dyn GatekeeperTransport>) -> Self {
        GatekeeperClient {
            url: None,
            ssl: None,
            transport,
        }
    }

    pub fn set_url(&mut self, url: &str) {
        debug!(target: "gatekeeper", url, "server url configured");
        self.url = Some(url.to_string());
    }

    pub fn set_ssl(&mut self, ssl: Ssl) {
        self.ssl = Some(ssl);
    }

    /// mTLS material for the transport to pick up on reconnect.
    pub fn ssl(&self) -> Option<&Ssl> {
        self.ssl.as_ref()
    }

    pub fn ready(&self) -> bool {
        self.url.is_some()
    }

    /// Issues a bulk lookup and inserts every returned verdict into the
    /// cache. On transport failure the verdicts stay unknown and the
    /// caller decides the default.
    pub fn lookup(&mut self, request: &BulkRequest, cache: &mut GkCache) -> Result<usize> {
        let Some(url) = self.url.as_deref() else {
            return Err(FlowError::Transport("gatekeeper url not configured".into()));
        };
        if request.is_empty() {
            return Ok(0);
        }
        let reply = match self.transport.bulk_lookup(url, request) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(target: "gatekeeper", error = %e, "bulk lookup failed");
                return Err(e);
            }
        };
        let n = reply.entries.len();
        for (mac, attribute, verdict) in reply.entries {
            cache.add_entry(CacheEntry {
                device_mac: mac,
                attribute,
                action: verdict.action,
                ttl: verdict.ttl,
                policy: verdict.policy,
                category_id: verdict.category_id,
                confidence: verdict.confidence,
                flow_marker: verdict.flow_marker,
                network_id: verdict.network_id,
                redirect: verdict.redirect,
            });
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatekeeper::cache::GkAction;

    struct EchoTransport {
        action: GkAction,
        fail: bool,
    }

    impl GatekeeperTransport for EchoTransport {
        fn bulk_lookup(&mut self, _url: &str, request: &BulkRequest) -> Result<BulkReply> {
            if self.fail {
                return Err(FlowError::Transport("connection refused".into()));
            }
            Ok(BulkReply {
                entries: request
                    .entries
                    .iter()
                    .map(|(mac, attr)| {
                        (
                            *mac,
                            attr.clone(),
                            Verdict {
                                action: self.action,
                                ttl: 300,
                                ..Default::default()
                            },
                        )
                    })
                    .collect(),
            })
        }
    }

    #[test]
    fn verdicts_land_in_cache() {
        let mut client = GatekeeperClient::new(Box::new(EchoTransport {
            action: GkAction::Accept,
            fail: false,
        }));
        client.set_url("https://gk.example");

        let mac: MacAddr = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        let mut req = BulkRequest::new();
        req.add(mac, Attribute::App("game".into()));

        let mut cache = GkCache::new();
        assert_eq!(client.lookup(&req, &mut cache).unwrap(), 1);
        let v = cache.lookup(&mac, &Attribute::App("game".into())).unwrap();
        assert_eq!(v.action, GkAction::Accept);
    }

    #[test]
    fn transport_failure_leaves_cache_untouched() {
        let mut client = GatekeeperClient::new(Box::new(EchoTransport {
            action: GkAction::Accept,
            fail: true,
        }));
        client.set_url("https://gk.example");
        let mut req = BulkRequest::new();
        req.add(
            "aa:bb:cc:dd:ee:ff".parse().unwrap(),
            Attribute::App("x".into()),
        );
        let mut cache = GkCache::new();
        assert!(client.lookup(&req, &mut cache).is_err());
        assert_eq!(cache.entry_count(), 0);
    }

    #[test]
    fn unconfigured_url_is_a_transport_error() {
        let mut client = GatekeeperClient::new(Box::new(EchoTransport {
            action: GkAction::Accept,
            fail: false,
        }));
        let mut cache = GkCache::new();
        assert!(matches!(
            client.lookup(&BulkRequest::new(), &mut cache),
            Err(FlowError::Transport(_))
        ));
    }
}
