//! Cache persistence. The cache serializes into a bulk-reply wire record:
//! per-kind entry arrays, each entry carrying the common verdict header
//! and its attribute value. The image is wrapped in a checksummed file
//! header and stored under a fixed persistent-store key, so a device
//! reboot restores its verdicts without a round-trip to the service.
//!
//! Serialization walks devices in MAC order and attributes in tree order,
//! so serializing the same cache twice yields identical bytes.

use std::fs;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::error::{FlowError, Result};
use crate::gatekeeper::cache::{
    Attribute, CacheEntry, GkAction, GkCache, HostnameOrigin, RedirectInfo, Verdict,
};
use crate::report::{write_string, write_u32, write_u64, Cursor};

pub const GK_STORE_NAME: &str = "gatekeeper_cache";
pub const GK_STORE_KEY: &str = "cache_data";

const GK_MAGIC: [u8; 4] = *b"FGKC";
const GK_FORMAT_VERSION: u16 = 1;
const FILE_HEADER_LEN: usize = 12;

/// Entry kind tags on the wire, in array order.
const KIND_URL: u8 = 0;
const KIND_FQDN: u8 = 1;
const KIND_HOST: u8 = 2;
const KIND_SNI: u8 = 3;
const KIND_IPV4: u8 = 4;
const KIND_IPV6: u8 = 5;
const KIND_APP: u8 = 6;
const NUM_KINDS: usize = 7;

/// Persistent-store surface: named stores with keyed blobs.
pub trait PersistentStore {
    fn erase(&mut self, store: &str) -> Result<()>;
    fn write(&mut self, store: &str, key: &str, data: &[u8]) -> Result<()>;
    fn read(&self, store: &str, key: &str) -> Result<Option<Bytes>>;
}

/// Directory-backed store: one file per key under `<root>/<store>/`.
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        DirStore {
            root: root.as_ref().to_path_buf(),
        }
    }
}

impl PersistentStore for DirStore {
    fn erase(&mut self, store: &str) -> Result<()> {
        let dir = self.root.join(store);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    fn write(&mut self, store: &str, key: &str, data: &[u8]) -> Result<()> {
        let dir = self.root.join(store);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(key), data)?;
        Ok(())
    }

    fn read(&self, store: &str, key: &str) -> Result<Option<Bytes>> {
        let path = self.root.join(store).join(key);
        match fs::read(&path) {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn write_header_fields(buf: &mut Vec<u8>, mac: &str, v: &Verdict) {
    buf.push(v.action as u8);
    write_u64(buf, v.ttl);
    write_string(buf, &v.policy);
    write_u32(buf, v.category_id);
    write_u32(buf, v.confidence);
    write_u32(buf, v.flow_marker);
    write_string(buf, &v.network_id);
    write_string(buf, mac);
}

fn write_redirect(buf: &mut Vec<u8>, redirect: &Option<RedirectInfo>) {
    match redirect {
        None => buf.push(0),
        Some(r) => {
            buf.push(1);
            match r.redirect_ipv4 {
                Some(v4) => {
                    buf.push(1);
                    buf.extend_from_slice(&v4);
                }
                None => buf.push(0),
            }
            match r.redirect_ipv6 {
                Some(v6) => {
                    buf.push(1);
                    buf.extend_from_slice(&v6);
                }
                None => buf.push(0),
            }
            match &r.redirect_cname {
                Some(cname) => {
                    buf.push(1);
                    write_string(buf, cname);
                }
                None => buf.push(0),
            }
        }
    }
}

/// One entry: {u32 length, u8 kind, header, value}. The length prefix
/// lets the restore side skip entry kinds it does not understand.
fn write_entry(out: &mut Vec<u8>, kind: u8, mac: &str, v: &Verdict, value: impl FnOnce(&mut Vec<u8>)) {
    let mut body = Vec::new();
    body.push(kind);
    write_header_fields(&mut body, mac, v);
    value(&mut body);
    write_u32(out, body.len() as u32);
    out.extend_from_slice(&body);
}

/// Counts entries by kind; index order matches the wire array order.
fn count_entries(cache: &GkCache) -> [u32; NUM_KINDS] {
    let mut counts = [0u32; NUM_KINDS];
    for device in cache.devices() {
        counts[KIND_URL as usize] += device.url_tree.len() as u32;
        for (origin, _) in device.hostname_tree.keys() {
            match origin {
                HostnameOrigin::Fqdn => counts[KIND_FQDN as usize] += 1,
                HostnameOrigin::HttpHost => counts[KIND_HOST as usize] += 1,
                HostnameOrigin::HttpsSni => counts[KIND_SNI as usize] += 1,
            }
        }
        counts[KIND_IPV4 as usize] += device.ipv4_tree.len() as u32;
        counts[KIND_IPV6 as usize] += device.ipv6_tree.len() as u32;
        counts[KIND_APP as usize] += device.app_tree.len() as u32;
    }
    counts
}

/// Serializes the cache into the packed bulk-reply record, wrapped in the
/// checksummed file header. Idempotent for identical cache contents.
pub fn serialize_cache(cache: &GkCache) -> Bytes {
    let counts = count_entries(cache);

    let mut body = Vec::new();
    for count in counts {
        write_u32(&mut body, count);
    }

    // URL entries across all devices, then the hostname splits, then the
    // address and app kinds, devices in MAC order within each kind.
    for device in cache.devices() {
        let mac = device.mac.to_string();
        for (url, v) in &device.url_tree {
            write_entry(&mut body, KIND_URL, &mac, v, |b| write_string(b, url));
        }
    }
    for target in [
        (HostnameOrigin::Fqdn, KIND_FQDN),
        (HostnameOrigin::HttpHost, KIND_HOST),
        (HostnameOrigin::HttpsSni, KIND_SNI),
    ] {
        for device in cache.devices() {
            let mac = device.mac.to_string();
            for ((origin, name), v) in &device.hostname_tree {
                if *origin != target.0 {
                    continue;
                }
                write_entry(&mut body, target.1, &mac, v, |b| {
                    write_string(b, name);
                    if target.0 == HostnameOrigin::Fqdn {
                        write_redirect(b, &v.redirect);
                    }
                });
            }
        }
    }
    for device in cache.devices() {
        let mac = device.mac.to_string();
        for (addr, v) in &device.ipv4_tree {
            write_entry(&mut body, KIND_IPV4, &mac, v, |b| write_u32(b, *addr));
        }
    }
    for device in cache.devices() {
        let mac = device.mac.to_string();
        for (addr, v) in &device.ipv6_tree {
            write_entry(&mut body, KIND_IPV6, &mac, v, |b| {
                write_u32(b, 16);
                b.extend_from_slice(addr);
            });
        }
    }
    for device in cache.devices() {
        let mac = device.mac.to_string();
        for (app, v) in &device.app_tree {
            write_entry(&mut body, KIND_APP, &mac, v, |b| write_string(b, app));
        }
    }

    let mut out = Vec::with_capacity(FILE_HEADER_LEN + body.len());
    out.extend_from_slice(&GK_MAGIC);
    out.extend_from_slice(&GK_FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&[0u8; 2]);
    out.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    out.extend_from_slice(&body);
    Bytes::from(out)
}

/// Writes the serialized image to the persistent store. A failure is a
/// logged warning; the in-memory cache stays authoritative.
pub fn persist(store: &mut dyn PersistentStore, image: &[u8]) {
    if let Err(e) = store.erase(GK_STORE_NAME) {
        warn!(target: "gatekeeper", error = %e, "failed to erase cache store");
        return;
    }
    if let Err(e) = store.write(GK_STORE_NAME, GK_STORE_KEY, image) {
        warn!(target: "gatekeeper", error = %e, "failed to persist cache");
        return;
    }
    debug!(target: "gatekeeper", bytes = image.len(), "cache persisted");
}

/// Restore outcome; entries fail in isolation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RestoreCounts {
    pub added: u32,
    pub failed: u32,
}

fn read_verdict(c: &mut Cursor<'_>) -> Result<(String, Verdict)> {
    let action = GkAction::from_u8(c.u8()?);
    let ttl = c.u64()?;
    let policy = c.string()?;
    let category_id = c.u32()?;
    let confidence = c.u32()?;
    let flow_marker = c.u32()?;
    let network_id = c.string()?;
    let mac = c.string()?;
    Ok((
        mac,
        Verdict {
            action,
            ttl,
            policy,
            category_id,
            confidence,
            flow_marker,
            network_id,
            redirect: None,
        },
    ))
}

fn read_redirect(c: &mut Cursor<'_>) -> Result<Option<RedirectInfo>> {
    if c.u8()? == 0 {
        return Ok(None);
    }
    let mut r = RedirectInfo::default();
    if c.u8()? != 0 {
        let b = c.take(4)?;
        r.redirect_ipv4 = Some([b[0], b[1], b[2], b[3]]);
    }
    if c.u8()? != 0 {
        let mut v6 = [0u8; 16];
        v6.copy_from_slice(c.take(16)?);
        r.redirect_ipv6 = Some(v6);
    }
    if c.u8()? != 0 {
        r.redirect_cname = Some(c.string()?);
    }
    Ok(Some(r))
}

fn entry_from_wire(kind: u8, c: &mut Cursor<'_>) -> Result<CacheEntry> {
    let (mac_str, mut verdict) = read_verdict(c)?;
    let device_mac = mac_str
        .parse()
        .map_err(|_| FlowError::Corruption("bad device mac"))?;

    let attribute = match kind {
        KIND_URL => Attribute::Url(c.string()?),
        KIND_FQDN => {
            let name = c.string()?;
            verdict.redirect = read_redirect(c)?;
            Attribute::Hostname(HostnameOrigin::Fqdn, name)
        }
        KIND_HOST => Attribute::Hostname(HostnameOrigin::HttpHost, c.string()?),
        KIND_SNI => Attribute::Hostname(HostnameOrigin::HttpsSni, c.string()?),
        KIND_IPV4 => Attribute::Ipv4(c.u32()?),
        KIND_IPV6 => {
            let len = c.u32()?;
            if len != 16 {
                return Err(FlowError::Corruption("bad ipv6 length"));
            }
            let mut addr = [0u8; 16];
            addr.copy_from_slice(c.take(16)?);
            Attribute::Ipv6(addr)
        }
        KIND_APP => Attribute::App(c.string()?),
        _ => return Err(FlowError::Corruption("unknown entry kind")),
    };

    Ok(CacheEntry {
        device_mac,
        attribute,
        action: verdict.action,
        ttl: verdict.ttl,
        policy: verdict.policy,
        category_id: verdict.category_id,
        confidence: verdict.confidence,
        flow_marker: verdict.flow_marker,
        network_id: verdict.network_id,
        redirect: verdict.redirect,
    })
}

/// Decodes a persisted image back into the cache through its public add
/// API. Unknown entry kinds, invalid addresses and MAC parse failures are
/// logged and skipped; everything decodable lands.
pub fn restore_image(cache: &mut GkCache, image: &[u8]) -> Result<RestoreCounts> {
    if image.len() < FILE_HEADER_LEN {
        return Err(FlowError::Corruption("cache image truncated"));
    }
    if image[0..4] != GK_MAGIC {
        return Err(FlowError::Corruption("cache image magic mismatch"));
    }
    let version = u16::from_le_bytes([image[4], image[5]]);
    if version != GK_FORMAT_VERSION {
        return Err(FlowError::Corruption("cache image version mismatch"));
    }
    let stored_crc = u32::from_le_bytes([image[8], image[9], image[10], image[11]]);
    let body = &image[FILE_HEADER_LEN..];
    if crc32fast::hash(body) != stored_crc {
        return Err(FlowError::Corruption("cache image crc mismatch"));
    }

    let mut c = Cursor::new(body);
    let mut total = 0u64;
    for _ in 0..NUM_KINDS {
        total += c.u32()? as u64;
    }

    let mut counts = RestoreCounts::default();
    for _ in 0..total {
        let entry_len = c.u32()? as usize;
        let entry_bytes = c.take(entry_len)?;
        let mut ec = Cursor::new(entry_bytes);
        let kind = ec.u8()?;
        match entry_from_wire(kind, &mut ec) {
            Ok(entry) => {
                cache.add_entry(entry);
                counts.added += 1;
            }
            Err(e) => {
                debug!(target: "gatekeeper", kind, error = %e, "skipping cache entry");
                counts.failed += 1;
            }
        }
    }

    debug!(
        target: "gatekeeper",
        added = counts.added,
        failed = counts.failed,
        "cache restore complete"
    );
    Ok(counts)
}

/// Reads the store slot and repopulates the cache. A missing or corrupt
/// image leaves the cache empty with a warning; the service refills it.
pub fn restore(cache: &mut GkCache, store: &dyn PersistentStore) -> RestoreCounts {
    let image = match store.read(GK_STORE_NAME, GK_STORE_KEY) {
        Ok(Some(image)) => image,
        Ok(None) => return RestoreCounts::default(),
        Err(e) => {
            warn!(target: "gatekeeper", error = %e, "failed to read cache store");
            return RestoreCounts::default();
        }
    };
    match restore_image(cache, &image) {
        Ok(counts) => counts,
        Err(e) => {
            warn!(target: "gatekeeper", error = %e, "cache image rejected");
            RestoreCounts::default()
        }
    }
}
