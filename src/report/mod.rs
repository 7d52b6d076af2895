//! Length-delimited wire encoders for emitted reports. Every record is a
//! u32 length prefix followed by the payload; integers are little-endian
//! and strings are u32-length-prefixed UTF-8. Reports ride an emitter
//! trait; the MQTT transport itself is an external collaborator and the
//! default emitter only logs.

pub mod intf;

use bytes::Bytes;
use tracing::debug;

use crate::aggregator::{
    DataReportTags, FlowCounters, FlowKey, FlowReport, FlowStats, FlowTags, MacAddr,
    ObservationPoint, Uplink, UplinkType, VendorData, VendorKvPair, VendorValue, Window,
};
use crate::error::{FlowError, Result};

pub(crate) fn write_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

pub(crate) fn write_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub(crate) fn write_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub(crate) fn write_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub(crate) struct Cursor<'a> {
    buf: &'a [u8],
    off: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, off: 0 }
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.off + n > self.buf.len() {
            return Err(FlowError::Corruption("record truncated"));
        }
        let s = &self.buf[self.off..self.off + n];
        self.off += n;
        Ok(s)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| FlowError::Corruption("string field not UTF-8"))
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.off
    }
}

fn write_observation_point(buf: &mut Vec<u8>, op: &ObservationPoint) {
    write_string(buf, &op.node_id);
    write_string(buf, &op.location_id);
}

fn read_observation_point(c: &mut Cursor<'_>) -> Result<ObservationPoint> {
    Ok(ObservationPoint {
        node_id: c.string()?,
        location_id: c.string()?,
    })
}

fn write_flow_key(buf: &mut Vec<u8>, key: &FlowKey) {
    buf.extend_from_slice(&key.smac.0);
    buf.extend_from_slice(&key.dmac.0);
    write_u16(buf, key.vlan_id);
    write_u16(buf, key.ethertype);
    buf.push(key.ip_version);
    buf.extend_from_slice(&key.saddr);
    buf.extend_from_slice(&key.daddr);
    buf.push(key.protocol);
    write_u16(buf, key.sport);
    write_u16(buf, key.dport);
}

fn read_flow_key(c: &mut Cursor<'_>) -> Result<FlowKey> {
    let mut key = FlowKey::default();
    let smac = c.take(6)?;
    key.smac = MacAddr([smac[0], smac[1], smac[2], smac[3], smac[4], smac[5]]);
    let dmac = c.take(6)?;
    key.dmac = MacAddr([dmac[0], dmac[1], dmac[2], dmac[3], dmac[4], dmac[5]]);
    key.vlan_id = c.u16()?;
    key.ethertype = c.u16()?;
    key.ip_version = c.u8()?;
    key.saddr.copy_from_slice(c.take(16)?);
    key.daddr.copy_from_slice(c.take(16)?);
    key.protocol = c.u8()?;
    key.sport = c.u16()?;
    key.dport = c.u16()?;
    Ok(key)
}

fn write_counters(buf: &mut Vec<u8>, counters: &FlowCounters) {
    write_u64(buf, counters.packets_count);
    write_u64(buf, counters.bytes_count);
    write_u64(buf, counters.payload_bytes_count);
}

fn read_counters(c: &mut Cursor<'_>) -> Result<FlowCounters> {
    Ok(FlowCounters {
        packets_count: c.u64()?,
        bytes_count: c.u64()?,
        payload_bytes_count: c.u64()?,
    })
}

fn write_flow_tags(buf: &mut Vec<u8>, tags: &FlowTags) {
    write_string(buf, &tags.vendor);
    write_string(buf, &tags.app_name);
    write_u32(buf, tags.tags.len() as u32);
    for t in &tags.tags {
        write_string(buf, t);
    }
}

fn write_vendor_data(buf: &mut Vec<u8>, vd: &VendorData) {
    write_string(buf, &vd.vendor);
    write_u32(buf, vd.kv_pairs.len() as u32);
    for kv in &vd.kv_pairs {
        write_string(buf, &kv.key);
        match &kv.value {
            VendorValue::Str(s) => {
                buf.push(0);
                write_string(buf, s);
            }
            VendorValue::U32(v) => {
                buf.push(1);
                write_u32(buf, *v);
            }
            VendorValue::U64(v) => {
                buf.push(2);
                write_u64(buf, *v);
            }
        }
    }
}

fn write_data_report_tags(buf: &mut Vec<u8>, drt: &DataReportTags) {
    write_string(buf, &drt.id);
    write_u32(buf, drt.features.len() as u32);
    for f in &drt.features {
        write_string(buf, f);
    }
}

fn write_stats(buf: &mut Vec<u8>, stats: &FlowStats) {
    write_flow_key(buf, &stats.key);
    write_counters(buf, &stats.counters);
    write_u64(buf, stats.state.first_obs);
    write_u64(buf, stats.state.last_obs);
    buf.push(stats.state.fstart as u8);
    buf.push(stats.state.fend as u8);
    write_u32(buf, stats.tags.len() as u32);
    for t in &stats.tags {
        write_flow_tags(buf, t);
    }
    write_u32(buf, stats.vendor_data.len() as u32);
    for vd in &stats.vendor_data {
        write_vendor_data(buf, vd);
    }
    write_u32(buf, stats.data_report_tags.len() as u32);
    for drt in &stats.data_report_tags {
        write_data_report_tags(buf, drt);
    }
}

fn write_window(buf: &mut Vec<u8>, window: &Window) {
    write_u64(buf, window.started_at);
    write_u64(buf, window.ended_at);
    write_u64(buf, window.dropped_stats);
    match &window.uplink {
        Some(uplink) => {
            buf.push(1);
            write_string(buf, uplink.if_type.as_str());
            buf.push(uplink.changed as u8);
        }
        None => buf.push(0),
    }
    write_u32(buf, window.stats.len() as u32);
    for stats in &window.stats {
        write_stats(buf, stats);
    }
}

/// Serializes a flow report as one length-delimited record.
pub fn encode_flow_report(report: &FlowReport) -> Bytes {
    let mut body = Vec::new();
    write_u64(&mut body, report.reported_at);
    write_observation_point(&mut body, &report.observation_point);
    write_u32(&mut body, report.windows.len() as u32);
    for window in &report.windows {
        write_window(&mut body, window);
    }

    let mut out = Vec::with_capacity(body.len() + 4);
    write_u32(&mut out, body.len() as u32);
    out.extend_from_slice(&body);
    Bytes::from(out)
}

/// Window view decoded back from the wire; tags and vendor data are
/// skipped field-accurately but only counters are surfaced.
#[derive(Debug)]
pub struct DecodedStats {
    pub key: FlowKey,
    pub counters: FlowCounters,
}

#[derive(Debug)]
pub struct DecodedWindow {
    pub started_at: u64,
    pub ended_at: u64,
    pub dropped_stats: u64,
    pub uplink: Option<Uplink>,
    pub stats: Vec<DecodedStats>,
}

#[derive(Debug)]
pub struct DecodedFlowReport {
    pub reported_at: u64,
    pub observation_point: ObservationPoint,
    pub windows: Vec<DecodedWindow>,
}

fn skip_tags_and_vendor_data(c: &mut Cursor<'_>) -> Result<()> {
    let ntags = c.u32()?;
    for _ in 0..ntags {
        c.string()?;
        c.string()?;
        let n = c.u32()?;
        for _ in 0..n {
            c.string()?;
        }
    }
    let nvd = c.u32()?;
    for _ in 0..nvd {
        c.string()?;
        let n = c.u32()?;
        for _ in 0..n {
            c.string()?;
            match c.u8()? {
                0 => {
                    c.string()?;
                }
                1 => {
                    c.u32()?;
                }
                2 => {
                    c.u64()?;
                }
                _ => return Err(FlowError::Corruption("bad vendor value tag")),
            }
        }
    }
    let ndrt = c.u32()?;
    for _ in 0..ndrt {
        c.string()?;
        let n = c.u32()?;
        for _ in 0..n {
            c.string()?;
        }
    }
    Ok(())
}

pub fn decode_flow_report(bytes: &[u8]) -> Result<DecodedFlowReport> {
    let mut c = Cursor::new(bytes);
    let len = c.u32()? as usize;
    if len != c.remaining() {
        return Err(FlowError::Corruption("record length mismatch"));
    }
    let reported_at = c.u64()?;
    let observation_point = read_observation_point(&mut c)?;
    let nwindows = c.u32()?;
    let mut windows = Vec::with_capacity(nwindows as usize);
    for _ in 0..nwindows {
        let started_at = c.u64()?;
        let ended_at = c.u64()?;
        let dropped_stats = c.u64()?;
        let uplink = if c.u8()? != 0 {
            let if_type = match c.string()?.as_str() {
                "eth" => UplinkType::Eth,
                "lte" => UplinkType::Lte,
                _ => UplinkType::Unknown,
            };
            let changed = c.u8()? != 0;
            Some(Uplink { if_type, changed })
        } else {
            None
        };
        let nstats = c.u32()?;
        let mut stats = Vec::with_capacity(nstats as usize);
        for _ in 0..nstats {
            let key = read_flow_key(&mut c)?;
            let counters = read_counters(&mut c)?;
            c.u64()?; // first_obs
            c.u64()?; // last_obs
            c.u8()?;
            c.u8()?;
            skip_tags_and_vendor_data(&mut c)?;
            stats.push(DecodedStats { key, counters });
        }
        windows.push(DecodedWindow {
            started_at,
            ended_at,
            dropped_stats,
            uplink,
            stats,
        });
    }
    Ok(DecodedFlowReport {
        reported_at,
        observation_point,
        windows,
    })
}

/// Report sink. MQTT publication is out of scope; the emitter is
/// best-effort and failures drop the report silently at the transport.
pub trait ReportEmitter: Send {
    fn emit(&mut self, topic: &str, payload: Bytes);
}

/// Default emitter: log the emission and drop the payload.
#[derive(Default)]
pub struct LogEmitter;

impl ReportEmitter for LogEmitter {
    fn emit(&mut self, topic: &str, payload: Bytes) {
        debug!(target: "report", topic, bytes = payload.len(), "report emitted");
    }
}

/// Test-friendly emitter capturing everything it is handed.
#[derive(Default)]
pub struct CaptureEmitter {
    pub emissions: Vec<(String, Bytes)>,
}

impl ReportEmitter for CaptureEmitter {
    fn emit(&mut self, topic: &str, payload: Bytes) {
        self.emissions.push((topic.to_string(), payload));
    }
}
