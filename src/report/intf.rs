//! Interface-stats report records: per-interface byte/packet totals over
//! observation windows, encoded in the same length-delimited wire form as
//! the flow report.

use bytes::Bytes;

use crate::aggregator::ObservationPoint;
use crate::error::{FlowError, Result};
use crate::report::{write_string, write_u32, write_u64, Cursor};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntfStats {
    pub if_name: String,
    pub role: String,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
    pub rx_packets: u64,
}

#[derive(Debug, Clone, Default)]
pub struct IntfStatsWindow {
    pub started_at: u64,
    pub ended_at: u64,
    pub intf_stats: Vec<IntfStats>,
}

#[derive(Debug, Clone, Default)]
pub struct IntfStatsReport {
    pub reported_at: u64,
    pub observation_point: ObservationPoint,
    pub windows: Vec<IntfStatsWindow>,
}

pub fn encode_intf_report(report: &IntfStatsReport) -> Bytes {
    let mut body = Vec::new();
    write_u64(&mut body, report.reported_at);
    write_string(&mut body, &report.observation_point.node_id);
    write_string(&mut body, &report.observation_point.location_id);
    write_u32(&mut body, report.windows.len() as u32);
    for window in &report.windows {
        write_u64(&mut body, window.started_at);
        write_u64(&mut body, window.ended_at);
        write_u32(&mut body, window.intf_stats.len() as u32);
        for intf in &window.intf_stats {
            write_string(&mut body, &intf.if_name);
            write_string(&mut body, &intf.role);
            write_u64(&mut body, intf.tx_bytes);
            write_u64(&mut body, intf.rx_bytes);
            write_u64(&mut body, intf.tx_packets);
            write_u64(&mut body, intf.rx_packets);
        }
    }

    let mut out = Vec::with_capacity(body.len() + 4);
    write_u32(&mut out, body.len() as u32);
    out.extend_from_slice(&body);
    Bytes::from(out)
}

pub fn decode_intf_report(bytes: &[u8]) -> Result<IntfStatsReport> {
    let mut c = Cursor::new(bytes);
    let len = c.u32()? as usize;
    if len != c.remaining() {
        return Err(FlowError::Corruption("record length mismatch"));
    }
    let reported_at = c.u64()?;
    let observation_point = ObservationPoint {
        node_id: c.string()?,
        location_id: c.string()?,
    };
    let nwindows = c.u32()?;
    let mut windows = Vec::with_capacity(nwindows as usize);
    for _ in 0..nwindows {
        let started_at = c.u64()?;
        let ended_at = c.u64()?;
        let nintfs = c.u32()?;
        let mut intf_stats = Vec::with_capacity(nintfs as usize);
        for _ in 0..nintfs {
            intf_stats.push(IntfStats {
                if_name: c.string()?,
                role: c.string()?,
                tx_bytes: c.u64()?,
                rx_bytes: c.u64()?,
                tx_packets: c.u64()?,
                rx_packets: c.u64()?,
            });
        }
        windows.push(IntfStatsWindow {
            started_at,
            ended_at,
            intf_stats,
        });
    }
    Ok(IntfStatsReport {
        reported_at,
        observation_point,
        windows,
    })
}
