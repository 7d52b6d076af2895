//! Versioned signature bundle loader. A bundle image opens with the ASCII
//! magic "RTS" and four version bytes, followed by `{tag, len, payload}`
//! sections; a zero tag terminates the list. Every multi-byte integer is
//! big-endian on disk. A bundle is immutable once loaded and shared by
//! refcount; the loader refuses corrupt tables outright so a failed load
//! never disturbs the active bundle.

use crate::error::{FlowError, Result};
use crate::rts::dfa::{Bitset, MapState, RanState, States, Tran2, Tran4C, Tran4F, Tran4Fc, Tran8, Transitions};
use crate::rts::{RTS_MAJOR, RTS_MINOR};

pub const SECTION_VARS: u32 = 1;
pub const SECTION_TEXT: u32 = 2;
pub const SECTION_AUTM: u32 = 3;
pub const SECTION_AUTR: u32 = 4;
pub const SECTION_CTAB: u32 = 5;
pub const SECTION_FTAB: u32 = 6;
pub const SECTION_STAB: u32 = 7;
pub const SECTION_TRT0: u32 = 8;
pub const SECTION_TRT1: u32 = 9;
pub const SECTION_TRT2: u32 = 10;
pub const SECTION_TRT3: u32 = 11;
pub const SECTION_TRT4: u32 = 12;
pub const SECTION_KEYS: u32 = 13;

/// On-disk stride of one variable descriptor; the payload is placeholder
/// space sized for the runtime's name and callback slots.
pub const VAR_DESC_SIZE: usize = 16;

/// Service-table strings are fixed-width records.
pub const STAB_MAXLEN: usize = 64;

/// Index-set table: `size` header pairs {length, offset} whose offsets
/// index a shared word pool that trails the headers. The capture and
/// function tables both take this shape.
#[derive(Debug, Default, Clone)]
pub struct Itab {
    sets: Vec<(u32, u32)>,
    data: Vec<u32>,
}

impl Itab {
    pub fn set_len(&self, id: u32) -> u32 {
        self.sets.get(id as usize).map_or(0, |s| s.0)
    }

    /// The `i`th word of set `id`.
    pub fn word(&self, id: u32, i: u32) -> Option<u32> {
        let (len, off) = *self.sets.get(id as usize)?;
        if i >= len {
            return None;
        }
        self.data.get((off + i) as usize).copied()
    }
}

#[derive(Debug)]
pub struct Bundle {
    pub generation: u32,
    pub code: Vec<u8>,
    pub numvars: u32,
    /// variable guid -> exported key name, resolved from the key list
    pub var_names: Vec<Option<String>>,
    pub dfa: States,
    pub trans: Transitions,
    pub ctab: Itab,
    pub ftab: Itab,
    pub stab: Vec<String>,
    /// exported key name -> (variable index, value type)
    pub keys: Vec<(String, u32, u32)>,
}

impl Bundle {
    /// Variable index for a subscription key; `None` when the key is not
    /// exported by this bundle. Index 0 is reserved and never exported.
    pub fn resolve_key(&self, key: &str) -> Option<u32> {
        self.keys
            .iter()
            .find(|(name, _, _)| name == key)
            .map(|(_, guid, _)| *guid)
            .filter(|guid| *guid != 0)
    }

    pub fn var_name(&self, guid: u32) -> Option<&str> {
        self.var_names.get(guid as usize)?.as_deref()
    }

    pub fn service_count(&self) -> usize {
        self.stab.len()
    }

    pub fn service_name(&self, index: usize) -> Option<&str> {
        self.stab.get(index).map(|s| s.as_str())
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    off: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, off: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.off + len > self.buf.len() {
            return Err(FlowError::InvalidSignature("truncated image"));
        }
        let s = &self.buf[self.off..self.off + len];
        self.off += len;
        Ok(s)
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn at_end(&self) -> bool {
        self.off >= self.buf.len()
    }
}

fn be_u16(b: &[u8]) -> u16 {
    u16::from_be_bytes([b[0], b[1]])
}

fn be_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

fn be_u64(b: &[u8]) -> u64 {
    u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}

fn parse_itab(payload: &[u8]) -> Result<Itab> {
    if payload.len() < 4 {
        return Err(FlowError::InvalidSignature("itab too short"));
    }
    let size = be_u32(&payload[..4]) as usize;
    let headers_end = 4 + size * 8;
    if payload.len() < headers_end {
        return Err(FlowError::InvalidSignature("itab headers truncated"));
    }
    let mut sets = Vec::with_capacity(size);
    for i in 0..size {
        let h = &payload[4 + i * 8..];
        sets.push((be_u32(&h[..4]), be_u32(&h[4..8])));
    }
    let words = payload[headers_end..]
        .chunks_exact(4)
        .map(be_u32)
        .collect::<Vec<_>>();
    for &(len, off) in &sets {
        let end = off as usize + len as usize;
        if len > 0 && end > words.len() {
            return Err(FlowError::InvalidSignature("itab set out of bounds"));
        }
    }
    Ok(Itab { sets, data: words })
}

fn parse_map_states(payload: &[u8]) -> Result<Vec<MapState>> {
    // {id: u32, pad: u32, bits: 8 x u64}
    const STRIDE: usize = 8 + 64;
    if payload.len() % STRIDE != 0 {
        return Err(FlowError::InvalidSignature("map state table misaligned"));
    }
    Ok(payload
        .chunks_exact(STRIDE)
        .map(|c| {
            let mut bits = [0u64; 8];
            for (i, w) in c[8..].chunks_exact(8).enumerate() {
                bits[i] = be_u64(w);
            }
            MapState {
                id: be_u32(&c[..4]),
                map: Bitset { bits },
            }
        })
        .collect())
}

fn parse_ran_states(payload: &[u8]) -> Result<Vec<RanState>> {
    const STRIDE: usize = 8;
    if payload.len() % STRIDE != 0 {
        return Err(FlowError::InvalidSignature("range state table misaligned"));
    }
    Ok(payload
        .chunks_exact(STRIDE)
        .map(|c| RanState {
            id: be_u32(&c[..4]),
            base: be_u16(&c[4..6]),
            end: be_u16(&c[6..8]),
        })
        .collect())
}

fn parse_stab(payload: &[u8]) -> Result<Vec<String>> {
    if payload.len() < 4 {
        return Err(FlowError::InvalidSignature("string table too short"));
    }
    let size = be_u32(&payload[..4]) as usize;
    if payload.len() != 4 + size * STAB_MAXLEN {
        return Err(FlowError::InvalidSignature("string table size mismatch"));
    }
    Ok(payload[4..]
        .chunks_exact(STAB_MAXLEN)
        .map(|c| {
            let end = c.iter().position(|&b| b == 0).unwrap_or(STAB_MAXLEN);
            String::from_utf8_lossy(&c[..end]).into_owned()
        })
        .collect())
}

/// Key list entries are `name\0<id>\0<type>\0` runs; only exported
/// variables appear, in ascending id order.
fn parse_keys(payload: &[u8]) -> Result<Vec<(String, u32, u32)>> {
    let mut keys = Vec::new();
    let mut fields = payload.split(|&b| b == 0);
    loop {
        let Some(name) = fields.next() else { break };
        if name.is_empty() {
            break;
        }
        let id = fields
            .next()
            .ok_or(FlowError::InvalidSignature("key list truncated"))?;
        let ty = fields
            .next()
            .ok_or(FlowError::InvalidSignature("key list truncated"))?;
        let parse = |f: &[u8]| -> Result<u32> {
            std::str::from_utf8(f)
                .ok()
                .and_then(|s| s.parse::<u32>().ok())
                .ok_or(FlowError::InvalidSignature("key list field not numeric"))
        };
        keys.push((
            String::from_utf8_lossy(name).into_owned(),
            parse(id)?,
            parse(ty)?,
        ));
    }
    Ok(keys)
}

fn parse_t8(payload: &[u8]) -> Result<Vec<Tran8>> {
    if payload.len() % 8 != 0 {
        return Err(FlowError::InvalidSignature("t8 table misaligned"));
    }
    Ok(payload
        .chunks_exact(8)
        .map(|c| Tran8 {
            dst: be_u32(&c[..4]),
            fun: be_u16(&c[4..6]),
            cap: be_u16(&c[6..8]),
        })
        .collect())
}

fn parse_t4fc(payload: &[u8]) -> Result<Vec<Tran4Fc>> {
    if payload.len() % 4 != 0 {
        return Err(FlowError::InvalidSignature("t4fc table misaligned"));
    }
    Ok(payload
        .chunks_exact(4)
        .map(|c| Tran4Fc {
            dst: be_u16(&c[..2]),
            fun: c[2],
            cap: c[3],
        })
        .collect())
}

fn parse_t4f(payload: &[u8]) -> Result<Vec<Tran4F>> {
    if payload.len() % 4 != 0 {
        return Err(FlowError::InvalidSignature("t4f table misaligned"));
    }
    Ok(payload
        .chunks_exact(4)
        .map(|c| Tran4F {
            dst: be_u16(&c[..2]),
            fun: be_u16(&c[2..4]),
        })
        .collect())
}

fn parse_t4c(payload: &[u8]) -> Result<Vec<Tran4C>> {
    if payload.len() % 4 != 0 {
        return Err(FlowError::InvalidSignature("t4c table misaligned"));
    }
    Ok(payload
        .chunks_exact(4)
        .map(|c| Tran4C {
            dst: be_u16(&c[..2]),
            cap: be_u16(&c[2..4]),
        })
        .collect())
}

fn parse_t2(payload: &[u8]) -> Result<Vec<Tran2>> {
    if payload.len() % 2 != 0 {
        return Err(FlowError::InvalidSignature("t2 table misaligned"));
    }
    Ok(payload
        .chunks_exact(2)
        .map(|c| Tran2 { dst: be_u16(c) })
        .collect())
}

/// Parses a bundle image. `generation` is assigned by the runtime's load
/// counter so streams can fence against mid-flight swaps.
pub fn load(image: &[u8], generation: u32) -> Result<Bundle> {
    let mut r = Reader::new(image);

    let magic = r.take(4)?;
    if &magic[..3] != b"RTS" || magic[3] != 0 {
        return Err(FlowError::InvalidSignature("bad magic"));
    }
    let version = r.take(4)?;
    if version[0] != RTS_MAJOR || version[1] != RTS_MINOR {
        tracing::error!(
            target: "rts",
            image_major = version[0],
            image_minor = version[1],
            runtime = format_args!("{RTS_MAJOR}.{RTS_MINOR}"),
            "incompatible signature version"
        );
        return Err(FlowError::InvalidSignature("incompatible version"));
    }

    let mut bundle = Bundle {
        generation,
        code: Vec::new(),
        numvars: 0,
        var_names: Vec::new(),
        dfa: States::default(),
        trans: Transitions::default(),
        ctab: Itab::default(),
        ftab: Itab::default(),
        stab: Vec::new(),
        keys: Vec::new(),
    };

    loop {
        if r.at_end() {
            break;
        }
        let section = r.u32()?;
        if section == 0 {
            break;
        }
        let len = r.u32()? as usize;
        let payload = r.take(len)?;

        match section {
            SECTION_VARS => {
                if len % VAR_DESC_SIZE != 0 {
                    return Err(FlowError::InvalidSignature("vars table misaligned"));
                }
                bundle.numvars = (len / VAR_DESC_SIZE) as u32;
            }
            SECTION_TEXT => bundle.code = payload.to_vec(),
            SECTION_AUTM => bundle.dfa.map = parse_map_states(payload)?,
            SECTION_AUTR => bundle.dfa.ran = parse_ran_states(payload)?,
            SECTION_CTAB => bundle.ctab = parse_itab(payload)?,
            SECTION_FTAB => bundle.ftab = parse_itab(payload)?,
            SECTION_STAB => bundle.stab = parse_stab(payload)?,
            SECTION_TRT0 => bundle.trans.t8 = parse_t8(payload)?,
            SECTION_TRT1 => bundle.trans.t4fc = parse_t4fc(payload)?,
            SECTION_TRT2 => bundle.trans.t4f = parse_t4f(payload)?,
            SECTION_TRT3 => bundle.trans.t4c = parse_t4c(payload)?,
            SECTION_TRT4 => bundle.trans.t2 = parse_t2(payload)?,
            SECTION_KEYS => bundle.keys = parse_keys(payload)?,
            _ => return Err(FlowError::InvalidSignature("unknown section tag")),
        }
    }

    bundle.var_names = vec![None; bundle.numvars as usize];
    for (name, guid, _ty) in &bundle.keys {
        if *guid >= bundle.numvars {
            return Err(FlowError::InvalidSignature("key id out of range"));
        }
        bundle.var_names[*guid as usize] = Some(name.clone());
    }

    Ok(bundle)
}
