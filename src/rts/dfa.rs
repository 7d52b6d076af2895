//! DFA state and transition encoding. A state is map-form (a bitset over
//! the 512-point input alphabet: byte value plus the direction bit at 0x100)
//! or range-form (a half-open input range). The packed state id carries the
//! transition-table variant, an end-of-packet-edge flag, and a fall-through
//! flag marking one shared edge for all accepted inputs.

/// Extended state id: set when the destination indexes the map states.
pub const F_EMAP: u32 = 1 << 31;
/// 16-bit destination form of the same flag.
pub const F_MAP: u16 = 1 << 15;

/// State has an end-of-packet transition.
pub const F_EOP: u32 = 1 << 31;
/// State has one transition shared by all accepted inputs.
pub const F_OUT: u32 = 1 << 30;

pub const TRT_SHIFT: u32 = 27;
pub const TRT_MASK: u32 = 0x3800_0000;

/// Transition index bits of a packed state id.
pub fn next_index(id: u32) -> u32 {
    id & !(F_EOP | F_OUT | TRT_MASK)
}

/// State index bits of an extended destination.
pub fn state_index(sid: u32) -> u32 {
    sid & !F_EMAP
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TranVariant {
    T8 = 0,
    T4Fc = 1,
    T4F = 2,
    T4C = 3,
    T2 = 4,
}

impl TranVariant {
    pub fn from_id(id: u32) -> Option<TranVariant> {
        match (id & TRT_MASK) >> TRT_SHIFT {
            0 => Some(TranVariant::T8),
            1 => Some(TranVariant::T4Fc),
            2 => Some(TranVariant::T4F),
            3 => Some(TranVariant::T4C),
            4 => Some(TranVariant::T2),
            _ => None,
        }
    }
}

/// 512-bit input set; bit 0x100 distinguishes server-to-client bytes.
#[derive(Debug, Clone, Default)]
pub struct Bitset {
    pub bits: [u64; 8],
}

impl Bitset {
    pub fn contains(&self, bit: u32) -> bool {
        (self.bits[(bit >> 6) as usize] >> (bit & 63)) & 1 == 1
    }

    pub fn add(&mut self, bit: u32) {
        self.bits[(bit >> 6) as usize] |= 1u64 << (bit & 63);
    }

    pub fn pop(&self) -> u32 {
        self.bits.iter().map(|w| w.count_ones()).sum()
    }

    /// Rank of `bit` among the set members below it.
    pub fn popcount_nth(&self, bit: u32) -> u32 {
        let word = (bit >> 6) as usize;
        let mask = (1u64 << (bit & 63)) - 1;
        let mut c = (self.bits[word] & mask).count_ones();
        for w in &self.bits[..word] {
            c += w.count_ones();
        }
        c
    }
}

#[derive(Debug, Clone)]
pub struct MapState {
    pub id: u32,
    pub map: Bitset,
}

#[derive(Debug, Clone)]
pub struct RanState {
    pub id: u32,
    /// first accepted input
    pub base: u16,
    /// one past the last accepted input
    pub end: u16,
}

#[derive(Debug, Default, Clone)]
pub struct States {
    pub map: Vec<MapState>,
    pub ran: Vec<RanState>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Tran8 {
    pub dst: u32,
    pub fun: u16,
    pub cap: u16,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Tran4Fc {
    pub dst: u16,
    pub fun: u8,
    pub cap: u8,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Tran4F {
    pub dst: u16,
    pub fun: u16,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Tran4C {
    pub dst: u16,
    pub cap: u16,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Tran2 {
    pub dst: u16,
}

#[derive(Debug, Default, Clone)]
pub struct Transitions {
    pub t8: Vec<Tran8>,
    pub t4fc: Vec<Tran4Fc>,
    pub t4f: Vec<Tran4F>,
    pub t4c: Vec<Tran4C>,
    pub t2: Vec<Tran2>,
}

/// Widens a 16-bit destination, translating its map flag to extended form.
fn widen(dst: u16) -> u32 {
    if dst & F_MAP != 0 {
        (dst & !F_MAP) as u32 | F_EMAP
    } else {
        dst as u32
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Edge {
    pub dst: u32,
    pub fun: u32,
    pub cap: u32,
}

impl Transitions {
    pub fn get(&self, variant: TranVariant, idx: usize) -> Edge {
        match variant {
            TranVariant::T8 => {
                let t = self.t8.get(idx).copied().unwrap_or_default();
                Edge {
                    dst: t.dst,
                    fun: t.fun as u32,
                    cap: t.cap as u32,
                }
            }
            TranVariant::T4Fc => {
                let t = self.t4fc.get(idx).copied().unwrap_or_default();
                Edge {
                    dst: widen(t.dst),
                    fun: t.fun as u32,
                    cap: t.cap as u32,
                }
            }
            TranVariant::T4F => {
                let t = self.t4f.get(idx).copied().unwrap_or_default();
                Edge {
                    dst: widen(t.dst),
                    fun: t.fun as u32,
                    cap: 0,
                }
            }
            TranVariant::T4C => {
                let t = self.t4c.get(idx).copied().unwrap_or_default();
                Edge {
                    dst: widen(t.dst),
                    fun: 0,
                    cap: t.cap as u32,
                }
            }
            TranVariant::T2 => {
                let t = self.t2.get(idx).copied().unwrap_or_default();
                Edge {
                    dst: widen(t.dst),
                    fun: 0,
                    cap: 0,
                }
            }
        }
    }
}

/// Transition on input `chr` (byte + direction bit). A rejected input lands
/// in state 0, terminating the stream.
pub fn next(states: &States, trans: &Transitions, sid: u32, chr: u32) -> Edge {
    let (tid, index) = if sid & F_EMAP != 0 {
        let Some(sm) = states.map.get(state_index(sid) as usize) else {
            return Edge::default();
        };
        let tid = sm.id;
        let tidx = next_index(tid);
        let index = if !sm.map.contains(chr) {
            0
        } else if tid & F_OUT != 0 {
            tidx
        } else {
            tidx + sm.map.popcount_nth(chr)
        };
        (tid, index)
    } else {
        let Some(sr) = states.ran.get(state_index(sid) as usize) else {
            return Edge::default();
        };
        let tid = sr.id;
        let tidx = next_index(tid);
        let index = if chr < sr.base as u32 || chr >= sr.end as u32 {
            0
        } else if tid & F_OUT != 0 {
            tidx
        } else {
            tidx + (chr - sr.base as u32)
        };
        (tid, index)
    };

    match TranVariant::from_id(tid) {
        Some(v) => trans.get(v, index as usize),
        None => Edge::default(),
    }
}

/// The synthetic end-of-packet edge, taken only when the state advertises
/// one. Unlike [`next`], absence must be distinguishable from an edge to
/// state 0 carrying code.
pub fn eop(states: &States, trans: &Transitions, sid: u32) -> Option<Edge> {
    let (tid, base_index, width) = if sid & F_EMAP != 0 {
        let sm = states.map.get(state_index(sid) as usize)?;
        (sm.id, next_index(sm.id), sm.map.pop())
    } else {
        let sr = states.ran.get(state_index(sid) as usize)?;
        (sr.id, next_index(sr.id), sr.end.saturating_sub(sr.base) as u32)
    };

    if tid & F_EOP == 0 {
        return None;
    }

    let index = if tid & F_OUT != 0 {
        base_index + 1
    } else {
        base_index + width
    };

    let variant = TranVariant::from_id(tid)?;
    Some(trans.get(variant, index as usize))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitset_rank() {
        let mut set = Bitset::default();
        for b in [b'a' as u32, b'c' as u32, b'z' as u32, 0x100 + 5] {
            set.add(b);
        }
        assert_eq!(set.pop(), 4);
        assert!(set.contains(b'c' as u32));
        assert_eq!(set.popcount_nth(b'a' as u32), 0);
        assert_eq!(set.popcount_nth(b'c' as u32), 1);
        assert_eq!(set.popcount_nth(b'z' as u32), 2);
        assert_eq!(set.popcount_nth(0x100 + 5), 3);
    }

    #[test]
    fn range_state_transitions_by_offset() {
        let states = States {
            map: vec![],
            ran: vec![RanState {
                id: (TranVariant::T2 as u32) << TRT_SHIFT | 1,
                base: b'a' as u16,
                end: b'd' as u16,
            }],
        };
        let trans = Transitions {
            t2: vec![
                Tran2 { dst: 0 },
                Tran2 { dst: 10 },
                Tran2 { dst: 11 },
                Tran2 { dst: 12 },
            ],
            ..Default::default()
        };
        assert_eq!(next(&states, &trans, 0, b'a' as u32).dst, 10);
        assert_eq!(next(&states, &trans, 0, b'c' as u32).dst, 12);
        // outside the range: transition 0 terminates
        assert_eq!(next(&states, &trans, 0, b'x' as u32).dst, 0);
    }

    #[test]
    fn fall_through_uses_shared_edge() {
        let mut map = Bitset::default();
        map.add(b'x' as u32);
        map.add(b'y' as u32);
        let states = States {
            map: vec![MapState {
                id: (TranVariant::T2 as u32) << TRT_SHIFT | F_OUT | 1,
                map,
            }],
            ran: vec![],
        };
        let trans = Transitions {
            t2: vec![Tran2 { dst: 0 }, Tran2 { dst: 42 }],
            ..Default::default()
        };
        assert_eq!(next(&states, &trans, F_EMAP, b'x' as u32).dst, 42);
        assert_eq!(next(&states, &trans, F_EMAP, b'y' as u32).dst, 42);
        assert_eq!(next(&states, &trans, F_EMAP, b'z' as u32).dst, 0);
    }

    #[test]
    fn eop_absent_without_flag() {
        let states = States {
            map: vec![],
            ran: vec![RanState {
                id: (TranVariant::T2 as u32) << TRT_SHIFT | 1,
                base: 0,
                end: 1,
            }],
        };
        let trans = Transitions::default();
        assert!(eop(&states, &trans, 0).is_none());
    }
}
