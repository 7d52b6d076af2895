//! Shared helpers: a minimal signature-bundle image builder for driving
//! the RTS engine without the signature compiler.
#![allow(dead_code)]

use flowmon::rts::bundle::{
    SECTION_AUTR, SECTION_FTAB, SECTION_KEYS, SECTION_TEXT, SECTION_TRT2, SECTION_VARS,
    VAR_DESC_SIZE,
};
use flowmon::rts::dfa::TRT_SHIFT;
use flowmon::rts::{RTS_MAJOR, RTS_MINOR, RTS_PATCH};

pub const TRT_4F: u32 = 2;

#[derive(Default)]
pub struct BundleBuilder {
    sections: Vec<(u32, Vec<u8>)>,
}

impl BundleBuilder {
    pub fn new() -> Self {
        BundleBuilder::default()
    }

    pub fn section(mut self, tag: u32, payload: Vec<u8>) -> Self {
        self.sections.push((tag, payload));
        self
    }

    /// Declares `count` variables.
    pub fn vars(self, count: usize) -> Self {
        self.section(SECTION_VARS, vec![0u8; count * VAR_DESC_SIZE])
    }

    pub fn code(self, code: Vec<u8>) -> Self {
        self.section(SECTION_TEXT, code)
    }

    /// Key list entries as (name, variable index, type).
    pub fn keys(self, entries: &[(&str, u32, u32)]) -> Self {
        let mut payload = Vec::new();
        for (name, guid, ty) in entries {
            payload.extend_from_slice(name.as_bytes());
            payload.push(0);
            payload.extend_from_slice(guid.to_string().as_bytes());
            payload.push(0);
            payload.extend_from_slice(ty.to_string().as_bytes());
            payload.push(0);
        }
        self.section(SECTION_KEYS, payload)
    }

    /// Range states as (packed id, base, end).
    pub fn ran_states(self, states: &[(u32, u16, u16)]) -> Self {
        let mut payload = Vec::new();
        for (id, base, end) in states {
            payload.extend_from_slice(&id.to_be_bytes());
            payload.extend_from_slice(&base.to_be_bytes());
            payload.extend_from_slice(&end.to_be_bytes());
        }
        self.section(SECTION_AUTR, payload)
    }

    /// 4-byte function-only transition entries as (dst, fun).
    pub fn t4f(self, entries: &[(u16, u16)]) -> Self {
        let mut payload = Vec::new();
        for (dst, fun) in entries {
            payload.extend_from_slice(&dst.to_be_bytes());
            payload.extend_from_slice(&fun.to_be_bytes());
        }
        self.section(SECTION_TRT2, payload)
    }

    /// Index-set table from per-set word lists.
    pub fn ftab(self, sets: &[&[u32]]) -> Self {
        let mut payload = Vec::new();
        payload.extend_from_slice(&(sets.len() as u32).to_be_bytes());
        let mut offset = 0u32;
        for set in sets {
            payload.extend_from_slice(&(set.len() as u32).to_be_bytes());
            payload.extend_from_slice(&offset.to_be_bytes());
            offset += set.len() as u32;
        }
        for set in sets {
            for word in *set {
                payload.extend_from_slice(&word.to_be_bytes());
            }
        }
        self.section(SECTION_FTAB, payload)
    }

    pub fn build(self) -> Vec<u8> {
        let mut image = b"RTS\0".to_vec();
        image.extend_from_slice(&[RTS_MAJOR, RTS_MINOR, RTS_PATCH, 0]);
        for (tag, payload) in self.sections {
            image.extend_from_slice(&tag.to_be_bytes());
            image.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            image.extend_from_slice(&payload);
        }
        image.extend_from_slice(&0u32.to_be_bytes());
        image.extend_from_slice(&0u32.to_be_bytes());
        image
    }
}

/// Packed range-state id selecting the 4-byte function-only transition
/// table at `tidx`.
pub fn t4f_state_id(tidx: u32) -> u32 {
    (TRT_4F << TRT_SHIFT) | tidx
}

/// A do-nothing range state that rejects every input.
pub fn dead_state() -> (u32, u16, u16) {
    (t4f_state_id(0), 0, 0)
}

pub mod asm {
    //! Tiny bytecode assembler mirroring the interpreter's opcode set.

    use flowmon::rts::vm::op;

    #[derive(Default)]
    pub struct Asm {
        pub code: Vec<u8>,
    }

    impl Asm {
        pub fn new() -> Self {
            Asm::default()
        }

        pub fn pc(&self) -> u32 {
            self.code.len() as u32
        }

        pub fn halt(mut self) -> Self {
            self.code.push(op::HALT);
            self
        }

        pub fn pnum1(mut self, v: i8) -> Self {
            self.code.push(op::PNUM1);
            self.code.push(v as u8);
            self
        }

        pub fn pnum2(mut self, v: i16) -> Self {
            self.code.push(op::PNUM2);
            self.code.extend_from_slice(&v.to_be_bytes());
            self
        }

        pub fn pnum4(mut self, v: i32) -> Self {
            self.code.push(op::PNUM4);
            self.code.extend_from_slice(&v.to_be_bytes());
            self
        }

        pub fn pstr(mut self, s: &str) -> Self {
            self.code.push(op::PSTR);
            self.code
                .extend_from_slice(&(s.len() as i32).to_be_bytes());
            self.code.extend_from_slice(s.as_bytes());
            self
        }

        pub fn pbin(mut self, bytes: &[u8]) -> Self {
            self.code.push(op::PBIN);
            self.code
                .extend_from_slice(&(bytes.len() as i32).to_be_bytes());
            self.code.extend_from_slice(bytes);
            self
        }

        pub fn store(mut self, id: u32) -> Self {
            self.code.push(op::STORE);
            self.code.extend_from_slice(&(id as i32).to_be_bytes());
            self
        }

        pub fn popb(mut self) -> Self {
            self.code.push(op::POPB);
            self
        }

        pub fn popn(mut self) -> Self {
            self.code.push(op::POPN);
            self
        }

        pub fn expect(mut self) -> Self {
            self.code.push(op::EXPECT);
            self
        }
    }
}
