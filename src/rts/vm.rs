//! Bytecode interpreter. A stack machine wired to the DFA scanner: DFA
//! edges invoke code, code captures bytes, requests skips, installs flow
//! traps, and publishes exported values. A scan call consumes bytes until
//! the stream terminates, code yields waiting for more bytes, or the
//! buffer is exhausted; the resume descriptor preserves the position inside
//! the active function set across yields.

use std::sync::Arc;

use crate::rts::buffer::Buffer;
use crate::rts::bundle::Bundle;
use crate::rts::dfa;
use crate::rts::ipaddr::IpAddrKey;
use crate::rts::lruhash::LruHash;
use crate::rts::mpmc::{Queue, QueueMsg};
use crate::rts::pool::Pool;
use crate::rts::trap::{self, FlowTable, FtEntry, TrapRec};
use crate::rts::value::{
    id_flags, id_guid, id_type, pack_id, strntod, Value, ValueType, FLAG_EXPORT, FLAG_STATIC,
};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use siphasher::sip::SipHasher13;
use std::hash::Hasher;

/// Evaluation stack depth; the signature compiler never emits deeper code.
pub const VM_STACK: usize = 12;

pub const DATA_FLAG_EXT: u32 = 0x01;
pub const DATA_FLAG_INV: u32 = 0x02;

/// scan-instruction context packing: resumable sub-scan state
const SCANCTX_STATE_MASK: i64 = 0x0000_0000_ffff_ffff;
const SCANCTX_OFF_MASK: i64 = 0xffff;
const SCANCTX_OFF0_SHIFT: i64 = 32;
const SCANCTX_OFF1_SHIFT: i64 = 48;

pub mod op {
    pub const HALT: u8 = 0;
    pub const JUMP: u8 = 1;
    pub const BREZ: u8 = 2;
    pub const BREZNP: u8 = 3;
    pub const BRNEZNP: u8 = 4;
    pub const LOAD: u8 = 5;
    pub const STORE: u8 = 6;
    pub const DROP: u8 = 7;
    pub const NOOP: u8 = 8;
    pub const PNUM1: u8 = 9;
    pub const PNUM2: u8 = 10;
    pub const PNUM4: u8 = 11;
    pub const PNUM8: u8 = 12;
    pub const PSTR: u8 = 13;
    pub const PBIN: u8 = 14;
    pub const POPN: u8 = 15;
    pub const POPB: u8 = 16;
    pub const IADD: u8 = 17;
    pub const ISUB: u8 = 18;
    pub const IMUL: u8 = 19;
    pub const IDIV: u8 = 20;
    pub const IEQL: u8 = 21;
    pub const INEQ: u8 = 22;
    pub const ISHL: u8 = 23;
    pub const ISHR: u8 = 24;
    pub const ILT: u8 = 25;
    pub const IGT: u8 = 26;
    pub const BANG: u8 = 27;
    pub const AND: u8 = 28;
    pub const OR: u8 = 29;
    pub const NOT: u8 = 30;
    pub const XOR: u8 = 31;
    pub const BTOI: u8 = 32;
    pub const ITOB: u8 = 33;
    pub const ATOI: u8 = 34;
    pub const ITOA: u8 = 35;
    pub const ATOB: u8 = 36;
    pub const BTOA: u8 = 37;
    pub const HTOI: u8 = 38;
    pub const SEQL: u8 = 39;
    pub const SNEQ: u8 = 40;
    pub const SCAT: u8 = 41;
    pub const SLEN: u8 = 42;
    pub const SLCE: u8 = 43;
    pub const PRNT: u8 = 44;
    pub const YANK: u8 = 45;
    pub const SKIP: u8 = 46;
    pub const OFFSET: u8 = 47;
    pub const REMAINING: u8 = 48;
    pub const GOTO: u8 = 49;
    pub const PEEK: u8 = 50;
    pub const SEEK: u8 = 51;
    pub const SCAN: u8 = 52;
    pub const SHMR: u8 = 53;
    pub const EXPECT: u8 = 54;
    pub const DICT: u8 = 55;
    pub const TIME: u8 = 56;
}

/// A fault clamps the stream to terminal state; the caller surfaces it as
/// an out-of-memory scan result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmFault;

pub type VmResult = std::result::Result<(), VmFault>;

/// Per-stream DFA cursor.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanData {
    pub state: u32,
    pub flags: u32,
    pub offset: [u32; 2],
}

impl ScanData {
    pub fn init(state: u32) -> Self {
        ScanData {
            state,
            flags: 0,
            offset: [0, 0],
        }
    }

    fn dir(&self) -> usize {
        (self.flags & DATA_FLAG_EXT) as usize
    }
}

/// Opaque per-stream context relayed to subscription callbacks.
pub type UserData = Option<Arc<dyn std::any::Any + Send + Sync>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubValue {
    Number(i64),
    String(Vec<u8>),
    Binary(Vec<u8>),
}

impl SubValue {
    pub fn len(&self) -> usize {
        match self {
            SubValue::Number(_) => std::mem::size_of::<i64>(),
            SubValue::String(v) | SubValue::Binary(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct SubEvent {
    pub key: String,
    pub value: SubValue,
    pub user: UserData,
}

pub type SubCallback = Arc<dyn Fn(&SubEvent) + Send + Sync>;
pub type SubRegistry = Mutex<FxHashMap<u32, SubCallback>>;

/// Dictionary record; key and value live in the handle pool so dictionary
/// growth is bounded by the arena.
pub struct DictRec {
    pub key: Buffer,
    pub val: Buffer,
}

pub type DictTable = LruHash<DictRec>;

pub fn dict_hash(key: &[u8]) -> u32 {
    let mut h = SipHasher13::new();
    h.write(key);
    h.finish() as u32
}

/// Thread-level state the interpreter reaches through; the handle splits
/// itself into this view for the duration of a call.
pub struct VmCtx<'a> {
    pub pool: &'a mut Pool,
    pub bundle: Arc<Bundle>,
    pub dict: &'a mut DictTable,
    pub flow: &'a mut FlowTable,
    pub timestamp: u64,
    pub subs: &'a SubRegistry,
    pub queue: &'a Queue,
    pub pid: u32,
    pub user: UserData,
    /// scan input backing any external buffers
    pub ext: Option<&'a [u8]>,
}

impl VmCtx<'_> {
    fn broadcast(&mut self, msg: QueueMsg) {
        if self.queue.has_other_consumers() {
            self.queue.with_lock(|g| {
                if g.consumer_count() > 1 {
                    g.push(self.pid, msg);
                }
            });
        }
    }
}

#[derive(Debug)]
struct HeapObj {
    id: u32,
    value: Value,
    /// capture in progress; gates window extension vs new-object creation
    capturing: bool,
}

#[derive(Debug)]
pub struct Vm {
    stack: Vec<Value>,
    /// named heap variables
    list: Vec<HeapObj>,
    /// shared-memory regions
    shared: Vec<HeapObj>,
    /// unmanaged captures pending a sync
    sync: u32,
    /// packed {fun-set iteration index << 24 | pc} of a pending skip
    resume: u32,
    resume_fun: u32,
    pub generation: u32,
}

fn read16(code: &[u8], pc: usize) -> i64 {
    if pc + 2 > code.len() {
        return 0;
    }
    i16::from_be_bytes([code[pc], code[pc + 1]]) as i64
}

fn read32(code: &[u8], pc: usize) -> i32 {
    if pc + 4 > code.len() {
        return 0;
    }
    i32::from_be_bytes([code[pc], code[pc + 1], code[pc + 2], code[pc + 3]])
}

fn read64(code: &[u8], pc: usize) -> i64 {
    if pc + 8 > code.len() {
        return 0;
    }
    i64::from_be_bytes([
        code[pc],
        code[pc + 1],
        code[pc + 2],
        code[pc + 3],
        code[pc + 4],
        code[pc + 5],
        code[pc + 6],
        code[pc + 7],
    ])
}

impl Vm {
    pub fn new(generation: u32) -> Self {
        Vm {
            stack: Vec::with_capacity(VM_STACK),
            list: Vec::new(),
            shared: Vec::new(),
            sync: 0,
            resume: 0,
            resume_fun: 0,
            generation,
        }
    }

    pub fn resume_pending(&self) -> bool {
        self.resume != 0 || self.resume_fun != 0
    }

    /// Releases everything the VM holds back into the pool. Always safe;
    /// also the error path once a scan faults.
    pub fn exit(&mut self, pool: &mut Pool) {
        while let Some(mut v) = self.stack.pop() {
            v.release(pool);
        }
        for mut obj in self.list.drain(..) {
            obj.value.release(pool);
        }
        for mut obj in self.shared.drain(..) {
            obj.value.release(pool);
        }
        self.sync = 0;
        self.resume = 0;
        self.resume_fun = 0;
    }

    pub fn pop_value(&mut self) -> Option<Value> {
        self.stack.pop()
    }

    fn push(&mut self, v: Value) {
        debug_assert!(self.stack.len() < VM_STACK, "vm stack overflow");
        self.stack.push(v);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().unwrap_or(Value::Number(0))
    }

    fn pop_num(&mut self) -> i64 {
        self.pop().as_number()
    }

    fn pop_release(&mut self, pool: &mut Pool) {
        let mut v = self.pop();
        v.release(pool);
    }

    fn top(&mut self) -> &mut Value {
        self.stack.last_mut().expect("vm stack underflow")
    }

    fn binop(&mut self, f: impl FnOnce(i64, i64) -> i64) {
        let rhs = self.pop_num();
        let lhs = self.pop_num();
        self.push(Value::Number(f(lhs, rhs)));
    }

    // ---- heap ----------------------------------------------------------

    fn heap_find(list: &[HeapObj], id: u32) -> Option<usize> {
        list.iter().position(|o| o.id == id)
    }

    fn obj_is_multipart(list: &[HeapObj], pos: usize) -> bool {
        list.get(pos + 1).is_some_and(|next| next.id == list[pos].id)
    }

    fn obj_destroy(list: &mut Vec<HeapObj>, pos: usize, pool: &mut Pool) {
        let mut obj = list.remove(pos);
        obj.value.release(pool);
    }

    /// Merges a multipart pair at `pos`: the front object holds the newest
    /// capture window, the one behind it the resident bytes. A front window
    /// with a non-zero origin cannot extend the resident bytes; the stale
    /// resident object is dropped and the front synced instead.
    fn obj_merge(
        list: &mut Vec<HeapObj>,
        pos: usize,
        pool: &mut Pool,
        ext: Option<&[u8]>,
    ) -> VmResult {
        debug_assert!(Self::obj_is_multipart(list, pos));
        let front_off = list[pos].value.as_buffer().off;
        if front_off != 0 {
            Self::obj_destroy(list, pos + 1, pool);
            return Self::obj_sync(list, pos, pool, ext);
        }

        let window = {
            let front = list[pos].value.as_buffer();
            front.to_vec(pool, ext)
        };
        let ok = {
            let dst = list[pos + 1].value.as_buffer_mut();
            dst.write(&window, pool, ext)
        };
        Self::obj_destroy(list, pos, pool);
        if !ok {
            let dst = list[pos].value.as_buffer_mut();
            dst.clear(pool);
            return Err(VmFault);
        }
        list[pos].capturing = false;
        Ok(())
    }

    fn obj_sync(
        list: &mut [HeapObj],
        pos: usize,
        pool: &mut Pool,
        ext: Option<&[u8]>,
    ) -> VmResult {
        let obj = &mut list[pos];
        let buf = obj.value.as_buffer_mut();
        let Some(bytes) = ext else {
            buf.clear(pool);
            return Err(VmFault);
        };
        if !buf.sync(pool, bytes) {
            buf.clear(pool);
            return Err(VmFault);
        }
        obj.capturing = false;
        Ok(())
    }

    /// Projects every pending capture into pool memory. After this no heap
    /// object references the scan input.
    pub fn sync_heap(&mut self, pool: &mut Pool, ext: Option<&[u8]>) -> VmResult {
        if self.sync == 0 {
            return Ok(());
        }
        self.sync = 0;
        let mut pos = 0;
        while pos < self.list.len() {
            if Self::obj_is_multipart(&self.list, pos) {
                Self::obj_merge(&mut self.list, pos, pool, ext)?;
            } else if self.list[pos].value.value_type() != ValueType::Number
                && self.list[pos].value.as_buffer().will_sync(pool)
            {
                Self::obj_sync(&mut self.list, pos, pool, ext)?;
            } else {
                self.list[pos].capturing = false;
            }
            pos += 1;
        }
        Ok(())
    }

    fn heap_load(
        &mut self,
        id: u32,
        pool: &mut Pool,
        ext: Option<&[u8]>,
    ) -> std::result::Result<Value, VmFault> {
        let pos = match Self::heap_find(&self.list, id) {
            Some(p) => p,
            None => {
                self.list.insert(
                    0,
                    HeapObj {
                        id,
                        value: Value::of_type(id_type(id)),
                        capturing: false,
                    },
                );
                0
            }
        };
        if id_type(id) == ValueType::Number {
            Ok(Value::Number(self.list[pos].value.as_number()))
        } else {
            if Self::obj_is_multipart(&self.list, pos) {
                Self::obj_merge(&mut self.list, pos, pool, ext)?;
            }
            let mut buf = Buffer::new();
            buf.copy_from(self.list[pos].value.as_buffer(), pool);
            Ok(Value::Buf {
                ty: id_type(id),
                buf,
            })
        }
    }

    fn heap_save(&mut self, src: &Value, id: u32, pool: &mut Pool) -> VmResult {
        let pos = match Self::heap_find(&self.list, id) {
            Some(p) => p,
            None => {
                self.list.insert(
                    0,
                    HeapObj {
                        id,
                        value: Value::of_type(id_type(id)),
                        capturing: false,
                    },
                );
                0
            }
        };
        if id_type(id) == ValueType::Number {
            *self.list[pos].value.as_number_mut() = src.as_number();
        } else {
            let src_buf = *src.as_buffer();
            if src_buf.will_sync(pool) {
                self.sync += 1;
            }
            self.list[pos]
                .value
                .as_buffer_mut()
                .copy_from(&src_buf, pool);
        }
        Ok(())
    }

    fn heap_reset(&mut self, pool: &mut Pool) {
        let mut pos = 0;
        while pos < self.list.len() {
            if id_flags(self.list[pos].id) & FLAG_STATIC == 0 {
                Self::obj_destroy(&mut self.list, pos, pool);
            } else {
                pos += 1;
            }
        }
    }

    fn heap_drop(&mut self, id: u32, pool: &mut Pool) {
        let mut pos = 0;
        while pos < self.list.len() {
            if self.list[pos].id == id {
                Self::obj_destroy(&mut self.list, pos, pool);
            } else {
                pos += 1;
            }
        }
    }

    // ---- capture -------------------------------------------------------

    /// Captures `len` bytes of `src`'s current window into the variable's
    /// buffer, merging consecutive calls into one monotonic window over the
    /// same data block. Zero-copy while the packet memory is resident.
    pub fn buffer_capture(
        &mut self,
        id: u32,
        src: &Buffer,
        adjust_offset: bool,
        len: u32,
        pool: &mut Pool,
    ) {
        let pos = match Self::heap_find(&self.list, id) {
            Some(p) if !self.list[p].capturing => {
                // resident object; start a fresh capture window in front
                let mut buf = Buffer::new();
                buf.copy_from(src, pool);
                buf.len = 0;
                self.list.insert(
                    p,
                    HeapObj {
                        id,
                        value: Value::Buf {
                            ty: ValueType::Binary,
                            buf,
                        },
                        capturing: true,
                    },
                );
                self.sync += 1;
                p
            }
            Some(p) => {
                // capture in progress; stale windows restart at the source
                let buf = self.list[p].value.as_buffer_mut();
                if adjust_offset {
                    if buf.off != src.off {
                        buf.off = src.off;
                        buf.len = 0;
                    }
                } else if buf.off + buf.len != src.off {
                    buf.off = src.off;
                    buf.len = 0;
                }
                p
            }
            None => {
                let mut buf = Buffer::new();
                buf.copy_from(src, pool);
                buf.len = 0;
                if src.will_sync(pool) {
                    self.sync += 1;
                }
                self.list.insert(
                    0,
                    HeapObj {
                        id,
                        value: Value::Buf {
                            ty: ValueType::Binary,
                            buf,
                        },
                        capturing: true,
                    },
                );
                0
            }
        };

        debug_assert_eq!(id_type(self.list[pos].id), ValueType::Binary);
        let buf = self.list[pos].value.as_buffer_mut();
        debug_assert_eq!(buf.block(), src.block());
        if adjust_offset {
            buf.off -= len;
        }
        buf.len += len;
    }

    fn capture_table(
        &mut self,
        cap_id: u32,
        src: &Buffer,
        adjust_offset: bool,
        ctx: &mut VmCtx<'_>,
    ) {
        let length = ctx.bundle.ctab.set_len(cap_id);
        for i in 0..length {
            if let Some(addr) = ctx.bundle.ctab.word(cap_id, i) {
                self.buffer_capture(addr, src, adjust_offset, 1, ctx.pool);
            }
        }
    }

    // ---- shared memory -------------------------------------------------

    /// Allocates shared region `id` and returns its block for direct
    /// writing.
    pub fn shm_get(
        &mut self,
        id: u32,
        size: usize,
        pool: &mut Pool,
    ) -> Option<crate::rts::pool::BlockId> {
        let mut buf = Buffer::new();
        if !buf.reserve(size, pool, None) {
            return None;
        }
        buf.len = size as u32;
        let block = buf.block();
        self.shared.insert(
            0,
            HeapObj {
                id,
                value: Value::Buf {
                    ty: ValueType::Binary,
                    buf,
                },
                capturing: false,
            },
        );
        block
    }

    /// Maps region `id` as a window into an existing region-0 block.
    pub fn shm_zcopy(
        &mut self,
        block: crate::rts::pool::BlockId,
        id: u32,
        off: &mut u32,
        len: u32,
        pool: &mut Pool,
    ) {
        let buf = Buffer::from_block(pool, block, *off, len);
        *off += len;
        self.shared.insert(
            0,
            HeapObj {
                id,
                value: Value::Buf {
                    ty: ValueType::Binary,
                    buf,
                },
                capturing: false,
            },
        );
    }

    fn shm_read(&mut self, id: u32, pool: &mut Pool) -> Value {
        let mut buf = Buffer::new();
        if let Some(pos) = Self::heap_find(&self.shared, id) {
            buf.copy_from(self.shared[pos].value.as_buffer(), pool);
        }
        Value::Buf {
            ty: ValueType::Binary,
            buf,
        }
    }

    // ---- publish -------------------------------------------------------

    fn publish(&mut self, v: &Value, id: u32, ctx: &mut VmCtx<'_>) {
        let guid = id_guid(id);
        let cb = { ctx.subs.lock().get(&guid).cloned() };
        let Some(cb) = cb else { return };
        let Some(name) = ctx.bundle.var_name(guid) else {
            return;
        };
        let value = match v {
            Value::Number(n) => SubValue::Number(*n),
            Value::Buf { ty, buf } => {
                let bytes = buf.to_vec(ctx.pool, ctx.ext);
                match ty {
                    ValueType::String => SubValue::String(bytes),
                    _ => SubValue::Binary(bytes),
                }
            }
        };
        cb(&SubEvent {
            key: name.to_string(),
            value,
            user: ctx.user.clone(),
        });
    }

    // ---- dict / expect -------------------------------------------------

    fn dict_save_local(
        key: &Buffer,
        val: &Buffer,
        ttl_ms: u32,
        ctx: &mut VmCtx<'_>,
    ) {
        let keyb = key.to_vec(ctx.pool, ctx.ext);
        let hashval = dict_hash(&keyb);
        let now = ctx.timestamp;
        let found = {
            let VmCtx { pool, dict, .. } = ctx;
            dict.find(hashval, now, |rec| rec.key.to_vec(&**pool, None) == keyb)
        };
        match found {
            Some(id) => {
                ctx.dict.set_ttl(id, ttl_ms, now);
                let mut newval = Buffer::new();
                let ok = newval.clone_from_buffer(val, ctx.pool, ctx.ext);
                if let Some(rec) = ctx.dict.get_mut(id) {
                    let old = std::mem::replace(&mut rec.val, newval);
                    let mut old = old;
                    if ok {
                        old.release(ctx.pool);
                    } else {
                        // failed clone leaves the entry empty
                        std::mem::swap(&mut rec.val, &mut old);
                        old.release(ctx.pool);
                    }
                }
            }
            None => {
                let mut k = Buffer::new();
                let mut v = Buffer::new();
                if !k.clone_from_buffer(key, ctx.pool, ctx.ext)
                    || !v.clone_from_buffer(val, ctx.pool, ctx.ext)
                {
                    k.release(ctx.pool);
                    v.release(ctx.pool);
                    return;
                }
                ctx.dict.insert(DictRec { key: k, val: v }, hashval, ttl_ms, now);
            }
        }
        while let Some(mut rec) = ctx.dict.expire(now) {
            rec.key.release(ctx.pool);
            rec.val.release(ctx.pool);
        }
    }

    pub fn apply_dict_msg(key: &[u8], val: &[u8], ttl_ms: u32, ctx: &mut VmCtx<'_>) {
        let mut k = Buffer::new();
        let mut v = Buffer::new();
        if !k.write(key, ctx.pool, None) || !v.write(val, ctx.pool, None) {
            k.release(ctx.pool);
            v.release(ctx.pool);
            return;
        }
        Self::dict_save_local(&k, &v, ttl_ms, ctx);
        k.release(ctx.pool);
        v.release(ctx.pool);
    }

    fn dict_save(&mut self, key: &Buffer, val: &Buffer, ttl_ms: i64, ctx: &mut VmCtx<'_>) {
        if ttl_ms <= 0 {
            return;
        }
        let ttl_ms = ttl_ms.min(u32::MAX as i64) as u32;
        let keyb = key.to_vec(ctx.pool, ctx.ext);
        let valb = val.to_vec(ctx.pool, ctx.ext);
        ctx.broadcast(QueueMsg::DictSave {
            key: keyb,
            val: valb,
            ttl_ms,
        });
        Self::dict_save_local(key, val, ttl_ms, ctx);
    }

    fn dict_find(&mut self, key: &Buffer, ctx: &mut VmCtx<'_>) -> Buffer {
        let now = ctx.timestamp;
        if let Some(mut rec) = ctx.dict.expire(now) {
            rec.key.release(ctx.pool);
            rec.val.release(ctx.pool);
        }
        let keyb = key.to_vec(ctx.pool, ctx.ext);
        let hashval = dict_hash(&keyb);
        let found = {
            let VmCtx { pool, dict, .. } = ctx;
            dict.find(hashval, now, |rec| rec.key.to_vec(&**pool, None) == keyb)
        };
        let mut out = Buffer::new();
        if let Some(id) = found {
            let src = *ctx.dict.get(id).map(|rec| &rec.val).expect("found entry");
            out.copy_from(&src, ctx.pool);
        }
        out
    }

    /// Installs a flow trap from the expect argument list. Wildcards are
    /// zero; a trap with no present field at all is refused.
    pub fn flow_save(
        proto: i64,
        saddr: &[u8],
        sport: i64,
        daddr: &[u8],
        dport: i64,
        pc: i64,
        ttl_sec: i64,
        ctx: &mut VmCtx<'_>,
    ) {
        if sport == 0 && dport == 0 && saddr.is_empty() && daddr.is_empty() {
            return;
        }
        if ttl_sec < 0 {
            return;
        }
        let ttl_ms = if ttl_sec == 0 {
            ctx.flow.expiry()
        } else {
            (ttl_sec as u64).saturating_mul(1000).min(u32::MAX as u64) as u32
        };

        let parse = |bytes: &[u8]| -> Option<IpAddrKey> {
            if bytes.is_empty() {
                Some(IpAddrKey::unspec())
            } else {
                IpAddrKey::from_slice(bytes).filter(|a| !a.is_unspec())
            }
        };
        let Some(saddr) = parse(saddr) else { return };
        let Some(daddr) = parse(daddr) else { return };

        Self::flow_expire(ctx);

        let entry = FtEntry {
            saddr,
            daddr,
            sport: sport as u16,
            dport: dport as u16,
            proto: proto as u16,
            pc: pc as u32,
        };

        let Some(mem) = ctx.pool.alloc_block(std::mem::size_of::<TrapRec>()) else {
            return;
        };
        trap::ft_save(
            ctx.flow,
            TrapRec {
                entry,
                mem: Some(mem),
            },
            ttl_ms,
            ctx.timestamp,
        );

        ctx.broadcast(QueueMsg::FlowSave { entry, ttl_ms });
    }

    pub fn apply_flow_msg(entry: FtEntry, ttl_ms: u32, ctx: &mut VmCtx<'_>) {
        Self::flow_expire(ctx);
        let Some(mem) = ctx.pool.alloc_block(std::mem::size_of::<TrapRec>()) else {
            return;
        };
        trap::ft_save(
            ctx.flow,
            TrapRec {
                entry,
                mem: Some(mem),
            },
            ttl_ms,
            ctx.timestamp,
        );
    }

    pub fn flow_expire(ctx: &mut VmCtx<'_>) {
        while let Some(rec) = ctx.flow.expire(ctx.timestamp) {
            if let Some(mem) = rec.mem {
                ctx.pool.block_put(mem);
            }
        }
    }

    // ---- print ---------------------------------------------------------

    fn printf(&self, fmt: &[u8], argc: usize, ctx: &mut VmCtx<'_>) {
        let args = &self.stack[self.stack.len() - argc..];
        let mut out = String::new();
        let mut i = 0;
        let mut s = fmt.iter().copied().peekable();
        while let Some(ch) = s.next() {
            if ch != b'%' {
                out.push(ch as char);
                continue;
            }
            let Some(spec) = s.next() else { break };
            if spec == b'%' {
                out.push('%');
                continue;
            }
            if i >= argc {
                return;
            }
            let arg = &args[i];
            i += 1;
            match spec {
                b'c' => out.push(arg.as_number() as u8 as char),
                b'd' => out.push_str(&format!("{}", arg.as_number())),
                b'u' => out.push_str(&format!("{}", arg.as_number() as u64)),
                b'x' => out.push_str(&format!("{:x}", arg.as_number())),
                b's' => {
                    if let Value::Buf { buf, .. } = arg {
                        for b in buf.to_vec(ctx.pool, ctx.ext) {
                            if b == 0 {
                                break;
                            }
                            out.push(b as char);
                        }
                    }
                }
                b'b' => {
                    if let Value::Buf { buf, .. } = arg {
                        out.push('[');
                        let bytes = buf.to_vec(ctx.pool, ctx.ext);
                        for (j, b) in bytes.iter().enumerate() {
                            out.push_str(&format!(" {b:02x}"));
                            if j + 1 < bytes.len() {
                                out.push(',');
                            }
                        }
                        out.push_str(" ]");
                    }
                }
                _ => out.push('?'),
            }
        }
        tracing::debug!(target: "rts_vm", "{}", out);
    }

    // ---- interpreter ---------------------------------------------------

    /// Runs bytecode at `pc` until HALT, a yield, or a fault. `buffer` is
    /// the scan window when invoked from a DFA edge, None from stream
    /// setup paths.
    pub fn exec(
        &mut self,
        mut pc: usize,
        data: &mut ScanData,
        mut buffer: Option<&mut Buffer>,
        ctx: &mut VmCtx<'_>,
    ) -> VmResult {
        let bundle = ctx.bundle.clone();
        let code = &bundle.code;

        loop {
            let opcode = match code.get(pc) {
                Some(b) => *b,
                None => return Ok(()),
            };
            pc += 1;
            match opcode {
                op::HALT => return Ok(()),
                op::SKIP => {
                    let req = self.pop_num().max(0) as u32;
                    let avail = buffer.as_ref().map_or(0, |b| b.len);
                    let skip = req.min(avail);
                    let remaining = req - skip;
                    if skip > 0 {
                        let b = buffer.as_mut().expect("skip with no buffer");
                        data.offset[data.dir()] += skip;
                        if data.flags & DATA_FLAG_INV != 0 {
                            b.off -= skip;
                        } else {
                            b.off += skip;
                        }
                        b.len -= skip;
                    }
                    if remaining > 0 {
                        self.push(Value::Number(remaining as i64));
                        debug_assert!(pc - 1 <= 0x00ff_ffff);
                        self.resume = (pc - 1) as u32;
                        return Ok(());
                    }
                }
                op::YANK => {
                    let req = self.pop_num().max(0) as u32;
                    let avail = buffer.as_ref().map_or(0, |b| b.len);
                    let skip = req.min(avail);
                    let remaining = req - skip;
                    if skip > 0 {
                        let inv = data.flags & DATA_FLAG_INV != 0;
                        let b = buffer.as_mut().expect("yank with no buffer");
                        let src = **b;
                        self.buffer_capture(
                            pack_id(0, ValueType::Binary, 0),
                            &src,
                            inv,
                            skip,
                            ctx.pool,
                        );
                        data.offset[data.dir()] += skip;
                        if inv {
                            b.off -= skip;
                        } else {
                            b.off += skip;
                        }
                        b.len -= skip;
                    }
                    if remaining > 0 {
                        self.push(Value::Number(remaining as i64));
                        debug_assert!(pc - 1 <= 0x00ff_ffff);
                        self.resume = (pc - 1) as u32;
                        return Ok(());
                    }
                }
                op::GOTO => {
                    data.state = read32(code, pc) as u32;
                    pc += 4;
                }
                op::POPN => {
                    self.pop();
                }
                op::POPB => {
                    self.pop_release(ctx.pool);
                }
                op::PNUM1 => {
                    let n = code.get(pc).map_or(0, |b| *b as i8 as i64);
                    pc += 1;
                    self.push(Value::Number(n));
                }
                op::PNUM2 => {
                    let n = read16(code, pc);
                    pc += 2;
                    self.push(Value::Number(n));
                }
                op::PNUM4 => {
                    let n = read32(code, pc) as i64;
                    pc += 4;
                    self.push(Value::Number(n));
                }
                op::PNUM8 => {
                    let n = read64(code, pc);
                    pc += 8;
                    self.push(Value::Number(n));
                }
                op::PSTR | op::PBIN => {
                    let len = read32(code, pc).max(0) as usize;
                    pc += 4;
                    let ty = if opcode == op::PSTR {
                        ValueType::String
                    } else {
                        ValueType::Binary
                    };
                    let mut buf = Buffer::new();
                    let bytes = code.get(pc..pc + len).unwrap_or(&[]);
                    if !buf.write(bytes, ctx.pool, ctx.ext) {
                        self.push(Value::Buf { ty, buf });
                        return Err(VmFault);
                    }
                    pc += len;
                    self.push(Value::Buf { ty, buf });
                }
                op::SHMR => {
                    let id = read32(code, pc) as u32;
                    pc += 4;
                    let v = self.shm_read(id, ctx.pool);
                    self.push(v);
                }
                op::LOAD => {
                    let id = read32(code, pc) as u32;
                    pc += 4;
                    let v = self.heap_load(id, ctx.pool, ctx.ext)?;
                    self.push(v);
                }
                op::SCAN => {
                    let ctx_id = read32(code, pc) as u32;
                    pc += 4;
                    let mut ctx_value: i64 = 0;
                    if ctx_id != 0 {
                        debug_assert_eq!(id_type(ctx_id), ValueType::Number);
                        let v = self.heap_load(ctx_id, ctx.pool, ctx.ext)?;
                        ctx_value = v.as_number();
                    }
                    let init_state = read32(code, pc);
                    pc += 4;
                    if ctx_value == 0 {
                        ctx_value = init_state as i64 & SCANCTX_STATE_MASK;
                    }
                    let mut sdata = ScanData::init((ctx_value & SCANCTX_STATE_MASK) as u32);
                    sdata.offset[0] = ((ctx_value >> SCANCTX_OFF0_SHIFT) & SCANCTX_OFF_MASK) as u32;
                    sdata.offset[1] = ((ctx_value >> SCANCTX_OFF1_SHIFT) & SCANCTX_OFF_MASK) as u32;
                    sdata.flags = read32(code, pc) as u32;
                    pc += 4;

                    let prev_sp = self.stack.len();
                    let mut sub = *self.top().as_buffer();
                    let res = scan_buffer(self, &mut sdata, &mut sub, ctx);
                    // write back window movement, then release
                    *self.top().as_buffer_mut() = sub;

                    if self.stack.len() != prev_sp || self.resume != 0 {
                        return Err(VmFault);
                    }
                    self.pop_release(ctx.pool);
                    self.push(Value::Number(res as i64));

                    if ctx_id != 0 {
                        debug_assert!(sdata.offset[0] as i64 <= SCANCTX_OFF_MASK);
                        debug_assert!(sdata.offset[1] as i64 <= SCANCTX_OFF_MASK);
                        let mut saved: i64 = sdata.state as i64 & SCANCTX_STATE_MASK;
                        saved |= (sdata.offset[0] as i64 & SCANCTX_OFF_MASK) << SCANCTX_OFF0_SHIFT;
                        saved |= (sdata.offset[1] as i64 & SCANCTX_OFF_MASK) << SCANCTX_OFF1_SHIFT;
                        self.heap_save(&Value::Number(saved), ctx_id, ctx.pool)?;
                        debug_assert_eq!(id_flags(ctx_id) & FLAG_EXPORT, 0);
                    }
                }
                op::STORE => {
                    let id = read32(code, pc) as u32;
                    pc += 4;
                    let v = self.stack.pop().expect("store on empty stack");
                    self.heap_save(&v, id, ctx.pool)?;
                    if id_flags(id) & FLAG_EXPORT != 0 {
                        self.publish(&v, id, ctx);
                    }
                    self.stack.push(v);
                }
                op::DROP => {
                    let id = read32(code, pc);
                    pc += 4;
                    if id < 0 {
                        self.heap_reset(ctx.pool);
                    } else {
                        self.heap_drop(id as u32, ctx.pool);
                    }
                }
                op::PEEK => {
                    let mut seek_off = self.pop_num() as i64;
                    let peek_len = self.pop_num().max(0);
                    let max_len: i64;
                    if data.flags & DATA_FLAG_INV != 0 {
                        seek_off = -seek_off - peek_len;
                        max_len = data.offset[data.dir()] as i64;
                    } else {
                        max_len = buffer.as_ref().map_or(0, |b| b.len as i64);
                    }
                    let mut out = Buffer::new();
                    if let Some(b) = buffer.as_ref() {
                        if b.off as i64 + seek_off >= 0 && seek_off + peek_len <= max_len {
                            out.copy_from(b, ctx.pool);
                            if b.will_sync(ctx.pool) {
                                self.sync += 1;
                            }
                            out.off = (out.off as i64 + seek_off) as u32;
                            out.len = peek_len as u32;
                        }
                    }
                    self.push(Value::Buf {
                        ty: ValueType::Binary,
                        buf: out,
                    });
                }
                op::SEEK => {
                    let mut seek_off = self.pop_num();
                    let max_len: i64;
                    if data.flags & DATA_FLAG_INV != 0 {
                        seek_off = -seek_off;
                        max_len = data.offset[data.dir()] as i64;
                    } else {
                        max_len = buffer.as_ref().map_or(0, |b| b.len as i64);
                    }
                    let off = buffer.as_ref().map_or(0, |b| b.off as i64);
                    if off + seek_off < 0 || seek_off > max_len {
                        return Err(VmFault);
                    }
                    self.push(Value::Number(data.offset[data.dir()] as i64));
                    if let Some(b) = buffer.as_mut() {
                        if data.flags & DATA_FLAG_INV != 0 {
                            data.offset[data.dir()] =
                                (data.offset[data.dir()] as i64 - seek_off) as u32;
                            b.len = (b.len as i64 + seek_off) as u32;
                            b.off = (b.off as i64 + seek_off) as u32;
                        } else {
                            data.offset[data.dir()] =
                                (data.offset[data.dir()] as i64 + seek_off) as u32;
                            b.len = (b.len as i64 - seek_off) as u32;
                            b.off = (b.off as i64 + seek_off) as u32;
                        }
                    }
                }
                op::IADD => self.binop(|a, b| a.wrapping_add(b)),
                op::ISUB => self.binop(|a, b| a.wrapping_sub(b)),
                op::IMUL => self.binop(|a, b| a.wrapping_mul(b)),
                op::IDIV => {
                    let rhs = self.pop_num();
                    let lhs = self.pop_num();
                    if rhs == 0 {
                        return Err(VmFault);
                    }
                    self.push(Value::Number(lhs.wrapping_div(rhs)));
                }
                op::IEQL => self.binop(|a, b| (a == b) as i64),
                op::INEQ => self.binop(|a, b| (a != b) as i64),
                op::ISHL => self.binop(|a, b| a.wrapping_shl(b as u32)),
                op::ISHR => self.binop(|a, b| a.wrapping_shr(b as u32)),
                op::ILT => self.binop(|a, b| (a < b) as i64),
                op::IGT => self.binop(|a, b| (a > b) as i64),
                op::OR => self.binop(|a, b| a | b),
                op::AND => self.binop(|a, b| a & b),
                op::XOR => self.binop(|a, b| a ^ b),
                op::NOT => {
                    let n = self.pop_num();
                    self.push(Value::Number(!n));
                }
                op::BANG => {
                    let n = self.pop_num();
                    self.push(Value::Number((n == 0) as i64));
                }
                op::SEQL | op::SNEQ => {
                    let rhs = self.pop();
                    let lhs = self.pop();
                    let eq = lhs.as_buffer().eql(rhs.as_buffer(), ctx.pool, ctx.ext);
                    let mut lhs = lhs;
                    let mut rhs = rhs;
                    lhs.release(ctx.pool);
                    rhs.release(ctx.pool);
                    let v = if opcode == op::SEQL { eq } else { !eq };
                    self.push(Value::Number(v as i64));
                }
                op::SCAT => {
                    let src = self.pop();
                    let data_bytes = src.as_buffer().to_vec(ctx.pool, ctx.ext);
                    let ok = {
                        let dst = self.top().as_buffer_mut();
                        dst.write(&data_bytes, ctx.pool, ctx.ext)
                    };
                    let mut src = src;
                    src.release(ctx.pool);
                    if !ok {
                        return Err(VmFault);
                    }
                }
                op::SLEN => {
                    let mut v = self.pop();
                    let len = v.as_buffer().size() as i64;
                    v.release(ctx.pool);
                    self.push(Value::Number(len));
                }
                op::SLCE => {
                    let end = self.pop_num();
                    let off = self.pop_num().max(0) as u32;
                    let mut b = *self.top().as_buffer();
                    let size = b.size() as u32;
                    if off >= size {
                        b.clear(ctx.pool);
                    } else {
                        b.off += off;
                        if end < 0 {
                            if (size as i64 + end) < off as i64 {
                                b.clear(ctx.pool);
                            } else {
                                b.len = (b.len as i64 + end - off as i64) as u32;
                            }
                        } else {
                            let end = (end as u32).clamp(off, size);
                            b.len = end - off;
                        }
                    }
                    *self.top().as_buffer_mut() = b;
                }
                op::JUMP => {
                    let d = read32(code, pc);
                    pc = (pc as i64 + d as i64) as usize;
                }
                op::BREZ => {
                    let take = self.top().as_number() == 0;
                    let d = if take { read32(code, pc) as i64 } else { 4 };
                    pc = (pc as i64 + d) as usize;
                    self.pop();
                }
                op::BREZNP => {
                    let take = self.top().as_number() == 0;
                    let d = if take { read32(code, pc) as i64 } else { 4 };
                    pc = (pc as i64 + d) as usize;
                }
                op::BRNEZNP => {
                    let take = self.top().as_number() != 0;
                    let d = if take { read32(code, pc) as i64 } else { 4 };
                    pc = (pc as i64 + d) as usize;
                }
                op::BTOI => {
                    let mut v = self.pop();
                    let bytes = v.as_buffer().to_vec(ctx.pool, ctx.ext);
                    v.release(ctx.pool);
                    let mut n: i64 = 0;
                    for b in bytes.iter().take(8) {
                        n = (n << 8) | *b as i64;
                    }
                    self.push(Value::Number(n));
                }
                op::ITOB => {
                    let n = self.pop_num();
                    let mut buf = Buffer::new();
                    let ok = if n != 0 {
                        let nbytes = ((64 - (n as u64).leading_zeros()) as usize + 7) / 8;
                        let be = n.to_be_bytes();
                        buf.write(&be[8 - nbytes..], ctx.pool, ctx.ext)
                    } else {
                        buf.write(&[0], ctx.pool, ctx.ext)
                    };
                    self.push(Value::Buf {
                        ty: ValueType::Binary,
                        buf,
                    });
                    if !ok {
                        return Err(VmFault);
                    }
                }
                op::ITOA => {
                    let n = self.pop_num();
                    let s = n.to_string();
                    let mut buf = Buffer::new();
                    let ok = buf.write(s.as_bytes(), ctx.pool, ctx.ext);
                    self.push(Value::Buf {
                        ty: ValueType::String,
                        buf,
                    });
                    if !ok {
                        return Err(VmFault);
                    }
                }
                op::ATOI | op::HTOI => {
                    let mut v = self.pop();
                    let bytes = v.as_buffer().to_vec(ctx.pool, ctx.ext);
                    v.release(ctx.pool);
                    let base = if opcode == op::ATOI { 10 } else { 16 };
                    self.push(Value::Number(strntod(&bytes, base)));
                }
                op::ATOB | op::BTOA => {
                    let v = self.pop();
                    let ty = if opcode == op::ATOB {
                        ValueType::Binary
                    } else {
                        ValueType::String
                    };
                    match v {
                        Value::Buf { buf, .. } => self.push(Value::Buf { ty, buf }),
                        n => self.push(n),
                    }
                }
                op::PRNT => {
                    let fmt_len = read32(code, pc).max(0) as usize;
                    pc += 4;
                    let fmt = code.get(pc..pc + fmt_len).unwrap_or(&[]).to_vec();
                    pc += fmt_len;
                    let argc = read32(code, pc).max(0) as usize;
                    pc += 4;
                    self.printf(&fmt, argc.min(self.stack.len()), ctx);
                }
                op::OFFSET => {
                    let which = read32(code, pc) as usize & 1;
                    pc += 4;
                    self.push(Value::Number(data.offset[which] as i64));
                }
                op::REMAINING => {
                    let len = buffer.as_ref().map_or(0, |b| b.len as i64);
                    self.push(Value::Number(len));
                }
                op::EXPECT => {
                    let sp = self.stack.len();
                    debug_assert!(sp >= 7);
                    let (proto, sport, dport, pc_hit, ttl) = (
                        self.stack[sp - 7].as_number(),
                        self.stack[sp - 5].as_number(),
                        self.stack[sp - 3].as_number(),
                        self.stack[sp - 2].as_number(),
                        self.stack[sp - 1].as_number(),
                    );
                    let saddr = self.stack[sp - 6].as_buffer().to_vec(ctx.pool, ctx.ext);
                    let daddr = self.stack[sp - 4].as_buffer().to_vec(ctx.pool, ctx.ext);
                    Self::flow_save(proto, &saddr, sport, &daddr, dport, pc_hit, ttl, ctx);
                    self.pop(); // ttl
                    self.pop(); // pc
                    self.pop(); // dport
                    self.pop_release(ctx.pool); // daddr
                    self.pop(); // sport
                    self.pop_release(ctx.pool); // saddr
                    self.pop(); // proto
                }
                op::DICT => {
                    let save = read32(code, pc);
                    pc += 4;
                    if save != 0 {
                        let sp = self.stack.len();
                        debug_assert!(sp >= 3);
                        let ttl_ms = self.stack[sp - 1].as_number().wrapping_mul(1000);
                        let key = *self.stack[sp - 3].as_buffer();
                        let val = *self.stack[sp - 2].as_buffer();
                        self.dict_save(&key, &val, ttl_ms, ctx);
                        self.pop(); // ttl
                        self.pop_release(ctx.pool); // val
                        self.pop_release(ctx.pool); // key
                    } else {
                        let key = *self.top().as_buffer();
                        let found = self.dict_find(&key, ctx);
                        let top = self.top().as_buffer_mut();
                        let mut old = *top;
                        old.release(ctx.pool);
                        *top = found;
                    }
                }
                op::TIME => {
                    self.push(Value::Number(ctx.timestamp as i64));
                }
                op::NOOP => {}
                _ => {
                    tracing::debug!(target: "rts_vm", opcode, "bad opcode");
                    return Err(VmFault);
                }
            }
        }
    }

    /// Runs each bytecode offset in function set `fun_id`, honoring a
    /// pending resume descriptor from an earlier partial skip.
    pub fn dispatch(
        &mut self,
        data: &mut ScanData,
        buffer: Option<&mut Buffer>,
        fun_id: u32,
        ctx: &mut VmCtx<'_>,
    ) -> VmResult {
        let length = ctx.bundle.ftab.set_len(fun_id);
        let (mut j, mut pc) = if self.resume != 0 {
            let j = self.resume >> 24;
            let pc = self.resume & 0x00ff_ffff;
            self.resume = 0;
            self.resume_fun = 0;
            (j, pc)
        } else {
            (0, 0)
        };

        let mut buffer = buffer;
        while j < length {
            if pc == 0 {
                pc = ctx.bundle.ftab.word(fun_id, j).unwrap_or(0);
            }
            if let Err(fault) = self.exec(pc as usize, data, buffer.as_deref_mut(), ctx) {
                data.state = 0;
                return Err(fault);
            }
            if self.resume != 0 {
                self.resume_fun = fun_id;
                debug_assert_eq!(self.resume & 0xff00_0000, 0);
                self.resume |= j << 24;
                break;
            }
            pc = 0;
            j += 1;
        }
        Ok(())
    }
}

fn scan_forward(
    vm: &mut Vm,
    data: &mut ScanData,
    buffer: &mut Buffer,
    ctx: &mut VmCtx<'_>,
) -> u32 {
    let start = buffer.off;
    let dir = (data.flags & DATA_FLAG_EXT) as u32;

    while !buffer.is_empty() {
        // In the middle of a skip
        if vm.resume_fun != 0 {
            let fun = vm.resume_fun;
            if vm.dispatch(data, Some(buffer), fun, ctx).is_err() {
                break;
            }
            continue;
        }

        let chr = buffer.at(ctx.pool, ctx.ext, 0) as u32 + (dir << 8);
        let edge = dfa::next(&ctx.bundle.dfa, &ctx.bundle.trans, data.state, chr);
        data.state = edge.dst;

        if edge.cap != 0 {
            let src = *buffer;
            vm.capture_table(edge.cap, &src, false, ctx);
        }

        data.offset[dir as usize] += 1;
        buffer.off += 1;
        buffer.len -= 1;

        if edge.fun != 0 {
            if vm.dispatch(data, Some(buffer), edge.fun, ctx).is_err() {
                break;
            }
        }

        if vm.resume != 0 {
            debug_assert!(buffer.is_empty());
        } else if data.state == 0 {
            break;
        }
    }
    buffer.off - start
}

fn scan_reverse(
    vm: &mut Vm,
    data: &mut ScanData,
    buffer: &mut Buffer,
    ctx: &mut VmCtx<'_>,
) -> u32 {
    let len = buffer.len;
    let dir = (data.flags & DATA_FLAG_EXT) as u32;

    // Walk right to left: the offset climbs to the window end and steps
    // back down so capture always observes a valid "before" window.
    buffer.off += len;

    loop {
        if buffer.is_empty() {
            let edge = dfa::next(&ctx.bundle.dfa, &ctx.bundle.trans, data.state, 0x00);
            data.state = edge.dst;
            if edge.fun != 0 {
                let _ = vm.dispatch(data, Some(buffer), edge.fun, ctx);
            }
            break;
        }

        let chr = buffer.at_rel(ctx.pool, ctx.ext, -1) as u32 + (dir << 8);
        let edge = dfa::next(&ctx.bundle.dfa, &ctx.bundle.trans, data.state, chr);
        data.state = edge.dst;

        if edge.cap != 0 {
            let src = *buffer;
            vm.capture_table(edge.cap, &src, true, ctx);
        }

        data.offset[dir as usize] += 1;
        buffer.off -= 1;
        buffer.len -= 1;

        if edge.fun != 0 && vm.dispatch(data, Some(buffer), edge.fun, ctx).is_err() {
            break;
        }
        if data.state == 0 {
            break;
        }
    }
    len - buffer.len
}

/// Primary scan facility: consume `buffer` through the DFA, then take the
/// synthetic end-of-packet edge if the state advertises one. A code fault
/// inside an edge function clamps the state to terminal rather than
/// propagating; the caller detects termination through the state.
pub fn scan_buffer(
    vm: &mut Vm,
    data: &mut ScanData,
    buffer: &mut Buffer,
    ctx: &mut VmCtx<'_>,
) -> u32 {
    let scanned = if data.flags & DATA_FLAG_INV != 0 {
        scan_reverse(vm, data, buffer, ctx)
    } else {
        scan_forward(vm, data, buffer, ctx)
    };

    if data.state != 0 && buffer.is_empty() {
        if let Some(edge) = dfa::eop(&ctx.bundle.dfa, &ctx.bundle.trans, data.state) {
            data.state = edge.dst;
            if edge.fun != 0 {
                let _ = vm.dispatch(data, Some(buffer), edge.fun, ctx);
            }
        }
    }

    scanned
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rts::bundle::Itab;
    use crate::rts::dfa::{States, Transitions};

    fn bundle_with_code(code: Vec<u8>) -> Arc<Bundle> {
        Arc::new(Bundle {
            generation: 1,
            code,
            numvars: 8,
            var_names: vec![None; 8],
            dfa: States::default(),
            trans: Transitions::default(),
            ctab: Itab::default(),
            ftab: Itab::default(),
            stab: Vec::new(),
            keys: Vec::new(),
        })
    }

    struct Rig {
        pool: Pool,
        dict: DictTable,
        flow: FlowTable,
    }

    impl Rig {
        fn new() -> Self {
            Rig {
                pool: Pool::new(64 * 1024),
                dict: LruHash::new(64, 30_000),
                flow: LruHash::new(64, 30_000),
            }
        }

        fn run(&mut self, code: Vec<u8>) -> Vm {
            self.run_at(code, 0, 100)
        }

        fn run_at(&mut self, code: Vec<u8>, pc: usize, timestamp: u64) -> Vm {
            let bundle = bundle_with_code(code);
            let mut vm = Vm::new(1);
            let mut data = ScanData::init(1);
            let queue = crate::rts::mpmc::Queue::new();
            let subs: SubRegistry = Mutex::new(FxHashMap::default());
            let mut ctx = VmCtx {
                pool: &mut self.pool,
                bundle,
                dict: &mut self.dict,
                flow: &mut self.flow,
                timestamp,
                subs: &subs,
                queue: &queue,
                pid: 1,
                user: None,
                ext: None,
            };
            vm.exec(pc, &mut data, None, &mut ctx).unwrap();
            vm
        }
    }

    fn imm32(v: i32) -> [u8; 4] {
        v.to_be_bytes()
    }

    #[test]
    fn arithmetic_and_comparison() {
        let mut rig = Rig::new();
        // 7 * 6 == 42
        let mut code = vec![op::PNUM1, 7, op::PNUM1, 6, op::IMUL];
        code.push(op::PNUM1);
        code.push(42);
        code.push(op::IEQL);
        code.push(op::HALT);
        let mut vm = rig.run(code);
        assert_eq!(vm.pop_value().unwrap().as_number(), 1);
    }

    #[test]
    fn division_by_zero_faults() {
        let mut rig = Rig::new();
        let code = vec![op::PNUM1, 1, op::PNUM1, 0, op::IDIV, op::HALT];
        let bundle = bundle_with_code(code);
        let mut vm = Vm::new(1);
        let mut data = ScanData::init(1);
        let queue = crate::rts::mpmc::Queue::new();
        let subs: SubRegistry = Mutex::new(FxHashMap::default());
        let mut ctx = VmCtx {
            pool: &mut rig.pool,
            bundle,
            dict: &mut rig.dict,
            flow: &mut rig.flow,
            timestamp: 0,
            subs: &subs,
            queue: &queue,
            pid: 1,
            user: None,
            ext: None,
        };
        assert!(vm.exec(0, &mut data, None, &mut ctx).is_err());
        vm.exit(&mut rig.pool);
    }

    #[test]
    fn string_concat_length_and_slice() {
        let mut rig = Rig::new();
        let mut code = Vec::new();
        // "net" + "flow", slice [1..5), length
        code.push(op::PSTR);
        code.extend_from_slice(&imm32(3));
        code.extend_from_slice(b"net");
        code.push(op::PSTR);
        code.extend_from_slice(&imm32(4));
        code.extend_from_slice(b"flow");
        code.push(op::SCAT);
        code.push(op::PNUM1);
        code.push(1);
        code.push(op::PNUM1);
        code.push(5);
        code.push(op::SLCE);
        code.push(op::SLEN);
        code.push(op::HALT);
        let mut vm = rig.run(code);
        assert_eq!(vm.pop_value().unwrap().as_number(), 4);
    }

    #[test]
    fn string_equality_consumes_operands() {
        let mut rig = Rig::new();
        let mut code = Vec::new();
        code.push(op::PSTR);
        code.extend_from_slice(&imm32(2));
        code.extend_from_slice(b"ab");
        code.push(op::PSTR);
        code.extend_from_slice(&imm32(2));
        code.extend_from_slice(b"ab");
        code.push(op::SEQL);
        code.push(op::HALT);
        let mut vm = rig.run(code);
        assert_eq!(vm.pop_value().unwrap().as_number(), 1);
        assert!(vm.pop_value().is_none());
        assert_eq!(rig.pool.stats().curr_alloc, 0);
    }

    #[test]
    fn conversions_round_trip() {
        let mut rig = Rig::new();
        // itoa then atoi returns the original number
        let mut code = Vec::new();
        code.push(op::PNUM2);
        code.extend_from_slice(&1234i16.to_be_bytes());
        code.push(op::ITOA);
        code.push(op::ATOI);
        code.push(op::HALT);
        let mut vm = rig.run(code);
        assert_eq!(vm.pop_value().unwrap().as_number(), 1234);

        // itob then btoi as well
        let mut code = Vec::new();
        code.push(op::PNUM4);
        code.extend_from_slice(&imm32(0x00c0ffee));
        code.push(op::ITOB);
        code.push(op::BTOI);
        code.push(op::HALT);
        let mut vm = rig.run(code);
        assert_eq!(vm.pop_value().unwrap().as_number(), 0x00c0ffee);
    }

    #[test]
    fn hex_ascii_to_integer() {
        let mut rig = Rig::new();
        let mut code = Vec::new();
        code.push(op::PSTR);
        code.extend_from_slice(&imm32(4));
        code.extend_from_slice(b"dead");
        code.push(op::HTOI);
        code.push(op::HALT);
        let mut vm = rig.run(code);
        assert_eq!(vm.pop_value().unwrap().as_number(), 0xdead);
    }

    #[test]
    fn branch_if_zero_pops_and_jumps() {
        let mut rig = Rig::new();
        // BREZ over a PNUM1 9; lands on PNUM1 5
        let mut code = Vec::new();
        code.push(op::PNUM1);
        code.push(0);
        code.push(op::BREZ);
        code.extend_from_slice(&imm32(4 + 2)); // immediate + skipped push
        code.push(op::PNUM1);
        code.push(9);
        code.push(op::PNUM1);
        code.push(5);
        code.push(op::HALT);
        let mut vm = rig.run(code);
        assert_eq!(vm.pop_value().unwrap().as_number(), 5);
        assert!(vm.pop_value().is_none());
    }

    #[test]
    fn time_pushes_the_handle_timestamp() {
        let mut rig = Rig::new();
        let code = vec![op::TIME, op::HALT];
        let mut vm = rig.run_at(code, 0, 777);
        assert_eq!(vm.pop_value().unwrap().as_number(), 777);
    }

    #[test]
    fn dict_save_then_find() {
        let mut rig = Rig::new();
        let mut code = Vec::new();
        // save: key "k", val "v", ttl 5s
        code.push(op::PSTR);
        code.extend_from_slice(&imm32(1));
        code.push(b'k');
        code.push(op::PSTR);
        code.extend_from_slice(&imm32(1));
        code.push(b'v');
        code.push(op::PNUM1);
        code.push(5);
        code.push(op::DICT);
        code.extend_from_slice(&imm32(1));
        // find: key "k" replaced by stored value
        code.push(op::PSTR);
        code.extend_from_slice(&imm32(1));
        code.push(b'k');
        code.push(op::DICT);
        code.extend_from_slice(&imm32(0));
        code.push(op::SLEN);
        code.push(op::HALT);
        let mut vm = rig.run(code);
        assert_eq!(vm.pop_value().unwrap().as_number(), 1);
        assert_eq!(rig.dict.len(), 1);
    }

    #[test]
    fn expect_installs_a_trap() {
        let mut rig = Rig::new();
        let mut code = Vec::new();
        code.push(op::PNUM1);
        code.push(17);
        code.push(op::PBIN);
        code.extend_from_slice(&imm32(0));
        code.push(op::PNUM1);
        code.push(0);
        code.push(op::PBIN);
        code.extend_from_slice(&imm32(4));
        code.extend_from_slice(&[10, 0, 0, 1]);
        code.push(op::PNUM2);
        code.extend_from_slice(&53i16.to_be_bytes());
        code.push(op::PNUM4);
        code.extend_from_slice(&imm32(99));
        code.push(op::PNUM1);
        code.push(30);
        code.push(op::EXPECT);
        code.push(op::HALT);
        let mut vm = rig.run(code);
        assert!(vm.pop_value().is_none());
        assert_eq!(rig.flow.len(), 1);
        // trap memory is charged to the pool
        assert!(rig.pool.stats().curr_alloc > 0);
    }

    #[test]
    fn shared_memory_read() {
        let mut rig = Rig::new();
        let bundle = bundle_with_code(vec![op::SHMR, 0, 0, 0, 3, op::SLEN, op::HALT]);
        let mut vm = Vm::new(1);
        let mut data = ScanData::init(1);
        let queue = crate::rts::mpmc::Queue::new();
        let subs: SubRegistry = Mutex::new(FxHashMap::default());
        let mut ctx = VmCtx {
            pool: &mut rig.pool,
            bundle,
            dict: &mut rig.dict,
            flow: &mut rig.flow,
            timestamp: 0,
            subs: &subs,
            queue: &queue,
            pid: 1,
            user: None,
            ext: None,
        };
        // region 0 backs region 3 through a zero-copy window
        let block = vm.shm_get(0, 8, ctx.pool).unwrap();
        ctx.pool.block_bytes_mut(block)[..8].copy_from_slice(b"abcdefgh");
        let mut off = 2;
        vm.shm_zcopy(block, 3, &mut off, 4, ctx.pool);

        vm.exec(0, &mut data, None, &mut ctx).unwrap();
        assert_eq!(vm.pop_value().unwrap().as_number(), 4);
        vm.exit(&mut rig.pool);
        assert_eq!(rig.pool.stats().curr_alloc, 0);
    }
}
