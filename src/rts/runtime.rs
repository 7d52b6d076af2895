//! RTS runtime context: the fan-out queue, the active bundle slot, and the
//! subscription registry. Handles attach to a runtime; each handle owns a
//! private arena, dictionary and trap tables, and a queue consumer
//! position. Everything process-wide in the original design is a field
//! here so tests can stand up a runtime per case.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::error::{FlowError, Result};
use crate::rts::buffer::Buffer;
use crate::rts::bundle::{self, Bundle};
use crate::rts::ipaddr::IpAddrKey;
use crate::rts::lruhash::LruHash;
use crate::rts::mpmc::{Queue, QueueHandle, QueueMsg};
use crate::rts::pool::{BlockId, Pool};
use crate::rts::trap::{self, FlowTable};
use crate::rts::vm::{
    scan_buffer, DictTable, ScanData, SubCallback, SubRegistry, UserData, Vm, VmCtx,
    DATA_FLAG_EXT,
};
use crate::rts::{
    DICT_HASH_BUCKETS, DICT_HASH_EXPIRY_MS, FLOW_HASH_BUCKETS, FLOW_HASH_EXPIRY_MS,
    HANDLE_MEMORY_SIZE,
};

pub use crate::rts::vm::{SubEvent, SubValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    None,
    Inet,
    Inet6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// client to server (connection initiator sent the bytes)
    ToServer,
    /// server to client
    ToClient,
}

/// Resource usage counters, reset on read so callers can accumulate.
#[derive(Debug, Default, Clone, Copy)]
pub struct Rusage {
    pub curr_alloc: u32,
    pub peak_alloc: u32,
    pub fail_alloc: u32,
    pub mpmc_events: u32,
    pub scan_started: u32,
    pub scan_stopped: u32,
    pub scan_bytes: u32,
}

struct BundleSlot {
    active: Option<Arc<Bundle>>,
    loads: u32,
}

pub struct RtsRuntime {
    queue: Queue,
    slot: Mutex<BundleSlot>,
    subs: SubRegistry,
}

impl Default for RtsRuntime {
    fn default() -> Self {
        RtsRuntime::new()
    }
}

impl RtsRuntime {
    pub fn new() -> Self {
        RtsRuntime {
            queue: Queue::new(),
            slot: Mutex::new(BundleSlot {
                active: None,
                loads: 0,
            }),
            subs: Mutex::new(FxHashMap::default()),
        }
    }

    /// Loads a signature bundle and installs it as the active bundle. Live
    /// handles pick up the swap through the queue; the old bundle is
    /// released when the last reference drops. `None` unloads.
    pub fn load(&self, image: Option<&[u8]>) -> Result<()> {
        let Some(image) = image else {
            let mut slot = self.slot.lock();
            if slot.active.is_none() {
                return Err(FlowError::InvalidArg("no bundle loaded".into()));
            }
            slot.active = None;
            self.queue.with_lock(|g| {
                if g.consumer_count() > 0 {
                    g.push(0, QueueMsg::Bundle(None));
                }
            });
            return Ok(());
        };

        let generation = {
            let mut slot = self.slot.lock();
            slot.loads += 1;
            slot.loads
        };
        let bundle = Arc::new(bundle::load(image, generation)?);

        let mut slot = self.slot.lock();
        self.queue.with_lock(|g| {
            if g.consumer_count() > 0 {
                g.push(0, QueueMsg::Bundle(Some(bundle.clone())));
            }
        });
        slot.active = Some(bundle);
        Ok(())
    }

    pub fn loaded(&self) -> bool {
        self.slot.lock().active.is_some()
    }

    /// Subscribes to a key exported by the loaded signatures. The callback
    /// fires on every export-flagged store to the key's variable.
    pub fn subscribe(&self, key: &str, callback: SubCallback) -> Result<()> {
        let slot = self.slot.lock();
        let Some(bundle) = slot.active.as_ref() else {
            return Err(FlowError::NoSignature);
        };
        let Some(guid) = bundle.resolve_key(key) else {
            return Err(FlowError::UnknownKey(key.to_string()));
        };
        let Some(mut subs) = self.subs.try_lock() else {
            return Err(FlowError::Busy);
        };
        subs.insert(guid, callback);
        Ok(())
    }

    pub fn unsubscribe(&self, key: &str) -> Result<()> {
        let slot = self.slot.lock();
        let Some(bundle) = slot.active.as_ref() else {
            return Err(FlowError::NoSignature);
        };
        let Some(guid) = bundle.resolve_key(key) else {
            return Err(FlowError::UnknownKey(key.to_string()));
        };
        let Some(mut subs) = self.subs.try_lock() else {
            return Err(FlowError::Busy);
        };
        subs.remove(&guid);
        Ok(())
    }

    /// Service-name lookup by index against the current load, or against
    /// the stream's load when one is supplied. Index -1 returns the count.
    pub fn lookup(&self, index: i32, stream: Option<&RtsStream>) -> Result<LookupAnswer> {
        let slot = self.slot.lock();
        let Some(bundle) = slot.active.as_ref() else {
            return Err(FlowError::InvalidArg("no bundle loaded".into()));
        };
        if let Some(stream) = stream {
            if stream.vm.generation != bundle.generation {
                return Err(FlowError::InvalidArg(
                    "stream belongs to a previous load".into(),
                ));
            }
        }
        if index < 0 {
            return Ok(LookupAnswer::Count(bundle.service_count()));
        }
        bundle
            .service_name(index as usize)
            .map(|s| LookupAnswer::Name(s.to_string()))
            .ok_or_else(|| FlowError::InvalidArg(format!("service index {index} out of range")))
    }

    pub fn handle_create(self: &Arc<Self>) -> Result<RtsHandle> {
        RtsHandle::create(self.clone(), HANDLE_MEMORY_SIZE)
    }

    pub fn handle_create_sized(self: &Arc<Self>, memory_size: usize) -> Result<RtsHandle> {
        RtsHandle::create(self.clone(), memory_size)
    }

    fn active_bundle(&self) -> Option<Arc<Bundle>> {
        self.slot.lock().active.clone()
    }
}

#[derive(Debug, Clone)]
pub enum LookupAnswer {
    Count(usize),
    Name(String),
}

/// The owner of scanning resources. Single-writer: all stream operations
/// go through a mutable borrow of their handle.
pub struct RtsHandle {
    runtime: Arc<RtsRuntime>,
    pool: Pool,
    dict: DictTable,
    flow: FlowTable,
    bundle: Option<Arc<Bundle>>,
    mqh: QueueHandle,
    timestamp: u64,
    scan_started: u32,
    scan_stopped: u32,
    scan_bytes: u32,
}

impl RtsHandle {
    fn create(runtime: Arc<RtsRuntime>, memory_size: usize) -> Result<Self> {
        if memory_size == 0 {
            return Err(FlowError::InvalidArg("handle memory size is zero".into()));
        }
        let mqh = runtime.queue.handle_init();
        let bundle = runtime.active_bundle();
        Ok(RtsHandle {
            runtime,
            pool: Pool::new(memory_size),
            dict: LruHash::new(DICT_HASH_BUCKETS, DICT_HASH_EXPIRY_MS),
            flow: LruHash::new(FLOW_HASH_BUCKETS, FLOW_HASH_EXPIRY_MS),
            bundle,
            mqh,
            timestamp: 0,
            scan_started: 0,
            scan_stopped: 0,
            scan_bytes: 0,
        })
    }

    pub fn rusage(&mut self) -> Rusage {
        let stats = self.pool.stats();
        let usage = Rusage {
            curr_alloc: stats.curr_alloc as u32,
            peak_alloc: stats.peak_alloc as u32,
            fail_alloc: self.pool.take_fail_alloc(),
            mpmc_events: self.mqh.take_events(),
            scan_started: std::mem::take(&mut self.scan_started),
            scan_stopped: std::mem::take(&mut self.scan_stopped),
            scan_bytes: std::mem::take(&mut self.scan_bytes),
        };
        self.pool.reset_peak();
        usage
    }

    /// Drains pending queue messages into this handle's state.
    fn dispatch_messages(&mut self) {
        while let Some(msg) = self.mqh.poll() {
            match msg {
                QueueMsg::Bundle(next) => {
                    if self.bundle.take().is_some() {
                        // flush traps installed against the old load
                        let drained = self.flow.drain();
                        for rec in drained {
                            if let Some(mem) = rec.mem {
                                self.pool.block_put(mem);
                            }
                        }
                    }
                    self.bundle = next;
                }
                QueueMsg::DictSave { key, val, ttl_ms } => {
                    let Some(bundle) = self.bundle.clone() else {
                        continue;
                    };
                    let mut ctx = VmCtx {
                        pool: &mut self.pool,
                        bundle,
                        dict: &mut self.dict,
                        flow: &mut self.flow,
                        timestamp: self.timestamp,
                        subs: &self.runtime.subs,
                        queue: &self.runtime.queue,
                        pid: self.mqh.pid(),
                        user: None,
                        ext: None,
                    };
                    Vm::apply_dict_msg(&key, &val, ttl_ms, &mut ctx);
                }
                QueueMsg::FlowSave { entry, ttl_ms } => {
                    let Some(bundle) = self.bundle.clone() else {
                        continue;
                    };
                    let mut ctx = VmCtx {
                        pool: &mut self.pool,
                        bundle,
                        dict: &mut self.dict,
                        flow: &mut self.flow,
                        timestamp: self.timestamp,
                        subs: &self.runtime.subs,
                        queue: &self.runtime.queue,
                        pid: self.mqh.pid(),
                        user: None,
                        ext: None,
                    };
                    Vm::apply_flow_msg(entry, ttl_ms, &mut ctx);
                }
            }
        }
    }

    fn ctx_with<'a>(
        &'a mut self,
        bundle: Arc<Bundle>,
        user: UserData,
        ext: Option<&'a [u8]>,
    ) -> VmCtx<'a> {
        VmCtx {
            pool: &mut self.pool,
            bundle,
            dict: &mut self.dict,
            flow: &mut self.flow,
            timestamp: self.timestamp,
            subs: &self.runtime.subs,
            queue: &self.runtime.queue,
            pid: self.mqh.pid(),
            user,
            ext,
        }
    }

    /// Initializes a stream for scanning. Addresses are in network byte
    /// order; lengths follow the domain. The trap table is consulted and a
    /// matching trap's code runs against the fresh stream.
    #[allow(clippy::too_many_arguments)]
    pub fn stream_create(
        &mut self,
        domain: Domain,
        proto: u8,
        saddr: &[u8],
        sport: u16,
        daddr: &[u8],
        dport: u16,
        user: UserData,
    ) -> Result<RtsStream> {
        self.dispatch_messages();

        let Some(bundle) = self.bundle.clone() else {
            return Err(FlowError::NoSignature);
        };

        let addrlen = match domain {
            Domain::Inet => 4,
            Domain::Inet6 => 16,
            Domain::None => 0,
        };
        if addrlen != 0 && (saddr.len() != addrlen || daddr.len() != addrlen) {
            return Err(FlowError::InvalidArg("address length mismatch".into()));
        }
        if proto as usize >= bundle.dfa.ran.len() {
            return Err(FlowError::InvalidArg(format!(
                "protocol {proto} not supported by the loaded signatures"
            )));
        }

        let (skey, dkey) = if addrlen == 0 {
            (IpAddrKey::unspec(), IpAddrKey::unspec())
        } else {
            (
                IpAddrKey::from_slice(saddr)
                    .ok_or_else(|| FlowError::InvalidArg("bad source address".into()))?,
                IpAddrKey::from_slice(daddr)
                    .ok_or_else(|| FlowError::InvalidArg("bad destination address".into()))?,
            )
        };

        // The stream's bookkeeping is charged to the pool so creation
        // fails once the arena is exhausted.
        let Some(mem) = self.pool.alloc_block(std::mem::size_of::<RtsStream>()) else {
            return Err(FlowError::OutOfMemory);
        };

        self.scan_started += 1;

        let mut stream = RtsStream {
            data: ScanData::init(proto as u32),
            vm: Vm::new(bundle.generation),
            user: user.clone(),
            mem: Some(mem),
        };

        {
            let mut ctx = self.ctx_with(bundle.clone(), user.clone(), None);
            Vm::flow_expire(&mut ctx);
        }

        let trap_hit = trap::ft_find(
            &self.flow,
            proto as u16,
            &skey,
            sport,
            &dkey,
            dport,
            self.timestamp,
        );

        // Shared memory regions: 0 holds the packed tuple, 1-4 window it.
        {
            let mut ctx = self.ctx_with(bundle.clone(), user.clone(), None);
            let size = addrlen * 2 + 4;
            if let Some(block) = stream.vm.shm_get(0, size, ctx.pool) {
                let bytes = ctx.pool.block_bytes_mut(block);
                let mut at = 0;
                bytes[at..at + addrlen].copy_from_slice(&saddr[..addrlen]);
                at += addrlen;
                bytes[at..at + addrlen].copy_from_slice(&daddr[..addrlen]);
                at += addrlen;
                bytes[at..at + 2].copy_from_slice(&sport.to_be_bytes());
                at += 2;
                bytes[at..at + 2].copy_from_slice(&dport.to_be_bytes());
                let mut off = 0u32;
                stream.vm.shm_zcopy(block, 1, &mut off, addrlen as u32, ctx.pool);
                stream.vm.shm_zcopy(block, 2, &mut off, addrlen as u32, ctx.pool);
                stream.vm.shm_zcopy(block, 3, &mut off, 2, ctx.pool);
                stream.vm.shm_zcopy(block, 4, &mut off, 2, ctx.pool);
            }
        }

        // Run main
        {
            let mut ctx = self.ctx_with(bundle.clone(), user.clone(), None);
            let _ = stream.vm.exec(0, &mut stream.data, None, &mut ctx);
        }

        // A matching trap runs its code; the value it leaves decides the
        // trap's fate: negative deletes, zero keeps, positive resets ttl.
        if let Some(id) = trap_hit {
            let pc = self.flow.get(id).map(|rec| rec.entry.pc).unwrap_or(0);
            if pc != 0 {
                let mut ctx = self.ctx_with(bundle, user, None);
                let _ = stream.vm.exec(pc as usize, &mut stream.data, None, &mut ctx);
                if let Some(v) = stream.vm.pop_value() {
                    let ttl = v.as_number();
                    if ttl < 0 {
                        if let Some(rec) = self.flow.remove(id) {
                            if let Some(mem) = rec.mem {
                                self.pool.block_put(mem);
                            }
                        }
                    } else if ttl > 0 {
                        let ttl_ms =
                            (ttl as u64).saturating_mul(1000).min(u32::MAX as u64) as u32;
                        self.flow.set_ttl(id, ttl_ms, self.timestamp);
                    }
                }
            }
        }

        Ok(stream)
    }

    /// Scans payload bytes. Returns the number of bytes consumed; zero once
    /// the stream stopped matching. The timestamp is in milliseconds and
    /// drives table expiry.
    pub fn stream_scan(
        &mut self,
        stream: &mut RtsStream,
        buf: &[u8],
        dir: Direction,
        timestamp_ms: u64,
    ) -> Result<usize> {
        self.timestamp = timestamp_ms;
        self.dispatch_messages();

        let Some(bundle) = self.bundle.clone() else {
            return Err(FlowError::InvalidArg("no signature bundle loaded".into()));
        };

        if stream.data.state == 0 {
            return Ok(0);
        }

        // Bundle was updated mid-stream; the stream goes terminal.
        if stream.vm.generation != bundle.generation {
            stream.vm.exit(&mut self.pool);
            stream.data.state = 0;
            return Ok(0);
        }

        match dir {
            Direction::ToClient => stream.data.flags |= DATA_FLAG_EXT,
            Direction::ToServer => stream.data.flags &= !DATA_FLAG_EXT,
        }

        let ext_block = self.pool.external_block(buf.len());
        let mut buffer = Buffer::from_block(&mut self.pool, ext_block, 0, buf.len() as u32);

        let user = stream.user.clone();
        let scanned = {
            let mut ctx = self.ctx_with(bundle, user, Some(buf));
            scan_buffer(&mut stream.vm, &mut stream.data, &mut buffer, &mut ctx)
        };

        buffer.release(&mut self.pool);

        // Project buffers still referencing the packet into pool memory.
        let mut failed = false;
        if self.pool.block_refs(ext_block) > 1 {
            if stream
                .vm
                .sync_heap(&mut self.pool, Some(buf))
                .is_err()
            {
                failed = true;
            }
            debug_assert!(failed || self.pool.block_refs(ext_block) == 1);
        }
        self.pool.block_put(ext_block);

        if stream.data.state == 0 || failed {
            stream.vm.exit(&mut self.pool);
            stream.data.state = 0;
            if failed {
                return Err(FlowError::OutOfMemory);
            }
        }

        self.scan_bytes += scanned;
        Ok(scanned as usize)
    }

    /// True while the stream can still make classification progress.
    pub fn stream_matching(&self, stream: &RtsStream) -> bool {
        stream.data.state != 0
    }

    /// Releases the stream's resources. Always safe, even mid-scan.
    pub fn stream_destroy(&mut self, mut stream: RtsStream) {
        self.scan_stopped += 1;
        stream.vm.exit(&mut self.pool);
        stream.data.state = 0;
        if let Some(mem) = stream.mem.take() {
            self.pool.block_put(mem);
        }
    }
}

impl Drop for RtsHandle {
    fn drop(&mut self) {
        // drain our view of the queue and release table storage
        self.dispatch_messages();
        let dict = self.dict.drain();
        for mut rec in dict {
            rec.key.release(&mut self.pool);
            rec.val.release(&mut self.pool);
        }
        let flow = self.flow.drain();
        for rec in flow {
            if let Some(mem) = rec.mem {
                self.pool.block_put(mem);
            }
        }
        let handle = std::mem::replace(&mut self.mqh, QueueHandle::detached());
        self.runtime.queue.handle_exit(handle);
    }
}

/// A stream tracks one bidirectional flow through the classifier.
pub struct RtsStream {
    data: ScanData,
    vm: Vm,
    user: UserData,
    mem: Option<BlockId>,
}

impl RtsStream {
    pub fn generation(&self) -> u32 {
        self.vm.generation
    }
}

impl std::fmt::Debug for RtsStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtsStream")
            .field("data", &self.data)
            .field("vm", &self.vm)
            .field("mem", &self.mem)
            .finish()
    }
}
