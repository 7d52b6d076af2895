#![forbid(unsafe_code)]
//! Per-handle arena allocator. The unit is a 32-byte slob; allocations that
//! exceed one slob take a linear run of adjacent slobs so a span can be
//! returned to the free list in one walk. The pool never grows.

/// Smallest allocation unit in bytes.
pub const SLOB_SIZE: usize = 32;

#[derive(Debug, Default, Clone, Copy)]
pub struct PoolStats {
    /// current bytes allocated
    pub curr_alloc: usize,
    /// peak bytes allocated
    pub peak_alloc: usize,
    /// allocation failures
    pub fail_alloc: u32,
}

/// Identifies a refcounted data block handed out by the pool. Blocks back
/// the copy-on-write buffers; an `External` block is a window into packet
/// memory that lives only for the duration of a scan call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockId(u32);

#[derive(Debug, Clone, Copy)]
enum BlockStore {
    InPool { start: u32, nslobs: u32 },
    External { len: u32 },
}

#[derive(Debug)]
struct Block {
    refs: u32,
    store: BlockStore,
}

pub struct Pool {
    data: Vec<u8>,
    /// true = slob is on the free list
    free: Vec<bool>,
    /// stack of candidate free slobs; entries may be stale after span grabs
    free_stack: Vec<u32>,
    nslobs: u32,
    blocks: Vec<Option<Block>>,
    block_free: Vec<u32>,
    stats: PoolStats,
}

fn nslobs_for(size: usize) -> u32 {
    (size.max(1).div_ceil(SLOB_SIZE)) as u32
}

impl Pool {
    pub fn new(size_bytes: usize) -> Self {
        let nslobs = (size_bytes / SLOB_SIZE) as u32;
        Pool {
            data: vec![0u8; nslobs as usize * SLOB_SIZE],
            free: vec![true; nslobs as usize],
            free_stack: (0..nslobs).rev().collect(),
            nslobs,
            blocks: Vec::new(),
            block_free: Vec::new(),
            stats: PoolStats::default(),
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.stats
    }

    /// Peak counter is reset to the current level after a rusage read.
    pub fn reset_peak(&mut self) {
        self.stats.peak_alloc = self.stats.curr_alloc;
    }

    pub fn take_fail_alloc(&mut self) -> u32 {
        std::mem::take(&mut self.stats.fail_alloc)
    }

    fn charge(&mut self, nslobs: u32) {
        self.stats.curr_alloc += nslobs as usize * SLOB_SIZE;
        self.stats.peak_alloc = self.stats.peak_alloc.max(self.stats.curr_alloc);
    }

    fn credit(&mut self, nslobs: u32) {
        debug_assert!(self.stats.curr_alloc >= nslobs as usize * SLOB_SIZE);
        self.stats.curr_alloc -= nslobs as usize * SLOB_SIZE;
    }

    fn grab_single(&mut self) -> Option<u32> {
        while let Some(idx) = self.free_stack.pop() {
            if self.free[idx as usize] {
                self.free[idx as usize] = false;
                return Some(idx);
            }
        }
        None
    }

    /// Linear scan for a run of `n` adjacent free slobs.
    fn grab_span(&mut self, n: u32) -> Option<u32> {
        let mut run = 0u32;
        let mut start = 0u32;
        for idx in 0..self.nslobs {
            if self.free[idx as usize] {
                if run == 0 {
                    start = idx;
                }
                run += 1;
                if run == n {
                    for s in start..start + n {
                        self.free[s as usize] = false;
                    }
                    return Some(start);
                }
            } else {
                run = 0;
            }
        }
        None
    }

    fn release_span(&mut self, start: u32, nslobs: u32) {
        for idx in start..start + nslobs {
            debug_assert!(!self.free[idx as usize]);
            self.free[idx as usize] = true;
            self.free_stack.push(idx);
        }
    }

    fn alloc_span(&mut self, size: usize) -> Option<(u32, u32)> {
        let n = nslobs_for(size);
        let start = if n == 1 {
            self.grab_single()
        } else {
            self.grab_span(n)
        };
        match start {
            Some(start) => {
                self.charge(n);
                Some((start, n))
            }
            None => {
                self.stats.fail_alloc += 1;
                None
            }
        }
    }

    fn install_block(&mut self, block: Block) -> BlockId {
        if let Some(slot) = self.block_free.pop() {
            self.blocks[slot as usize] = Some(block);
            BlockId(slot)
        } else {
            self.blocks.push(Some(block));
            BlockId(self.blocks.len() as u32 - 1)
        }
    }

    /// Allocates a pool-backed data block with an initial refcount of 1.
    pub fn alloc_block(&mut self, size: usize) -> Option<BlockId> {
        let (start, nslobs) = self.alloc_span(size)?;
        Some(self.install_block(Block {
            refs: 1,
            store: BlockStore::InPool { start, nslobs },
        }))
    }

    /// Registers an external data block (packet memory) with refcount 1.
    /// External blocks consume no pool space; they must be gone (refcount
    /// back to 1 and released) before the scan call returns.
    pub fn external_block(&mut self, len: usize) -> BlockId {
        self.install_block(Block {
            refs: 1,
            store: BlockStore::External { len: len as u32 },
        })
    }

    fn block(&self, id: BlockId) -> &Block {
        self.blocks[id.0 as usize]
            .as_ref()
            .unwrap_or_else(|| panic!("stale block id {}", id.0))
    }

    pub fn block_get(&mut self, id: BlockId) {
        let b = self.blocks[id.0 as usize].as_mut().expect("stale block id");
        b.refs += 1;
    }

    /// Drops one reference; frees the span when the count hits zero.
    pub fn block_put(&mut self, id: BlockId) {
        let b = self.blocks[id.0 as usize].as_mut().expect("stale block id");
        debug_assert!(b.refs > 0);
        b.refs -= 1;
        if b.refs == 0 {
            let store = b.store;
            self.blocks[id.0 as usize] = None;
            self.block_free.push(id.0);
            if let BlockStore::InPool { start, nslobs } = store {
                self.credit(nslobs);
                self.release_span(start, nslobs);
            }
        }
    }

    pub fn block_refs(&self, id: BlockId) -> u32 {
        self.block(id).refs
    }

    pub fn block_is_external(&self, id: BlockId) -> bool {
        matches!(self.block(id).store, BlockStore::External { .. })
    }

    pub fn block_capacity(&self, id: BlockId) -> usize {
        match self.block(id).store {
            BlockStore::InPool { nslobs, .. } => nslobs as usize * SLOB_SIZE,
            BlockStore::External { len } => len as usize,
        }
    }

    /// Grows a pool block in place when the adjacent slobs are free,
    /// falling back to allocate-copy-free. Shared blocks must not be
    /// reallocated; callers copy-on-write first.
    pub fn realloc_block(&mut self, id: BlockId, new_size: usize) -> bool {
        let (start, nslobs) = match self.block(id).store {
            BlockStore::InPool { start, nslobs } => (start, nslobs),
            BlockStore::External { .. } => panic!("realloc of external block"),
        };
        debug_assert_eq!(self.block(id).refs, 1);
        let want = nslobs_for(new_size);
        if want <= nslobs {
            return true;
        }

        // Extension in place
        let extra = want - nslobs;
        let tail = start + nslobs;
        if tail + extra <= self.nslobs
            && (tail..tail + extra).all(|i| self.free[i as usize])
        {
            for i in tail..tail + extra {
                self.free[i as usize] = false;
            }
            self.charge(extra);
            if let Some(b) = self.blocks[id.0 as usize].as_mut() {
                b.store = BlockStore::InPool {
                    start,
                    nslobs: want,
                };
            }
            return true;
        }

        // Allocate-copy-free
        let Some((new_start, new_n)) = self.alloc_span(new_size) else {
            return false;
        };
        let src = start as usize * SLOB_SIZE;
        let dst = new_start as usize * SLOB_SIZE;
        let len = nslobs as usize * SLOB_SIZE;
        self.data.copy_within(src..src + len, dst);
        self.credit(nslobs);
        self.release_span(start, nslobs);
        if let Some(b) = self.blocks[id.0 as usize].as_mut() {
            b.store = BlockStore::InPool {
                start: new_start,
                nslobs: new_n,
            };
        }
        true
    }

    /// Pool-backed block bytes. External blocks have no storage here; the
    /// caller resolves those against the scan input slice.
    pub fn block_bytes(&self, id: BlockId) -> &[u8] {
        match self.block(id).store {
            BlockStore::InPool { start, nslobs } => {
                let s = start as usize * SLOB_SIZE;
                &self.data[s..s + nslobs as usize * SLOB_SIZE]
            }
            BlockStore::External { .. } => panic!("external block has no pool bytes"),
        }
    }

    pub fn block_bytes_mut(&mut self, id: BlockId) -> &mut [u8] {
        match self.block(id).store {
            BlockStore::InPool { start, nslobs } => {
                let s = start as usize * SLOB_SIZE;
                &mut self.data[s..s + nslobs as usize * SLOB_SIZE]
            }
            BlockStore::External { .. } => panic!("external block has no pool bytes"),
        }
    }
}
