#![forbid(unsafe_code)]
//! Copy-on-write buffer. A buffer is a value type with shared storage: an
//! offset/length window over a refcounted data block. Mutation of a shared
//! buffer first copies its window into a freshly owned block. Buffers over
//! external packet memory must be synced into pool memory before the packet
//! goes away.

use crate::rts::pool::{BlockId, Pool};

#[derive(Debug, Default, Clone, Copy)]
pub struct Buffer {
    pub off: u32,
    pub len: u32,
    block: Option<BlockId>,
}

impl Buffer {
    pub fn new() -> Self {
        Buffer::default()
    }

    /// Wraps an existing block, taking a reference on it.
    pub fn from_block(pool: &mut Pool, block: BlockId, off: u32, len: u32) -> Self {
        pool.block_get(block);
        Buffer {
            off,
            len,
            block: Some(block),
        }
    }

    pub fn block(&self) -> Option<BlockId> {
        self.block
    }

    pub fn size(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True when the buffer references external packet memory and would
    /// need a sync before that memory is released.
    pub fn will_sync(&self, pool: &Pool) -> bool {
        self.block.is_some_and(|b| pool.block_is_external(b))
    }

    pub fn shared(&self, pool: &Pool) -> bool {
        self.block.is_some_and(|b| pool.block_refs(b) > 1)
    }

    pub fn capacity(&self, pool: &Pool) -> usize {
        self.block.map_or(0, |b| pool.block_capacity(b))
    }

    /// Releases the block reference and resets the window.
    pub fn release(&mut self, pool: &mut Pool) {
        if let Some(b) = self.block.take() {
            pool.block_put(b);
        }
        self.off = 0;
        self.len = 0;
    }

    /// Byte at window position `i`. `ext` is the scan input for buffers
    /// over external memory.
    pub fn at(&self, pool: &Pool, ext: Option<&[u8]>, i: usize) -> u8 {
        self.bytes_at(pool, ext)[self.off as usize + i]
    }

    /// Signed-relative byte access; reverse scans read the byte just
    /// before the current offset.
    pub fn at_rel(&self, pool: &Pool, ext: Option<&[u8]>, i: isize) -> u8 {
        self.bytes_at(pool, ext)[(self.off as isize + i) as usize]
    }

    fn bytes_at<'a>(&self, pool: &'a Pool, ext: Option<&'a [u8]>) -> &'a [u8] {
        let block = self.block.expect("byte access on empty buffer");
        if pool.block_is_external(block) {
            ext.expect("external buffer accessed without scan input")
        } else {
            pool.block_bytes(block)
        }
    }

    /// The buffer's current window as a slice.
    pub fn window<'a>(&self, pool: &'a Pool, ext: Option<&'a [u8]>) -> &'a [u8] {
        if self.block.is_none() {
            return &[];
        }
        let bytes = self.bytes_at(pool, ext);
        &bytes[self.off as usize..self.off as usize + self.len as usize]
    }

    pub fn to_vec(&self, pool: &Pool, ext: Option<&[u8]>) -> Vec<u8> {
        self.window(pool, ext).to_vec()
    }

    pub fn eql(&self, other: &Buffer, pool: &Pool, ext: Option<&[u8]>) -> bool {
        if self.block.is_some() && self.block == other.block {
            return true;
        }
        if self.is_empty() || other.is_empty() {
            return false;
        }
        self.window(pool, ext) == other.window(pool, ext)
    }

    /// Ensures at least `size` bytes of owned, unshared capacity, preserving
    /// the current window contents. The copy-on-write point.
    pub fn reserve(&mut self, size: usize, pool: &mut Pool, ext: Option<&[u8]>) -> bool {
        match self.block {
            None => match pool.alloc_block(size) {
                Some(b) => {
                    self.block = Some(b);
                    self.off = 0;
                    self.len = 0;
                    true
                }
                None => false,
            },
            Some(b) if pool.block_refs(b) > 1 || pool.block_is_external(b) => {
                let Some(nb) = pool.alloc_block(size) else {
                    return false;
                };
                let len = self.len.min(size as u32);
                let window: Vec<u8> = {
                    let src = self.bytes_at(pool, ext);
                    src[self.off as usize..self.off as usize + len as usize].to_vec()
                };
                pool.block_bytes_mut(nb)[..window.len()].copy_from_slice(&window);
                pool.block_put(b);
                self.block = Some(nb);
                self.off = 0;
                self.len = len;
                true
            }
            Some(b) => {
                if pool.block_capacity(b) >= size {
                    true
                } else {
                    pool.realloc_block(b, size)
                }
            }
        }
    }

    /// Appends raw bytes, copying on write as needed.
    pub fn write(&mut self, src: &[u8], pool: &mut Pool, ext: Option<&[u8]>) -> bool {
        if src.is_empty() {
            return true;
        }
        let need = self.off as usize + self.len as usize + src.len();
        if self.shared(pool) || self.capacity(pool) < need || self.block.is_none() {
            if !self.reserve(self.len as usize + src.len(), pool, ext) {
                return false;
            }
        }
        let block = self.block.expect("reserve produced no block");
        let start = self.off as usize + self.len as usize;
        pool.block_bytes_mut(block)[start..start + src.len()].copy_from_slice(src);
        self.len += src.len() as u32;
        true
    }

    pub fn push(&mut self, byte: u8, pool: &mut Pool, ext: Option<&[u8]>) -> bool {
        self.write(&[byte], pool, ext)
    }

    /// Appends another buffer's window.
    pub fn append(&mut self, src: &Buffer, pool: &mut Pool, ext: Option<&[u8]>) -> bool {
        if src.is_empty() {
            return true;
        }
        if self.is_empty() && self.block.is_none() {
            self.copy_from(src, pool);
            return true;
        }
        let data = src.to_vec(pool, ext);
        self.write(&data, pool, ext)
    }

    /// Shares `src`'s block: both buffers now reference the same storage.
    pub fn copy_from(&mut self, src: &Buffer, pool: &mut Pool) {
        self.release(pool);
        if let Some(b) = src.block {
            pool.block_get(b);
            self.block = Some(b);
        }
        self.off = src.off;
        self.len = src.len;
    }

    /// Deep copy of `src`'s window into freshly owned storage.
    pub fn clone_from_buffer(
        &mut self,
        src: &Buffer,
        pool: &mut Pool,
        ext: Option<&[u8]>,
    ) -> bool {
        self.release(pool);
        if src.is_empty() {
            return true;
        }
        let data = src.to_vec(pool, ext);
        self.write(&data, pool, ext)
    }

    pub fn clear(&mut self, pool: &mut Pool) {
        if self.shared(pool) || self.will_sync(pool) {
            self.release(pool);
        } else {
            self.off = 0;
            self.len = 0;
        }
    }

    /// Projects an external window into pool memory. After a successful
    /// sync the buffer no longer references the packet.
    pub fn sync(&mut self, pool: &mut Pool, ext: &[u8]) -> bool {
        let Some(old) = self.block else {
            return true;
        };
        if !pool.block_is_external(old) {
            return true;
        }
        let len = self.len;
        let window =
            ext[self.off as usize..self.off as usize + len as usize].to_vec();
        let Some(nb) = pool.alloc_block(window.len().max(1)) else {
            return false;
        };
        pool.block_bytes_mut(nb)[..window.len()].copy_from_slice(&window);
        pool.block_put(old);
        self.block = Some(nb);
        self.off = 0;
        self.len = len;
        true
    }
}
