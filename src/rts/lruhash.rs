#![forbid(unsafe_code)]
//! Bucketed hash with a global LRU order and per-item TTLs. Entries live in
//! a slab of fixed-shape records addressed by index; the bucket chains and
//! the LRU order are doubly-linked lists of indices, so removal during a
//! walk never invalidates other entries.
//!
//! Expiry is two-tier: the table-wide `expiry` is an idle bound measured
//! from the LRU tail; an item whose own TTL has time left is refreshed with
//! the remainder instead of being dropped.

const NIL: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryId(u32);

struct Slot<T> {
    item: Option<T>,
    hashval: u32,
    touched: u64,
    ttl: u32,
    bucket_prev: u32,
    bucket_next: u32,
    lru_prev: u32,
    lru_next: u32,
}

pub struct LruHash<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    buckets: Vec<u32>,
    lru_head: u32,
    lru_tail: u32,
    expiry: u32,
    mask: u32,
    len: usize,
}

fn clp2(mut n: u32) -> u32 {
    n -= 1;
    n |= n >> 1;
    n |= n >> 2;
    n |= n >> 4;
    n |= n >> 8;
    n |= n >> 16;
    n + 1
}

impl<T> LruHash<T> {
    /// `expiry` is the table idle bound in the same unit as timestamps
    /// (milliseconds throughout the engine).
    pub fn new(buckets: u32, expiry: u32) -> Self {
        let size = clp2(buckets.max(1));
        LruHash {
            slots: Vec::new(),
            free: Vec::new(),
            buckets: vec![NIL; size as usize],
            lru_head: NIL,
            lru_tail: NIL,
            expiry,
            mask: size - 1,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn expiry(&self) -> u32 {
        self.expiry
    }

    fn bucket_of(&self, hashval: u32) -> usize {
        (hashval & self.mask) as usize
    }

    fn detach_bucket(&mut self, id: u32) {
        let (prev, next, hashval) = {
            let s = &self.slots[id as usize];
            (s.bucket_prev, s.bucket_next, s.hashval)
        };
        if prev == NIL {
            let b = self.bucket_of(hashval);
            self.buckets[b] = next;
        } else {
            self.slots[prev as usize].bucket_next = next;
        }
        if next != NIL {
            self.slots[next as usize].bucket_prev = prev;
        }
    }

    fn detach_lru(&mut self, id: u32) {
        let (prev, next) = {
            let s = &self.slots[id as usize];
            (s.lru_prev, s.lru_next)
        };
        if prev == NIL {
            self.lru_head = next;
        } else {
            self.slots[prev as usize].lru_next = next;
        }
        if next == NIL {
            self.lru_tail = prev;
        } else {
            self.slots[next as usize].lru_prev = prev;
        }
    }

    fn push_lru_front(&mut self, id: u32) {
        let old = self.lru_head;
        {
            let s = &mut self.slots[id as usize];
            s.lru_prev = NIL;
            s.lru_next = old;
        }
        if old != NIL {
            self.slots[old as usize].lru_prev = id;
        }
        self.lru_head = id;
        if self.lru_tail == NIL {
            self.lru_tail = id;
        }
    }

    pub fn insert(&mut self, item: T, hashval: u32, ttl: u32, now: u64) -> EntryId {
        let slot = Slot {
            item: Some(item),
            hashval,
            touched: now,
            ttl,
            bucket_prev: NIL,
            bucket_next: NIL,
            lru_prev: NIL,
            lru_next: NIL,
        };
        let id = match self.free.pop() {
            Some(id) => {
                self.slots[id as usize] = slot;
                id
            }
            None => {
                self.slots.push(slot);
                self.slots.len() as u32 - 1
            }
        };
        let b = self.bucket_of(hashval);
        let head = self.buckets[b];
        self.slots[id as usize].bucket_next = head;
        if head != NIL {
            self.slots[head as usize].bucket_prev = id;
        }
        self.buckets[b] = id;
        self.push_lru_front(id);
        self.len += 1;
        EntryId(id)
    }

    /// First live bucket entry matching `pred`; a hit refreshes its LRU
    /// position and touch time.
    pub fn find(
        &mut self,
        hashval: u32,
        now: u64,
        mut pred: impl FnMut(&T) -> bool,
    ) -> Option<EntryId> {
        let mut id = self.buckets[self.bucket_of(hashval)];
        while id != NIL {
            let s = &self.slots[id as usize];
            let next = s.bucket_next;
            let live = now.saturating_sub(s.touched) <= s.ttl as u64;
            if live && pred(s.item.as_ref().expect("vacant slot in bucket chain")) {
                self.detach_lru(id);
                self.push_lru_front(id);
                self.slots[id as usize].touched = now;
                return Some(EntryId(id));
            }
            id = next;
        }
        None
    }

    /// Visits every live bucket entry for `hashval` without refreshing LRU
    /// order; used by the trap table's scored match.
    pub fn scan_bucket(&self, hashval: u32, now: u64, mut f: impl FnMut(EntryId, &T)) {
        let mut id = self.buckets[self.bucket_of(hashval)];
        while id != NIL {
            let s = &self.slots[id as usize];
            if now.saturating_sub(s.touched) <= s.ttl as u64 {
                f(EntryId(id), s.item.as_ref().expect("vacant slot in bucket chain"));
            }
            id = s.bucket_next;
        }
    }

    pub fn get(&self, id: EntryId) -> Option<&T> {
        self.slots.get(id.0 as usize).and_then(|s| s.item.as_ref())
    }

    pub fn get_mut(&mut self, id: EntryId) -> Option<&mut T> {
        self.slots.get_mut(id.0 as usize).and_then(|s| s.item.as_mut())
    }

    pub fn set_ttl(&mut self, id: EntryId, ttl: u32, now: u64) {
        let s = &mut self.slots[id.0 as usize];
        s.ttl = ttl;
        s.touched = now;
    }

    pub fn remove(&mut self, id: EntryId) -> Option<T> {
        let item = self.slots[id.0 as usize].item.take()?;
        self.detach_bucket(id.0);
        self.detach_lru(id.0);
        self.free.push(id.0);
        self.len -= 1;
        Some(item)
    }

    /// Pops one expired entry from the LRU tail, or None when the tail is
    /// within the idle bound. An idle item with per-item TTL remaining is
    /// moved back to the LRU head with the remainder and the walk retries.
    pub fn expire(&mut self, now: u64) -> Option<T> {
        loop {
            let id = self.lru_tail;
            if id == NIL {
                return None;
            }
            let (elapsed, ttl) = {
                let s = &self.slots[id as usize];
                (now.saturating_sub(s.touched), s.ttl)
            };
            if elapsed <= self.expiry as u64 {
                return None;
            }
            if ttl as u64 <= elapsed {
                return self.remove(EntryId(id));
            }
            let s = &mut self.slots[id as usize];
            s.ttl = ttl - elapsed as u32;
            s.touched = now;
            self.detach_lru(id);
            self.push_lru_front(id);
        }
    }

    /// Drains every entry, LRU order, newest first.
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len);
        let mut id = self.lru_head;
        let mut ids = Vec::with_capacity(self.len);
        while id != NIL {
            ids.push(id);
            id = self.slots[id as usize].lru_next;
        }
        for id in ids {
            if let Some(item) = self.remove(EntryId(id)) {
                out.push(item);
            }
        }
        out
    }
}
