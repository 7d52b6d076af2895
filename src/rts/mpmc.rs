//! Fan-out message queue. Producers append to a shared singly-linked chain;
//! every consumer handle holds its own head and walks the chain at its own
//! pace. A node is reclaimed once every live handle has advanced past it,
//! which shared ownership of the links gives us for free. The queue lock
//! serializes pushes, consumer-count changes, and signature-bundle swaps.
//!
//! Messages carry the originating handle id so replicated dictionary and
//! trap updates are not applied twice at their source.

use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::rts::bundle::Bundle;
use crate::rts::trap::FtEntry;

#[derive(Debug, Clone)]
pub enum QueueMsg {
    /// Swap to a new bundle (None unloads).
    Bundle(Option<Arc<Bundle>>),
    /// Replicated dictionary save.
    DictSave {
        key: Vec<u8>,
        val: Vec<u8>,
        ttl_ms: u32,
    },
    /// Replicated flow-trap save.
    FlowSave { entry: FtEntry, ttl_ms: u32 },
}

struct Node {
    /// None for the stub node new handles start from.
    msg: Option<(u32, QueueMsg)>,
    next: OnceLock<Arc<Node>>,
}

impl Node {
    fn stub() -> Arc<Node> {
        Arc::new(Node {
            msg: None,
            next: OnceLock::new(),
        })
    }
}

struct Shared {
    tail: Arc<Node>,
    consumer: u32,
    next_pid: u32,
}

/// Process-wide in the original design; here a value owned by the RTS
/// runtime so tests can create one per case.
pub struct Queue {
    shared: Mutex<Shared>,
}

impl Default for Queue {
    fn default() -> Self {
        Queue::new()
    }
}

impl Queue {
    pub fn new() -> Self {
        Queue {
            shared: Mutex::new(Shared {
                tail: Node::stub(),
                consumer: 0,
                next_pid: 0,
            }),
        }
    }

    /// Runs `f` under the queue lock; the bundle slot swap and subscribe
    /// paths serialize through this.
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut QueueGuard<'_>) -> R) -> R {
        let mut shared = self.shared.lock();
        let mut guard = QueueGuard {
            shared: &mut *shared,
        };
        f(&mut guard)
    }

    /// True when at least one consumer other than `pid` is registered, so a
    /// broadcast would reach someone.
    pub fn has_other_consumers(&self) -> bool {
        self.shared.lock().consumer > 1
    }

    /// Registers a consumer. The handle starts at the current tail and will
    /// only observe messages pushed after registration.
    pub fn handle_init(&self) -> QueueHandle {
        let mut shared = self.shared.lock();
        shared.consumer += 1;
        shared.next_pid += 1;
        QueueHandle {
            head: shared.tail.clone(),
            pid: shared.next_pid,
            events: 0,
        }
    }

    pub fn handle_exit(&self, handle: QueueHandle) {
        let mut shared = self.shared.lock();
        debug_assert!(shared.consumer > 0);
        shared.consumer -= 1;
        drop(handle);
    }
}

/// Lock-scope view of the queue used by producers.
pub struct QueueGuard<'a> {
    shared: &'a mut Shared,
}

impl QueueGuard<'_> {
    pub fn consumer_count(&self) -> u32 {
        self.shared.consumer
    }

    /// Appends a message. Callers must check `consumer_count() > 0` first;
    /// pushing into a consumerless queue would strand the node.
    pub fn push(&mut self, origin_pid: u32, msg: QueueMsg) {
        debug_assert!(self.shared.consumer > 0);
        let node = Arc::new(Node {
            msg: Some((origin_pid, msg)),
            next: OnceLock::new(),
        });
        self.shared
            .tail
            .next
            .set(node.clone())
            .unwrap_or_else(|_| unreachable!("tail already linked"));
        self.shared.tail = node;
    }
}

/// Per-consumer read position.
pub struct QueueHandle {
    head: Arc<Node>,
    pid: u32,
    /// shared events processed, reported through rusage
    pub events: u32,
}

impl QueueHandle {
    /// A placeholder handle that is not registered anywhere; used to move
    /// a real handle out of a structure being torn down.
    pub fn detached() -> Self {
        QueueHandle {
            head: Node::stub(),
            pid: 0,
            events: 0,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Next message this handle has not seen, skipping its own broadcasts.
    pub fn poll(&mut self) -> Option<QueueMsg> {
        loop {
            let next = self.head.next.get()?.clone();
            self.head = next;
            self.events += 1;
            match &self.head.msg {
                Some((origin, _)) if *origin == self.pid => continue,
                Some((_, msg)) => return Some(msg.clone()),
                None => continue,
            }
        }
    }

    pub fn take_events(&mut self) -> u32 {
        std::mem::take(&mut self.events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dict(key: &[u8]) -> QueueMsg {
        QueueMsg::DictSave {
            key: key.to_vec(),
            val: b"v".to_vec(),
            ttl_ms: 1000,
        }
    }

    #[test]
    fn fan_out_reaches_every_other_handle() {
        let q = Queue::new();
        let mut a = q.handle_init();
        let mut b = q.handle_init();
        q.with_lock(|g| {
            assert_eq!(g.consumer_count(), 2);
            g.push(a.pid(), dict(b"k"));
        });
        // originator skips its own message
        assert!(a.poll().is_none());
        match b.poll() {
            Some(QueueMsg::DictSave { key, .. }) => assert_eq!(key, b"k"),
            other => panic!("unexpected message: {other:?}"),
        }
        assert!(b.poll().is_none());
        q.handle_exit(a);
        q.handle_exit(b);
    }

    #[test]
    fn late_handle_misses_earlier_messages() {
        let q = Queue::new();
        let mut a = q.handle_init();
        q.with_lock(|g| g.push(0, dict(b"early")));
        let mut late = q.handle_init();
        assert!(late.poll().is_none());
        assert!(a.poll().is_some());
        q.handle_exit(a);
        q.handle_exit(late);
    }

    #[test]
    fn events_count_includes_skipped_own_messages() {
        let q = Queue::new();
        let mut a = q.handle_init();
        let _b = q.handle_init();
        q.with_lock(|g| g.push(a.pid(), dict(b"own")));
        assert!(a.poll().is_none());
        assert_eq!(a.take_events(), 1);
    }
}
