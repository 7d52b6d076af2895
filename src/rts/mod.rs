//! Real-time signature engine: a bytecode virtual machine driving a compact
//! transition-table DFA over bidirectional TCP/UDP payloads.
//!
//! Resources are owned by a [`RtsHandle`]; each handle is single-writer and
//! carries its own fixed-size arena, dictionary and flow-trap tables.
//! Handles on different threads communicate only through the runtime's
//! fan-out queue, which also broadcasts hot signature reloads.

pub mod buffer;
pub mod bundle;
pub mod dfa;
pub mod ipaddr;
pub mod lruhash;
pub mod mpmc;
pub mod pool;
pub mod runtime;
pub mod trap;
pub mod value;
pub mod vm;

pub use bundle::Bundle;
pub use runtime::{
    Direction, Domain, LookupAnswer, RtsHandle, RtsRuntime, RtsStream, Rusage, SubEvent,
    SubValue,
};
pub use vm::{SubCallback, UserData};

/// Runtime signature format version; bundle major/minor must match.
pub const RTS_MAJOR: u8 = 2;
pub const RTS_MINOR: u8 = 4;
pub const RTS_PATCH: u8 = 0;

/// Per-handle heap size in bytes.
pub const HANDLE_MEMORY_SIZE: usize = 2 * 1024 * 1024;

/// Dictionary and flow-trap table geometry.
pub const DICT_HASH_BUCKETS: u32 = 1024;
pub const DICT_HASH_EXPIRY_MS: u32 = 30_000;
pub const FLOW_HASH_BUCKETS: u32 = 1024;
pub const FLOW_HASH_EXPIRY_MS: u32 = 30_000;
