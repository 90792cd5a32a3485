//! # Persistence Layer
//!
//! Everything the trees need from persistent memory, and nothing else:
//!
//! - `flush`: the cache-line primitives ([`flush`], [`fence`]) and the
//!   8-byte commit point ([`persist_assign`]).
//! - `alloc`: the [`PmAlloc`] capability trait the trees consume.
//! - `pool`: [`PmPool`], the mmap-backed implementation used by the
//!   tests, benches, and any embedder without real PM hardware.
//!
//! The contract threaded through the whole crate: persisted pointers
//! are relative offsets, multi-word changes are staged (written,
//! flushed, fenced) before the one `persist_assign` that publishes
//! them, and each `persist_assign` is atomic at 8 bytes.

mod alloc;
mod flush;
mod pool;

pub use alloc::PmAlloc;
pub use flush::{fence, flush, persist_assign, CACHE_LINE_SIZE};
pub use pool::{PmPool, POOL_DATA_START, POOL_HEADER_SIZE, POOL_MAGIC, POOL_VERSION, ROOT_SLOTS};
