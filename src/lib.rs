//! # duotree - Persistent-Memory Two-Tier Ordered Index
//!
//! duotree is an ordered `u64 -> u64` index resident in persistent
//! memory, built from two cooperating tree structures:
//!
//! - [`FixTree`]: a search-optimized *linearized* tree. Inner levels are
//!   a packed array of fanout-32 key nodes with no child pointers
//!   (children are located by index arithmetic); leaves are fanout-16
//!   nodes bulk-loaded half full so they can absorb a bounded number of
//!   in-place inserts. Built in one pass from sorted input, immutable
//!   in shape afterwards.
//! - [`WoTree`]: a write-optimized, log-free B+tree of 256-byte nodes.
//!   Each node packs a slot array, a count, and a sibling-version bit
//!   into a single 8-byte state word, so every structural mutation
//!   commits with one atomic PM store. Splits stage the new node and a
//!   shadow sibling slot durably before that store publishes them.
//!
//! Together they form a two-layer map: the fixed tree is the compact
//! read-optimized level produced by bulk load or merge, the
//! write-optimized tree absorbs live updates until the embedder decides
//! to merge it back into a rebuilt fixed tree.
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------+
//! |            embedding system                |
//! |   (decides when to merge and rebuild)      |
//! +---------------------+----------------------+
//! |      FixTree        |       WoTree         |
//! |  bulk build, lookup |  insert/update/remove|
//! |  bounded insert,    |  split + merge, root |
//! |  tombstone delete,  |  replacement, height |
//! |  sorted merge-out   |  escalation          |
//! +---------------------+----------------------+
//! |        types: Key / Record / RelPtr        |
//! +--------------------------------------------+
//! |  pmem: flush / fence / persist_assign,     |
//! |        PmAlloc capability, PmPool (mmap)   |
//! +--------------------------------------------+
//! ```
//!
//! ## Durability model
//!
//! No log. Every operation stages whatever data it needs (flushed and
//! fenced) and then commits with a single atomic 8-byte
//! `persist_assign`. A crash at any instant leaves each structure in
//! either its pre- or post-operation state:
//!
//! - FixTree bulk build persists both node buffers bottom-up and writes
//!   the entrance last; a crash before the entrance commit leaves no
//!   reachable tree.
//! - WoTree splits write the new node and the current node's *shadow*
//!   sibling slot durably first; flipping the 1-bit sibling version
//!   inside the state word then exposes the new sibling and the reduced
//!   count together.
//!
//! ## Scheduling model
//!
//! Single writer, no latches. Readers racing the writer observe either
//! side of each committed 8-byte store. The PM allocator is not
//! thread-safe; callers serialise around it.
//!
//! ## Quick start
//!
//! ```no_run
//! use duotree::{FixTree, PmPool, Record, WoTree};
//!
//! # fn main() -> eyre::Result<()> {
//! let pool = PmPool::create("index.pool", 64 << 20)?;
//!
//! // Read-optimized layer from sorted input.
//! let records: Vec<Record> = (1..=100).map(|k| Record::new(k, k)).collect();
//! let fix = FixTree::build(&pool, &records)?;
//! pool.set_root(0, fix.entrance());
//! assert_eq!(fix.lookup(42), 42);
//!
//! // Write-optimized layer for live updates.
//! let mut wo = WoTree::create(&pool, pool.root_cell(1))?;
//! wo.insert(7, 700, 8)?;
//! assert_eq!(wo.find(7), Some(700));
//! # Ok(())
//! # }
//! ```

pub mod fixtree;
pub mod pmem;
pub mod wotree;

mod types;

pub use fixtree::FixTree;
pub use pmem::{PmAlloc, PmPool};
pub use types::{Key, Record, RelPtr, MAX_KEY};
pub use wotree::{InsertOutcome, WoTree};
