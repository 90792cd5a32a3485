//! # FixTree - The Search-Optimized Linearized Tree
//!
//! The read layer of the index. Fanout-32 inner levels packed into one
//! buffer with children located by index arithmetic, and a fanout-16
//! leaf layer bulk-loaded half full so each leaf can absorb a bounded
//! number of later inserts.
//!
//! - `node`: the fixed 256-byte node layouts and per-node scans.
//! - `tree`: bulk construction, recovery, lookup, bounded mutation,
//!   and the sorted merge that feeds a rebuild.

mod node;
mod tree;

pub use node::{
    Entrance, InnerNode, LeafNode, ENTRANCE_REGION_SIZE, FIX_NODE_SIZE, INNER_CARD,
    LEAF_BUILD_CARD, LEAF_CARD, MAX_HEIGHT,
};
pub use tree::FixTree;
