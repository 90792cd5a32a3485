//! # WoTree - The Write-Optimized 256-Byte Node Tree
//!
//! The write layer of the index: a dynamic, log-free B+tree whose
//! every structural mutation commits with a single atomic 8-byte PM
//! store of a node's state word.
//!
//! - `state`: the packed slot-array/count/sibling-version word.
//! - `node`: the 256-byte node and its insert/split/merge protocol.
//! - `tree`: the recursive driver with root replacement and height
//!   escalation.

mod node;
mod state;
mod tree;

pub use node::{Node, WO_NODE_SIZE};
pub use state::{NodeState, CARDINALITY, UNDERFLOW_CARD};
pub use tree::{InsertOutcome, WoTree};
