//! # The Write-Optimized Tree Driver
//!
//! Orchestrates the 256-byte nodes into a B+tree anchored in a single
//! PM cell holding the root's relative pointer.
//!
//! ## Insert
//!
//! Recursive descent to the owning leaf; `store` on the way back up
//! installs each child split into its parent. When the root itself
//! splits there are two outcomes:
//!
//! - below the height threshold, a new root is built (old root on
//!   `leftmost`, one routing record), flushed, fenced, and then the
//!   root cell is committed - growing the tree by one level with a
//!   single 8-byte store;
//! - at or above the threshold, the split pair is handed back as
//!   [`InsertOutcome::Escalate`] so the embedder can flush this tree
//!   into the read-optimized layer instead of letting it keep growing.
//!
//! ## Remove
//!
//! Recursive descent; a leaf that drops below the underflow bound asks
//! its parent to merge it with a neighbour whose combined count still
//! fits a node, preferring the left one. The parent drops the routing
//! record of whichever node gets absorbed before the merge commits.
//! When an internal root runs out of routing records its leftmost child
//! is committed into the root cell and the old root freed.

use eyre::{ensure, Result};

use super::node::Node;
use super::state::{CARDINALITY, UNDERFLOW_CARD};
use crate::pmem::{fence, flush, persist_assign, PmAlloc, CACHE_LINE_SIZE};
use crate::types::{Key, Record, RelPtr};

/// Result of an insert: either fully absorbed, or the root split at the
/// height threshold and the caller has to take the split over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Done,
    Escalate { split_key: Key, split_node: RelPtr },
}

pub struct WoTree<'a, A: PmAlloc> {
    alloc: &'a A,
    root_cell: *mut u64,
}

impl<'a, A: PmAlloc> WoTree<'a, A> {
    /// Opens the tree anchored at `root_cell`, allocating an empty leaf
    /// root if the cell is still null.
    ///
    /// The cell must be an 8-byte-aligned PM location (a pool root slot
    /// is the intended home).
    pub fn create(alloc: &'a A, root_cell: *mut u64) -> Result<Self> {
        // SAFETY: the caller hands us a valid aligned PM cell; reads and
        // the persist_assign below follow the single-writer contract.
        unsafe {
            if *root_cell == 0 {
                let root = Node::alloc_in(alloc)?;
                flush(root as *const u8, CACHE_LINE_SIZE);
                fence();
                persist_assign(root_cell, alloc.relative(root as *const u8).offset());
            }
        }
        Ok(Self { alloc, root_cell })
    }

    /// Re-opens an existing tree; fails on an empty cell.
    pub fn attach(alloc: &'a A, root_cell: *mut u64) -> Result<Self> {
        // SAFETY: as in create.
        ensure!(unsafe { *root_cell } != 0, "no tree rooted at this cell");
        Ok(Self { alloc, root_cell })
    }

    fn root(&self) -> *mut Node {
        // SAFETY: the root cell always holds a valid node pointer once
        // create/attach succeeded.
        let rel = RelPtr::from_offset(unsafe { *self.root_cell });
        self.alloc.absolute(rel) as *mut Node
    }

    /// Point lookup. `None` when the key is absent.
    pub fn find(&self, key: Key) -> Option<u64> {
        // SAFETY: descent only follows published child pointers.
        unsafe {
            let mut cur = self.root();
            while !(*cur).is_leaf() {
                let child = (*cur).get_child(self.alloc, key);
                cur = self.alloc.absolute(RelPtr::from_offset(child)) as *mut Node;
            }
            match (*cur).get_child(self.alloc, key) {
                0 => None,
                val => Some(val),
            }
        }
    }

    /// Overwrites the value of an existing key. `false` when absent.
    pub fn update(&mut self, key: Key, val: u64) -> bool {
        // SAFETY: as in find.
        unsafe {
            let mut cur = self.root();
            while !(*cur).is_leaf() {
                let child = (*cur).get_child(self.alloc, key);
                cur = self.alloc.absolute(RelPtr::from_offset(child)) as *mut Node;
            }
            (*cur).update(key, val)
        }
    }

    /// Inserts `(key, val)`. `threshold` bounds how tall this tree may
    /// grow: a root split at `level >= threshold` is not installed but
    /// escalated to the caller.
    pub fn insert(&mut self, key: Key, val: u64, threshold: u8) -> Result<InsertOutcome> {
        let root = self.root();
        let mut level = 1u8;
        // SAFETY: root is a published node.
        let split = unsafe { self.insert_recursive(root, key, val, &mut level)? };

        let Some((split_key, split_node)) = split else {
            return Ok(InsertOutcome::Done);
        };

        if level >= threshold {
            return Ok(InsertOutcome::Escalate {
                split_key,
                split_node: self.alloc.relative(split_node as *const u8),
            });
        }

        // grow by one level: new root over the two halves
        let new_root_ptr = Node::alloc_in(self.alloc)?;
        // SAFETY: new_root is fresh and unpublished until the root cell
        // commit below; the flush+fence orders its content first.
        unsafe {
            let new_root = &mut *new_root_ptr;
            new_root.leftmost = self.alloc.relative(root as *const u8);
            new_root.append_staged(
                Record::new(
                    split_key,
                    self.alloc.relative(split_node as *const u8).offset(),
                ),
                0,
                0,
            );
            new_root.set_count(1);

            flush(new_root_ptr as *const u8, CACHE_LINE_SIZE);
            fence();
            persist_assign(
                self.root_cell,
                self.alloc.relative(new_root_ptr as *const u8).offset(),
            );
        }
        Ok(InsertOutcome::Done)
    }

    /// # Safety
    ///
    /// `node` must point at a published node of this tree.
    unsafe fn insert_recursive(
        &mut self,
        node: *mut Node,
        key: Key,
        val: u64,
        level: &mut u8,
    ) -> Result<Option<(Key, *mut Node)>> {
        if (*node).is_leaf() {
            return (*node).store(self.alloc, key, val);
        }

        *level += 1;
        let child_rel = (*node).get_child(self.alloc, key);
        let child = self.alloc.absolute(RelPtr::from_offset(child_rel)) as *mut Node;

        let split = self.insert_recursive(child, key, val, level)?;
        if let Some((child_key, child_node)) = split {
            // install the child's split here; may cascade upwards
            (*node).store(
                self.alloc,
                child_key,
                self.alloc.relative(child_node as *const u8).offset(),
            )
        } else {
            Ok(None)
        }
    }

    /// Removes `key`. Returns `true` when the root ended up empty (the
    /// tree is a leaf with no records) - the signal that this tree can
    /// be discarded by the embedder.
    pub fn remove(&mut self, key: Key) -> bool {
        // SAFETY: descent only follows published child pointers; merges
        // and the root swap stick to the staged-then-commit protocol
        // inside Node and persist_assign.
        unsafe {
            let root = self.root();
            if (*root).is_leaf() {
                (*root).remove(self.alloc, key);
                return (*root).count() == 0;
            }

            let child_rel = (*root).get_child(self.alloc, key);
            let child = self.alloc.absolute(RelPtr::from_offset(child_rel)) as *mut Node;
            let underflow = self.remove_recursive(child, key);

            if underflow {
                self.merge_with_neighbour(root, child, key);

                if (*root).count() == 0 {
                    // the last routing record is gone; the lone child
                    // takes over as root
                    let old_root = root;
                    persist_assign(self.root_cell, (*root).leftmost.offset());
                    self.alloc.free(old_root as *mut u8);
                }
            }
            false
        }
    }

    /// # Safety
    ///
    /// `node` must point at a published node of this tree.
    unsafe fn remove_recursive(&mut self, node: *mut Node, key: Key) -> bool {
        if (*node).is_leaf() {
            (*node).remove(self.alloc, key);
            return (*node).count() < UNDERFLOW_CARD;
        }

        let child_rel = (*node).get_child(self.alloc, key);
        let child = self.alloc.absolute(RelPtr::from_offset(child_rel)) as *mut Node;

        if self.remove_recursive(child, key) {
            self.merge_with_neighbour(node, child, key);
            return (*node).count() < UNDERFLOW_CARD;
        }
        false
    }

    /// Merges `child` with a flanking sibling under `parent` when one
    /// fits, preferring the left. Drops the absorbed node's routing
    /// record from the parent first.
    ///
    /// # Safety
    ///
    /// `parent` and `child` must be published nodes with `child` on the
    /// search path of `key` below `parent`.
    unsafe fn merge_with_neighbour(&mut self, parent: *mut Node, child: *mut Node, key: Key) {
        let (left, right) = (*parent).get_lrchild(self.alloc, key);

        if let Some(left_sib) = left {
            if (*child).count() + (*left_sib).count() < CARDINALITY {
                (*parent).remove(self.alloc, (*child).first_key());
                Node::merge(self.alloc, left_sib, child);
                return;
            }
        }
        if let Some(right_sib) = right {
            if (*child).count() + (*right_sib).count() < CARDINALITY {
                (*parent).remove(self.alloc, (*right_sib).first_key());
                Node::merge(self.alloc, child, right_sib);
            }
        }
    }

    /// Structure dump for diagnostics.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        // SAFETY: the root is always published.
        unsafe { (*self.root()).dump_into(self.alloc, 0, &mut out) };
        out
    }
}
