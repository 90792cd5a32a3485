//! # The 256-Byte Write-Optimized Node
//!
//! ## Layout
//!
//! ```text
//! Offset   Field
//! ------   -----
//! 0        state        8 B   packed slot array / count / versions
//! 8        leftmost     8 B   relative child pointer, null for leaves
//! 16       siblings[0] 16 B   current or shadow sibling record
//! 32       siblings[1] 16 B   the other one
//! 48       recs[0..13] 208 B  physical record slots, never shifted
//! ```
//!
//! The first cache line holds the state, the leftmost pointer, both
//! sibling slots and `recs[0]`; flushing it persists every header field
//! in one go.
//!
//! ## Slot indirection
//!
//! `recs` is a free list of physical slots. The logical order lives in
//! the state word's slot array, so an insert writes one record slot and
//! then commits a new state word; nothing else moves.
//!
//! ## Shadow sibling protocol
//!
//! `siblings[sibling_version]` is the live forward pointer; the other
//! entry is a staging slot. A split:
//!
//! 1. builds the new node (records, inherited sibling) and flushes it,
//! 2. writes the split key and new-node pointer into the *shadow* slot
//!    and flushes that,
//! 3. fences, then
//! 4. commits a state word with the reduced count and the version bit
//!    toggled.
//!
//! Step 4 is one atomic 8-byte store: before it, readers and recovery
//! see the old sibling and full count; after it, the new sibling and
//! split count. There is no in-between. Node merge reuses the same
//! trick in the other direction, folding the right sibling in and
//! flipping the version to adopt *its* forward pointer.
//!
//! ## Ownership invariant
//!
//! A node owns exactly the key range `[parent separator, live
//! sibling.key)`. Every routing decision - including delegating to the
//! sibling when a key at or past `sibling.key` arrives mid-split-window
//! - follows from that.

use std::ptr;

use eyre::{ensure, Result};

use super::state::{NodeState, CARDINALITY};
use crate::pmem::{fence, flush, persist_assign, PmAlloc, CACHE_LINE_SIZE};
use crate::types::{Key, Record, RelPtr, MAX_KEY};

pub const WO_NODE_SIZE: usize = 256;

#[repr(C, align(64))]
pub struct Node {
    pub(crate) state: u64,
    pub(crate) leftmost: RelPtr,
    pub(crate) siblings: [Record; 2],
    pub(crate) recs: [Record; CARDINALITY],
}

const _: () = assert!(std::mem::size_of::<Node>() == WO_NODE_SIZE);

impl Node {
    /// Allocates and initialises a node in PM. The node is not yet
    /// reachable; linking it in is the caller's commit.
    pub fn alloc_in<A: PmAlloc>(alloc: &A) -> Result<*mut Node> {
        let rel = alloc.malloc(WO_NODE_SIZE)?;
        let node = alloc.absolute(rel) as *mut Node;
        // SAFETY: a fresh 64-byte-aligned 256-byte region that nothing
        // else references yet.
        unsafe {
            (*node).state = 0;
            (*node).leftmost = RelPtr::NULL;
            (*node).siblings = [Record::EMPTY; 2];
            (*node).recs = [Record::EMPTY; CARDINALITY];
        }
        Ok(node)
    }

    #[inline]
    pub fn state(&self) -> NodeState {
        NodeState::new(self.state)
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.state().count()
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.leftmost.is_null()
    }

    /// The live sibling record; `MAX_KEY` when the node is rightmost.
    #[inline]
    pub fn live_sibling(&self) -> Record {
        self.siblings[self.state().sibling_version()]
    }

    /// Smallest key in the node's logical order.
    #[inline]
    pub(crate) fn first_key(&self) -> Key {
        self.recs[self.state().read(0)].key
    }

    /// Routes `key` one step: delegates past the live sibling, returns
    /// the value on a leaf (0 when absent), or the owning child's
    /// relative pointer on an internal node.
    pub fn get_child<A: PmAlloc>(&self, alloc: &A, key: Key) -> u64 {
        let st = self.state();
        let sibling = self.siblings[st.sibling_version()];
        if key >= sibling.key {
            // the node has split; the upper half owns this key
            let sib = alloc.absolute(RelPtr::from_offset(sibling.val)) as *const Node;
            // SAFETY: a live sibling pointer always refers to a published
            // node in the same pool.
            return unsafe { (*sib).get_child(alloc, key) };
        }

        if self.is_leaf() {
            for i in 0..st.count() {
                let rec = self.recs[st.read(i)];
                if rec.key >= key {
                    return if rec.key == key { rec.val } else { 0 };
                }
            }
            0
        } else {
            let mut pos = st.count();
            for i in 0..st.count() {
                if self.recs[st.read(i)].key > key {
                    pos = i;
                    break;
                }
            }
            if pos == 0 {
                self.leftmost.offset()
            } else {
                self.recs[st.read(pos - 1)].val
            }
        }
    }

    /// Inserts into a node with free space: stage the record, flush,
    /// fence, then commit the widened state word.
    pub fn insertone(&mut self, key: Key, val: u64) -> Result<()> {
        let st = self.state();
        let mut idx = st.count();
        for i in 0..st.count() {
            if key < self.recs[st.read(i)].key {
                idx = i;
                break;
            }
        }

        let slot = st.alloc();
        ensure!(slot < CARDINALITY, "insert into a full node");

        self.recs[slot] = Record::new(key, val);
        // SAFETY: recs[slot] lies inside this live node.
        unsafe {
            flush(
                ptr::addr_of!(self.recs[slot]) as *const u8,
                std::mem::size_of::<Record>(),
            );
        }
        fence();

        // SAFETY: the state word is the node's first aligned u64.
        unsafe { persist_assign(ptr::addr_of_mut!(self.state), st.add(idx, slot).pack()) };
        Ok(())
    }

    /// Inserts `(key, val)`, splitting first when the node is full.
    /// Returns the split key and new node for the parent to install.
    pub fn store<A: PmAlloc>(
        &mut self,
        alloc: &A,
        key: Key,
        val: u64,
    ) -> Result<Option<(Key, *mut Node)>> {
        let st = self.state();
        if st.count() < CARDINALITY {
            self.insertone(key, val)?;
            return Ok(None);
        }

        let m = st.count() / 2;
        let split_key = self.recs[st.read(m)].key;

        let new_ptr = Node::alloc_in(alloc)?;
        // SAFETY: new_ptr is a fresh unpublished node; no aliasing with
        // self, which is a different allocation.
        let new_node = unsafe { &mut *new_ptr };

        let mut moved = 0usize;
        let staged = if self.is_leaf() {
            for i in m..st.count() {
                new_node.append_staged(self.recs[st.read(i)], moved, moved);
                moved += 1;
            }
            st.with_count(st.count() - moved)
        } else {
            // the split record's value becomes the new node's leftmost child
            new_node.leftmost = RelPtr::from_offset(self.recs[st.read(m)].val);
            for i in (m + 1)..st.count() {
                new_node.append_staged(self.recs[st.read(i)], moved, moved);
                moved += 1;
            }
            st.with_count(st.count() - (moved + 1))
        };
        new_node.set_count(moved);
        // the new node inherits the chain
        new_node.siblings[0] = self.siblings[st.sibling_version()];

        // SAFETY: both flushed ranges lie inside the new node.
        unsafe {
            flush(new_ptr as *const u8, CACHE_LINE_SIZE);
            flush(
                ptr::addr_of!(new_node.recs[1]) as *const u8,
                (moved.max(1) - 1) * std::mem::size_of::<Record>(),
            );
        }

        // stage the split in the shadow sibling slot
        let shadow = 1 - st.sibling_version();
        self.siblings[shadow] = Record::new(split_key, alloc.relative(new_ptr as *const u8).offset());
        // SAFETY: the shadow slot lies in this node's header line.
        unsafe {
            flush(
                ptr::addr_of!(self.siblings[shadow]) as *const u8,
                std::mem::size_of::<Record>(),
            );
        }
        fence();

        // one atomic store publishes the reduced count and the new sibling
        let staged = staged.with_sibling_version(shadow);
        // SAFETY: the state word is the node's first aligned u64.
        unsafe { persist_assign(ptr::addr_of_mut!(self.state), staged.pack()) };

        if key < split_key {
            self.insertone(key, val)?;
        } else {
            new_node.insertone(key, val)?;
        }

        Ok(Some((split_key, new_ptr)))
    }

    /// Overwrites the value for `key` in place. Best-effort durable:
    /// the record is flushed but not fenced.
    pub fn update(&mut self, key: Key, val: u64) -> bool {
        let st = self.state();
        let mut slot = CARDINALITY;
        for i in 0..st.count() {
            let s = st.read(i);
            if self.recs[s].key >= key {
                slot = s;
                break;
            }
        }

        if slot < CARDINALITY && self.recs[slot].key == key {
            self.recs[slot].val = val;
            // SAFETY: recs[slot] lies inside this live node.
            unsafe {
                flush(
                    ptr::addr_of!(self.recs[slot]) as *const u8,
                    std::mem::size_of::<Record>(),
                );
            }
            true
        } else {
            false
        }
    }

    /// Removes `key`. A leaf removes the exact record; an internal node
    /// drops the routing record covering `key`. The driver never asks
    /// an internal node to drop its leftmost route, so the position is
    /// always at least 1 there.
    pub fn remove<A: PmAlloc>(&mut self, alloc: &A, key: Key) -> bool {
        let st = self.state();
        let sibling = self.siblings[st.sibling_version()];
        if key >= sibling.key {
            let sib = alloc.absolute(RelPtr::from_offset(sibling.val)) as *mut Node;
            // SAFETY: live sibling pointers refer to published nodes.
            return unsafe { (*sib).remove(alloc, key) };
        }

        if self.is_leaf() {
            for idx in 0..st.count() {
                let rec = self.recs[st.read(idx)];
                if rec.key >= key {
                    if rec.key == key {
                        // SAFETY: aligned state word of a live node.
                        unsafe {
                            persist_assign(ptr::addr_of_mut!(self.state), st.remove(idx).pack())
                        };
                        return true;
                    }
                    return false;
                }
            }
            false
        } else {
            let mut idx = st.count();
            for i in 0..st.count() {
                if self.recs[st.read(i)].key > key {
                    idx = i;
                    break;
                }
            }
            debug_assert!(idx >= 1, "leftmost routing record is never removed");
            // SAFETY: aligned state word of a live node.
            unsafe { persist_assign(ptr::addr_of_mut!(self.state), st.remove(idx - 1).pack()) };
            true
        }
    }

    /// Folds `right` into `left` and frees it. Preconditions: the nodes
    /// are adjacent siblings (`left`'s live sibling points at `right`)
    /// and their combined count is below [`CARDINALITY`].
    pub fn merge<A: PmAlloc>(alloc: &A, left: *mut Node, right: *mut Node) {
        // SAFETY: left and right are distinct live nodes; the parent
        // has already unlinked right's routing record, and the single
        // writer means nobody else mutates either node.
        unsafe {
            let l = &mut *left;
            let r = &*right;
            let l_st = l.state();
            let r_st = r.state();
            debug_assert!(l_st.count() + r_st.count() < CARDINALITY);

            let separator = l.siblings[l_st.sibling_version()];
            let mut staged = l_st;

            // internal operands carry their subtree boundary over: the
            // separator key routes to the right node's leftmost child
            if !r.leftmost.is_null() {
                let slot = staged.alloc();
                l.recs[slot] = Record::new(separator.key, r.leftmost.offset());
                staged = staged.add(staged.count(), slot);
            }
            for i in 0..r_st.count() {
                let slot = staged.alloc();
                l.recs[slot] = r.recs[r_st.read(i)];
                staged = staged.add(staged.count(), slot);
            }

            // adopt the right node's forward pointer via the shadow slot
            let shadow = 1 - l_st.sibling_version();
            l.siblings[shadow] = r.siblings[r_st.sibling_version()];
            let staged = staged.with_sibling_version(shadow);

            flush(left as *const u8, WO_NODE_SIZE);
            fence();
            persist_assign(ptr::addr_of_mut!(l.state), staged.pack());
        }
        // WARNING: a crash between the publish above and this free
        // leaks the right node; pool recovery has to re-scan.
        alloc.free(right as *mut u8);
    }

    /// Left and right neighbours of the child owning `key`, if any.
    pub fn get_lrchild<A: PmAlloc>(
        &self,
        alloc: &A,
        key: Key,
    ) -> (Option<*mut Node>, Option<*mut Node>) {
        let st = self.state();
        let mut i = 0;
        while i < st.count() {
            if self.recs[st.read(i)].key > key {
                break;
            }
            i += 1;
        }

        let left = if i == 0 {
            None
        } else if i == 1 {
            Some(alloc.absolute(self.leftmost) as *mut Node)
        } else {
            Some(alloc.absolute(RelPtr::from_offset(self.recs[st.read(i - 2)].val)) as *mut Node)
        };
        let right = if i == st.count() {
            None
        } else {
            Some(alloc.absolute(RelPtr::from_offset(self.recs[st.read(i)].val)) as *mut Node)
        };
        (left, right)
    }

    /// Writes a record into a physical slot and stages its slot-array
    /// entry without touching the count. Only valid on nodes not yet
    /// published (split targets, fresh roots).
    pub(crate) fn append_staged(&mut self, rec: Record, slot: usize, pos: usize) {
        self.recs[slot] = rec;
        self.state = self.state().append(pos, slot).pack();
    }

    pub(crate) fn set_count(&mut self, count: usize) {
        self.state = self.state().with_count(count).pack();
    }

    /// Indented structure dump for diagnostics and tests.
    pub fn dump_into<A: PmAlloc>(&self, alloc: &A, depth: usize, out: &mut String) {
        use std::fmt::Write;

        let st = self.state();
        let _ = write!(out, "{:indent$}[n={} ", "", st.count(), indent = depth * 4);
        for i in 0..st.count() {
            let rec = self.recs[st.read(i)];
            let _ = write!(out, "({} {:#x}) ", rec.key, rec.val);
        }
        let sibling = self.live_sibling();
        if sibling.key != MAX_KEY {
            let _ = write!(out, "~> {} ", sibling.key);
        }
        let _ = writeln!(out, "]");

        if !self.is_leaf() {
            // SAFETY: child pointers of a published internal node refer
            // to published nodes.
            unsafe {
                let child = alloc.absolute(self.leftmost) as *const Node;
                (*child).dump_into(alloc, depth + 1, out);
                for i in 0..st.count() {
                    let rel = RelPtr::from_offset(self.recs[st.read(i)].val);
                    let child = alloc.absolute(rel) as *const Node;
                    (*child).dump_into(alloc, depth + 1, out);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pmem::PmPool;
    use tempfile::tempdir;

    fn make_pool() -> (tempfile::TempDir, PmPool) {
        let dir = tempdir().unwrap();
        let pool = PmPool::create(dir.path().join("wo.pool"), 16 << 20).unwrap();
        (dir, pool)
    }

    fn leaf_with_keys(pool: &PmPool, keys: &[Key]) -> *mut Node {
        let node = Node::alloc_in(pool).unwrap();
        for &k in keys {
            unsafe { (*node).insertone(k, k * 100).unwrap() };
        }
        node
    }

    #[test]
    fn node_is_exactly_256_bytes() {
        assert_eq!(std::mem::size_of::<Node>(), WO_NODE_SIZE);
        assert_eq!(std::mem::align_of::<Node>(), 64);
        assert_eq!(std::mem::offset_of!(Node, state), 0);
        assert_eq!(std::mem::offset_of!(Node, leftmost), 8);
        assert_eq!(std::mem::offset_of!(Node, siblings), 16);
        assert_eq!(std::mem::offset_of!(Node, recs), 48);
    }

    #[test]
    fn fresh_node_is_empty_leaf() {
        let (_dir, pool) = make_pool();
        let node = Node::alloc_in(&pool).unwrap();
        let node = unsafe { &*node };

        assert!(node.is_leaf());
        assert_eq!(node.count(), 0);
        assert_eq!(node.live_sibling().key, MAX_KEY);
        assert_eq!(node.get_child(&pool, 42), 0);
    }

    #[test]
    fn insertone_keeps_logical_order() {
        let (_dir, pool) = make_pool();
        let node = leaf_with_keys(&pool, &[30, 10, 20, 5]);
        let node = unsafe { &*node };

        assert_eq!(node.count(), 4);
        let st = node.state();
        let keys: Vec<Key> = (0..4).map(|i| node.recs[st.read(i)].key).collect();
        assert_eq!(keys, vec![5, 10, 20, 30]);
    }

    #[test]
    fn get_child_on_leaf_is_exact_lookup() {
        let (_dir, pool) = make_pool();
        let node = leaf_with_keys(&pool, &[10, 20, 30]);
        let node = unsafe { &*node };

        assert_eq!(node.get_child(&pool, 20), 2000);
        assert_eq!(node.get_child(&pool, 15), 0);
        assert_eq!(node.get_child(&pool, 35), 0);
    }

    #[test]
    fn update_overwrites_in_place() {
        let (_dir, pool) = make_pool();
        let node = leaf_with_keys(&pool, &[1, 2, 3]);
        let node = unsafe { &mut *node };

        assert!(node.update(2, 777));
        assert_eq!(node.get_child(&pool, 2), 777);
        assert!(!node.update(9, 1));
    }

    #[test]
    fn remove_from_leaf_commits_state_only() {
        let (_dir, pool) = make_pool();
        let node = leaf_with_keys(&pool, &[1, 2, 3]);
        let node = unsafe { &mut *node };

        assert!(node.remove(&pool, 2));
        assert_eq!(node.count(), 2);
        assert_eq!(node.get_child(&pool, 2), 0);
        assert_eq!(node.get_child(&pool, 3), 300);
        assert!(!node.remove(&pool, 2));
    }

    #[test]
    fn leaf_split_shape_and_versioning() {
        let (_dir, pool) = make_pool();
        let node_ptr = leaf_with_keys(&pool, &(1..=13).collect::<Vec<_>>());
        let node = unsafe { &mut *node_ptr };
        assert_eq!(node.state().sibling_version(), 0);

        let split = node.store(&pool, 14, 1400).unwrap();
        let (split_key, new_ptr) = split.expect("full node must split");
        let new_node = unsafe { &*new_ptr };

        // the 7th logical key goes to the upper half
        assert_eq!(split_key, 7);
        assert_eq!(node.count(), 6);
        assert_eq!(new_node.count(), 8); // 7 moved + the pending 14

        // version toggled exactly once and the shadow slot went live
        assert_eq!(node.state().sibling_version(), 1);
        let sibling = node.live_sibling();
        assert_eq!(sibling.key, 7);
        assert_eq!(
            pool.absolute(RelPtr::from_offset(sibling.val)) as *const Node,
            new_ptr as *const Node
        );
        // the new node inherited the (empty) chain end
        assert_eq!(new_node.state().sibling_version(), 0);
        assert_eq!(new_node.live_sibling().key, MAX_KEY);

        // the lower half answers for < 7 and delegates >= 7
        for k in 1..=6u64 {
            assert_eq!(node.get_child(&pool, k), k * 100);
        }
        for k in 7..=13u64 {
            assert_eq!(node.get_child(&pool, k), k * 100);
        }
        assert_eq!(node.get_child(&pool, 14), 1400);
    }

    #[test]
    fn internal_split_promotes_middle_child() {
        let (_dir, pool) = make_pool();

        // an internal node routing to 14 dummy children
        let children: Vec<*mut Node> = (0..14).map(|_| Node::alloc_in(&pool).unwrap()).collect();
        let node_ptr = Node::alloc_in(&pool).unwrap();
        let node = unsafe { &mut *node_ptr };
        node.leftmost = pool.relative(children[0] as *const u8);
        for (i, &child) in children.iter().enumerate().skip(1).take(13) {
            node.insertone(i as Key * 10, pool.relative(child as *const u8).offset())
                .unwrap();
        }
        assert_eq!(node.count(), 13);

        let split = node.store(&pool, 135, 0xbeef).unwrap();
        let (split_key, new_ptr) = split.expect("full node must split");
        let new_node = unsafe { &*new_ptr };

        // logical position 6 holds key 70; its child becomes the new
        // node's leftmost
        assert_eq!(split_key, 70);
        assert_eq!(node.count(), 6);
        assert_eq!(new_node.count(), 7); // 6 moved + the pending 135
        assert!(!new_node.is_leaf());
        assert_eq!(
            pool.absolute(new_node.leftmost) as *const Node,
            children[7] as *const Node
        );
    }

    #[test]
    fn merge_folds_right_leaf_into_left() {
        let (_dir, pool) = make_pool();
        let left_ptr = leaf_with_keys(&pool, &[1, 2, 3]);
        let right_ptr = leaf_with_keys(&pool, &[10, 11, 12, 13]);

        // link them as split siblings
        unsafe {
            let left = &mut *left_ptr;
            let shadow = 1 - left.state().sibling_version();
            left.siblings[shadow] =
                Record::new(10, pool.relative(right_ptr as *const u8).offset());
            let published = left.state().with_sibling_version(shadow);
            persist_assign(ptr::addr_of_mut!(left.state), published.pack());
        }

        Node::merge(&pool, left_ptr, right_ptr);

        let left = unsafe { &*left_ptr };
        assert_eq!(left.count(), 7);
        for k in [1u64, 2, 3, 10, 11, 12, 13] {
            assert_eq!(left.get_child(&pool, k), k * 100, "key {}", k);
        }
        // the chain end was adopted from the right node
        assert_eq!(left.live_sibling().key, MAX_KEY);
        assert_eq!(pool.freed_regions(), 1);
    }

    #[test]
    fn get_lrchild_picks_flanking_children() {
        let (_dir, pool) = make_pool();
        let children: Vec<*mut Node> = (0..4).map(|_| Node::alloc_in(&pool).unwrap()).collect();
        let node_ptr = Node::alloc_in(&pool).unwrap();
        let node = unsafe { &mut *node_ptr };
        node.leftmost = pool.relative(children[0] as *const u8);
        for (i, &child) in children.iter().enumerate().skip(1) {
            node.insertone(i as Key * 10, pool.relative(child as *const u8).offset())
                .unwrap();
        }

        // key 15 belongs to children[1]; flanks are children[0] and [2]
        let (l, r) = node.get_lrchild(&pool, 15);
        assert_eq!(l.unwrap(), children[0]);
        assert_eq!(r.unwrap(), children[2]);

        // key 5 belongs to the leftmost child; no left flank
        let (l, r) = node.get_lrchild(&pool, 5);
        assert!(l.is_none());
        assert_eq!(r.unwrap(), children[1]);

        // key 35 belongs to the last child; no right flank
        let (l, r) = node.get_lrchild(&pool, 35);
        assert_eq!(l.unwrap(), children[2]);
        assert!(r.is_none());
    }
}
