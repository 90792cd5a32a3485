//! # The Linearized Search Tree
//!
//! `FixTree` is the read-optimized layer: a geometrically full tree
//! whose inner levels live back-to-back in a single buffer, children
//! addressed by arithmetic instead of pointers.
//!
//! ## Level layout
//!
//! Level `l` of the inner buffer starts at
//! `offset[l] = (32^l - 1) / 31` and holds `32^l` nodes. The child `c`
//! of the node at global index `n` on level `l` sits at
//!
//! ```text
//! offset[l + 1] + (n - offset[l]) * 32 + c
//! ```
//!
//! and after the last inner level the same arithmetic indexes the leaf
//! buffer. A lookup therefore reads one 256-byte node per level plus
//! one leaf, each scan confined to consecutive cache lines.
//!
//! ## Bulk construction
//!
//! Leaves are filled with 8 records each from the sorted input and
//! persisted one by one; each inner level is then derived bottom-up
//! from the first keys of the level below and persisted before the next
//! level is built. The entrance (buffer pointers, height, leaf count)
//! is committed last, so a crash mid-build leaves nothing reachable -
//! reclaiming the orphaned buffers is the pool's recovery problem, not
//! the tree's.
//!
//! ## Mutation within a frozen shape
//!
//! The tree's shape never changes after construction. An insert claims
//! any tombstone slot in the target leaf (value first, then key, each
//! committed separately so a torn insert is invisible); a delete
//! tombstones a key with one commit. Deletes refuse to remove a leaf's
//! slot-0 anchor while other records remain, because the inner levels
//! route by the anchors captured at build time. When a leaf has no free
//! slot the insert is rejected and the caller escalates to the
//! write-optimized layer.

use std::ptr;

use eyre::{ensure, Result};

use super::node::{
    Entrance, InnerNode, LeafNode, ENTRANCE_REGION_SIZE, FIX_NODE_SIZE, INNER_CARD,
    LEAF_BUILD_CARD, LEAF_CARD, MAX_HEIGHT,
};
use crate::pmem::{fence, flush, persist_assign, PmAlloc};
use crate::types::{Key, Record, RelPtr, MAX_KEY};

pub struct FixTree<'a, A: PmAlloc> {
    alloc: &'a A,
    inner: *mut InnerNode,
    leaves: *mut LeafNode,
    height: u32,
    leaf_cnt: u32,
    entrance: *mut Entrance,
    level_offset: [u64; MAX_HEIGHT + 1],
}

impl<'a, A: PmAlloc> FixTree<'a, A> {
    /// Bulk-constructs a tree from records sorted by key.
    pub fn build(alloc: &'a A, records: &[Record]) -> Result<Self> {
        ensure!(!records.is_empty(), "cannot bulk-load an empty record set");
        debug_assert!(
            records.windows(2).all(|w| w[0].key < w[1].key),
            "bulk-load input must be sorted by strictly ascending key"
        );

        let record_cnt = records.len();
        let leaf_cnt = record_cnt.div_ceil(LEAF_BUILD_CARD);

        let mut height = 1usize;
        let mut level_cap = INNER_CARD;
        while level_cap < leaf_cnt {
            level_cap *= INNER_CARD;
            height += 1;
        }
        ensure!(
            height <= MAX_HEIGHT,
            "record set of {} exceeds the maximum tree height",
            record_cnt
        );

        let mut inner_cnt = 0usize;
        let mut nodes_at_level = 1usize;
        for _ in 0..height {
            inner_cnt += nodes_at_level;
            nodes_at_level *= INNER_CARD;
        }

        let leaf_rel = alloc.malloc((leaf_cnt * FIX_NODE_SIZE).max(ENTRANCE_REGION_SIZE))?;
        let leaves = alloc.absolute(leaf_rel) as *mut LeafNode;
        let inner_rel = alloc.malloc((inner_cnt * FIX_NODE_SIZE).max(ENTRANCE_REGION_SIZE))?;
        let inner = alloc.absolute(inner_rel) as *mut InnerNode;

        // SAFETY: both buffers were just allocated with at least
        // leaf_cnt / inner_cnt nodes of space, 64-byte aligned, and are
        // exclusively ours until the entrance is published.
        unsafe {
            for i in 0..leaf_cnt {
                let leaf = &mut *leaves.add(i);
                for j in 0..LEAF_BUILD_CARD {
                    let idx = i * LEAF_BUILD_CARD + j;
                    if idx < record_cnt {
                        leaf.keys[j] = records[idx].key;
                        leaf.vals[j] = records[idx].val;
                    } else {
                        leaf.keys[j] = MAX_KEY;
                        leaf.vals[j] = 0;
                    }
                }
                for j in LEAF_BUILD_CARD..LEAF_CARD {
                    leaf.keys[j] = MAX_KEY;
                    leaf.vals[j] = 0;
                }
                flush(leaf as *const LeafNode as *const u8, FIX_NODE_SIZE);
            }

            // Every slot starts as the sentinel; each level's valid
            // prefix overwrites it below.
            for n in 0..inner_cnt {
                (*inner.add(n)).keys = [MAX_KEY; INNER_CARD];
            }
        }

        let level_offset = Self::level_offsets(height as u32);

        // SAFETY: all indices below stay inside the two buffers:
        // level l holds ceil-divided counts of the level beneath it,
        // which the inner_cnt sum above accounts for exactly.
        unsafe {
            let mut entry_cnt = leaf_cnt;
            for l in (0..height).rev() {
                let base = level_offset[l] as usize;
                for i in 0..entry_cnt {
                    let first = if l == height - 1 {
                        (*leaves.add(i)).keys[0]
                    } else {
                        (*inner.add(level_offset[l + 1] as usize + i)).keys[0]
                    };
                    (*inner.add(base + i / INNER_CARD)).keys[i % INNER_CARD] = first;
                }
                let touched = entry_cnt.div_ceil(INNER_CARD);
                flush(inner.add(base) as *const u8, touched * FIX_NODE_SIZE);
                entry_cnt = touched;
            }
        }
        fence();

        let ent_rel = alloc.malloc(ENTRANCE_REGION_SIZE)?;
        let entrance = alloc.absolute(ent_rel) as *mut Entrance;

        // SAFETY: the entrance region is freshly allocated and 8-byte
        // aligned; each persist_assign below commits one of its words.
        // The buffer pointers go first, the height/leaf_cnt word last:
        // recovery that sees the final word sees a complete tree.
        unsafe {
            persist_assign(
                ptr::addr_of_mut!((*entrance).leaf_buff) as *mut u64,
                leaf_rel.offset(),
            );
            persist_assign(
                ptr::addr_of_mut!((*entrance).inner_buff) as *mut u64,
                inner_rel.offset(),
            );
            // height and leaf_cnt share the third 8-byte word
            let meta = ptr::addr_of_mut!((*entrance).height) as *mut u64;
            (*entrance).height = height as u32;
            (*entrance).leaf_cnt = leaf_cnt as u32;
            persist_assign(meta, *meta);
        }

        Ok(Self {
            alloc,
            inner,
            leaves,
            height: height as u32,
            leaf_cnt: leaf_cnt as u32,
            entrance,
            level_offset,
        })
    }

    /// Rehydrates a tree from its persisted entrance.
    pub fn recover(alloc: &'a A, entrance_rel: RelPtr) -> Result<Self> {
        ensure!(!entrance_rel.is_null(), "null entrance pointer");

        let entrance = alloc.absolute(entrance_rel) as *mut Entrance;
        // SAFETY: the entrance was committed by build() at this offset;
        // Entrance is Copy and the read is aligned.
        let ent = unsafe { *entrance };

        ensure!(
            ent.height >= 1 && ent.height as usize <= MAX_HEIGHT,
            "corrupt entrance: height {}",
            ent.height
        );
        ensure!(ent.leaf_cnt >= 1, "corrupt entrance: zero leaves");
        ensure!(
            !ent.leaf_buff.is_null() && !ent.inner_buff.is_null(),
            "corrupt entrance: null buffer pointer"
        );

        Ok(Self {
            alloc,
            inner: alloc.absolute(ent.inner_buff) as *mut InnerNode,
            leaves: alloc.absolute(ent.leaf_buff) as *mut LeafNode,
            height: ent.height,
            leaf_cnt: ent.leaf_cnt,
            entrance,
            level_offset: Self::level_offsets(ent.height),
        })
    }

    fn level_offsets(height: u32) -> [u64; MAX_HEIGHT + 1] {
        let mut offsets = [0u64; MAX_HEIGHT + 1];
        let mut total = 0u64;
        for (l, slot) in offsets.iter_mut().enumerate().take(height as usize) {
            *slot = total;
            total += (INNER_CARD as u64).pow(l as u32);
        }
        offsets[height as usize] = total;
        offsets
    }

    /// Walks the inner levels down to the leaf owning `key`.
    fn leaf_index(&self, key: Key) -> usize {
        let mut idx = 0usize;
        for l in 0..self.height as usize {
            // SAFETY: idx stays within level l: it starts at the root and
            // each step lands on a child slot the parent's key prefix
            // vouches for (MAX_KEY padding is never followed).
            let child = unsafe { (*self.inner.add(idx)).search(key) };
            // -1 steers into the leftmost branch
            let child = child.max(0) as usize;
            idx = self.level_offset[l + 1] as usize
                + (idx - self.level_offset[l] as usize) * INNER_CARD
                + child;
        }
        idx - self.level_offset[self.height as usize] as usize
    }

    /// Pointer to the value slot of the greatest key at or below `key`
    /// on the lookup path, or the slot of the leaf minimum when no such
    /// key exists.
    pub fn find_lower(&self, key: Key) -> *mut u64 {
        let li = self.leaf_index(key);
        // SAFETY: leaf_index returns an index the inner levels route to,
        // which is always within the leaf buffer.
        unsafe {
            let leaf = self.leaves.add(li);
            let pos = (*leaf).max_leq(key);
            ptr::addr_of_mut!((*leaf).vals[pos])
        }
    }

    /// The record behind [`find_lower`], by value.
    pub fn find_lower_record(&self, key: Key) -> Record {
        let li = self.leaf_index(key);
        // SAFETY: as in find_lower.
        unsafe {
            let leaf = &*self.leaves.add(li);
            let pos = leaf.max_leq(key);
            Record::new(leaf.keys[pos], leaf.vals[pos])
        }
    }

    /// The value behind [`find_lower`].
    pub fn lookup(&self, key: Key) -> u64 {
        // SAFETY: find_lower always returns a live slot in the leaf buffer.
        unsafe { *self.find_lower(key) }
    }

    /// Inserts into the target leaf's first free slot. Returns `false`
    /// when the leaf is full; the caller then escalates to the
    /// write-optimized layer or triggers a rebuild.
    pub fn insert(&mut self, key: Key, val: u64) -> bool {
        debug_assert!(key != MAX_KEY);
        let li = self.leaf_index(key);
        // SAFETY: the leaf index is in range; the two persist_assigns
        // commit value before key, so the record only becomes visible
        // (and durable) once the key lands.
        unsafe {
            let leaf = &mut *self.leaves.add(li);
            for i in 0..LEAF_CARD {
                if leaf.keys[i] == MAX_KEY {
                    persist_assign(ptr::addr_of_mut!(leaf.vals[i]), val);
                    persist_assign(ptr::addr_of_mut!(leaf.keys[i]), key);
                    return true;
                }
            }
        }
        false
    }

    /// Tombstones the greatest key at or below `key` in its leaf.
    ///
    /// Refuses (returns `false`) when that key sits in slot 0 while the
    /// leaf still holds other live records: slot 0 is the anchor the
    /// inner levels route by. A leaf's last record may always go.
    pub fn try_remove(&mut self, key: Key) -> bool {
        let li = self.leaf_index(key);
        // SAFETY: leaf index in range; the single persist_assign is the
        // commit point of the delete.
        unsafe {
            let leaf = &mut *self.leaves.add(li);
            let mut best_i = 0usize;
            let mut best_key = leaf.keys[0];
            let mut rec_cnt = 1usize;
            for i in 1..LEAF_CARD {
                let k = leaf.keys[i];
                if k != MAX_KEY {
                    rec_cnt += 1;
                    if k <= key && k > best_key {
                        best_key = k;
                        best_i = i;
                    }
                }
            }

            if best_i == 0 && rec_cnt > 1 {
                return false;
            }
            persist_assign(ptr::addr_of_mut!(leaf.keys[best_i]), MAX_KEY);
            true
        }
    }

    /// Merges this tree's live records with a sorted external input.
    ///
    /// Tombstones are skipped; on equal keys the incoming record wins
    /// (it is the newer write). The output is strictly ascending and is
    /// the bulk-load input for the replacement tree.
    pub fn merge_into(&self, input: &[Record], out: &mut Vec<Record>) {
        debug_assert!(input.windows(2).all(|w| w[0].key < w[1].key));

        let mut leaf_recs = (0..self.leaf_cnt as usize)
            .flat_map(|i| {
                // SAFETY: i < leaf_cnt indexes the leaf buffer.
                let sorted = unsafe { (*self.leaves.add(i)).sorted_records() };
                sorted.into_iter().take_while(|r| r.key != MAX_KEY)
            })
            .peekable();
        let mut incoming = input.iter().copied().peekable();

        loop {
            let a = incoming.peek().copied();
            let b = leaf_recs.peek().copied();
            match (a, b) {
                (Some(x), Some(y)) => {
                    if x.key == y.key {
                        out.push(x);
                        incoming.next();
                        leaf_recs.next();
                    } else if x.key < y.key {
                        out.push(x);
                        incoming.next();
                    } else {
                        out.push(y);
                        leaf_recs.next();
                    }
                }
                (Some(_), None) => {
                    out.extend(incoming.by_ref());
                    break;
                }
                (None, Some(_)) => {
                    out.extend(leaf_recs.by_ref());
                    break;
                }
                (None, None) => break,
            }
        }
    }

    /// Pointer to the first bulk-loaded value slot.
    pub fn first_value(&self) -> *mut u64 {
        // SAFETY: the tree always has at least one leaf.
        unsafe { ptr::addr_of_mut!((*self.leaves).vals[0]) }
    }

    /// The persisted entrance, for stashing in a pool root slot.
    pub fn entrance(&self) -> RelPtr {
        self.alloc.relative(self.entrance as *const u8)
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn leaf_cnt(&self) -> u32 {
        self.leaf_cnt
    }

    /// Releases the tree's three PM regions back to the allocator.
    pub fn free(self) {
        self.alloc.free(self.inner as *mut u8);
        self.alloc.free(self.leaves as *mut u8);
        self.alloc.free(self.entrance as *mut u8);
    }
}
