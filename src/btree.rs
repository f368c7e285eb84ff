//! The copy-on-write B-tree engine.
//!
//! Every node on the path from the root to an insertion point is
//! replaced by a fresh image rather than mutated in place: a new node is
//! written and flushed, the single pointer that used to reference the
//! old node is flipped to the new one and flushed, and only then is the
//! old node's storage freed. A crash at any point during that sequence
//! leaves either the old tree or the new tree fully intact, never a
//! mixture — see [`crate::barrier`] for the mechanism and spec section
//! 4.5 for the ordering this module must preserve.
//!
//! The tree is a classic CLRS B-tree of minimum degree `t = 4` (so up to
//! `MAX_KEYS = 7` keys per node): full nodes are split on the way down
//! during insertion, which means `add` never has to recurse back up to
//! fix an overflow.
//!
//! Every recursive call carries `pointed_by`: the absolute file offset
//! of the single 64-bit slot that currently references the node being
//! visited. For the root that slot lives in the header
//! ([`crate::header::HDR_ROOTPTR_POS`]); for any other node it is one of
//! its parent's child slots. Carrying this offset explicitly, rather
//! than re-deriving "who points at me" after the fact, is what lets
//! [`Engine::replace_node`] treat the root and interior nodes
//! identically.

use crate::alloc::Allocator;
use crate::barrier::Barrier;
use crate::bio::BlockIo;
use crate::codec::write_u64_at;
use crate::error::Result;
use crate::header::{Header, HDR_ROOTPTR_POS, MAX_KEYS, NODE_SIZE};
use crate::node::{self, Key, Node};

const HALF: usize = MAX_KEYS / 2; // 3

/// Bundles everything a tree operation needs so call sites don't have to
/// thread five parameters through every recursive call.
pub struct Engine<'a, B: BlockIo> {
    pub bio: &'a B,
    pub header: &'a mut Header,
    pub alloc: &'a mut Allocator,
    pub barrier: &'a Barrier,
    pub mark: &'a mut u32,
    /// Offset of the most recent node image written by
    /// [`Engine::write_fresh_node`]. Used as an implicit return value so
    /// the node-writing helpers don't have to be threaded through every
    /// call site that needs the fresh offset.
    last_written: u64,
}

impl<'a, B: BlockIo> Engine<'a, B> {
    pub fn new(
        bio: &'a B,
        header: &'a mut Header,
        alloc: &'a mut Allocator,
        barrier: &'a Barrier,
        mark: &'a mut u32,
    ) -> Self {
        Self {
            bio,
            header,
            alloc,
            barrier,
            mark,
            last_written: 0,
        }
    }

    fn next_mark(&mut self) -> u32 {
        *self.mark = self.mark.wrapping_add(1);
        *self.mark
    }

    /// Looks up `key`, returning the offset of its value if present.
    pub fn find(&self, key: &Key) -> Result<Option<u64>> {
        if self.header.root_ptr == 0 {
            return Ok(None);
        }
        self.find_rec(self.header.root_ptr, key)
    }

    fn find_rec(&self, node_ptr: u64, key: &Key) -> Result<Option<u64>> {
        let node = node::read_node(self.bio, node_ptr)?;
        let i = lower_bound(&node, key);
        if i < node.num_keys && &node.keys[i] == key {
            return Ok(Some(node.values[i]));
        }
        if node.is_leaf {
            return Ok(None);
        }
        self.find_rec(node.children[i], key)
    }

    /// Inserts `key` -> `value_offset`, replacing the existing value
    /// offset if `key` is already present and `replace` is set.
    ///
    /// Returns `Ok(false)` without modifying the tree if `key` is
    /// already present and `replace` is false.
    pub fn add(&mut self, key: &Key, value_offset: u64, replace: bool) -> Result<bool> {
        if self.header.root_ptr == 0 {
            let root = Node::empty_leaf();
            self.write_fresh_node(&root)?;
            // `write_fresh_node` doesn't know about the root slot; wire
            // it up directly since there is no old pointer to flip yet.
            let root_ptr = self.last_written;
            self.header.root_ptr = root_ptr;
            self.header.write_root_ptr(self.bio)?;
            self.barrier.sync(self.bio)?;
        }

        let root = node::read_node(self.bio, self.header.root_ptr)?;
        if root.is_full() {
            // Wrap the old root in a fresh, single-child internal node
            // first, so the old root can be split like any other full
            // child instead of needing special-cased root-splitting
            // logic.
            let new_root_image = Node::empty_internal(self.header.root_ptr);
            self.write_fresh_node(&new_root_image)?;
            let new_root_ptr = self.last_written;

            let old_root_ptr = self.header.root_ptr;
            self.header.root_ptr = new_root_ptr;
            self.header.write_root_ptr(self.bio)?;
            self.barrier.sync(self.bio)?;

            self.split_child(new_root_ptr, HDR_ROOTPTR_POS, 0, old_root_ptr)?;
        }

        self.insert_nonfull(self.header.root_ptr, HDR_ROOTPTR_POS, key, value_offset, replace)
    }

    /// Inserts into the subtree rooted at `node_ptr`, which must not be
    /// full. `pointed_by` is the offset of the slot that references
    /// `node_ptr`.
    fn insert_nonfull(
        &mut self,
        mut node_ptr: u64,
        pointed_by: u64,
        key: &Key,
        value_offset: u64,
        replace: bool,
    ) -> Result<bool> {
        let node = node::read_node(self.bio, node_ptr)?;
        let i = lower_bound(&node, key);

        if i < node.num_keys && &node.keys[i] == key {
            if !replace {
                return Ok(false);
            }
            let slot = node_ptr + Node::value_slot_offset(i);
            write_u64_at(self.bio, value_offset, slot)?;
            self.barrier.sync(self.bio)?;
            return Ok(true);
        }

        if node.is_leaf {
            let mut fresh = node.clone();
            fresh.insert_key_at(i, *key, value_offset);
            self.replace_node(node_ptr, &fresh, pointed_by)?;
            return Ok(true);
        }

        let child_index = i;
        let child_ptr = node.children[child_index];
        let child = node::read_node(self.bio, child_ptr)?;

        if child.is_full() {
            self.split_child(node_ptr, pointed_by, child_index, child_ptr)?;
            // The split promotes the child's median key into this node,
            // which may be an exact match for `key` (the "duplicate" or
            // "replace" branch at the top of this function), and always
            // changes which child slot `key` belongs under. Recurse on
            // the freshly split parent itself, the way the reference
            // recurses into `newnode`, rather than re-deriving the child
            // index here and risking a stale match.
            node_ptr = self.last_written;
            return self.insert_nonfull(node_ptr, pointed_by, key, value_offset, replace);
        }

        let child_pointed_by = node_ptr + Node::child_slot_offset(child_index);
        self.insert_nonfull(child_ptr, child_pointed_by, key, value_offset, replace)
    }

    /// Splits the full child at `parent.children[child_index]` (whose
    /// offset is `child_ptr`) into two half-full siblings, promoting the
    /// median key (and its value offset) into a fresh image of the
    /// parent. `parent_pointed_by` is the offset of the slot that
    /// references `parent_ptr`.
    ///
    /// All three participants (left half, right half, parent) are
    /// written as brand-new node images; the old child and old parent
    /// images are freed only after the parent's rewritten pointer has
    /// been flushed. After this call, `self.last_written` holds the
    /// fresh parent's offset.
    fn split_child(
        &mut self,
        parent_ptr: u64,
        parent_pointed_by: u64,
        child_index: usize,
        child_ptr: u64,
    ) -> Result<()> {
        let child = node::read_node(self.bio, child_ptr)?;
        debug_assert!(child.is_full());

        let mut left = Node {
            num_keys: HALF,
            is_leaf: child.is_leaf,
            ..Node::default()
        };
        left.keys[..HALF].copy_from_slice(&child.keys[..HALF]);
        left.values[..HALF].copy_from_slice(&child.values[..HALF]);
        if !child.is_leaf {
            left.children[..=HALF].copy_from_slice(&child.children[..=HALF]);
        }

        let right_len = MAX_KEYS - HALF - 1;
        let mut right = Node {
            num_keys: right_len,
            is_leaf: child.is_leaf,
            ..Node::default()
        };
        right.keys[..right_len].copy_from_slice(&child.keys[HALF + 1..]);
        right.values[..right_len].copy_from_slice(&child.values[HALF + 1..]);
        if !child.is_leaf {
            right.children[..=right_len].copy_from_slice(&child.children[HALF + 1..]);
        }

        self.write_fresh_node(&left)?;
        let left_ptr = self.last_written;
        self.write_fresh_node(&right)?;
        let right_ptr = self.last_written;

        let parent = node::read_node(self.bio, parent_ptr)?;
        let median_key = child.keys[HALF];
        let median_value = child.values[HALF];

        let mut fresh_parent = parent.clone();
        let old_num_keys = parent.num_keys;
        fresh_parent.insert_key_at(child_index, median_key, median_value);
        for j in (child_index + 1..=old_num_keys).rev() {
            fresh_parent.children[j + 1] = parent.children[j];
        }
        fresh_parent.children[child_index] = left_ptr;
        fresh_parent.children[child_index + 1] = right_ptr;

        self.replace_node(parent_ptr, &fresh_parent, parent_pointed_by)?;
        self.alloc
            .free(self.bio, self.header, self.barrier, child_ptr)?;
        Ok(())
    }

    /// Writes `fresh` to a freshly allocated node-sized slot, flushes
    /// it, and records the offset in `self.last_written`. Does not
    /// touch any existing pointer.
    fn write_fresh_node(&mut self, fresh: &Node) -> Result<()> {
        let mark = self.next_mark();
        let ptr = self
            .alloc
            .alloc(self.bio, self.header, self.barrier, NODE_SIZE as u32)?;
        node::write_node(self.bio, fresh, ptr, mark)?;
        self.barrier.sync(self.bio)?;
        self.last_written = ptr;
        Ok(())
    }

    /// Writes `fresh` as a new node image, flips the pointer at
    /// `pointed_by` to the new image, flushes, and only then frees
    /// `old_ptr`. Leaves the new offset in `self.last_written`.
    fn replace_node(&mut self, old_ptr: u64, fresh: &Node, pointed_by: u64) -> Result<()> {
        self.write_fresh_node(fresh)?;
        let new_ptr = self.last_written;
        if pointed_by == HDR_ROOTPTR_POS {
            self.header.root_ptr = new_ptr;
            self.header.write_root_ptr(self.bio)?;
        } else {
            write_u64_at(self.bio, new_ptr, pointed_by)?;
        }
        self.barrier.sync(self.bio)?;
        self.alloc
            .free(self.bio, self.header, self.barrier, old_ptr)?;
        Ok(())
    }
}

/// Index of the first key `>= key`, i.e. the child slot to descend into
/// (or the exact match position).
fn lower_bound(node: &Node, key: &Key) -> usize {
    let mut lo = 0usize;
    let mut hi = node.num_keys;
    while lo < hi {
        let mid = (lo + hi) / 2;
        if &node.keys[mid] < key {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}
