//! Fixed-size B-tree node images.
//!
//! A node is framed by a start mark and an end mark that must be equal;
//! any reader that sees them differ treats the node as torn by a
//! mid-write crash and reports [`Error::Corrupt`]. The mark itself
//! carries no other meaning — it is bumped on every write so that two
//! writes to the same offset never produce identical frames by
//! coincidence.

use crate::bio::BlockIo;
use crate::error::{Error, Result};
use crate::header::{KEY_LEN, MAX_KEYS, NODE_SIZE};

/// A hashed key: 16 opaque bytes, compared by unsigned lexicographic
/// order.
pub type Key = [u8; KEY_LEN];

/// The in-memory representation of one B-tree node.
///
/// `keys[0..num_keys]` are strictly increasing. For an internal node,
/// `children[0..=num_keys]` are all non-zero and `children[i]` holds
/// only keys less than `keys[i]` (and greater than `keys[i - 1]`, if
/// any). A leaf has every child slot set to zero.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    pub num_keys: usize,
    pub is_leaf: bool,
    pub keys: [Key; MAX_KEYS],
    pub values: [u64; MAX_KEYS],
    pub children: [u64; MAX_KEYS + 1],
}

impl Default for Node {
    fn default() -> Self {
        Self {
            num_keys: 0,
            is_leaf: true,
            keys: [[0u8; KEY_LEN]; MAX_KEYS],
            values: [0u64; MAX_KEYS],
            children: [0u64; MAX_KEYS + 1],
        }
    }
}

impl Node {
    /// A fresh, empty leaf node.
    pub fn empty_leaf() -> Self {
        Self::default()
    }

    /// A fresh, empty internal node with a single child.
    pub fn empty_internal(only_child: u64) -> Self {
        let mut n = Self {
            is_leaf: false,
            ..Self::default()
        };
        n.children[0] = only_child;
        n
    }

    pub fn is_full(&self) -> bool {
        self.num_keys == MAX_KEYS
    }

    /// Byte offset, within a serialized node image, of value slot `i`.
    /// Used by the engine to overwrite a single value pointer in place
    /// during a `replace` (the only in-place mutation it performs).
    pub fn value_slot_offset(i: usize) -> u64 {
        (16 + KEY_LEN * MAX_KEYS + 8 * i) as u64
    }

    /// Byte offset, within a serialized node image, of child slot `i`.
    /// Used to compute the `pointed_by` offset when descending into a
    /// child that did not need to be split.
    pub fn child_slot_offset(i: usize) -> u64 {
        (16 + KEY_LEN * MAX_KEYS + 8 * MAX_KEYS + 8 * i) as u64
    }

    /// Shifts keys/values right starting at `i`, then inserts `key`/`valoff`
    /// at position `i`. Children are left untouched; callers that also
    /// need to make room in an internal node's child slots (splitting)
    /// shift those separately.
    pub fn insert_key_at(&mut self, i: usize, key: Key, valoff: u64) {
        for j in (i..self.num_keys).rev() {
            self.keys[j + 1] = self.keys[j];
            self.values[j + 1] = self.values[j];
        }
        self.keys[i] = key;
        self.values[i] = valoff;
        self.num_keys += 1;
    }
}

/// Serializes `node`, framing it with `mark` at both start and end, and
/// writes the image at `offset`.
pub fn write_node(bio: &impl BlockIo, node: &Node, offset: u64, mark: u32) -> Result<()> {
    let mut buf = [0u8; NODE_SIZE];
    let mut p = 0usize;

    buf[p..p + 4].copy_from_slice(&mark.to_be_bytes());
    p += 4;
    buf[p..p + 4].copy_from_slice(&(node.num_keys as u32).to_be_bytes());
    p += 4;
    buf[p..p + 4].copy_from_slice(&(node.is_leaf as u32).to_be_bytes());
    p += 4;
    buf[p..p + 4].copy_from_slice(&0u32.to_be_bytes()); // reserved
    p += 4;

    for key in &node.keys {
        buf[p..p + KEY_LEN].copy_from_slice(key);
        p += KEY_LEN;
    }
    for value in &node.values {
        buf[p..p + 8].copy_from_slice(&value.to_be_bytes());
        p += 8;
    }
    for child in &node.children {
        buf[p..p + 8].copy_from_slice(&child.to_be_bytes());
        p += 8;
    }
    buf[p..p + 4].copy_from_slice(&mark.to_be_bytes());
    p += 4;
    debug_assert_eq!(p, NODE_SIZE);

    bio.pwrite(&buf, offset)
}

/// Reads and validates the node image at `offset`.
pub fn read_node(bio: &impl BlockIo, offset: u64) -> Result<Node> {
    let mut buf = [0u8; NODE_SIZE];
    bio.pread(&mut buf, offset)?;

    let start_mark = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    let end_mark = u32::from_be_bytes(buf[NODE_SIZE - 4..NODE_SIZE].try_into().unwrap());
    if start_mark != end_mark {
        return Err(Error::Corrupt(format!(
            "node at {offset}: start mark {start_mark} != end mark {end_mark}"
        )));
    }

    let mut p = 4usize;
    let num_keys = u32::from_be_bytes(buf[p..p + 4].try_into().unwrap()) as usize;
    p += 4;
    let is_leaf = u32::from_be_bytes(buf[p..p + 4].try_into().unwrap()) != 0;
    p += 4;
    p += 4; // reserved

    if num_keys > MAX_KEYS {
        return Err(Error::Corrupt(format!(
            "node at {offset}: num_keys {num_keys} exceeds MAX_KEYS"
        )));
    }

    let mut keys = [[0u8; KEY_LEN]; MAX_KEYS];
    for key in &mut keys {
        key.copy_from_slice(&buf[p..p + KEY_LEN]);
        p += KEY_LEN;
    }
    let mut values = [0u64; MAX_KEYS];
    for value in &mut values {
        *value = u64::from_be_bytes(buf[p..p + 8].try_into().unwrap());
        p += 8;
    }
    let mut children = [0u64; MAX_KEYS + 1];
    for child in &mut children {
        *child = u64::from_be_bytes(buf[p..p + 8].try_into().unwrap());
        p += 8;
    }

    Ok(Node {
        num_keys,
        is_leaf,
        keys,
        values,
        children,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bio::MemBio;

    fn key(n: u8) -> Key {
        let mut k = [0u8; KEY_LEN];
        k[KEY_LEN - 1] = n;
        k
    }

    #[test]
    fn round_trips_a_node() {
        let bio = MemBio::new();
        bio.resize(NODE_SIZE as u64).unwrap();

        let mut n = Node::empty_leaf();
        n.insert_key_at(0, key(1), 100);
        n.insert_key_at(1, key(2), 200);

        write_node(&bio, &n, 0, 7).unwrap();
        let read_back = read_node(&bio, 0).unwrap();
        assert_eq!(read_back, n);
    }

    #[test]
    fn detects_torn_marks() {
        let bio = MemBio::new();
        bio.resize(NODE_SIZE as u64).unwrap();
        let n = Node::empty_leaf();
        write_node(&bio, &n, 0, 7).unwrap();
        // Corrupt the end mark only.
        bio.pwrite(&99u32.to_be_bytes(), (NODE_SIZE - 4) as u64)
            .unwrap();
        assert!(matches!(read_node(&bio, 0), Err(Error::Corrupt(_))));
    }

    #[test]
    fn insert_key_at_shifts_right() {
        let mut n = Node::empty_leaf();
        n.insert_key_at(0, key(1), 10);
        n.insert_key_at(1, key(3), 30);
        n.insert_key_at(1, key(2), 20);
        assert_eq!(n.num_keys, 3);
        assert_eq!(n.keys[0], key(1));
        assert_eq!(n.keys[1], key(2));
        assert_eq!(n.keys[2], key(3));
        assert_eq!(n.values, [10, 20, 30, 0, 0, 0, 0]);
    }
}
