//! File header layout and the per-size-class free-list cache.
//!
//! The header is a fixed-layout prefix of the file: magic, the bump
//! region's cursors, one free-list head per size class, and the root
//! pointer. Everything past offset 0 is addressed relative to constants
//! computed here, so a layout change only ever touches this module.

use crate::bio::BlockIo;
use crate::codec::{read_u32_at, read_u64_at, write_u32_at, write_u64_at};
use crate::error::{Error, Result};

/// Maximum number of keys held by a single node before it must split.
pub const MAX_KEYS: usize = 7;

/// Width, in bytes, of a hashed key.
pub const KEY_LEN: usize = 16;

/// Serialized size of a node image: start mark (4), num_keys (4), leaf
/// flag (4), reserved (4), `MAX_KEYS` 16-byte keys, `MAX_KEYS` 8-byte
/// value offsets, `MAX_KEYS + 1` 8-byte child offsets, and the trailing
/// 4-byte end mark.
pub const NODE_SIZE: usize =
    4 * 4 + MAX_KEYS * KEY_LEN + (MAX_KEYS * 2 + 1) * 8 + 4;

/// Number of power-of-two size classes, covering exponents 4..=31
/// (16 bytes up to 2 GiB).
pub const FREELIST_COUNT: usize = 28;

/// Smallest size-class exponent. Size class index `i` holds slots of
/// `2^(i + SMALLEST_EXP)` bytes.
pub const SMALLEST_EXP: u32 = 4;

/// Number of freed-allocation pointers a single free-list block can
/// hold.
pub const FREELIST_BLOCK_ITEMS: usize = 252;

/// On-disk size of one free-list block: prev pointer, next pointer,
/// live-entry count, then `FREELIST_BLOCK_ITEMS` pointers.
pub const FREELIST_BLOCK_SIZE: u64 = 8 * 3 + 8 * FREELIST_BLOCK_ITEMS as u64;

/// Size-class exponent that a free-list block itself belongs to: the
/// smallest power of two that can hold `FREELIST_BLOCK_SIZE` bytes plus
/// its own 8-byte length prefix. This is the size class the special
/// case in [`crate::alloc`] cares about.
pub const FREELIST_SIZE_EXP: u32 = 11; // 2^11 = 2048 >= 2040 + 8

/// Bump-region growth increment used whenever the file must be extended
/// to satisfy an allocation.
pub const PREALLOC_SIZE: u64 = 512 * 1024;

/// 16-byte magic identifying this file format and its version: an
/// 8-byte format tag followed by an 8-byte version tag.
pub const MAGIC: &[u8; 16] = b"REDBTREE00000000";

/// Offset of the `free` field in the header.
pub const HDR_FREE_POS: u64 = 16;

/// Offset of the `freeoff` field in the header.
pub const HDR_FREEOFF_POS: u64 = 24;

/// Offset of the first free-list block head.
pub const HDR_FREELISTS_POS: u64 = 32;

/// Offset of the root pointer, immediately after the last free-list
/// head.
pub const HDR_ROOTPTR_POS: u64 =
    HDR_FREELISTS_POS + FREELIST_BLOCK_SIZE * FREELIST_COUNT as u64;

/// Offset of the initial root node image, written once at creation
/// time.
pub const HDR_ROOT_NODE_POS: u64 = HDR_ROOTPTR_POS + 8;

/// Total size of a freshly created, empty database file.
pub const INITIAL_FILE_SIZE: u64 = HDR_ROOT_NODE_POS + NODE_SIZE as u64;

/// Returns the offset of free-list block `index`'s head within the
/// header.
pub fn freelist_head_offset(index: usize) -> u64 {
    HDR_FREELISTS_POS + FREELIST_BLOCK_SIZE * index as u64
}

/// The size-class index that holds allocations of exactly `2^exponent`
/// bytes.
pub fn size_class_index(exponent: u32) -> usize {
    debug_assert!((SMALLEST_EXP..SMALLEST_EXP + FREELIST_COUNT as u32).contains(&exponent));
    (exponent - SMALLEST_EXP) as usize
}

/// In-memory state mirroring the durable header.
///
/// `free`/`freeoff` describe the bump region; the caller is responsible
/// for persisting them back through [`Header::write_cursors`] whenever
/// they change.
pub struct Header {
    pub free: u64,
    pub freeoff: u64,
    pub root_ptr: u64,
}

impl Header {
    /// Lays out a brand-new, empty file: resizes it to
    /// [`INITIAL_FILE_SIZE`], writes the magic, zeroes the bump region
    /// cursors and every free-list head. The root pointer and root node
    /// image are written separately by the orchestrator, once the
    /// allocator is available to place them.
    pub fn create(bio: &impl BlockIo) -> Result<Self> {
        if bio.len()? != 0 {
            return Err(Error::Corrupt("create called on a non-empty file".into()));
        }
        bio.resize(INITIAL_FILE_SIZE)?;
        bio.pwrite(MAGIC, 0)?;
        write_u64_at(bio, 0, HDR_FREE_POS)?;
        write_u64_at(bio, INITIAL_FILE_SIZE, HDR_FREEOFF_POS)?;
        for i in 0..FREELIST_COUNT {
            let off = freelist_head_offset(i);
            write_u64_at(bio, 0, off)?; // prev
            write_u64_at(bio, 0, off + 8)?; // next
            write_u32_at(bio, 0, off + 16)?; // count
        }
        Ok(Self {
            free: 0,
            freeoff: INITIAL_FILE_SIZE,
            root_ptr: 0,
        })
    }

    /// Loads the header of an existing file, verifying the magic.
    pub fn load(bio: &impl BlockIo) -> Result<Self> {
        let mut magic = [0u8; 16];
        bio.pread(&mut magic, 0)?;
        if &magic != MAGIC {
            return Err(Error::Corrupt("magic mismatch".into()));
        }
        let free = read_u64_at(bio, HDR_FREE_POS)?;
        let freeoff = read_u64_at(bio, HDR_FREEOFF_POS)?;
        let root_ptr = read_u64_at(bio, HDR_ROOTPTR_POS)?;
        let file_len = bio.len()?;
        let bump_end = freeoff
            .checked_add(free)
            .ok_or_else(|| Error::Corrupt("free + freeoff overflows".into()))?;
        if bump_end > file_len {
            return Err(Error::Corrupt("bump region extends past end of file".into()));
        }
        Ok(Self {
            free,
            freeoff,
            root_ptr,
        })
    }

    /// Persists `free`/`freeoff` back to the header.
    pub fn write_cursors(&self, bio: &impl BlockIo) -> Result<()> {
        write_u64_at(bio, self.free, HDR_FREE_POS)?;
        write_u64_at(bio, self.freeoff, HDR_FREEOFF_POS)?;
        Ok(())
    }

    /// Persists the root pointer back to the header.
    pub fn write_root_ptr(&self, bio: &impl BlockIo) -> Result<()> {
        write_u64_at(bio, self.root_ptr, HDR_ROOTPTR_POS)
    }
}

/// Per-size-class cache of free-list block offsets, oldest first, plus
/// the live-entry count of the newest (last) block.
///
/// This is a derived index over durable state (spec section 9): on
/// reopen it is rebuilt by walking `next` pointers from the class's
/// head. The live-entry counts of every block but the newest are never
/// consulted by the allocator and so are not cached.
#[derive(Default, Clone)]
pub struct FreelistCache {
    pub blocks: Vec<u64>,
    pub last_items: u32,
}

impl FreelistCache {
    /// Rebuilds the cache for one size class by walking `next` pointers
    /// starting at its header head.
    pub fn load(bio: &impl BlockIo, class_index: usize) -> Result<Self> {
        let mut blocks = Vec::new();
        let mut ptr = freelist_head_offset(class_index);
        let mut last_items = 0u32;
        loop {
            let next = read_u64_at(bio, ptr + 8)?;
            let count = read_u32_at(bio, ptr + 16)?;
            blocks.push(ptr);
            last_items = count;
            if next == 0 {
                break;
            }
            ptr = next;
        }
        Ok(Self { blocks, last_items })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bio::MemBio;

    #[test]
    fn layout_constants_match_reference() {
        assert_eq!(NODE_SIZE, 252);
        assert_eq!(FREELIST_BLOCK_SIZE, 2040);
        assert_eq!(HDR_ROOTPTR_POS, 32 + 2040 * 28);
    }

    #[test]
    fn create_then_load_round_trips() {
        let bio = MemBio::new();
        let created = Header::create(&bio).unwrap();
        assert_eq!(created.free, 0);
        assert_eq!(created.freeoff, INITIAL_FILE_SIZE);

        write_u64_at(&bio, 42, HDR_ROOTPTR_POS).unwrap();
        let loaded = Header::load(&bio).unwrap();
        assert_eq!(loaded.root_ptr, 42);
        assert_eq!(loaded.freeoff, INITIAL_FILE_SIZE);
    }

    #[test]
    fn rejects_bad_magic() {
        let bio = MemBio::new();
        bio.resize(INITIAL_FILE_SIZE).unwrap();
        bio.pwrite(b"NOT-A-REDBTREE!!", 0).unwrap();
        assert!(Header::load(&bio).is_err());
    }

    #[test]
    fn freelist_cache_walks_chain() {
        let bio = MemBio::new();
        Header::create(&bio).unwrap();
        let class = size_class_index(5);
        let head = freelist_head_offset(class);
        // Simulate a second block linked after the head.
        bio.resize(INITIAL_FILE_SIZE + FREELIST_BLOCK_SIZE).unwrap();
        let second = INITIAL_FILE_SIZE;
        write_u64_at(&bio, second, head + 8).unwrap(); // head.next = second
        write_u64_at(&bio, head, second).unwrap(); // second.prev = head
        write_u64_at(&bio, 0, second + 8).unwrap(); // second.next = 0
        write_u32_at(&bio, 3, second + 16).unwrap(); // second.count = 3

        let cache = FreelistCache::load(&bio, class).unwrap();
        assert_eq!(cache.blocks, vec![head, second]);
        assert_eq!(cache.last_items, 3);
    }
}
