//! Segregated-fit slab allocator.
//!
//! Every allocation is rounded up to a power-of-two size class and
//! prefixed with an 8-byte user-requested length; callers only ever see
//! the offset just past that prefix. Freed slots are threaded onto a
//! linked chain of free-list blocks stored inline in the managed file,
//! one chain per size class — there is no separate metadata file or
//! in-memory-only free list, so a reopen can always reconstruct exactly
//! which bytes are available by walking those chains (see
//! [`crate::header::FreelistCache`]).
//!
//! The one subtlety worth calling out is [`free`]'s handling of freeing
//! an allocation whose size class is the free-list block's own size
//! class while that class's newest block is already full: see the
//! doc comment on [`free`] for why this can't just recurse into
//! [`alloc`].

use crate::barrier::Barrier;
use crate::bio::BlockIo;
use crate::codec::{read_u64_at, write_u32_at, write_u64_at};
use crate::error::{Error, Result};
use crate::header::{
    size_class_index, Header, FREELIST_BLOCK_ITEMS, FREELIST_COUNT, FREELIST_SIZE_EXP,
    PREALLOC_SIZE, SMALLEST_EXP,
};

/// Largest value ever accepted by [`alloc`].
pub const MAX_ALLOC_SIZE: u32 = (1u32 << 31) - 1;

/// All per-size-class free-list caches, rebuilt on open by walking each
/// class's chain (spec section 9: "in-memory caches of disk state").
pub struct Allocator {
    classes: [crate::header::FreelistCache; FREELIST_COUNT],
}

impl Allocator {
    pub fn load(bio: &impl BlockIo) -> Result<Self> {
        let mut classes: [crate::header::FreelistCache; FREELIST_COUNT] = Default::default();
        for (i, class) in classes.iter_mut().enumerate() {
            *class = crate::header::FreelistCache::load(bio, i)?;
        }
        Ok(Self { classes })
    }

    /// The smallest power of two `>= max(16, user_size + 8)`, which is
    /// the number of bytes actually reserved for a `user_size`-byte
    /// allocation once its length prefix is included.
    ///
    /// Computed in `u64` throughout: `user_size` can be as large as
    /// `MAX_ALLOC_SIZE` (`2^31 - 1`), whose length-prefixed real size
    /// (`2^31 + 7` bytes) rounds up past `2^31` — one bit wider than the
    /// largest tracked size class. Doubling a `u32` accumulator through
    /// that boundary would overflow; the reference's own `uint32_t`
    /// doubling does exactly that and can spin forever on this input.
    pub fn real_size(user_size: u32) -> u64 {
        let mut real: u64 = 16;
        let needed = user_size as u64 + 8;
        while real < needed {
            real *= 2;
        }
        real
    }

    fn exponent_of(real_size: u64) -> u32 {
        debug_assert!(real_size.is_power_of_two());
        real_size.trailing_zeros()
    }

    /// Maps a size-class exponent to its index in the class table, or
    /// `None` when the exponent falls outside the `C = 28` tracked
    /// classes (exponents 4..31). Only reachable from allocations within
    /// a few bytes of `MAX_ALLOC_SIZE`, whose length-prefixed real size
    /// rounds up past 2 GiB: the header layout reserves no class for
    /// that, so such allocations skip the free list entirely rather than
    /// be bucketed under a class whose blocks hold a different physical
    /// size (which would corrupt whichever allocation reused the slot).
    fn class_index_for(exp: u32) -> Option<usize> {
        if (SMALLEST_EXP..SMALLEST_EXP + FREELIST_COUNT as u32).contains(&exp) {
            Some(size_class_index(exp))
        } else {
            None
        }
    }

    /// Allocates `size` user bytes, returning the offset of the first
    /// user byte (just past the 8-byte length prefix).
    pub fn alloc(
        &mut self,
        bio: &impl BlockIo,
        header: &mut Header,
        barrier: &Barrier,
        size: u32,
    ) -> Result<u64> {
        if size > MAX_ALLOC_SIZE {
            return Err(Error::Invalid(format!(
                "allocation of {size} bytes exceeds the {MAX_ALLOC_SIZE} byte limit"
            )));
        }
        let real = Self::real_size(size);
        let exp = Self::exponent_of(real);

        if let Some(index) = Self::class_index_for(exp) {
            if let Some(ptr) = self.pop_freelist(bio, header, barrier, index, exp)? {
                let old_size = read_u64_at(bio, ptr - 8)?;
                if old_size != size as u64 {
                    write_u64_at(bio, size as u64, ptr - 8)?;
                    barrier.sync(bio)?;
                }
                log::trace!("alloc: reused freed slot at {ptr} for {size} bytes (real {real})");
                return Ok(ptr);
            }
        }

        self.bump_alloc(bio, header, barrier, size, real)
    }

    /// Grows the bump region if necessary, then carves `real` bytes off
    /// its front.
    fn bump_alloc(
        &mut self,
        bio: &impl BlockIo,
        header: &mut Header,
        barrier: &Barrier,
        size: u32,
        real: u64,
    ) -> Result<u64> {
        if header.free < real {
            let current_size = header.freeoff + header.free;
            let needed = current_size + PREALLOC_SIZE;
            let grown = needed.max(current_size + real);
            bio.resize(grown)?;
            header.free += grown - current_size;
        }

        let ptr = header.freeoff;
        header.free -= real;
        header.freeoff += real;
        header.write_cursors(bio)?;

        write_u64_at(bio, size as u64, ptr)?;
        barrier.sync(bio)?;
        log::trace!("alloc: bumped {real} bytes at {ptr} for {size} user bytes");
        Ok(ptr + 8)
    }

    /// Pops one slot of the given `real` size off its class's free list,
    /// if any is available. Handles the "drain an exhausted newest
    /// block" case described in the module and spec docs.
    fn pop_freelist(
        &mut self,
        bio: &impl BlockIo,
        header: &mut Header,
        barrier: &Barrier,
        index: usize,
        exp: u32,
    ) -> Result<Option<u64>> {
        let class = &mut self.classes[index];

        if class.last_items == 0 && class.blocks.len() <= 1 {
            return Ok(None);
        }

        let mut reclaimed_block = None;
        if class.last_items == 0 {
            // The newest block emptied out; unlink it and hand the
            // unlinking decision down below.
            debug_assert!(class.blocks.len() > 1);
            let prev_block = class.blocks[class.blocks.len() - 2];
            write_u64_at(bio, 0, prev_block + 8)?; // prev.next = 0
            barrier.sync(bio)?;
            let freed_block = class.blocks.pop().unwrap();
            class.last_items = FREELIST_BLOCK_ITEMS as u32;
            reclaimed_block = Some(freed_block);
        }

        if let Some(block) = reclaimed_block {
            if exp == FREELIST_SIZE_EXP {
                // The unlinked block is itself exactly the size being
                // requested: hand it back directly instead of feeding
                // it through `free`, which would just reabsorb it into
                // this same class.
                return Ok(Some(block));
            }
            self.free(bio, header, barrier, block)?;
        }

        let class = &mut self.classes[index];
        let block = *class.blocks.last().unwrap();
        let slot_offset = block + (2 + class.last_items as u64) * 8;
        let ptr = read_u64_at(bio, slot_offset)?;
        class.last_items -= 1;
        write_u32_at(bio, class.last_items, block + 16)?;
        barrier.sync(bio)?;
        Ok(Some(ptr + 8))
    }

    /// Releases the allocation at `offset` (the first user byte, i.e.
    /// just past the length prefix) back to its size class's free list.
    ///
    /// Freeing a slot whose size class is exactly the free-list block's
    /// own size class, while that class's newest block is already full,
    /// is special-cased: reusing the slot being freed *as* the new
    /// newest block avoids a call to [`Allocator::alloc`] of that same
    /// class, which would itself need to pop from the very list that is
    /// currently full — producing a just-unlinked block that would then
    /// need to be freed back into the class we are already mid-free of.
    pub fn free(
        &mut self,
        bio: &impl BlockIo,
        header: &mut Header,
        barrier: &Barrier,
        offset: u64,
    ) -> Result<()> {
        let size = read_u64_at(bio, offset - 8)?;
        let real = Self::real_size(size as u32);
        let exp = Self::exponent_of(real);
        let index = match Self::class_index_for(exp) {
            Some(index) => index,
            None => {
                log::warn!(
                    "free: {offset} (real size {real}) exceeds every tracked size class; \
                     leaking it rather than risk mixing slot sizes on a shared free list"
                );
                return Ok(());
            }
        };

        let is_full = self.classes[index].last_items == FREELIST_BLOCK_ITEMS as u32;

        if is_full && exp == FREELIST_SIZE_EXP {
            let new_block = offset;
            let class = &mut self.classes[index];
            let prev_block = *class.blocks.last().unwrap();
            write_u64_at(bio, 0, new_block + 8)?; // next = 0
            write_u64_at(bio, prev_block, new_block)?; // prev = old newest
            write_u32_at(bio, 0, new_block + 16)?; // count = 0
            barrier.sync(bio)?;
            write_u64_at(bio, new_block, prev_block + 8)?; // prev.next = new_block
            barrier.sync(bio)?;
            class.blocks.push(new_block);
            class.last_items = 0;
            log::debug!(
                "free: {new_block} became the new (empty) free-list block for class {index} directly, avoiding a recursive alloc of its own size class"
            );
            return Ok(());
        }

        if is_full {
            let new_block =
                self.alloc(bio, header, barrier, crate::header::FREELIST_BLOCK_SIZE as u32)?;
            let class = &mut self.classes[index];
            let prev_block = *class.blocks.last().unwrap();
            write_u64_at(bio, 0, new_block + 8)?;
            write_u64_at(bio, prev_block, new_block)?;
            write_u32_at(bio, 0, new_block + 16)?;
            barrier.sync(bio)?;
            write_u64_at(bio, new_block, prev_block + 8)?;
            barrier.sync(bio)?;
            let class = &mut self.classes[index];
            class.blocks.push(new_block);
            class.last_items = 0;
        }

        self.push_entry(bio, barrier, index, offset)
    }

    fn push_entry(
        &mut self,
        bio: &impl BlockIo,
        barrier: &Barrier,
        index: usize,
        offset: u64,
    ) -> Result<()> {
        let class = &mut self.classes[index];
        let block = *class.blocks.last().unwrap();
        let slot_offset = block + (3 + class.last_items as u64) * 8;
        write_u64_at(bio, offset - 8, slot_offset)?;
        barrier.sync(bio)?;
        class.last_items += 1;
        write_u32_at(bio, class.last_items, block + 16)?;
        barrier.sync(bio)?;
        Ok(())
    }

    /// Returns the user-requested size originally passed to `alloc` for
    /// the allocation at `offset`.
    pub fn alloc_size(bio: &impl BlockIo, offset: u64) -> Result<u32> {
        let size = read_u64_at(bio, offset - 8)?;
        Ok(size as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bio::MemBio;
    use crate::header::Header;

    fn new_db() -> (MemBio, Header, Allocator, Barrier) {
        let bio = MemBio::new();
        let header = Header::create(&bio).unwrap();
        let allocator = Allocator::load(&bio).unwrap();
        (bio, header, allocator, Barrier::default())
    }

    #[test]
    fn class_boundaries_match_reference() {
        // size + 8-byte length prefix must fit the power of two: 8+8=16
        // fits the 16-byte class exactly, but 9+8=17 already needs the
        // next one up.
        assert_eq!(Allocator::real_size(8), 16);
        assert_eq!(Allocator::real_size(9), 32);
        assert_eq!(Allocator::real_size(17), 32);
    }

    #[test]
    fn rejects_oversized_allocations() {
        let (bio, mut header, mut allocator, barrier) = new_db();
        assert!(matches!(
            allocator.alloc(&bio, &mut header, &barrier, 1u32 << 31),
            Err(Error::Invalid(_))
        ));
        assert!(allocator
            .alloc(&bio, &mut header, &barrier, (1u32 << 31) - 1)
            .is_ok());
    }

    #[test]
    fn alloc_then_free_then_alloc_is_lifo() {
        let (bio, mut header, mut allocator, barrier) = new_db();
        let p1 = allocator.alloc(&bio, &mut header, &barrier, 10).unwrap();
        allocator.free(&bio, &mut header, &barrier, p1).unwrap();
        let p2 = allocator.alloc(&bio, &mut header, &barrier, 10).unwrap();
        assert_eq!(p1, p2);
    }

    #[test]
    fn alloc_size_reports_user_length() {
        let (bio, mut header, mut allocator, barrier) = new_db();
        let p = allocator.alloc(&bio, &mut header, &barrier, 100).unwrap();
        assert_eq!(Allocator::alloc_size(&bio, p).unwrap(), 100);
    }

    #[test]
    fn free_list_block_special_case_does_not_recurse() {
        // Fill the free-list-sized class's newest block completely, then
        // free one more slot of that same class: the freed slot must
        // become the new newest block without an intervening `alloc`.
        let (bio, mut header, mut allocator, barrier) = new_db();
        let fl_user_size = (1u64 << FREELIST_SIZE_EXP) as u32 - 8;

        let mut ptrs = Vec::new();
        for _ in 0..FREELIST_BLOCK_ITEMS + 1 {
            ptrs.push(
                allocator
                    .alloc(&bio, &mut header, &barrier, fl_user_size)
                    .unwrap(),
            );
        }
        for &p in &ptrs {
            allocator.free(&bio, &mut header, &barrier, p).unwrap();
        }

        let index = size_class_index(FREELIST_SIZE_EXP);
        assert!(allocator.classes[index].blocks.len() >= 2);

        // A further alloc of the same class must succeed (reusing freed
        // slots), proving the chain stayed well-formed.
        let reused = allocator
            .alloc(&bio, &mut header, &barrier, fl_user_size)
            .unwrap();
        assert!(ptrs.contains(&reused));
    }
}
