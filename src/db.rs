//! The `Database` orchestrator: ties the block I/O port, the on-disk
//! header, the slab allocator, the write-ordering barrier and the
//! B-tree engine together into the single public entry point.

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::alloc::Allocator;
use crate::barrier::Barrier;
use crate::bio::{BlockIo, FileBio};
use crate::btree::Engine;
use crate::error::Result;
use crate::header::Header;
use crate::node::Key;

/// A single-file, on-disk, crash-resistant B-tree store.
///
/// `Database` is generic over [`BlockIo`] so tests can run entirely
/// in-memory against [`crate::bio::MemBio`]; [`Database::open`] is the
/// entry point for real files, backed by [`FileBio`].
pub struct Database<B: BlockIo> {
    bio: B,
    header: Header,
    alloc: Allocator,
    barrier: Barrier,
    mark: u32,
}

impl Database<FileBio> {
    /// Opens (creating if absent) the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let create = !path.exists();
        let bio = FileBio::open(path, create)?;
        Self::from_bio(bio)
    }
}

impl<B: BlockIo> Database<B> {
    /// Opens an existing database, or creates a new one, on top of any
    /// block I/O port. An empty port (`len() == 0`) is treated as a
    /// request to create a fresh database.
    pub fn from_bio(bio: B) -> Result<Self> {
        let is_new = bio.len()? == 0;
        let mut header = if is_new {
            Header::create(&bio)?
        } else {
            Header::load(&bio)?
        };
        let alloc = Allocator::load(&bio)?;
        let barrier = Barrier::default();
        let mark = seed_mark();

        if is_new {
            log::info!("creating a new database");
            let mut db = Self {
                bio,
                header,
                alloc,
                barrier,
                mark,
            };
            db.create_root()?;
            return Ok(db);
        }

        log::info!(
            "opened existing database (root at {}, {} bytes in bump region)",
            header.root_ptr,
            header.free
        );
        Ok(Self {
            bio,
            header,
            alloc,
            barrier,
            mark,
        })
    }

    /// Allocates and writes the initial empty leaf root, then publishes
    /// its offset in the header's root-ptr slot (spec §4.6: the create
    /// path always leaves `root_ptr` pointing at a real, if empty, leaf
    /// rather than at a null sentinel). [`crate::btree::Engine::add`]
    /// carries its own lazy bootstrap for callers that build an `Engine`
    /// directly against a bare [`Header::create`] without going through
    /// this orchestrator (as the engine's own unit tests do); the two
    /// don't conflict; this one just runs first for every real database.
    fn create_root(&mut self) -> Result<()> {
        self.mark = self.mark.wrapping_add(1);
        let root = crate::node::Node::empty_leaf();
        let ptr = self.alloc.alloc(
            &self.bio,
            &mut self.header,
            &self.barrier,
            crate::header::NODE_SIZE as u32,
        )?;
        crate::node::write_node(&self.bio, &root, ptr, self.mark)?;
        self.barrier.sync(&self.bio)?;
        self.header.root_ptr = ptr;
        self.header.write_root_ptr(&self.bio)?;
        self.barrier.sync(&self.bio)?;
        Ok(())
    }

    /// Disables the write barrier: writes are no longer flushed before
    /// dependent writes. Only useful for throughput benchmarking; see
    /// [`crate::barrier`].
    pub fn clear_barrier(&mut self) {
        self.barrier.set(false);
    }

    /// Re-enables the write barrier (the default).
    pub fn set_barrier(&mut self) {
        self.barrier.set(true);
    }

    fn engine(&mut self) -> Engine<'_, B> {
        Engine::new(&self.bio, &mut self.header, &mut self.alloc, &self.barrier, &mut self.mark)
    }

    /// Inserts `key` -> `value`. If `key` is already present, the
    /// insertion is rejected unless `replace` is set, in which case the
    /// old value's storage is freed only after the new value is fully
    /// durable.
    ///
    /// Returns `Ok(false)` if `key` was already present and `replace`
    /// was false.
    pub fn add(&mut self, key: &Key, value: &[u8], replace: bool) -> Result<bool> {
        let existing = self.engine().find(key)?;
        if existing.is_some() && !replace {
            return Ok(false);
        }

        let value_offset = self.store_value(value)?;
        let inserted = self.engine().add(key, value_offset, replace)?;
        if !inserted {
            self.alloc
                .free(&self.bio, &mut self.header, &self.barrier, value_offset)?;
            return Ok(false);
        }

        if let Some(old_offset) = existing {
            self.alloc
                .free(&self.bio, &mut self.header, &self.barrier, old_offset)?;
        }
        Ok(true)
    }

    fn store_value(&mut self, value: &[u8]) -> Result<u64> {
        if value.len() > crate::alloc::MAX_ALLOC_SIZE as usize {
            return Err(crate::error::Error::Invalid(format!(
                "value of {} bytes exceeds the {} byte limit",
                value.len(),
                crate::alloc::MAX_ALLOC_SIZE
            )));
        }
        let offset = self
            .alloc
            .alloc(&self.bio, &mut self.header, &self.barrier, value.len() as u32)?;
        self.bio.pwrite(value, offset)?;
        self.barrier.sync(&self.bio)?;
        Ok(offset)
    }

    /// Looks up `key`, returning a copy of its value if present.
    pub fn find(&mut self, key: &Key) -> Result<Option<Vec<u8>>> {
        let Some(offset) = self.engine().find(key)? else {
            return Ok(None);
        };
        let size = Allocator::alloc_size(&self.bio, offset)?;
        let mut buf = vec![0u8; size as usize];
        self.bio.pread(&mut buf, offset)?;
        Ok(Some(buf))
    }

    /// Returns the on-disk offset of `key`'s value, without reading it.
    pub fn find_offset(&mut self, key: &Key) -> Result<Option<u64>> {
        self.engine().find(key)
    }

    /// Allocates `size` raw bytes directly from the slab allocator,
    /// bypassing the B-tree. Exposed for the CLI's `alloc`/`allocfree`
    /// subcommands, which exercise the allocator in isolation the way
    /// the reference `btree_example` driver does.
    pub fn raw_alloc(&mut self, size: u32) -> Result<u64> {
        self.alloc.alloc(&self.bio, &mut self.header, &self.barrier, size)
    }

    /// Frees a raw allocation obtained from [`Database::raw_alloc`] (or
    /// any other live allocation offset), bypassing the B-tree.
    pub fn raw_free(&mut self, offset: u64) -> Result<()> {
        self.alloc.free(&self.bio, &mut self.header, &self.barrier, offset)
    }

    /// Prints the tree to stdout depth-first, one key per line, indented
    /// by depth — the same shape as the reference `btree_walk`.
    pub fn walk(&mut self) -> Result<()> {
        if self.header.root_ptr == 0 {
            return Ok(());
        }
        self.walk_rec(self.header.root_ptr, 0)
    }

    fn walk_rec(&mut self, node_ptr: u64, level: usize) -> Result<()> {
        let node = crate::node::read_node(&self.bio, node_ptr)?;
        for j in 0..node.num_keys {
            if node.children[j] != 0 {
                self.walk_rec(node.children[j], level + 1)?;
            }
            let size = Allocator::alloc_size(&self.bio, node.values[j])?;
            let mut buf = vec![0u8; size as usize];
            self.bio.pread(&mut buf, node.values[j])?;
            let value = String::from_utf8_lossy(&buf);
            println!(
                "{}(@{nodeptr}) Key {:20}: @{voff}  {size} bytes: {value}",
                " ".repeat(level),
                hex_key(&node.keys[j]),
                nodeptr = node_ptr,
                voff = node.values[j],
            );
        }
        if node.children[node.num_keys] != 0 {
            self.walk_rec(node.children[node.num_keys], level + 1)?;
        }
        Ok(())
    }

    /// Returns the user-requested size of the allocation at `offset`.
    pub fn alloc_size(&self, offset: u64) -> Result<u32> {
        Allocator::alloc_size(&self.bio, offset)
    }

    /// Reads `buf.len()` bytes starting at `offset`, bypassing the
    /// B-tree entirely. Exposed for callers that already hold a value
    /// offset (e.g. from [`Database::find_offset`]).
    pub fn pread(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        self.bio.pread(buf, offset)
    }
}

/// Renders a 16-byte key for `walk`'s output, trimming trailing zero
/// bytes so ASCII keys built from short strings (as the CLI's `add`/
/// `fill` subcommands build them) print without a wall of null bytes.
fn hex_key(key: &Key) -> String {
    let trimmed_len = key.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    let printable = key[..trimmed_len].iter().all(|&b| b.is_ascii_graphic());
    if printable {
        String::from_utf8_lossy(&key[..trimmed_len]).into_owned()
    } else {
        key.iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// Seeds the node-marking counter from wall-clock time mixed with a
/// process-random value, so marks written in a fresh session don't
/// collide with marks a previous session (or another concurrently
/// opened copy of the same file, which this format does not otherwise
/// guard against) may have left behind.
fn seed_mark() -> u32 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u32)
        .unwrap_or(0);
    let mut hasher = RandomState::new().build_hasher();
    hasher.write_u32(nanos);
    let random = hasher.finish() as u32;
    nanos ^ random
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bio::MemBio;
    use crate::header::KEY_LEN;
    use std::cell::Cell;

    fn key(n: u8) -> Key {
        let mut k = [0u8; KEY_LEN];
        k[KEY_LEN - 1] = n;
        k
    }

    #[test]
    fn create_then_first_insert() {
        let bio = MemBio::new();
        let mut db = Database::from_bio(bio).unwrap();
        assert!(db.add(&key(1), b"hello", false).unwrap());
        assert_eq!(db.find(&key(1)).unwrap(), Some(b"hello".to_vec()));
    }

    #[test]
    fn duplicate_without_replace_leaves_old_value() {
        let bio = MemBio::new();
        let mut db = Database::from_bio(bio).unwrap();
        assert!(db.add(&key(1), b"first", false).unwrap());
        assert!(!db.add(&key(1), b"second", false).unwrap());
        assert_eq!(db.find(&key(1)).unwrap(), Some(b"first".to_vec()));
    }

    #[test]
    fn replace_frees_the_old_value_for_reuse() {
        let bio = MemBio::new();
        let mut db = Database::from_bio(bio).unwrap();
        assert!(db.add(&key(1), b"aaaaaaaa", false).unwrap());
        let old_offset = db.find_offset(&key(1)).unwrap().unwrap();
        assert!(db.add(&key(1), b"bbbbbbbb", true).unwrap());
        assert_eq!(db.find(&key(1)).unwrap(), Some(b"bbbbbbbb".to_vec()));

        // A same-size allocation right after the replace should reuse
        // the freed slot (LIFO free list).
        let new_offset = db.store_value(b"cccccccc").unwrap();
        assert_eq!(new_offset, old_offset);
    }

    #[test]
    fn reopen_after_close_preserves_all_entries() {
        let bio = MemBio::new();
        {
            let mut db = Database::from_bio(&bio).unwrap();
            for n in 0..50u8 {
                assert!(db.add(&key(n), &[n; 4], false).unwrap());
            }
        }
        let mut reopened = Database::from_bio(&bio).unwrap();
        for n in 0..50u8 {
            assert_eq!(reopened.find(&key(n)).unwrap(), Some(vec![n; 4]));
        }
    }

    /// A `BlockIo` that drops the Nth write silently (simulating a torn
    /// write that never reached the device) and then, on the write
    /// after that, returns an I/O error as if the crash had been
    /// noticed. This stands in for a process crashing mid-write: we
    /// check that the database, reopened from what did make it to
    /// disk, is at least internally consistent (load succeeds and does
    /// not panic).
    struct CrashAfterNWrites<'a> {
        inner: &'a MemBio,
        remaining: Cell<u32>,
    }

    impl<'a> BlockIo for CrashAfterNWrites<'a> {
        fn pread(&self, buf: &mut [u8], offset: u64) -> Result<()> {
            self.inner.pread(buf, offset)
        }

        fn pwrite(&self, buf: &[u8], offset: u64) -> Result<()> {
            let remaining = self.remaining.get();
            if remaining == 0 {
                return Err(crate::error::Error::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "simulated crash",
                )));
            }
            self.remaining.set(remaining - 1);
            self.inner.pwrite(buf, offset)
        }

        fn resize(&self, length: u64) -> Result<()> {
            self.inner.resize(length)
        }

        fn len(&self) -> Result<u64> {
            self.inner.len()
        }

        fn flush(&self) -> Result<()> {
            self.inner.flush()
        }
    }

    #[test]
    fn a_write_failure_mid_insert_leaves_a_loadable_database() {
        let backing = MemBio::new();
        {
            let mut db = Database::from_bio(&backing).unwrap();
            assert!(db.add(&key(1), b"first", false).unwrap());
        }

        let flaky = CrashAfterNWrites {
            inner: &backing,
            remaining: Cell::new(2),
        };
        let mut db = Database::from_bio(flaky).unwrap();
        let _ = db.add(&key(2), b"second", false);
        drop(db);

        // Whatever state the backing store ended up in, it must still
        // describe a structurally valid header and root.
        let mut recovered = Database::from_bio(&backing).unwrap();
        assert_eq!(recovered.find(&key(1)).unwrap(), Some(b"first".to_vec()));
    }
}
