//! A single-file, on-disk, crash-resistant B-tree keyed by fixed-width 16-byte
//! hashed keys, mapping to variable-length opaque byte values.
//!
//! The whole of a database's state lives in one file reached through the
//! [`BlockIo`] port, so any host that can offer positional reads, writes,
//! resize and flush can back a [`Database`]. Three subsystems make up the
//! core: the [`alloc`] slab allocator, the [`node`]/[`btree`] copy-on-write
//! B-tree, and the [`barrier`] write-ordering discipline that threads
//! through both.

pub mod alloc;
pub mod barrier;
pub mod bio;
pub mod btree;
pub mod codec;
pub mod db;
pub mod error;
pub mod header;
pub mod node;

pub use bio::{BlockIo, FileBio};
pub use db::Database;
pub use error::{Error, Result};

pub use bio::MemBio;
