//! Command-line driver for [`redbtree`], mirroring the reference
//! `btree_example` program: a thin collaborator that parses arguments,
//! opens a database file, and prints diagnostics. None of this is part
//! of the core contract in `redbtree::db`.

use std::process::ExitCode;

use argh::FromArgs;
use redbtree::{Database, Error};

#[derive(FromArgs)]
/// drive a redbtree database file from the command line
struct Cli {
    /// path to the database file (created if absent)
    #[argh(option, default = "String::from(\"./btree.db\")")]
    db: String,

    /// disable the write barrier (forfeits crash consistency; for
    /// benchmarking only)
    #[argh(switch)]
    no_barrier: bool,

    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Command {
    Alloc(AllocCmd),
    Free(FreeCmd),
    AllocFree(AllocFreeCmd),
    Add(AddCmd),
    Find(FindCmd),
    Fill(FillCmd),
    Walk(WalkCmd),
}

/// allocate `size` bytes, `n` times, printing each offset
#[derive(FromArgs)]
#[argh(subcommand, name = "alloc")]
struct AllocCmd {
    /// user-visible size of each allocation, in bytes
    #[argh(positional)]
    size: u32,
    /// number of allocations to perform
    #[argh(positional)]
    n: u32,
}

/// free the allocation at `ptr`, `n` times (repeated for benchmarking
/// the free-list paths)
#[derive(FromArgs)]
#[argh(subcommand, name = "free")]
struct FreeCmd {
    /// offset returned by a previous `alloc`
    #[argh(positional)]
    ptr: u64,
    /// number of times to free `ptr` (repeated frees of a dead offset
    /// are only meaningful for exercising the free-list code path; real
    /// callers free each offset once)
    #[argh(positional)]
    n: u32,
}

/// allocate then immediately free `size` bytes, `n` times
#[derive(FromArgs)]
#[argh(subcommand, name = "allocfree")]
struct AllocFreeCmd {
    /// user-visible size of each allocation, in bytes
    #[argh(positional)]
    size: u32,
    /// number of alloc/free round-trips to perform
    #[argh(positional)]
    n: u32,
}

/// insert (or replace) `key` -> `value`
#[derive(FromArgs)]
#[argh(subcommand, name = "add")]
struct AddCmd {
    /// key, up to 16 ASCII bytes (zero-padded on the right)
    #[argh(positional)]
    key: String,
    /// value bytes to store
    #[argh(positional)]
    value: String,
}

/// look up `key` and print its value
#[derive(FromArgs)]
#[argh(subcommand, name = "find")]
struct FindCmd {
    /// key, up to 16 ASCII bytes (zero-padded on the right)
    #[argh(positional)]
    key: String,
}

/// insert `n` random key/value pairs drawn from a pool of `range`
/// distinct keys, replacing on collision
#[derive(FromArgs)]
#[argh(subcommand, name = "fill")]
struct FillCmd {
    /// size of the pool of distinct keys (`k0`..`k<range-1>`) to draw from
    #[argh(positional)]
    range: u32,
    /// number of insertions to perform
    #[argh(positional)]
    n: u32,
}

/// print the tree depth-first
#[derive(FromArgs)]
#[argh(subcommand, name = "walk")]
struct WalkCmd {}

fn main() -> ExitCode {
    env_logger::init();
    let cli: Cli = argh::from_env();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("redbtree-cli: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), Error> {
    let mut db = Database::open(&cli.db)?;
    if cli.no_barrier {
        db.clear_barrier();
    }

    match cli.command {
        Command::Alloc(cmd) => {
            for _ in 0..cmd.n {
                let ptr = db.raw_alloc(cmd.size)?;
                println!("PTR: {ptr}");
            }
        }
        Command::Free(cmd) => {
            for _ in 0..cmd.n {
                db.raw_free(cmd.ptr)?;
            }
        }
        Command::AllocFree(cmd) => {
            for _ in 0..cmd.n {
                let ptr = db.raw_alloc(cmd.size)?;
                println!("PTR: {ptr}");
                db.raw_free(ptr)?;
            }
        }
        Command::Add(cmd) => {
            let key = string_to_key(&cmd.key)?;
            match db.add(&key, cmd.value.as_bytes(), true) {
                Ok(_) => println!("retval 0"),
                Err(e) => {
                    println!("retval -1");
                    println!("Error: {e}");
                    return Err(e);
                }
            }
        }
        Command::Find(cmd) => {
            let key = string_to_key(&cmd.key)?;
            match db.find_offset(&key)? {
                None => println!("Key not found"),
                Some(offset) => {
                    println!("Key found at {offset}");
                    let size = db.alloc_size(offset)?;
                    let mut buf = vec![0u8; size as usize];
                    db.pread(&mut buf, offset)?;
                    println!("Value: {}", String::from_utf8_lossy(&buf));
                }
            }
        }
        Command::Fill(cmd) => {
            for j in 0..cmd.n {
                let r = pseudo_random(j) % cmd.range.max(1);
                let key = string_to_key(&format!("k{r}"))?;
                let value = format!("val:{r}");
                db.add(&key, value.as_bytes(), true)?;
            }
        }
        Command::Walk(_) => db.walk()?,
    }

    Ok(())
}

/// Turns a CLI-supplied string into a 16-byte key the way the reference
/// driver does: copy the ASCII bytes, zero-pad on the right. Longer
/// inputs are rejected rather than silently truncated, since the format
/// does not otherwise distinguish two keys that collide in their first
/// 16 bytes.
fn string_to_key(s: &str) -> Result<[u8; 16], Error> {
    let bytes = s.as_bytes();
    if bytes.len() > 16 {
        return Err(Error::Invalid(format!(
            "key {s:?} is longer than 16 bytes"
        )));
    }
    let mut key = [0u8; 16];
    key[..bytes.len()].copy_from_slice(bytes);
    Ok(key)
}

/// A small deterministic LCG, standing in for the reference driver's
/// `random()` call: `fill` only needs a repeatable spread over the key
/// pool, not a cryptographically meaningful one.
fn pseudo_random(seed: u32) -> u32 {
    seed.wrapping_mul(1_103_515_245).wrapping_add(12_345) >> 8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_to_key_pads_with_zeros() {
        let key = string_to_key("001").unwrap();
        assert_eq!(&key[..3], b"001");
        assert!(key[3..].iter().all(|&b| b == 0));
    }

    #[test]
    fn string_to_key_rejects_overlong_input() {
        assert!(string_to_key("this key is definitely too long").is_err());
    }
}
