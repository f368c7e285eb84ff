//! Big-endian primitive I/O.
//!
//! All integers stored in the file are big-endian, regardless of host
//! byte order, so a database created on one machine can be copied to
//! another without reinterpretation. The stdlib's own
//! `to_be_bytes`/`from_be_bytes` already do exactly what the reference
//! implementation hand-rolls a byte-shuffling routine for, so there is no
//! need for an external endianness crate here.

use crate::bio::BlockIo;
use crate::error::Result;

/// Reads a big-endian `u32` at `offset`.
pub fn read_u32_at(bio: &impl BlockIo, offset: u64) -> Result<u32> {
    let mut buf = [0u8; 4];
    bio.pread(&mut buf, offset)?;
    Ok(u32::from_be_bytes(buf))
}

/// Writes `val` as a big-endian `u32` at `offset`.
pub fn write_u32_at(bio: &impl BlockIo, val: u32, offset: u64) -> Result<()> {
    bio.pwrite(&val.to_be_bytes(), offset)
}

/// Reads a big-endian `u64` at `offset`.
pub fn read_u64_at(bio: &impl BlockIo, offset: u64) -> Result<u64> {
    let mut buf = [0u8; 8];
    bio.pread(&mut buf, offset)?;
    Ok(u64::from_be_bytes(buf))
}

/// Writes `val` as a big-endian `u64` at `offset`.
pub fn write_u64_at(bio: &impl BlockIo, val: u64, offset: u64) -> Result<()> {
    bio.pwrite(&val.to_be_bytes(), offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bio::MemBio;

    #[test]
    fn round_trips_u32_and_u64() {
        let bio = MemBio::new();
        bio.resize(12).unwrap();
        write_u32_at(&bio, 0xdead_beef, 0).unwrap();
        write_u64_at(&bio, 0x0102_0304_0506_0708, 4).unwrap();
        assert_eq!(read_u32_at(&bio, 0).unwrap(), 0xdead_beef);
        assert_eq!(read_u64_at(&bio, 4).unwrap(), 0x0102_0304_0506_0708);
    }
}
