//! CRC-32 checksums and checksum forging.
//!
//! This module implements the standard CRC-32 used by zlib and friends (IEEE polynomial
//! 0xEDB88320, bit-reflected, initial value and final XOR of 0xFFFFFFFF), plus [`forge_crc32`],
//! which rewrites four bytes of a buffer so that the whole buffer checksums to a chosen value.
//!
//! # Forging
//! Forging works in two steps:
//! * Write the raw CRC register for the bytes before `offset` (complemented) into the four bytes
//!   at `offset`. Feeding the register back into the checksum drives it to a known state.
//! * Run the CRC state machine *backwards* over everything from `offset` to the end, starting
//!   from the desired checksum, to recover the register value required at `offset`, and store
//!   that value there instead.
//!
//! The backward step uses a 256-entry table indexed by the top byte of the register, mirroring
//! the forward table. For the full derivation see "Reversing CRC - Theory and Practice"
//! (SAR-PR-2006-05).

use snafu::prelude::*;

/// Error conditions for when forging checksums.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// Thrown if the four bytes to rewrite don't fit inside the buffer.
    #[snafu(display("Forge offset out of range!"))]
    OutOfRange,
}
type Result<T> = core::result::Result<T, Error>;

/// The bit-reflected IEEE CRC-32 polynomial.
const POLYNOMIAL: u32 = 0xEDB8_8320;

const fn forward_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut reg = i as u32;
        let mut bit = 0;
        while bit < 8 {
            reg = if reg & 1 != 0 { (reg >> 1) ^ POLYNOMIAL } else { reg >> 1 };
            bit += 1;
        }
        table[i] = reg;
        i += 1;
    }
    table
}

const fn reverse_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut reg = (i as u32) << 24;
        let mut bit = 0;
        while bit < 8 {
            reg = if reg & (1 << 31) != 0 { ((reg ^ POLYNOMIAL) << 1) | 1 } else { reg << 1 };
            bit += 1;
        }
        table[i] = reg;
        i += 1;
    }
    table
}

const FORWARD_TABLE: [u32; 256] = forward_table();
const REVERSE_TABLE: [u32; 256] = reverse_table();

/// Computes the CRC-32 checksum of `data`.
#[must_use]
pub fn crc32(data: &[u8]) -> u32 {
    let mut reg = 0xFFFF_FFFF;
    for &byte in data {
        reg = (reg >> 8) ^ FORWARD_TABLE[((reg ^ u32::from(byte)) & 0xFF) as usize];
    }
    reg ^ 0xFFFF_FFFF
}

/// Returns the state the CRC register would need to be in just before processing `data` in order
/// to produce the desired checksum.
fn crc32_reverse(data: &[u8], crc: u32) -> u32 {
    let mut reg = crc ^ 0xFFFF_FFFF;
    for &byte in data.iter().rev() {
        reg = (reg << 8) ^ REVERSE_TABLE[(reg >> 24) as usize] ^ u32::from(byte);
    }
    reg
}

/// Overwrites `data[offset..offset + 4]` to make `data`'s CRC-32 checksum equal `crc`.
///
/// No other bytes are touched. Both intermediate values are stored little-endian.
///
/// # Errors
/// Returns [`OutOfRange`](Error::OutOfRange) if `offset + 4` exceeds the buffer length.
pub fn forge_crc32(data: &mut [u8], offset: usize, crc: u32) -> Result<()> {
    ensure!(offset + 4 <= data.len(), OutOfRangeSnafu);

    let reg = crc32(&data[..offset]) ^ 0xFFFF_FFFF;
    data[offset..offset + 4].copy_from_slice(&reg.to_le_bytes());

    let reg = crc32_reverse(&data[offset..], crc);
    data[offset..offset + 4].copy_from_slice(&reg.to_le_bytes());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector() {
        // the standard CRC-32 check value
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32(b""), 0);
    }

    #[test]
    fn forge_at_start() {
        let mut data = *b"hello, checksum!";
        forge_crc32(&mut data, 0, 0xDEAD_BEEF).unwrap();
        assert_eq!(crc32(&data), 0xDEAD_BEEF);
        assert_eq!(&data[4..], &b"hello, checksum!"[4..]);
    }

    #[test]
    fn forge_in_the_middle() {
        for target in [0x0000_0000, 0xFFFF_FFFF, 0x1234_5678, 0xCBF4_3926] {
            let mut data = (0u8..64).collect::<Vec<u8>>();
            forge_crc32(&mut data, 20, target).unwrap();
            // only the four-byte slot may change
            assert!(data[..20].iter().copied().eq(0u8..20));
            assert!(data[24..].iter().copied().eq(24u8..64));
            assert_eq!(crc32(&data), target);
        }
    }

    #[test]
    fn forge_out_of_range() {
        let mut data = [0u8; 8];
        assert!(matches!(forge_crc32(&mut data, 5, 0), Err(Error::OutOfRange)));
        assert!(forge_crc32(&mut data, 4, 0).is_ok());
    }
}
