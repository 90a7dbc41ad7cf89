//! Checksums used by headers, index pages and block trailers.
//!
//! The format uses the CRC-32 polynomial 0xEDB88320 but with an initial
//! value of 0 and no final inversion. `crc32fast` implements the standard
//! variant (`!crc(!init)`), so the raw value is recovered by seeding with
//! `!0` and inverting the result.

use crc32fast::Hasher;

/// Format CRC-32 over `buf`.
pub fn weak_crc32(buf: &[u8]) -> u32 {
    let mut hasher = Hasher::new_with_initial(0xFFFF_FFFF);
    hasher.update(buf);
    !hasher.finalize()
}

/// 16-bit signature stored in page and block trailers: a fold of the
/// physical offset and the block id.
pub fn compute_signature(offset: u64, bid: u64) -> u16 {
    let x = offset ^ bid;
    ((x >> 16) as u16) ^ (x as u16)
}
