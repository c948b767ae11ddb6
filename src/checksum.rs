//! Additive checksums used on the wire and in the vector table

/// Number of vector table entries covered by the vector checksum
pub const CHECKSUMMED_VECTORS: usize = 7;

/// Wrapping 32-bit sum of all bytes in `data`
pub fn checksum(data: &[u8]) -> u32 {
    data.iter()
        .fold(0u32, |sum, &byte| sum.wrapping_add(u32::from(byte)))
}

/// Value vector 7 must hold for the bootloader to consider user code valid
///
/// The first eight vectors of a valid image sum to zero.
pub fn vector_checksum(vectors: &[u32; CHECKSUMMED_VECTORS]) -> u32 {
    vectors
        .iter()
        .fold(0u32, |sum, &vector| sum.wrapping_sub(vector))
}
