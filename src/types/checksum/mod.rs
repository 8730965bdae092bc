#![forbid(unsafe_code)]

//! CRC32 over on-disk log structures.
//!
//! Log pages and the superblock both store a CRC32 (IEEE) next to the bytes
//! it covers. Page checksums are computed over the header fields followed
//! by the record bytes; the superblock checksum covers the whole image
//! except its own slot.

use std::ops::Range;

/// Running checksum fed in pieces.
pub trait Checksum: Default {
    /// Feeds more bytes.
    fn update(&mut self, bytes: &[u8]);

    /// Checksum of everything fed so far.
    fn value(&self) -> u32;

    /// Checksum of `parts` as if they were one contiguous slice.
    fn of_parts(parts: &[&[u8]]) -> u32 {
        let mut sum = Self::default();
        for part in parts {
            sum.update(part);
        }
        sum.value()
    }
}

/// CRC32 (IEEE) from `crc32fast`.
#[derive(Clone, Default)]
pub struct Crc32(crc32fast::Hasher);

impl Checksum for Crc32 {
    fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    fn value(&self) -> u32 {
        self.0.clone().finalize()
    }
}

/// Checksum stored in a log page header: the page sequence number and its
/// end-of-records offset, then the record bytes.
pub fn page_crc32(sequence: u64, eor: u16, records: &[u8]) -> u32 {
    let sequence = sequence.to_le_bytes();
    let eor = eor.to_le_bytes();
    Crc32::of_parts(&[&sequence[..], &eor[..], records])
}

/// Checksum of `image[..len]` with the bytes of `field` skipped, for
/// structures that store their checksum inline.
pub fn crc32_excluding(image: &[u8], len: usize, field: Range<usize>) -> u32 {
    debug_assert!(field.end <= len, "checksum slot outside covered bytes");
    Crc32::of_parts(&[&image[..field.start], &image[field.end..len]])
}
