//! Payload integrity check.
//!
//! A byte-wise XOR fold into a 16-bit accumulator. It is lightweight and not
//! cryptographic: an even number of flips at the same bit position in
//! different bytes cancels out, and reordering bytes goes unnoticed. It
//! covers the payload only, never the header, and has nothing in common
//! with the one's-complement checksum of the IP header below us.

/// Outcome of [`verify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Match,
    Mismatch,
}

/// XOR fold of every byte in `data`.
#[inline]
pub fn checksum(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |acc, &b| acc ^ u16::from(b))
}

/// Recompute the checksum of `payload` and compare it with `received`.
#[inline]
pub fn verify(payload: &[u8], received: u16) -> Verdict {
    if checksum(payload) ^ received != 0 {
        Verdict::Mismatch
    } else {
        Verdict::Match
    }
}
