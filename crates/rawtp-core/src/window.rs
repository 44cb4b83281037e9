//! Receive window: which sequence numbers have arrived in this pass.
//!
//! One bit per sequence number over `MAX_PACKET_COLLECTION` entries,
//! `[u64; 4]` for the default 256.

use crate::codec::MAX_PACKET_COLLECTION;

/// Number of u64 words needed: ceil(MAX_PACKET_COLLECTION / 64).
const WINDOW_WORDS: usize = MAX_PACKET_COLLECTION.div_ceil(64);

/// Presence bitfield plus the highest sequence marked present.
///
/// Bits are only ever set within a pass; [`ReceiveWindow::reset`] starts the
/// next pass.
#[derive(Clone, Debug, Default)]
pub struct ReceiveWindow {
    bits: [u64; WINDOW_WORDS],
    highest_sequence_seen: Option<u16>,
    received_count: u16,
}

impl ReceiveWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a sequence as received. Returns true if it was newly received.
    #[inline]
    pub fn mark(&mut self, sequence: u16) -> bool {
        let idx = sequence as usize;
        let word = idx / 64;
        let bit = idx % 64;
        if word >= WINDOW_WORDS {
            return false;
        }
        let mask = 1u64 << bit;
        if self.bits[word] & mask != 0 {
            return false;
        }
        self.bits[word] |= mask;
        self.received_count += 1;
        self.highest_sequence_seen = Some(match self.highest_sequence_seen {
            Some(h) => h.max(sequence),
            None => sequence,
        });
        true
    }

    /// Check if a sequence has been received.
    #[inline]
    pub fn is_present(&self, sequence: u16) -> bool {
        let idx = sequence as usize;
        let word = idx / 64;
        if word >= WINDOW_WORDS {
            return false;
        }
        self.bits[word] & (1u64 << (idx % 64)) != 0
    }

    #[inline]
    pub fn highest_sequence_seen(&self) -> Option<u16> {
        self.highest_sequence_seen
    }

    #[inline]
    pub fn received(&self) -> u16 {
        self.received_count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.received_count == 0
    }

    /// Sequences in `0..=highest_sequence_seen` not yet received, ascending.
    pub fn missing(&self) -> Vec<u16> {
        match self.highest_sequence_seen {
            Some(highest) => (0..=highest).filter(|&s| !self.is_present(s)).collect(),
            None => Vec::new(),
        }
    }

    /// Number of gaps below the highest sequence seen.
    #[inline]
    pub fn missing_count(&self) -> u16 {
        match self.highest_sequence_seen {
            Some(highest) => highest + 1 - self.received_count,
            None => 0,
        }
    }

    /// True once every sequence of the pass has been received.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.received_count as usize == MAX_PACKET_COLLECTION
    }

    /// Start a new collection pass.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
