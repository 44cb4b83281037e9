//! Error types for the transport core.

use std::io;

use thiserror::Error;

use crate::codec::Status;

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the codec, the dispatcher and the conduit plumbing.
#[derive(Error, Debug)]
pub enum Error {
    /// A frame buffer could not be reserved.
    #[error("frame buffer allocation failed ({requested} bytes)")]
    AllocationFailure { requested: usize },

    /// Malformed or out-of-range frame
    #[error("malformed frame: {0}")]
    Format(#[from] FormatError),

    /// Payload checksum did not verify
    #[error("checksum mismatch on sequence {sequence}")]
    ChecksumMismatch { sequence: u16 },

    /// The conduit refused or failed to transmit
    #[error("send failed: {0}")]
    SendFailure(#[source] io::Error),

    /// The conduit failed while reading
    #[error("receive failed: {0}")]
    ReceiveFailure(#[source] io::Error),

    /// Retransmission backoff reached its ceiling
    #[error("retransmission timeout exceeded after {retries} retries")]
    TimeoutExceeded { retries: u32 },

    /// Operation on a connection that is already closed
    #[error("connection is closed")]
    Closed,
}

/// Reasons a frame fails to decode or encode.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatError {
    #[error("buffer of {len} bytes is shorter than the header")]
    Truncated { len: usize },

    #[error("payload_size {declared} disagrees with {available} available bytes")]
    LengthMismatch { declared: u16, available: usize },

    #[error("payload of {len} bytes exceeds the frame limit")]
    PayloadTooLarge { len: usize },

    #[error("sequence {0} is outside the sequence space")]
    SequenceOutOfRange(u16),

    #[error("unknown status tag {0:#06x}")]
    UnknownStatus(u16),

    #[error("{status} frame cannot carry a {len}-byte payload")]
    UnexpectedPayload { status: Status, len: usize },
}
