//! Frame wire format.
//!
//! ```text
//! [0..2]  Status tag (u16 BE)
//! [2..4]  Payload checksum (u16 BE, XOR fold, 0 without payload)
//! [4..6]  Sequence number (u16 BE)
//! [6..8]  Payload size (u16 BE)
//! [8..]   Payload (DATA and OOB only, up to 1024 bytes)
//! ```
//!
//! The header and the payload travel as two segments of one message
//! (scatter/gather send). Nothing here depends on in-memory struct layout.

use std::fmt;

use bytes::Bytes;

use crate::error::{Error, FormatError, Result};
use crate::integrity::{self, Verdict};

/// Header size in bytes.
pub const HEADER_SIZE: usize = 8;

/// Maximum payload bytes per frame.
pub const PAYLOAD_SIZE: usize = 1024;

/// Maximum frame size (header + payload).
pub const FRAME_MAX: usize = HEADER_SIZE + PAYLOAD_SIZE;

/// Number of sequence numbers tracked by one receive window pass.
pub const MAX_PACKET_COLLECTION: usize = 256;

/// Sequence numbers wrap within `[0, MAX_SEQUENCE)`.
pub const MAX_SEQUENCE: u16 = MAX_PACKET_COLLECTION as u16;

const OFF_STATUS: usize = 0;
const OFF_CHECKSUM: usize = 2;
const OFF_SEQUENCE: usize = 4;
const OFF_SIZE: usize = 6;

/// Frame status tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Status {
    Data = 1,
    Ack = 2,
    Resend = 3,
    Corruption = 4,
    Oob = 5,
    Close = 6,
}

impl Status {
    pub const ALL: [Status; 6] = [
        Status::Data,
        Status::Ack,
        Status::Resend,
        Status::Corruption,
        Status::Oob,
        Status::Close,
    ];

    /// Wire tag for this status.
    pub fn tag(self) -> u16 {
        self as u16
    }

    /// Statuses that carry no payload at all.
    pub fn is_control(self) -> bool {
        !matches!(self, Status::Data | Status::Oob)
    }

    /// Check that a payload of `len` bytes is legal for this status.
    fn check_payload_len(self, len: usize) -> std::result::Result<(), FormatError> {
        let ok = match self {
            Status::Data => len <= PAYLOAD_SIZE,
            Status::Oob => len == 1,
            _ => len == 0,
        };
        if ok {
            Ok(())
        } else if len > PAYLOAD_SIZE {
            Err(FormatError::PayloadTooLarge { len })
        } else {
            Err(FormatError::UnexpectedPayload { status: self, len })
        }
    }
}

impl TryFrom<u16> for Status {
    type Error = FormatError;

    fn try_from(tag: u16) -> std::result::Result<Self, FormatError> {
        Status::ALL
            .into_iter()
            .find(|s| s.tag() == tag)
            .ok_or(FormatError::UnknownStatus(tag))
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Data => "DATA",
            Status::Ack => "ACK",
            Status::Resend => "RESEND",
            Status::Corruption => "CORRUPTION",
            Status::Oob => "OOB",
            Status::Close => "CLOSE",
        };
        f.write_str(name)
    }
}

/// Parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub status: Status,
    pub checksum: u16,
    pub sequence: u16,
    pub payload_size: u16,
}

impl Header {
    /// Serialize into a fixed-size header segment.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[OFF_STATUS..OFF_STATUS + 2].copy_from_slice(&self.status.tag().to_be_bytes());
        buf[OFF_CHECKSUM..OFF_CHECKSUM + 2].copy_from_slice(&self.checksum.to_be_bytes());
        buf[OFF_SEQUENCE..OFF_SEQUENCE + 2].copy_from_slice(&self.sequence.to_be_bytes());
        buf[OFF_SIZE..OFF_SIZE + 2].copy_from_slice(&self.payload_size.to_be_bytes());
        buf
    }
}

/// A frame ready for the conduit: header segment plus payload segment.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub header: [u8; HEADER_SIZE],
    pub payload: Bytes,
}

impl EncodedFrame {
    /// Total bytes on the wire.
    pub fn wire_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Encode a frame. The checksum is computed over `payload`.
pub fn encode(status: Status, sequence: u16, payload: Bytes) -> Result<EncodedFrame> {
    if sequence >= MAX_SEQUENCE {
        return Err(FormatError::SequenceOutOfRange(sequence).into());
    }
    status.check_payload_len(payload.len())?;

    let header = Header {
        status,
        checksum: integrity::checksum(&payload),
        sequence,
        payload_size: payload.len() as u16,
    };
    Ok(EncodedFrame {
        header: header.to_bytes(),
        payload,
    })
}

/// Encode a payload-less control frame.
pub fn encode_control(status: Status, sequence: u16) -> Result<EncodedFrame> {
    encode(status, sequence, Bytes::new())
}

/// Decode a frame from raw bytes. The checksum is not verified here.
pub fn decode(data: &[u8]) -> std::result::Result<(Header, &[u8]), FormatError> {
    if data.len() < HEADER_SIZE {
        return Err(FormatError::Truncated { len: data.len() });
    }
    let field = |off: usize| u16::from_be_bytes([data[off], data[off + 1]]);

    let status = Status::try_from(field(OFF_STATUS))?;
    let checksum = field(OFF_CHECKSUM);
    let sequence = field(OFF_SEQUENCE);
    let payload_size = field(OFF_SIZE);

    let available = data.len() - HEADER_SIZE;
    if payload_size as usize != available {
        return Err(FormatError::LengthMismatch {
            declared: payload_size,
            available,
        });
    }
    status.check_payload_len(available)?;
    if sequence >= MAX_SEQUENCE {
        return Err(FormatError::SequenceOutOfRange(sequence));
    }

    let header = Header {
        status,
        checksum,
        sequence,
        payload_size,
    };
    Ok((header, &data[HEADER_SIZE..]))
}

/// A decoded frame that owns its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub payload: Bytes,
}

impl Frame {
    /// Decode and copy the payload out of a receive buffer.
    ///
    /// The copy is reserved fallibly; a failed reservation is reported as
    /// `AllocationFailure` instead of aborting the process.
    pub fn from_wire(data: &[u8]) -> Result<Self> {
        let (header, payload) = decode(data)?;
        let mut owned = Vec::new();
        owned
            .try_reserve_exact(payload.len())
            .map_err(|_| Error::AllocationFailure {
                requested: payload.len(),
            })?;
        owned.extend_from_slice(payload);
        Ok(Self {
            header,
            payload: Bytes::from(owned),
        })
    }

    pub fn status(&self) -> Status {
        self.header.status
    }

    pub fn sequence(&self) -> u16 {
        self.header.sequence
    }

    /// Verify the payload against the header checksum.
    pub fn verify(&self) -> Result<()> {
        match integrity::verify(&self.payload, self.header.checksum) {
            Verdict::Match => Ok(()),
            Verdict::Mismatch => Err(Error::ChecksumMismatch {
                sequence: self.header.sequence,
            }),
        }
    }
}
