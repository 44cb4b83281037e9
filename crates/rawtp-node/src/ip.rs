//! IPv4 header handling for the raw socket.
//!
//! With `IP_HDRINCL` set the node writes the network-layer header itself,
//! including its one's-complement checksum. This checksum covers the IPv4
//! header only and has nothing to do with the transport payload checksum.

use std::net::Ipv4Addr;

/// Length of an IPv4 header without options.
pub const IPV4_HEADER_LEN: usize = 20;

/// TTL stamped on every outbound datagram.
pub const DEFAULT_TTL: u8 = 64;

const VERSION_IHL: u8 = 0x45;
const DONT_FRAGMENT: u16 = 0x4000;

/// RFC 1071 Internet checksum: one's-complement sum of big-endian 16-bit
/// words, carries folded back in, then inverted. An odd trailing byte is
/// padded with zero.
pub fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut words = data.chunks_exact(2);
    for word in &mut words {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [last] = words.remainder() {
        sum += u32::from(*last) << 8;
    }
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Fields the node varies per datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub protocol: u8,
    pub identification: u16,
    pub ttl: u8,
    /// Bytes following the IPv4 header.
    pub payload_len: u16,
}

impl Ipv4Header {
    /// Serialize with a freshly computed header checksum.
    pub fn to_bytes(&self) -> [u8; IPV4_HEADER_LEN] {
        let total_len = IPV4_HEADER_LEN as u16 + self.payload_len;
        let mut buf = [0u8; IPV4_HEADER_LEN];
        buf[0] = VERSION_IHL;
        buf[1] = 0; // TOS
        buf[2..4].copy_from_slice(&total_len.to_be_bytes());
        buf[4..6].copy_from_slice(&self.identification.to_be_bytes());
        buf[6..8].copy_from_slice(&DONT_FRAGMENT.to_be_bytes());
        buf[8] = self.ttl;
        buf[9] = self.protocol;
        // 10..12 checksum, zero while computing
        buf[12..16].copy_from_slice(&self.source.octets());
        buf[16..20].copy_from_slice(&self.destination.octets());
        let check = internet_checksum(&buf);
        buf[10..12].copy_from_slice(&check.to_be_bytes());
        buf
    }
}

/// An inbound datagram with its IPv4 header removed.
#[derive(Debug, PartialEq, Eq)]
pub struct Inbound<'a> {
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub payload: &'a [u8],
}

/// Why an inbound datagram was discarded at layer 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StripError {
    Truncated(usize),
    NotIpv4(u8),
    BadHeaderLength(usize),
    BadChecksum,
}

impl std::fmt::Display for StripError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated(len) => write!(f, "datagram of {} bytes has no IPv4 header", len),
            Self::NotIpv4(v) => write!(f, "IP version {} is not 4", v),
            Self::BadHeaderLength(len) => write!(f, "IHL of {} bytes is invalid", len),
            Self::BadChecksum => write!(f, "IPv4 header checksum mismatch"),
        }
    }
}

/// Validate and remove the IPv4 header (options included) of a datagram
/// read from the raw socket.
pub fn strip_header(datagram: &[u8]) -> Result<Inbound<'_>, StripError> {
    if datagram.len() < IPV4_HEADER_LEN {
        return Err(StripError::Truncated(datagram.len()));
    }
    let version = datagram[0] >> 4;
    if version != 4 {
        return Err(StripError::NotIpv4(version));
    }
    let ihl = usize::from(datagram[0] & 0x0F) * 4;
    if ihl < IPV4_HEADER_LEN || ihl > datagram.len() {
        return Err(StripError::BadHeaderLength(ihl));
    }
    if internet_checksum(&datagram[..ihl]) != 0 {
        return Err(StripError::BadChecksum);
    }

    // Bytes past the total length are padding; ignore them.
    let total_len = usize::from(u16::from_be_bytes([datagram[2], datagram[3]]));
    let end = if (ihl..=datagram.len()).contains(&total_len) {
        total_len
    } else {
        datagram.len()
    };

    let addr = |off: usize| {
        Ipv4Addr::new(
            datagram[off],
            datagram[off + 1],
            datagram[off + 2],
            datagram[off + 3],
        )
    };
    Ok(Inbound {
        source: addr(12),
        destination: addr(16),
        payload: &datagram[ihl..end],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_matches_reference_header() {
        // Well-known sample header with its checksum field zeroed.
        let header: [u8; 20] = [
            0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00, 0xc0, 0xa8,
            0x00, 0x01, 0xc0, 0xa8, 0x00, 0xc7,
        ];
        assert_eq!(internet_checksum(&header), 0xb861);
    }

    #[test]
    fn checksum_pads_odd_length() {
        assert_eq!(internet_checksum(&[0x01]), !0x0100);
        assert_eq!(internet_checksum(&[]), 0xFFFF);
    }

    fn sample() -> Ipv4Header {
        Ipv4Header {
            source: Ipv4Addr::new(10, 0, 0, 1),
            destination: Ipv4Addr::new(10, 0, 0, 2),
            protocol: 253,
            identification: 0x3039,
            ttl: DEFAULT_TTL,
            payload_len: 3,
        }
    }

    #[test]
    fn built_header_verifies_to_zero() {
        let bytes = sample().to_bytes();
        assert_eq!(bytes[0], 0x45);
        assert_eq!(u16::from_be_bytes([bytes[2], bytes[3]]), 23);
        assert_eq!(internet_checksum(&bytes), 0);
    }

    #[test]
    fn strip_returns_payload_and_addresses() {
        let mut datagram = sample().to_bytes().to_vec();
        datagram.extend_from_slice(b"abc");
        let inbound = strip_header(&datagram).unwrap();
        assert_eq!(inbound.source, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(inbound.destination, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(inbound.payload, b"abc");
    }

    #[test]
    fn strip_honours_options_and_total_length() {
        // IHL = 6 words: one 4-byte option (NOPs).
        let mut datagram = sample().to_bytes().to_vec();
        datagram[0] = 0x46;
        datagram.splice(20..20, [0x01, 0x01, 0x01, 0x01]);
        datagram[2..4].copy_from_slice(&26u16.to_be_bytes());
        datagram[10..12].copy_from_slice(&[0, 0]);
        let check = internet_checksum(&datagram[..24]);
        datagram[10..12].copy_from_slice(&check.to_be_bytes());
        datagram.extend_from_slice(b"hi");
        datagram.extend_from_slice(&[0xEE; 4]); // trailing garbage past total length

        let inbound = strip_header(&datagram).unwrap();
        assert_eq!(inbound.payload, b"hi");
    }

    #[test]
    fn strip_rejects_bad_headers() {
        assert_eq!(strip_header(&[0x45; 10]), Err(StripError::Truncated(10)));

        let mut v6 = sample().to_bytes();
        v6[0] = 0x65;
        assert_eq!(strip_header(&v6), Err(StripError::NotIpv4(6)));

        let mut short_ihl = sample().to_bytes();
        short_ihl[0] = 0x44;
        assert_eq!(strip_header(&short_ihl), Err(StripError::BadHeaderLength(16)));

        let mut damaged = sample().to_bytes();
        damaged[8] ^= 0x01;
        assert_eq!(strip_header(&damaged), Err(StripError::BadChecksum));
    }
}
