/// RawTP core: a reliable datagram transport over an unreliable conduit.
///
/// Provides:
/// - 8-byte big-endian frame header with an XOR-fold payload checksum
/// - Receiver-driven selective repeat (RESEND per gap, cumulative ACK)
/// - 256-slot presence window, restarted after each full pass
/// - Exponential backoff retransmission timer with a hard ceiling
/// - Out-of-band urgent bytes delivered ahead of queued data
/// - In-memory and fault-injecting conduits for loopback testing
///
/// Socket I/O lives in the host; the core only sees a [`Conduit`].

pub mod codec;
pub mod conduit;
pub mod config;
pub mod connection;
pub mod error;
pub mod integrity;
pub mod logging;
pub mod sequence;
pub mod timer;
pub mod window;

// Re-export key types for convenience.
pub use codec::{
    EncodedFrame, FRAME_MAX, Frame, HEADER_SIZE, Header, MAX_PACKET_COLLECTION, MAX_SEQUENCE,
    PAYLOAD_SIZE, Status, decode, encode, encode_control,
};
pub use conduit::{ChannelConduit, Conduit, DEFAULT_POLL_INTERVAL, FaultConfig, FaultyConduit};
pub use config::ConnectionConfig;
pub use connection::{Connection, ConnectionState, ConnectionStats, Delivery};
pub use error::{Error, FormatError, Result};
pub use logging::{
    ConnectionEvent, ConnectionLog, ConnectionLogger, NullLogger, RetransmitCause, TracingLogger,
};
pub use sequence::Acknowledgement;
pub use timer::{Arm, INITIAL_TIMEOUT, MAX_TIMEOUT, RetransmitTimer, TimerConfig};
pub use window::ReceiveWindow;
