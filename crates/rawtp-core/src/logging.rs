//! Structured connection logging.
//!
//! The dispatcher reports protocol events through [`ConnectionLogger`] so a
//! host can route them to `tracing`, collect them in a test, or discard them.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::codec::Status;

/// How many leading bytes of a malformed frame are kept for the log.
pub const DROPPED_PREFIX_LEN: usize = 16;

/// Structured log entry for one connection.
#[derive(Debug, Clone)]
pub struct ConnectionLog {
    pub component: &'static str,
    pub peer: Arc<str>,
    pub event: ConnectionEvent,
}

/// Why a frame went out again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetransmitCause {
    ResendRequest,
    CorruptionReport,
    Timeout,
}

impl fmt::Display for RetransmitCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ResendRequest => "resend",
            Self::CorruptionReport => "corruption",
            Self::Timeout => "timeout",
        })
    }
}

/// Connection events that can be logged.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Dispatcher created for a peer
    Opened,
    /// DATA frame transmitted for the first time
    DataSent { sequence: u16, size: usize },
    /// DATA frame accepted into the collection
    DataReceived { sequence: u16, size: usize, duplicate: bool },
    /// Sequence engine asked the peer for a missing frame
    ResendRequested { sequence: u16 },
    /// Cumulative ACK emitted
    AckSent { sequence: u16 },
    /// ACK from the peer released cached frames
    AckReceived { sequence: u16, released: usize },
    /// A cached DATA frame was sent again
    Retransmitted { sequence: u16, cause: RetransmitCause },
    /// Payload checksum mismatch on an inbound DATA frame
    CorruptionDetected { sequence: u16, expected: u16, actual: u16 },
    /// RESEND, CORRUPTION or ACK naming a sequence that is not cached
    StaleRequest { status: Status, sequence: u16 },
    /// DATA from a finished pass arrived before the next pass started
    StaleData { sequence: u16 },
    /// Inbound bytes that failed to decode
    FrameDropped { reason: String, prefix: Vec<u8> },
    /// Urgent byte delivered ahead of queued data
    UrgentReceived { byte: u8 },
    /// Retransmission timer fired
    TimerExpired { retry_count: u32, next_timeout: Option<Duration> },
    /// All sequence numbers of a pass acknowledged; window restarted
    PassCompleted { passes: u64 },
    /// CLOSE sent or received; `unacked` DATA frames were discarded
    Closing { local: bool, unacked: usize },
    /// Terminal state reached
    Closed { error: Option<String> },
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Opened => write!(f, "opened"),
            Self::DataSent { sequence, size } => {
                write!(f, "data_sent seq={} size={}", sequence, size)
            }
            Self::DataReceived { sequence, size, duplicate } => {
                write!(f, "data_received seq={} size={} duplicate={}", sequence, size, duplicate)
            }
            Self::ResendRequested { sequence } => write!(f, "resend_requested seq={}", sequence),
            Self::AckSent { sequence } => write!(f, "ack_sent seq={}", sequence),
            Self::AckReceived { sequence, released } => {
                write!(f, "ack_received seq={} released={}", sequence, released)
            }
            Self::Retransmitted { sequence, cause } => {
                write!(f, "retransmitted seq={} cause={}", sequence, cause)
            }
            Self::CorruptionDetected { sequence, expected, actual } => {
                write!(
                    f,
                    "corruption_detected seq={} expected={:#06x} actual={:#06x}",
                    sequence, expected, actual
                )
            }
            Self::StaleRequest { status, sequence } => {
                write!(f, "stale_request status={} seq={}", status, sequence)
            }
            Self::StaleData { sequence } => write!(f, "stale_data seq={}", sequence),
            Self::FrameDropped { reason, prefix } => {
                write!(f, "frame_dropped reason=\"{}\" prefix={}", reason, hex::encode(prefix))
            }
            Self::UrgentReceived { byte } => write!(f, "urgent_received byte={:#04x}", byte),
            Self::TimerExpired { retry_count, next_timeout } => match next_timeout {
                Some(t) => write!(
                    f,
                    "timer_expired retry={} next_timeout_ms={}",
                    retry_count,
                    t.as_millis()
                ),
                None => write!(f, "timer_expired retry={} abort", retry_count),
            },
            Self::PassCompleted { passes } => write!(f, "pass_completed passes={}", passes),
            Self::Closing { local, unacked } => {
                write!(f, "closing local={} unacked={}", local, unacked)
            }
            Self::Closed { error: None } => write!(f, "closed"),
            Self::Closed { error: Some(e) } => write!(f, "closed error=\"{}\"", e),
        }
    }
}

/// Trait for connection logging. Implementations can write to tracing,
/// collect entries, or discard them.
pub trait ConnectionLogger: Send + Sync {
    fn log(&self, entry: ConnectionLog);
}

/// Logger that uses the `tracing` crate.
pub struct TracingLogger;

impl ConnectionLogger for TracingLogger {
    fn log(&self, entry: ConnectionLog) {
        // info for lifecycle, warn for damage, debug for per-frame traffic
        match &entry.event {
            ConnectionEvent::Opened
            | ConnectionEvent::PassCompleted { .. }
            | ConnectionEvent::Closing { .. }
            | ConnectionEvent::Closed { .. }
            | ConnectionEvent::TimerExpired { .. } => {
                tracing::info!(
                    component = entry.component,
                    peer = %entry.peer,
                    "{}",
                    entry.event,
                );
            }
            ConnectionEvent::FrameDropped { .. }
            | ConnectionEvent::CorruptionDetected { .. }
            | ConnectionEvent::StaleRequest { .. } => {
                tracing::warn!(
                    component = entry.component,
                    peer = %entry.peer,
                    "{}",
                    entry.event,
                );
            }
            _ => {
                tracing::debug!(
                    component = entry.component,
                    peer = %entry.peer,
                    "{}",
                    entry.event,
                );
            }
        }
    }
}

/// No-op logger that discards all log entries.
pub struct NullLogger;

impl ConnectionLogger for NullLogger {
    fn log(&self, _entry: ConnectionLog) {}
}
