//! The byte conduit the dispatcher talks through.
//!
//! The core never opens sockets. Whatever sits below (a raw IP socket, an
//! in-memory channel, a fault injector) implements [`Conduit`]:
//!
//! - `send` takes the header and payload as two segments of one message.
//! - `receive` blocks for at most the implementation's poll interval and
//!   returns `WouldBlock` or `TimedOut` when nothing arrived. That return is
//!   the dispatcher's poll point for timer expiry.

use std::collections::VecDeque;
use std::io;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::codec::{HEADER_SIZE, Status};

/// Default time `receive` may block before yielding to the dispatcher.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Bidirectional frame channel supplied by the layer below.
pub trait Conduit {
    /// Transmit one frame as a header segment followed by a payload segment.
    fn send(&mut self, header: &[u8], payload: &[u8]) -> io::Result<()>;

    /// Receive the raw bytes of one frame.
    fn receive(&mut self) -> io::Result<Vec<u8>>;
}

impl<C: Conduit + ?Sized> Conduit for Box<C> {
    fn send(&mut self, header: &[u8], payload: &[u8]) -> io::Result<()> {
        (**self).send(header, payload)
    }

    fn receive(&mut self) -> io::Result<Vec<u8>> {
        (**self).receive()
    }
}

/// True for the error kinds that only mean "nothing arrived yet".
/// Windows returns TimedOut where Unix returns WouldBlock.
pub fn is_idle(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

fn idle() -> io::Error {
    io::Error::new(io::ErrorKind::WouldBlock, "no frame within poll interval")
}

/// In-memory conduit: one end of a datagram pipe.
pub struct ChannelConduit {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
    poll_interval: Duration,
}

impl ChannelConduit {
    /// Build a connected pair of conduits.
    pub fn pair(poll_interval: Duration) -> (ChannelConduit, ChannelConduit) {
        let (a_tx, b_rx) = crossbeam_channel::unbounded();
        let (b_tx, a_rx) = crossbeam_channel::unbounded();
        (
            ChannelConduit {
                tx: a_tx,
                rx: a_rx,
                poll_interval,
            },
            ChannelConduit {
                tx: b_tx,
                rx: b_rx,
                poll_interval,
            },
        )
    }

    /// Wrap existing channel ends, e.g. a demultiplexer's per-peer queue.
    pub fn from_channels(
        tx: Sender<Vec<u8>>,
        rx: Receiver<Vec<u8>>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            tx,
            rx,
            poll_interval,
        }
    }
}

impl Conduit for ChannelConduit {
    fn send(&mut self, header: &[u8], payload: &[u8]) -> io::Result<()> {
        let mut datagram = Vec::with_capacity(header.len() + payload.len());
        datagram.extend_from_slice(header);
        datagram.extend_from_slice(payload);
        self.tx
            .send(datagram)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer conduit dropped"))
    }

    fn receive(&mut self) -> io::Result<Vec<u8>> {
        match self.rx.recv_timeout(self.poll_interval) {
            Ok(datagram) => Ok(datagram),
            Err(RecvTimeoutError::Timeout) => Err(idle()),
            Err(RecvTimeoutError::Disconnected) => {
                // A dropped peer looks like a silent network.
                std::thread::sleep(self.poll_interval);
                Err(idle())
            }
        }
    }
}

/// Fault model for [`FaultyConduit`]. Probabilities are in `[0.0, 1.0]`.
#[derive(Debug, Clone)]
pub struct FaultConfig {
    pub seed: u64,
    /// Probability that an outbound frame is silently dropped.
    pub loss_rate: f64,
    /// Probability that one payload bit is flipped.
    pub corrupt_rate: f64,
    /// Probability that an outbound frame is delivered twice.
    pub duplicate_rate: f64,
    /// Restrict faults to DATA frames.
    pub data_only: bool,
    /// Corrupt the first DATA transmission of each listed sequence.
    pub corrupt_once: Vec<u16>,
    /// Drop the first DATA transmission of each listed sequence.
    pub drop_once: Vec<u16>,
    /// Drop the first ACK naming each listed sequence, even with `data_only`.
    pub drop_ack_once: Vec<u16>,
}

impl Default for FaultConfig {
    fn default() -> Self {
        // No faults by default: a transparent pass-through.
        Self {
            seed: 0,
            loss_rate: 0.0,
            corrupt_rate: 0.0,
            duplicate_rate: 0.0,
            data_only: true,
            corrupt_once: Vec::new(),
            drop_once: Vec::new(),
            drop_ack_once: Vec::new(),
        }
    }
}

/// Outbound fault injector wrapped around another conduit.
pub struct FaultyConduit<C> {
    inner: C,
    config: FaultConfig,
    rng: StdRng,
    /// Every frame handed to `send`, before faults, for inspection.
    sent_log: VecDeque<Vec<u8>>,
    log_sent: bool,
}

impl<C: Conduit> FaultyConduit<C> {
    pub fn new(inner: C, config: FaultConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            inner,
            config,
            rng,
            sent_log: VecDeque::new(),
            log_sent: false,
        }
    }

    /// Keep a copy of every outbound frame (pre-fault) for later inspection.
    pub fn with_send_log(mut self) -> Self {
        self.log_sent = true;
        self
    }

    /// Frames handed to `send` so far, oldest first.
    pub fn take_sent(&mut self) -> Vec<Vec<u8>> {
        self.sent_log.drain(..).collect()
    }

    pub fn into_inner(self) -> C {
        self.inner
    }

    fn header_fields(header: &[u8]) -> Option<(Status, u16)> {
        if header.len() < HEADER_SIZE {
            return None;
        }
        let status = Status::try_from(u16::from_be_bytes([header[0], header[1]])).ok()?;
        let sequence = u16::from_be_bytes([header[4], header[5]]);
        Some((status, sequence))
    }

    fn take_once(list: &mut Vec<u16>, sequence: u16) -> bool {
        match list.iter().position(|&s| s == sequence) {
            Some(i) => {
                list.swap_remove(i);
                true
            }
            None => false,
        }
    }

    fn roll(&mut self, rate: f64) -> bool {
        rate > 0.0 && self.rng.random_bool(rate.min(1.0))
    }
}

impl<C: Conduit> Conduit for FaultyConduit<C> {
    fn send(&mut self, header: &[u8], payload: &[u8]) -> io::Result<()> {
        if self.log_sent {
            let mut copy = header.to_vec();
            copy.extend_from_slice(payload);
            self.sent_log.push_back(copy);
        }

        let fields = Self::header_fields(header);
        if let Some((Status::Ack, sequence)) = fields {
            if Self::take_once(&mut self.config.drop_ack_once, sequence) {
                return Ok(());
            }
        }
        let is_data = matches!(fields, Some((Status::Data, _)));
        if self.config.data_only && !is_data {
            return self.inner.send(header, payload);
        }

        if let Some((Status::Data, sequence)) = fields {
            if Self::take_once(&mut self.config.drop_once, sequence) {
                return Ok(());
            }
            if Self::take_once(&mut self.config.corrupt_once, sequence) && !payload.is_empty() {
                let mut bad = payload.to_vec();
                bad[0] ^= 0x01;
                return self.inner.send(header, &bad);
            }
        }

        if self.roll(self.config.loss_rate) {
            return Ok(());
        }

        let corrupt = !payload.is_empty() && self.roll(self.config.corrupt_rate);
        let owned;
        let payload = if corrupt {
            let mut bad = payload.to_vec();
            let byte = self.rng.random_range(0..bad.len());
            let bit = self.rng.random_range(0..8u32);
            bad[byte] ^= 1 << bit;
            owned = bad;
            &owned[..]
        } else {
            payload
        };

        self.inner.send(header, payload)?;
        if self.roll(self.config.duplicate_rate) {
            self.inner.send(header, payload)?;
        }
        Ok(())
    }

    fn receive(&mut self) -> io::Result<Vec<u8>> {
        self.inner.receive()
    }
}
