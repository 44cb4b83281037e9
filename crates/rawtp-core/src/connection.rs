//! Per-connection dispatcher.
//!
//! ```text
//! Established ──first DATA──▶ Active ──CLOSE sent/received──▶ Closing ──▶ Closed
//! ```
//!
//! One `Connection` owns its conduit, receive window, retransmission timer
//! and send cache. It runs single-threaded: frames are handled in the order
//! `Conduit::receive` returns them, and the only suspension points are that
//! read and the timer wait folded into it.
//!
//! Inbound dispatch:
//!
//! | Status          | Action                                          | Reply        |
//! |-----------------|-------------------------------------------------|--------------|
//! | DATA (good)     | gather into the collection, run sequence engine | ACK/RESEND   |
//! | DATA (corrupt)  | dropped                                         | CORRUPTION   |
//! | RESEND          | resend the cached payload, timer untouched      |              |
//! | ACK             | release cached frames, reset the timer          |              |
//! | CORRUPTION      | resend the cached payload immediately           |              |
//! | OOB             | urgent byte jumps the delivery queue            |              |
//! | CLOSE           | flush, disarm, close                            | CLOSE        |
//!
//! The wire carries no pass number. After the receiver acknowledges
//! sequence `MAX_SEQUENCE - 1` it waits for the next pass: another copy of
//! that last frame is answered with the same ACK instead of being admitted,
//! and any other sequence starts the new pass. The sender matches this by
//! probing a full pass with its last frame only when the timer expires, and
//! by ignoring ACKs for sequences it has not sent in the current pass.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::codec::{self, Frame, MAX_SEQUENCE, PAYLOAD_SIZE, Status};
use crate::conduit::{self, Conduit};
use crate::config::ConnectionConfig;
use crate::error::{Error, FormatError, Result};
use crate::integrity;
use crate::logging::{
    ConnectionEvent, ConnectionLog, ConnectionLogger, DROPPED_PREFIX_LEN, RetransmitCause,
};
use crate::sequence::{self, Acknowledgement};
use crate::timer::{Arm, RetransmitTimer};
use crate::window::ReceiveWindow;

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created; the first frame exchange opened it. No handshake.
    Established,
    /// DATA has flowed in at least one direction.
    Active,
    /// CLOSE sent or received.
    Closing,
    /// Terminal.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// What the application reads from a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Out-of-band byte, always ahead of queued data.
    Urgent(u8),
    /// In-order DATA payload.
    Data(Bytes),
}

/// Per-connection counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub retransmits: u64,
    pub corrupt_frames: u64,
    pub dropped_frames: u64,
    pub timer_expiries: u64,
    pub urgent_received: u64,
    pub passes_completed: u64,
}

/// One connection's dispatcher.
pub struct Connection<C: Conduit> {
    conduit: C,
    peer: Arc<str>,
    logger: Option<Arc<dyn ConnectionLogger>>,
    state: ConnectionState,
    stats: ConnectionStats,
    timer: RetransmitTimer,

    // Receive side
    window: ReceiveWindow,
    /// Gaps of this pass already asked for; the timer asks again.
    requested: ReceiveWindow,
    collection: Vec<Option<Frame>>,
    collection_limit: usize,
    reassembly: BTreeMap<u16, Bytes>,
    next_delivery: u16,
    awaiting_fill: bool,
    pass_finished: bool,
    urgent: VecDeque<u8>,
    inbox: VecDeque<Bytes>,

    // Send side
    next_sequence: u16,
    outstanding: BTreeMap<u16, Bytes>,
}

impl<C: Conduit> Connection<C> {
    pub fn new(conduit: C, config: ConnectionConfig) -> Self {
        let collection_limit = config.effective_collection_limit();
        let conn = Self {
            conduit,
            peer: config.peer,
            logger: config.logger,
            state: ConnectionState::Established,
            stats: ConnectionStats::default(),
            timer: RetransmitTimer::new(config.timer),
            window: ReceiveWindow::new(),
            requested: ReceiveWindow::new(),
            collection: Vec::with_capacity(collection_limit),
            collection_limit,
            reassembly: BTreeMap::new(),
            next_delivery: 0,
            awaiting_fill: false,
            pass_finished: false,
            urgent: VecDeque::new(),
            inbox: VecDeque::new(),
            next_sequence: 0,
            outstanding: BTreeMap::new(),
        };
        conn.log(ConnectionEvent::Opened);
        conn
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats
    }

    pub fn window(&self) -> &ReceiveWindow {
        &self.window
    }

    pub fn timer(&self) -> &RetransmitTimer {
        &self.timer
    }

    /// DATA frames sent but not yet acknowledged.
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn conduit(&self) -> &C {
        &self.conduit
    }

    pub fn conduit_mut(&mut self) -> &mut C {
        &mut self.conduit
    }

    // ── Application surface ────────────────────────────────────────────

    /// Send one DATA frame. Returns the sequence number it was given.
    ///
    /// The payload is cached until the peer acknowledges it. When the
    /// sequence space of the current pass is used up, this first drives the
    /// connection until everything outstanding is acknowledged.
    pub fn send(&mut self, payload: &[u8]) -> Result<u16> {
        self.ensure_open()?;
        if payload.len() > PAYLOAD_SIZE {
            return Err(FormatError::PayloadTooLarge { len: payload.len() }.into());
        }
        if self.next_sequence >= MAX_SEQUENCE {
            self.flush()?;
            self.next_sequence = 0;
        }

        let sequence = self.next_sequence;
        let payload = copy_payload(payload)?;
        self.transmit(Status::Data, sequence, payload.clone())?;
        self.activate();
        self.outstanding.insert(sequence, payload.clone());
        self.next_sequence += 1;
        self.log(ConnectionEvent::DataSent {
            sequence,
            size: payload.len(),
        });
        self.arm_timer()?;
        Ok(sequence)
    }

    /// Send a single urgent byte. Not cached and not acknowledged.
    pub fn send_urgent(&mut self, byte: u8) -> Result<()> {
        self.ensure_open()?;
        let sequence = self.next_sequence % MAX_SEQUENCE;
        self.transmit(Status::Oob, sequence, Bytes::copy_from_slice(&[byte]))
    }

    /// Next delivery for the application: urgent bytes first, then data in
    /// sequence order.
    pub fn recv(&mut self) -> Option<Delivery> {
        if let Some(byte) = self.urgent.pop_front() {
            return Some(Delivery::Urgent(byte));
        }
        self.inbox.pop_front().map(Delivery::Data)
    }

    /// Drive the connection until every sent DATA frame is acknowledged.
    ///
    /// Bounded by the retransmission timer: a silent peer ends in
    /// `TimeoutExceeded`.
    pub fn flush(&mut self) -> Result<()> {
        while !self.outstanding.is_empty() {
            self.poll()?;
        }
        self.ensure_open()
    }

    /// Close the connection.
    ///
    /// Sends CLOSE, disarms the data timer and waits for the peer's CLOSE
    /// under the same bounded backoff. Unacknowledged DATA is discarded; call
    /// [`Connection::flush`] first to wait for it. Closing a closed connection
    /// is rejected with [`Error::Closed`] and has no side effects.
    pub fn close(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.flush_collection()?;

        let unacked = self.outstanding.len();
        self.outstanding.clear();
        self.awaiting_fill = false;
        self.timer.reset();

        if let Err(e) = self.send_control(Status::Close, 0) {
            self.finish_close(Some(e.to_string()));
            return Err(e);
        }
        self.state = ConnectionState::Closing;
        self.log(ConnectionEvent::Closing {
            local: true,
            unacked,
        });

        if let Arm::Abort = self.timer.arm(None) {
            return self.abort();
        }
        while self.state == ConnectionState::Closing {
            if let Err(e) = self.poll() {
                if !self.is_closed() {
                    self.finish_close(Some(e.to_string()));
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// One step of the dispatcher loop: check the timer, read at most one
    /// frame (or time out), dispatch it, check the timer again.
    pub fn poll(&mut self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        self.check_timer()?;
        if self.is_closed() {
            return Ok(());
        }

        match self.conduit.receive() {
            Ok(datagram) => {
                self.stats.frames_received += 1;
                self.handle_datagram(&datagram)?;
                if self.collection.len() >= self.collection_limit {
                    self.flush_collection()?;
                }
            }
            Err(e) if conduit::is_idle(&e) => {
                self.flush_collection()?;
            }
            Err(e) => return Err(Error::ReceiveFailure(e)),
        }

        self.check_timer()
    }

    // ── Inbound dispatch ───────────────────────────────────────────────

    fn handle_datagram(&mut self, datagram: &[u8]) -> Result<()> {
        let frame = match Frame::from_wire(datagram) {
            Ok(frame) => frame,
            Err(Error::Format(reason)) => {
                self.stats.dropped_frames += 1;
                self.log(ConnectionEvent::FrameDropped {
                    reason: reason.to_string(),
                    prefix: datagram[..datagram.len().min(DROPPED_PREFIX_LEN)].to_vec(),
                });
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if self.state == ConnectionState::Closing {
            // Only the peer's CLOSE matters now.
            if frame.status() == Status::Close {
                self.finish_close(None);
            }
            return Ok(());
        }

        match frame.status() {
            Status::Data => self.on_data(frame),
            Status::Ack => self.on_ack(frame.sequence()),
            Status::Resend => self.retransmit(frame.sequence(), RetransmitCause::ResendRequest),
            Status::Corruption => {
                self.retransmit(frame.sequence(), RetransmitCause::CorruptionReport)
            }
            Status::Oob => {
                self.on_urgent(&frame);
                Ok(())
            }
            Status::Close => self.on_close(),
        }
    }

    fn on_data(&mut self, frame: Frame) -> Result<()> {
        self.activate();
        let sequence = frame.sequence();

        if self.pass_finished {
            if sequence == MAX_SEQUENCE - 1 {
                // The peer missed the ACK that ended the pass.
                self.log(ConnectionEvent::StaleData { sequence });
                self.send_control(Status::Ack, sequence)?;
                self.log(ConnectionEvent::AckSent { sequence });
                return Ok(());
            }
            self.pass_finished = false;
        }

        if let Err(Error::ChecksumMismatch { .. }) = frame.verify() {
            self.stats.corrupt_frames += 1;
            self.log(ConnectionEvent::CorruptionDetected {
                sequence,
                expected: frame.header.checksum,
                actual: integrity::checksum(&frame.payload),
            });
            self.requested.mark(sequence);
            return self.send_control(Status::Corruption, sequence);
        }

        let duplicate = self.window.is_present(sequence) || self.reassembly.contains_key(&sequence);
        if !duplicate {
            self.reassembly.insert(sequence, frame.payload.clone());
        }
        self.log(ConnectionEvent::DataReceived {
            sequence,
            size: frame.payload.len(),
            duplicate,
        });
        self.collection.push(Some(frame));
        Ok(())
    }

    fn on_ack(&mut self, sequence: u16) -> Result<()> {
        if sequence >= self.next_sequence {
            // Nothing that high went out in this pass.
            self.log(ConnectionEvent::StaleRequest {
                status: Status::Ack,
                sequence,
            });
            return Ok(());
        }
        let acked: Vec<u16> = self.outstanding.range(..=sequence).map(|(&s, _)| s).collect();
        for s in &acked {
            self.outstanding.remove(s);
        }
        self.log(ConnectionEvent::AckReceived {
            sequence,
            released: acked.len(),
        });
        if acked.is_empty() {
            return Ok(());
        }

        self.timer.reset();
        if !self.outstanding.is_empty() || self.awaiting_fill {
            self.arm_timer()?;
        }
        Ok(())
    }

    fn on_urgent(&mut self, frame: &Frame) {
        if frame.verify().is_err() {
            // Urgent bytes are not cached by the sender, so there is nothing
            // to ask for again.
            self.stats.corrupt_frames += 1;
            self.log(ConnectionEvent::CorruptionDetected {
                sequence: frame.sequence(),
                expected: frame.header.checksum,
                actual: integrity::checksum(&frame.payload),
            });
            return;
        }
        let byte = frame.payload[0];
        self.urgent.push_back(byte);
        self.stats.urgent_received += 1;
        self.log(ConnectionEvent::UrgentReceived { byte });
    }

    fn on_close(&mut self) -> Result<()> {
        self.flush_collection()?;
        let unacked = self.outstanding.len();
        self.state = ConnectionState::Closing;
        self.timer.reset();
        self.log(ConnectionEvent::Closing {
            local: false,
            unacked,
        });

        let reply = self.send_control(Status::Close, 0);
        self.finish_close(reply.as_ref().err().map(|e| e.to_string()));
        reply
    }

    // ── Sequence engine hand-off ───────────────────────────────────────

    /// Run the gathered DATA frames through the sequence engine and deliver
    /// whatever is now contiguous.
    fn flush_collection(&mut self) -> Result<()> {
        if self.collection.is_empty() {
            return Ok(());
        }
        let frames = std::mem::take(&mut self.collection);
        let present_before = self.window.received();
        let outcome = sequence::process_unrequested(
            &mut self.window,
            &mut self.requested,
            &frames,
            &mut self.conduit,
        )?;
        let progressed = self.window.received() > present_before;
        self.collection = frames;
        self.collection.clear();

        match &outcome {
            Acknowledgement::Missing(seqs) => {
                self.stats.frames_sent += seqs.len() as u64;
                for &sequence in seqs {
                    self.log(ConnectionEvent::ResendRequested { sequence });
                }
                // Backoff only escalates while nothing is filled or newly asked for.
                if progressed || !seqs.is_empty() {
                    self.timer.reset();
                }
                self.awaiting_fill = true;
                self.arm_timer()?;
            }
            Acknowledgement::Acknowledged(sequence) => {
                self.stats.frames_sent += 1;
                self.log(ConnectionEvent::AckSent {
                    sequence: *sequence,
                });
                self.awaiting_fill = false;
            }
            Acknowledgement::Idle => {}
        }

        self.deliver_in_order();

        if outcome == Acknowledgement::Acknowledged(MAX_SEQUENCE - 1) {
            self.window.reset();
            self.requested.reset();
            self.reassembly.clear();
            self.next_delivery = 0;
            self.pass_finished = true;
            self.stats.passes_completed += 1;
            self.log(ConnectionEvent::PassCompleted {
                passes: self.stats.passes_completed,
            });
        }

        if self.outstanding.is_empty() && !self.awaiting_fill {
            self.timer.reset();
        }
        Ok(())
    }

    fn deliver_in_order(&mut self) {
        while let Some(payload) = self.reassembly.remove(&self.next_delivery) {
            self.inbox.push_back(payload);
            self.next_delivery += 1;
        }
    }

    // ── Retransmission ─────────────────────────────────────────────────

    fn retransmit(&mut self, sequence: u16, cause: RetransmitCause) -> Result<()> {
        let Some(payload) = self.outstanding.get(&sequence).cloned() else {
            let status = match cause {
                RetransmitCause::CorruptionReport => Status::Corruption,
                _ => Status::Resend,
            };
            self.log(ConnectionEvent::StaleRequest { status, sequence });
            return Ok(());
        };
        self.transmit(Status::Data, sequence, payload)?;
        self.stats.retransmits += 1;
        self.log(ConnectionEvent::Retransmitted { sequence, cause });
        Ok(())
    }

    /// Consume a timer expiry, if one is pending, and act on it.
    fn check_timer(&mut self) -> Result<()> {
        if self.is_closed() || !self.timer.poll_expired() {
            return Ok(());
        }
        self.stats.timer_expiries += 1;
        let next = self.timer.back_off();
        self.log(ConnectionEvent::TimerExpired {
            retry_count: self.timer.retry_count(),
            next_timeout: match next {
                Arm::Armed(t) => Some(t),
                Arm::Abort => None,
            },
        });
        if next == Arm::Abort {
            return self.abort();
        }

        if self.state == ConnectionState::Closing {
            return self.send_control(Status::Close, 0);
        }

        // A full pass is retried with its last frame only. The peer may have
        // reset its window already, and earlier copies would land in the next pass.
        let last = MAX_SEQUENCE - 1;
        let pending: Vec<(u16, Bytes)> = match self.outstanding.get(&last) {
            Some(payload) => vec![(last, payload.clone())],
            None => self
                .outstanding
                .iter()
                .map(|(&s, p)| (s, p.clone()))
                .collect(),
        };
        for (sequence, payload) in pending {
            self.transmit(Status::Data, sequence, payload)?;
            self.stats.retransmits += 1;
            self.log(ConnectionEvent::Retransmitted {
                sequence,
                cause: RetransmitCause::Timeout,
            });
        }

        if self.awaiting_fill {
            let plan = sequence::plan(&self.window);
            if let Acknowledgement::Missing(seqs) = &plan {
                sequence::emit(&mut self.conduit, &plan)?;
                self.stats.frames_sent += seqs.len() as u64;
                for &sequence in seqs {
                    self.log(ConnectionEvent::ResendRequested { sequence });
                }
            } else {
                self.awaiting_fill = false;
            }
        }

        if self.outstanding.is_empty() && !self.awaiting_fill {
            self.timer.reset();
        }
        Ok(())
    }

    fn arm_timer(&mut self) -> Result<()> {
        match self.timer.ensure_armed() {
            Arm::Armed(_) => Ok(()),
            Arm::Abort => self.abort(),
        }
    }

    /// Give up: tell the peer (best effort) and close with an error.
    fn abort(&mut self) -> Result<()> {
        let retries = self.timer.retry_count();
        if self.state != ConnectionState::Closing {
            let _ = self.send_control(Status::Close, 0);
        }
        let err = Error::TimeoutExceeded { retries };
        self.finish_close(Some(err.to_string()));
        Err(err)
    }

    // ── Plumbing ───────────────────────────────────────────────────────

    fn transmit(&mut self, status: Status, sequence: u16, payload: Bytes) -> Result<()> {
        let frame = codec::encode(status, sequence, payload)?;
        self.conduit
            .send(&frame.header, &frame.payload)
            .map_err(Error::SendFailure)?;
        self.stats.frames_sent += 1;
        Ok(())
    }

    fn send_control(&mut self, status: Status, sequence: u16) -> Result<()> {
        self.transmit(status, sequence, Bytes::new())
    }

    fn activate(&mut self) {
        if self.state == ConnectionState::Established {
            self.state = ConnectionState::Active;
        }
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            ConnectionState::Established | ConnectionState::Active => Ok(()),
            ConnectionState::Closing | ConnectionState::Closed => Err(Error::Closed),
        }
    }

    fn finish_close(&mut self, error: Option<String>) {
        self.timer.reset();
        self.outstanding.clear();
        self.collection.clear();
        self.awaiting_fill = false;
        self.pass_finished = false;
        self.state = ConnectionState::Closed;
        self.log(ConnectionEvent::Closed { error });
    }

    fn log(&self, event: ConnectionEvent) {
        if let Some(logger) = &self.logger {
            logger.log(ConnectionLog {
                component: "dispatcher",
                peer: self.peer.clone(),
                event,
            });
        }
    }
}

/// Copy an application payload into a frame buffer without aborting on
/// allocation failure.
fn copy_payload(payload: &[u8]) -> Result<Bytes> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(payload.len())
        .map_err(|_| Error::AllocationFailure {
            requested: payload.len(),
        })?;
    buf.extend_from_slice(payload);
    Ok(Bytes::from(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::time::{Duration, Instant};

    use crate::timer::TimerConfig;

    /// Scripted conduit: inbound frames are queued up front, outbound frames
    /// are recorded.
    #[derive(Default)]
    struct Script {
        inbound: VecDeque<Vec<u8>>,
        sent: Vec<Frame>,
        /// Refuse every send once this many frames went out.
        fail_after: Option<usize>,
    }

    impl Script {
        fn push(&mut self, status: Status, sequence: u16, payload: &[u8]) {
            let enc = codec::encode(status, sequence, Bytes::copy_from_slice(payload)).unwrap();
            self.push_raw(wire(&enc));
        }

        fn push_raw(&mut self, bytes: Vec<u8>) {
            self.inbound.push_back(bytes);
        }

        fn sent_headers(&self) -> Vec<(Status, u16)> {
            self.sent.iter().map(|f| (f.status(), f.sequence())).collect()
        }
    }

    impl Conduit for Script {
        fn send(&mut self, header: &[u8], payload: &[u8]) -> io::Result<()> {
            if self.fail_after.is_some_and(|n| self.sent.len() >= n) {
                return Err(io::ErrorKind::BrokenPipe.into());
            }
            let mut bytes = header.to_vec();
            bytes.extend_from_slice(payload);
            self.sent.push(Frame::from_wire(&bytes).unwrap());
            Ok(())
        }

        fn receive(&mut self) -> io::Result<Vec<u8>> {
            match self.inbound.pop_front() {
                Some(bytes) => Ok(bytes),
                None => {
                    std::thread::sleep(Duration::from_millis(1));
                    Err(io::ErrorKind::WouldBlock.into())
                }
            }
        }
    }

    fn wire(enc: &codec::EncodedFrame) -> Vec<u8> {
        let mut bytes = enc.header.to_vec();
        bytes.extend_from_slice(&enc.payload);
        bytes
    }

    fn fast_timer() -> TimerConfig {
        TimerConfig {
            initial_timeout: Duration::from_millis(5),
            max_timeout: Duration::from_millis(40),
        }
    }

    fn connection() -> Connection<Script> {
        Connection::new(
            Script::default(),
            ConnectionConfig::default()
                .with_peer("test")
                .with_logger(None),
        )
    }

    /// Poll until the scripted inbound queue is empty and one idle pass ran.
    fn drain(conn: &mut Connection<Script>) {
        while !conn.conduit().inbound.is_empty() {
            conn.poll().unwrap();
        }
        conn.poll().unwrap();
    }

    #[test]
    fn data_in_order_is_acked_and_delivered() {
        let mut conn = connection();
        conn.conduit_mut().push(Status::Data, 0, b"one");
        conn.conduit_mut().push(Status::Data, 1, b"two");
        drain(&mut conn);

        assert_eq!(conn.state(), ConnectionState::Active);
        assert_eq!(conn.conduit().sent_headers(), vec![(Status::Ack, 1)]);
        assert_eq!(conn.recv(), Some(Delivery::Data(Bytes::from_static(b"one"))));
        assert_eq!(conn.recv(), Some(Delivery::Data(Bytes::from_static(b"two"))));
        assert_eq!(conn.recv(), None);
    }

    #[test]
    fn gap_triggers_resend_then_fill_acks() {
        let mut conn = connection();
        for s in [0, 1, 3, 5] {
            conn.conduit_mut().push(Status::Data, s, &[s as u8]);
        }
        drain(&mut conn);
        assert_eq!(
            conn.conduit().sent_headers(),
            vec![(Status::Resend, 2), (Status::Resend, 4)]
        );
        assert!(conn.timer().is_armed());

        // Only 0 and 1 are deliverable so far.
        assert_eq!(conn.recv(), Some(Delivery::Data(Bytes::from_static(&[0]))));
        assert_eq!(conn.recv(), Some(Delivery::Data(Bytes::from_static(&[1]))));
        assert_eq!(conn.recv(), None);

        conn.conduit_mut().sent.clear();
        conn.conduit_mut().push(Status::Data, 2, &[2]);
        conn.conduit_mut().push(Status::Data, 4, &[4]);
        drain(&mut conn);
        assert_eq!(conn.conduit().sent_headers(), vec![(Status::Ack, 5)]);
        assert!(!conn.timer().is_armed());
        let rest: Vec<_> = std::iter::from_fn(|| conn.recv()).collect();
        assert_eq!(
            rest,
            [2u8, 3, 4, 5]
                .iter()
                .map(|b| Delivery::Data(Bytes::copy_from_slice(&[*b])))
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn corrupt_data_gets_corruption_reply_and_is_not_collected() {
        let mut conn = connection();
        let enc = codec::encode(Status::Data, 7, Bytes::from_static(b"payload")).unwrap();
        let mut bytes = wire(&enc);
        bytes[codec::HEADER_SIZE] ^= 0x40;
        conn.conduit_mut().push_raw(bytes);
        drain(&mut conn);

        assert_eq!(conn.conduit().sent_headers(), vec![(Status::Corruption, 7)]);
        assert!(!conn.window().is_present(7));
        assert_eq!(conn.stats().corrupt_frames, 1);
        assert_eq!(conn.recv(), None);
    }

    #[test]
    fn corruption_report_resends_identical_payload() {
        let mut conn = connection();
        for i in 0..8u8 {
            conn.send(&[b'p', i]).unwrap();
        }
        let original = conn.conduit().sent[7].clone();
        assert_eq!(original.sequence(), 7);

        conn.conduit_mut().push(Status::Corruption, 7, &[]);
        conn.poll().unwrap();

        let resent = conn.conduit().sent.last().unwrap().clone();
        assert_eq!(resent, original);
        assert_eq!(conn.stats().retransmits, 1);
    }

    #[test]
    fn resend_request_for_cached_and_stale_sequences() {
        let mut conn = connection();
        conn.send(b"a").unwrap();
        conn.send(b"b").unwrap();
        let retry_before = conn.timer().retry_count();

        conn.conduit_mut().push(Status::Resend, 1, &[]);
        conn.conduit_mut().push(Status::Resend, 9, &[]);
        conn.poll().unwrap();
        conn.poll().unwrap();

        let sent = conn.conduit().sent_headers();
        assert_eq!(sent, vec![(Status::Data, 0), (Status::Data, 1), (Status::Data, 1)]);
        assert_eq!(conn.conduit().sent[2].payload, Bytes::from_static(b"b"));
        assert_eq!(conn.timer().retry_count(), retry_before);
    }

    #[test]
    fn cumulative_ack_releases_cache_and_disarms() {
        let mut conn = connection();
        for _ in 0..3 {
            conn.send(b"x").unwrap();
        }
        assert_eq!(conn.outstanding(), 3);
        assert!(conn.timer().is_armed());

        conn.conduit_mut().push(Status::Ack, 1, &[]);
        conn.poll().unwrap();
        assert_eq!(conn.outstanding(), 1);
        assert!(conn.timer().is_armed());
        assert_eq!(conn.timer().retry_count(), 0);

        conn.conduit_mut().push(Status::Ack, 2, &[]);
        conn.poll().unwrap();
        assert_eq!(conn.outstanding(), 0);
        assert!(!conn.timer().is_armed());
    }

    #[test]
    fn urgent_byte_jumps_ahead_of_data() {
        let mut conn = connection();
        conn.conduit_mut().push(Status::Data, 0, b"d0");
        conn.conduit_mut().push(Status::Oob, 0, b"!");
        conn.conduit_mut().push(Status::Data, 1, b"d1");
        drain(&mut conn);

        assert_eq!(conn.recv(), Some(Delivery::Urgent(b'!')));
        assert_eq!(conn.recv(), Some(Delivery::Data(Bytes::from_static(b"d0"))));
        assert_eq!(conn.recv(), Some(Delivery::Data(Bytes::from_static(b"d1"))));
    }

    #[test]
    fn urgent_byte_bypasses_sequence_engine() {
        let mut conn = connection();
        conn.conduit_mut().push(Status::Data, 1, b"d1");
        conn.conduit_mut().push(Status::Oob, 1, b"X");
        conn.conduit_mut().push(Status::Data, 2, b"d2");
        drain(&mut conn);

        assert_eq!(conn.recv(), Some(Delivery::Urgent(b'X')));
        // Sequence 0 never arrived, so no data is deliverable yet.
        assert_eq!(conn.recv(), None);
        assert_eq!(conn.conduit().sent_headers(), vec![(Status::Resend, 0)]);
        assert!(!conn.window().is_present(0));
    }

    #[test]
    fn malformed_frames_are_dropped_silently() {
        let mut conn = connection();
        conn.conduit_mut().push_raw(vec![0x00, 0x01, 0x02]);
        let mut unknown = codec::encode_control(Status::Ack, 0).unwrap().header.to_vec();
        unknown[1] = 0x77;
        conn.conduit_mut().push_raw(unknown);
        drain(&mut conn);

        assert!(conn.conduit().sent.is_empty());
        assert_eq!(conn.stats().dropped_frames, 2);
        assert_eq!(conn.state(), ConnectionState::Established);
    }

    #[test]
    fn peer_close_is_acknowledged_and_terminal() {
        let mut conn = connection();
        conn.send(b"pending").unwrap();
        conn.conduit_mut().push(Status::Data, 0, b"last");
        conn.conduit_mut().push(Status::Close, 0, &[]);
        conn.poll().unwrap();
        conn.poll().unwrap();

        assert!(conn.is_closed());
        assert!(!conn.timer().is_armed());
        assert_eq!(
            conn.conduit().sent_headers(),
            vec![(Status::Data, 0), (Status::Ack, 0), (Status::Close, 0)]
        );
        // Data that arrived before CLOSE is still readable.
        assert_eq!(conn.recv(), Some(Delivery::Data(Bytes::from_static(b"last"))));
        assert!(matches!(conn.poll(), Err(Error::Closed)));
        assert!(matches!(conn.send(b"x"), Err(Error::Closed)));
    }

    #[test]
    fn local_close_waits_for_peer_close() {
        let mut conn = connection();
        conn.conduit_mut().push(Status::Close, 0, &[]);
        conn.close().unwrap();
        assert!(conn.is_closed());
        assert_eq!(conn.conduit().sent_headers(), vec![(Status::Close, 0)]);
    }

    #[test]
    fn close_on_closed_connection_is_rejected_without_side_effects() {
        let mut conn = connection();
        conn.conduit_mut().push(Status::Close, 0, &[]);
        conn.close().unwrap();
        let sent_before = conn.conduit().sent.len();
        let stats_before = conn.stats();

        assert!(matches!(conn.close(), Err(Error::Closed)));
        assert_eq!(conn.conduit().sent.len(), sent_before);
        assert_eq!(conn.stats(), stats_before);
    }

    #[test]
    fn unanswered_close_times_out_but_ends_closed() {
        let mut conn = Connection::new(
            Script::default(),
            ConnectionConfig::default()
                .with_timer(fast_timer())
                .with_logger(None),
        );
        let err = conn.close().unwrap_err();
        assert!(matches!(err, Error::TimeoutExceeded { .. }));
        assert!(conn.is_closed());
        // Initial CLOSE plus one per expiry that did not abort.
        assert!(conn
            .conduit()
            .sent_headers()
            .iter()
            .all(|&(s, _)| s == Status::Close));
        assert_eq!(conn.conduit().sent.len(), 3);
    }

    #[test]
    fn failed_close_resend_still_ends_closed() {
        let mut conn = Connection::new(
            Script {
                fail_after: Some(1),
                ..Default::default()
            },
            ConnectionConfig::default()
                .with_timer(fast_timer())
                .with_logger(None),
        );
        let err = conn.close().unwrap_err();
        assert!(matches!(err, Error::SendFailure(_)));
        assert!(conn.is_closed());
        assert!(!conn.timer().is_armed());
        assert_eq!(conn.conduit().sent_headers(), vec![(Status::Close, 0)]);
        assert!(matches!(conn.close(), Err(Error::Closed)));
    }

    #[test]
    fn silent_peer_aborts_after_bounded_retries() {
        let mut conn = Connection::new(
            Script::default(),
            ConnectionConfig::default()
                .with_timer(fast_timer())
                .with_logger(None),
        );
        conn.send(b"hello").unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let err = loop {
            match conn.poll() {
                Ok(()) => assert!(Instant::now() < deadline, "timer never aborted"),
                Err(e) => break e,
            }
        };
        assert!(matches!(err, Error::TimeoutExceeded { retries: 3 }));
        assert!(conn.is_closed());
        // 5ms, 10ms, 20ms armed; 40ms hits the ceiling.
        assert_eq!(
            conn.conduit().sent_headers(),
            vec![
                (Status::Data, 0),
                (Status::Data, 0),
                (Status::Data, 0),
                (Status::Close, 0)
            ]
        );
        assert_eq!(conn.stats().timer_expiries, 3);
    }

    #[test]
    fn oversized_send_is_rejected() {
        let mut conn = connection();
        let err = conn.send(&vec![0u8; PAYLOAD_SIZE + 1]).unwrap_err();
        assert!(matches!(err, Error::Format(FormatError::PayloadTooLarge { .. })));
        assert!(conn.conduit().sent.is_empty());
        assert_eq!(conn.state(), ConnectionState::Established);
    }

    #[test]
    fn full_pass_resets_window() {
        let mut conn = connection();
        for s in 0..MAX_SEQUENCE {
            conn.conduit_mut().push(Status::Data, s, &s.to_be_bytes());
        }
        drain(&mut conn);
        assert_eq!(
            conn.conduit().sent_headers().last(),
            Some(&(Status::Ack, MAX_SEQUENCE - 1))
        );
        assert_eq!(conn.stats().passes_completed, 1);
        assert!(conn.window().is_empty());

        let delivered = std::iter::from_fn(|| conn.recv()).count();
        assert_eq!(delivered, MAX_SEQUENCE as usize);

        // The next pass starts from sequence 0 again.
        conn.conduit_mut().push(Status::Data, 0, b"again");
        drain(&mut conn);
        assert_eq!(conn.recv(), Some(Delivery::Data(Bytes::from_static(b"again"))));
    }

    fn complete_pass(conn: &mut Connection<Script>) {
        for s in 0..MAX_SEQUENCE {
            conn.conduit_mut().push(Status::Data, s, &s.to_be_bytes());
        }
        drain(conn);
        assert_eq!(std::iter::from_fn(|| conn.recv()).count(), MAX_SEQUENCE as usize);
        conn.conduit_mut().sent.clear();
    }

    #[test]
    fn last_frame_after_pass_is_reacknowledged_not_delivered() {
        let mut conn = connection();
        complete_pass(&mut conn);

        // Our ACK for the pass was lost; the peer resends its last frame.
        let last = MAX_SEQUENCE - 1;
        conn.conduit_mut().push(Status::Data, last, &last.to_be_bytes());
        conn.conduit_mut().push(Status::Data, last, &last.to_be_bytes());
        drain(&mut conn);

        assert_eq!(
            conn.conduit().sent_headers(),
            vec![(Status::Ack, last), (Status::Ack, last)]
        );
        assert_eq!(conn.recv(), None);
        assert!(conn.window().is_empty());
        assert_eq!(conn.stats().passes_completed, 1);

        conn.conduit_mut().push(Status::Data, 0, b"next");
        drain(&mut conn);
        assert_eq!(conn.recv(), Some(Delivery::Data(Bytes::from_static(b"next"))));
    }

    #[test]
    fn next_pass_may_start_past_zero() {
        let mut conn = connection();
        complete_pass(&mut conn);

        conn.conduit_mut().push(Status::Data, 1, b"one");
        drain(&mut conn);
        assert_eq!(conn.conduit().sent_headers(), vec![(Status::Resend, 0)]);
        assert_eq!(conn.recv(), None);

        conn.conduit_mut().push(Status::Data, 0, b"zero");
        drain(&mut conn);
        assert_eq!(conn.recv(), Some(Delivery::Data(Bytes::from_static(b"zero"))));
        assert_eq!(conn.recv(), Some(Delivery::Data(Bytes::from_static(b"one"))));
    }

    #[test]
    fn gap_is_requested_once_until_the_timer_fires() {
        let mut conn = connection();
        conn.conduit_mut().push(Status::Data, 0, b"a");
        conn.conduit_mut().push(Status::Data, 2, b"c");
        drain(&mut conn);
        conn.conduit_mut().push(Status::Data, 3, b"d");
        drain(&mut conn);

        assert_eq!(conn.conduit().sent_headers(), vec![(Status::Resend, 1)]);
    }

    #[test]
    fn corrupt_frame_is_not_also_requested_as_gap() {
        let mut conn = connection();
        let enc = codec::encode(Status::Data, 1, Bytes::from_static(b"b")).unwrap();
        let mut bytes = wire(&enc);
        bytes[codec::HEADER_SIZE] ^= 0x01;
        conn.conduit_mut().push(Status::Data, 0, b"a");
        conn.conduit_mut().push_raw(bytes);
        conn.conduit_mut().push(Status::Data, 2, b"c");
        drain(&mut conn);

        assert_eq!(conn.conduit().sent_headers(), vec![(Status::Corruption, 1)]);
    }

    #[test]
    fn full_pass_timeout_resends_last_frame_only() {
        let last = MAX_SEQUENCE - 1;
        let mut conn = Connection::new(
            Script::default(),
            ConnectionConfig::default()
                .with_timer(TimerConfig {
                    initial_timeout: Duration::from_millis(50),
                    max_timeout: Duration::from_secs(2),
                })
                .with_logger(None),
        );
        for s in 0..MAX_SEQUENCE {
            conn.send(&s.to_be_bytes()).unwrap();
        }
        conn.conduit_mut().push(Status::Ack, 100, &[]);
        conn.poll().unwrap();
        assert_eq!(conn.outstanding(), usize::from(last - 100));
        conn.conduit_mut().sent.clear();

        while conn.stats().retransmits == 0 {
            conn.poll().unwrap();
        }
        assert_eq!(conn.conduit().sent_headers(), vec![(Status::Data, last)]);

        conn.conduit_mut().push(Status::Ack, last, &[]);
        conn.poll().unwrap();
        assert_eq!(conn.outstanding(), 0);

        // A repeated ACK for the old pass must not release the new one.
        assert_eq!(conn.send(b"next").unwrap(), 0);
        conn.conduit_mut().push(Status::Ack, last, &[]);
        conn.poll().unwrap();
        assert_eq!(conn.outstanding(), 1);
        assert!(conn.timer().is_armed());
    }
}
