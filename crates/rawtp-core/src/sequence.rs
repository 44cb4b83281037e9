//! Sequence and acknowledgment engine.
//!
//! Receiver-driven selective repeat: the receiver decides what is missing
//! and asks for each gap by number. A collection with no gaps is answered
//! with one cumulative ACK naming the highest sequence seen.

use crate::codec::{self, Frame, MAX_PACKET_COLLECTION, Status};
use crate::conduit::Conduit;
use crate::error::{Error, Result};
use crate::window::ReceiveWindow;

/// What the engine sent back for a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acknowledgement {
    /// One RESEND went out per listed sequence, ascending.
    Missing(Vec<u16>),
    /// A single cumulative ACK went out for this sequence.
    Acknowledged(u16),
    /// Nothing has been received yet; nothing was sent.
    Idle,
}

impl Acknowledgement {
    pub fn missing_count(&self) -> usize {
        match self {
            Self::Missing(seqs) => seqs.len(),
            _ => 0,
        }
    }
}

/// Reply plan for the current window, without sending anything.
pub fn plan(window: &ReceiveWindow) -> Acknowledgement {
    match window.highest_sequence_seen() {
        None => Acknowledgement::Idle,
        Some(highest) => {
            let missing = window.missing();
            if missing.is_empty() {
                Acknowledgement::Acknowledged(highest)
            } else {
                Acknowledgement::Missing(missing)
            }
        }
    }
}

/// Mark every frame of the collection present. The collection ends at the
/// first absent slot or after `MAX_PACKET_COLLECTION` entries.
pub fn collect(window: &mut ReceiveWindow, frames: &[Option<Frame>]) -> usize {
    frames
        .iter()
        .take(MAX_PACKET_COLLECTION)
        .map_while(Option::as_ref)
        .filter(|frame| window.mark(frame.sequence()))
        .count()
}

/// Send the replies a plan calls for.
pub fn emit<C: Conduit + ?Sized>(conduit: &mut C, plan: &Acknowledgement) -> Result<()> {
    match plan {
        Acknowledgement::Missing(seqs) => {
            for &sequence in seqs {
                send_control(conduit, Status::Resend, sequence)?;
            }
            Ok(())
        }
        Acknowledgement::Acknowledged(highest) => send_control(conduit, Status::Ack, *highest),
        Acknowledgement::Idle => Ok(()),
    }
}

/// Run one collection through the engine: mark, scan, reply.
pub fn process<C: Conduit + ?Sized>(
    window: &mut ReceiveWindow,
    frames: &[Option<Frame>],
    conduit: &mut C,
) -> Result<Acknowledgement> {
    collect(window, frames);
    let outcome = plan(window);
    emit(conduit, &outcome)?;
    Ok(outcome)
}

/// [`process`] for a receiver that remembers its requests: a gap already
/// marked in `requested` gets no second RESEND, and every gap asked for now
/// is marked. The listed sequences are the ones asked for by this call.
pub fn process_unrequested<C: Conduit + ?Sized>(
    window: &mut ReceiveWindow,
    requested: &mut ReceiveWindow,
    frames: &[Option<Frame>],
    conduit: &mut C,
) -> Result<Acknowledgement> {
    collect(window, frames);
    let outcome = match plan(window) {
        Acknowledgement::Missing(seqs) => {
            Acknowledgement::Missing(seqs.into_iter().filter(|&s| requested.mark(s)).collect())
        }
        other => other,
    };
    emit(conduit, &outcome)?;
    Ok(outcome)
}

fn send_control<C: Conduit + ?Sized>(conduit: &mut C, status: Status, sequence: u16) -> Result<()> {
    let frame = codec::encode_control(status, sequence)?;
    conduit
        .send(&frame.header, &frame.payload)
        .map_err(Error::SendFailure)
}
