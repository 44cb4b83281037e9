//! Raw IPv4 socket plumbing.
//!
//! One socket is shared by the whole node. The reader thread owns the
//! receive side and demultiplexes; every peer worker sends through the same
//! socket with its own [`RawConduit`].

use std::io::{self, IoSlice};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use rawtp_core::{Conduit, FRAME_MAX};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::ip::{DEFAULT_TTL, IPV4_HEADER_LEN, Ipv4Header};

/// Largest datagram the reader accepts: IPv4 header with maximum options
/// plus one frame.
pub const RECV_BUFFER: usize = 60 + FRAME_MAX;

/// Open a raw IPv4 socket for `protocol` with `IP_HDRINCL` set.
///
/// Needs `CAP_NET_RAW` (or root).
pub fn open_socket(bind_addr: Ipv4Addr, protocol: u8, read_timeout: Duration) -> io::Result<Socket> {
    let socket = Socket::new(
        Domain::IPV4,
        Type::RAW,
        Some(Protocol::from(i32::from(protocol))),
    )?;
    socket.set_header_included(true)?;
    socket.set_nonblocking(false)?;
    socket.set_read_timeout(Some(read_timeout))?;
    socket.bind(&SocketAddrV4::new(bind_addr, 0).into())?;
    Ok(socket)
}

/// IPv4 identification counter shared by every sender on the socket.
#[derive(Debug, Default)]
pub struct IdentSource(AtomicU16);

impl IdentSource {
    pub fn new(start: u16) -> Self {
        Self(AtomicU16::new(start))
    }

    pub fn next(&self) -> u16 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// Conduit for one peer: sends through the shared raw socket, receives from
/// the demultiplexer's per-peer queue.
pub struct RawConduit {
    socket: Arc<Socket>,
    idents: Arc<IdentSource>,
    local: Ipv4Addr,
    peer: Ipv4Addr,
    peer_addr: SockAddr,
    protocol: u8,
    inbound: Receiver<Vec<u8>>,
    poll_interval: Duration,
}

impl RawConduit {
    pub fn new(
        socket: Arc<Socket>,
        idents: Arc<IdentSource>,
        local: Ipv4Addr,
        peer: Ipv4Addr,
        protocol: u8,
        inbound: Receiver<Vec<u8>>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            socket,
            idents,
            local,
            peer,
            peer_addr: SocketAddrV4::new(peer, 0).into(),
            protocol,
            inbound,
            poll_interval,
        }
    }
}

impl Conduit for RawConduit {
    fn send(&mut self, header: &[u8], payload: &[u8]) -> io::Result<()> {
        let transport_len = header.len() + payload.len();
        let payload_len = u16::try_from(transport_len)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large for IPv4"))?;
        let ip = Ipv4Header {
            source: self.local,
            destination: self.peer,
            protocol: self.protocol,
            identification: self.idents.next(),
            ttl: DEFAULT_TTL,
            payload_len,
        }
        .to_bytes();

        let segments = [IoSlice::new(&ip), IoSlice::new(header), IoSlice::new(payload)];
        let written = self.socket.send_to_vectored(&segments, &self.peer_addr)?;
        if written != IPV4_HEADER_LEN + transport_len {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short raw write: {} of {} bytes", written, IPV4_HEADER_LEN + transport_len),
            ));
        }
        Ok(())
    }

    fn receive(&mut self) -> io::Result<Vec<u8>> {
        match self.inbound.recv_timeout(self.poll_interval) {
            Ok(frame) => Ok(frame),
            Err(RecvTimeoutError::Timeout) => Err(io::ErrorKind::WouldBlock.into()),
            Err(RecvTimeoutError::Disconnected) => Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "demultiplexer stopped",
            )),
        }
    }
}
