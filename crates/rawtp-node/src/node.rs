/// Echo node: one raw socket, one worker thread per peer.
///
/// ```text
/// [Reader] --strip IPv4--> route by source --crossbeam--> [Peer worker] x N
/// read()                   spawn on first frame           Connection<RawConduit>
/// shared Arc<Socket>       reap finished workers          welcome, echo, log urgent
/// ```
///
/// Workers share nothing but the socket used for sending.

use std::collections::HashMap;
use std::io::{self, Read};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Sender, TrySendError, bounded};
use rawtp_core::{
    Connection, ConnectionConfig, ConnectionStats, Delivery, Error, FRAME_MAX, HEADER_SIZE,
    PAYLOAD_SIZE, conduit,
};
use socket2::Socket;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::ip::{self, Inbound, StripError};
use crate::raw::{IdentSource, RECV_BUFFER, RawConduit};

/// Frames queued per peer before the reader starts dropping for it.
const PEER_QUEUE: usize = 1024;

/// Why the reader discarded a datagram before routing it.
#[derive(Debug, PartialEq, Eq)]
pub enum Discard {
    Layer3(StripError),
    /// Our own transmission looped back to the raw socket.
    OwnTraffic,
    /// Too short or too long to be a transport frame.
    BadSize(usize),
}

impl std::fmt::Display for Discard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Layer3(e) => write!(f, "{}", e),
            Self::OwnTraffic => write!(f, "own transmission"),
            Self::BadSize(len) => write!(f, "{} bytes cannot be a frame", len),
        }
    }
}

/// Strip and sanity-check one datagram read from the raw socket.
pub fn classify(datagram: &[u8], local: Ipv4Addr) -> Result<Inbound<'_>, Discard> {
    let inbound = ip::strip_header(datagram).map_err(Discard::Layer3)?;
    if !local.is_unspecified() && inbound.source == local {
        return Err(Discard::OwnTraffic);
    }
    let len = inbound.payload.len();
    if !(HEADER_SIZE..=FRAME_MAX).contains(&len) {
        return Err(Discard::BadSize(len));
    }
    Ok(inbound)
}

struct Worker {
    inbox: Sender<Vec<u8>>,
    handle: JoinHandle<rawtp_core::Result<ConnectionStats>>,
}

pub struct Node {
    config: Arc<NodeConfig>,
    socket: Arc<Socket>,
    idents: Arc<IdentSource>,
    workers: HashMap<Ipv4Addr, Worker>,
}

impl Node {
    pub fn new(config: NodeConfig, socket: Socket) -> Self {
        Self {
            config: Arc::new(config),
            socket: Arc::new(socket),
            idents: Arc::new(IdentSource::new(12345)),
            workers: HashMap::new(),
        }
    }

    /// Read and route until the socket fails.
    pub fn run(mut self) -> io::Result<()> {
        let mut buf = vec![0u8; RECV_BUFFER];
        let mut discarded: u64 = 0;

        loop {
            self.reap();

            let len = match (&*self.socket).read(&mut buf) {
                Ok(len) => len,
                Err(e) if conduit::is_idle(&e) || e.kind() == io::ErrorKind::Interrupted => {
                    continue;
                }
                Err(e) => return Err(e),
            };

            match classify(&buf[..len], self.config.bind_addr) {
                Ok(inbound) => self.route(inbound),
                Err(Discard::OwnTraffic) => {}
                Err(reason) => {
                    discarded += 1;
                    if discarded <= 3 || discarded % 1000 == 0 {
                        warn!(%reason, discarded, "discarding datagram");
                    }
                }
            }
        }
    }

    fn route(&mut self, inbound: Inbound<'_>) {
        let source = inbound.source;
        let mut frame = inbound.payload.to_vec();

        if let Some(worker) = self.workers.get(&source) {
            match worker.inbox.try_send(frame) {
                Ok(()) => return,
                Err(TrySendError::Full(_)) => {
                    warn!(peer = %source, "peer queue full, dropping frame");
                    return;
                }
                // Worker already finished; a new exchange starts a new connection.
                Err(TrySendError::Disconnected(returned)) => frame = returned,
            }
            self.reap_one(source);
        }

        let worker = self.spawn_worker(source, inbound.destination);
        if worker.inbox.try_send(frame).is_err() {
            warn!(peer = %source, "new worker rejected its first frame");
        }
        self.workers.insert(source, worker);
    }

    fn spawn_worker(&self, peer: Ipv4Addr, local: Ipv4Addr) -> Worker {
        let (inbox, queue) = bounded(PEER_QUEUE);
        let local = if self.config.bind_addr.is_unspecified() {
            local
        } else {
            self.config.bind_addr
        };
        let conduit = RawConduit::new(
            self.socket.clone(),
            self.idents.clone(),
            local,
            peer,
            self.config.protocol,
            queue,
            self.config.poll_interval,
        );
        let config = self.config.clone();

        info!(%peer, workers = self.workers.len() + 1, "new peer");
        let handle = std::thread::spawn(move || {
            let conn = Connection::new(
                conduit,
                ConnectionConfig::default()
                    .with_peer(peer.to_string())
                    .with_timer(config.timer),
            );
            serve_peer(conn, config.welcome.as_bytes())
        });
        Worker { inbox, handle }
    }

    /// Join every worker that has finished and forget its route.
    fn reap(&mut self) {
        let finished: Vec<Ipv4Addr> = self
            .workers
            .iter()
            .filter(|(_, w)| w.handle.is_finished())
            .map(|(&peer, _)| peer)
            .collect();
        for peer in finished {
            self.reap_one(peer);
        }
    }

    fn reap_one(&mut self, peer: Ipv4Addr) {
        let Some(worker) = self.workers.remove(&peer) else {
            return;
        };
        drop(worker.inbox);
        match worker.handle.join() {
            Ok(Ok(stats)) => info!(%peer, ?stats, "peer finished"),
            Ok(Err(e)) => warn!(%peer, error = %e, "peer connection failed"),
            Err(_) => warn!(%peer, "peer worker panicked"),
        }
    }
}

/// Per-peer application: greet, echo every payload back, log urgent bytes.
fn serve_peer<C: rawtp_core::Conduit>(
    mut conn: Connection<C>,
    welcome: &[u8],
) -> rawtp_core::Result<ConnectionStats> {
    let welcome = &welcome[..welcome.len().min(PAYLOAD_SIZE)];
    conn.send(welcome)?;

    while !conn.is_closed() {
        conn.poll()?;
        while let Some(delivery) = conn.recv() {
            match delivery {
                Delivery::Urgent(byte) => {
                    info!("urgent byte {:#04x}", byte);
                }
                Delivery::Data(payload) => {
                    debug!(len = payload.len(), "echo");
                    match conn.send(&payload) {
                        Ok(_) => {}
                        // Peer closed while we still had data to echo.
                        Err(Error::Closed) => break,
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }
    Ok(conn.stats())
}
