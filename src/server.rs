use crate::errinput;
use crate::error::Result;
use crate::raft::{Envelope, KvStore, Log, Message, Node, NodeID, BROADCAST};

use ::log::{debug, error, info};
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

/// How long the receive poll blocks when no datagrams are pending. This is
/// the event loop's only blocking primitive; everything else is in-memory
/// work.
const POLL_INTERVAL: Duration = Duration::from_micros(100);

/// The receive buffer size, matching the maximum UDP datagram size.
const RECV_BUFFER: usize = 65_535;

/// A toykv server: one replica of the cluster. Single-threaded; the Raft
/// node, the transport, and the outbound queues are all driven by serve().
pub struct Server {
    node: Node,
    transport: Transport,
    /// Client replies enqueued by the node. Kept separate from peer traffic
    /// so role transitions can never reorder client acks relative to the
    /// operations that produced them.
    client_rx: crossbeam::channel::Receiver<Envelope>,
    /// Peer messages enqueued by the node.
    peer_rx: crossbeam::channel::Receiver<Envelope>,
}

impl Server {
    /// Creates a new server for the given replica id, connecting to the
    /// cluster's shared endpoint on the given local port.
    pub fn new(id: NodeID, peers: HashSet<NodeID>, port: u16) -> Result<Self> {
        if id == BROADCAST || peers.contains(BROADCAST) {
            return errinput!("replica id {BROADCAST} is reserved for broadcast");
        }
        let (client_tx, client_rx) = crossbeam::channel::unbounded();
        let (peer_tx, peer_rx) = crossbeam::channel::unbounded();
        let transport = Transport::new(port)?;
        info!("Replica {id} starting with peers {peers:?} on port {port}");
        let node = Node::new(
            id,
            peers,
            Log::new(),
            Box::new(KvStore::new()),
            client_tx,
            peer_tx,
            Instant::now(),
        )?;
        Ok(Self { node, transport, client_rx, peer_rx })
    }

    /// Serves requests indefinitely. Each iteration drains the two outbound
    /// queues (client replies first), moves the node's time forward (leader
    /// sends, election timers, backlogged requests), then receives and
    /// dispatches all pending datagrams.
    pub fn serve(mut self) -> Result<()> {
        self.transport.send(&Envelope {
            src: self.node.id().clone(),
            dst: BROADCAST.into(),
            leader: BROADCAST.into(),
            message: Message::Hello,
        });
        loop {
            while let Ok(msg) = self.client_rx.try_recv() {
                self.transport.send(&msg);
            }
            while let Ok(msg) = self.peer_rx.try_recv() {
                self.transport.send(&msg);
            }
            self.node = self.node.tick(Instant::now())?;
            while let Some(msg) = self.transport.try_recv() {
                self.node = self.node.step(Instant::now(), msg)?;
            }
        }
    }
}

/// The datagram transport. All replicas, clients, and the controller share a
/// single well-known localhost endpoint which routes datagrams by their dst
/// field; each replica binds an ephemeral port of its own and addresses
/// everything to the shared endpoint.
pub struct Transport {
    socket: UdpSocket,
    endpoint: SocketAddr,
}

impl Transport {
    /// Binds an ephemeral local socket talking to the shared endpoint on
    /// the given port. Binding is the only fatal startup error.
    pub fn new(port: u16) -> Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))?;
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        Ok(Self { socket, endpoint: (Ipv4Addr::LOCALHOST, port).into() })
    }

    /// Sends a message as a single datagram. Failures are dropped as
    /// message loss; Raft tolerates it and the sender retries.
    pub fn send(&self, msg: &Envelope) {
        let bytes = match msg.encode() {
            Ok(bytes) => bytes,
            Err(err) => return error!("Failed to encode {msg:?}: {err}"),
        };
        if let Err(err) = self.socket.send_to(&bytes, self.endpoint) {
            debug!("Dropped outbound message to {}: {err}", msg.dst);
        }
    }

    /// Receives a single pending datagram, or None if none arrives within
    /// the poll interval. Undecodable datagrams are dropped.
    pub fn try_recv(&self) -> Option<Envelope> {
        let mut buffer = vec![0u8; RECV_BUFFER];
        match self.socket.recv(&mut buffer) {
            Ok(len) => match Envelope::decode(&buffer[..len]) {
                Ok(msg) => Some(msg),
                Err(err) => {
                    debug!("Dropped malformed datagram: {err}");
                    None
                }
            },
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                None
            }
            Err(err) => {
                debug!("Dropped inbound datagram: {err}");
                None
            }
        }
    }
}
