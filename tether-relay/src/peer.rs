use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};

/// Channel buffer size for per-connection writer tasks.
pub const CHANNEL_BUFFER_SIZE: usize = 1024;

/// Resolves once the relay starts shutting down. Never resolves if the
/// sender is dropped without signalling.
pub async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Stable identity of the transport a device was last heard on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerId {
    /// UDP source address.
    Datagram(SocketAddr),
    /// One accepted TCP or WebSocket connection.
    Stream(u64),
}

impl PeerId {
    pub fn next_stream() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        PeerId::Stream(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerId::Datagram(addr) => write!(f, "udp:{addr}"),
            PeerId::Stream(id) => write!(f, "conn:{id}"),
        }
    }
}

/// Outbound half of a transport. Sends are fire-and-forget: failures are
/// reported to the caller for logging and never retried.
pub trait PeerSink: Send + Sync {
    fn send(&self, frame: Vec<u8>) -> anyhow::Result<()>;

    /// Best-effort close; closing an already-closed sink is not an error.
    fn close(&self);
}

#[derive(Clone)]
pub struct Peer {
    id: PeerId,
    sink: Arc<dyn PeerSink>,
}

impl Peer {
    pub fn new(id: PeerId, sink: Arc<dyn PeerSink>) -> Self {
        Self { id, sink }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn send(&self, frame: Vec<u8>) -> anyhow::Result<()> {
        self.sink.send(frame)
    }

    pub fn close(&self) {
        self.sink.close()
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Peer").field(&self.id).finish()
    }
}

/// Replies on the shared UDP socket to the datagram's source address.
pub struct UdpPeer {
    socket: Arc<UdpSocket>,
    addr: SocketAddr,
}

impl UdpPeer {
    pub fn new(socket: Arc<UdpSocket>, addr: SocketAddr) -> Self {
        Self { socket, addr }
    }
}

impl PeerSink for UdpPeer {
    fn send(&self, frame: Vec<u8>) -> anyhow::Result<()> {
        self.socket.try_send_to(&frame, self.addr)?;
        Ok(())
    }

    fn close(&self) {}
}

#[derive(Debug)]
pub enum Outbound {
    Frame(Vec<u8>),
    Close,
}

/// Hands frames to a connection's writer task.
pub struct ChannelPeer {
    tx: mpsc::Sender<Outbound>,
}

impl ChannelPeer {
    pub fn new(tx: mpsc::Sender<Outbound>) -> Self {
        Self { tx }
    }
}

impl PeerSink for ChannelPeer {
    fn send(&self, frame: Vec<u8>) -> anyhow::Result<()> {
        self.tx
            .try_send(Outbound::Frame(frame))
            .map_err(|e| anyhow!("connection writer unavailable: {e}"))
    }

    fn close(&self) {
        let _ = self.tx.try_send(Outbound::Close);
    }
}
