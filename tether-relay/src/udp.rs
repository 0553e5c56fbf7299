use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::dispatcher::Inbound;
use crate::peer::{Peer, PeerId, UdpPeer};

/// Largest datagram we accept.
const MAX_DATAGRAM: usize = 64 * 1024;

pub async fn bind(addr: SocketAddr) -> anyhow::Result<Arc<UdpSocket>> {
    let socket = UdpSocket::bind(addr)
        .await
        .with_context(|| format!("binding udp listener on {addr}"))?;
    Ok(Arc::new(socket))
}

/// One datagram is one message. Replies go back out of the same socket.
pub async fn serve(socket: Arc<UdpSocket>, inbound: mpsc::Sender<Inbound>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                // ICMP unreachable from an earlier reply surfaces here on some
                // platforms; the socket itself is still usable.
                log::debug!("udp recv error: {}", e);
                continue;
            }
        };
        let peer = Peer::new(
            PeerId::Datagram(from),
            Arc::new(UdpPeer::new(socket.clone(), from)),
        );
        let item = Inbound::Frame {
            bytes: buf[..n].to_vec(),
            peer,
        };
        if inbound.send(item).await.is_err() {
            break;
        }
    }
}
