use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use tether_proto::{encode_line, LineDecoder};

use crate::dispatcher::Inbound;
use crate::peer::{stopped, ChannelPeer, Outbound, Peer, PeerId, CHANNEL_BUFFER_SIZE};

pub async fn bind(addr: SocketAddr) -> anyhow::Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding tcp listener on {addr}"))
}

pub async fn serve(
    listener: TcpListener,
    inbound: mpsc::Sender<Inbound>,
    shutdown: watch::Receiver<bool>,
) {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(r) => r,
            Err(e) => {
                log::warn!("tcp accept failed: {}", e);
                continue;
            }
        };
        stream.set_nodelay(true).ok();
        tokio::spawn(connection(
            stream,
            remote,
            inbound.clone(),
            shutdown.clone(),
        ));
    }
}

/// Newline-delimited messages in both directions. The connection's end is
/// reported to the dispatcher so its devices are dropped. Relay shutdown
/// ends the connection.
async fn connection(
    stream: TcpStream,
    remote: SocketAddr,
    inbound: mpsc::Sender<Inbound>,
    mut shutdown: watch::Receiver<bool>,
) {
    let peer_id = PeerId::next_stream();
    log::debug!("tcp connection {} from {}", peer_id, remote);

    let (mut read_half, mut write_half) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(CHANNEL_BUFFER_SIZE);
    let peer = Peer::new(peer_id, Arc::new(ChannelPeer::new(out_tx)));

    let writer = tokio::spawn(async move {
        while let Some(out) = out_rx.recv().await {
            match out {
                Outbound::Frame(frame) => {
                    if write_half.write_all(&encode_line(&frame)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = write_half.shutdown().await;
                    break;
                }
            }
        }
    });

    let mut decoder = LineDecoder::new();
    let mut buf = [0u8; 16 * 1024];
    'read: loop {
        let n = tokio::select! {
            read = read_half.read(&mut buf) => match read {
                Ok(0) => break 'read,
                Ok(n) => n,
                Err(e) => {
                    log::debug!("tcp read error on {}: {}", peer_id, e);
                    break 'read;
                }
            },
            _ = stopped(&mut shutdown) => {
                log::debug!("relay shutting down, dropping {}", peer_id);
                break 'read;
            }
        };
        decoder.push(&buf[..n]);
        loop {
            match decoder.next_line() {
                Ok(Some(line)) => {
                    let item = Inbound::Frame {
                        bytes: line,
                        peer: peer.clone(),
                    };
                    if inbound.send(item).await.is_err() {
                        break 'read;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    log::warn!("closing {}: {}", peer_id, e);
                    break 'read;
                }
            }
        }
    }

    let _ = inbound.send(Inbound::Closed(peer_id)).await;
    writer.abort();
    log::debug!("tcp connection {} closed", peer_id);
}
