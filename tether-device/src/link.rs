//! A connected transport reduced to two queues of whole message frames.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

use tether_proto::{encode_line, LineDecoder};

use crate::config::TransportKind;

const CHANNEL_BUFFER_SIZE: usize = 256;
const MAX_DATAGRAM: usize = 64 * 1024;
/// How long [`Link::close`] waits for queued frames to go out.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

pub struct Link {
    outbound: Option<mpsc::Sender<Vec<u8>>>,
    inbound: mpsc::Receiver<Vec<u8>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Link {
    pub async fn connect(kind: &TransportKind) -> Result<Self> {
        match kind {
            TransportKind::Udp { host, port } => Self::udp(host, *port).await,
            TransportKind::Tcp { host, port } => Self::tcp(host, *port).await,
            TransportKind::WebSocket(url) => Self::websocket(url).await,
        }
    }

    /// Queue one frame. Fails once the transport is gone.
    pub async fn send(&self, frame: Vec<u8>) -> Result<()> {
        let tx = self
            .outbound
            .as_ref()
            .ok_or_else(|| anyhow!("link is closed"))?;
        tx.send(frame)
            .await
            .map_err(|_| anyhow!("transport writer stopped"))
    }

    /// The next received frame; `None` once the transport is closed.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.inbound.recv().await
    }

    /// Flush queued frames, then shut the transport down.
    pub async fn close(mut self) {
        self.outbound.take();
        if tokio::time::timeout(FLUSH_TIMEOUT, &mut self.writer)
            .await
            .is_err()
        {
            warn!("gave up flushing link after {:?}", FLUSH_TIMEOUT);
        }
        self.reader.abort();
    }

    async fn udp(host: &str, port: u16) -> Result<Self> {
        let target = resolve(host, port).await?;
        let local: SocketAddr = if target.is_ipv4() {
            ([0u8; 4], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(local).await.context("bind udp socket")?;
        socket
            .connect(target)
            .await
            .with_context(|| format!("connect udp socket to {target}"))?;
        info!("udp link to {}", target);

        let socket = std::sync::Arc::new(socket);
        let (in_tx, in_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_BUFFER_SIZE);

        let recv_socket = socket.clone();
        let reader = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                match recv_socket.recv(&mut buf).await {
                    Ok(n) => {
                        if in_tx.send(buf[..n].to_vec()).await.is_err() {
                            break;
                        }
                    }
                    // Refused while the relay is down; keep listening.
                    Err(e) => debug!("udp recv error: {}", e),
                }
            }
        });

        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = socket.send(&frame).await {
                    warn!("udp send failed: {}", e);
                }
            }
        });

        Ok(Self {
            outbound: Some(out_tx),
            inbound: in_rx,
            reader,
            writer,
        })
    }

    async fn tcp(host: &str, port: u16) -> Result<Self> {
        let target = resolve(host, port).await?;
        let stream = TcpStream::connect(target)
            .await
            .with_context(|| format!("connect tcp to {target}"))?;
        stream.set_nodelay(true).ok();
        info!("tcp link to {}", target);

        let (mut read_half, mut write_half) = stream.into_split();
        let (in_tx, in_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_BUFFER_SIZE);

        let reader = tokio::spawn(async move {
            let mut decoder = LineDecoder::new();
            let mut buf = [0u8; 16 * 1024];
            'read: loop {
                let n = match read_half.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        debug!("tcp read error: {}", e);
                        break;
                    }
                };
                decoder.push(&buf[..n]);
                loop {
                    match decoder.next_line() {
                        Ok(Some(line)) => {
                            if in_tx.send(line).await.is_err() {
                                break 'read;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!("dropping tcp link: {}", e);
                            break 'read;
                        }
                    }
                }
            }
            debug!("tcp link closed by relay");
        });

        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if write_half.write_all(&encode_line(&frame)).await.is_err() {
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        });

        Ok(Self {
            outbound: Some(out_tx),
            inbound: in_rx,
            reader,
            writer,
        })
    }

    async fn websocket(url: &url::Url) -> Result<Self> {
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("connect websocket to {url}"))?;
        info!("websocket link to {}", url);

        let (mut write, mut read) = ws_stream.split();
        let (in_tx, in_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_BUFFER_SIZE);

        let reader = tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                let frame = match msg {
                    Ok(Message::Text(text)) => text.into_bytes(),
                    Ok(Message::Binary(data)) => data,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        debug!("websocket error: {}", e);
                        break;
                    }
                };
                if in_tx.send(frame).await.is_err() {
                    break;
                }
            }
            debug!("websocket link closed by relay");
        });

        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let msg = match String::from_utf8(frame) {
                    Ok(text) => Message::Text(text),
                    Err(e) => Message::Binary(e.into_bytes()),
                };
                if write.send(msg).await.is_err() {
                    break;
                }
            }
            let _ = write.close().await;
        });

        Ok(Self {
            outbound: Some(out_tx),
            inbound: in_rx,
            reader,
            writer,
        })
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// First address for `host`, preferring IPv4.
async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = lookup_host((host, port))
        .await
        .with_context(|| format!("resolve {host}:{port}"))?
        .collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| anyhow!("{host}:{port} resolved to no addresses"))
}
