use std::net::SocketAddr;

use anyhow::Context;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::config::RelayConfig;
use crate::dispatcher::{Relay, RelayEvent, RelayHandle};
use crate::peer::stopped;
use crate::{tcp, udp, ws};

/// A running relay: the dispatcher plus every configured listener.
pub struct RelayServer {
    handle: RelayHandle,
    events: broadcast::Sender<RelayEvent>,
    udp_addr: Option<SocketAddr>,
    tcp_addr: Option<SocketAddr>,
    ws_addr: Option<SocketAddr>,
    listeners: Vec<JoinHandle<()>>,
    /// Flipped to true on close; every stream connection watches it.
    shutdown: watch::Sender<bool>,
    dispatcher: JoinHandle<()>,
}

impl RelayServer {
    pub async fn bind(config: RelayConfig) -> anyhow::Result<Self> {
        let relay = Relay::new(config.policy());
        let events = relay.event_sender();
        let (handle, dispatcher) = RelayHandle::spawn(relay);

        let mut server = Self {
            handle,
            events,
            udp_addr: None,
            tcp_addr: None,
            ws_addr: None,
            listeners: Vec::new(),
            shutdown: watch::channel(false).0,
            dispatcher,
        };

        if let Some(addr) = config.udp_listen {
            let socket = udp::bind(addr).await?;
            let local = socket.local_addr().context("udp local_addr")?;
            log::info!("tether-relay udp listening on {}", local);
            server.udp_addr = Some(local);
            server
                .listeners
                .push(tokio::spawn(udp::serve(socket, server.handle.inbound())));
        }

        if let Some(addr) = config.tcp_listen {
            let listener = tcp::bind(addr).await?;
            let local = listener.local_addr().context("tcp local_addr")?;
            log::info!("tether-relay tcp listening on {}", local);
            server.tcp_addr = Some(local);
            server
                .listeners
                .push(tokio::spawn(tcp::serve(
                listener,
                server.handle.inbound(),
                server.shutdown.subscribe(),
            )));
        }

        if let Some(addr) = config.ws_listen {
            let routes = ws::routes(server.handle.inbound(), server.shutdown.subscribe());
            let mut stop = server.shutdown.subscribe();
            let (local, serving) = warp::serve(routes)
                .try_bind_with_graceful_shutdown(addr, async move {
                    stopped(&mut stop).await;
                })
                .with_context(|| format!("binding websocket listener on {addr}"))?;
            log::info!("tether-relay websocket listening on {}", local);
            server.ws_addr = Some(local);
            server.listeners.push(tokio::spawn(serving));
        }

        Ok(server)
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp_addr
    }

    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp_addr
    }

    pub fn ws_addr(&self) -> Option<SocketAddr> {
        self.ws_addr
    }

    pub fn handle(&self) -> RelayHandle {
        self.handle.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    /// Stop every listener, drop every stream connection and stop the
    /// dispatcher. Devices get no message; UDP devices find out through
    /// failed pings.
    pub async fn close(mut self) -> anyhow::Result<()> {
        self.shutdown.send_replace(true);
        for listener in self.listeners.drain(..) {
            listener.abort();
        }
        self.handle.shutdown().await;
        self.dispatcher.await.context("relay dispatcher panicked")?;
        log::info!("tether-relay closed");
        Ok(())
    }
}
