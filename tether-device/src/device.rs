use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use tether_proto::{decode_with, encode_with, DeviceType, MessageKind, PayloadCodec, Plain, Uid};

use crate::config::DeviceConfig;
use crate::link::Link;
use crate::session::{DeviceEvent, Session, SessionError};

const REQUEST_BUFFER_SIZE: usize = 64;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("device has shut down")]
    Closed,
}

enum Request {
    Send {
        kind: MessageKind,
        data: Value,
        sticky: bool,
        reply: oneshot::Sender<Result<u64, SessionError>>,
    },
    Ping {
        reply: oneshot::Sender<Option<Duration>>,
    },
    Close,
}

/// A toy, controller or observer connected to a relay.
///
/// One background task owns the session and the transport; this handle
/// talks to it over channels.
pub struct Device {
    device_type: DeviceType,
    requests: mpsc::Sender<Request>,
    events: mpsc::UnboundedReceiver<DeviceEvent>,
    uid: watch::Receiver<Option<Uid>>,
    task: JoinHandle<()>,
}

impl Device {
    /// Connect the configured transport and start registering.
    pub async fn connect(config: DeviceConfig) -> anyhow::Result<Self> {
        let transport = config.transport()?;
        let link = Link::connect(&transport).await?;
        Ok(Self::spawn(config, link, Arc::new(Plain)))
    }

    pub fn spawn(config: DeviceConfig, link: Link, codec: Arc<dyn PayloadCodec>) -> Self {
        let settings = config.session_settings();
        let device_type = settings.device_type;
        let (req_tx, req_rx) = mpsc::channel(REQUEST_BUFFER_SIZE);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (uid_tx, uid_rx) = watch::channel(None);

        let runner = Runner {
            session: Session::new(settings),
            link,
            codec,
            requests: req_rx,
            events: event_tx,
            uid: uid_tx,
        };
        Self {
            device_type,
            requests: req_tx,
            events: event_rx,
            uid: uid_rx,
            task: tokio::spawn(runner.run()),
        }
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    pub fn uid(&self) -> Option<Uid> {
        self.uid.borrow().clone()
    }

    /// Wait until the relay has acknowledged a registration.
    pub async fn wait_registered(&mut self) -> Result<Uid, DeviceError> {
        let uid = self
            .uid
            .wait_for(Option::is_some)
            .await
            .map_err(|_| DeviceError::Closed)?;
        uid.clone().ok_or(DeviceError::Closed)
    }

    pub async fn next_event(&mut self) -> Option<DeviceEvent> {
        self.events.recv().await
    }

    pub async fn status(&self, data: Value) -> Result<u64, DeviceError> {
        self.send(MessageKind::Status, data, false).await
    }

    pub async fn sticky_status(&self, data: Value) -> Result<u64, DeviceError> {
        self.send(MessageKind::Status, data, true).await
    }

    pub async fn command(&self, data: Value) -> Result<u64, DeviceError> {
        self.send(MessageKind::Command, data, false).await
    }

    pub async fn sticky_command(&self, data: Value) -> Result<u64, DeviceError> {
        self.send(MessageKind::Command, data, true).await
    }

    /// Round-trip time to the relay, or `None` if unregistered or timed out.
    pub async fn ping(&self) -> Option<Duration> {
        let (reply, rx) = oneshot::channel();
        self.requests.send(Request::Ping { reply }).await.ok()?;
        rx.await.ok().flatten()
    }

    /// Stop timers, fail pending pings and close the transport.
    pub async fn close(self) {
        let _ = self.requests.send(Request::Close).await;
        let _ = self.task.await;
    }

    async fn send(&self, kind: MessageKind, data: Value, sticky: bool) -> Result<u64, DeviceError> {
        if !self.device_type.may_send(kind) {
            return Err(SessionError::RoleMismatch {
                device_type: self.device_type,
                kind,
            }
            .into());
        }
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(Request::Send {
                kind,
                data,
                sticky,
                reply,
            })
            .await
            .map_err(|_| DeviceError::Closed)?;
        Ok(rx.await.map_err(|_| DeviceError::Closed)??)
    }
}

struct Runner {
    session: Session,
    link: Link,
    codec: Arc<dyn PayloadCodec>,
    requests: mpsc::Receiver<Request>,
    events: mpsc::UnboundedSender<DeviceEvent>,
    uid: watch::Sender<Option<Uid>>,
}

impl Runner {
    async fn run(mut self) {
        self.session.start(Instant::now());

        loop {
            if let Err(e) = self.flush().await {
                log::warn!("device link failed: {:#}", e);
                break;
            }

            let deadline = self.session.poll_deadline();
            tokio::select! {
                frame = self.link.recv() => match frame {
                    Some(bytes) => self.receive(&bytes),
                    None => {
                        log::warn!("relay link closed");
                        break;
                    }
                },
                request = self.requests.recv() => match request {
                    Some(Request::Send { kind, data, sticky, reply }) => {
                        let result = match kind {
                            MessageKind::Status => self.session.send_status(data, sticky),
                            _ => self.session.send_command(data, sticky),
                        };
                        let _ = reply.send(result);
                    }
                    Some(Request::Ping { reply }) => {
                        let callback = Box::new(move |rtt: Option<Duration>| {
                            let _ = reply.send(rtt);
                        });
                        if let Err(e) = self.session.ping(Instant::now(), callback) {
                            log::error!("ping failed: {}", e);
                        }
                    }
                    Some(Request::Close) | None => break,
                },
                _ = async {
                    match deadline {
                        Some(at) => sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                } => self.session.handle_timeout(Instant::now()),
            }
        }

        self.session.close();
        self.uid.send_replace(None);
        let _ = self.flush().await;
        self.link.close().await;
    }

    fn receive(&mut self, bytes: &[u8]) {
        match decode_with(&*self.codec, bytes) {
            Ok(Some(msg)) => self.session.handle_message(msg, Instant::now()),
            Ok(None) => {}
            Err(e) => log::warn!("dropping invalid message from relay: {}", e),
        }
    }

    /// Push out queued messages and publish state changes.
    async fn flush(&mut self) -> anyhow::Result<()> {
        while let Some(msg) = self.session.poll_transmit() {
            self.link.send(encode_with(&*self.codec, &msg)).await?;
        }
        let uid = self.session.uid().cloned();
        self.uid.send_if_modified(|current| {
            if *current != uid {
                *current = uid;
                true
            } else {
                false
            }
        });
        while let Some(event) = self.session.poll_event() {
            let _ = self.events.send(event);
        }
        Ok(())
    }
}
