//! The relay's single owner of device state.
//!
//! Listeners decode nothing and mutate nothing: they push raw frames onto
//! the inbound queue and the [`Relay`] actor processes them one at a time,
//! which gives a total order over registry and sticky-cache mutations.

use std::ops::ControlFlow;
use std::sync::Arc;

use anyhow::anyhow;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};

use tether_proto::{
    decode_with, encode_with, Channel, DeviceType, ErrorCode, Message, MessageKind, PayloadCodec,
    Plain, RegisterData, Registration, Uid,
};

use crate::peer::{Peer, PeerId, CHANNEL_BUFFER_SIZE};
use crate::registry::{DeviceRegistry, RegistryPolicy};
use crate::sticky::StickyCache;

const EVENT_BUFFER_SIZE: usize = 256;

pub enum Inbound {
    /// One undecoded message and the transport it arrived on.
    Frame { bytes: Vec<u8>, peer: Peer },
    /// A stream transport went away.
    Closed(PeerId),
    Control(Control),
}

pub enum Control {
    GetAll {
        device_type: DeviceType,
        channel: Channel,
        reply: oneshot::Sender<Vec<Uid>>,
    },
    Get {
        uid: Uid,
        reply: oneshot::Sender<Option<DeviceInfo>>,
    },
    /// Drop a device as if the relay had crashed and lost it.
    Forget {
        uid: Uid,
        reply: oneshot::Sender<bool>,
    },
    Shutdown,
}

/// Snapshot of one registry record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub uid: Uid,
    pub device_type: DeviceType,
    pub channel: Channel,
    pub last_seq: u64,
    pub peer_id: PeerId,
}

/// Accepted traffic, published for embedding applications.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    Registered {
        uid: Uid,
        device_type: DeviceType,
        channel: Channel,
    },
    Ping {
        uid: Uid,
        seq: u64,
    },
    Status {
        uid: Uid,
        channel: Channel,
        seq: u64,
        data: Value,
        recipients: usize,
    },
    Command {
        uid: Uid,
        channel: Channel,
        seq: u64,
        data: Value,
        recipients: usize,
    },
    Disconnected {
        uid: Uid,
    },
}

/// Roles that receive a forwarded message of `kind`.
fn recipients(kind: MessageKind) -> &'static [DeviceType] {
    match kind {
        MessageKind::Status => &[DeviceType::Controller, DeviceType::Observer],
        MessageKind::Command => &[DeviceType::Toy],
        _ => &[],
    }
}

pub struct Relay {
    registry: DeviceRegistry,
    sticky: StickyCache,
    codec: Arc<dyn PayloadCodec>,
    events: broadcast::Sender<RelayEvent>,
}

impl Relay {
    pub fn new(policy: RegistryPolicy) -> Self {
        Self::with_codec(policy, Arc::new(Plain))
    }

    pub fn with_codec(policy: RegistryPolicy, codec: Arc<dyn PayloadCodec>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        Self {
            registry: DeviceRegistry::new(policy),
            sticky: StickyCache::new(),
            codec,
            events,
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    pub fn event_sender(&self) -> broadcast::Sender<RelayEvent> {
        self.events.clone()
    }

    /// Consume the inbound queue until shutdown or until every sender is gone.
    pub async fn run(mut self, mut inbound: mpsc::Receiver<Inbound>) {
        while let Some(item) = inbound.recv().await {
            if self.handle(item).is_break() {
                break;
            }
        }
        self.registry.clear();
        self.sticky.clear();
        log::info!("relay dispatcher stopped");
    }

    pub fn handle(&mut self, item: Inbound) -> ControlFlow<()> {
        match item {
            Inbound::Frame { bytes, peer } => self.handle_frame(&bytes, peer),
            Inbound::Closed(peer_id) => {
                for uid in self.registry.remove_by_peer_id(peer_id) {
                    log::info!("uid={} disconnected ({})", uid, peer_id);
                    self.publish(RelayEvent::Disconnected { uid });
                }
            }
            Inbound::Control(control) => return self.handle_control(control),
        }
        ControlFlow::Continue(())
    }

    fn handle_control(&mut self, control: Control) -> ControlFlow<()> {
        match control {
            Control::GetAll {
                device_type,
                channel,
                reply,
            } => {
                let _ = reply.send(self.registry.get_all(device_type, &channel));
            }
            Control::Get { uid, reply } => {
                let info = self.registry.get(&uid).map(|d| DeviceInfo {
                    uid: d.uid.clone(),
                    device_type: d.device_type,
                    channel: d.channel.clone(),
                    last_seq: d.last_seq,
                    peer_id: d.peer.id(),
                });
                let _ = reply.send(info);
            }
            Control::Forget { uid, reply } => {
                let removed = self.registry.remove(&uid);
                if removed {
                    log::info!("forgot uid={}", uid);
                }
                let _ = reply.send(removed);
            }
            Control::Shutdown => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    pub fn handle_frame(&mut self, bytes: &[u8], peer: Peer) {
        match decode_with(&*self.codec, bytes) {
            Ok(Some(msg)) => self.dispatch(msg, peer),
            Ok(None) => {}
            Err(e) => log::warn!("dropping invalid message from {}: {}", peer.id(), e),
        }
    }

    pub fn dispatch(&mut self, msg: Message, peer: Peer) {
        match msg {
            Message::Register {
                seq,
                data: RegisterData::Request(registration),
            } => self.register(seq, registration, peer),
            Message::Register {
                data: RegisterData::Ack(_),
                ..
            } => log::warn!("dropping register ack sent by {}", peer.id()),
            Message::Ping { seq, ref uid, .. } => {
                let uid = uid.clone();
                if self.registry.update(&uid, peer.clone(), seq).is_none() {
                    self.reply_error(&peer, seq, uid, ErrorCode::DeviceNotRegistered);
                    return;
                }
                self.send_to(&peer, &msg);
                self.publish(RelayEvent::Ping { uid, seq });
            }
            Message::Status { .. } | Message::Command { .. } => self.forward(msg, peer),
            Message::Error { seq, uid, data } => {
                log::debug!("ignoring error {} seq={} from uid={}", data, seq, uid)
            }
        }
    }

    fn register(&mut self, seq: u64, registration: Registration, peer: Peer) {
        let Registration {
            device_type,
            channel,
        } = registration;
        let uid = match self
            .registry
            .add(device_type, channel.clone(), peer.clone(), seq)
        {
            Ok(uid) => uid,
            Err(e) => {
                log::warn!(
                    "rejecting {} registration on channel={} from {}: {}",
                    device_type,
                    channel,
                    peer.id(),
                    e
                );
                return;
            }
        };
        log::info!(
            "registered {} uid={} channel={} ({})",
            device_type,
            uid,
            channel,
            peer.id()
        );

        self.send_to(
            &peer,
            &Message::register_ack(seq, channel.clone(), uid.clone()),
        );
        if let Some(replay) = self.sticky.get(&channel, device_type, uid.clone()) {
            self.send_to(&peer, &replay);
        }
        self.publish(RelayEvent::Registered {
            uid,
            device_type,
            channel,
        });
    }

    fn forward(&mut self, msg: Message, peer: Peer) {
        let kind = msg.kind();
        let seq = msg.seq();
        let Some(uid) = msg.uid().cloned() else {
            return;
        };

        if self.registry.get(&uid).is_none() {
            self.reply_error(&peer, seq, uid, ErrorCode::DeviceNotRegistered);
            return;
        }
        if !self.registry.is_allowed_action(&uid, kind) {
            log::warn!("uid={} may not send {}", uid, kind);
            self.reply_error(&peer, seq, uid, ErrorCode::PermissionDenied);
            return;
        }
        if !self.registry.is_latest_seq(&uid, seq) {
            log::debug!("dropping stale {} seq={} from uid={}", kind, seq, uid);
            return;
        }

        let Some(record) = self.registry.update(&uid, peer, seq) else {
            return;
        };
        let channel = record.channel.clone();
        if self.sticky.set(&channel, &msg) {
            log::debug!("retained sticky {} seq={} on channel={}", kind, seq, channel);
        }

        let mut delivered = 0;
        for role in recipients(kind) {
            for target in self.registry.get_all(*role, &channel) {
                let Some(target_peer) = self.registry.get_peer(&target) else {
                    continue;
                };
                let copy = msg.readdressed(target.clone());
                if let Err(e) = target_peer.send(encode_with(&*self.codec, &copy)) {
                    log::warn!("failed to forward {} to uid={}: {:#}", kind, target, e);
                    continue;
                }
                delivered += 1;
            }
        }

        let data = match msg {
            Message::Status { data, .. } | Message::Command { data, .. } => data,
            _ => return,
        };
        self.publish(match kind {
            MessageKind::Status => RelayEvent::Status {
                uid,
                channel,
                seq,
                data,
                recipients: delivered,
            },
            _ => RelayEvent::Command {
                uid,
                channel,
                seq,
                data,
                recipients: delivered,
            },
        });
    }

    fn reply_error(&self, peer: &Peer, seq: u64, uid: Uid, code: ErrorCode) {
        log::debug!("sending error {} to uid={} ({})", code, uid, peer.id());
        self.send_to(peer, &Message::error(seq, uid, code));
    }

    fn send_to(&self, peer: &Peer, msg: &Message) {
        if let Err(e) = peer.send(encode_with(&*self.codec, msg)) {
            log::warn!("failed to send {} to {}: {:#}", msg.kind(), peer.id(), e);
        }
    }

    fn publish(&self, event: RelayEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Cloneable front door to a running [`Relay`].
#[derive(Clone)]
pub struct RelayHandle {
    inbound: mpsc::Sender<Inbound>,
}

impl RelayHandle {
    /// Spawn `relay` on the current runtime.
    pub fn spawn(relay: Relay) -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let task = tokio::spawn(relay.run(rx));
        (Self { inbound: tx }, task)
    }

    pub fn inbound(&self) -> mpsc::Sender<Inbound> {
        self.inbound.clone()
    }

    pub async fn get_all(
        &self,
        device_type: DeviceType,
        channel: Channel,
    ) -> anyhow::Result<Vec<Uid>> {
        self.request(|reply| Control::GetAll {
            device_type,
            channel,
            reply,
        })
        .await
    }

    pub async fn get(&self, uid: Uid) -> anyhow::Result<Option<DeviceInfo>> {
        self.request(|reply| Control::Get { uid, reply }).await
    }

    pub async fn forget(&self, uid: Uid) -> anyhow::Result<bool> {
        self.request(|reply| Control::Forget { uid, reply }).await
    }

    pub async fn shutdown(&self) {
        let _ = self.inbound.send(Inbound::Control(Control::Shutdown)).await;
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Control,
    ) -> anyhow::Result<T> {
        let (tx, rx) = oneshot::channel();
        self.inbound
            .send(Inbound::Control(make(tx)))
            .await
            .map_err(|_| anyhow!("relay dispatcher is not running"))?;
        rx.await
            .map_err(|_| anyhow!("relay dispatcher stopped before replying"))
    }
}
