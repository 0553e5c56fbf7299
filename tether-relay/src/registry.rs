use std::collections::HashMap;

use thiserror::Error;
use uuid::Uuid;

use tether_proto::{Channel, DeviceType, MessageKind, Uid};

use crate::peer::{Peer, PeerId};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("observers are not allowed on this relay")]
    ObserversDisabled,
    #[error("channel must not be empty")]
    EmptyChannel,
}

/// Which roles the relay accepts and how many of each per channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryPolicy {
    pub only_one_controller_per_channel: bool,
    pub only_one_toy_per_channel: bool,
    pub allow_observers: bool,
}

impl RegistryPolicy {
    fn exclusive(&self, device_type: DeviceType) -> bool {
        match device_type {
            DeviceType::Controller => self.only_one_controller_per_channel,
            DeviceType::Toy => self.only_one_toy_per_channel,
            DeviceType::Observer => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub uid: Uid,
    pub device_type: DeviceType,
    pub channel: Channel,
    pub peer: Peer,
    /// Highest sequence number accepted from this device.
    pub last_seq: u64,
}

/// Every registered device, keyed by the uid the relay assigned to it.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    policy: RegistryPolicy,
    devices: HashMap<Uid, DeviceRecord>,
}

impl DeviceRegistry {
    pub fn new(policy: RegistryPolicy) -> Self {
        Self {
            policy,
            devices: HashMap::new(),
        }
    }

    pub fn policy(&self) -> RegistryPolicy {
        self.policy
    }

    /// Register a device and return its fresh uid.
    ///
    /// A record already owned by the same transport is replaced (a device
    /// that re-registers keeps one record). When the role is limited to one
    /// per channel, the current holder is evicted and its transport closed.
    pub fn add(
        &mut self,
        device_type: DeviceType,
        channel: Channel,
        peer: Peer,
        seq: u64,
    ) -> Result<Uid, RegistryError> {
        if device_type == DeviceType::Observer && !self.policy.allow_observers {
            return Err(RegistryError::ObserversDisabled);
        }
        if channel.as_str().is_empty() {
            return Err(RegistryError::EmptyChannel);
        }

        let same_peer: Vec<Uid> = self
            .devices
            .values()
            .filter(|d| d.peer.id() == peer.id())
            .map(|d| d.uid.clone())
            .collect();
        for uid in same_peer {
            log::debug!("replacing uid={} after re-register from {}", uid, peer.id());
            self.devices.remove(&uid);
        }

        if self.policy.exclusive(device_type) {
            for uid in self.get_all(device_type, &channel) {
                log::info!(
                    "evicting {} uid={} from channel={}",
                    device_type,
                    uid,
                    channel
                );
                self.remove(&uid);
            }
        }

        let uid = loop {
            let candidate = Uid::new(Uuid::new_v4().to_string());
            if !self.devices.contains_key(&candidate) {
                break candidate;
            }
        };

        self.devices.insert(
            uid.clone(),
            DeviceRecord {
                uid: uid.clone(),
                device_type,
                channel,
                peer,
                last_seq: seq,
            },
        );
        Ok(uid)
    }

    /// Close the device's transport and forget it. False if `uid` is unknown.
    pub fn remove(&mut self, uid: &Uid) -> bool {
        match self.devices.remove(uid) {
            Some(record) => {
                record.peer.close();
                true
            }
            None => false,
        }
    }

    /// Forget every device last heard on `peer_id`. The transport is already
    /// gone, so nothing is closed.
    pub fn remove_by_peer_id(&mut self, peer_id: PeerId) -> Vec<Uid> {
        let uids: Vec<Uid> = self
            .devices
            .values()
            .filter(|d| d.peer.id() == peer_id)
            .map(|d| d.uid.clone())
            .collect();
        for uid in &uids {
            self.devices.remove(uid);
        }
        uids
    }

    /// Refresh the transport handle and sequence high-water mark. `last_seq`
    /// never moves backwards.
    pub fn update(&mut self, uid: &Uid, peer: Peer, seq: u64) -> Option<&DeviceRecord> {
        let record = self.devices.get_mut(uid)?;
        record.peer = peer;
        record.last_seq = record.last_seq.max(seq);
        Some(record)
    }

    /// True iff `seq` is not older than the last accepted one. Retransmits of
    /// the same seq are accepted.
    pub fn is_latest_seq(&self, uid: &Uid, seq: u64) -> bool {
        self.devices
            .get(uid)
            .map(|d| seq >= d.last_seq)
            .unwrap_or(false)
    }

    pub fn get_all(&self, device_type: DeviceType, channel: &Channel) -> Vec<Uid> {
        self.devices
            .values()
            .filter(|d| d.device_type == device_type && &d.channel == channel)
            .map(|d| d.uid.clone())
            .collect()
    }

    pub fn get(&self, uid: &Uid) -> Option<&DeviceRecord> {
        self.devices.get(uid)
    }

    pub fn get_peer(&self, uid: &Uid) -> Option<&Peer> {
        self.devices.get(uid).map(|d| &d.peer)
    }

    pub fn is_allowed_action(&self, uid: &Uid, kind: MessageKind) -> bool {
        self.devices
            .get(uid)
            .map(|d| d.device_type.may_send(kind))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Drop every record without notifying the devices.
    pub fn clear(&mut self) {
        self.devices.clear();
    }
}
