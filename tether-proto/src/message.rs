use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error_code::ErrorCode;

/// The role a device registers under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    /// Controlled endpoint: sends status, receives commands.
    Toy,
    /// Sends commands, receives status.
    Controller,
    /// Read-only status subscriber.
    Observer,
}

impl DeviceType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "toy" => Some(DeviceType::Toy),
            "controller" => Some(DeviceType::Controller),
            "observer" => Some(DeviceType::Observer),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceType::Toy => "toy",
            DeviceType::Controller => "controller",
            DeviceType::Observer => "observer",
        }
    }

    /// Permission table: toys may only send `status`, controllers may only
    /// send `command`, observers may send neither.
    pub fn may_send(self, kind: MessageKind) -> bool {
        matches!(
            (self, kind),
            (DeviceType::Toy, MessageKind::Status) | (DeviceType::Controller, MessageKind::Command)
        )
    }

    /// The message class this role receives from its peers.
    pub fn consumes(self) -> MessageKind {
        match self {
            DeviceType::Toy => MessageKind::Command,
            DeviceType::Controller | DeviceType::Observer => MessageKind::Status,
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeviceType::parse(s).ok_or_else(|| format!("unknown device type: {s}"))
    }
}

/// The five message kinds, without their payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Register,
    Ping,
    Status,
    Command,
    Error,
}

impl MessageKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "register" => Some(MessageKind::Register),
            "ping" => Some(MessageKind::Ping),
            "status" => Some(MessageKind::Status),
            "command" => Some(MessageKind::Command),
            "error" => Some(MessageKind::Error),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Register => "register",
            MessageKind::Ping => "ping",
            MessageKind::Status => "status",
            MessageKind::Command => "command",
            MessageKind::Error => "error",
        }
    }

    /// Keys that must all be present on the wire.
    pub fn required_fields(self) -> &'static [&'static str] {
        match self {
            MessageKind::Register => &["type", "seq", "data"],
            _ => &["type", "seq", "data", "uid"],
        }
    }

    /// Keys that may additionally be present.
    pub fn optional_fields(self) -> &'static [&'static str] {
        match self {
            MessageKind::Status | MessageKind::Command => &["sticky"],
            _ => &[],
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Channel identifier shared by devices that talk to each other. Numbers
/// on the wire are normalized to their decimal form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Channel(String);

impl Channel {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for Channel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(serde_json::Number),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Text(s) => Channel(s),
            Raw::Number(n) => Channel(n.to_string()),
        })
    }
}

impl From<&str> for Channel {
    fn from(s: &str) -> Self {
        Channel(s.to_string())
    }
}

impl From<String> for Channel {
    fn from(s: String) -> Self {
        Channel(s)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Relay-assigned session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uid(String);

impl Uid {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Uid {
    fn from(s: &str) -> Self {
        Uid(s.to_string())
    }
}

impl From<String> for Uid {
    fn from(s: String) -> Self {
        Uid(s)
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Device -> Relay: "register me under this role on this channel".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub device_type: DeviceType,
    pub channel: Channel,
}

/// Relay -> Device: "you are registered as `uid`".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterAck {
    pub channel: Channel,
    pub uid: Uid,
}

/// Payload of a `register` message, which travels in both directions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RegisterData {
    Request(Registration),
    Ack(RegisterAck),
}

fn is_false(b: &bool) -> bool {
    !*b
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Registration request, or the relay's acknowledgement of one.
    Register { seq: u64, data: RegisterData },

    /// Liveness probe; the relay echoes it back unchanged.
    Ping { seq: u64, uid: Uid, data: Value },

    /// Toy -> Relay -> Controllers/Observers.
    Status {
        seq: u64,
        uid: Uid,
        data: Value,
        #[serde(default, skip_serializing_if = "is_false")]
        sticky: bool,
    },

    /// Controller -> Relay -> Toys.
    Command {
        seq: u64,
        uid: Uid,
        data: Value,
        #[serde(default, skip_serializing_if = "is_false")]
        sticky: bool,
    },

    /// Relay -> Device, addressed to the sender of the offending message.
    Error { seq: u64, uid: Uid, data: ErrorCode },
}

impl Message {
    pub fn register(seq: u64, device_type: DeviceType, channel: Channel) -> Self {
        Message::Register {
            seq,
            data: RegisterData::Request(Registration {
                device_type,
                channel,
            }),
        }
    }

    pub fn register_ack(seq: u64, channel: Channel, uid: Uid) -> Self {
        Message::Register {
            seq,
            data: RegisterData::Ack(RegisterAck { channel, uid }),
        }
    }

    pub fn error(seq: u64, uid: Uid, code: ErrorCode) -> Self {
        Message::Error {
            seq,
            uid,
            data: code,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Register { .. } => MessageKind::Register,
            Message::Ping { .. } => MessageKind::Ping,
            Message::Status { .. } => MessageKind::Status,
            Message::Command { .. } => MessageKind::Command,
            Message::Error { .. } => MessageKind::Error,
        }
    }

    pub fn seq(&self) -> u64 {
        match self {
            Message::Register { seq, .. }
            | Message::Ping { seq, .. }
            | Message::Status { seq, .. }
            | Message::Command { seq, .. }
            | Message::Error { seq, .. } => *seq,
        }
    }

    /// `None` only for `register`, which is sent before a uid exists.
    pub fn uid(&self) -> Option<&Uid> {
        match self {
            Message::Register { .. } => None,
            Message::Ping { uid, .. }
            | Message::Status { uid, .. }
            | Message::Command { uid, .. }
            | Message::Error { uid, .. } => Some(uid),
        }
    }

    pub fn is_sticky(&self) -> bool {
        match self {
            Message::Status { sticky, .. } | Message::Command { sticky, .. } => *sticky,
            _ => false,
        }
    }

    /// A copy of a status/command addressed to `uid`, keeping the sender's
    /// `seq` and `data`. The sticky flag is not carried on forwarded copies.
    /// Other kinds are returned unchanged apart from the uid.
    pub fn readdressed(&self, uid: Uid) -> Message {
        match self {
            Message::Status { seq, data, .. } => Message::Status {
                seq: *seq,
                uid,
                data: data.clone(),
                sticky: false,
            },
            Message::Command { seq, data, .. } => Message::Command {
                seq: *seq,
                uid,
                data: data.clone(),
                sticky: false,
            },
            Message::Ping { seq, data, .. } => Message::Ping {
                seq: *seq,
                uid,
                data: data.clone(),
            },
            Message::Error { seq, data, .. } => Message::Error {
                seq: *seq,
                uid,
                data: *data,
            },
            Message::Register { .. } => self.clone(),
        }
    }
}
