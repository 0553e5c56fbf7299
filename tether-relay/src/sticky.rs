use std::collections::HashMap;

use serde_json::Value;
use tether_proto::{Channel, DeviceType, Message, MessageKind, Uid};

/// Last sticky payload of one class on one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Retained {
    pub seq: u64,
    pub data: Value,
}

/// Retains the last sticky status and command per channel so late joiners
/// can be brought up to date. Entries are replaced, never aged out.
#[derive(Debug, Default)]
pub struct StickyCache {
    status: HashMap<Channel, Retained>,
    command: HashMap<Channel, Retained>,
}

impl StickyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retain `msg` if it is a sticky status or command. Returns whether
    /// anything was stored.
    pub fn set(&mut self, channel: &Channel, msg: &Message) -> bool {
        let (slot, seq, data) = match msg {
            Message::Status {
                seq,
                data,
                sticky: true,
                ..
            } => (&mut self.status, *seq, data),
            Message::Command {
                seq,
                data,
                sticky: true,
                ..
            } => (&mut self.command, *seq, data),
            _ => return false,
        };
        slot.insert(
            channel.clone(),
            Retained {
                seq,
                data: data.clone(),
            },
        );
        true
    }

    /// The retained message a `device_type` joining `channel` should see,
    /// addressed to `uid`.
    pub fn get(&self, channel: &Channel, device_type: DeviceType, uid: Uid) -> Option<Message> {
        match device_type.consumes() {
            MessageKind::Status => self.status.get(channel).map(|r| Message::Status {
                seq: r.seq,
                uid,
                data: r.data.clone(),
                sticky: false,
            }),
            MessageKind::Command => self.command.get(channel).map(|r| Message::Command {
                seq: r.seq,
                uid,
                data: r.data.clone(),
                sticky: false,
            }),
            _ => None,
        }
    }

    pub fn clear(&mut self) {
        self.status.clear();
        self.command.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k9::assert_equal;
    use serde_json::json;

    fn status(seq: u64, data: Value, sticky: bool) -> Message {
        Message::Status {
            seq,
            uid: Uid::from("toy"),
            data,
            sticky,
        }
    }

    #[test]
    fn only_sticky_messages_are_retained() {
        let mut cache = StickyCache::new();
        let ch = Channel::from("1");

        assert!(!cache.set(&ch, &status(1, json!("a"), false)));
        assert!(!cache.set(
            &ch,
            &Message::Ping {
                seq: 2,
                uid: Uid::from("toy"),
                data: json!("x"),
            }
        ));
        assert_equal!(cache.get(&ch, DeviceType::Controller, Uid::from("c")), None);

        assert!(cache.set(&ch, &status(3, json!({"temp": 20}), true)));
        assert_equal!(
            cache.get(&ch, DeviceType::Controller, Uid::from("c")),
            Some(Message::Status {
                seq: 3,
                uid: Uid::from("c"),
                data: json!({"temp": 20}),
                sticky: false,
            })
        );
    }

    #[test]
    fn later_sticky_replaces_earlier() {
        let mut cache = StickyCache::new();
        let ch = Channel::from("1");
        cache.set(&ch, &status(1, json!("old"), true));
        cache.set(&ch, &status(2, json!("new"), true));

        let replay = cache.get(&ch, DeviceType::Observer, Uid::from("o")).unwrap();
        assert_equal!(replay.seq(), 2);
    }

    #[test]
    fn replay_class_follows_requesting_role() {
        let mut cache = StickyCache::new();
        let ch = Channel::from("1");
        cache.set(
            &ch,
            &Message::Command {
                seq: 4,
                uid: Uid::from("ctl"),
                data: json!("go"),
                sticky: true,
            },
        );

        assert_equal!(cache.get(&ch, DeviceType::Controller, Uid::from("c")), None);
        assert_equal!(
            cache.get(&ch, DeviceType::Toy, Uid::from("t")),
            Some(Message::Command {
                seq: 4,
                uid: Uid::from("t"),
                data: json!("go"),
                sticky: false,
            })
        );
        assert_equal!(
            cache.get(&Channel::from("2"), DeviceType::Toy, Uid::from("t")),
            None
        );
    }
}
