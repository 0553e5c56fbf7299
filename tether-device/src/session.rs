//! Device-side protocol state, free of any I/O.
//!
//! The owner feeds in received messages and the passage of time, then
//! drains [`Session::poll_transmit`] and [`Session::poll_event`]. Timers
//! are plain deadlines reported by [`Session::poll_deadline`].

use std::collections::VecDeque;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;

use tether_proto::{Channel, DeviceType, ErrorCode, Message, MessageKind, RegisterData, Uid};

use crate::ping::{PingCallback, PingError, PingTracker};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub device_type: DeviceType,
    pub channel: Channel,
    pub keepalive: Option<Duration>,
    pub register_retry: Duration,
    pub register_backoff_max: Option<Duration>,
    pub ping_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Unregistered,
    Registering,
    Registered { uid: Uid },
}

/// What the application hears about.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    Registered { uid: Uid, channel: Channel },
    Status { seq: u64, data: Value },
    Command { seq: u64, data: Value },
    Error { seq: u64, code: ErrorCode },
}

/// Local precondition failures. Nothing is sent when these are returned.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("not registered with the relay")]
    NotRegistered,
    #[error("a {device_type} may not send {kind}")]
    RoleMismatch {
        device_type: DeviceType,
        kind: MessageKind,
    },
    #[error(transparent)]
    Ping(#[from] PingError),
}

pub struct Session {
    settings: SessionSettings,
    state: SessionState,
    next_seq: u64,
    /// Seq of the register ack we adopted.
    ack_seq: u64,
    /// Seq of the first `register` sent in the current attempt.
    attempt_seq: u64,
    retry_at: Option<Instant>,
    retry_interval: Duration,
    keepalive_at: Option<Instant>,
    pings: PingTracker,
    outbox: VecDeque<Message>,
    events: VecDeque<DeviceEvent>,
}

impl Session {
    pub fn new(settings: SessionSettings) -> Self {
        Self {
            pings: PingTracker::new(settings.ping_timeout),
            retry_interval: settings.register_retry,
            settings,
            state: SessionState::Unregistered,
            next_seq: 1,
            ack_seq: 0,
            attempt_seq: 0,
            retry_at: None,
            keepalive_at: None,
            outbox: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn uid(&self) -> Option<&Uid> {
        match &self.state {
            SessionState::Registered { uid } => Some(uid),
            _ => None,
        }
    }

    /// Send the first `register` and arm the retry timer.
    pub fn start(&mut self, now: Instant) {
        self.begin_registration(now);
    }

    pub fn send_status(&mut self, data: Value, sticky: bool) -> Result<u64, SessionError> {
        self.send(MessageKind::Status, data, sticky)
    }

    pub fn send_command(&mut self, data: Value, sticky: bool) -> Result<u64, SessionError> {
        self.send(MessageKind::Command, data, sticky)
    }

    fn send(&mut self, kind: MessageKind, data: Value, sticky: bool) -> Result<u64, SessionError> {
        if !self.settings.device_type.may_send(kind) {
            return Err(SessionError::RoleMismatch {
                device_type: self.settings.device_type,
                kind,
            });
        }
        let uid = self.uid().cloned().ok_or(SessionError::NotRegistered)?;
        let seq = self.take_seq();
        self.outbox.push_back(match kind {
            MessageKind::Status => Message::Status {
                seq,
                uid,
                data,
                sticky,
            },
            _ => Message::Command {
                seq,
                uid,
                data,
                sticky,
            },
        });
        Ok(seq)
    }

    /// Send a ping. Without a uid the callback gets `None` immediately and
    /// nothing is sent.
    pub fn ping(&mut self, now: Instant, callback: PingCallback) -> Result<Option<u64>, SessionError> {
        let Some(uid) = self.uid().cloned() else {
            callback(None);
            return Ok(None);
        };
        let seq = self.take_seq();
        self.pings.add(seq, now, callback)?;
        self.outbox.push_back(Message::Ping {
            seq,
            uid,
            data: Value::String(unix_millis().to_string()),
        });
        Ok(Some(seq))
    }

    pub fn handle_message(&mut self, msg: Message, now: Instant) {
        match msg {
            Message::Register {
                seq,
                data: RegisterData::Ack(ack),
            } => {
                let adopt = match &self.state {
                    // Acks answering an earlier attempt name a uid the relay
                    // may already have forgotten.
                    SessionState::Registering => seq >= self.attempt_seq,
                    // A later ack supersedes the one we adopted.
                    SessionState::Registered { uid } => seq > self.ack_seq && *uid != ack.uid,
                    SessionState::Unregistered => false,
                };
                if adopt {
                    self.adopt(seq, ack.uid, ack.channel, now);
                } else {
                    log::debug!("ignoring register ack seq={}", seq);
                }
            }
            Message::Register { seq, .. } => {
                log::warn!("ignoring register request seq={} from relay", seq)
            }
            Message::Ping { seq, .. } => match self.pings.complete(seq, now) {
                Ok(rtt) => log::debug!("ping seq={} rtt={:?}", seq, rtt),
                Err(e) => log::warn!("unexpected ping reply: {}", e),
            },
            Message::Status { seq, data, .. } => self.deliver(MessageKind::Status, seq, data),
            Message::Command { seq, data, .. } => self.deliver(MessageKind::Command, seq, data),
            Message::Error { seq, data: code, .. } => {
                if self.pings.is_pending(seq) {
                    let _ = self.pings.resolve(seq, None);
                }
                log::warn!("relay error seq={}: {}", seq, code.message());
                self.events.push_back(DeviceEvent::Error { seq, code });
                if code == ErrorCode::DeviceNotRegistered
                    && matches!(self.state, SessionState::Registered { .. })
                {
                    log::info!("relay forgot us, registering again");
                    self.begin_registration(now);
                }
            }
        }
    }

    /// Fire every timer due at `now`.
    pub fn handle_timeout(&mut self, now: Instant) {
        if self.state == SessionState::Registering
            && self.retry_at.is_some_and(|at| now >= at)
        {
            self.retry_interval = self.next_retry_interval();
            log::debug!("no register ack, retrying in {:?}", self.retry_interval);
            self.send_register(now);
        }

        if let (Some(at), Some(interval)) = (self.keepalive_at, self.settings.keepalive) {
            if now >= at && self.uid().is_some() {
                let sent = self.ping(
                    now,
                    Box::new(|rtt| {
                        if rtt.is_none() {
                            log::warn!("keepalive ping went unanswered");
                        }
                    }),
                );
                if let Err(e) = sent {
                    log::error!("keepalive ping failed: {}", e);
                }
                self.keepalive_at = Some(now + interval);
            }
        }

        for seq in self.pings.expire(now) {
            log::debug!("ping seq={} timed out", seq);
        }
    }

    /// The earliest instant at which [`Session::handle_timeout`] has work.
    pub fn poll_deadline(&self) -> Option<Instant> {
        [self.retry_at, self.keepalive_at, self.pings.next_deadline()]
            .into_iter()
            .flatten()
            .min()
    }

    pub fn poll_transmit(&mut self) -> Option<Message> {
        self.outbox.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<DeviceEvent> {
        self.events.pop_front()
    }

    /// Cancel all timers and fail every in-flight ping.
    pub fn close(&mut self) {
        self.pings.close_all();
        self.retry_at = None;
        self.keepalive_at = None;
        self.outbox.clear();
        self.state = SessionState::Unregistered;
    }

    fn begin_registration(&mut self, now: Instant) {
        self.state = SessionState::Registering;
        self.keepalive_at = None;
        self.retry_interval = self.settings.register_retry;
        self.attempt_seq = self.next_seq;
        self.send_register(now);
    }

    fn send_register(&mut self, now: Instant) {
        let seq = self.take_seq();
        self.outbox.push_back(Message::register(
            seq,
            self.settings.device_type,
            self.settings.channel.clone(),
        ));
        self.retry_at = Some(now + self.retry_interval);
    }

    fn next_retry_interval(&self) -> Duration {
        match self.settings.register_backoff_max {
            Some(max) => (self.retry_interval * 2).min(max),
            None => self.retry_interval,
        }
    }

    fn adopt(&mut self, seq: u64, uid: Uid, channel: Channel, now: Instant) {
        log::info!(
            "registered as {} uid={} channel={}",
            self.settings.device_type,
            uid,
            channel
        );
        self.ack_seq = seq;
        self.retry_at = None;
        self.retry_interval = self.settings.register_retry;
        self.keepalive_at = self.settings.keepalive.map(|k| now + k);
        self.state = SessionState::Registered { uid: uid.clone() };
        self.events.push_back(DeviceEvent::Registered { uid, channel });
    }

    fn deliver(&mut self, kind: MessageKind, seq: u64, data: Value) {
        if self.settings.device_type.consumes() != kind {
            log::debug!(
                "ignoring {} seq={} not meant for a {}",
                kind,
                seq,
                self.settings.device_type
            );
            return;
        }
        self.events.push_back(match kind {
            MessageKind::Status => DeviceEvent::Status { seq, data },
            _ => DeviceEvent::Command { seq, data },
        });
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}
