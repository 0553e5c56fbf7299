//! Endpoint side of the tether protocol: toys, controllers and observers.
//!
//! [`Session`] is the protocol state machine with no I/O of its own;
//! [`Device`] runs one over a [`Link`] to the relay.

pub mod config;
pub mod device;
pub mod link;
pub mod ping;
pub mod session;

pub use config::{ConfigError, DeviceConfig, TransportKind};
pub use device::{Device, DeviceError};
pub use link::Link;
pub use ping::{PingCallback, PingError, PingTracker, MAX_PING_WAIT};
pub use session::{DeviceEvent, Session, SessionError, SessionSettings, SessionState};
