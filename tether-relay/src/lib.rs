//! Tether relay server library.
//!
//! Devices register on a channel under a role and the relay routes
//! commands from controllers to toys and status from toys to controllers
//! and observers. The binary and the integration tests both drive it
//! through [`RelayServer`].

pub mod config;
pub mod dispatcher;
pub mod peer;
pub mod registry;
pub mod server;
pub mod sticky;
pub mod tcp;
pub mod udp;
pub mod ws;

#[cfg(test)]
mod testing;

pub use config::RelayConfig;
pub use dispatcher::{Control, DeviceInfo, Inbound, Relay, RelayEvent, RelayHandle};
pub use peer::{Peer, PeerId, PeerSink};
pub use registry::{DeviceRecord, DeviceRegistry, RegistryError, RegistryPolicy};
pub use server::RelayServer;
pub use sticky::StickyCache;
