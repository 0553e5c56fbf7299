use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use tether_proto::{Channel, DeviceType};

use crate::session::SessionSettings;

pub const DEFAULT_PORT: u16 = 33330;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("exactly one of udp, tcp or websocket must be selected")]
    ConflictingTransports,
    #[error("no transport selected")]
    NoTransport,
    #[error("invalid websocket url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// Where and how a device reaches the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportKind {
    Udp { host: String, port: u16 },
    Tcp { host: String, port: u16 },
    WebSocket(Url),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub relay_host: String,
    pub port: u16,
    pub ws_url: Option<String>,
    pub udp: bool,
    pub tcp: bool,
    pub channel: Channel,
    pub device_type: DeviceType,
    /// Keepalive ping interval; 0 disables it.
    pub keepalive_ms: u64,
    pub register_retry_ms: u64,
    /// When set, the register retry interval doubles up to this cap.
    pub register_backoff_max_ms: Option<u64>,
    pub ping_timeout_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            relay_host: "localhost".to_string(),
            port: DEFAULT_PORT,
            ws_url: None,
            udp: true,
            tcp: false,
            channel: Channel::from("1"),
            device_type: DeviceType::Controller,
            keepalive_ms: 30_000,
            register_retry_ms: 5_000,
            register_backoff_max_ms: None,
            ping_timeout_ms: 60_000,
        }
    }
}

impl DeviceConfig {
    pub fn transport(&self) -> Result<TransportKind, ConfigError> {
        let selected = [self.udp, self.tcp, self.ws_url.is_some()]
            .iter()
            .filter(|on| **on)
            .count();
        match selected {
            0 => return Err(ConfigError::NoTransport),
            1 => {}
            _ => return Err(ConfigError::ConflictingTransports),
        }

        if let Some(raw) = &self.ws_url {
            let url = Url::parse(raw).map_err(|e| ConfigError::InvalidUrl {
                url: raw.clone(),
                reason: e.to_string(),
            })?;
            if url.scheme() != "ws" && url.scheme() != "wss" {
                return Err(ConfigError::InvalidUrl {
                    url: raw.clone(),
                    reason: "scheme must be ws or wss".to_string(),
                });
            }
            return Ok(TransportKind::WebSocket(url));
        }

        let host = self.relay_host.clone();
        let port = self.port;
        Ok(if self.tcp {
            TransportKind::Tcp { host, port }
        } else {
            TransportKind::Udp { host, port }
        })
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            device_type: self.device_type,
            channel: self.channel.clone(),
            keepalive: (self.keepalive_ms > 0).then(|| Duration::from_millis(self.keepalive_ms)),
            register_retry: Duration::from_millis(self.register_retry_ms),
            register_backoff_max: self.register_backoff_max_ms.map(Duration::from_millis),
            ping_timeout: Duration::from_millis(self.ping_timeout_ms),
        }
    }

    /// Defaults overridden by `TETHER_*` environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut config = Self::default();
        if let Some(host) = lookup("TETHER_RELAY_HOST") {
            config.relay_host = host;
        }
        if let Some(port) = lookup("TETHER_RELAY_PORT") {
            config.port = port
                .trim()
                .parse()
                .with_context(|| format!("invalid TETHER_RELAY_PORT {port:?}"))?;
        }
        if let Some(transport) = lookup("TETHER_TRANSPORT") {
            match transport.trim() {
                "udp" => (config.udp, config.tcp) = (true, false),
                "tcp" => (config.udp, config.tcp) = (false, true),
                "ws" => {
                    (config.udp, config.tcp) = (false, false);
                    config.ws_url = Some(format!("ws://{}:33331/ws", config.relay_host));
                }
                other => anyhow::bail!("invalid TETHER_TRANSPORT {other:?} (udp, tcp or ws)"),
            }
        }
        if let Some(url) = lookup("TETHER_WS_URL") {
            (config.udp, config.tcp) = (false, false);
            config.ws_url = Some(url);
        }
        if let Some(channel) = lookup("TETHER_CHANNEL") {
            config.channel = Channel::from(channel);
        }
        if let Some(device_type) = lookup("TETHER_DEVICE_TYPE") {
            config.device_type = device_type
                .trim()
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))?;
        }
        if let Some(ms) = lookup("TETHER_KEEPALIVE_MS") {
            config.keepalive_ms = ms
                .trim()
                .parse()
                .with_context(|| format!("invalid TETHER_KEEPALIVE_MS {ms:?}"))?;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k9::assert_equal;

    #[test]
    fn default_is_udp_to_localhost() {
        let config = DeviceConfig::default();
        assert_equal!(
            config.transport(),
            Ok(TransportKind::Udp {
                host: "localhost".to_string(),
                port: 33330
            })
        );
        let settings = config.session_settings();
        assert_equal!(settings.channel, Channel::from("1"));
        assert_equal!(settings.keepalive, Some(Duration::from_secs(30)));
        assert_equal!(settings.register_retry, Duration::from_secs(5));
        assert_equal!(settings.register_backoff_max, None);
    }

    #[test]
    fn mixing_transports_is_rejected() {
        let config = DeviceConfig {
            tcp: true,
            ..Default::default()
        };
        assert_equal!(config.transport(), Err(ConfigError::ConflictingTransports));

        let config = DeviceConfig {
            udp: false,
            ..Default::default()
        };
        assert_equal!(config.transport(), Err(ConfigError::NoTransport));
    }

    #[test]
    fn websocket_url_is_validated() {
        let config = DeviceConfig {
            udp: false,
            ws_url: Some("ws://relay.local:33331/ws".to_string()),
            ..Default::default()
        };
        assert!(matches!(config.transport(), Ok(TransportKind::WebSocket(_))));

        let config = DeviceConfig {
            udp: false,
            ws_url: Some("http://relay.local/ws".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            config.transport(),
            Err(ConfigError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn zero_keepalive_disables_it() {
        let config = DeviceConfig {
            keepalive_ms: 0,
            ..Default::default()
        };
        assert_equal!(config.session_settings().keepalive, None);
    }

    #[test]
    fn env_overrides() {
        let config = DeviceConfig::from_lookup(|name| match name {
            "TETHER_TRANSPORT" => Some("tcp".to_string()),
            "TETHER_CHANNEL" => Some("kitchen".to_string()),
            "TETHER_DEVICE_TYPE" => Some("toy".to_string()),
            _ => None,
        })
        .unwrap();
        assert!(config.tcp && !config.udp);
        assert_equal!(config.channel, Channel::from("kitchen"));
        assert_equal!(config.device_type, DeviceType::Toy);

        assert!(DeviceConfig::from_lookup(|name| {
            (name == "TETHER_DEVICE_TYPE").then(|| "robot".to_string())
        })
        .is_err());
    }
}
