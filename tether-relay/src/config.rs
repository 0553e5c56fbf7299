use std::net::SocketAddr;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::registry::RegistryPolicy;

pub const DEFAULT_PORT: u16 = 33330;
pub const DEFAULT_WS_PORT: u16 = 33331;

/// Relay settings. A listener set to `None` is not started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub udp_listen: Option<SocketAddr>,
    pub tcp_listen: Option<SocketAddr>,
    pub ws_listen: Option<SocketAddr>,
    pub only_one_controller_per_channel: bool,
    pub only_one_toy_per_channel: bool,
    pub allow_observers: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            udp_listen: Some(SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT))),
            tcp_listen: Some(SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT))),
            ws_listen: Some(SocketAddr::from(([0, 0, 0, 0], DEFAULT_WS_PORT))),
            only_one_controller_per_channel: false,
            only_one_toy_per_channel: false,
            allow_observers: false,
        }
    }
}

impl RelayConfig {
    /// All listeners on an ephemeral loopback port.
    pub fn loopback() -> Self {
        let any = SocketAddr::from(([127, 0, 0, 1], 0));
        Self {
            udp_listen: Some(any),
            tcp_listen: Some(any),
            ws_listen: Some(any),
            ..Self::default()
        }
    }

    pub fn policy(&self) -> RegistryPolicy {
        RegistryPolicy {
            only_one_controller_per_channel: self.only_one_controller_per_channel,
            only_one_toy_per_channel: self.only_one_toy_per_channel,
            allow_observers: self.allow_observers,
        }
    }

    /// Defaults overridden by `TETHER_*` environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            udp_listen: listen_var(&lookup, "TETHER_RELAY_UDP", defaults.udp_listen)?,
            tcp_listen: listen_var(&lookup, "TETHER_RELAY_TCP", defaults.tcp_listen)?,
            ws_listen: listen_var(&lookup, "TETHER_RELAY_WS", defaults.ws_listen)?,
            only_one_controller_per_channel: flag_var(
                &lookup,
                "TETHER_ONE_CONTROLLER_PER_CHANNEL",
                defaults.only_one_controller_per_channel,
            )?,
            only_one_toy_per_channel: flag_var(
                &lookup,
                "TETHER_ONE_TOY_PER_CHANNEL",
                defaults.only_one_toy_per_channel,
            )?,
            allow_observers: flag_var(&lookup, "TETHER_ALLOW_OBSERVERS", defaults.allow_observers)?,
        })
    }
}

fn listen_var(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: Option<SocketAddr>,
) -> anyhow::Result<Option<SocketAddr>> {
    match lookup(name) {
        None => Ok(default),
        Some(v) if v.trim().is_empty() || v.trim().eq_ignore_ascii_case("off") => Ok(None),
        Some(v) => v
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("invalid {name} (expected host:port or `off`)")),
    }
}

fn flag_var(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: bool,
) -> anyhow::Result<bool> {
    match lookup(name) {
        None => Ok(default),
        Some(v) => match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" | "" => Ok(false),
            other => anyhow::bail!("invalid {name}: {other:?} (expected true or false)"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k9::assert_equal;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_without_env() {
        let config = RelayConfig::from_lookup(lookup(&[])).unwrap();
        assert_equal!(config, RelayConfig::default());
        assert_equal!(config.udp_listen.unwrap().port(), 33330);
        assert_equal!(config.ws_listen.unwrap().port(), 33331);
        assert_equal!(config.policy(), RegistryPolicy::default());
    }

    #[test]
    fn env_overrides() {
        let config = RelayConfig::from_lookup(lookup(&[
            ("TETHER_RELAY_UDP", "off"),
            ("TETHER_RELAY_TCP", "127.0.0.1:4000"),
            ("TETHER_ONE_TOY_PER_CHANNEL", "true"),
            ("TETHER_ALLOW_OBSERVERS", "1"),
        ]))
        .unwrap();
        assert_equal!(config.udp_listen, None);
        assert_equal!(config.tcp_listen, Some("127.0.0.1:4000".parse().unwrap()));
        assert!(config.only_one_toy_per_channel);
        assert!(!config.only_one_controller_per_channel);
        assert!(config.allow_observers);
    }

    #[test]
    fn bad_values_are_reported() {
        assert!(RelayConfig::from_lookup(lookup(&[("TETHER_RELAY_WS", "nowhere")])).is_err());
        assert!(RelayConfig::from_lookup(lookup(&[("TETHER_ALLOW_OBSERVERS", "maybe")])).is_err());
    }
}
