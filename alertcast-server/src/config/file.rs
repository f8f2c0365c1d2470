//! TOML file configuration structures.
//!
//! These structs directly map to the `alertcast.toml` file format. Every
//! section and key is optional; omitted values fall back to the defaults of
//! the matching runtime type in `alertcast_core::config`.

use serde::Deserialize;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use url::Url;

/// Root configuration structure as read from the TOML file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub server: ServerConfig,
    pub bus: BusConfig,
    pub matcher: MatcherConfig,
    pub routing: RoutingConfig,
    pub alerts: AlertsConfig,
}

/// Server configuration section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// The address and port to listen on (e.g., "0.0.0.0:8080").
    pub listen: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8080)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backbone {
    #[default]
    Nats,
    Memory,
    None,
}

/// Message bus section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BusConfig {
    pub backbone: Backbone,
    pub url: String,
    pub stream_prefix: String,
    pub ack_wait_secs: u64,
    /// Delivery attempts per message; `0` means unlimited.
    pub max_deliver: i64,
    pub connect_timeout_secs: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            backbone: Backbone::Nats,
            url: "nats://127.0.0.1:4222".to_owned(),
            stream_prefix: "alertcast".to_owned(),
            ack_wait_secs: 60,
            max_deliver: 5,
            connect_timeout_secs: 5,
        }
    }
}

/// Proximity matcher section. Reloaded on SIGHUP.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MatcherConfig {
    pub interval_minutes: u64,
    pub batch_size: usize,
    pub batch_stagger_ms: u64,
    pub default_radius_meters: f64,
    pub arrival_batch_size: usize,
    pub arrival_stagger_ms: u64,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            interval_minutes: 5,
            batch_size: 10,
            batch_stagger_ms: 100,
            default_radius_meters: 50_000.0,
            arrival_batch_size: 2,
            arrival_stagger_ms: 500,
        }
    }
}

/// Channel derivation section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RoutingConfig {
    pub country: String,
    pub dedup_window_secs: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            country: "india".to_owned(),
            dedup_window_secs: 600,
        }
    }
}

/// Alert store section. At most one of `file` and `url`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AlertsConfig {
    pub file: Option<PathBuf>,
    pub url: Option<Url>,
    pub timeout_secs: u64,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            file: None,
            url: None,
            timeout_secs: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config_parsing() {
        let toml_str = r#"
[server]
listen = "127.0.0.1:3000"

[bus]
backbone = "memory"
max_deliver = 3

[matcher]
interval_minutes = 1
batch_size = 25
batch_stagger_ms = 0

[routing]
country = "Nepal"
dedup_window_secs = 30

[alerts]
url = "http://alerts.internal/active"
"#;
        let config: FileConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen.port(), 3000);
        assert_eq!(config.bus.backbone, Backbone::Memory);
        assert_eq!(config.bus.max_deliver, 3);
        assert_eq!(config.bus.stream_prefix, "alertcast");
        assert_eq!(config.matcher.batch_size, 25);
        assert_eq!(config.matcher.arrival_batch_size, 2);
        assert_eq!(config.routing.country, "Nepal");
        assert!(config.alerts.url.is_some());
        assert!(config.alerts.file.is_none());
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: FileConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.listen.port(), 8080);
        assert_eq!(config.bus.backbone, Backbone::Nats);
        assert_eq!(config.matcher.interval_minutes, 5);
        assert_eq!(config.routing.dedup_window_secs, 600);
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        assert!(toml::from_str::<FileConfig>("[matcher]\nbatch = 3\n").is_err());
        assert!(toml::from_str::<FileConfig>("[bus]\nbackbone = \"kafka\"\n").is_err());
    }
}
