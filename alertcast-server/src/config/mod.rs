//! Configuration module for alertcast-server.
//!
//! Handles loading configuration from the TOML file and CLI overrides, and
//! turns it into the runtime types the core processors run with.

pub mod file;

use crate::config::file::{Backbone, FileConfig};
use alertcast_core::config::{
    AlertSourceConfig, BackboneKind, BusConfig, MatcherConfig, RoutingConfig,
};
use alertcast_core::geo::slug;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    ValidationError(String),
}

/// Server section after overrides.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
}

/// Loaded configuration result containing all parts.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub server: ServerConfig,
    pub bus: BusConfig,
    pub matcher: MatcherConfig,
    pub routing: RoutingConfig,
    pub alerts: AlertSourceConfig,
}

/// Configuration loader that handles the complete loading process.
pub struct ConfigLoader {
    config_path: PathBuf,
    listen_override: Option<SocketAddr>,
}

impl ConfigLoader {
    /// Create a new config loader.
    pub fn new(config_path: impl AsRef<Path>, listen_override: Option<SocketAddr>) -> Self {
        Self {
            config_path: config_path.as_ref().to_path_buf(),
            listen_override,
        }
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Load and process the configuration.
    ///
    /// This will:
    /// 1. Read the TOML file (a missing file means all defaults)
    /// 2. Apply CLI overrides
    /// 3. Validate the configuration
    /// 4. Build the runtime configuration
    pub fn load(&self) -> Result<LoadedConfig, ConfigError> {
        let content = match std::fs::read_to_string(&self.config_path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    path = %self.config_path.display(),
                    "Config file not found, using defaults"
                );
                String::new()
            }
            Err(e) => return Err(e.into()),
        };
        self.load_str(&content)
    }

    /// Reload the configuration (used during SIGHUP).
    pub fn reload(&self) -> Result<LoadedConfig, ConfigError> {
        self.load()
    }

    fn load_str(&self, content: &str) -> Result<LoadedConfig, ConfigError> {
        let mut file_config: FileConfig = toml::from_str(content)?;

        if let Some(listen) = self.listen_override {
            file_config.server.listen = listen;
        }

        validate(&file_config)?;
        Ok(build_loaded_config(file_config))
    }
}

fn validate(config: &FileConfig) -> Result<(), ConfigError> {
    if config.matcher.interval_minutes == 0 {
        return invalid("matcher.interval_minutes must be at least 1");
    }
    if config.matcher.batch_size == 0 || config.matcher.arrival_batch_size == 0 {
        return invalid("matcher batch sizes must be positive");
    }
    let radius = config.matcher.default_radius_meters;
    if !radius.is_finite() || radius <= 0.0 {
        return invalid("matcher.default_radius_meters must be a positive number");
    }
    if slug(&config.routing.country).is_none() {
        return invalid("routing.country must contain at least one letter or digit");
    }
    if config.alerts.file.is_some() && config.alerts.url.is_some() {
        return invalid("alerts.file and alerts.url are mutually exclusive");
    }
    if config.bus.stream_prefix.trim().is_empty() {
        return invalid("bus.stream_prefix must not be empty");
    }
    Ok(())
}

fn invalid(msg: &str) -> Result<(), ConfigError> {
    Err(ConfigError::ValidationError(msg.to_owned()))
}

fn build_loaded_config(file: FileConfig) -> LoadedConfig {
    let alerts = match (file.alerts.file, file.alerts.url) {
        (Some(path), _) => AlertSourceConfig::File { path },
        (None, Some(url)) => AlertSourceConfig::Http {
            url,
            timeout: Duration::from_secs(file.alerts.timeout_secs),
        },
        (None, None) => AlertSourceConfig::Disabled,
    };

    LoadedConfig {
        server: ServerConfig {
            listen: file.server.listen,
        },
        bus: BusConfig {
            backbone: match file.bus.backbone {
                Backbone::Nats => BackboneKind::Nats,
                Backbone::Memory => BackboneKind::Memory,
                Backbone::None => BackboneKind::Disabled,
            },
            url: file.bus.url,
            stream_prefix: file.bus.stream_prefix,
            connect_timeout: Duration::from_secs(file.bus.connect_timeout_secs),
            ack_wait: Duration::from_secs(file.bus.ack_wait_secs),
            max_deliver: file.bus.max_deliver,
        },
        matcher: MatcherConfig {
            interval: Duration::from_secs(file.matcher.interval_minutes * 60),
            batch_size: file.matcher.batch_size,
            batch_stagger: Duration::from_millis(file.matcher.batch_stagger_ms),
            default_radius_meters: file.matcher.default_radius_meters,
            arrival_batch_size: file.matcher.arrival_batch_size,
            arrival_stagger: Duration::from_millis(file.matcher.arrival_stagger_ms),
        },
        routing: RoutingConfig {
            country: file.routing.country,
            dedup_window: Duration::from_secs(file.routing.dedup_window_secs),
        },
        alerts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loader(listen: Option<SocketAddr>) -> ConfigLoader {
        ConfigLoader::new("unused.toml", listen)
    }

    #[test]
    fn test_defaults_match_runtime_defaults() {
        let loaded = loader(None).load_str("").unwrap();
        assert_eq!(loaded.matcher, MatcherConfig::default());
        assert_eq!(loaded.routing, RoutingConfig::default());
        assert_eq!(loaded.bus, BusConfig::default());
        assert_eq!(loaded.alerts, AlertSourceConfig::Disabled);
    }

    #[test]
    fn test_listen_override_wins() {
        let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let loaded = loader(Some(addr))
            .load_str("[server]\nlisten = \"0.0.0.0:1234\"\n")
            .unwrap();
        assert_eq!(loaded.server.listen, addr);
    }

    #[test]
    fn test_alert_source_selection() {
        let loaded = loader(None)
            .load_str("[alerts]\nurl = \"http://localhost/alerts\"\ntimeout_secs = 3\n")
            .unwrap();
        assert!(matches!(
            loaded.alerts,
            AlertSourceConfig::Http { timeout, .. } if timeout == Duration::from_secs(3)
        ));

        let err = loader(None)
            .load_str("[alerts]\nfile = \"a.json\"\nurl = \"http://localhost/alerts\"\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_invalid_matcher_values_are_rejected() {
        for bad in [
            "[matcher]\ninterval_minutes = 0\n",
            "[matcher]\nbatch_size = 0\n",
            "[matcher]\ndefault_radius_meters = -1.0\n",
            "[routing]\ncountry = \"--\"\n",
        ] {
            assert!(
                matches!(loader(None).load_str(bad), Err(ConfigError::ValidationError(_))),
                "{bad}"
            );
        }
    }

    #[test]
    fn test_missing_file_means_defaults() {
        let path = std::env::temp_dir().join(format!("alertcast-missing-{}.toml", uuid::Uuid::new_v4()));
        let loaded = ConfigLoader::new(&path, None).load().unwrap();
        assert_eq!(loaded.server.listen.port(), 8080);
    }
}
