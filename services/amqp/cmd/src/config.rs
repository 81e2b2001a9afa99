//! Configuration handling for the AMQP probe.
//!
//! Values come from the shared YAML config file, then from `AMQP_*`
//! environment variables, then from command-line flags in `main.rs`.

use amqp_session::{ClientIdentity, ConnectionConfig, Secret};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

/// Probe configuration
#[derive(Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Broker host
    pub host: String,
    /// Broker port
    pub port: u16,
    /// Virtual host to open
    pub vhost: String,
    /// PLAIN username
    pub username: String,
    /// PLAIN password
    pub password: String,
    /// Name shown in the broker's connection list
    pub connection_name: String,
    /// Requested heartbeat in seconds
    pub heartbeat: u16,
    /// Frame size ceiling
    pub frame_max: u32,
}

impl std::fmt::Debug for ProbeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("vhost", &self.vhost)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("connection_name", &self.connection_name)
            .field("heartbeat", &self.heartbeat)
            .field("frame_max", &self.frame_max)
            .finish()
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5672,
            vhost: "/".to_string(),
            username: "guest".to_string(),
            password: "guest".to_string(),
            connection_name: "redb-amqp".to_string(),
            heartbeat: 0,
            frame_max: 4096,
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    services: Option<ServicesConfig>,
}

#[derive(Debug, Deserialize)]
struct ServicesConfig {
    amqp: Option<ServiceConfig>,
}

#[derive(Debug, Deserialize)]
struct ServiceConfig {
    config: Option<HashMap<String, String>>,
}

impl ProbeConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        match std::fs::read_to_string(&config_path) {
            Ok(content) => match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(root) => {
                    config.apply_root_config(root);
                    info!("Loaded configuration from {:?}", config_path.as_ref());
                }
                Err(e) => warn!(
                    "Failed to parse config file {:?}, using defaults: {}",
                    config_path.as_ref(),
                    e
                ),
            },
            Err(_) => warn!(
                "Config file {:?} not found, using defaults",
                config_path.as_ref()
            ),
        }

        config.apply_overrides(|key| std::env::var(key).ok());

        info!(
            "Final probe configuration: broker={}:{}, vhost={}, user={}",
            config.host, config.port, config.vhost, config.username
        );
        Ok(config)
    }

    fn apply_root_config(&mut self, root: RootConfig) {
        let values = root
            .services
            .and_then(|services| services.amqp)
            .and_then(|service| service.config);
        if let Some(values) = values {
            for (key, value) in values {
                self.apply_value(&key, value);
            }
        }
    }

    fn apply_value(&mut self, key: &str, value: String) {
        match key {
            "services.amqp.host" => self.host = value,
            "services.amqp.port" => match value.parse() {
                Ok(port) => self.port = port,
                Err(_) => warn!("Ignoring invalid port '{}'", value),
            },
            "services.amqp.vhost" => self.vhost = value,
            "services.amqp.username" => self.username = value,
            "services.amqp.password" => self.password = value,
            "services.amqp.connection_name" => self.connection_name = value,
            "services.amqp.heartbeat" => match value.parse() {
                Ok(heartbeat) => self.heartbeat = heartbeat,
                Err(_) => warn!("Ignoring invalid heartbeat '{}'", value),
            },
            "services.amqp.frame_max" => match value.parse() {
                Ok(frame_max) => self.frame_max = frame_max,
                Err(_) => warn!("Ignoring invalid frame_max '{}'", value),
            },
            _ => {}
        }
    }

    /// Apply `AMQP_*` overrides from `lookup`
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("AMQP_HOST") {
            info!("Broker host overridden by environment: {}", host);
            self.host = host;
        }
        if let Some(port) = lookup("AMQP_PORT") {
            match port.parse() {
                Ok(port) => {
                    info!("Broker port overridden by environment: {}", port);
                    self.port = port;
                }
                Err(_) => warn!("Ignoring invalid AMQP_PORT '{}'", port),
            }
        }
        if let Some(vhost) = lookup("AMQP_VHOST") {
            info!("Virtual host overridden by environment: {}", vhost);
            self.vhost = vhost;
        }
        if let Some(username) = lookup("AMQP_USER") {
            self.username = username;
        }
        if let Some(password) = lookup("AMQP_PASSWORD") {
            self.password = password;
        }
    }

    /// Broker address as `host:port`
    pub fn broker_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Engine configuration for this probe
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            vhost: self.vhost.clone(),
            username: self.username.clone(),
            password: Secret::from(self.password.as_str()),
            identity: ClientIdentity {
                connection_name: self.connection_name.clone(),
                ..Default::default()
            },
            frame_max: self.frame_max,
            heartbeat: self.heartbeat,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = ProbeConfig::default();
        assert_eq!(config.broker_addr(), "127.0.0.1:5672");
        assert_eq!(config.vhost, "/");
        assert_eq!(config.heartbeat, 0);
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
services:
  amqp:
    enabled: true
    config:
      services.amqp.host: broker.internal
      services.amqp.port: "5673"
      services.amqp.vhost: orders
      services.amqp.heartbeat: "30"
      services.amqp.frame_max: not-a-number
"#;
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml_content.as_bytes()).unwrap();

        let config = ProbeConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.host, "broker.internal");
        assert_eq!(config.port, 5673);
        assert_eq!(config.vhost, "orders");
        assert_eq!(config.heartbeat, 30);
        assert_eq!(config.frame_max, 4096);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ProbeConfig::load_from_file(dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config.port, 5672);
    }

    #[test]
    fn test_environment_overrides() {
        let env: HashMap<&str, &str> = [
            ("AMQP_HOST", "rabbit"),
            ("AMQP_PORT", "bogus"),
            ("AMQP_USER", "probe"),
            ("AMQP_PASSWORD", "s3cret"),
        ]
        .into_iter()
        .collect();

        let mut config = ProbeConfig::default();
        config.apply_overrides(|key| env.get(key).map(|value| value.to_string()));
        assert_eq!(config.host, "rabbit");
        assert_eq!(config.port, 5672);
        assert_eq!(config.username, "probe");

        let connection = config.connection_config();
        assert_eq!(connection.password.expose(), b"s3cret");
        assert!(!format!("{:?}", config).contains("s3cret"));
    }
}
