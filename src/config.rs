//! Configuration.
//!
//! Loaded from a YAML file; every field is optional and falls back to a
//! sensible default, so an empty config is a working node with a fresh
//! identity listening on the default discovery port.
//!
//! ```yaml
//! identity:
//!   secret: "b71c71a67e1177ad4e901695e1b4b9ee17ae16c6668d313eac2f96dbcda3f291"
//! discovery:
//!   bind_addr: "0.0.0.0:30303"
//!   timeout_ms: 10000
//!   endpoint:
//!     address: "203.0.113.7"
//!     udp_port: 30303
//!     tcp_port: 30303
//! peers:
//!   - "203.0.113.9:30303"
//! ```

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::discovery::Endpoint;
use crate::identity::{Identity, IdentityError};

/// Default discovery bind address.
const DEFAULT_BIND_ADDR: &str = "0.0.0.0:30303";

/// Default ping timeout in milliseconds.
const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseYaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),
}

/// Identity configuration (`identity.*`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Hex-encoded static secret key. A fresh keypair is generated when
    /// absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

/// The endpoint a node advertises in its pings (`discovery.endpoint.*`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Ipv4Addr>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub udp_port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_port: Option<u16>,
}

/// Discovery server configuration (`discovery.*`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// UDP socket to bind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_addr: Option<SocketAddr>,

    /// How long a ping waits for its pong.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Advertised endpoint; defaults to wildcard with no ports, meaning
    /// "not externally reachable".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<EndpointConfig>,
}

impl DiscoveryConfig {
    /// Bind address, defaulting to `0.0.0.0:30303`.
    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.parse().expect("default address parses"))
    }

    /// Ping timeout, defaulting to 10 seconds.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS))
    }

    /// The advertised endpoint.
    pub fn endpoint(&self) -> Endpoint {
        match &self.endpoint {
            Some(endpoint) => Endpoint {
                address: endpoint.address.unwrap_or(Ipv4Addr::UNSPECIFIED),
                udp_port: endpoint.udp_port,
                tcp_port: endpoint.tcp_port,
            },
            None => Endpoint::unspecified(),
        }
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Identity configuration (`identity.*`).
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Discovery configuration (`discovery.*`).
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Bootstrap peers to ping at startup, as `"address:udp_port"`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub peers: Vec<String>,
}

impl Config {
    /// Create an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a single file.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;

        serde_yaml::from_str(&contents).map_err(|e| ConfigError::ParseYaml {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Whether a static identity was configured.
    pub fn has_identity(&self) -> bool {
        self.identity.secret.is_some()
    }

    /// Build the node identity from the configuration, generating a
    /// fresh keypair when none is configured.
    pub fn create_identity(&self) -> Result<Identity, ConfigError> {
        match &self.identity.secret {
            Some(secret) => Ok(Identity::from_secret_str(secret)?),
            None => Ok(Identity::generate()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::new();

        assert_eq!(
            config.discovery.bind_addr(),
            "0.0.0.0:30303".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(config.discovery.timeout(), Duration::from_secs(10));
        assert_eq!(config.discovery.endpoint(), Endpoint::unspecified());
        assert!(!config.has_identity());
        assert!(config.peers.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
identity:
  secret: "0101010101010101010101010101010101010101010101010101010101010101"
discovery:
  bind_addr: "127.0.0.1:40404"
  timeout_ms: 500
  endpoint:
    address: "203.0.113.7"
    udp_port: 30303
    tcp_port: 30304
peers:
  - "203.0.113.9:30303"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert!(config.has_identity());
        assert_eq!(
            config.discovery.bind_addr(),
            "127.0.0.1:40404".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(config.discovery.timeout(), Duration::from_millis(500));

        let endpoint = config.discovery.endpoint();
        assert_eq!(endpoint.address, Ipv4Addr::new(203, 0, 113, 7));
        assert_eq!(endpoint.udp_port, Some(30303));
        assert_eq!(endpoint.tcp_port, Some(30304));

        assert_eq!(config.peers, vec!["203.0.113.9:30303".to_string()]);

        let identity = config.create_identity().unwrap();
        let expected = Identity::from_secret_bytes(&[1u8; 32]).unwrap();
        assert_eq!(identity.node_id(), expected.node_id());
    }

    #[test]
    fn test_empty_config_parses() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert!(config.create_identity().is_ok());
    }

    #[test]
    fn test_invalid_secret_rejected() {
        let config: Config = serde_yaml::from_str("identity:\n  secret: \"nothex\"\n").unwrap();
        assert!(matches!(
            config.create_identity(),
            Err(ConfigError::Identity(_))
        ));
    }

    #[test]
    fn test_load_file_missing() {
        let result = Config::load_file(Path::new("/nonexistent/wisp.yaml"));
        assert!(matches!(result, Err(ConfigError::ReadFile { .. })));
    }
}
