//! Configuration module for sealgate
//!
//! JSON configuration: listen address, PSK credentials, optional backend,
//! optional metrics API and admission limits.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::credential::Credential;
use crate::error::{Error, Result};

/// Default secure listen port
pub const DEFAULT_LISTEN_PORT: u16 = 5684;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log configuration
    #[serde(default)]
    pub log: LogConfig,

    /// API configuration
    #[serde(default)]
    pub api: Option<ApiConfig>,

    /// Listening socket
    #[serde(default)]
    pub listen: ListenConfig,

    /// Where decrypted payloads go (none = discarded)
    #[serde(default)]
    pub backend: Option<BackendConfig>,

    /// PSK credentials; the first one is the initial credential
    #[serde(default)]
    pub credentials: Vec<PskConfig>,

    /// Session admission limits
    #[serde(default)]
    pub limits: LimitsConfig,
}

/// Log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Listen address for the metrics API (e.g., "127.0.0.1:9090")
    pub listen: String,
}

/// Listening socket configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListenConfig {
    #[serde(default = "default_listen_host")]
    pub host: String,

    #[serde(default = "default_listen_port")]
    pub port: u16,
}

fn default_listen_host() -> String {
    "::".to_string()
}

fn default_listen_port() -> u16 {
    DEFAULT_LISTEN_PORT
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: default_listen_host(),
            port: default_listen_port(),
        }
    }
}

/// Backend configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackendConfig {
    pub host: String,
    pub port: u16,
}

/// One PSK credential
#[derive(Clone, Serialize, Deserialize)]
pub struct PskConfig {
    pub identity: String,
    pub key: String,
}

impl std::fmt::Debug for PskConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PskConfig")
            .field("identity", &self.identity)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Admission limits
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum concurrent sessions (unset = unlimited)
    #[serde(default)]
    pub max_sessions: Option<usize>,
}

/// Options the proxy core is initialized with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyOptions {
    pub listen_host: String,
    pub listen_port: u16,
    pub backend: Option<BackendConfig>,
    pub max_sessions: Option<usize>,
}

impl ProxyOptions {
    /// Listen on `host:port`, discard plaintext, no session limit
    pub fn new(listen_host: impl Into<String>, listen_port: u16) -> Self {
        Self {
            listen_host: listen_host.into(),
            listen_port,
            backend: None,
            max_sessions: None,
        }
    }

    pub fn with_backend(mut self, host: impl Into<String>, port: u16) -> Self {
        self.backend = Some(BackendConfig {
            host: host.into(),
            port,
        });
        self
    }

    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = Some(max);
        self
    }
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;
        Self::from_json(&content)
    }

    /// Parse configuration from JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Serialize to pretty JSON
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))
    }

    /// Example server configuration
    pub fn default_server() -> Self {
        Config {
            log: LogConfig::default(),
            api: None,
            listen: ListenConfig::default(),
            backend: Some(BackendConfig {
                host: "127.0.0.1".to_string(),
                port: 5683,
            }),
            credentials: vec![PskConfig {
                identity: "Client_identity".to_string(),
                key: "secretPSK".to_string(),
            }],
            limits: LimitsConfig::default(),
        }
    }

    /// Check everything that can be checked without touching the network
    pub fn validate(&self) -> Result<()> {
        if self.credentials.is_empty() {
            return Err(Error::Config("At least one PSK credential is required".into()));
        }

        let mut seen = HashSet::new();
        for psk in &self.credentials {
            Credential::new(psk.identity.as_bytes(), psk.key.as_bytes())?;
            if !seen.insert(psk.identity.as_str()) {
                return Err(Error::Config(format!(
                    "Duplicate PSK identity: {}",
                    psk.identity
                )));
            }
        }

        if self.listen.host.is_empty() {
            return Err(Error::Config("Listen host must not be empty".into()));
        }

        if let Some(backend) = &self.backend {
            if backend.host.is_empty() || backend.port == 0 {
                return Err(Error::Config(format!(
                    "Invalid backend address: {}:{}",
                    backend.host, backend.port
                )));
            }
        }

        if self.limits.max_sessions == Some(0) {
            return Err(Error::Config("limits.max_sessions must be at least 1".into()));
        }

        Ok(())
    }

    /// Validated credentials, in configuration order
    pub fn credentials(&self) -> Result<Vec<Credential>> {
        self.credentials
            .iter()
            .map(|psk| Credential::new(psk.identity.as_bytes(), psk.key.as_bytes()))
            .collect()
    }

    pub fn proxy_options(&self) -> ProxyOptions {
        ProxyOptions {
            listen_host: self.listen.host.clone(),
            listen_port: self.listen.port,
            backend: self.backend.clone(),
            max_sessions: self.limits.max_sessions,
        }
    }
}

/// Split "host:port", "[v6]:port" or "v6-literal:port" into host and port
pub fn parse_host_port(s: &str) -> Result<(String, u16)> {
    if let Ok(addr) = s.parse::<std::net::SocketAddr>() {
        return Ok((addr.ip().to_string(), addr.port()));
    }

    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| Error::Config(format!("Invalid address (expected HOST:PORT): {}", s)))?;
    let port: u16 = port
        .parse()
        .map_err(|_| Error::Config(format!("Invalid port in address: {}", s)))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(Error::Config(format!("Missing host in address: {}", s)));
    }

    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_server_config_is_valid() {
        let config = Config::default_server();
        assert!(config.validate().is_ok());
        assert_eq!(config.credentials().unwrap().len(), 1);
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default_server();
        let json = config.to_json_pretty().unwrap();
        let parsed = Config::from_json(&json).unwrap();
        assert_eq!(parsed.listen, config.listen);
        assert_eq!(parsed.backend, config.backend);
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = Config::from_json(
            r#"{ "credentials": [ { "identity": "alice", "key": "k1" } ] }"#,
        )
        .unwrap();
        assert_eq!(config.listen.host, "::");
        assert_eq!(config.listen.port, DEFAULT_LISTEN_PORT);
        assert_eq!(config.log.level, "info");
        assert!(config.backend.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_credentials() {
        let mut config = Config::default_server();
        config.credentials.clear();
        assert!(config.validate().is_err());

        let mut config = Config::default_server();
        config.credentials.push(config.credentials[0].clone());
        assert!(config.validate().is_err());

        let mut config = Config::default_server();
        config.credentials[0].key.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_limit() {
        let mut config = Config::default_server();
        config.limits.max_sessions = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_proxy_options() {
        let mut config = Config::default_server();
        config.limits.max_sessions = Some(64);
        let options = config.proxy_options();
        assert_eq!(options.listen_port, DEFAULT_LISTEN_PORT);
        assert_eq!(options.max_sessions, Some(64));
        assert_eq!(options.backend.unwrap().port, 5683);
    }

    #[test]
    fn test_parse_host_port() {
        assert_eq!(
            parse_host_port("127.0.0.1:5684").unwrap(),
            ("127.0.0.1".to_string(), 5684)
        );
        assert_eq!(parse_host_port("[::1]:20220").unwrap(), ("::1".to_string(), 20220));
        assert_eq!(
            parse_host_port("localhost:5683").unwrap(),
            ("localhost".to_string(), 5683)
        );
        assert!(parse_host_port("localhost").is_err());
        assert!(parse_host_port(":5683").is_err());
        assert!(parse_host_port("host:notaport").is_err());
    }
}
