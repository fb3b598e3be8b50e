//! # Configuration Management
//!
//! Centralized configuration for P7 servers and clients.
//!
//! This module provides structured configuration for listeners and connections,
//! including addresses, timeouts, handshake policy, frame options and logging.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - `P7_*` environment overrides via `from_env()`
//!
//! ## Security Considerations
//! - The default server policy requires ECDH key agreement and a SHA-256 trailer
//! - RSA keys below 1024 bits are rejected; 2048 is the default

use crate::error::{ProtocolError, Result};
use crate::utils::compression::Compression;
use crate::utils::crypto::CipherSuite;
use crate::utils::digest::Checksum;
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::Level;

pub use crate::spec::bootstrap::BOOTSTRAP_VERSION;

/// Max allowed payload size (16 MB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Smallest RSA modulus accepted for key transport
pub const MIN_RSA_KEY_BITS: usize = 1024;

/// Main network configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    /// Server-specific configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Client-specific configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Transport configuration
    #[serde(default)]
    pub transport: TransportConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse::<T>().ok())
}

impl NetworkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from `P7_*` environment variables on top of the defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("P7_SERVER_ADDRESS") {
            config.server.address = addr;
        }
        if let Ok(addr) = std::env::var("P7_CLIENT_ADDRESS") {
            config.client.address = addr;
        }
        if let Ok(path) = std::env::var("P7_SPEC_PATH") {
            config.server.spec_path = Some(PathBuf::from(path));
        }
        if let Some(val) = env_parse::<usize>("P7_MAX_CONNECTIONS") {
            config.server.max_connections = val;
        }
        if let Some(val) = env_parse::<u64>("P7_CONNECTION_TIMEOUT_MS") {
            config.server.connection_timeout = Duration::from_millis(val);
            config.client.connection_timeout = Duration::from_millis(val);
        }
        if let Some(val) = env_parse::<u64>("P7_RESPONSE_TIMEOUT_MS") {
            config.client.response_timeout = Duration::from_millis(val);
        }
        if let Ok(nick) = std::env::var("P7_NICK") {
            config.client.nick = nick;
        }
        if let Ok(level) = std::env::var("P7_LOG_LEVEL") {
            config.logging.log_level = level.parse::<Level>().map_err(|_| {
                ProtocolError::ConfigError(format!("Invalid P7_LOG_LEVEL: {level}"))
            })?;
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.client.validate());
        errors.extend(self.transport.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

fn validate_choice<T: PartialEq + std::fmt::Debug + Default>(
    what: &str,
    allowed: &[T],
    fallback: &T,
    errors: &mut Vec<String>,
) {
    if *fallback != T::default() && !allowed.contains(fallback) {
        errors.push(format!(
            "{what} fallback {fallback:?} is not in the allowed set {allowed:?}"
        ));
    }
}

/// Server-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Server listen address (e.g., "127.0.0.1:4871")
    pub address: String,

    /// Maximum number of concurrent connections
    pub max_connections: usize,

    /// Budget for the transport handshake of an accepted connection
    #[serde(with = "duration_serde")]
    pub connection_timeout: Duration,

    /// Timeout for graceful server shutdown
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,

    /// Reported in `wired.server_info`
    pub server_name: String,

    pub server_description: String,

    /// Application specification document layered over the bootstrap
    #[serde(default)]
    pub spec_path: Option<PathBuf>,

    /// Cipher suites a client may choose
    pub ciphers: Vec<CipherSuite>,

    /// Used when the client proposes something outside `ciphers`
    pub cipher_fallback: CipherSuite,

    pub compressions: Vec<Compression>,

    pub compression_fallback: Compression,

    pub checksums: Vec<Checksum>,

    pub checksum_fallback: Checksum,

    /// RSA modulus size for key transport suites
    pub rsa_key_bits: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:4871"),
            max_connections: 1000,
            connection_timeout: timeout::DEFAULT_TIMEOUT,
            shutdown_timeout: timeout::SHUTDOWN_TIMEOUT,
            server_name: String::from("P7 Server"),
            server_description: String::new(),
            spec_path: None,
            ciphers: vec![
                CipherSuite::EcdhAes256,
                CipherSuite::EcdhChaCha20,
                CipherSuite::RsaAes256,
                CipherSuite::RsaChaCha20,
            ],
            cipher_fallback: CipherSuite::EcdhAes256,
            compressions: vec![Compression::None, Compression::Deflate],
            compression_fallback: Compression::None,
            checksums: vec![Checksum::Sha1, Checksum::Sha256, Checksum::Sha512],
            checksum_fallback: Checksum::Sha256,
            rsa_key_bits: 2048,
        }
    }
}

impl ServerConfig {
    /// Validate server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Server address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid server address format: '{}' (expected format: '0.0.0.0:4871')",
                self.address
            ));
        }

        if self.connection_timeout.as_millis() < 100 {
            errors.push("Connection timeout too short (minimum: 100ms)".to_string());
        } else if self.connection_timeout.as_secs() > 300 {
            errors.push("Connection timeout too long (maximum: 300s)".to_string());
        }

        if self.shutdown_timeout.as_secs() < 1 {
            errors.push("Shutdown timeout too short (minimum: 1s)".to_string());
        } else if self.shutdown_timeout.as_secs() > 60 {
            errors.push("Shutdown timeout too long (maximum: 60s)".to_string());
        }

        if self.max_connections == 0 {
            errors.push("Max connections must be greater than 0".to_string());
        } else if self.max_connections > 100_000 {
            errors.push(format!(
                "Max connections very high: {} (ensure system resources can support this)",
                self.max_connections
            ));
        }

        if self.server_name.is_empty() {
            errors.push("Server name cannot be empty".to_string());
        }

        if let Some(path) = &self.spec_path {
            if !path.exists() {
                errors.push(format!(
                    "Specification file does not exist: {}",
                    path.display()
                ));
            }
        }

        validate_choice("Cipher", &self.ciphers, &self.cipher_fallback, &mut errors);
        validate_choice(
            "Compression",
            &self.compressions,
            &self.compression_fallback,
            &mut errors,
        );
        validate_choice(
            "Checksum",
            &self.checksums,
            &self.checksum_fallback,
            &mut errors,
        );

        if self.rsa_key_bits < MIN_RSA_KEY_BITS {
            errors.push(format!(
                "RSA key too small: {} bits (minimum: {MIN_RSA_KEY_BITS})",
                self.rsa_key_bits
            ));
        }

        errors
    }
}

/// Client-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Target server address
    pub address: String,

    /// Budget for TCP connect plus the whole login sequence
    #[serde(with = "duration_serde")]
    pub connection_timeout: Duration,

    /// Timeout for waiting for response messages
    #[serde(with = "duration_serde")]
    pub response_timeout: Duration,

    /// Reported in `wired.client_info`
    pub application_name: String,

    pub application_version: String,

    pub nick: String,

    pub status: String,

    /// Proposed in the client handshake; `none` omits the field
    pub cipher: CipherSuite,

    pub compression: Compression,

    pub checksum: Checksum,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:4871"),
            connection_timeout: timeout::DEFAULT_TIMEOUT,
            response_timeout: timeout::RESPONSE_TIMEOUT,
            application_name: String::from(env!("CARGO_PKG_NAME")),
            application_version: String::from(env!("CARGO_PKG_VERSION")),
            nick: String::from("Unnamed"),
            status: String::new(),
            cipher: CipherSuite::EcdhAes256,
            compression: Compression::Deflate,
            checksum: Checksum::Sha256,
        }
    }
}

impl ClientConfig {
    /// Validate client configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        match self.address.rsplit_once(':') {
            _ if self.address.is_empty() => {
                errors.push("Client address cannot be empty".to_string());
            }
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {}
            _ => errors.push(format!(
                "Invalid client address format: '{}' (expected format: 'example.com:4871')",
                self.address
            )),
        }

        if self.connection_timeout.as_millis() < 100 {
            errors.push("Connection timeout too short (minimum: 100ms)".to_string());
        }

        if self.response_timeout.as_millis() < 100 {
            errors.push("Response timeout too short (minimum: 100ms)".to_string());
        }

        if self.application_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        }

        if self.nick.is_empty() {
            errors.push("Nick cannot be empty".to_string());
        }

        errors
    }
}

/// Transport configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Maximum allowed payload size in bytes
    pub max_payload_size: usize,

    /// Deflate level (0-9) once compression is negotiated
    pub compression_level: u32,

    /// Bounded wait of a single socket read
    #[serde(with = "duration_serde")]
    pub poll_interval: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_payload_size: MAX_PAYLOAD_SIZE,
            compression_level: crate::utils::compression::DEFAULT_LEVEL,
            poll_interval: timeout::POLL_INTERVAL,
        }
    }
}

impl TransportConfig {
    /// Validate transport configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_payload_size == 0 {
            errors.push("Max payload size cannot be 0".to_string());
        } else if self.max_payload_size < 1024 {
            errors.push("Max payload size too small (minimum: 1 KB)".to_string());
        } else if self.max_payload_size > 100 * 1024 * 1024 {
            errors.push(format!(
                "Max payload size too large: {} bytes (maximum recommended: 100 MB)",
                self.max_payload_size
            ));
        }

        if self.compression_level > 9 {
            errors.push(format!(
                "Invalid compression level: {} (valid range: 0-9)",
                self.compression_level
            ));
        }

        if self.poll_interval.as_millis() < 10 {
            errors.push("Poll interval too short (minimum: 10ms)".to_string());
        } else if self.poll_interval.as_secs() > 5 {
            errors.push("Poll interval too long (maximum: 5s)".to_string());
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("p7-protocol"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = std::path::Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        level.as_str().to_lowercase().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = NetworkConfig::default();
        assert!(config.validate().is_empty(), "{:?}", config.validate());
    }

    #[test]
    fn test_toml_roundtrip_keeps_policy() {
        let config = NetworkConfig::default_with_overrides(|c| {
            c.server.ciphers = vec![CipherSuite::RsaChaCha20];
            c.server.cipher_fallback = CipherSuite::RsaChaCha20;
            c.client.checksum = Checksum::Sha512;
        });
        let text = toml::to_string_pretty(&config).unwrap();
        assert!(text.contains("rsa_chacha20"));
        let parsed = NetworkConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.server.ciphers, vec![CipherSuite::RsaChaCha20]);
        assert_eq!(parsed.client.checksum, Checksum::Sha512);
        assert_eq!(parsed.transport.poll_interval, timeout::POLL_INTERVAL);
    }

    #[test]
    fn test_fallback_must_be_allowed() {
        let config = NetworkConfig::default_with_overrides(|c| {
            c.server.checksums = vec![Checksum::Sha1];
            c.server.checksum_fallback = Checksum::Sha512;
        });
        let errors = config.validate();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("Checksum fallback"));
    }
}
