//! WolfLink Configuration
//!
//! Two layers live here. `WolfLinkConfig` is the TOML file the daemon is
//! started with. `TunnelConfiguration` is the validated, immutable value a
//! session is started with; it is produced by a single fallible constructor
//! from the file's `[tunnel]` record plus a credential lookup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::credentials::CredentialStore;
use crate::crypto::SymmetricKey;
use crate::error::{Error, Result};

/// Main WolfLink configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WolfLinkConfig {
    /// Remote endpoint and account
    #[serde(default)]
    pub tunnel: ProtocolConfiguration,

    /// Where passwords are looked up
    #[serde(default)]
    pub credentials: CredentialsConfig,

    /// Session tuning
    #[serde(default)]
    pub session: SessionConfig,

    /// Local virtual interface
    #[serde(default)]
    pub interface: InterfaceConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// The protocol-configuration record a tunnel is provisioned with
///
/// Every field is optional on disk; absence is reported by
/// [`TunnelConfiguration::from_protocol`], not by the TOML parser.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProtocolConfiguration {
    /// Remote endpoint as `host:port`
    #[serde(default)]
    pub server_address: Option<String>,

    /// Account name, also the credential lookup key
    #[serde(default)]
    pub username: Option<String>,
}

/// Credential store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    /// TOML file of `username = "password"` entries
    #[serde(default = "default_credentials_file")]
    pub file: PathBuf,
}

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// How long to wait for the server's authentication response
    #[serde(default = "default_auth_timeout_ms")]
    pub auth_timeout_ms: u64,

    /// Pre-shared key file (base64); the built-in key is used when unset
    #[serde(default)]
    pub key_file: Option<PathBuf>,
}

/// Virtual interface configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceConfig {
    /// TUN interface name
    #[serde(default = "default_interface")]
    pub name: String,

    /// MTU for the TUN interface
    #[serde(default = "default_mtu")]
    pub mtu: u16,

    /// Local tunnel address, if the server does not assign one
    #[serde(default)]
    pub address: Option<String>,

    /// Destinations routed through the tunnel (CIDR)
    #[serde(default)]
    pub routes: Vec<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_credentials_file() -> PathBuf {
    PathBuf::from("/etc/wolflink/credentials.toml")
}

fn default_auth_timeout_ms() -> u64 {
    10_000
}

fn default_interface() -> String {
    "wolflink0".to_string()
}

fn default_mtu() -> u16 {
    1400
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            file: default_credentials_file(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auth_timeout_ms: default_auth_timeout_ms(),
            key_file: None,
        }
    }
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            name: default_interface(),
            mtu: default_mtu(),
            address: None,
            routes: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl WolfLinkConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> Result<Self> {
        let config: WolfLinkConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the parts of the configuration the tunnel record does not cover
    pub fn validate(&self) -> Result<()> {
        if self.session.auth_timeout_ms == 0 {
            return Err(Error::ConfigurationInvalid(
                "session.auth_timeout_ms must be greater than zero".into(),
            ));
        }

        if self.interface.name.is_empty() || self.interface.name.len() > 15 {
            return Err(Error::ConfigurationInvalid(
                "interface.name must be 1-15 characters".into(),
            ));
        }

        if self.interface.mtu < 576 {
            return Err(Error::ConfigurationInvalid(format!(
                "interface.mtu {} is below the IPv4 minimum of 576",
                self.interface.mtu
            )));
        }

        Ok(())
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Internal(format!("cannot serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the authentication timeout as Duration
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.session.auth_timeout_ms)
    }

    /// Load the configured pre-shared key, falling back to the built-in one
    pub fn load_key(&self) -> Result<SymmetricKey> {
        match &self.session.key_file {
            Some(path) => SymmetricKey::load(path),
            None => Ok(SymmetricKey::builtin()),
        }
    }
}

/// Validated settings for one session
#[derive(Clone, PartialEq, Eq)]
pub struct TunnelConfiguration {
    pub hostname: String,
    pub port: String,
    pub username: String,
    pub password: String,
}

impl TunnelConfiguration {
    /// Build a configuration from a protocol record and a credential lookup
    ///
    /// Fails with `ConfigurationInvalid` when the server address is missing
    /// or not exactly `host:port`, the username is missing, or the store has
    /// no password for that username.
    pub fn from_protocol(
        protocol: &ProtocolConfiguration,
        credentials: &dyn CredentialStore,
    ) -> Result<Self> {
        let server_address = protocol
            .server_address
            .as_deref()
            .ok_or_else(|| Error::ConfigurationInvalid("tunnel.server_address is missing".into()))?;
        let (hostname, port) = split_host_port(server_address)?;

        let username = protocol
            .username
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| Error::ConfigurationInvalid("tunnel.username is missing".into()))?;

        let password = credentials.password(username).ok_or_else(|| {
            Error::ConfigurationInvalid(format!("no password stored for user '{}'", username))
        })?;

        Ok(Self {
            hostname,
            port,
            username: username.to_string(),
            password,
        })
    }

    /// The remote endpoint as `host:port`
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

impl std::fmt::Debug for TunnelConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelConfiguration")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Split `host:port` on its single `:` separator
fn split_host_port(address: &str) -> Result<(String, String)> {
    let parts: Vec<&str> = address.trim().split(':').collect();
    if parts.len() != 2 {
        return Err(Error::ConfigurationInvalid(format!(
            "server address '{}' must be host:port",
            address
        )));
    }

    let (host, port) = (parts[0], parts[1]);
    if host.is_empty() {
        return Err(Error::ConfigurationInvalid(format!(
            "server address '{}' has an empty host",
            address
        )));
    }
    match port.parse::<u16>() {
        Ok(p) if p != 0 => {}
        _ => {
            return Err(Error::ConfigurationInvalid(format!(
                "server address '{}' has an invalid port",
                address
            )))
        }
    }

    Ok((host.to_string(), port.to_string()))
}
