//! Configuration loading and default-skeleton generation.
//!
//! The config lives at `./sbrwxmpp.toml`. When it is missing on startup the
//! binary writes a commented skeleton with a freshly generated API key and
//! loads that.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::token;

/// Default config path, relative to the working directory.
pub const DEFAULT_PATH: &str = "./sbrwxmpp.toml";

const DEFAULT_CONFIG: &str = r#"# Remove localhost to make the server listen publicly
addr = "localhost:5222"
# cert = "cert.pem"
# certkey = "key.pem"

# Change domain to the public address of the server
domain = "localhost"

[api]
addr = "localhost:8087"
key = "<<APIKEY>>"
"#;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// XMPP listen address, e.g. "localhost:5222".
    #[serde(default)]
    pub addr: String,
    /// PEM certificate path; a self-signed cert is generated when empty.
    #[serde(default)]
    pub cert: String,
    /// PEM private key path.
    #[serde(default)]
    pub certkey: String,
    /// The XMPP domain this server answers for.
    #[serde(default)]
    pub domain: String,
    /// Admin HTTP API configuration.
    #[serde(default)]
    pub api: ApiConfig,
    /// Command webhook configuration.
    #[serde(default)]
    pub webhook: WebhookConfig,
    /// Per-category logging destinations.
    #[serde(default)]
    pub logging: HashMap<String, LoggingCategory>,
}

/// Admin HTTP API configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ApiConfig {
    /// API listen address.
    #[serde(default)]
    pub addr: String,
    /// Static bearer token; compared verbatim against `Authorization`.
    #[serde(default)]
    pub key: String,
}

/// Command webhook configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct WebhookConfig {
    /// Target URL for `/`-prefixed chat commands. Empty disables the hook.
    #[serde(default)]
    pub target: String,
    /// Secret sent verbatim in the `Authorization` header.
    #[serde(default)]
    pub secret: String,
}

/// A logging category's output destination.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingCategory {
    #[serde(default)]
    pub destination: String,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Write the default skeleton with a freshly generated API key.
    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<(), ConfigError> {
        let skeleton = DEFAULT_CONFIG.replace("<<APIKEY>>", &token::secure(token::API_KEY_LEN));
        std::fs::write(path, skeleton)?;
        Ok(())
    }
}
