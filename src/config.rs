//! Server configuration
//!
//! The daemon reads a single TOML document. Every key is optional:
//!
//! ```toml
//! server_name = "localhost"
//! listen = "0.0.0.0"
//! port = 2001
//! workers = 4
//! timeout = 15
//! keep_alive_timeout = 5
//! deny = ["/.git"]
//! services_root = "/usr/lib/monkey/services"
//!
//! [[vhost]]
//! name = "example.com"
//! aliases = ["www.example.com"]
//! services = ["blog", "shop"]
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Index of a virtual host in [`ServerConfig::vhosts`]
///
/// Host matching in the Duda layer compares these ids, never names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostId(pub usize);

/// One virtual host and the web services bound to it
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VhostConfig {
    pub name: String,
    pub aliases: Vec<String>,
    /// Application names, each loaded from `<services_root>/<name>.duda`
    pub services: Vec<String>,
}

impl VhostConfig {
    fn matches(&self, host: &str) -> bool {
        self.name.eq_ignore_ascii_case(host)
            || self.aliases.iter().any(|a| a.eq_ignore_ascii_case(host))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host name used for HTTP/1.0 requests without a Host header
    pub server_name: String,
    pub listen: String,
    /// Standard port, assumed when the Host header has none
    pub port: u16,
    pub workers: usize,
    /// Seconds to wait for the first request on a connection
    pub timeout: u64,
    /// Seconds to wait for a follow-up request on a persistent connection
    pub keep_alive_timeout: u64,
    /// Seconds between reads once a POST request line was seen
    pub post_timeout: u64,
    pub max_request_size: usize,
    pub max_recv_times: usize,
    /// URI fragments answered with 403
    pub deny: Vec<String>,
    pub services_root: PathBuf,
    /// Positional parameters allowed after `/<app>/<interface>/<method>`
    pub max_params: usize,
    #[serde(rename = "vhost")]
    pub vhosts: Vec<VhostConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            server_name: "localhost".to_string(),
            listen: "0.0.0.0".to_string(),
            port: 2001,
            workers: 4,
            timeout: 15,
            keep_alive_timeout: 5,
            post_timeout: 10,
            max_request_size: 32 * 1024,
            max_recv_times: 10_000,
            deny: Vec::new(),
            services_root: PathBuf::from("services"),
            max_params: 8,
            vhosts: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Parse a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: ServerConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".to_string()));
        }
        if self.max_request_size < 16 {
            return Err(ConfigError::Invalid("max_request_size is too small".to_string()));
        }
        Ok(())
    }

    /// Resolve a Host value to a virtual host
    ///
    /// Unknown or absent hosts fall back to the first virtual host.
    pub fn find_vhost(&self, host: Option<&str>) -> Option<HostId> {
        host.and_then(|h| self.vhosts.iter().position(|v| v.matches(h)))
            .or_else(|| (!self.vhosts.is_empty()).then_some(0))
            .map(HostId)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn keep_alive_timeout(&self) -> Duration {
        Duration::from_secs(self.keep_alive_timeout)
    }

    pub fn post_timeout(&self) -> Duration {
        Duration::from_secs(self.post_timeout)
    }
}
