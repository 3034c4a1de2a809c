//! Configuration management for the mangle-proxy application.
//!
//! Configuration comes from an optional YAML file merged with command-line
//! flags. It is loaded and validated once at startup; the tables built from
//! it are frozen for the lifetime of the process.

use crate::error::{ProxyError, Result};
use crate::rules::RewriteRule;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Which forwarding front-end is active.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    /// SOCKS5 proxy, protocol handled by the SOCKS5 engine.
    #[default]
    Socks5,
    /// HTTP proxy with CONNECT tunneling.
    Http,
}

impl fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Socks5 => f.write_str("SOCKS5"),
            Self::Http => f.write_str("HTTP"),
        }
    }
}

/// Server configuration section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address and port to listen on.
    pub listen: String,

    /// Proxy protocol spoken to clients.
    pub mode: ProxyMode,

    /// Outbound connect timeout in seconds.
    pub connect_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8000".to_string(),
            mode: ProxyMode::Socks5,
            connect_timeout: 10,
        }
    }
}

impl ServerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }
}

/// Log output format.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable pretty format.
    #[default]
    Pretty,
    /// Compact single-line format.
    Compact,
    /// JSON format for structured logging.
    Json,
}

/// Logging configuration section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    pub level: String,

    /// Output destination: stdout, stderr, or file path.
    pub output: String,

    /// Log format.
    pub format: LogFormat,

    /// Include target (module path) in logs.
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            output: "stderr".to_string(),
            format: LogFormat::Compact,
            include_target: false,
        }
    }
}

/// Single hostname override entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostMapping {
    /// The hostname to match (exact match).
    pub hostname: String,

    /// The IP address to resolve to.
    pub ip: String,
}

impl HostMapping {
    /// Parses a `hostname:ip` rule, splitting at the first `:` so that the
    /// IP may be IPv6.
    pub fn parse(rule: &str) -> Result<Self> {
        let (hostname, ip) = rule
            .split_once(':')
            .ok_or_else(|| ProxyError::invalid_resolve(rule, "should be in \"host:ip\" format"))?;

        let mapping = Self {
            hostname: hostname.to_string(),
            ip: ip.to_string(),
        };
        mapping.validate()?;
        Ok(mapping)
    }

    /// Validates the host mapping.
    pub fn validate(&self) -> Result<()> {
        let rule = format!("{}:{}", self.hostname, self.ip);

        if self.hostname.is_empty() {
            return Err(ProxyError::invalid_resolve(rule, "hostname cannot be empty"));
        }

        self.ip.parse::<IpAddr>().map_err(|_| {
            ProxyError::invalid_resolve(rule, format!("failed to parse ip: {:?}", self.ip))
        })?;

        Ok(())
    }

    /// Returns the parsed IP address.
    pub fn ip_addr(&self) -> Option<IpAddr> {
        self.ip.parse().ok()
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Server configuration.
    pub server: ServerConfig,

    /// Logging configuration.
    pub logging: LoggingConfig,

    /// Hostname overrides.
    pub host_mappings: Vec<HostMapping>,

    /// Destination rewrite rules, `(IP|FQDN):PORT[-PORT]:IP[:PORT]`.
    pub rewrite: Vec<String>,

    /// Record every request through the access-log rewrite stage.
    pub access_log: bool,
}

impl AppConfig {
    /// Loads configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ProxyError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }

        let contents = fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parses and validates configuration from a YAML document.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: AppConfig =
            serde_yaml::from_str(contents).map_err(|e| ProxyError::config_parse(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }

    /// Appends `hostname:ip` resolve rules and rewrite rules given on the
    /// command line.
    pub fn add_rules<S: AsRef<str>>(&mut self, resolve: &[S], rewrite: &[S]) -> Result<()> {
        for rule in resolve {
            self.host_mappings.push(HostMapping::parse(rule.as_ref())?);
        }
        for rule in rewrite {
            RewriteRule::parse(rule.as_ref())?;
            self.rewrite.push(rule.as_ref().to_string());
        }
        Ok(())
    }

    /// Returns the parsed listen address.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.server.listen.parse().map_err(|_| {
            ProxyError::config_validation(format!(
                "Invalid listen address: {}",
                self.server.listen
            ))
        })
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.server.listen.is_empty() {
            return Err(ProxyError::config_validation(
                "Server listen address cannot be empty",
            ));
        }
        self.listen_addr()?;

        if self.server.connect_timeout == 0 {
            return Err(ProxyError::config_validation(
                "Connect timeout must be at least one second",
            ));
        }

        for mapping in &self.host_mappings {
            mapping.validate()?;
        }

        for rule in &self.rewrite {
            RewriteRule::parse(rule)?;
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ProxyError::config_validation(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                self.logging.level, valid_levels
            )));
        }

        Ok(())
    }
}
