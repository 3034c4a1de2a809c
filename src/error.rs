//! Error types for the mangle-proxy application.
//!
//! Configuration errors are fatal at startup. Everything else is a
//! per-request failure that the forwarding layer turns into a client-visible
//! response.

use std::io;
use thiserror::Error;

/// Main error type for the mangle-proxy application.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Configuration file could not be found.
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// Configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ConfigParse { message: String },

    /// Configuration validation failed.
    #[error("Invalid configuration: {message}")]
    ConfigValidation { message: String },

    /// A `hostname:ip` resolve rule is malformed.
    #[error("Invalid resolve value {rule:?}: {reason}")]
    InvalidResolveRule { rule: String, reason: String },

    /// A rewrite rule is malformed.
    #[error("Failed to parse rewrite {rule:?}: {reason}")]
    InvalidRewriteRule { rule: String, reason: String },

    /// Live name resolution failed.
    #[error("Failed to resolve {name}: {source}")]
    Resolve {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Outbound TCP dial failed or timed out.
    #[error("Failed to dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The client connection could not be taken over for tunneling.
    #[error("Connection upgrade not supported: {message}")]
    Upgrade { message: String },

    /// Outbound HTTP round-trip failed.
    #[error("Upstream request failed: {message}")]
    Transport { message: String },

    /// The SOCKS5 engine reported a failure.
    #[error("SOCKS5 error: {message}")]
    Socks { message: String },

    /// I/O error wrapper.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProxyError {
    /// Creates a new configuration parse error.
    pub fn config_parse(message: impl Into<String>) -> Self {
        Self::ConfigParse {
            message: message.into(),
        }
    }

    /// Creates a new configuration validation error.
    pub fn config_validation(message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            message: message.into(),
        }
    }

    pub fn invalid_resolve(rule: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidResolveRule {
            rule: rule.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_rewrite(rule: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRewriteRule {
            rule: rule.into(),
            reason: reason.into(),
        }
    }

    /// Returns true for errors that must stop the process before serving.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigNotFound { .. }
                | Self::ConfigParse { .. }
                | Self::ConfigValidation { .. }
                | Self::InvalidResolveRule { .. }
                | Self::InvalidRewriteRule { .. }
        )
    }
}

/// Result type alias using ProxyError.
pub type Result<T> = std::result::Result<T, ProxyError>;
