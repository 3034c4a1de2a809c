//! # Mangle Proxy Library
//!
//! This crate decides, for every proxied connection, which endpoint the
//! traffic really reaches. Two overrides are applied before any outbound
//! connection is made:
//!
//! - **DNS mangling**: hostnames with a configured override resolve to that
//!   IP instead of going through live DNS
//! - **Destination rewriting**: an ordered chain of stages may remap the
//!   resolved `(host, port)` to another `IP:port`, including port ranges
//!
//! ## Modules
//!
//! - [`addr`]: Destination and request types
//! - [`config`]: Configuration loading and validation
//! - [`error`]: Error types and handling
//! - [`logging`]: Logging setup and configuration
//! - [`pipeline`]: Resolution followed by rewriting, per request
//! - [`proxy`]: HTTP-mode forwarding (CONNECT tunnels and plain requests)
//! - [`resolver`]: Override table and name resolution
//! - [`rewrite`]: Rewrite stages and the rewrite chain
//! - [`rules`]: Rewrite rule parsing and the rule table
//! - [`server`]: Assembly of the pipeline and the listener
//! - [`socks`]: SOCKS5-mode front-end
//!
//! ## Example
//!
//! ```ignore
//! use mangle_proxy::config::AppConfig;
//! use mangle_proxy::server::ProxyServer;
//!
//! let mut config = AppConfig::default();
//! config.add_rules(&["example.com:10.0.0.1"], &["example.com:443:10.0.0.2:8443"])?;
//!
//! ProxyServer::from_config(config)?.run().await?;
//! ```
//!
//! ## Request Flow
//!
//! 1. **Resolve**: override table first, then live DNS (IP literals skip this)
//! 2. **Rewrite**: every chain stage in registration order
//! 3. **Connect**: the final `IP:port` is dialed by the active front-end

pub mod addr;
pub mod config;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod proxy;
pub mod resolver;
pub mod rewrite;
pub mod rules;
pub mod server;
pub mod socks;

pub use addr::{Command, DestinationSpec, RequestMeta, ResolvedAddr};
pub use config::{AppConfig, HostMapping, ProxyMode};
pub use error::{ProxyError, Result};
pub use pipeline::Pipeline;
pub use proxy::ConnectionForwarder;
pub use resolver::{DnsMangler, HostOverrides, NameResolver};
pub use rewrite::{AccessLogStage, AddressRewriter, RewriteChain, RuleTableStage};
pub use rules::{RewriteRule, RewriteRuleTable};
pub use server::ProxyServer;
pub use socks::SocksFrontend;
