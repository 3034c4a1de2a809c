//! Server assembly: builds the frozen tables and the rewrite chain from the
//! configuration, then runs the front-end selected by the mode.

use crate::config::{AppConfig, ProxyMode};
use crate::error::Result;
use crate::pipeline::Pipeline;
use crate::proxy::ConnectionForwarder;
use crate::resolver::{DnsMangler, HostOverrides};
use crate::rewrite::{AccessLogStage, RewriteChain, RuleTableStage};
use crate::rules::RewriteRuleTable;
use crate::socks::SocksFrontend;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// A fully configured proxy, ready to accept connections.
pub struct ProxyServer {
    config: AppConfig,
    pipeline: Pipeline,
}

impl ProxyServer {
    /// Builds the override table, rule table and rewrite chain.
    ///
    /// Any malformed rule is returned as a configuration error; nothing is
    /// bound until this succeeds.
    pub fn from_config(config: AppConfig) -> Result<Self> {
        config.validate()?;

        let overrides = build_overrides(&config)?;
        let rules = RewriteRuleTable::from_rules(&config.rewrite)?;
        for (key, target) in rules.entries() {
            info!(requested = %key, target = %target, "Will rewrite");
        }

        let chain = build_rewrite_chain(rules, config.access_log);
        let pipeline = Pipeline::new(Arc::new(DnsMangler::new(overrides)), Arc::new(chain));

        Ok(Self { config, pipeline })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Binds the configured listen address.
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr: SocketAddr = self.config.listen_addr()?;
        Ok(TcpListener::bind(addr).await?)
    }

    /// Binds the configured address and serves on it.
    pub async fn run(self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serves connections from an already bound listener.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let mode = self.config.server.mode;
        let connect_timeout = self.config.server.connect_timeout();

        info!(
            listen = %listener.local_addr()?,
            mode = %mode,
            "Start listening"
        );

        match mode {
            ProxyMode::Socks5 => {
                SocksFrontend::new(self.pipeline, connect_timeout)
                    .serve(listener)
                    .await
            }
            ProxyMode::Http => {
                ConnectionForwarder::new(self.pipeline, connect_timeout)
                    .serve(listener)
                    .await
            }
        }
    }
}

/// Builds the frozen override table from the configured host mappings.
pub fn build_overrides(config: &AppConfig) -> Result<HostOverrides> {
    let mut builder = HostOverrides::builder();
    for mapping in &config.host_mappings {
        builder.add_mapping(mapping)?;
    }

    let overrides = builder.build();
    for (hostname, ip) in overrides.iter() {
        info!(hostname = %hostname, ip = %ip, "Will resolve");
    }
    Ok(overrides)
}

/// Assembles the rewrite chain: the rule table stage (when there are rules)
/// followed by the access-log stage (when enabled), so that access records
/// show the rewritten destination.
pub fn build_rewrite_chain(rules: RewriteRuleTable, access_log: bool) -> RewriteChain {
    let mut builder = RewriteChain::builder();
    if !rules.is_empty() {
        builder = builder.stage(RuleTableStage::new(rules));
    }
    if access_log {
        builder = builder.stage(AccessLogStage);
    }
    builder.build()
}
