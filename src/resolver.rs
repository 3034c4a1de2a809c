//! Name resolution with operator overrides ("DNS mangling").
//!
//! Resolution order:
//! 1. Override table (exact hostname match)
//! 2. Live DNS lookup through the system resolver, first address wins
//!
//! The override table is assembled with [`HostOverridesBuilder`] during
//! startup and frozen into [`HostOverrides`] before serving, so lookups need
//! no locking.

use crate::config::HostMapping;
use crate::error::{ProxyError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::net::lookup_host;
use tracing::{debug, trace};

/// Resolves a hostname to a single IP address.
///
/// This is the name-resolution hook consumed by both forwarding front-ends.
#[async_trait]
pub trait NameResolver: Send + Sync {
    async fn resolve(&self, name: &str) -> Result<IpAddr>;
}

/// Mutable override table, only available during configuration.
#[derive(Debug, Default)]
pub struct HostOverridesBuilder {
    hosts: HashMap<String, IpAddr>,
}

impl HostOverridesBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an override. A later registration for the same hostname
    /// replaces the earlier one.
    pub fn add_host(&mut self, hostname: &str, ip: &str) -> Result<()> {
        self.add_mapping(&HostMapping {
            hostname: hostname.to_string(),
            ip: ip.to_string(),
        })
    }

    /// Registers an override from a `hostname:ip` rule.
    pub fn add_rule(&mut self, rule: &str) -> Result<()> {
        self.add_mapping(&HostMapping::parse(rule)?)
    }

    /// Registers an override from a configuration file mapping.
    pub fn add_mapping(&mut self, mapping: &HostMapping) -> Result<()> {
        mapping.validate()?;
        if let Some(ip) = mapping.ip_addr() {
            self.hosts.insert(mapping.hostname.clone(), ip);
        }
        Ok(())
    }

    /// Freezes the table.
    pub fn build(self) -> HostOverrides {
        HostOverrides { hosts: self.hosts }
    }
}

/// Frozen hostname → IP override table.
#[derive(Debug, Clone, Default)]
pub struct HostOverrides {
    hosts: HashMap<String, IpAddr>,
}

impl HostOverrides {
    pub fn builder() -> HostOverridesBuilder {
        HostOverridesBuilder::new()
    }

    /// Exact-match lookup.
    pub fn get(&self, hostname: &str) -> Option<IpAddr> {
        self.hosts.get(hostname).copied()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, IpAddr)> {
        self.hosts.iter().map(|(host, ip)| (host.as_str(), *ip))
    }
}

/// Resolver that consults the override table before live DNS.
#[derive(Debug, Clone)]
pub struct DnsMangler {
    overrides: Arc<HostOverrides>,
}

impl DnsMangler {
    pub fn new(overrides: HostOverrides) -> Self {
        Self {
            overrides: Arc::new(overrides),
        }
    }

    pub fn overrides(&self) -> &HostOverrides {
        &self.overrides
    }

    /// Performs a live DNS lookup and returns the first address.
    pub async fn dns_resolve(name: &str) -> Result<IpAddr> {
        let mut addrs = lookup_host((name, 0))
            .await
            .map_err(|source| ProxyError::Resolve {
                name: name.to_string(),
                source,
            })?;

        addrs
            .next()
            .map(|addr| addr.ip())
            .ok_or_else(|| ProxyError::Resolve {
                name: name.to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "no addresses returned"),
            })
    }
}

#[async_trait]
impl NameResolver for DnsMangler {
    async fn resolve(&self, name: &str) -> Result<IpAddr> {
        if let Some(ip) = self.overrides.get(name) {
            debug!(hostname = %name, ip = %ip, "Resolved via override");
            return Ok(ip);
        }

        let ip = Self::dns_resolve(name).await?;
        trace!(hostname = %name, ip = %ip, "Resolved via DNS");
        Ok(ip)
    }
}
