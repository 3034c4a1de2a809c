//! Destination rewrite rules.
//!
//! A rule has the form `host-or-ip:srcPort[-srcPortEnd]:dstIP[:dstPort]`.
//! Port ranges are expanded into one table entry per source port when the
//! rule is registered, with source and destination ports advancing in
//! lockstep. The table is built with [`RewriteRulesBuilder`] and frozen into
//! a [`RewriteRuleTable`] before serving.

use crate::error::{ProxyError, Result};
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Expected rule syntax, reported in parse errors.
pub const RULE_FORMAT: &str = "(IP|FQDN):PORT[-PORT]:IP[:PORT]";

/// Table key: the requested host (FQDN or literal IP) and port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleKey {
    pub host: String,
    pub port: u16,
}

impl RuleKey {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A single parsed rule, before range expansion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteRule {
    pub host: String,
    pub src_begin: u16,
    pub src_end: u16,
    pub dst_ip: IpAddr,
    /// Destination port for `src_begin`; `None` keeps the source port.
    pub dst_port: Option<u16>,
}

impl RewriteRule {
    /// Parses a rule string.
    pub fn parse(rule: &str) -> Result<Self> {
        let fields: Vec<&str> = rule.split(':').collect();
        if fields.len() != 3 && fields.len() != 4 {
            return Err(ProxyError::invalid_rewrite(
                rule,
                format!("invalid format, should be {}", RULE_FORMAT),
            ));
        }

        let host = fields[0];
        if host.is_empty() {
            return Err(ProxyError::invalid_rewrite(rule, "empty source host"));
        }

        let (src_begin, src_end) = match fields[1].split_once('-') {
            Some((begin, end)) => (parse_port(rule, begin)?, parse_port(rule, end)?),
            None => {
                let port = parse_port(rule, fields[1])?;
                (port, port)
            }
        };
        if src_end < src_begin {
            return Err(ProxyError::invalid_rewrite(
                rule,
                format!("port range end {} is before start {}", src_end, src_begin),
            ));
        }

        let dst_ip: IpAddr = fields[2].parse().map_err(|_| {
            ProxyError::invalid_rewrite(rule, format!("invalid destination IP {:?}", fields[2]))
        })?;

        let dst_port = match fields.get(3) {
            Some(port) => {
                let port = parse_port(rule, port)?;
                if u32::from(port) + u32::from(src_end - src_begin) > u32::from(u16::MAX) {
                    return Err(ProxyError::invalid_rewrite(
                        rule,
                        "destination port range exceeds 65535",
                    ));
                }
                Some(port)
            }
            None => None,
        };

        Ok(Self {
            host: host.to_string(),
            src_begin,
            src_end,
            dst_ip,
            dst_port,
        })
    }

    /// Expands the rule into `(key, destination)` table entries.
    pub fn entries(&self) -> impl Iterator<Item = (RuleKey, SocketAddr)> + '_ {
        (self.src_begin..=self.src_end).map(move |src| {
            let offset = src - self.src_begin;
            let dst = match self.dst_port {
                Some(port) => port + offset,
                None => src,
            };
            (
                RuleKey::new(self.host.as_str(), src),
                SocketAddr::new(self.dst_ip, dst),
            )
        })
    }
}

fn parse_port(rule: &str, value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .map_err(|e| ProxyError::invalid_rewrite(rule, format!("invalid port {:?}: {}", value, e)))
}

/// Mutable rule table, only available during configuration.
#[derive(Debug, Default)]
pub struct RewriteRulesBuilder {
    rules: HashMap<RuleKey, SocketAddr>,
}

impl RewriteRulesBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses and registers a rule. Entries with an existing key are
    /// overwritten. A rule that fails to parse leaves the table untouched.
    pub fn add_rule(&mut self, rule: &str) -> Result<()> {
        let parsed = RewriteRule::parse(rule)?;
        self.rules.extend(parsed.entries());
        Ok(())
    }

    /// Freezes the table.
    pub fn build(self) -> RewriteRuleTable {
        RewriteRuleTable { rules: self.rules }
    }
}

/// Frozen `(host, port)` → destination table.
#[derive(Debug, Clone, Default)]
pub struct RewriteRuleTable {
    rules: HashMap<RuleKey, SocketAddr>,
}

impl RewriteRuleTable {
    pub fn builder() -> RewriteRulesBuilder {
        RewriteRulesBuilder::new()
    }

    /// Builds a table from a list of rule strings, failing on the first
    /// malformed rule.
    pub fn from_rules<S: AsRef<str>>(rules: &[S]) -> Result<Self> {
        let mut builder = Self::builder();
        for rule in rules {
            builder.add_rule(rule.as_ref())?;
        }
        Ok(builder.build())
    }

    pub fn lookup(&self, host: &str, port: u16) -> Option<SocketAddr> {
        self.rules.get(&RuleKey::new(host, port)).copied()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Entries in key order.
    pub fn entries(&self) -> Vec<(&RuleKey, SocketAddr)> {
        let mut entries: Vec<_> = self.rules.iter().map(|(k, v)| (k, *v)).collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries
    }
}
