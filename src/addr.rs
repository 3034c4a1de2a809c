//! Address and request types shared by the resolution/rewrite pipeline.

use http::Method;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// A destination as requested by a client: either a name or a literal IP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestinationSpec {
    /// A fully qualified domain name that still needs resolving.
    Domain { fqdn: String, port: u16 },
    /// A literal IP destination.
    Ip(SocketAddr),
}

impl DestinationSpec {
    /// Builds a destination from a host string that may be an IP literal.
    ///
    /// Bracketed IPv6 hosts (`[::1]`) are accepted as they appear in URIs.
    pub fn from_host(host: &str, port: u16) -> Self {
        let bare = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        match bare.parse::<IpAddr>() {
            Ok(ip) => Self::Ip(SocketAddr::new(ip, port)),
            Err(_) => Self::Domain {
                fqdn: host.to_string(),
                port,
            },
        }
    }

    pub fn fqdn(&self) -> Option<&str> {
        match self {
            Self::Domain { fqdn, .. } => Some(fqdn),
            Self::Ip(_) => None,
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Self::Domain { .. } => None,
            Self::Ip(addr) => Some(addr.ip()),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Self::Domain { port, .. } => *port,
            Self::Ip(addr) => addr.port(),
        }
    }
}

impl fmt::Display for DestinationSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Domain { fqdn, port } => write!(f, "{}:{}", fqdn, port),
            Self::Ip(addr) => write!(f, "{}", addr),
        }
    }
}

/// The kind of request that produced a destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// SOCKS5 CONNECT or HTTP CONNECT.
    Connect,
    /// SOCKS5 BIND.
    Bind,
    /// SOCKS5 UDP ASSOCIATE.
    Associate,
    /// A plain (non-CONNECT) HTTP request.
    Http(Method),
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => f.write_str("Connect"),
            Self::Bind => f.write_str("Bind"),
            Self::Associate => f.write_str("Associate"),
            Self::Http(method) => f.write_str(method.as_str()),
        }
    }
}

/// Immutable metadata of the request being routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestMeta {
    pub command: Command,
    pub destination: DestinationSpec,
}

impl RequestMeta {
    pub fn new(command: Command, destination: DestinationSpec) -> Self {
        Self {
            command,
            destination,
        }
    }
}

/// A resolved destination flowing through the rewrite chain.
///
/// The name the address was resolved from is kept so that rewrite rules keyed
/// by hostname still match after resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAddr {
    pub fqdn: Option<String>,
    pub addr: SocketAddr,
}

impl ResolvedAddr {
    pub fn new(fqdn: Option<String>, addr: SocketAddr) -> Self {
        Self { fqdn, addr }
    }

    /// Returns the host part used to key rewrite rules: the FQDN if known,
    /// otherwise the literal IP.
    pub fn rule_host(&self) -> String {
        match &self.fqdn {
            Some(fqdn) => fqdn.clone(),
            None => self.addr.ip().to_string(),
        }
    }

    /// Replaces the target address, keeping the originating name.
    pub fn retarget(self, addr: SocketAddr) -> Self {
        Self {
            fqdn: self.fqdn,
            addr,
        }
    }
}

impl fmt::Display for ResolvedAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.fqdn {
            Some(fqdn) => write!(f, "{} ({})", self.addr, fqdn),
            None => write!(f, "{}", self.addr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_destination_from_host() {
        let dest = DestinationSpec::from_host("example.com", 443);
        assert_eq!(dest.fqdn(), Some("example.com"));
        assert_eq!(dest.ip(), None);
        assert_eq!(dest.port(), 443);

        let dest = DestinationSpec::from_host("10.0.0.1", 80);
        assert_eq!(dest.fqdn(), None);
        assert_eq!(dest.ip(), Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));

        let dest = DestinationSpec::from_host("[::1]", 8080);
        assert_eq!(dest.ip(), Some("::1".parse().unwrap()));
        assert_eq!(dest.to_string(), "[::1]:8080");
    }

    #[test]
    fn test_command_display() {
        assert_eq!(Command::Connect.to_string(), "Connect");
        assert_eq!(Command::Associate.to_string(), "Associate");
        assert_eq!(Command::Http(Method::GET).to_string(), "GET");
    }

    #[test]
    fn test_rule_host() {
        let addr: SocketAddr = "10.0.0.1:80".parse().unwrap();
        let resolved = ResolvedAddr::new(Some("a.com".to_string()), addr);
        assert_eq!(resolved.rule_host(), "a.com");

        let resolved = ResolvedAddr::new(None, addr);
        assert_eq!(resolved.rule_host(), "10.0.0.1");

        let moved = resolved.retarget("10.0.0.2:81".parse().unwrap());
        assert_eq!(moved.addr.port(), 81);
        assert_eq!(moved.fqdn, None);
    }
}
