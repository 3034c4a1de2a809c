//! Per-request routing: name resolution followed by the rewrite chain.

use crate::addr::{DestinationSpec, RequestMeta, ResolvedAddr};
use crate::error::Result;
use crate::resolver::NameResolver;
use crate::rewrite::AddressRewriter;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::trace;

/// Shared, read-only routing pipeline used by every connection task.
#[derive(Clone)]
pub struct Pipeline {
    resolver: Arc<dyn NameResolver>,
    rewriter: Arc<dyn AddressRewriter>,
}

impl Pipeline {
    pub fn new(resolver: Arc<dyn NameResolver>, rewriter: Arc<dyn AddressRewriter>) -> Self {
        Self { resolver, rewriter }
    }

    /// Resolves the request's destination and runs the rewrite chain on it.
    ///
    /// Literal IP destinations skip resolution. A resolution failure is
    /// returned before any rewrite stage runs.
    pub async fn route(&self, request: &RequestMeta) -> Result<ResolvedAddr> {
        let resolved = match &request.destination {
            DestinationSpec::Domain { fqdn, port } => {
                let ip = self.resolver.resolve(fqdn).await?;
                ResolvedAddr::new(Some(fqdn.clone()), SocketAddr::new(ip, *port))
            }
            DestinationSpec::Ip(addr) => ResolvedAddr::new(None, *addr),
        };

        let routed = self.rewriter.rewrite(request, resolved);
        trace!(
            command = %request.command,
            requested = %request.destination,
            target = %routed.addr,
            "Routed request"
        );
        Ok(routed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::Command;
    use crate::error::ProxyError;
    use crate::resolver::{DnsMangler, HostOverrides};
    use crate::rewrite::{RewriteChain, RuleTableStage};
    use crate::rules::RewriteRuleTable;
    use async_trait::async_trait;
    use std::io;
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Resolver that fails every lookup and counts calls.
    #[derive(Default)]
    struct FailingResolver(AtomicUsize);

    #[async_trait]
    impl NameResolver for FailingResolver {
        async fn resolve(&self, name: &str) -> Result<IpAddr> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(ProxyError::Resolve {
                name: name.to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "no such host"),
            })
        }
    }

    /// Rewriter that counts calls.
    #[derive(Default)]
    struct CountingRewriter(AtomicUsize);

    impl AddressRewriter for CountingRewriter {
        fn rewrite(&self, _request: &RequestMeta, addr: ResolvedAddr) -> ResolvedAddr {
            self.0.fetch_add(1, Ordering::SeqCst);
            addr
        }
    }

    fn pipeline(overrides: &[&str], rules: &[&str]) -> Pipeline {
        let mut builder = HostOverrides::builder();
        for rule in overrides {
            builder.add_rule(rule).unwrap();
        }
        let chain = RewriteChain::builder()
            .stage(RuleTableStage::new(RewriteRuleTable::from_rules(rules).unwrap()))
            .build();
        Pipeline::new(Arc::new(DnsMangler::new(builder.build())), Arc::new(chain))
    }

    #[tokio::test]
    async fn test_route_override_then_rewrite() {
        let pipeline = pipeline(&["a.com:10.0.0.1"], &["a.com:443:10.0.0.2:8443"]);

        let request = RequestMeta::new(Command::Connect, DestinationSpec::from_host("a.com", 443));
        let routed = pipeline.route(&request).await.unwrap();
        assert_eq!(routed.addr, "10.0.0.2:8443".parse().unwrap());

        let request = RequestMeta::new(Command::Connect, DestinationSpec::from_host("a.com", 80));
        let routed = pipeline.route(&request).await.unwrap();
        assert_eq!(routed.addr, "10.0.0.1:80".parse().unwrap());
    }

    #[tokio::test]
    async fn test_route_ip_literal() {
        let pipeline = pipeline(&[], &["1.2.3.4:80:5.6.7.8"]);

        let request = RequestMeta::new(Command::Bind, DestinationSpec::from_host("1.2.3.4", 80));
        let routed = pipeline.route(&request).await.unwrap();
        assert_eq!(routed.addr, "5.6.7.8:80".parse().unwrap());
        assert_eq!(routed.fqdn, None);
    }

    #[tokio::test]
    async fn test_resolution_failure_skips_rewrite() {
        let resolver = Arc::new(FailingResolver::default());
        let rewriter = Arc::new(CountingRewriter::default());
        let pipeline = Pipeline::new(resolver.clone(), rewriter.clone());

        let request = RequestMeta::new(Command::Connect, DestinationSpec::from_host("a.com", 443));
        let result = pipeline.route(&request).await;
        assert!(matches!(result, Err(ProxyError::Resolve { .. })));
        assert_eq!(resolver.0.load(Ordering::SeqCst), 1);
        assert_eq!(rewriter.0.load(Ordering::SeqCst), 0);

        // IP destinations never reach the resolver.
        let request = RequestMeta::new(Command::Connect, DestinationSpec::from_host("10.0.0.1", 443));
        assert!(pipeline.route(&request).await.is_ok());
        assert_eq!(resolver.0.load(Ordering::SeqCst), 1);
        assert_eq!(rewriter.0.load(Ordering::SeqCst), 1);
    }
}
