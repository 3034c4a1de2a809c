//! Destination rewrite chain.
//!
//! A [`RewriteChain`] runs its stages strictly in registration order, each
//! stage receiving the previous stage's output together with the original
//! request metadata. Two stage kinds are provided: [`AccessLogStage`], which
//! only records the request, and [`RuleTableStage`], which applies a
//! [`RewriteRuleTable`].

use crate::addr::{RequestMeta, ResolvedAddr};
use crate::rules::RewriteRuleTable;
use tracing::{debug, info};

/// Tracing target of access records.
pub const ACCESS_LOG_TARGET: &str = "mangle_proxy::access";

/// Transforms a resolved destination before the outbound connection.
///
/// This is the address-rewrite hook consumed by both forwarding front-ends.
pub trait AddressRewriter: Send + Sync {
    fn rewrite(&self, request: &RequestMeta, addr: ResolvedAddr) -> ResolvedAddr;
}

/// Emits one access record per request and passes the address through.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccessLogStage;

impl AddressRewriter for AccessLogStage {
    fn rewrite(&self, request: &RequestMeta, addr: ResolvedAddr) -> ResolvedAddr {
        info!(
            target: ACCESS_LOG_TARGET,
            command = %request.command,
            fqdn = request.destination.fqdn().unwrap_or(""),
            ip = %addr.addr.ip(),
            port = addr.addr.port(),
            "Access"
        );
        addr
    }
}

/// Looks the destination up in a rule table; unmatched addresses pass
/// through unchanged.
#[derive(Debug, Clone)]
pub struct RuleTableStage {
    table: RewriteRuleTable,
}

impl RuleTableStage {
    pub fn new(table: RewriteRuleTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &RewriteRuleTable {
        &self.table
    }
}

impl AddressRewriter for RuleTableStage {
    fn rewrite(&self, _request: &RequestMeta, addr: ResolvedAddr) -> ResolvedAddr {
        let host = addr.rule_host();
        match self.table.lookup(&host, addr.addr.port()) {
            Some(target) => {
                debug!(host = %host, from = %addr.addr, to = %target, "Rewrote destination");
                addr.retarget(target)
            }
            None => addr,
        }
    }
}

/// Ordered, append-only sequence of rewrite stages.
#[derive(Default)]
pub struct RewriteChain {
    stages: Vec<Box<dyn AddressRewriter>>,
}

impl RewriteChain {
    pub fn builder() -> RewriteChainBuilder {
        RewriteChainBuilder::default()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl AddressRewriter for RewriteChain {
    fn rewrite(&self, request: &RequestMeta, addr: ResolvedAddr) -> ResolvedAddr {
        self.stages
            .iter()
            .fold(addr, |addr, stage| stage.rewrite(request, addr))
    }
}

impl std::fmt::Debug for RewriteChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RewriteChain")
            .field("stages", &self.stages.len())
            .finish()
    }
}

/// Builder for [`RewriteChain`]; stage order is the order of `stage` calls.
#[derive(Default)]
pub struct RewriteChainBuilder {
    stages: Vec<Box<dyn AddressRewriter>>,
}

impl RewriteChainBuilder {
    pub fn stage<R: AddressRewriter + 'static>(mut self, stage: R) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn build(self) -> RewriteChain {
        RewriteChain {
            stages: self.stages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::{Command, DestinationSpec};
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};
    use tracing::field::{Field, Visit};
    use tracing::{Event, Subscriber};
    use tracing_subscriber::layer::{Context, SubscriberExt};
    use tracing_subscriber::Layer;

    /// Collects the `ip` field of every access record.
    #[derive(Clone, Default)]
    struct AccessRecorder(Arc<Mutex<Vec<String>>>);

    struct IpVisitor(Option<String>);

    impl Visit for IpVisitor {
        fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
            if field.name() == "ip" {
                self.0 = Some(format!("{:?}", value));
            }
        }
    }

    impl<S: Subscriber> Layer<S> for AccessRecorder {
        fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
            if event.metadata().target() == ACCESS_LOG_TARGET {
                let mut visitor = IpVisitor(None);
                event.record(&mut visitor);
                self.0
                    .lock()
                    .unwrap()
                    .push(visitor.0.unwrap_or_default());
            }
        }
    }

    fn run_recorded<T>(f: impl FnOnce() -> T) -> (T, Vec<String>) {
        let recorder = AccessRecorder::default();
        let subscriber = tracing_subscriber::registry().with(recorder.clone());
        let out = tracing::subscriber::with_default(subscriber, f);
        let records = recorder.0.lock().unwrap().clone();
        (out, records)
    }

    fn connect_to(host: &str, addr: &str) -> (RequestMeta, ResolvedAddr) {
        let addr: SocketAddr = addr.parse().unwrap();
        let request = RequestMeta::new(Command::Connect, DestinationSpec::from_host(host, addr.port()));
        let fqdn = request.destination.fqdn().map(str::to_string);
        (request, ResolvedAddr::new(fqdn, addr))
    }

    fn table(rules: &[&str]) -> RewriteRuleTable {
        RewriteRuleTable::from_rules(rules).unwrap()
    }

    #[test]
    fn test_empty_chain_is_identity() {
        let chain = RewriteChain::builder().build();
        let (request, addr) = connect_to("a.com", "10.0.0.1:80");

        assert!(chain.is_empty());
        assert_eq!(chain.rewrite(&request, addr.clone()), addr);
    }

    #[test]
    fn test_rule_stage_rewrites_by_fqdn() {
        let stage = RuleTableStage::new(table(&["a.com:1000-1002:10.0.0.5:2000"]));
        assert_eq!(stage.table().len(), 3);
        let (request, addr) = connect_to("a.com", "93.184.216.34:1001");

        let out = stage.rewrite(&request, addr);
        assert_eq!(out.addr, "10.0.0.5:2001".parse().unwrap());
        assert_eq!(out.fqdn.as_deref(), Some("a.com"));
    }

    #[test]
    fn test_rule_stage_rewrites_by_ip() {
        let stage = RuleTableStage::new(table(&["1.2.3.4:80:5.6.7.8"]));
        let (request, addr) = connect_to("1.2.3.4", "1.2.3.4:80");

        let out = stage.rewrite(&request, addr);
        assert_eq!(out.addr, "5.6.7.8:80".parse().unwrap());
    }

    #[test]
    fn test_rule_stage_unmatched_is_identity() {
        let stage = RuleTableStage::new(table(&["a.com:80:10.0.0.1"]));

        for (host, addr) in [("a.com", "1.1.1.1:81"), ("b.com", "1.1.1.1:80"), ("1.1.1.1", "1.1.1.1:80")] {
            let (request, addr) = connect_to(host, addr);
            assert_eq!(stage.rewrite(&request, addr.clone()), addr);
        }
    }

    #[test]
    fn test_stages_run_in_order() {
        // The second stage only matches the first stage's output.
        let chain = RewriteChain::builder()
            .stage(RuleTableStage::new(table(&["1.1.1.1:80:2.2.2.2:81"])))
            .stage(RuleTableStage::new(table(&["2.2.2.2:81:3.3.3.3:82"])))
            .build();
        let (request, addr) = connect_to("1.1.1.1", "1.1.1.1:80");
        assert_eq!(chain.rewrite(&request, addr).addr, "3.3.3.3:82".parse().unwrap());

        let reversed = RewriteChain::builder()
            .stage(RuleTableStage::new(table(&["2.2.2.2:81:3.3.3.3:82"])))
            .stage(RuleTableStage::new(table(&["1.1.1.1:80:2.2.2.2:81"])))
            .build();
        let (request, addr) = connect_to("1.1.1.1", "1.1.1.1:80");
        assert_eq!(reversed.rewrite(&request, addr).addr, "2.2.2.2:81".parse().unwrap());
    }

    #[test]
    fn test_access_log_stage_is_noop_and_logs_once() {
        let chain = RewriteChain::builder().stage(AccessLogStage).build();
        let inputs = [("a.com", "10.0.0.1:443"), ("10.0.0.2", "10.0.0.2:80"), ("b.com", "[::1]:22")];

        let (outputs, records) = run_recorded(|| {
            inputs
                .iter()
                .map(|(host, addr)| {
                    let (request, addr) = connect_to(host, addr);
                    (addr.clone(), chain.rewrite(&request, addr))
                })
                .collect::<Vec<_>>()
        });

        for (input, output) in outputs {
            assert_eq!(input, output);
        }
        assert_eq!(records, vec!["10.0.0.1", "10.0.0.2", "::1"]);
    }

    #[test]
    fn test_log_position_observes_rewrite() {
        let before = RewriteChain::builder()
            .stage(AccessLogStage)
            .stage(RuleTableStage::new(table(&["a.com:80:10.0.0.9"])))
            .build();
        let after = RewriteChain::builder()
            .stage(RuleTableStage::new(table(&["a.com:80:10.0.0.9"])))
            .stage(AccessLogStage)
            .build();

        let (_, records) = run_recorded(|| {
            let (request, addr) = connect_to("a.com", "10.0.0.1:80");
            before.rewrite(&request, addr.clone());
            after.rewrite(&request, addr);
        });

        assert_eq!(records, vec!["10.0.0.1", "10.0.0.9"]);
    }
}
