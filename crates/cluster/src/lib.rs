//! Cluster config propagation. The coordinator packages its reconciled set
//! plus the discovery endpoint into one atomic message; dependent nodes
//! consume it, re-render their local artifacts and report readiness back.
//! Dependents never synthesize catalog content on their own, and redelivery
//! of identical content is a no-op.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use quarry_core::{
    ClusterConfigMessage, PropagationError, ReconciledSet, RenderedCatalog, SSL_PATH_TOKEN,
    SSL_PWD_TOKEN,
};
use quarry_reconcile::ArtifactSink;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Convergence state of one dependent node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeState {
    /// No configuration received yet.
    AwaitingConfig,
    /// A new fingerprint arrived and local artifacts are being rewritten.
    Applying,
    /// Local artifacts match the given fingerprint.
    Converged { fingerprint: String },
    /// Local validation/apply failed; terminal until a corrected message
    /// arrives. Carries the last fingerprint that did converge.
    Degraded { last_good: Option<String> },
}

/// What a dependent reports back after each delivery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeAck {
    pub node: String,
    pub state: NodeState,
}

/// Package the coordinator's applied set for delivery.
pub fn package(discovery_uri: &str, set: &ReconciledSet) -> ClusterConfigMessage {
    let artifacts = set
        .catalogs
        .iter()
        .map(|(name, rc)| (name.clone(), rc.properties.clone()))
        .collect();
    ClusterConfigMessage {
        discovery_uri: discovery_uri.to_string(),
        fingerprint: set.fingerprint.clone(),
        artifacts,
    }
}

/// A dependent node: consumes coordinator messages, keeps exactly one piece
/// of state (what it last applied) and writes through its own sink.
pub struct DependentNode {
    name: String,
    state: NodeState,
    sink: Arc<dyn ArtifactSink>,
    /// Catalog name to property text, as last applied locally.
    applied: BTreeMap<String, String>,
    discovery_uri: Option<String>,
    last_converged: Option<String>,
}

impl DependentNode {
    pub fn new(name: impl Into<String>, sink: Arc<dyn ArtifactSink>) -> Self {
        Self {
            name: name.into(),
            state: NodeState::AwaitingConfig,
            sink,
            applied: BTreeMap::new(),
            discovery_uri: None,
            last_converged: None,
        }
    }

    /// Rebuild a node from the set it last converged on, as recorded in the
    /// persistence layer. A restarted dependent then treats redelivery of
    /// that fingerprint as the no-op it is instead of rewriting everything.
    pub fn restore(
        name: impl Into<String>,
        sink: Arc<dyn ArtifactSink>,
        set: &ReconciledSet,
    ) -> Self {
        let applied = set
            .catalogs
            .iter()
            .map(|(n, rc)| (n.clone(), rc.properties.clone()))
            .collect();
        Self {
            name: name.into(),
            state: NodeState::Converged { fingerprint: set.fingerprint.clone() },
            sink,
            applied,
            discovery_uri: None,
            last_converged: Some(set.fingerprint.clone()),
        }
    }

    pub fn state(&self) -> &NodeState {
        &self.state
    }

    /// Handle one delivery. Safe under retries: an identical fingerprint
    /// while converged changes nothing and signals nothing.
    pub fn handle(&mut self, msg: &ClusterConfigMessage) -> NodeAck {
        if let NodeState::Converged { fingerprint } = &self.state {
            if *fingerprint == msg.fingerprint {
                counter!("propagate_noop", 1u64);
                return self.ack();
            }
        }

        self.state = NodeState::Applying;
        match self.apply(msg) {
            Ok(()) => {
                self.last_converged = Some(msg.fingerprint.clone());
                self.state = NodeState::Converged { fingerprint: msg.fingerprint.clone() };
                info!(node = %self.name, fingerprint = %msg.fingerprint, "dependent converged");
            }
            Err(reason) => {
                warn!(node = %self.name, %reason, "dependent degraded");
                counter!("propagate_degraded", 1u64);
                self.state = NodeState::Degraded { last_good: self.last_converged.clone() };
            }
        }
        self.ack()
    }

    fn apply(&mut self, msg: &ClusterConfigMessage) -> Result<(), String> {
        // Validate the whole message before touching any artifact so a bad
        // entry never leaves a partially-updated catalog dir.
        for (name, text) in &msg.artifacts {
            validate_artifact(name, text)?;
        }

        let mut changed = false;
        for (name, text) in &msg.artifacts {
            if self.applied.get(name).map(String::as_str) != Some(text.as_str()) {
                let rc = RenderedCatalog::new(name.clone(), text.clone());
                self.sink.write_catalog(&rc).map_err(|e| e.to_string())?;
                changed = true;
            }
        }
        let stale: Vec<String> =
            self.applied.keys().filter(|n| !msg.artifacts.contains_key(*n)).cloned().collect();
        for name in stale {
            self.sink.remove_catalog(&name).map_err(|e| e.to_string())?;
            changed = true;
        }
        if self.discovery_uri.as_deref() != Some(msg.discovery_uri.as_str()) {
            self.sink
                .write_aux("discovery.properties", &format!("discovery.uri={}\n", msg.discovery_uri))
                .map_err(|e| e.to_string())?;
            self.discovery_uri = Some(msg.discovery_uri.clone());
            changed = true;
        }
        if changed {
            self.sink.signal_restart(&msg.fingerprint).map_err(|e| e.to_string())?;
        }
        self.applied = msg.artifacts.clone();
        Ok(())
    }

    fn ack(&self) -> NodeAck {
        NodeAck { node: self.name.clone(), state: self.state.clone() }
    }
}

/// Sanity checks on propagated property text; dependents trust the
/// coordinator for content but never write garbage locally.
fn validate_artifact(name: &str, text: &str) -> Result<(), String> {
    if !quarry_core::is_valid_name(name) {
        return Err(format!("invalid catalog name {name:?}"));
    }
    if text.trim().is_empty() {
        return Err(format!("catalog {name:?} has empty properties"));
    }
    if text.contains(SSL_PATH_TOKEN) || text.contains(SSL_PWD_TOKEN) {
        return Err(format!("catalog {name:?} contains unresolved {{SSL_*}} placeholders"));
    }
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if !line.contains('=') {
            return Err(format!("catalog {name:?} has an invalid property line {line:?}"));
        }
    }
    Ok(())
}

/// Delivery channel to one dependent. At-least-once; consumers are
/// idempotent, so retried deliveries are harmless.
#[async_trait]
pub trait ConfigTransport: Send + Sync {
    async fn deliver(&self, node: &str, msg: &ClusterConfigMessage)
        -> anyhow::Result<NodeAck>;
}

/// In-process transport over shared dependent handles.
#[derive(Default)]
pub struct LocalTransport {
    nodes: FxHashMap<String, Arc<Mutex<DependentNode>>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, node: Arc<Mutex<DependentNode>>) {
        self.nodes.insert(name.into(), node);
    }
}

#[async_trait]
impl ConfigTransport for LocalTransport {
    async fn deliver(&self, node: &str, msg: &ClusterConfigMessage) -> anyhow::Result<NodeAck> {
        let handle =
            self.nodes.get(node).ok_or_else(|| anyhow::anyhow!("unknown node {node:?}"))?;
        Ok(handle.lock().await.handle(msg))
    }
}

fn default_propagate_retries() -> u32 {
    std::env::var("QUARRY_PROPAGATE_RETRIES")
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(3)
}

/// Coordinator side: fans the message out to every dependent with bounded
/// retries, then reports lagging nodes instead of retrying forever.
pub struct Coordinator {
    transport: Arc<dyn ConfigTransport>,
    dependents: Vec<String>,
    max_attempts: u32,
}

impl Coordinator {
    pub fn new(transport: Arc<dyn ConfigTransport>, dependents: Vec<String>) -> Self {
        Self { transport, dependents, max_attempts: default_propagate_retries().max(1) }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Deliver to every dependent. Per-node outcomes, never one aggregate
    /// boolean.
    pub async fn propagate(
        &self,
        msg: &ClusterConfigMessage,
    ) -> Vec<(String, Result<NodeAck, PropagationError>)> {
        let mut results = Vec::with_capacity(self.dependents.len());
        for node in &self.dependents {
            results.push((node.clone(), self.propagate_one(node, msg).await));
        }
        results
    }

    async fn propagate_one(
        &self,
        node: &str,
        msg: &ClusterConfigMessage,
    ) -> Result<NodeAck, PropagationError> {
        let mut delay = Duration::from_millis(50);
        for attempt in 1..=self.max_attempts {
            match self.transport.deliver(node, msg).await {
                Ok(ack) => {
                    if let NodeState::Degraded { last_good } = &ack.state {
                        return Err(PropagationError::Degraded {
                            node: node.to_string(),
                            last_good: last_good.clone(),
                        });
                    }
                    counter!("propagate_ok", 1u64);
                    return Ok(ack);
                }
                Err(e) if attempt < self.max_attempts => {
                    warn!(node, attempt, error = %e, "delivery failed; retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => {
                    warn!(node, attempts = self.max_attempts, error = %e, "dependent unreachable");
                    counter!("propagate_err", 1u64);
                    return Err(PropagationError::Unreachable {
                        node: node.to_string(),
                        attempts: self.max_attempts,
                    });
                }
            }
        }
        unreachable!("max_attempts >= 1")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_reconcile::MemorySink;
    use std::collections::BTreeMap;

    fn message(fp: &str, entries: &[(&str, &str)]) -> ClusterConfigMessage {
        let mut artifacts = BTreeMap::new();
        for (name, text) in entries {
            artifacts.insert(name.to_string(), text.to_string());
        }
        ClusterConfigMessage {
            discovery_uri: "http://coordinator:8080".to_string(),
            fingerprint: fp.to_string(),
            artifacts,
        }
    }

    #[test]
    fn redelivery_is_a_noop() {
        let sink = Arc::new(MemorySink::new());
        let mut node = DependentNode::new("worker-0", sink.clone());
        let msg = message("fp-1", &[("sales", "connector.name=postgresql\n")]);

        node.handle(&msg);
        assert_eq!(node.state(), &NodeState::Converged { fingerprint: "fp-1".to_string() });
        assert_eq!(sink.restart_count(), 1);

        node.handle(&msg);
        assert_eq!(node.state(), &NodeState::Converged { fingerprint: "fp-1".to_string() });
        // No re-render side effects on redelivery.
        assert_eq!(sink.restart_count(), 1);
    }

    #[test]
    fn restored_node_treats_redelivery_as_a_noop() {
        let mut catalogs = BTreeMap::new();
        catalogs.insert(
            "sales".to_string(),
            RenderedCatalog::new("sales", "connector.name=postgresql\n"),
        );
        let set = ReconciledSet::from_catalogs(catalogs);
        let msg = package("http://coordinator:8080", &set);

        let sink = Arc::new(MemorySink::new());
        let mut first = DependentNode::new("worker-0", sink.clone());
        first.handle(&msg);
        assert_eq!(sink.restart_count(), 1);

        // A fresh instance seeded from the recorded set, as after a process
        // restart, must not rewrite or restart on the same fingerprint.
        let mut second = DependentNode::restore("worker-0", sink.clone(), &set);
        let ack = second.handle(&msg);
        assert_eq!(
            ack.state,
            NodeState::Converged { fingerprint: set.fingerprint.clone() }
        );
        assert_eq!(sink.restart_count(), 1);
    }

    #[test]
    fn new_fingerprint_reapplies_and_prunes_stale_catalogs() {
        let sink = Arc::new(MemorySink::new());
        let mut node = DependentNode::new("worker-0", sink.clone());

        node.handle(&message("fp-1", &[("sales", "connector.name=postgresql\n")]));
        node.handle(&message("fp-2", &[("ops", "connector.name=mysql\n")]));

        let catalogs = sink.catalogs.lock().unwrap();
        assert!(catalogs.contains_key("ops"));
        assert!(!catalogs.contains_key("sales"));
        drop(catalogs);
        assert_eq!(node.state(), &NodeState::Converged { fingerprint: "fp-2".to_string() });
        assert_eq!(sink.restart_count(), 2);
    }

    #[test]
    fn bad_artifact_degrades_with_last_good_and_recovers() {
        let sink = Arc::new(MemorySink::new());
        let mut node = DependentNode::new("worker-0", sink.clone());

        node.handle(&message("fp-1", &[("sales", "connector.name=postgresql\n")]));

        let bad = message("fp-2", &[("sales", "connection-url={SSL_PATH}\n")]);
        let ack = node.handle(&bad);
        assert_eq!(
            ack.state,
            NodeState::Degraded { last_good: Some("fp-1".to_string()) }
        );
        // Nothing was rewritten by the bad message.
        assert_eq!(sink.catalogs.lock().unwrap()["sales"], "connector.name=postgresql\n");

        let fixed = message("fp-3", &[("sales", "connection-url=jdbc:postgresql://db\n")]);
        let ack = node.handle(&fixed);
        assert_eq!(ack.state, NodeState::Converged { fingerprint: "fp-3".to_string() });
    }

    #[test]
    fn discovery_uri_is_materialized() {
        let sink = Arc::new(MemorySink::new());
        let mut node = DependentNode::new("worker-0", sink.clone());
        node.handle(&message("fp-1", &[("sales", "connector.name=postgresql\n")]));
        assert_eq!(
            sink.aux.lock().unwrap()["discovery.properties"],
            "discovery.uri=http://coordinator:8080\n"
        );
    }

    #[tokio::test]
    async fn coordinator_reports_per_node_outcomes() {
        let sink_a = Arc::new(MemorySink::new());
        let node_a = Arc::new(Mutex::new(DependentNode::new("worker-a", sink_a)));
        let mut transport = LocalTransport::new();
        transport.register("worker-a", node_a);
        let coordinator =
            Coordinator::new(Arc::new(transport), vec!["worker-a".to_string(), "ghost".to_string()])
                .with_max_attempts(2);

        let msg = message("fp-1", &[("sales", "connector.name=postgresql\n")]);
        let results = coordinator.propagate(&msg).await;
        assert_eq!(results.len(), 2);
        assert!(matches!(results[0].1, Ok(ref ack) if ack.state == NodeState::Converged { fingerprint: "fp-1".to_string() }));
        assert!(matches!(
            results[1].1,
            Err(PropagationError::Unreachable { attempts: 2, .. })
        ));
    }

    #[tokio::test]
    async fn degraded_dependents_surface_their_last_good_fingerprint() {
        let sink = Arc::new(MemorySink::new());
        let node = Arc::new(Mutex::new(DependentNode::new("worker-a", sink)));
        let mut transport = LocalTransport::new();
        transport.register("worker-a", node);
        let coordinator =
            Coordinator::new(Arc::new(transport), vec!["worker-a".to_string()]).with_max_attempts(1);

        coordinator
            .propagate(&message("fp-1", &[("sales", "connector.name=postgresql\n")]))
            .await;
        let results = coordinator
            .propagate(&message("fp-2", &[("sales", "broken line without equals\n")]))
            .await;
        assert!(matches!(
            results[0].1,
            Err(PropagationError::Degraded { ref last_good, .. }) if last_good.as_deref() == Some("fp-1")
        ));
    }

    #[test]
    fn package_mirrors_the_reconciled_set() {
        let mut catalogs = BTreeMap::new();
        catalogs.insert(
            "sales".to_string(),
            RenderedCatalog::new("sales", "connector.name=postgresql\n"),
        );
        let set = ReconciledSet::from_catalogs(catalogs);
        let msg = package("http://coordinator:8080", &set);
        assert_eq!(msg.fingerprint, set.fingerprint);
        assert_eq!(msg.artifacts["sales"], "connector.name=postgresql\n");
    }
}
