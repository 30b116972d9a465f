use std::net::{IpAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};

use super::state_machine::{LogEntry, ReplicatedEngine, StateMachine};
use crate::error::{EngineError, EngineResult};
use crate::indexer::{RequestMeta, WriteResponse};

/// Maximum hostname length accepted in a membership string; longer names
/// collapse the entry.
const MAX_HOSTNAME_LEN: usize = 64;

/// One `host:peering_port:api_port` member, hostname already resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEndpoint {
    pub ip: String,
    pub peering_port: u16,
    pub api_port: u16,
}

impl NodeEndpoint {
    pub fn peering_addr(&self) -> String {
        format!("{}:{}", self.ip, self.peering_port)
    }

    pub fn api_url(&self, ssl: bool) -> String {
        let scheme = if ssl { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.ip, self.api_port)
    }
}

/// Resolve a hostname to an IP string; IPv6 addresses wrap in brackets.
fn resolve_host(host: &str) -> Option<String> {
    if host.len() > MAX_HOSTNAME_LEN {
        return None;
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Some(match ip {
            IpAddr::V4(v4) => v4.to_string(),
            IpAddr::V6(v6) => format!("[{}]", v6),
        });
    }
    // Port 0 keeps the resolver happy; only the address matters.
    let mut addrs = (host, 0u16).to_socket_addrs().ok()?;
    addrs.next().map(|addr| match addr.ip() {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{}]", v6),
    })
}

/// Parse and resolve a `host:peering_port:api_port,...` membership string.
/// Unresolvable entries collapse; an all-collapsed configuration is an error.
pub fn resolve_nodes_config(nodes_config: &str) -> EngineResult<Vec<NodeEndpoint>> {
    let entries: Vec<&str> = nodes_config
        .split(',')
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .collect();
    if entries.is_empty() {
        return Err(EngineError::ClientError(
            "Nodes configuration is empty.".into(),
        ));
    }

    let mut out = Vec::new();
    for entry in &entries {
        let parts: Vec<&str> = entry.rsplitn(3, ':').collect();
        if parts.len() != 3 {
            tracing::error!("Skipping malformed nodes entry `{}`", entry);
            continue;
        }
        // rsplitn yields [api_port, peering_port, host].
        let (Ok(api_port), Ok(peering_port)) =
            (parts[0].parse::<u16>(), parts[1].parse::<u16>())
        else {
            tracing::error!("Skipping nodes entry with bad ports `{}`", entry);
            continue;
        };
        let host = parts[2].trim_start_matches('[').trim_end_matches(']');
        match resolve_host(host) {
            Some(ip) => out.push(NodeEndpoint {
                ip,
                peering_port,
                api_port,
            }),
            None => {
                tracing::error!("Failed to resolve nodes entry host `{}`", host);
            }
        }
    }

    if out.is_empty() {
        return Err(EngineError::Unavailable(
            "None of the configured cluster nodes could be resolved.".into(),
        ));
    }
    Ok(out)
}

/// The consensus node the manager owns. The transport library implements
/// this; `LocalNode` is the in-process single-node implementation used for
/// standalone mode and tests.
pub trait ConsensusNode: Send + Sync {
    fn shutdown(&self);
    fn is_leader(&self) -> bool;
    fn leader(&self) -> Option<NodeEndpoint>;
    /// Append a payload to the replicated log; entries reach the state
    /// machine in log order.
    fn replicate(&self, payload: Vec<u8>) -> EngineResult<i64>;
    fn trigger_snapshot(&self) -> EngineResult<()>;
    fn change_peers(&self, endpoints: &[NodeEndpoint]) -> EngineResult<()>;
    fn reset_peers(&self, endpoints: &[NodeEndpoint]) -> EngineResult<()>;
    fn trigger_vote(&self) -> EngineResult<()>;
    fn status(&self) -> Value;
}

/// Single-node consensus: every replicated payload applies immediately, in
/// order, to the state machine. Snapshots write to a fixed directory under
/// the node's state path.
pub struct LocalNode {
    engine: Arc<ReplicatedEngine>,
    endpoint: NodeEndpoint,
    snapshot_dir: std::path::PathBuf,
    next_index: AtomicI64,
    log_lock: Mutex<()>,
}

impl LocalNode {
    pub fn new(
        engine: Arc<ReplicatedEngine>,
        endpoint: NodeEndpoint,
        snapshot_dir: std::path::PathBuf,
    ) -> Self {
        engine.on_leader_start(1);
        engine.set_caught_up(true, true);
        Self {
            engine,
            endpoint,
            snapshot_dir,
            next_index: AtomicI64::new(1),
            log_lock: Mutex::new(()),
        }
    }
}

impl ConsensusNode for LocalNode {
    fn shutdown(&self) {
        self.engine.on_leader_stop();
    }

    fn is_leader(&self) -> bool {
        true
    }

    fn leader(&self) -> Option<NodeEndpoint> {
        Some(self.endpoint.clone())
    }

    fn replicate(&self, payload: Vec<u8>) -> EngineResult<i64> {
        // Applies serialize on the log lock so entries stay in order.
        let _ordered = self.log_lock.lock();
        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        let entry: LogEntry = serde_json::from_slice(&payload)
            .map_err(|e| EngineError::Fatal(format!("Corrupt log payload: {}", e)))?;
        self.engine.apply(index, &entry)?;
        Ok(index)
    }

    fn trigger_snapshot(&self) -> EngineResult<()> {
        self.engine.on_snapshot_save(&self.snapshot_dir)?;
        Ok(())
    }

    fn change_peers(&self, _endpoints: &[NodeEndpoint]) -> EngineResult<()> {
        Err(EngineError::ClientError(
            "Peer changes are not applicable to a single-node cluster.".into(),
        ))
    }

    fn reset_peers(&self, _endpoints: &[NodeEndpoint]) -> EngineResult<()> {
        Ok(())
    }

    fn trigger_vote(&self) -> EngineResult<()> {
        Ok(())
    }

    fn status(&self) -> Value {
        json!({
            "state": "LEADER",
            "committed_index": self.next_index.load(Ordering::SeqCst) - 1,
        })
    }
}

/// Owns the consensus node, tracks leadership, routes writes through the log
/// on the leader and proxies them to the leader otherwise.
pub struct NodeManager {
    engine: Arc<ReplicatedEngine>,
    node: RwLock<Option<Arc<dyn ConsensusNode>>>,
    self_endpoint: NodeEndpoint,
    nodes_config: RwLock<String>,
    api_uses_ssl: bool,
    http: reqwest::Client,
}

impl NodeManager {
    pub fn new(engine: Arc<ReplicatedEngine>, self_endpoint: NodeEndpoint, api_uses_ssl: bool) -> Self {
        Self {
            engine,
            node: RwLock::new(None),
            self_endpoint,
            nodes_config: RwLock::new(String::new()),
            api_uses_ssl,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("build http client"),
        }
    }

    pub fn engine(&self) -> &Arc<ReplicatedEngine> {
        &self.engine
    }

    pub fn self_endpoint(&self) -> &NodeEndpoint {
        &self.self_endpoint
    }

    pub fn init_node(&self, node: Arc<dyn ConsensusNode>, nodes_config: &str) -> EngineResult<()> {
        if !nodes_config.is_empty() {
            resolve_nodes_config(nodes_config)?;
            *self.nodes_config.write() = nodes_config.to_string();
        }
        *self.node.write() = Some(node);
        Ok(())
    }

    /// Block until reads are allowed (follower catch-up), or time out.
    pub async fn wait_until_ready(&self, timeout: Duration) -> EngineResult<()> {
        let start = std::time::Instant::now();
        while !self.engine.is_read_caught_up() {
            if start.elapsed() > timeout {
                return Err(EngineError::Unavailable(
                    "Node did not catch up in time.".into(),
                ));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        if let Some(node) = self.node.write().take() {
            node.shutdown();
        }
    }

    fn node(&self) -> EngineResult<Arc<dyn ConsensusNode>> {
        self.node
            .read()
            .clone()
            .ok_or_else(|| EngineError::Unavailable("Consensus node is not running.".into()))
    }

    pub fn is_leader(&self) -> bool {
        self.node()
            .map(|node| node.is_leader())
            .unwrap_or(false)
    }

    pub fn get_leader_url(&self) -> Option<String> {
        let node = self.node().ok()?;
        Some(node.leader()?.api_url(self.api_uses_ssl))
    }

    /// Route a write: on the leader it enters the log and resolves when the
    /// local apply publishes the response; elsewhere it is forwarded to the
    /// leader and the leader's status propagates verbatim.
    pub async fn write(
        &self,
        meta: RequestMeta,
        body: Vec<u8>,
        path: &str,
    ) -> EngineResult<WriteResponse> {
        let node = self.node()?;
        if node.is_leader() {
            let rx = self.engine.register_pending(meta.req_id);
            let entry = LogEntry {
                meta,
                chunk: body,
                is_last_chunk: true,
            };
            let payload = serde_json::to_vec(&entry)
                .map_err(|e| EngineError::Fatal(format!("Encode log entry: {}", e)))?;
            node.replicate(payload)?;
            return rx.await.map_err(|_| {
                EngineError::Unavailable("Write was dropped during leader change.".into())
            });
        }

        self.forward_to_leader(body, path).await
    }

    async fn forward_to_leader(&self, body: Vec<u8>, path: &str) -> EngineResult<WriteResponse> {
        let leader_url = self.get_leader_url().ok_or_else(|| {
            EngineError::Unavailable("Could not find a leader to forward the write to.".into())
        })?;
        let url = format!("{}{}", leader_url, path);
        let response = self
            .http
            .post(&url)
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| EngineError::Unavailable(format!("Leader forward failed: {}", e)))?;

        let code = response.status().as_u16();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        Ok((code, body))
    }

    pub fn snapshot(&self) -> EngineResult<()> {
        self.node()?.trigger_snapshot()
    }

    pub fn change_peers(&self, nodes_config: &str) -> EngineResult<()> {
        let endpoints = resolve_nodes_config(nodes_config)?;
        self.node()?.change_peers(&endpoints)?;
        *self.nodes_config.write() = nodes_config.to_string();
        Ok(())
    }

    pub fn reset_peers(&self, nodes_config: &str) -> EngineResult<()> {
        let endpoints = resolve_nodes_config(nodes_config)?;
        self.node()?.reset_peers(&endpoints)?;
        *self.nodes_config.write() = nodes_config.to_string();
        Ok(())
    }

    pub fn trigger_vote(&self) -> EngineResult<()> {
        self.node()?.trigger_vote()
    }

    /// Re-resolve the membership string, reconfiguring peers when it changed.
    /// `allow_single_node_reset` permits collapsing to a one-node cluster.
    pub fn refresh_nodes(
        &self,
        nodes_csv: &str,
        allow_single_node_reset: bool,
    ) -> EngineResult<()> {
        let endpoints = resolve_nodes_config(nodes_csv)?;
        if endpoints.len() == 1 {
            if !allow_single_node_reset {
                return Ok(());
            }
            self.node()?.reset_peers(&endpoints)?;
        } else if *self.nodes_config.read() != nodes_csv {
            self.node()?.change_peers(&endpoints)?;
        }
        *self.nodes_config.write() = nodes_csv.to_string();
        Ok(())
    }

    pub fn get_status(&self) -> Value {
        let node_status = self
            .node()
            .map(|node| node.status())
            .unwrap_or_else(|_| json!({"state": "NOT_READY"}));
        json!({
            "ok": true,
            "is_leader": self.is_leader(),
            "leader_term": self.engine.leader_term(),
            "committed_index": self.engine.applied_index(),
            "read_caught_up": self.engine.is_read_caught_up(),
            "write_caught_up": self.engine.is_write_caught_up(),
            "queued_writes": self.engine.indexer().get_queued_writes(),
            "node": node_status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_nodes_config() {
        let endpoints = resolve_nodes_config("127.0.0.1:8107:8108,127.0.0.1:7107:7108").unwrap();
        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[0].ip, "127.0.0.1");
        assert_eq!(endpoints[0].peering_port, 8107);
        assert_eq!(endpoints[0].api_port, 8108);
    }

    #[test]
    fn test_ipv6_addresses_are_bracketed() {
        let endpoints = resolve_nodes_config("[::1]:8107:8108").unwrap();
        assert_eq!(endpoints[0].ip, "[::1]");
        assert_eq!(endpoints[0].api_url(false), "http://[::1]:8108");
    }

    #[test]
    fn test_unresolvable_entry_collapses() {
        // One bad entry collapses; the good one survives.
        let endpoints = resolve_nodes_config(
            "definitely-not-a-real-host.invalid.:8107:8108,127.0.0.1:9107:9108",
        )
        .unwrap();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].api_port, 9108);
    }

    #[test]
    fn test_all_unresolvable_is_an_error() {
        let err =
            resolve_nodes_config("definitely-not-a-real-host.invalid.:8107:8108").unwrap_err();
        assert_eq!(err.code(), 503);
    }

    #[test]
    fn test_overlong_hostname_collapses() {
        let long_host = "a".repeat(65);
        let config = format!("{}:8107:8108", long_host);
        assert!(resolve_nodes_config(&config).is_err());
    }

    #[test]
    fn test_empty_config_rejected() {
        assert!(resolve_nodes_config("").is_err());
        assert!(resolve_nodes_config(" , ,").is_err());
    }

    #[test]
    fn test_malformed_entries_are_skipped() {
        let endpoints = resolve_nodes_config("127.0.0.1:8107,127.0.0.1:9107:9108").unwrap();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].peering_port, 9107);
    }
}
