//! Topology: the nodes of one named test session and their peer mesh.

use crate::channel::Channel;
use crate::client::bounded;
use crate::config::TimeoutConfig;
use crate::error::{Error, Result};
use crate::node::{Node, NodeState};
use crate::role::Role;
use crate::rpc::{NodeId, NodeRpc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Lifecycle of a topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TopologyState {
    /// Builder created, nothing launched.
    Created,
    /// Nodes launching.
    Starting,
    /// All nodes ready.
    Running,
    /// Startup failed; teardown still required.
    Failed(String),
    /// Teardown in progress.
    TearingDown,
    /// All nodes stopped.
    Stopped,
}

impl fmt::Display for TopologyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => f.write_str("created"),
            Self::Starting => f.write_str("starting"),
            Self::Running => f.write_str("running"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
            Self::TearingDown => f.write_str("tearing down"),
            Self::Stopped => f.write_str("stopped"),
        }
    }
}

/// A ready Lightning node as seen by the peer mesh.
#[derive(Clone)]
pub(crate) struct Peer {
    pub role: Role,
    pub node_id: NodeId,
    pub address: String,
    pub rpc: Arc<dyn NodeRpc>,
}

/// Nodes and channels of one topology.
#[derive(Debug)]
pub struct Topology {
    name: String,
    backend: &'static str,
    nodes: BTreeMap<Role, Node>,
    channels: Vec<Channel>,
}

impl Topology {
    pub(crate) fn new(name: &str, backend: &'static str) -> Self {
        Self {
            name: name.to_string(),
            backend,
            nodes: BTreeMap::new(),
            channels: Vec::new(),
        }
    }

    /// Topology name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Node of `role`.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownRole` if the role was never launched.
    pub fn node(&self, role: Role) -> Result<&Node> {
        self.nodes
            .get(&role)
            .ok_or_else(|| {
                Error::UnknownRole(format!("{role} is not part of topology {}", self.name))
            })
    }

    /// All nodes in role order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub(crate) fn nodes_mut(&mut self) -> &mut BTreeMap<Role, Node> {
        &mut self.nodes
    }

    /// Channels opened so far, in opening order.
    #[must_use]
    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    /// Channels in which `role` takes part.
    pub fn channels_of(&self, role: Role) -> impl Iterator<Item = &Channel> {
        self.channels
            .iter()
            .filter(move |c| c.from == role || c.to == role)
    }

    pub(crate) fn record_channel(&mut self, channel: Channel) {
        self.channels.push(channel);
    }

    /// Ready Lightning node of `role`.
    pub(crate) fn peer(&self, role: Role) -> Result<Peer> {
        let node = self.node(role)?;
        if !role.is_lightning() {
            return Err(Error::UnknownRole(format!("{role} is not a Lightning role")));
        }
        match (node.lightning_rpc(), node.node_id()) {
            (Some(rpc), Some(node_id)) => Ok(Peer {
                role,
                node_id: node_id.clone(),
                address: node.address().to_string(),
                rpc,
            }),
            _ => Err(Error::Sequencing(format!(
                "{role} is not ready (state: {})",
                node.state()
            ))),
        }
    }

    /// Ready Lightning nodes in role order.
    pub(crate) fn ready_peers(&self) -> Vec<Peer> {
        self.nodes
            .keys()
            .filter(|r| r.is_lightning())
            .filter_map(|r| self.peer(*r).ok())
            .collect()
    }

    /// Connect every pair of ready Lightning nodes.
    ///
    /// Pairs that are already peered are skipped, so calling this again is
    /// a no-op. Returns the number of new links.
    ///
    /// # Errors
    ///
    /// Returns `Error::Connectivity` listing every pair that could not be
    /// connected within `connect_retries` attempts. Links made before the
    /// failure are kept.
    pub async fn connect_all(&self, timeouts: &TimeoutConfig) -> Result<usize> {
        let peers = self.ready_peers();
        let mut tasks = JoinSet::new();
        for (i, a) in peers.iter().enumerate() {
            for b in &peers[i + 1..] {
                let (a, b, timeouts) = (a.clone(), b.clone(), timeouts.clone());
                tasks.spawn(async move {
                    let pair = (a.role, b.role);
                    (pair, connect_pair(&a, &b, &timeouts).await)
                });
            }
        }

        let mut created = 0;
        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(true))) => created += 1,
                Ok((_, Ok(false))) => {}
                Ok(((a, b), Err(e))) => failures.push(format!("{a} <-> {b}: {e}")),
                Err(e) => failures.push(format!("connect task failed: {e}")),
            }
        }

        if failures.is_empty() {
            info!(
                "Topology {} fully connected ({} new links)",
                self.name, created
            );
            Ok(created)
        } else {
            failures.sort();
            Err(Error::Connectivity(failures.join("; ")))
        }
    }

    /// Snapshot for the manifest.
    #[must_use]
    pub fn manifest(&self) -> TopologyManifest {
        TopologyManifest {
            name: self.name.clone(),
            backend: self.backend.to_string(),
            nodes: self
                .nodes
                .values()
                .map(|n| NodeManifest {
                    role: n.role(),
                    node_id: n.node_id().cloned(),
                    address: n.address().to_string(),
                    state: n.state().clone(),
                })
                .collect(),
            channels: self.channels.clone(),
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Connect `a` to `b` unless they are already peered.
///
/// Returns whether a new link was made.
pub(crate) async fn connect_pair(a: &Peer, b: &Peer, timeouts: &TimeoutConfig) -> Result<bool> {
    let rpc_bound = timeouts.rpc();
    let peers = bounded(a.role, "list_peers", rpc_bound, a.rpc.list_peers()).await?;
    if peers.contains(&b.node_id) {
        debug!("{} and {} already peered", a.role, b.role);
        return Ok(false);
    }

    let mut last_error = None;
    for attempt in 1..=timeouts.connect_retries {
        match bounded(
            a.role,
            "connect_peer",
            rpc_bound,
            a.rpc.connect_peer(&b.node_id, &b.address),
        )
        .await
        {
            Ok(()) => {
                debug!("Connected {} -> {} on attempt {}", a.role, b.role, attempt);
                return Ok(true);
            }
            Err(e) => {
                debug!(
                    "Connect {} -> {} attempt {}/{} failed: {}",
                    a.role, b.role, attempt, timeouts.connect_retries, e
                );
                last_error = Some(e);
            }
        }
        if attempt < timeouts.connect_retries {
            tokio::time::sleep(timeouts.connect_retry_delay()).await;
        }
    }

    let reason = last_error.map_or_else(|| "no attempt made".to_string(), |e| e.to_string());
    warn!("Giving up connecting {} -> {}: {}", a.role, b.role, reason);
    Err(Error::Connectivity(format!(
        "{} attempts failed, last error: {reason}",
        timeouts.connect_retries
    )))
}

/// A node entry of the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeManifest {
    /// Role.
    pub role: Role,
    /// Lightning identity.
    pub node_id: Option<NodeId>,
    /// Peer-to-peer address.
    pub address: String,
    /// State at snapshot time.
    pub state: NodeState,
}

/// JSON description of a topology.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyManifest {
    /// Topology name.
    pub name: String,
    /// Backend name.
    pub backend: String,
    /// Nodes.
    pub nodes: Vec<NodeManifest>,
    /// Channels.
    pub channels: Vec<Channel>,
    /// Snapshot time (RFC 3339).
    pub created_at: String,
}
