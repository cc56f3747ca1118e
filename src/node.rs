//! A node of a topology.

use crate::backend::{NodeProcess, NodeRpcHandle, StopOutcome};
use crate::role::Role;
use crate::rpc::{ChainRpc, NodeId, NodeRpc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Readiness state of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeState {
    /// Spawned, not yet answering.
    Starting,
    /// Answering RPCs.
    Ready,
    /// Never became ready, or exited.
    Failed(String),
    /// Stopped by teardown.
    Stopped,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => f.write_str("starting"),
            Self::Ready => f.write_str("ready"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
            Self::Stopped => f.write_str("stopped"),
        }
    }
}

/// A launched node, owned exclusively by its topology.
pub struct Node {
    role: Role,
    address: String,
    state: NodeState,
    node_id: Option<NodeId>,
    rpc: Option<NodeRpcHandle>,
    process: Box<dyn NodeProcess>,
}

impl Node {
    pub(crate) fn new(role: Role, address: String, process: Box<dyn NodeProcess>) -> Self {
        Self {
            role,
            address,
            state: NodeState::Starting,
            node_id: None,
            rpc: None,
            process,
        }
    }

    /// Role of this node.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Peer-to-peer address.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> &NodeState {
        &self.state
    }

    /// Whether the node is ready.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state == NodeState::Ready
    }

    /// Lightning identity, once ready.
    #[must_use]
    pub fn node_id(&self) -> Option<&NodeId> {
        self.node_id.as_ref()
    }

    /// Lightning RPC of a ready Lightning node.
    #[must_use]
    pub fn lightning_rpc(&self) -> Option<Arc<dyn NodeRpc>> {
        match (&self.state, &self.rpc) {
            (NodeState::Ready, Some(NodeRpcHandle::Lightning(rpc))) => Some(rpc.clone()),
            _ => None,
        }
    }

    /// Chain RPC of a ready chain node.
    #[must_use]
    pub fn chain_rpc(&self) -> Option<Arc<dyn ChainRpc>> {
        match (&self.state, &self.rpc) {
            (NodeState::Ready, Some(NodeRpcHandle::Chain(rpc))) => Some(rpc.clone()),
            _ => None,
        }
    }

    pub(crate) fn process_mut(&mut self) -> &mut dyn NodeProcess {
        self.process.as_mut()
    }

    pub(crate) fn mark_ready(&mut self, rpc: NodeRpcHandle, node_id: Option<NodeId>) {
        self.rpc = Some(rpc);
        self.node_id = node_id;
        self.state = NodeState::Ready;
    }

    pub(crate) fn mark_failed(&mut self, reason: impl Into<String>) {
        self.state = NodeState::Failed(reason.into());
    }

    /// Stop the process; the RPC handle is dropped either way.
    pub(crate) async fn stop(&mut self, timeout: Duration) -> StopOutcome {
        let outcome = self.process.stop(timeout).await;
        self.rpc = None;
        self.state = NodeState::Stopped;
        outcome
    }

    pub(crate) fn kill(&mut self) {
        self.process.kill();
        self.rpc = None;
        self.state = NodeState::Stopped;
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("role", &self.role)
            .field("address", &self.address)
            .field("state", &self.state)
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}
