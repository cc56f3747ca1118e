//! Node runtimes.
//!
//! A [`NodeBackend`] knows how to bring up the node for a [`Role`]; the
//! returned [`NodeProcess`] is owned by the topology and is the only way to
//! observe readiness or terminate the node.

pub mod process;
pub mod sim;

use crate::config::{BackendKind, HarnessConfig};
use crate::error::Result;
use crate::role::Role;
use crate::rpc::{ChainRpc, NodeId, NodeRpc};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub use process::ProcessBackend;
pub use sim::{SimBackend, SimNetwork};

/// RPC handle of a ready node.
#[derive(Clone)]
pub enum NodeRpcHandle {
    /// Lightning node.
    Lightning(Arc<dyn NodeRpc>),
    /// Regtest chain node.
    Chain(Arc<dyn ChainRpc>),
}

/// What a node reports once it is ready.
#[derive(Clone)]
pub struct Readiness {
    /// RPC handle.
    pub rpc: NodeRpcHandle,
    /// Lightning identity; `None` for the chain node.
    pub node_id: Option<NodeId>,
}

/// How a node ended up stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The node shut down on request within the bound.
    Graceful,
    /// The node had to be killed.
    Forced,
}

/// A spawned node, ready or not.
#[async_trait]
pub trait NodeProcess: Send + Sync {
    /// Check readiness once.
    ///
    /// `Ok(None)` means still starting; an error means the node can no longer
    /// become ready (e.g. the process exited).
    async fn poll_ready(&mut self) -> Result<Option<Readiness>>;

    /// Stop the node, killing it if it does not exit within `timeout`.
    async fn stop(&mut self, timeout: Duration) -> StopOutcome;

    /// Terminate immediately without waiting. Safe to call from `Drop`.
    fn kill(&mut self);
}

/// A freshly launched node.
pub struct LaunchedNode {
    /// Peer-to-peer address (`host:port`).
    pub address: String,
    /// Process handle.
    pub process: Box<dyn NodeProcess>,
}

/// Starts nodes for a topology.
#[async_trait]
pub trait NodeBackend: Send + Sync {
    /// Short name for logs and manifests.
    fn name(&self) -> &'static str;

    /// Spawn the node for `role`. Returns as soon as the node is spawned;
    /// readiness is observed through [`NodeProcess::poll_ready`].
    async fn launch(&self, role: Role) -> Result<LaunchedNode>;

    /// Release backend resources (data directories) after all nodes stopped.
    async fn cleanup(&self);
}

/// Build the backend selected by `config` for the topology `name`.
///
/// # Errors
///
/// Returns an error if the process backend cannot allocate ports.
pub fn backend_for(config: &HarnessConfig, name: &str) -> Result<Arc<dyn NodeBackend>> {
    Ok(match config.backend {
        BackendKind::Simulated => Arc::new(SimBackend::new(name, config.sim.clone())),
        BackendKind::Process => {
            Arc::new(ProcessBackend::new(name, &config.process, &config.roles)?)
        }
    })
}
