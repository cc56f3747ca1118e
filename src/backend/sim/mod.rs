//! In-process regtest network.
//!
//! One [`SimNetwork`] per topology holds a [`Chain`] and a Lightning
//! [`Graph`] behind a single lock. Nodes launched by [`SimBackend`] share it
//! and are driven through the same [`NodeRpc`]/[`ChainRpc`] traits as real
//! processes, so everything above the backend runs unchanged.
//!
//! Faults are injected per role through [`SimConfig`].
//!
//! [`NodeRpc`]: crate::rpc::NodeRpc
//! [`ChainRpc`]: crate::rpc::ChainRpc

pub mod chain;
pub mod graph;
mod rpc;

pub use chain::Chain;
pub use graph::{ForwardingPolicy, Graph};
pub use rpc::{SimChainRpc, SimNodeRpc};

use crate::backend::{LaunchedNode, NodeBackend, NodeProcess, NodeRpcHandle, Readiness, StopOutcome};
use crate::config::SimConfig;
use crate::error::{Error, Result};
use crate::role::Role;
use crate::rpc::NodeId;
use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// First simulated peer-to-peer port.
const SIM_P2P_PORT_BASE: u16 = 9_735;

#[derive(Debug)]
pub(crate) struct SimState {
    pub topology: String,
    pub chain: Chain,
    pub graph: Graph,
    pub online_chain: bool,
}

impl SimState {
    /// Mine blocks and open channels that reached their confirmation depth.
    pub(crate) fn mine(&mut self, count: u32, miner: Role) -> Vec<String> {
        let hashes = self.chain.mine(count, miner);
        let chain = &self.chain;
        self.graph
            .activate_confirmed(chain.height(), |txid| chain.confirmed_at(txid));
        hashes
    }
}

/// Shared simulated chain and Lightning graph.
#[derive(Debug, Clone)]
pub struct SimNetwork {
    state: Arc<Mutex<SimState>>,
}

impl SimNetwork {
    /// Empty network for the topology `name`.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                topology: name.to_string(),
                chain: Chain::new(name),
                graph: Graph::default(),
                online_chain: false,
            })),
        }
    }

    pub(crate) fn with_state<T>(&self, f: impl FnOnce(&mut SimState) -> T) -> T {
        f(&mut self.state.lock())
    }

    /// Deterministic node id for `role` within this topology.
    #[must_use]
    pub fn node_id(&self, role: Role) -> NodeId {
        let topology = self.state.lock().topology.clone();
        let mut hasher = Sha256::new();
        hasher.update(topology.as_bytes());
        hasher.update(role.slug().as_bytes());
        NodeId::new(format!("02{}", hex::encode(hasher.finalize())))
    }

    /// Current chain height.
    #[must_use]
    pub fn height(&self) -> u64 {
        self.state.lock().chain.height()
    }

    /// Override the forwarding policy of a launched Lightning node.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownRole` if `role` has no Lightning node.
    pub fn set_policy(&self, role: Role, policy: ForwardingPolicy) -> Result<()> {
        self.with_state(|state| state.graph.set_policy(role, policy))
    }

    fn register(&self, role: Role, isolated: bool) -> String {
        let port = Role::ALL
            .iter()
            .position(|r| *r == role)
            .and_then(|i| u16::try_from(i).ok())
            .map_or(SIM_P2P_PORT_BASE, |i| SIM_P2P_PORT_BASE + i);
        let address = format!("127.0.0.1:{port}");
        if role.is_lightning() {
            let node_id = self.node_id(role);
            self.with_state(|state| state.graph.add_node(role, node_id, address.clone(), isolated));
        }
        address
    }

    pub(crate) fn set_online(&self, role: Role, online: bool) {
        self.with_state(|state| {
            if role.is_lightning() {
                state.graph.set_online(role, online);
            } else {
                state.online_chain = online;
            }
        });
    }

    /// Whether the node of `role` is up.
    #[must_use]
    pub fn is_online(&self, role: Role) -> bool {
        self.with_state(|state| {
            if role.is_lightning() {
                state.graph.node(role).is_some_and(|n| n.online)
            } else {
                state.online_chain
            }
        })
    }
}

/// Backend running every node inside a [`SimNetwork`].
pub struct SimBackend {
    network: SimNetwork,
    config: SimConfig,
}

impl SimBackend {
    /// Backend with a fresh network for the topology `name`.
    #[must_use]
    pub fn new(name: &str, config: SimConfig) -> Self {
        Self {
            network: SimNetwork::new(name),
            config,
        }
    }

    /// The shared network, for inspection and policy tweaks.
    #[must_use]
    pub fn network(&self) -> SimNetwork {
        self.network.clone()
    }
}

#[async_trait]
impl NodeBackend for SimBackend {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn launch(&self, role: Role) -> Result<LaunchedNode> {
        let address = self
            .network
            .register(role, self.config.isolated_roles.contains(&role));
        debug!("Simulated {} listening on {}", role, address);

        let process = SimProcess {
            network: self.network.clone(),
            role,
            ready_at: Instant::now() + Duration::from_millis(self.config.startup_delay_ms),
            never_ready: self.config.unready_roles.contains(&role),
            unresponsive: self.config.unresponsive_roles.contains(&role),
            stalled: self.config.stalled_rpc_roles.contains(&role),
            stopped: false,
        };

        Ok(LaunchedNode {
            address,
            process: Box::new(process),
        })
    }

    async fn cleanup(&self) {}
}

/// Handle to a simulated node.
pub struct SimProcess {
    network: SimNetwork,
    role: Role,
    ready_at: Instant,
    never_ready: bool,
    unresponsive: bool,
    stalled: bool,
    stopped: bool,
}

#[async_trait]
impl NodeProcess for SimProcess {
    async fn poll_ready(&mut self) -> Result<Option<Readiness>> {
        if self.stopped {
            return Err(Error::Process(format!("{} has stopped", self.role)));
        }
        if self.never_ready || Instant::now() < self.ready_at {
            return Ok(None);
        }

        self.network.set_online(self.role, true);
        let readiness = if self.role.is_lightning() {
            Readiness {
                rpc: NodeRpcHandle::Lightning(Arc::new(SimNodeRpc::new(
                    self.network.clone(),
                    self.role,
                    self.stalled,
                ))),
                node_id: Some(self.network.node_id(self.role)),
            }
        } else {
            Readiness {
                rpc: NodeRpcHandle::Chain(Arc::new(SimChainRpc::new(
                    self.network.clone(),
                    self.role,
                    self.stalled,
                ))),
                node_id: None,
            }
        };
        Ok(Some(readiness))
    }

    async fn stop(&mut self, timeout: Duration) -> StopOutcome {
        if self.unresponsive {
            tokio::time::sleep(timeout).await;
            self.kill();
            return StopOutcome::Forced;
        }
        self.network.set_online(self.role, false);
        self.stopped = true;
        StopOutcome::Graceful
    }

    fn kill(&mut self) {
        self.network.set_online(self.role, false);
        self.stopped = true;
    }
}
