//! Node launcher.
//!
//! Nodes start in two phases: the chain node first, since every Lightning
//! node needs its backend, then all Lightning nodes in parallel behind a
//! join barrier. Teardown stops nodes in reverse order, each under its own
//! bound.
//!
//! Between the phases one block is mined: a fresh regtest chain sits at the
//! genesis block, whose timestamp is too old for lnd to consider itself
//! synced.

use crate::backend::{NodeBackend, StopOutcome};
use crate::client::bounded;
use crate::config::TimeoutConfig;
use crate::error::{Error, Result};
use crate::node::{Node, NodeState};
use crate::role::Role;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

/// Blocks mined on the chain node before the Lightning phase.
const TIP_BLOCKS: u32 = 1;

/// Outcome of tearing a topology down.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownReport {
    /// Nodes that stopped on request.
    pub stopped: Vec<Role>,
    /// Nodes that had to be killed.
    pub forced: Vec<Role>,
}

impl TeardownReport {
    /// Whether every node stopped gracefully.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.forced.is_empty()
    }
}

/// Result of launching one role.
struct LaunchOutcome {
    role: Role,
    /// Present whenever a process was spawned, ready or not.
    node: Option<Node>,
    failure: Option<String>,
}

/// Starts and stops the nodes of a topology.
pub struct NodeLauncher {
    backend: Arc<dyn NodeBackend>,
    timeouts: TimeoutConfig,
}

impl NodeLauncher {
    /// Launcher over `backend`.
    #[must_use]
    pub fn new(backend: Arc<dyn NodeBackend>, timeouts: TimeoutConfig) -> Self {
        Self { backend, timeouts }
    }

    /// Launch `roles` and wait for readiness.
    ///
    /// Every spawned node lands in `nodes`, including those that failed, so
    /// teardown can reach them.
    ///
    /// # Errors
    ///
    /// Returns `Error::Startup` naming every role that did not become ready.
    /// Lightning roles are not launched if the chain node fails.
    pub async fn launch_all(&self, roles: &[Role], nodes: &mut BTreeMap<Role, Node>) -> Result<()> {
        let (lightning, chain): (Vec<Role>, Vec<Role>) =
            roles.iter().copied().partition(|r| r.is_lightning());

        info!(
            "Launching {} nodes on the {} backend",
            roles.len(),
            self.backend.name()
        );

        if !chain.is_empty() {
            self.launch_phase(&chain, nodes).await?;
            if !lightning.is_empty() {
                self.advance_tip(&chain, nodes).await?;
            }
        }
        if !lightning.is_empty() {
            self.launch_phase(&lightning, nodes).await?;
        }

        info!("All {} nodes ready", roles.len());
        Ok(())
    }

    /// Mine [`TIP_BLOCKS`] on each ready chain node.
    async fn advance_tip(&self, chain: &[Role], nodes: &BTreeMap<Role, Node>) -> Result<()> {
        for role in chain {
            let Some(rpc) = nodes.get(role).and_then(Node::chain_rpc) else {
                continue;
            };
            bounded(
                *role,
                "generate_blocks",
                self.timeouts.rpc(),
                rpc.generate_blocks(TIP_BLOCKS),
            )
            .await
            .map_err(|e| Error::Startup {
                roles: vec![*role],
                reason: format!("could not mine the initial block: {e}"),
            })?;
            debug!("Mined {} block(s) on {} before the Lightning phase", TIP_BLOCKS, role);
        }
        Ok(())
    }

    async fn launch_phase(&self, roles: &[Role], nodes: &mut BTreeMap<Role, Node>) -> Result<()> {
        let mut tasks = JoinSet::new();
        for role in roles {
            let backend = self.backend.clone();
            let timeouts = self.timeouts.clone();
            let role = *role;
            tasks.spawn(async move { launch_one(backend, timeouts, role).await });
        }

        let mut failed = Vec::new();
        let mut reasons = Vec::new();
        let mut joined = Vec::new();
        while let Some(joined_task) = tasks.join_next().await {
            match joined_task {
                Ok(outcome) => {
                    joined.push(outcome.role);
                    if let Some(reason) = outcome.failure {
                        warn!("{} failed to start: {}", outcome.role, reason);
                        failed.push(outcome.role);
                        reasons.push(format!("{}: {}", outcome.role, reason));
                    }
                    if let Some(node) = outcome.node {
                        nodes.insert(outcome.role, node);
                    }
                }
                Err(e) => reasons.push(format!("launch task failed: {e}")),
            }
        }

        // A task that panicked never reported its role
        for role in roles {
            if !joined.contains(role) {
                failed.push(*role);
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            failed.sort();
            Err(Error::Startup {
                roles: failed,
                reason: reasons.join("; "),
            })
        }
    }

    /// Stop every node in reverse role order, each under `node_stop`.
    /// Never fails; nodes that had to be killed are listed in the report.
    pub async fn stop_all(&self, nodes: &mut BTreeMap<Role, Node>) -> TeardownReport {
        let mut report = TeardownReport::default();
        let bound = self.timeouts.node_stop();

        for (role, node) in nodes.iter_mut().rev() {
            if node.state() == &NodeState::Stopped {
                continue;
            }
            debug!("Stopping {}", role);
            match node.stop(bound).await {
                StopOutcome::Graceful => report.stopped.push(*role),
                StopOutcome::Forced => {
                    warn!("{} did not stop within {:?} and was killed", role, bound);
                    report.forced.push(*role);
                }
            }
        }

        self.backend.cleanup().await;
        report
    }
}

async fn launch_one(
    backend: Arc<dyn NodeBackend>,
    timeouts: TimeoutConfig,
    role: Role,
) -> LaunchOutcome {
    let launched = match backend.launch(role).await {
        Ok(launched) => launched,
        Err(e) => {
            return LaunchOutcome {
                role,
                node: None,
                failure: Some(e.to_string()),
            }
        }
    };

    let mut node = Node::new(role, launched.address, launched.process);
    let bound = timeouts.node_startup();
    let deadline = Instant::now() + bound;

    let failure = loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break Some(format!("not ready within {bound:?}"));
        }
        match timeout(remaining, node.process_mut().poll_ready()).await {
            Ok(Ok(Some(readiness))) => {
                node.mark_ready(readiness.rpc, readiness.node_id);
                debug!("{} ready at {}", role, node.address());
                break None;
            }
            Ok(Ok(None)) => tokio::time::sleep(timeouts.poll_interval()).await,
            Ok(Err(e)) => break Some(e.to_string()),
            Err(_) => break Some(format!("not ready within {bound:?}")),
        }
    };

    if let Some(reason) = &failure {
        node.mark_failed(reason.clone());
    }

    LaunchOutcome {
        role,
        node: Some(node),
        failure,
    }
}
