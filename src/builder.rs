//! Topology builder and launcher entry point.
//!
//! ```no_run
//! use lntest_harness::{Amount, HarnessConfig, LightningNodeLauncher, Role};
//!
//! # async fn run() -> lntest_harness::Result<()> {
//! let launcher = LightningNodeLauncher::new(HarnessConfig::simulated());
//! launcher
//!     .scoped("can_query_routes", |builder| async move {
//!         builder.start_node().await?;
//!         builder.connect_all().await?;
//!         builder.prepare_ln_funds(Amount::from_sat(1_000_000)).await?;
//!         builder
//!             .open_channel(Role::Rebalancer, Role::ThirdParty, Amount::from_sat(500_000))
//!             .await?;
//!         let clients = builder.get_clients().await?;
//!         let custody = clients.custody()?.node_id().clone();
//!         let routes = clients.rebalancer()?.query_routes(&custody, 1_000, 5).await?;
//!         println!("{} routes", routes.len());
//!         Ok(())
//!     })
//!     .await
//! # }
//! ```

use crate::amount::Amount;
use crate::backend::{backend_for, NodeBackend};
use crate::channel::{Channel, ChannelManager, ChannelState};
use crate::client::{ChainClient, Clients, NodeClient};
use crate::config::{BackendKind, HarnessConfig};
use crate::error::{Error, Result};
use crate::funding::FundingService;
use crate::launcher::{NodeLauncher, TeardownReport};
use crate::node::NodeState;
use crate::role::Role;
use crate::topology::{Topology, TopologyManifest, TopologyState};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

/// Names of topologies currently alive in this process.
fn active_names() -> &'static Mutex<HashSet<String>> {
    static ACTIVE: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    ACTIVE.get_or_init(|| Mutex::new(HashSet::new()))
}

fn reserve_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::Config("topology name must not be empty".to_string()));
    }
    if active_names().lock().insert(name.to_string()) {
        Ok(())
    } else {
        Err(Error::Config(format!("topology name {name} is already in use")))
    }
}

fn release_name(name: &str) {
    active_names().lock().remove(name);
}

/// Creates topologies from a shared configuration.
pub struct LightningNodeLauncher {
    config: HarnessConfig,
    created: AtomicUsize,
}

impl LightningNodeLauncher {
    /// Launcher for `config`.
    #[must_use]
    pub fn new(config: HarnessConfig) -> Self {
        Self {
            config,
            created: AtomicUsize::new(0),
        }
    }

    /// Configuration used for new topologies.
    #[must_use]
    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Create a builder for a topology called `name`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the configuration is invalid or another
    /// live topology already uses `name`.
    pub fn create_builder(&self, name: &str) -> Result<Builder> {
        self.config.validate()?;
        let mut config = self.config.clone();

        // Later topologies of the same launcher take OS-assigned ports so
        // they never collide with the first one's block
        let index = self.created.fetch_add(1, Ordering::SeqCst);
        if config.backend == BackendKind::Process && index > 0 {
            config.process.base_port = 0;
        }

        let backend = backend_for(&config, name)?;
        Builder::with_backend(name, config, backend)
    }

    /// Run `body` against a fresh topology, tearing it down afterwards
    /// whatever the outcome.
    ///
    /// The body runs on its own task. A panic in the body is re-raised after
    /// teardown. An error from the body wins over teardown trouble, which is
    /// only logged.
    ///
    /// # Errors
    ///
    /// Returns the body's error, or `Error::Config` if the builder cannot be
    /// created.
    pub async fn scoped<F, Fut, T>(&self, name: &str, body: F) -> Result<T>
    where
        F: FnOnce(Builder) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let builder = self.create_builder(name)?;
        let outcome = tokio::spawn(body(builder.clone())).await;
        let report = builder.teardown().await;
        if !report.is_clean() {
            warn!(
                "Topology {} teardown had to kill {:?}",
                builder.name(),
                report.forced
            );
        }

        match outcome {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => Err(Error::Sequencing(format!(
                "scoped body of {} was cancelled: {e}",
                builder.name()
            ))),
        }
    }
}

struct BuilderInner {
    name: String,
    config: HarnessConfig,
    launcher: NodeLauncher,
    backend_name: &'static str,
    state: RwLock<TopologyState>,
    topology: RwLock<Topology>,
    live: watch::Sender<bool>,
    /// Set once the name has gone back to the registry.
    released: AtomicBool,
}

impl BuilderInner {
    /// Return the name to the registry. Only the first call has an effect,
    /// so a stale handle never frees a name a newer topology holds.
    fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            release_name(&self.name);
        }
    }
}

impl Drop for BuilderInner {
    fn drop(&mut self) {
        let stopped = matches!(self.state.get_mut(), TopologyState::Stopped);
        if !stopped {
            let nodes = self.topology.get_mut().nodes_mut();
            let mut killed = 0;
            for node in nodes.values_mut() {
                if node.state() != &NodeState::Stopped {
                    node.kill();
                    killed += 1;
                }
            }
            self.live.send_replace(false);
            if killed > 0 {
                warn!(
                    "Topology {} dropped without teardown, killed {} nodes",
                    self.name, killed
                );
            }
        }
        self.release();
    }
}

/// Handle to one topology.
///
/// Cloning is cheap; all clones drive the same topology. Dropping the last
/// handle without [`Builder::teardown`] kills any remaining nodes.
#[derive(Clone)]
pub struct Builder {
    inner: Arc<BuilderInner>,
}

impl std::fmt::Debug for Builder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Builder")
            .field("name", &self.inner.name)
            .field("backend", &self.inner.backend_name)
            .finish_non_exhaustive()
    }
}

impl Builder {
    /// Builder over a caller-supplied backend.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the configuration is invalid or `name` is
    /// already in use.
    pub fn with_backend(
        name: &str,
        config: HarnessConfig,
        backend: Arc<dyn NodeBackend>,
    ) -> Result<Self> {
        config.validate()?;
        reserve_name(name)?;
        debug!("Created builder for topology {}", name);

        let backend_name = backend.name();
        let (live, _) = watch::channel(true);
        Ok(Self {
            inner: Arc::new(BuilderInner {
                name: name.to_string(),
                launcher: NodeLauncher::new(backend, config.timeouts.clone()),
                config,
                backend_name,
                state: RwLock::new(TopologyState::Created),
                topology: RwLock::new(Topology::new(name, backend_name)),
                live,
                released: AtomicBool::new(false),
            }),
        })
    }

    /// Topology name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Configuration of this topology.
    #[must_use]
    pub fn config(&self) -> &HarnessConfig {
        &self.inner.config
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> TopologyState {
        self.inner.state.read().await.clone()
    }

    async fn ensure_running(&self, operation: &str) -> Result<()> {
        match &*self.inner.state.read().await {
            TopologyState::Running => Ok(()),
            TopologyState::Created => Err(Error::Sequencing(format!(
                "{operation} requires start_node() first"
            ))),
            TopologyState::Stopped | TopologyState::TearingDown => {
                Err(Error::Sequencing(format!(
                    "{operation} called after topology {} was torn down",
                    self.inner.name
                )))
            }
            other => Err(Error::Sequencing(format!(
                "{operation} requires a running topology, {} is {other}",
                self.inner.name
            ))),
        }
    }

    /// Launch every configured role and wait until all are ready.
    ///
    /// # Errors
    ///
    /// Returns `Error::Sequencing` if called twice, or `Error::Startup`
    /// naming the roles that did not become ready. Nodes that did start stay
    /// in the topology until teardown.
    pub async fn start_node(&self) -> Result<()> {
        {
            let mut state = self.inner.state.write().await;
            if *state != TopologyState::Created {
                return Err(Error::Sequencing(format!(
                    "start_node on topology {} which is {}",
                    self.inner.name, *state
                )));
            }
            *state = TopologyState::Starting;
        }

        info!(
            "Starting topology {} with roles {:?}",
            self.inner.name, self.inner.config.roles
        );
        let result = {
            let mut topology = self.inner.topology.write().await;
            self.inner
                .launcher
                .launch_all(&self.inner.config.roles, topology.nodes_mut())
                .await
        };

        let mut state = self.inner.state.write().await;
        match result {
            Ok(()) => {
                *state = TopologyState::Running;
                info!("Topology {} is running", self.inner.name);
                Ok(())
            }
            Err(e) => {
                *state = TopologyState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    /// State of the node for `role`.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownRole` if no node was launched for `role`.
    pub async fn node_state(&self, role: Role) -> Result<NodeState> {
        Ok(self.inner.topology.read().await.node(role)?.state().clone())
    }

    /// Connect every pair of Lightning nodes. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns `Error::Sequencing` before `start_node`, or
    /// `Error::Connectivity` listing the pairs that could not be connected.
    pub async fn connect_all(&self) -> Result<usize> {
        self.ensure_running("connect_all").await?;
        self.inner
            .topology
            .read()
            .await
            .connect_all(&self.inner.config.timeouts)
            .await
    }

    /// Clients for every role of the topology.
    ///
    /// # Errors
    ///
    /// Returns `Error::Sequencing` before `start_node` or after teardown.
    pub async fn get_clients(&self) -> Result<Clients> {
        self.ensure_running("get_clients").await?;
        let topology = self.inner.topology.read().await;
        let timeout = self.inner.config.timeouts.rpc();

        let mut chain = None;
        let mut lightning = BTreeMap::new();
        for node in topology.nodes() {
            if let Some(rpc) = node.chain_rpc() {
                chain = Some(ChainClient::new(
                    node.role(),
                    rpc,
                    timeout,
                    self.inner.live.subscribe(),
                ));
            } else if let (Some(rpc), Some(node_id)) = (node.lightning_rpc(), node.node_id()) {
                lightning.insert(
                    node.role(),
                    NodeClient::new(
                        node.role(),
                        node_id.clone(),
                        node.address().to_string(),
                        rpc,
                        timeout,
                        self.inner.live.subscribe(),
                    ),
                );
            }
        }

        let chain = chain
            .ok_or_else(|| Error::Sequencing("topology has no ready chain node".to_string()))?;
        Ok(Clients::new(chain, lightning))
    }

    fn funding_service<'a>(&'a self, topology: &Topology) -> Result<FundingService<'a>> {
        let role = self.inner.config.funding.funding_role;
        let chain = topology
            .node(role)?
            .chain_rpc()
            .ok_or_else(|| Error::Sequencing(format!("funding node {role} is not ready")))?;
        Ok(FundingService::new(
            role,
            chain,
            &self.inner.config.funding,
            &self.inner.config.timeouts,
        ))
    }

    /// Mine until the funding node can spend `amount`. Returns its balance.
    ///
    /// # Errors
    ///
    /// Returns `Error::Sequencing` before `start_node`, or
    /// `Error::InsufficientConfirmation` if the block budget runs out.
    pub async fn prepare_funds(&self, amount: Amount) -> Result<Amount> {
        self.ensure_running("prepare_funds").await?;
        let topology = self.inner.topology.read().await;
        self.funding_service(&topology)?.prepare_funds(amount).await
    }

    /// Deposit `amount` on-chain into every prefund role's wallet and wait
    /// for confirmation.
    ///
    /// # Errors
    ///
    /// Returns `Error::Sequencing` before `start_node`, or
    /// `Error::InsufficientConfirmation` if deposits do not confirm in time.
    pub async fn prepare_ln_funds(&self, amount: Amount) -> Result<()> {
        self.ensure_running("prepare_ln_funds").await?;
        let topology = self.inner.topology.read().await;
        let targets = self
            .inner
            .config
            .prefund_roles()
            .into_iter()
            .map(|role| topology.peer(role))
            .collect::<Result<Vec<_>>>()?;
        info!(
            "Funding {} Lightning wallets with {} each",
            targets.len(),
            amount
        );
        self.funding_service(&topology)?
            .fund_wallets(&targets, amount)
            .await
    }

    /// Open a channel funded by the configured funding role.
    ///
    /// # Errors
    ///
    /// See [`Builder::open_channel_with`].
    pub async fn open_channel(&self, from: Role, to: Role, capacity: Amount) -> Result<Channel> {
        self.open_channel_with(self.inner.config.funding.funding_role, from, to, capacity)
            .await
    }

    /// Open a channel of `capacity` from `from` to `to`, topping up `from`'s
    /// wallet from `funding` if needed. Every call opens a new channel.
    ///
    /// # Errors
    ///
    /// Returns `Error::Sequencing` before `start_node` or for a non-ready
    /// endpoint, `Error::UnknownRole` for a role outside the topology, and
    /// `Error::ChannelOpen` if the channel is refused or not active in time.
    pub async fn open_channel_with(
        &self,
        funding: Role,
        from: Role,
        to: Role,
        capacity: Amount,
    ) -> Result<Channel> {
        self.ensure_running("open_channel").await?;
        let channel = {
            let topology = self.inner.topology.read().await;
            ChannelManager::new(&self.inner.config.funding, &self.inner.config.timeouts)
                .open(&topology, funding, from, to, capacity)
                .await?
        };

        self.inner
            .topology
            .write()
            .await
            .record_channel(channel.clone());

        match &channel.state {
            ChannelState::Open => Ok(channel),
            ChannelState::Failed(reason) => Err(Error::ChannelOpen {
                from,
                to,
                reason: reason.clone(),
            }),
            ChannelState::Pending => Err(Error::ChannelOpen {
                from,
                to,
                reason: "still pending".to_string(),
            }),
        }
    }

    /// Route `from` to `to` through `hub` by opening `from -> hub` and
    /// `hub -> to`, both of `capacity`.
    ///
    /// # Errors
    ///
    /// As [`Builder::open_channel`]; the second channel is not attempted if
    /// the first fails.
    pub async fn open_channel_via(
        &self,
        from: Role,
        hub: Role,
        to: Role,
        capacity: Amount,
    ) -> Result<(Channel, Channel)> {
        if hub == from || hub == to {
            return Err(Error::ChannelOpen {
                from,
                to,
                reason: format!("hub {hub} must differ from both endpoints"),
            });
        }
        let first = self.open_channel(from, hub, capacity).await?;
        let second = self.open_channel(hub, to, capacity).await?;
        Ok((first, second))
    }

    /// Channels opened so far.
    pub async fn channels(&self) -> Vec<Channel> {
        self.inner.topology.read().await.channels().to_vec()
    }

    /// JSON-serialisable description of the topology.
    pub async fn manifest(&self) -> TopologyManifest {
        self.inner.topology.read().await.manifest()
    }

    /// Stop every node and release the topology name.
    ///
    /// Safe after a failed or partial start and idempotent. Never fails:
    /// nodes that would not stop in time are killed and reported.
    pub async fn teardown(&self) -> TeardownReport {
        {
            let mut state = self.inner.state.write().await;
            if *state == TopologyState::Stopped {
                return TeardownReport::default();
            }
            *state = TopologyState::TearingDown;
        }
        info!("Tearing down topology {}", self.inner.name);
        self.inner.live.send_replace(false);

        let report = {
            let mut topology = self.inner.topology.write().await;
            self.inner.launcher.stop_all(topology.nodes_mut()).await
        };

        self.inner.release();
        *self.inner.state.write().await = TopologyState::Stopped;
        info!(
            "Topology {} stopped ({} graceful, {} forced)",
            self.inner.name,
            report.stopped.len(),
            report.forced.len()
        );
        report
    }
}
