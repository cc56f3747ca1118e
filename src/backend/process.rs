//! Real `bitcoind` and `lnd` processes on regtest.

use crate::backend::{LaunchedNode, NodeBackend, NodeProcess, NodeRpcHandle, Readiness, StopOutcome};
use crate::config::{ProcessConfig, PORTS_PER_NODE};
use crate::error::{Error, Result};
use crate::role::Role;
use crate::rpc::bitcoind::BitcoindRpcClient;
use crate::rpc::lnd::LndRestClient;
use crate::rpc::{ChainRpc, NodeRpc};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

/// Grace period for a killed process to be reaped.
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// Ports of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortBlock {
    /// Peer-to-peer listener.
    pub p2p: u16,
    /// RPC listener (bitcoind JSON-RPC, lnd gRPC).
    pub rpc: u16,
    /// lnd REST listener, or bitcoind ZMQ block publisher.
    pub rest: u16,
    /// bitcoind ZMQ transaction publisher (unused by lnd).
    pub aux: u16,
}

impl PortBlock {
    fn from_base(base: u16) -> Self {
        Self {
            p2p: base,
            rpc: base + 1,
            rest: base + 2,
            aux: base + 3,
        }
    }

    /// OS-assigned block. The bound listeners are pushed onto `held`; the
    /// caller keeps them until every block is allocated so no port repeats.
    fn ephemeral(held: &mut Vec<TcpListener>) -> Result<Self> {
        let mut ports = [0_u16; PORTS_PER_NODE as usize];
        for port in &mut ports {
            let listener = TcpListener::bind("127.0.0.1:0")?;
            *port = listener.local_addr()?.port();
            held.push(listener);
        }
        Ok(Self {
            p2p: ports[0],
            rpc: ports[1],
            rest: ports[2],
            aux: ports[3],
        })
    }
}

/// Allocate a port block per role: sequential from `base_port`, or
/// OS-assigned when `base_port` is zero.
fn allocate_ports(base_port: u16, roles: &[Role]) -> Result<BTreeMap<Role, PortBlock>> {
    let mut ports = BTreeMap::new();
    let mut held = Vec::new();
    for role in roles {
        let block = if base_port == 0 {
            PortBlock::ephemeral(&mut held)?
        } else {
            let index = Role::ALL
                .iter()
                .position(|r| r == role)
                .and_then(|i| u16::try_from(i).ok())
                .ok_or_else(|| Error::Config(format!("unsupported role {role}")))?;
            let base = index
                .checked_mul(PORTS_PER_NODE)
                .and_then(|offset| base_port.checked_add(offset))
                .filter(|base| base.checked_add(PORTS_PER_NODE).is_some())
                .ok_or_else(|| {
                    Error::Config(format!("Port range overflow: base_port {base_port}"))
                })?;
            PortBlock::from_base(base)
        };
        ports.insert(*role, block);
    }
    drop(held);
    Ok(ports)
}

/// Backend spawning `bitcoind -regtest` and `lnd` processes.
pub struct ProcessBackend {
    topology: String,
    config: ProcessConfig,
    data_dir: PathBuf,
    ports: BTreeMap<Role, PortBlock>,
}

impl ProcessBackend {
    /// Backend for the topology `name`. Data lives in `config.data_dir/name`.
    ///
    /// # Errors
    ///
    /// Returns an error if ports cannot be allocated.
    pub fn new(name: &str, config: &ProcessConfig, roles: &[Role]) -> Result<Self> {
        Ok(Self {
            topology: name.to_string(),
            config: config.clone(),
            data_dir: config.data_dir.join(name),
            ports: allocate_ports(config.base_port, roles)?,
        })
    }

    /// Ports assigned to `role`.
    #[must_use]
    pub fn ports(&self, role: Role) -> Option<PortBlock> {
        self.ports.get(&role).copied()
    }

    fn role_ports(&self, role: Role) -> Result<PortBlock> {
        self.ports(role)
            .ok_or_else(|| {
                Error::UnknownRole(format!("{role} is not part of topology {}", self.topology))
            })
    }

    fn chain_ports(&self) -> Result<PortBlock> {
        self.ports
            .iter()
            .find(|(role, _)| !role.is_lightning())
            .map(|(_, ports)| *ports)
            .ok_or_else(|| Error::Config("topology has no chain role".to_string()))
    }

    fn bitcoind_command(&self, dir: &Path, ports: PortBlock) -> Command {
        let mut cmd = Command::new(&self.config.bitcoind_bin);
        cmd.arg("-regtest")
            .arg("-server")
            .arg("-listen=1")
            .arg("-txindex=1")
            .arg("-printtoconsole=0")
            .arg("-fallbackfee=0.0002")
            .arg(format!("-datadir={}", dir.display()))
            .arg(format!("-port={}", ports.p2p))
            .arg(format!("-rpcport={}", ports.rpc))
            .arg("-rpcbind=127.0.0.1")
            .arg("-rpcallowip=127.0.0.1")
            .arg(format!("-rpcuser={}", self.config.rpc_user))
            .arg(format!("-rpcpassword={}", self.config.rpc_password))
            .arg(format!("-zmqpubrawblock=tcp://127.0.0.1:{}", ports.rest))
            .arg(format!("-zmqpubrawtx=tcp://127.0.0.1:{}", ports.aux));
        cmd
    }

    fn lnd_command(&self, role: Role, dir: &Path, ports: PortBlock, chain: PortBlock) -> Command {
        let mut cmd = Command::new(&self.config.lnd_bin);
        cmd.arg(format!("--lnddir={}", dir.display()))
            .arg("--noseedbackup")
            .arg("--bitcoin.active")
            .arg("--bitcoin.regtest")
            .arg("--bitcoin.node=bitcoind")
            .arg(format!("--bitcoind.rpchost=127.0.0.1:{}", chain.rpc))
            .arg(format!("--bitcoind.rpcuser={}", self.config.rpc_user))
            .arg(format!("--bitcoind.rpcpass={}", self.config.rpc_password))
            .arg(format!("--bitcoind.zmqpubrawblock=tcp://127.0.0.1:{}", chain.rest))
            .arg(format!("--bitcoind.zmqpubrawtx=tcp://127.0.0.1:{}", chain.aux))
            .arg(format!("--listen=127.0.0.1:{}", ports.p2p))
            .arg(format!("--rpclisten=127.0.0.1:{}", ports.rpc))
            .arg(format!("--restlisten=127.0.0.1:{}", ports.rest))
            .arg(format!("--alias={}-{}", self.topology, role.slug()))
            .arg("--trickledelay=50")
            .arg("--debuglevel=info")
            .args(&self.config.extra_lnd_args);
        cmd
    }

    fn spawn(mut cmd: Command, dir: &Path, role: Role) -> Result<Child> {
        let log = std::fs::File::create(dir.join("stdout.log"))?;
        let err_log = log.try_clone()?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(err_log))
            .kill_on_drop(true);
        debug!("Running {} command: {:?}", role, cmd);
        cmd.spawn()
            .map_err(|e| Error::Process(format!("Failed to spawn {role}: {e}")))
    }
}

#[async_trait]
impl NodeBackend for ProcessBackend {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn launch(&self, role: Role) -> Result<LaunchedNode> {
        let ports = self.role_ports(role)?;
        let dir = self.data_dir.join(role.slug());
        tokio::fs::create_dir_all(&dir).await?;

        let address = format!("127.0.0.1:{}", ports.p2p);
        let process: Box<dyn NodeProcess> = if role.is_lightning() {
            let chain = self.chain_ports()?;
            let child = Self::spawn(self.lnd_command(role, &dir, ports, chain), &dir, role)?;
            info!("Spawned lnd for {} (REST 127.0.0.1:{})", role, ports.rest);
            Box::new(LndProcess {
                role,
                child,
                rest_url: format!("https://127.0.0.1:{}", ports.rest),
                macaroon: dir
                    .join("data")
                    .join("chain")
                    .join("bitcoin")
                    .join("regtest")
                    .join("admin.macaroon"),
                client: None,
            })
        } else {
            let child = Self::spawn(self.bitcoind_command(&dir, ports), &dir, role)?;
            info!("Spawned bitcoind for {} (RPC 127.0.0.1:{})", role, ports.rpc);
            let client = BitcoindRpcClient::new(
                format!("http://127.0.0.1:{}", ports.rpc),
                &self.config.rpc_user,
                &self.config.rpc_password,
            )?;
            Box::new(BitcoindProcess {
                role,
                child,
                client: Arc::new(client),
            })
        };

        Ok(LaunchedNode { address, process })
    }

    async fn cleanup(&self) {
        if !self.config.cleanup_data_dir {
            return;
        }
        if let Err(e) = tokio::fs::remove_dir_all(&self.data_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    "Failed to remove data directory {}: {}",
                    self.data_dir.display(),
                    e
                );
            }
        }
    }
}

/// Fail if the process already exited.
fn check_alive(child: &mut Child, role: Role) -> Result<()> {
    match child.try_wait()? {
        Some(status) => Err(Error::Process(format!("{role} exited with {status}"))),
        None => Ok(()),
    }
}

/// Ask nicely via `request`, then wait; kill on timeout.
async fn stop_child<F>(child: &mut Child, role: Role, bound: Duration, request: F) -> StopOutcome
where
    F: std::future::Future<Output = Result<()>> + Send,
{
    if matches!(child.try_wait(), Ok(Some(_))) {
        return StopOutcome::Graceful;
    }

    let deadline = Instant::now() + bound;
    match timeout(bound, request).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Stop request to {} failed: {}", role, e),
        Err(_) => debug!("Stop request to {} timed out", role),
    }

    let remaining = deadline.saturating_duration_since(Instant::now());
    match timeout(remaining, child.wait()).await {
        Ok(Ok(status)) => {
            debug!("{} exited with {}", role, status);
            StopOutcome::Graceful
        }
        Ok(Err(e)) => {
            warn!("Failed to wait for {}: {}", role, e);
            force_kill(child, role).await;
            StopOutcome::Forced
        }
        Err(_) => {
            warn!("{} did not stop within {:?}, killing", role, bound);
            force_kill(child, role).await;
            StopOutcome::Forced
        }
    }
}

async fn force_kill(child: &mut Child, role: Role) {
    if let Err(e) = child.start_kill() {
        warn!("Failed to kill {}: {}", role, e);
        return;
    }
    if timeout(REAP_TIMEOUT, child.wait()).await.is_err() {
        warn!("{} was killed but not reaped within {:?}", role, REAP_TIMEOUT);
    }
}

/// A `bitcoind -regtest` process.
struct BitcoindProcess {
    role: Role,
    child: Child,
    client: Arc<BitcoindRpcClient>,
}

#[async_trait]
impl NodeProcess for BitcoindProcess {
    async fn poll_ready(&mut self) -> Result<Option<Readiness>> {
        check_alive(&mut self.child, self.role)?;
        // RPC errors while bitcoind warms up are expected
        if let Err(e) = self.client.block_height().await {
            debug!("{} not answering yet: {}", self.role, e);
            return Ok(None);
        }
        if let Err(e) = self.client.ensure_wallet().await {
            debug!("{} wallet not ready: {}", self.role, e);
            return Ok(None);
        }
        Ok(Some(Readiness {
            rpc: NodeRpcHandle::Chain(self.client.clone()),
            node_id: None,
        }))
    }

    async fn stop(&mut self, bound: Duration) -> StopOutcome {
        let client = self.client.clone();
        stop_child(&mut self.child, self.role, bound, async move {
            client.stop().await
        })
        .await
    }

    fn kill(&mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!("Kill {}: {}", self.role, e);
        }
    }
}

/// An `lnd` process. The REST client exists once lnd has written its macaroon.
struct LndProcess {
    role: Role,
    child: Child,
    rest_url: String,
    macaroon: PathBuf,
    client: Option<Arc<LndRestClient>>,
}

#[async_trait]
impl NodeProcess for LndProcess {
    async fn poll_ready(&mut self) -> Result<Option<Readiness>> {
        check_alive(&mut self.child, self.role)?;

        let client = match &self.client {
            Some(client) => client.clone(),
            None => {
                if !tokio::fs::try_exists(&self.macaroon).await.unwrap_or(false) {
                    return Ok(None);
                }
                let client = Arc::new(LndRestClient::from_macaroon_file(
                    self.rest_url.clone(),
                    &self.macaroon,
                )?);
                self.client = Some(client.clone());
                client
            }
        };

        match client.get_info().await {
            Ok(info) if info.synced_to_chain => Ok(Some(Readiness {
                rpc: NodeRpcHandle::Lightning(client),
                node_id: Some(info.node_id),
            })),
            Ok(_) => {
                debug!("{} is syncing to chain", self.role);
                Ok(None)
            }
            Err(e) => {
                debug!("{} not answering yet: {}", self.role, e);
                Ok(None)
            }
        }
    }

    async fn stop(&mut self, bound: Duration) -> StopOutcome {
        let client = self.client.clone();
        stop_child(&mut self.child, self.role, bound, async move {
            match client {
                Some(client) => client.stop().await,
                None => Ok(()),
            }
        })
        .await
    }

    fn kill(&mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!("Kill {}: {}", self.role, e);
        }
    }
}
