//! Configuration for lntest-harness topologies.

use crate::error::{Error, Result};
use crate::role::Role;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

// =============================================================================
// Port Isolation Constants
// =============================================================================

/// Minimum port for random topology allocation.
pub const PORT_RANGE_MIN: u16 = 20_000;

/// Maximum port for random topology allocation.
pub const PORT_RANGE_MAX: u16 = 60_000;

/// Ports reserved for each role (p2p, rpc, rest/zmq-block, zmq-tx).
pub const PORTS_PER_NODE: u16 = 4;

/// Node runtime used to back a topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process simulated regtest chain and Lightning graph.
    #[default]
    Simulated,
    /// Real `bitcoind` and `lnd` processes.
    Process,
}

/// Top-level harness configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// Roles to launch. Must include the funding role.
    #[serde(default = "default_roles")]
    pub roles: Vec<Role>,

    /// Node runtime.
    #[serde(default)]
    pub backend: BackendKind,

    /// Bounded waits.
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Funding and channel parameters.
    #[serde(default)]
    pub funding: FundingConfig,

    /// Process backend settings.
    #[serde(default)]
    pub process: ProcessConfig,

    /// Simulated backend settings.
    #[serde(default)]
    pub sim: SimConfig,

    /// Log level for the `lntest-topology` binary.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Timeouts and polling parameters.
///
/// Every bound is configurable; the defaults suit a local regtest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Time a node has to become ready.
    #[serde(default = "default_node_startup_secs")]
    pub node_startup_secs: u64,

    /// Interval between readiness/confirmation polls.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Attempts per peer pair in `connect_all`.
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,

    /// Delay between connection attempts.
    #[serde(default = "default_connect_retry_delay_ms")]
    pub connect_retry_delay_ms: u64,

    /// Bound on a single protocol call.
    #[serde(default = "default_rpc_secs")]
    pub rpc_secs: u64,

    /// Bound on waiting for funding confirmation.
    #[serde(default = "default_confirmation_secs")]
    pub confirmation_secs: u64,

    /// Bound on waiting for a channel to become active.
    #[serde(default = "default_channel_open_secs")]
    pub channel_open_secs: u64,

    /// Per-node bound on a graceful stop before the process is killed.
    #[serde(default = "default_node_stop_secs")]
    pub node_stop_secs: u64,
}

/// Funding and channel parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingConfig {
    /// Role whose wallet funds everything else.
    #[serde(default = "default_funding_role")]
    pub funding_role: Role,

    /// Lightning roles that receive on-chain funds in `prepare_ln_funds`.
    /// Empty means every launched Lightning role.
    #[serde(default)]
    pub prefund_roles: Vec<Role>,

    /// Blocks mined after an on-chain transfer.
    #[serde(default = "default_confirmations")]
    pub confirmations: u32,

    /// Blocks mined after a channel funding transaction.
    #[serde(default = "default_channel_confirmations")]
    pub channel_confirmations: u32,

    /// Upper bound on blocks mined while waiting for spendable funds.
    #[serde(default = "default_max_confirmation_blocks")]
    pub max_confirmation_blocks: u32,

    /// On-chain headroom kept above a channel's capacity for fees.
    #[serde(default = "default_fee_reserve_sat")]
    pub fee_reserve_sat: u64,
}

/// Settings for spawning real node processes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Path to the `bitcoind` binary.
    #[serde(default = "default_bitcoind_bin")]
    pub bitcoind_bin: PathBuf,

    /// Path to the `lnd` binary.
    #[serde(default = "default_lnd_bin")]
    pub lnd_bin: PathBuf,

    /// First port of the topology's port block.
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    /// Root directory for node data.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Remove the data directory on teardown.
    #[serde(default = "default_cleanup")]
    pub cleanup_data_dir: bool,

    /// bitcoind RPC user.
    #[serde(default = "default_rpc_user")]
    pub rpc_user: String,

    /// bitcoind RPC password.
    #[serde(default = "default_rpc_password")]
    pub rpc_password: String,

    /// Extra arguments appended to every `lnd` command line.
    #[serde(default)]
    pub extra_lnd_args: Vec<String>,
}

/// Settings for the simulated backend, including fault injection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimConfig {
    /// Time a simulated node takes to become ready.
    #[serde(default)]
    pub startup_delay_ms: u64,

    /// Roles that never become ready.
    #[serde(default)]
    pub unready_roles: Vec<Role>,

    /// Roles that refuse every peer connection.
    #[serde(default)]
    pub isolated_roles: Vec<Role>,

    /// Roles that ignore graceful stop requests.
    #[serde(default)]
    pub unresponsive_roles: Vec<Role>,

    /// Roles whose RPC calls hang forever.
    #[serde(default)]
    pub stalled_rpc_roles: Vec<Role>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            roles: default_roles(),
            backend: BackendKind::default(),
            timeouts: TimeoutConfig::default(),
            funding: FundingConfig::default(),
            process: ProcessConfig::default(),
            sim: SimConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            node_startup_secs: default_node_startup_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            connect_retries: default_connect_retries(),
            connect_retry_delay_ms: default_connect_retry_delay_ms(),
            rpc_secs: default_rpc_secs(),
            confirmation_secs: default_confirmation_secs(),
            channel_open_secs: default_channel_open_secs(),
            node_stop_secs: default_node_stop_secs(),
        }
    }
}

impl Default for FundingConfig {
    fn default() -> Self {
        Self {
            funding_role: default_funding_role(),
            prefund_roles: Vec::new(),
            confirmations: default_confirmations(),
            channel_confirmations: default_channel_confirmations(),
            max_confirmation_blocks: default_max_confirmation_blocks(),
            fee_reserve_sat: default_fee_reserve_sat(),
        }
    }
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            bitcoind_bin: default_bitcoind_bin(),
            lnd_bin: default_lnd_bin(),
            base_port: default_base_port(),
            data_dir: default_data_dir(),
            cleanup_data_dir: default_cleanup(),
            rpc_user: default_rpc_user(),
            rpc_password: default_rpc_password(),
            extra_lnd_args: Vec::new(),
        }
    }
}

impl TimeoutConfig {
    /// Node readiness bound.
    #[must_use]
    pub fn node_startup(&self) -> Duration {
        Duration::from_secs(self.node_startup_secs)
    }

    /// Poll interval.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Delay between connection attempts.
    #[must_use]
    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_delay_ms)
    }

    /// Protocol call bound.
    #[must_use]
    pub fn rpc(&self) -> Duration {
        Duration::from_secs(self.rpc_secs)
    }

    /// Funding confirmation bound.
    #[must_use]
    pub fn confirmation(&self) -> Duration {
        Duration::from_secs(self.confirmation_secs)
    }

    /// Channel activation bound.
    #[must_use]
    pub fn channel_open(&self) -> Duration {
        Duration::from_secs(self.channel_open_secs)
    }

    /// Per-node stop bound.
    #[must_use]
    pub fn node_stop(&self) -> Duration {
        Duration::from_secs(self.node_stop_secs)
    }
}

impl HarnessConfig {
    /// Simulated-backend preset with short timeouts.
    #[must_use]
    pub fn simulated() -> Self {
        Self {
            backend: BackendKind::Simulated,
            timeouts: TimeoutConfig {
                node_startup_secs: 5,
                poll_interval_ms: 10,
                connect_retry_delay_ms: 10,
                rpc_secs: 5,
                confirmation_secs: 5,
                channel_open_secs: 5,
                node_stop_secs: 2,
                ..TimeoutConfig::default()
            },
            ..Self::default()
        }
    }

    /// Process-backend preset using `bitcoind` and `lnd` from `PATH`.
    #[must_use]
    pub fn process() -> Self {
        Self {
            backend: BackendKind::Process,
            ..Self::default()
        }
    }

    /// Replace the role selection.
    #[must_use]
    pub fn with_roles(mut self, roles: impl IntoIterator<Item = Role>) -> Self {
        self.roles = roles.into_iter().collect();
        self
    }

    /// Lightning roles of this configuration in launch order.
    #[must_use]
    pub fn lightning_roles(&self) -> Vec<Role> {
        self.roles.iter().copied().filter(|r| r.is_lightning()).collect()
    }

    /// Lightning roles funded by `prepare_ln_funds`.
    #[must_use]
    pub fn prefund_roles(&self) -> Vec<Role> {
        if self.funding.prefund_roles.is_empty() {
            self.lightning_roles()
        } else {
            self.funding.prefund_roles.clone()
        }
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if roles are duplicated or missing the funding
    /// role, if prefund roles are not launched Lightning roles, if a polling
    /// parameter is zero, or if the process port block overflows.
    pub fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for role in &self.roles {
            if !seen.insert(*role) {
                return Err(Error::Config(format!("role {role} listed more than once")));
            }
        }

        if !seen.contains(&self.funding.funding_role) {
            return Err(Error::Config(format!(
                "funding role {} is not part of the topology",
                self.funding.funding_role
            )));
        }

        if self.funding.funding_role.is_lightning() {
            return Err(Error::Config(format!(
                "funding role {} must be the chain role",
                self.funding.funding_role
            )));
        }

        if let Some(role) = self
            .funding
            .prefund_roles
            .iter()
            .find(|r| !r.is_lightning() || !seen.contains(r))
        {
            return Err(Error::Config(format!(
                "prefund role {role} is not a launched Lightning role"
            )));
        }

        if self.timeouts.poll_interval_ms == 0 {
            return Err(Error::Config("poll interval must be non-zero".to_string()));
        }

        if self.timeouts.connect_retries == 0 {
            return Err(Error::Config(
                "at least one connection attempt is required".to_string(),
            ));
        }

        if self.backend == BackendKind::Process {
            let role_count = u16::try_from(Role::ALL.len())
                .map_err(|_| Error::Config("role count exceeds u16::MAX".to_string()))?;
            let max_port = self
                .process
                .base_port
                .checked_add(role_count * PORTS_PER_NODE)
                .ok_or_else(|| {
                    Error::Config(format!(
                        "Port range overflow: base_port {} exceeds u16::MAX",
                        self.process.base_port
                    ))
                })?;
            if max_port > PORT_RANGE_MAX {
                return Err(Error::Config(format!(
                    "Port range overflow: max port {max_port} exceeds PORT_RANGE_MAX {PORT_RANGE_MAX}"
                )));
            }
        }

        Ok(())
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Save configuration to a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn to_file(&self, path: &std::path::Path) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

fn default_roles() -> Vec<Role> {
    Role::ALL.to_vec()
}

const fn default_funding_role() -> Role {
    Role::Bitcoin
}

fn default_log_level() -> String {
    "info".to_string()
}

const fn default_node_startup_secs() -> u64 {
    30
}

const fn default_poll_interval_ms() -> u64 {
    100
}

const fn default_connect_retries() -> u32 {
    5
}

const fn default_connect_retry_delay_ms() -> u64 {
    500
}

const fn default_rpc_secs() -> u64 {
    30
}

const fn default_confirmation_secs() -> u64 {
    60
}

const fn default_channel_open_secs() -> u64 {
    60
}

const fn default_node_stop_secs() -> u64 {
    10
}

const fn default_confirmations() -> u32 {
    6
}

const fn default_channel_confirmations() -> u32 {
    6
}

const fn default_max_confirmation_blocks() -> u32 {
    200
}

const fn default_fee_reserve_sat() -> u64 {
    50_000
}

fn default_bitcoind_bin() -> PathBuf {
    std::env::var_os("LNTEST_BITCOIND").map_or_else(|| PathBuf::from("bitcoind"), PathBuf::from)
}

fn default_lnd_bin() -> PathBuf {
    std::env::var_os("LNTEST_LND").map_or_else(|| PathBuf::from("lnd"), PathBuf::from)
}

fn default_base_port() -> u16 {
    #[allow(clippy::cast_possible_truncation)] // Role::ALL has 4 entries
    let block = Role::ALL.len() as u16 * PORTS_PER_NODE;
    rand::thread_rng().gen_range(PORT_RANGE_MIN..PORT_RANGE_MAX - block)
}

fn default_data_dir() -> PathBuf {
    let suffix: u64 = rand::thread_rng().gen();
    std::env::temp_dir().join(format!("lntest_{suffix:x}"))
}

const fn default_cleanup() -> bool {
    true
}

fn default_rpc_user() -> String {
    "lntest".to_string()
}

fn default_rpc_password() -> String {
    "lntest".to_string()
}
