//! Channel manager.

use crate::amount::Amount;
use crate::client::bounded;
use crate::config::{FundingConfig, TimeoutConfig};
use crate::error::{Error, Result};
use crate::funding::FundingService;
use crate::role::Role;
use crate::rpc::NodeId;
use crate::topology::{connect_pair, Topology};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// State of a channel opened by the harness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelState {
    /// Funding transaction broadcast, not yet usable.
    Pending,
    /// Active on the initiator.
    Open,
    /// Did not become active in time.
    Failed(String),
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Open => f.write_str("open"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// A channel between two Lightning roles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    /// Initiator.
    pub from: Role,
    /// Remote side.
    pub to: Role,
    /// Initiator's node id.
    pub from_node: NodeId,
    /// Remote node id.
    pub to_node: NodeId,
    /// Capacity.
    pub capacity: Amount,
    /// Funding outpoint, `txid:vout`.
    pub channel_point: String,
    /// Short channel id; zero until open.
    pub chan_id: u64,
    /// State.
    pub state: ChannelState,
}

impl Channel {
    /// Whether the channel is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state == ChannelState::Open
    }
}

/// Opens channels between ready Lightning nodes of a topology.
pub struct ChannelManager<'a> {
    config: &'a FundingConfig,
    timeouts: &'a TimeoutConfig,
}

impl<'a> ChannelManager<'a> {
    /// Manager using the given funding parameters and bounds.
    #[must_use]
    pub fn new(config: &'a FundingConfig, timeouts: &'a TimeoutConfig) -> Self {
        Self { config, timeouts }
    }

    /// Open a channel of `capacity` from `from` to `to`, funded by `funding`.
    ///
    /// Returns the channel once the funding transaction is broadcast. Its
    /// state is `Open` if it became active in time and `Failed` otherwise.
    ///
    /// # Errors
    ///
    /// Returns `Error::ChannelOpen` for a self-channel or a refused request,
    /// `Error::Sequencing` if an endpoint is not ready, and any funding error.
    pub async fn open(
        &self,
        topology: &Topology,
        funding: Role,
        from: Role,
        to: Role,
        capacity: Amount,
    ) -> Result<Channel> {
        if from == to {
            return Err(Error::ChannelOpen {
                from,
                to,
                reason: "a node cannot open a channel to itself".to_string(),
            });
        }
        let local = topology.peer(from)?;
        let remote = topology.peer(to)?;
        let chain = topology.node(funding)?.chain_rpc().ok_or_else(|| {
            Error::Sequencing(format!("funding node {funding} is not a ready chain node"))
        })?;
        let funder = FundingService::new(funding, chain, self.config, self.timeouts);
        let rpc = self.timeouts.rpc();

        if connect_pair(&local, &remote, self.timeouts).await? {
            debug!("Connected {} to {} for channel open", from, to);
        }

        let needed = capacity
            .checked_add(Amount::from_sat(self.config.fee_reserve_sat))
            .ok_or_else(|| Error::ChannelOpen {
                from,
                to,
                reason: format!("capacity {capacity} out of range"),
            })?;
        let confirmed = bounded(from, "wallet_balance", rpc, local.rpc.wallet_balance())
            .await?
            .confirmed;
        if confirmed < needed {
            let shortfall = needed.saturating_sub(confirmed);
            info!("Topping up {} with {} before opening channel", from, shortfall);
            funder
                .fund_wallets(std::slice::from_ref(&local), shortfall)
                .await?;
        }

        let channel_point = bounded(
            from,
            "open_channel",
            rpc,
            local.rpc.open_channel(&remote.node_id, capacity),
        )
        .await
        .map_err(|e| match e {
            Error::Rpc(reason) => Error::ChannelOpen { from, to, reason },
            other => other,
        })?;
        info!("Channel {} -> {} funded at {}", from, to, channel_point);

        let mut channel = Channel {
            from,
            to,
            from_node: local.node_id.clone(),
            to_node: remote.node_id.clone(),
            capacity,
            channel_point,
            chan_id: 0,
            state: ChannelState::Pending,
        };

        funder.confirm(self.config.channel_confirmations).await?;

        let bound = self.timeouts.channel_open();
        let deadline = Instant::now() + bound;
        loop {
            let channels = bounded(from, "list_channels", rpc, local.rpc.list_channels()).await?;
            if let Some(active) = channels
                .iter()
                .find(|c| c.channel_point == channel.channel_point && c.active)
            {
                channel.chan_id = active.chan_id;
                channel.state = ChannelState::Open;
                info!("Channel {} -> {} open ({})", from, to, channel.chan_id);
                return Ok(channel);
            }
            if Instant::now() >= deadline {
                let reason = format!("not active within {bound:?}");
                warn!("Channel {} -> {} {}", from, to, reason);
                channel.state = ChannelState::Failed(reason);
                return Ok(channel);
            }
            tokio::time::sleep(self.timeouts.poll_interval()).await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::backend::{NodeBackend, SimBackend};
    use crate::config::{HarnessConfig, SimConfig};
    use crate::launcher::NodeLauncher;
    use std::sync::Arc;

    async fn running(name: &str) -> (Topology, HarnessConfig) {
        let config = HarnessConfig::simulated();
        let backend: Arc<dyn NodeBackend> = Arc::new(SimBackend::new(name, SimConfig::default()));
        let launcher = NodeLauncher::new(backend, config.timeouts.clone());
        let mut topology = Topology::new(name, "simulated");
        launcher
            .launch_all(&Role::ALL, topology.nodes_mut())
            .await
            .unwrap();
        (topology, config)
    }

    #[tokio::test]
    async fn test_open_tops_up_and_activates() {
        let (topology, config) = running("chan-open").await;
        let manager = ChannelManager::new(&config.funding, &config.timeouts);

        let channel = manager
            .open(
                &topology,
                Role::Bitcoin,
                Role::Rebalancer,
                Role::ThirdParty,
                Amount::from_sat(500_000),
            )
            .await
            .unwrap();
        assert!(channel.is_open());
        assert_ne!(channel.chan_id, 0);
        assert_eq!(channel.capacity, Amount::from_sat(500_000));

        let third_party = topology.peer(Role::ThirdParty).unwrap();
        let remote_view = third_party.rpc.list_channels().await.unwrap();
        assert_eq!(remote_view.len(), 1);
        assert_eq!(remote_view[0].channel_point, channel.channel_point);
    }

    #[tokio::test]
    async fn test_self_channel_rejected() {
        let (topology, config) = running("chan-self").await;
        let manager = ChannelManager::new(&config.funding, &config.timeouts);
        let err = manager
            .open(&topology, Role::Bitcoin, Role::Custody, Role::Custody, Amount::from_sat(100_000))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ChannelOpen { from: Role::Custody, to: Role::Custody, .. }));
    }

    #[tokio::test]
    async fn test_too_few_confirmations_leaves_channel_failed() {
        let (topology, mut config) = running("chan-shallow").await;
        config.funding.channel_confirmations = 1;
        config.timeouts.channel_open_secs = 1;
        let manager = ChannelManager::new(&config.funding, &config.timeouts);

        let channel = manager
            .open(
                &topology,
                Role::Bitcoin,
                Role::Rebalancer,
                Role::Custody,
                Amount::from_sat(200_000),
            )
            .await
            .unwrap();
        assert!(matches!(channel.state, ChannelState::Failed(_)));
    }

    #[tokio::test]
    async fn test_undersized_channel_refused() {
        let (topology, config) = running("chan-small").await;
        let manager = ChannelManager::new(&config.funding, &config.timeouts);
        let err = manager
            .open(
                &topology,
                Role::Bitcoin,
                Role::Rebalancer,
                Role::Custody,
                Amount::from_sat(1_000),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ChannelOpen { .. }));
    }
}
