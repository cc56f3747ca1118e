//! `NodeRpc` and `ChainRpc` over a [`SimNetwork`].

use super::SimNetwork;
use crate::amount::Amount;
use crate::error::{Error, Result};
use crate::role::Role;
use crate::rpc::{
    unix_now, ChainRpc, ChannelSummary, Invoice, NodeId, NodeInfo, NodeRpc, PendingChannel,
    Route, WalletBalance,
};
use async_trait::async_trait;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Block until the caller gives up when the role is configured to stall.
async fn stall_if(stalled: bool) {
    if stalled {
        std::future::pending::<()>().await;
    }
}

/// Lightning RPC of a simulated node.
pub struct SimNodeRpc {
    network: SimNetwork,
    role: Role,
    stalled: bool,
}

impl SimNodeRpc {
    pub(crate) fn new(network: SimNetwork, role: Role, stalled: bool) -> Self {
        Self {
            network,
            role,
            stalled,
        }
    }

    async fn enter(&self) -> Result<()> {
        stall_if(self.stalled).await;
        if self.network.is_online(self.role) {
            Ok(())
        } else {
            Err(Error::Rpc(format!("{} is not running", self.role)))
        }
    }
}

#[async_trait]
impl NodeRpc for SimNodeRpc {
    async fn get_info(&self) -> Result<NodeInfo> {
        self.enter().await?;
        let node_id = self.network.node_id(self.role);
        Ok(self.network.with_state(|state| {
            let (active, pending) = state.graph.count_channels(self.role);
            NodeInfo {
                node_id,
                alias: format!("{}-{}", state.topology, self.role.slug()),
                num_peers: u32::try_from(state.graph.peers(self.role).len()).unwrap_or(u32::MAX),
                num_active_channels: active,
                num_pending_channels: pending,
                block_height: state.chain.height(),
                synced_to_chain: true,
            }
        }))
    }

    async fn connect_peer(&self, node_id: &NodeId, address: &str) -> Result<()> {
        self.enter().await?;
        self.network
            .with_state(|state| state.graph.connect(self.role, node_id, address))
    }

    async fn list_peers(&self) -> Result<Vec<NodeId>> {
        self.enter().await?;
        Ok(self.network.with_state(|state| state.graph.peers(self.role)))
    }

    async fn new_address(&self) -> Result<String> {
        self.enter().await?;
        Ok(self
            .network
            .with_state(|state| state.chain.new_address(self.role)))
    }

    async fn wallet_balance(&self) -> Result<WalletBalance> {
        self.enter().await?;
        let (confirmed, unconfirmed) = self
            .network
            .with_state(|state| state.chain.balance(self.role));
        Ok(WalletBalance {
            confirmed: Amount::from_sat(confirmed),
            unconfirmed: Amount::from_sat(unconfirmed),
        })
    }

    async fn open_channel(&self, peer: &NodeId, capacity: Amount) -> Result<String> {
        self.enter().await?;
        self.network.with_state(|state| {
            let remote = state
                .graph
                .check_channel_request(self.role, peer, capacity.as_sat())?;
            let txid = state.chain.fund_channel(self.role, capacity.as_sat())?;
            Ok(state
                .graph
                .add_pending(self.role, remote, capacity.as_sat(), txid))
        })
    }

    async fn list_channels(&self) -> Result<Vec<ChannelSummary>> {
        self.enter().await?;
        Ok(self
            .network
            .with_state(|state| state.graph.channel_summaries(self.role)))
    }

    async fn pending_channels(&self) -> Result<Vec<PendingChannel>> {
        self.enter().await?;
        Ok(self.network.with_state(|state| state.graph.pending(self.role)))
    }

    async fn create_invoice(
        &self,
        amount_msat: u64,
        memo: &str,
        expiry: Duration,
    ) -> Result<Invoice> {
        self.enter().await?;
        if expiry.is_zero() {
            return Err(Error::Rpc("invoice expiry must be positive".to_string()));
        }

        let mut preimage = [0_u8; 32];
        rand::thread_rng().fill_bytes(&mut preimage);
        let payment_hash = hex::encode(Sha256::digest(preimage));
        let amount_pico = u128::from(amount_msat) * 10;

        Ok(Invoice {
            payment_request: format!("lnbcrt{amount_pico}p1p{}", &payment_hash[..52]),
            payment_hash,
            amount_msat,
            memo: memo.to_string(),
            created_at: unix_now(),
            expiry_secs: expiry.as_secs(),
            destination: self.network.node_id(self.role),
        })
    }

    async fn query_routes(
        &self,
        destination: &NodeId,
        amount_msat: u64,
        max_results: usize,
    ) -> Result<Vec<Route>> {
        self.enter().await?;
        Ok(self.network.with_state(|state| {
            let tip = state.chain.height();
            state
                .graph
                .find_routes(self.role, destination, amount_msat, tip, max_results)
        }))
    }

    async fn stop(&self) -> Result<()> {
        self.enter().await?;
        self.network.set_online(self.role, false);
        Ok(())
    }
}

/// Chain RPC of the simulated funding node.
pub struct SimChainRpc {
    network: SimNetwork,
    role: Role,
    stalled: bool,
}

impl SimChainRpc {
    pub(crate) fn new(network: SimNetwork, role: Role, stalled: bool) -> Self {
        Self {
            network,
            role,
            stalled,
        }
    }

    async fn enter(&self) -> Result<()> {
        stall_if(self.stalled).await;
        if self.network.is_online(self.role) {
            Ok(())
        } else {
            Err(Error::Rpc(format!("{} is not running", self.role)))
        }
    }
}

#[async_trait]
impl ChainRpc for SimChainRpc {
    async fn block_height(&self) -> Result<u64> {
        self.enter().await?;
        Ok(self.network.height())
    }

    async fn new_address(&self) -> Result<String> {
        self.enter().await?;
        Ok(self
            .network
            .with_state(|state| state.chain.new_address(self.role)))
    }

    async fn balance(&self) -> Result<Amount> {
        self.enter().await?;
        let (confirmed, _) = self
            .network
            .with_state(|state| state.chain.balance(self.role));
        Ok(Amount::from_sat(confirmed))
    }

    async fn send_to_address(&self, address: &str, amount: Amount) -> Result<String> {
        self.enter().await?;
        self.network
            .with_state(|state| state.chain.send(self.role, address, amount.as_sat()))
    }

    async fn generate_blocks(&self, count: u32) -> Result<Vec<String>> {
        self.enter().await?;
        Ok(self.network.with_state(|state| state.mine(count, self.role)))
    }

    async fn confirmations(&self, txid: &str) -> Result<Option<u32>> {
        self.enter().await?;
        Ok(self
            .network
            .with_state(|state| state.chain.confirmations(txid)))
    }

    async fn stop(&self) -> Result<()> {
        self.enter().await?;
        self.network.set_online(self.role, false);
        Ok(())
    }
}
