//! Funding service: mined coins for the chain wallet, on-chain deposits for
//! Lightning wallets.

use crate::amount::Amount;
use crate::client::bounded;
use crate::config::{FundingConfig, TimeoutConfig};
use crate::error::{Error, Result};
use crate::role::Role;
use crate::rpc::ChainRpc;
use crate::topology::Peer;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info};

/// Height at which the first coinbase becomes spendable on regtest.
const FIRST_MATURE_HEIGHT: u64 = 101;

/// Moves regtest coins from the funding node to where they are needed.
pub struct FundingService<'a> {
    role: Role,
    chain: Arc<dyn ChainRpc>,
    config: &'a FundingConfig,
    timeouts: &'a TimeoutConfig,
}

impl<'a> FundingService<'a> {
    /// Service drawing on the chain node `role`.
    #[must_use]
    pub fn new(
        role: Role,
        chain: Arc<dyn ChainRpc>,
        config: &'a FundingConfig,
        timeouts: &'a TimeoutConfig,
    ) -> Self {
        Self {
            role,
            chain,
            config,
            timeouts,
        }
    }

    /// Role of the funding node.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Mine until the funding wallet can spend at least `amount`.
    ///
    /// Returns the spendable balance.
    ///
    /// # Errors
    ///
    /// Returns `Error::InsufficientConfirmation` if `max_confirmation_blocks`
    /// blocks are not enough.
    pub async fn prepare_funds(&self, amount: Amount) -> Result<Amount> {
        let rpc = self.timeouts.rpc();
        let budget = self.config.max_confirmation_blocks;
        let mut mined = 0_u32;

        loop {
            let balance = bounded(self.role, "balance", rpc, self.chain.balance()).await?;
            if balance >= amount {
                info!("{} holds {} spendable ({} blocks mined)", self.role, balance, mined);
                return Ok(balance);
            }
            if mined >= budget {
                return Err(Error::InsufficientConfirmation(format!(
                    "{} holds {} after mining {} blocks, {} required",
                    self.role, balance, mined, amount
                )));
            }

            let height = bounded(self.role, "block_height", rpc, self.chain.block_height()).await?;
            let wanted = u32::try_from(FIRST_MATURE_HEIGHT.saturating_sub(height))
                .unwrap_or(u32::MAX)
                .max(1);
            let batch = wanted.min(budget - mined);
            debug!("Mining {} blocks at height {}", batch, height);
            bounded(self.role, "generate_blocks", rpc, self.chain.generate_blocks(batch)).await?;
            mined += batch;
        }
    }

    /// Mine the configured number of confirmations.
    ///
    /// # Errors
    ///
    /// Returns an error if the chain node rejects the request.
    pub async fn confirm(&self, blocks: u32) -> Result<()> {
        if blocks == 0 {
            return Ok(());
        }
        bounded(
            self.role,
            "generate_blocks",
            self.timeouts.rpc(),
            self.chain.generate_blocks(blocks),
        )
        .await?;
        Ok(())
    }

    /// Send `amount` to each target wallet, mine `confirmations` blocks and
    /// wait until every wallet shows the deposit as confirmed.
    pub(crate) async fn fund_wallets(&self, targets: &[Peer], amount: Amount) -> Result<()> {
        if targets.is_empty() || amount == Amount::ZERO {
            return Ok(());
        }

        let count = u64::try_from(targets.len()).unwrap_or(u64::MAX);
        let total = Amount::from_sat(amount.as_sat().saturating_mul(count))
            .checked_add(Amount::from_sat(self.config.fee_reserve_sat))
            .ok_or_else(|| Error::Config(format!("funding total overflows for {amount}")))?;
        self.prepare_funds(total).await?;

        let rpc = self.timeouts.rpc();
        let mut expected = Vec::with_capacity(targets.len());
        for peer in targets {
            let before = bounded(peer.role, "wallet_balance", rpc, peer.rpc.wallet_balance())
                .await?
                .confirmed;
            let address = bounded(peer.role, "new_address", rpc, peer.rpc.new_address()).await?;
            let txid = bounded(
                self.role,
                "send_to_address",
                rpc,
                self.chain.send_to_address(&address, amount),
            )
            .await?;
            info!("Sent {} to {} in {}", amount, peer.role, txid);
            let target = before
                .checked_add(amount)
                .ok_or_else(|| Error::Config(format!("{} balance overflows", peer.role)))?;
            expected.push((peer, target));
        }

        self.confirm(self.config.confirmations).await?;

        let bound = self.timeouts.confirmation();
        let deadline = Instant::now() + bound;
        loop {
            let mut waiting = Vec::new();
            for (peer, target) in &expected {
                let balance =
                    bounded(peer.role, "wallet_balance", rpc, peer.rpc.wallet_balance()).await?;
                if balance.confirmed < *target {
                    waiting.push(peer.role);
                }
            }
            if waiting.is_empty() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                let roles: Vec<String> = waiting.iter().map(ToString::to_string).collect();
                return Err(Error::InsufficientConfirmation(format!(
                    "deposit of {} to {} not confirmed within {:?}",
                    amount,
                    roles.join(", "),
                    bound
                )));
            }
            tokio::time::sleep(self.timeouts.poll_interval()).await;
        }
    }
}
