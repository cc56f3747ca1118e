//! Regtest chain model: blocks, coinbase maturity, mempool and per-role wallets.

use crate::amount::SATS_PER_BTC;
use crate::error::{Error, Result};
use crate::role::Role;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Blocks a coinbase output must be buried under before it is spendable.
pub const COINBASE_MATURITY: u64 = 100;

/// Regtest subsidy halving interval.
pub const HALVING_INTERVAL: u64 = 150;

/// Subsidy of the first block.
pub const INITIAL_SUBSIDY_SAT: u64 = 50 * SATS_PER_BTC;

/// Flat fee paid by every simulated transaction.
pub const TX_FEE_SAT: u64 = 2_000;

#[derive(Debug, Default)]
struct Wallet {
    confirmed: u64,
    unconfirmed: u64,
    /// Coinbase rewards as `(block height, amount)`.
    immature: Vec<(u64, u64)>,
}

#[derive(Debug)]
struct Transaction {
    /// Wallet outputs; channel funding outputs belong to no wallet.
    outputs: Vec<(Role, u64)>,
    fee: u64,
    block_height: Option<u64>,
}

/// Chain tip, mempool and wallets of a simulated regtest network.
#[derive(Debug)]
pub struct Chain {
    salt: String,
    height: u64,
    seq: u64,
    wallets: HashMap<Role, Wallet>,
    addresses: HashMap<String, Role>,
    mempool: Vec<String>,
    transactions: HashMap<String, Transaction>,
}

impl Chain {
    /// Empty chain at height zero. `salt` keeps ids of different topologies apart.
    pub fn new(salt: &str) -> Self {
        Self {
            salt: salt.to_string(),
            height: 0,
            seq: 0,
            wallets: HashMap::new(),
            addresses: HashMap::new(),
            mempool: Vec::new(),
            transactions: HashMap::new(),
        }
    }

    /// Current tip height.
    pub fn height(&self) -> u64 {
        self.height
    }

    fn digest(&mut self, tag: &str) -> String {
        self.seq += 1;
        let mut hasher = Sha256::new();
        hasher.update(self.salt.as_bytes());
        hasher.update(tag.as_bytes());
        hasher.update(self.seq.to_be_bytes());
        hex::encode(hasher.finalize())
    }

    /// Fresh receive address owned by `owner`.
    pub fn new_address(&mut self, owner: Role) -> String {
        let address = format!("bcrt1q{}", &self.digest("address")[..38]);
        self.addresses.insert(address.clone(), owner);
        self.wallets.entry(owner).or_default();
        address
    }

    /// `(confirmed, unconfirmed)` balance of `role`.
    pub fn balance(&self, role: Role) -> (u64, u64) {
        self.wallets
            .get(&role)
            .map_or((0, 0), |w| (w.confirmed, w.unconfirmed))
    }

    fn debit(&mut self, from: Role, amount: u64) -> Result<()> {
        let needed = amount
            .checked_add(TX_FEE_SAT)
            .ok_or_else(|| Error::Rpc("amount out of range".to_string()))?;
        let wallet = self.wallets.entry(from).or_default();
        if wallet.confirmed < needed {
            return Err(Error::Rpc(format!(
                "insufficient funds: {} sat available, {needed} sat required",
                wallet.confirmed
            )));
        }
        wallet.confirmed -= needed;
        Ok(())
    }

    fn broadcast(&mut self, outputs: Vec<(Role, u64)>) -> String {
        let txid = self.digest("tx");
        for (owner, amount) in &outputs {
            self.wallets.entry(*owner).or_default().unconfirmed += amount;
        }
        self.transactions.insert(
            txid.clone(),
            Transaction {
                outputs,
                fee: TX_FEE_SAT,
                block_height: None,
            },
        );
        self.mempool.push(txid.clone());
        txid
    }

    /// Pay `amount` from `from`'s confirmed balance to `address`.
    pub fn send(&mut self, from: Role, address: &str, amount: u64) -> Result<String> {
        if amount == 0 {
            return Err(Error::Rpc("amount must be positive".to_string()));
        }
        let owner = *self
            .addresses
            .get(address)
            .ok_or_else(|| Error::Rpc(format!("invalid address: {address}")))?;
        self.debit(from, amount)?;
        Ok(self.broadcast(vec![(owner, amount)]))
    }

    /// Lock `amount` of `from`'s funds into a channel funding output.
    pub fn fund_channel(&mut self, from: Role, amount: u64) -> Result<String> {
        self.debit(from, amount)?;
        Ok(self.broadcast(Vec::new()))
    }

    /// Mine `count` blocks paying the coinbase to `miner`.
    pub fn mine(&mut self, count: u32, miner: Role) -> Vec<String> {
        let mut hashes = Vec::with_capacity(count as usize);
        for _ in 0..count {
            self.height += 1;
            let height = self.height;

            let mut fees = 0;
            for txid in std::mem::take(&mut self.mempool) {
                let Some(tx) = self.transactions.get_mut(&txid) else {
                    continue;
                };
                tx.block_height = Some(height);
                fees += tx.fee;
                for (owner, amount) in &tx.outputs {
                    let wallet = self.wallets.entry(*owner).or_default();
                    wallet.unconfirmed = wallet.unconfirmed.saturating_sub(*amount);
                    wallet.confirmed += amount;
                }
            }

            let subsidy = INITIAL_SUBSIDY_SAT
                .checked_shr(u32::try_from(height / HALVING_INTERVAL).unwrap_or(u32::MAX))
                .unwrap_or(0);
            self.wallets
                .entry(miner)
                .or_default()
                .immature
                .push((height, subsidy + fees));

            for wallet in self.wallets.values_mut() {
                let (mature, immature): (Vec<_>, Vec<_>) = wallet
                    .immature
                    .iter()
                    .partition(|(mined_at, _)| height >= mined_at + COINBASE_MATURITY);
                wallet.confirmed += mature.iter().map(|(_, amount)| amount).sum::<u64>();
                wallet.immature = immature;
            }

            hashes.push(self.digest("block"));
        }
        hashes
    }

    /// Confirmations of `txid`; zero while in the mempool, `None` if unknown.
    pub fn confirmations(&self, txid: &str) -> Option<u32> {
        let tx = self.transactions.get(txid)?;
        Some(tx.block_height.map_or(0, |h| {
            u32::try_from(self.height - h + 1).unwrap_or(u32::MAX)
        }))
    }

    /// Height of the block that confirmed `txid`.
    pub fn confirmed_at(&self, txid: &str) -> Option<u64> {
        self.transactions.get(txid)?.block_height
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_coinbase_matures_after_100_blocks() {
        let mut chain = Chain::new("t");
        chain.mine(100, Role::Bitcoin);
        assert_eq!(chain.balance(Role::Bitcoin).0, 0);

        chain.mine(1, Role::Bitcoin);
        assert_eq!(chain.balance(Role::Bitcoin).0, INITIAL_SUBSIDY_SAT);
        assert_eq!(chain.height(), 101);
    }

    #[test]
    fn test_transfer_confirms_on_next_block() {
        let mut chain = Chain::new("t");
        chain.mine(101, Role::Bitcoin);
        let address = chain.new_address(Role::Custody);

        let txid = chain.send(Role::Bitcoin, &address, 100_000).unwrap();
        assert_eq!(chain.balance(Role::Custody), (0, 100_000));
        assert_eq!(chain.confirmations(&txid), Some(0));

        chain.mine(1, Role::Bitcoin);
        assert_eq!(chain.balance(Role::Custody), (100_000, 0));
        assert_eq!(chain.confirmations(&txid), Some(1));
        assert_eq!(chain.confirmed_at(&txid), Some(102));
        assert_eq!(
            chain.balance(Role::Bitcoin).0,
            INITIAL_SUBSIDY_SAT - 100_000 - TX_FEE_SAT
        );
    }

    #[test]
    fn test_overspend_rejected() {
        let mut chain = Chain::new("t");
        let address = chain.new_address(Role::Custody);
        assert!(chain.send(Role::Bitcoin, &address, 1).is_err());
        assert!(chain.send(Role::Bitcoin, "bcrt1qunknown", 1).is_err());
    }

    #[test]
    fn test_subsidy_halves() {
        let mut chain = Chain::new("t");
        chain.mine(HALVING_INTERVAL as u32 - 1, Role::Bitcoin);
        chain.mine(1, Role::Rebalancer);
        chain.mine(COINBASE_MATURITY as u32, Role::Bitcoin);
        assert_eq!(chain.balance(Role::Rebalancer).0, INITIAL_SUBSIDY_SAT / 2);
    }

    #[test]
    fn test_unknown_txid() {
        let chain = Chain::new("t");
        assert_eq!(chain.confirmations("00"), None);
    }
}
