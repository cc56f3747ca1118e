//! Node RPC boundary.
//!
//! Every node in a topology is driven through one of two traits:
//! - [`NodeRpc`] for Lightning nodes (info, peers, wallet, channels, invoices, routes)
//! - [`ChainRpc`] for the regtest chain node (addresses, transfers, mining)
//!
//! Two implementations exist per trait: the REST/JSON-RPC clients in
//! [`lnd`] and [`bitcoind`] for real processes, and the in-process
//! simulator in [`crate::backend::sim`].

pub mod bitcoind;
pub mod lnd;

use crate::amount::Amount;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Hex-encoded compressed public key identifying a Lightning node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Wrap a hex public key, normalising to lowercase.
    #[must_use]
    pub fn new(hex_pubkey: impl Into<String>) -> Self {
        Self(hex_pubkey.into().to_ascii_lowercase())
    }

    /// Hex representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this looks like a 33-byte compressed public key.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        self.0.len() == 66
            && (self.0.starts_with("02") || self.0.starts_with("03"))
            && hex::decode(&self.0).is_ok()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity and sync status of a Lightning node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Node public key.
    pub node_id: NodeId,
    /// Node alias.
    pub alias: String,
    /// Connected peers.
    pub num_peers: u32,
    /// Active channels.
    pub num_active_channels: u32,
    /// Channels awaiting confirmation.
    pub num_pending_channels: u32,
    /// Chain tip as seen by the node.
    pub block_height: u64,
    /// Whether the node has caught up with the chain.
    pub synced_to_chain: bool,
}

/// A payment request issued by a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    /// Encoded payment request.
    pub payment_request: String,
    /// Hex payment hash.
    pub payment_hash: String,
    /// Requested amount.
    pub amount_msat: u64,
    /// Description.
    pub memo: String,
    /// Creation time, seconds since the unix epoch.
    pub created_at: u64,
    /// Validity window in seconds.
    pub expiry_secs: u64,
    /// Issuing node.
    pub destination: NodeId,
}

impl Invoice {
    /// Unix time after which the invoice can no longer be paid.
    #[must_use]
    pub fn expires_at(&self) -> u64 {
        self.created_at.saturating_add(self.expiry_secs)
    }

    /// Whether the invoice has expired at the given unix time.
    #[must_use]
    pub fn is_expired_at(&self, unix_secs: u64) -> bool {
        unix_secs >= self.expires_at()
    }

    /// Whether the invoice has expired now.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(unix_now())
    }

    /// Validity window.
    #[must_use]
    pub fn expiry(&self) -> Duration {
        Duration::from_secs(self.expiry_secs)
    }
}

/// One hop of a payment route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteHop {
    /// Short channel id of the channel used for this hop.
    pub chan_id: u64,
    /// Node receiving this hop.
    pub pub_key: NodeId,
    /// Amount the receiving node forwards (or keeps, on the last hop).
    pub amt_to_forward_msat: u64,
    /// Fee charged by this hop's node for forwarding; zero on the last hop.
    pub fee_msat: u64,
    /// Absolute CLTV of the HTLC this hop's node sends onward.
    pub expiry: u32,
}

/// A candidate payment route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Hops from the first peer to the destination.
    pub hops: Vec<RouteHop>,
    /// Amount sent by the payer including fees.
    pub total_amt_msat: u64,
    /// Routing fees.
    pub total_fees_msat: u64,
    /// CLTV of the first HTLC.
    pub total_time_lock: u32,
}

impl Route {
    /// Number of channels traversed.
    #[must_use]
    pub fn hop_count(&self) -> usize {
        self.hops.len()
    }

    /// Final node of the route.
    #[must_use]
    pub fn destination(&self) -> Option<&NodeId> {
        self.hops.last().map(|h| &h.pub_key)
    }

    /// Preference order used by the harness: lowest fee, then fewest hops.
    #[must_use]
    pub fn preference_key(&self) -> (u64, usize) {
        (self.total_fees_msat, self.hops.len())
    }
}

/// An active or inactive channel as reported by a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSummary {
    /// Short channel id.
    pub chan_id: u64,
    /// Funding outpoint, `txid:vout`.
    pub channel_point: String,
    /// Counterparty.
    pub remote_node_id: NodeId,
    /// Channel capacity.
    pub capacity: Amount,
    /// Local balance.
    pub local_balance: Amount,
    /// Remote balance.
    pub remote_balance: Amount,
    /// Whether the channel can forward payments.
    pub active: bool,
    /// Whether this node opened the channel.
    pub initiator: bool,
}

/// A channel whose funding transaction is not yet confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingChannel {
    /// Funding outpoint, `txid:vout`.
    pub channel_point: String,
    /// Counterparty.
    pub remote_node_id: NodeId,
    /// Channel capacity.
    pub capacity: Amount,
}

/// On-chain wallet balance of a Lightning node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletBalance {
    /// Confirmed balance.
    pub confirmed: Amount,
    /// Unconfirmed balance.
    pub unconfirmed: Amount,
}

/// RPC surface of a Lightning node.
#[async_trait]
pub trait NodeRpc: Send + Sync {
    /// Node identity and status.
    async fn get_info(&self) -> Result<NodeInfo>;

    /// Connect to a peer at `address` (`host:port`).
    async fn connect_peer(&self, node_id: &NodeId, address: &str) -> Result<()>;

    /// Currently connected peers.
    async fn list_peers(&self) -> Result<Vec<NodeId>>;

    /// Fresh on-chain receive address.
    async fn new_address(&self) -> Result<String>;

    /// On-chain wallet balance.
    async fn wallet_balance(&self) -> Result<WalletBalance>;

    /// Open a channel to `peer`, returning the funding outpoint.
    async fn open_channel(&self, peer: &NodeId, capacity: Amount) -> Result<String>;

    /// Open channels.
    async fn list_channels(&self) -> Result<Vec<ChannelSummary>>;

    /// Channels awaiting funding confirmation.
    async fn pending_channels(&self) -> Result<Vec<PendingChannel>>;

    /// Issue an invoice.
    async fn create_invoice(&self, amount_msat: u64, memo: &str, expiry: Duration)
        -> Result<Invoice>;

    /// Candidate routes to `destination`. No route is an empty vector.
    async fn query_routes(
        &self,
        destination: &NodeId,
        amount_msat: u64,
        max_results: usize,
    ) -> Result<Vec<Route>>;

    /// Ask the node to shut down.
    async fn stop(&self) -> Result<()>;
}

/// RPC surface of the regtest chain node.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    /// Current chain height.
    async fn block_height(&self) -> Result<u64>;

    /// Fresh receive address of the funding wallet.
    async fn new_address(&self) -> Result<String>;

    /// Spendable (confirmed, mature) balance of the funding wallet.
    async fn balance(&self) -> Result<Amount>;

    /// Send `amount` to `address`, returning the transaction id.
    async fn send_to_address(&self, address: &str, amount: Amount) -> Result<String>;

    /// Mine `count` blocks to the funding wallet, returning block hashes.
    async fn generate_blocks(&self, count: u32) -> Result<Vec<String>>;

    /// Confirmations of a wallet transaction; `None` if unknown.
    async fn confirmations(&self, txid: &str) -> Result<Option<u32>>;

    /// Ask the node to shut down.
    async fn stop(&self) -> Result<()>;
}

/// Seconds since the unix epoch.
#[must_use]
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}
