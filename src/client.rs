//! Role-bound protocol clients.
//!
//! A [`Clients`] registry is a snapshot taken from a running topology. Each
//! client holds the node's RPC handle plus a liveness signal; once the
//! topology is torn down every call fails with `Error::Sequencing`. Every
//! call is bounded by the configured RPC timeout.

use crate::amount::Amount;
use crate::error::{Error, Result};
use crate::role::Role;
use crate::rpc::{
    ChainRpc, ChannelSummary, Invoice, NodeId, NodeInfo, NodeRpc, Route, WalletBalance,
};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Run `call` against `role`, failing with `Error::RpcTimeout` after `bound`.
pub(crate) async fn bounded<T, F>(
    role: Role,
    method: &'static str,
    bound: Duration,
    call: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(bound, call)
        .await
        .map_err(|_| Error::RpcTimeout {
            role,
            method,
            timeout: bound,
        })?
}

fn ensure_live(live: &watch::Receiver<bool>, role: Role) -> Result<()> {
    if *live.borrow() {
        Ok(())
    } else {
        Err(Error::Sequencing(format!(
            "client for {role} used after its topology was torn down"
        )))
    }
}

/// Client for a Lightning role.
#[derive(Clone)]
pub struct NodeClient {
    role: Role,
    node_id: NodeId,
    address: String,
    rpc: Arc<dyn NodeRpc>,
    timeout: Duration,
    live: watch::Receiver<bool>,
}

impl std::fmt::Debug for NodeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeClient")
            .field("role", &self.role)
            .field("node_id", &self.node_id)
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl NodeClient {
    pub(crate) fn new(
        role: Role,
        node_id: NodeId,
        address: String,
        rpc: Arc<dyn NodeRpc>,
        timeout: Duration,
        live: watch::Receiver<bool>,
    ) -> Self {
        Self {
            role,
            node_id,
            address,
            rpc,
            timeout,
            live,
        }
    }

    /// Role this client is bound to.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Public key of the bound node.
    #[must_use]
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Peer-to-peer address of the bound node.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    async fn call<T, F>(&self, method: &'static str, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        ensure_live(&self.live, self.role)?;
        bounded(self.role, method, self.timeout, call).await
    }

    /// Node identity and status.
    ///
    /// # Errors
    ///
    /// Returns `Error::Sequencing` after teardown, `Error::RpcTimeout` if the
    /// node does not answer in time, or the node's own error.
    pub async fn get_info(&self) -> Result<NodeInfo> {
        self.call("get_info", self.rpc.get_info()).await
    }

    /// Issue an invoice for `amount`.
    ///
    /// # Errors
    ///
    /// As [`NodeClient::get_info`].
    pub async fn create_invoice(
        &self,
        amount: Amount,
        memo: &str,
        expiry: Duration,
    ) -> Result<Invoice> {
        self.call(
            "create_invoice",
            self.rpc.create_invoice(amount.as_msat(), memo, expiry),
        )
        .await
    }

    /// Candidate routes to `destination`, cheapest first then shortest.
    /// An unreachable destination yields an empty vector.
    ///
    /// # Errors
    ///
    /// As [`NodeClient::get_info`].
    pub async fn query_routes(
        &self,
        destination: &NodeId,
        amount_msat: u64,
        max_results: usize,
    ) -> Result<Vec<Route>> {
        let mut routes = self
            .call(
                "query_routes",
                self.rpc.query_routes(destination, amount_msat, max_results),
            )
            .await?;
        routes.sort_by_key(Route::preference_key);
        routes.truncate(max_results);
        Ok(routes)
    }

    /// Routes for a whole-satoshi amount.
    ///
    /// # Errors
    ///
    /// As [`NodeClient::get_info`].
    pub async fn query_routes_sat(
        &self,
        destination: &NodeId,
        amount: Amount,
        max_results: usize,
    ) -> Result<Vec<Route>> {
        self.query_routes(destination, amount.as_msat(), max_results)
            .await
    }

    /// Connected peers.
    ///
    /// # Errors
    ///
    /// As [`NodeClient::get_info`].
    pub async fn list_peers(&self) -> Result<Vec<NodeId>> {
        self.call("list_peers", self.rpc.list_peers()).await
    }

    /// Open channels.
    ///
    /// # Errors
    ///
    /// As [`NodeClient::get_info`].
    pub async fn list_channels(&self) -> Result<Vec<ChannelSummary>> {
        self.call("list_channels", self.rpc.list_channels()).await
    }

    /// On-chain wallet balance.
    ///
    /// # Errors
    ///
    /// As [`NodeClient::get_info`].
    pub async fn wallet_balance(&self) -> Result<WalletBalance> {
        self.call("wallet_balance", self.rpc.wallet_balance()).await
    }

    /// Fresh on-chain address.
    ///
    /// # Errors
    ///
    /// As [`NodeClient::get_info`].
    pub async fn new_address(&self) -> Result<String> {
        self.call("new_address", self.rpc.new_address()).await
    }
}

/// Client for the chain role.
#[derive(Clone)]
pub struct ChainClient {
    role: Role,
    rpc: Arc<dyn ChainRpc>,
    timeout: Duration,
    live: watch::Receiver<bool>,
}

impl std::fmt::Debug for ChainClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainClient")
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

impl ChainClient {
    pub(crate) fn new(
        role: Role,
        rpc: Arc<dyn ChainRpc>,
        timeout: Duration,
        live: watch::Receiver<bool>,
    ) -> Self {
        Self {
            role,
            rpc,
            timeout,
            live,
        }
    }

    /// Role this client is bound to.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    async fn call<T, F>(&self, method: &'static str, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        ensure_live(&self.live, self.role)?;
        bounded(self.role, method, self.timeout, call).await
    }

    /// Current chain height.
    ///
    /// # Errors
    ///
    /// Returns `Error::Sequencing` after teardown, `Error::RpcTimeout` if the
    /// node does not answer in time, or the node's own error.
    pub async fn block_height(&self) -> Result<u64> {
        self.call("block_height", self.rpc.block_height()).await
    }

    /// Spendable balance of the funding wallet.
    ///
    /// # Errors
    ///
    /// As [`ChainClient::block_height`].
    pub async fn balance(&self) -> Result<Amount> {
        self.call("balance", self.rpc.balance()).await
    }

    /// Fresh funding-wallet address.
    ///
    /// # Errors
    ///
    /// As [`ChainClient::block_height`].
    pub async fn new_address(&self) -> Result<String> {
        self.call("new_address", self.rpc.new_address()).await
    }

    /// Send `amount` to `address`, returning the txid.
    ///
    /// # Errors
    ///
    /// As [`ChainClient::block_height`].
    pub async fn send_to_address(&self, address: &str, amount: Amount) -> Result<String> {
        self.call("send_to_address", self.rpc.send_to_address(address, amount))
            .await
    }

    /// Mine `count` blocks.
    ///
    /// # Errors
    ///
    /// As [`ChainClient::block_height`].
    pub async fn generate_blocks(&self, count: u32) -> Result<Vec<String>> {
        self.call("generate_blocks", self.rpc.generate_blocks(count))
            .await
    }

    /// Confirmations of a wallet transaction.
    ///
    /// # Errors
    ///
    /// As [`ChainClient::block_height`].
    pub async fn confirmations(&self, txid: &str) -> Result<Option<u32>> {
        self.call("confirmations", self.rpc.confirmations(txid)).await
    }
}

/// Clients of a running topology, keyed by role.
#[derive(Debug, Clone)]
pub struct Clients {
    chain: ChainClient,
    lightning: BTreeMap<Role, NodeClient>,
}

impl Clients {
    pub(crate) fn new(chain: ChainClient, lightning: BTreeMap<Role, NodeClient>) -> Self {
        Self { chain, lightning }
    }

    /// Client of a Lightning role.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownRole` if `role` is not a configured Lightning role.
    pub fn lightning(&self, role: Role) -> Result<&NodeClient> {
        self.lightning
            .get(&role)
            .ok_or_else(|| {
                Error::UnknownRole(format!("{role} is not a Lightning node of this topology"))
            })
    }

    /// Client of the Rebalancer role.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownRole` if the role is not configured.
    pub fn rebalancer(&self) -> Result<&NodeClient> {
        self.lightning(Role::Rebalancer)
    }

    /// Client of the Custody role.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownRole` if the role is not configured.
    pub fn custody(&self) -> Result<&NodeClient> {
        self.lightning(Role::Custody)
    }

    /// Client of the ThirdParty role.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownRole` if the role is not configured.
    pub fn third_party(&self) -> Result<&NodeClient> {
        self.lightning(Role::ThirdParty)
    }

    /// Client of the chain role.
    #[must_use]
    pub fn bitcoin(&self) -> &ChainClient {
        &self.chain
    }

    /// Roles with a client, chain role first.
    #[must_use]
    pub fn roles(&self) -> Vec<Role> {
        std::iter::once(self.chain.role())
            .chain(self.lightning.keys().copied())
            .collect()
    }

    /// Lightning clients in role order.
    pub fn iter(&self) -> impl Iterator<Item = &NodeClient> {
        self.lightning.values()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_bounded_times_out() {
        let err = bounded::<(), _>(Role::Custody, "get_info", Duration::from_secs(2), async {
            std::future::pending().await
        })
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            Error::RpcTimeout { role: Role::Custody, method: "get_info", .. }
        ));
    }

    #[tokio::test]
    async fn test_bounded_passes_result_through() {
        let value = bounded(Role::Bitcoin, "block_height", Duration::from_secs(1), async {
            Ok(7_u64)
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_route_query_for_huge_amount_is_empty() {
        use crate::backend::{NodeBackend, NodeRpcHandle, SimBackend};
        use crate::config::SimConfig;

        let backend = SimBackend::new("client-huge", SimConfig::default());
        let mut node = backend.launch(Role::Custody).await.unwrap();
        let NodeRpcHandle::Lightning(rpc) = node.process.poll_ready().await.unwrap().unwrap().rpc
        else {
            panic!("expected a Lightning handle");
        };
        let (_live_tx, live) = watch::channel(true);
        let client = NodeClient::new(
            Role::Custody,
            backend.network().node_id(Role::Custody),
            "127.0.0.1:9737".to_string(),
            rpc,
            Duration::from_secs(1),
            live,
        );

        let destination = backend.network().node_id(Role::ThirdParty);
        let routes = client
            .query_routes_sat(&destination, Amount::from_sat(u64::MAX / 10), 5)
            .await
            .unwrap();
        assert!(routes.is_empty());
    }

    #[test]
    fn test_dead_topology_is_sequencing_error() {
        let (tx, rx) = watch::channel(true);
        assert!(ensure_live(&rx, Role::Custody).is_ok());
        tx.send(false).unwrap();
        assert!(matches!(ensure_live(&rx, Role::Custody), Err(Error::Sequencing(_))));
    }
}
