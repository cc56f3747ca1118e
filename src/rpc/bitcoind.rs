//! bitcoind JSON-RPC client.

use crate::amount::Amount;
use crate::error::{Error, Result};
use crate::rpc::ChainRpc;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

/// Name of the wallet created for the funding node.
pub const FUNDING_WALLET: &str = "lntest";

/// Wallet already exists on disk.
const RPC_WALLET_ERROR: i64 = -4;

/// Wallet or transaction id not found.
const RPC_INVALID_ADDRESS_OR_KEY: i64 = -5;

/// Wallet is already loaded.
const RPC_WALLET_ALREADY_LOADED: i64 = -35;

/// Transport-level timeout for a single request.
const REQUEST_TIMEOUT_SECS: u64 = 60;

/// JSON-RPC client for a regtest `bitcoind`.
pub struct BitcoindRpcClient {
    url: String,
    user: String,
    password: String,
    client: reqwest::Client,
    next_id: AtomicU64,
}

/// A JSON-RPC level error returned by bitcoind.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcErrorObject {
    /// bitcoind error code.
    pub code: i64,
    /// Message.
    pub message: String,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

impl BitcoindRpcClient {
    /// Create a client for `url` (e.g. `http://127.0.0.1:18443`).
    ///
    /// # Errors
    ///
    /// Returns `Error::Rpc` if the HTTP client cannot be built.
    pub fn new(
        url: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("lntest-harness/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| Error::Rpc(format!("Failed to build bitcoind RPC client: {e}")))?;

        Ok(Self {
            url: url.into(),
            user: user.into(),
            password: password.into(),
            client,
            next_id: AtomicU64::new(1),
        })
    }

    /// Issue a raw JSON-RPC call, returning either the result or bitcoind's error object.
    async fn call_raw(
        &self,
        method: &str,
        params: Value,
    ) -> Result<std::result::Result<Value, RpcErrorObject>> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let body = json!({
            "jsonrpc": "1.0",
            "id": id,
            "method": method,
            "params": params,
        });

        debug!("bitcoind {} (id {})", method, id);

        let response = self
            .client
            .post(&self.url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Rpc(format!("bitcoind {method} request failed: {e}")))?;

        // bitcoind reports RPC errors with a 500 status and a JSON body
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::Rpc(format!("bitcoind {method} body unreadable: {e}")))?;
        let parsed: RpcResponse = serde_json::from_str(&text).map_err(|_| {
            Error::Rpc(format!("bitcoind {method} returned {status}: {text}"))
        })?;

        Ok(match parsed.error {
            Some(err) => Err(err),
            None => Ok(parsed.result),
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let value = self.call_raw(method, params).await?.map_err(|e| {
            Error::Rpc(format!("bitcoind {method} failed ({}): {}", e.code, e.message))
        })?;
        serde_json::from_value(value).map_err(|e| {
            Error::Serialization(format!("Failed to parse bitcoind {method} result: {e}"))
        })
    }

    /// Create the funding wallet, or load it if it already exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the wallet can be neither created nor loaded.
    pub async fn ensure_wallet(&self) -> Result<()> {
        match self.call_raw("createwallet", json!([FUNDING_WALLET])).await? {
            Ok(_) => {
                info!("Created bitcoind wallet {}", FUNDING_WALLET);
                Ok(())
            }
            Err(e) if e.code == RPC_WALLET_ERROR || e.code == RPC_WALLET_ALREADY_LOADED => {
                match self.call_raw("loadwallet", json!([FUNDING_WALLET])).await? {
                    Ok(_) => Ok(()),
                    Err(e) if e.code == RPC_WALLET_ALREADY_LOADED => Ok(()),
                    Err(e) => Err(Error::Rpc(format!(
                        "bitcoind loadwallet failed ({}): {}",
                        e.code, e.message
                    ))),
                }
            }
            Err(e) => Err(Error::Rpc(format!(
                "bitcoind createwallet failed ({}): {}",
                e.code, e.message
            ))),
        }
    }
}

#[derive(Deserialize)]
struct WalletTransaction {
    confirmations: i64,
}

#[async_trait]
impl ChainRpc for BitcoindRpcClient {
    async fn block_height(&self) -> Result<u64> {
        self.call("getblockcount", json!([])).await
    }

    async fn new_address(&self) -> Result<String> {
        self.call("getnewaddress", json!([])).await
    }

    async fn balance(&self) -> Result<Amount> {
        let btc: f64 = self.call("getbalance", json!([])).await?;
        Amount::from_btc(btc)
            .ok_or_else(|| Error::Serialization(format!("Invalid balance reported: {btc}")))
    }

    async fn send_to_address(&self, address: &str, amount: Amount) -> Result<String> {
        self.call("sendtoaddress", json!([address, amount.as_btc()]))
            .await
    }

    async fn generate_blocks(&self, count: u32) -> Result<Vec<String>> {
        let address = self.new_address().await?;
        self.call("generatetoaddress", json!([count, address]))
            .await
    }

    async fn confirmations(&self, txid: &str) -> Result<Option<u32>> {
        match self.call_raw("gettransaction", json!([txid])).await? {
            Ok(value) => {
                let tx: WalletTransaction = serde_json::from_value(value).map_err(|e| {
                    Error::Serialization(format!("Failed to parse gettransaction: {e}"))
                })?;
                // Conflicted transactions report negative confirmations
                Ok(Some(u32::try_from(tx.confirmations.max(0)).unwrap_or(u32::MAX)))
            }
            Err(e) if e.code == RPC_INVALID_ADDRESS_OR_KEY => Ok(None),
            Err(e) => Err(Error::Rpc(format!(
                "bitcoind gettransaction failed ({}): {}",
                e.code, e.message
            ))),
        }
    }

    async fn stop(&self) -> Result<()> {
        let _: Value = self.call("stop", json!([])).await?;
        Ok(())
    }
}
