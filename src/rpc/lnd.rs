//! LND REST client.
//!
//! Speaks the JSON gateway that `lnd` exposes on `--restlisten`: HTTPS with a
//! self-signed certificate and the admin macaroon passed hex-encoded in the
//! `Grpc-Metadata-macaroon` header. 64-bit integers arrive as JSON strings and
//! byte fields as base64, both handled here.

use crate::amount::Amount;
use crate::error::{Error, Result};
use crate::rpc::{
    ChannelSummary, Invoice, NodeId, NodeInfo, NodeRpc, PendingChannel, Route, RouteHop,
    WalletBalance,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Header carrying the hex macaroon.
const MACAROON_HEADER: &str = "Grpc-Metadata-macaroon";

/// Transport-level timeout for a single REST request.
const REQUEST_TIMEOUT_SECS: u64 = 60;

/// Error fragments lnd uses when no path to the destination exists.
const NO_ROUTE_MARKERS: [&str; 3] = [
    "unable to find a path",
    "no route",
    "insufficient local balance",
];

/// REST client for a single `lnd` instance.
#[derive(Clone)]
pub struct LndRestClient {
    base_url: String,
    macaroon_hex: String,
    client: reqwest::Client,
}

impl LndRestClient {
    /// Create a client for `base_url` (e.g. `https://127.0.0.1:8080`).
    ///
    /// # Errors
    ///
    /// Returns `Error::Rpc` if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, macaroon_hex: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("lntest-harness/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| Error::Rpc(format!("Failed to build lnd REST client: {e}")))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            macaroon_hex: macaroon_hex.into(),
            client,
        })
    }

    /// Create a client reading the admin macaroon from disk.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the macaroon cannot be read.
    pub fn from_macaroon_file(base_url: impl Into<String>, macaroon: &Path) -> Result<Self> {
        let bytes = std::fs::read(macaroon)?;
        Self::new(base_url, hex::encode(bytes))
    }

    /// Base URL of the REST endpoint.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{path}", self.base_url);
        debug!("lnd GET {}", url);
        let response = self
            .client
            .get(&url)
            .header(MACAROON_HEADER, &self.macaroon_hex)
            .send()
            .await
            .map_err(|e| Error::Rpc(format!("lnd GET {path} failed: {e}")))?;
        Self::decode(path, response).await
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let url = format!("{}{path}", self.base_url);
        debug!("lnd POST {}", url);
        let response = self
            .client
            .post(&url)
            .header(MACAROON_HEADER, &self.macaroon_hex)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Rpc(format!("lnd POST {path} failed: {e}")))?;
        Self::decode(path, response).await
    }

    async fn decode<T: DeserializeOwned>(path: &str, response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<LndErrorBody>(&body)
                .map(|e| e.message)
                .unwrap_or(body);
            return Err(Error::Rpc(format!("lnd {path} returned {status}: {message}")));
        }
        response
            .json()
            .await
            .map_err(|e| Error::Serialization(format!("Failed to parse lnd {path} response: {e}")))
    }
}

#[async_trait]
impl NodeRpc for LndRestClient {
    async fn get_info(&self) -> Result<NodeInfo> {
        let info: GetInfoResponse = self.get("/v1/getinfo").await?;
        Ok(NodeInfo {
            node_id: NodeId::new(info.identity_pubkey),
            alias: info.alias,
            num_peers: info.num_peers,
            num_active_channels: info.num_active_channels,
            num_pending_channels: info.num_pending_channels,
            block_height: u64::from(info.block_height),
            synced_to_chain: info.synced_to_chain,
        })
    }

    async fn connect_peer(&self, node_id: &NodeId, address: &str) -> Result<()> {
        let request = ConnectPeerRequest {
            addr: LightningAddress {
                pubkey: node_id.as_str(),
                host: address,
            },
            perm: false,
        };
        match self
            .post::<_, serde_json::Value>("/v1/peers", &request)
            .await
        {
            Ok(_) => Ok(()),
            Err(Error::Rpc(message)) if message.contains("already connected") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn list_peers(&self) -> Result<Vec<NodeId>> {
        let peers: ListPeersResponse = self.get("/v1/peers").await?;
        Ok(peers
            .peers
            .into_iter()
            .map(|p| NodeId::new(p.pub_key))
            .collect())
    }

    async fn new_address(&self) -> Result<String> {
        let address: NewAddressResponse = self.get("/v1/newaddress").await?;
        Ok(address.address)
    }

    async fn wallet_balance(&self) -> Result<WalletBalance> {
        let balance: WalletBalanceResponse = self.get("/v1/balance/blockchain").await?;
        Ok(WalletBalance {
            confirmed: Amount::from_sat(balance.confirmed_balance),
            unconfirmed: Amount::from_sat(balance.unconfirmed_balance),
        })
    }

    async fn open_channel(&self, peer: &NodeId, capacity: Amount) -> Result<String> {
        let pubkey = hex::decode(peer.as_str())
            .map_err(|e| Error::Rpc(format!("Invalid node id {peer}: {e}")))?;
        let request = OpenChannelRequest {
            node_pubkey: STANDARD.encode(pubkey),
            local_funding_amount: capacity.as_sat().to_string(),
            spend_unconfirmed: false,
        };
        let point: ChannelPointResponse = self.post("/v1/channels", &request).await?;
        let mut txid = STANDARD
            .decode(&point.funding_txid_bytes)
            .map_err(|e| Error::Serialization(format!("Invalid funding txid bytes: {e}")))?;
        // lnd reports the txid in internal byte order
        txid.reverse();
        Ok(format!("{}:{}", hex::encode(txid), point.output_index))
    }

    async fn list_channels(&self) -> Result<Vec<ChannelSummary>> {
        let channels: ListChannelsResponse = self.get("/v1/channels").await?;
        Ok(channels
            .channels
            .into_iter()
            .map(|c| ChannelSummary {
                chan_id: c.chan_id,
                channel_point: c.channel_point,
                remote_node_id: NodeId::new(c.remote_pubkey),
                capacity: Amount::from_sat(c.capacity),
                local_balance: Amount::from_sat(c.local_balance),
                remote_balance: Amount::from_sat(c.remote_balance),
                active: c.active,
                initiator: c.initiator,
            })
            .collect())
    }

    async fn pending_channels(&self) -> Result<Vec<PendingChannel>> {
        let pending: PendingChannelsResponse = self.get("/v1/channels/pending").await?;
        Ok(pending
            .pending_open_channels
            .into_iter()
            .map(|p| PendingChannel {
                channel_point: p.channel.channel_point,
                remote_node_id: NodeId::new(p.channel.remote_node_pub),
                capacity: Amount::from_sat(p.channel.capacity),
            })
            .collect())
    }

    async fn create_invoice(
        &self,
        amount_msat: u64,
        memo: &str,
        expiry: Duration,
    ) -> Result<Invoice> {
        let request = AddInvoiceRequest {
            value_msat: amount_msat.to_string(),
            memo,
            expiry: expiry.as_secs().to_string(),
        };
        let added: AddInvoiceResponse = self.post("/v1/invoices", &request).await?;
        let decoded: PayReqResponse = self
            .get(&format!("/v1/payreq/{}", added.payment_request))
            .await?;
        Ok(Invoice {
            payment_request: added.payment_request,
            payment_hash: decoded.payment_hash,
            amount_msat: decoded.num_msat,
            memo: decoded.description,
            created_at: decoded.timestamp,
            expiry_secs: decoded.expiry,
            destination: NodeId::new(decoded.destination),
        })
    }

    async fn query_routes(
        &self,
        destination: &NodeId,
        amount_msat: u64,
        max_results: usize,
    ) -> Result<Vec<Route>> {
        let path = format!("/v1/graph/routes/{destination}/0?amt_msat={amount_msat}");
        let response: QueryRoutesResponse = match self.get(&path).await {
            Ok(response) => response,
            Err(Error::Rpc(message)) if is_no_route(&message) => {
                debug!("No route to {}: {}", destination, message);
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let mut routes: Vec<Route> = response
            .routes
            .into_iter()
            .map(|r| Route {
                hops: r
                    .hops
                    .into_iter()
                    .map(|h| RouteHop {
                        chan_id: h.chan_id,
                        pub_key: NodeId::new(h.pub_key),
                        amt_to_forward_msat: h.amt_to_forward_msat,
                        fee_msat: h.fee_msat,
                        expiry: h.expiry,
                    })
                    .collect(),
                total_amt_msat: r.total_amt_msat,
                total_fees_msat: r.total_fees_msat,
                total_time_lock: r.total_time_lock,
            })
            .collect();
        routes.sort_by_key(Route::preference_key);
        routes.truncate(max_results);
        Ok(routes)
    }

    async fn stop(&self) -> Result<()> {
        self.post::<_, serde_json::Value>("/v1/stop", &serde_json::json!({}))
            .await
            .map(|_| ())
    }
}

fn is_no_route(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    NO_ROUTE_MARKERS.iter().any(|m| lower.contains(m))
}

/// lnd encodes 64-bit integers as strings; accept both forms.
fn de_u64<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Num(u64),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Str(s) if s.is_empty() => Ok(0),
        Raw::Str(s) => s.parse().map_err(serde::de::Error::custom),
        Raw::Num(n) => Ok(n),
    }
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Deserialize)]
struct LndErrorBody {
    #[serde(alias = "error")]
    message: String,
}

#[derive(Deserialize)]
struct GetInfoResponse {
    identity_pubkey: String,
    #[serde(default)]
    alias: String,
    #[serde(default)]
    num_peers: u32,
    #[serde(default)]
    num_active_channels: u32,
    #[serde(default)]
    num_pending_channels: u32,
    #[serde(default)]
    block_height: u32,
    #[serde(default)]
    synced_to_chain: bool,
}

#[derive(Serialize)]
struct LightningAddress<'a> {
    pubkey: &'a str,
    host: &'a str,
}

#[derive(Serialize)]
struct ConnectPeerRequest<'a> {
    addr: LightningAddress<'a>,
    perm: bool,
}

#[derive(Deserialize)]
struct ListPeersResponse {
    #[serde(default)]
    peers: Vec<Peer>,
}

#[derive(Deserialize)]
struct Peer {
    pub_key: String,
}

#[derive(Deserialize)]
struct NewAddressResponse {
    address: String,
}

#[derive(Deserialize)]
struct WalletBalanceResponse {
    #[serde(default, deserialize_with = "de_u64")]
    confirmed_balance: u64,
    #[serde(default, deserialize_with = "de_u64")]
    unconfirmed_balance: u64,
}

#[derive(Serialize)]
struct OpenChannelRequest {
    node_pubkey: String,
    local_funding_amount: String,
    spend_unconfirmed: bool,
}

#[derive(Deserialize)]
struct ChannelPointResponse {
    funding_txid_bytes: String,
    #[serde(default)]
    output_index: u32,
}

#[derive(Deserialize)]
struct ListChannelsResponse {
    #[serde(default)]
    channels: Vec<LndChannel>,
}

#[derive(Deserialize)]
struct LndChannel {
    #[serde(default)]
    active: bool,
    remote_pubkey: String,
    channel_point: String,
    #[serde(default, deserialize_with = "de_u64")]
    chan_id: u64,
    #[serde(default, deserialize_with = "de_u64")]
    capacity: u64,
    #[serde(default, deserialize_with = "de_u64")]
    local_balance: u64,
    #[serde(default, deserialize_with = "de_u64")]
    remote_balance: u64,
    #[serde(default)]
    initiator: bool,
}

#[derive(Deserialize)]
struct PendingChannelsResponse {
    #[serde(default)]
    pending_open_channels: Vec<PendingOpenChannel>,
}

#[derive(Deserialize)]
struct PendingOpenChannel {
    channel: PendingChannelInfo,
}

#[derive(Deserialize)]
struct PendingChannelInfo {
    remote_node_pub: String,
    channel_point: String,
    #[serde(default, deserialize_with = "de_u64")]
    capacity: u64,
}

#[derive(Serialize)]
struct AddInvoiceRequest<'a> {
    value_msat: String,
    memo: &'a str,
    expiry: String,
}

#[derive(Deserialize)]
struct AddInvoiceResponse {
    payment_request: String,
}

#[derive(Deserialize)]
struct PayReqResponse {
    destination: String,
    payment_hash: String,
    #[serde(default, deserialize_with = "de_u64")]
    num_msat: u64,
    #[serde(default, deserialize_with = "de_u64")]
    timestamp: u64,
    #[serde(default, deserialize_with = "de_u64")]
    expiry: u64,
    #[serde(default)]
    description: String,
}

#[derive(Deserialize)]
struct QueryRoutesResponse {
    #[serde(default)]
    routes: Vec<LndRoute>,
}

#[derive(Deserialize)]
struct LndRoute {
    #[serde(default)]
    total_time_lock: u32,
    #[serde(default, deserialize_with = "de_u64")]
    total_fees_msat: u64,
    #[serde(default, deserialize_with = "de_u64")]
    total_amt_msat: u64,
    #[serde(default)]
    hops: Vec<LndHop>,
}

#[derive(Deserialize)]
struct LndHop {
    #[serde(default, deserialize_with = "de_u64")]
    chan_id: u64,
    #[serde(default)]
    expiry: u32,
    #[serde(default, deserialize_with = "de_u64")]
    amt_to_forward_msat: u64,
    #[serde(default, deserialize_with = "de_u64")]
    fee_msat: u64,
    pub_key: String,
}
