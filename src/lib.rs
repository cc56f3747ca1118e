//! # lntest-harness
//!
//! Multi-node Lightning test harness for regtest topologies.
//!
//! A topology is one Bitcoin chain node plus the Lightning roles
//! `Rebalancer`, `Custody` and `ThirdParty`. The harness:
//! - Launches every role in parallel and waits for readiness
//! - Connects the Lightning nodes into a full peer mesh
//! - Mines and distributes regtest coins
//! - Opens channels, directly or through a hub
//! - Hands out role-bound clients for invoices and route queries
//! - Tears everything down, even when the test body fails or panics
//!
//! ## Backends
//!
//! - **Simulated**: an in-process chain and channel graph. No binaries
//!   needed; used by the crate's own tests.
//! - **Process**: real `bitcoind` and `lnd` processes driven over
//!   JSON-RPC and REST.
//!
//! ## Example
//!
//! ```rust,no_run
//! use lntest_harness::{Amount, HarnessConfig, LightningNodeLauncher, Role};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> lntest_harness::Result<()> {
//!     let launcher = LightningNodeLauncher::new(HarnessConfig::simulated());
//!     launcher
//!         .scoped("example", |builder| async move {
//!             builder.start_node().await?;
//!             builder.connect_all().await?;
//!             builder
//!                 .open_channel(Role::Custody, Role::ThirdParty, Amount::from_sat(500_000))
//!                 .await?;
//!             let clients = builder.get_clients().await?;
//!             let invoice = clients
//!                 .custody()?
//!                 .create_invoice(Amount::from_sat(1_000), "example", Duration::from_secs(300))
//!                 .await?;
//!             println!("{}", invoice.payment_request);
//!             Ok(())
//!         })
//!         .await
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod amount;
pub mod backend;
pub mod builder;
pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod funding;
pub mod launcher;
pub mod node;
pub mod role;
pub mod rpc;
pub mod topology;

pub use amount::Amount;
pub use backend::{NodeBackend, ProcessBackend, SimBackend, SimNetwork};
pub use builder::{Builder, LightningNodeLauncher};
pub use channel::{Channel, ChannelManager, ChannelState};
pub use client::{ChainClient, Clients, NodeClient};
pub use config::{
    BackendKind, FundingConfig, HarnessConfig, ProcessConfig, SimConfig, TimeoutConfig,
};
pub use error::{Error, Result};
pub use funding::FundingService;
pub use launcher::{NodeLauncher, TeardownReport};
pub use node::{Node, NodeState};
pub use role::Role;
pub use rpc::{Invoice, NodeId, NodeInfo, Route, RouteHop};
pub use topology::{Topology, TopologyManifest, TopologyState};
