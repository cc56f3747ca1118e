//! Peer mesh across the Lightning roles.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::harness::{sim_builder, sim_config};
use lntest_harness::{Error, HarnessConfig, Role, SimConfig};

#[tokio::test]
async fn test_connect_all_is_idempotent() {
    let (builder, _) = sim_builder("mesh", HarnessConfig::simulated());
    builder.start_node().await.unwrap();

    assert_eq!(builder.connect_all().await.unwrap(), 3);
    assert_eq!(builder.connect_all().await.unwrap(), 0);

    let clients = builder.get_clients().await.unwrap();
    for client in clients.iter() {
        let peers = client.list_peers().await.unwrap();
        assert_eq!(peers.len(), 2, "{} peers: {peers:?}", client.role());
        assert!(!peers.contains(client.node_id()));
    }
    builder.teardown().await;
}

#[tokio::test]
async fn test_unreachable_node_reported_and_other_links_kept() {
    let mut config = sim_config(SimConfig {
        isolated_roles: vec![Role::Rebalancer],
        ..SimConfig::default()
    });
    config.timeouts.connect_retries = 2;
    let (builder, _) = sim_builder("mesh-isolated", config);
    builder.start_node().await.unwrap();

    let err = builder.connect_all().await.unwrap_err();
    let Error::Connectivity(message) = err else {
        panic!("expected connectivity error, got {err}");
    };
    assert!(message.contains("Rebalancer <-> Custody"));
    assert!(message.contains("Rebalancer <-> ThirdParty"));

    let clients = builder.get_clients().await.unwrap();
    let custody = clients.custody().unwrap();
    let third_party = clients.third_party().unwrap();
    assert_eq!(custody.list_peers().await.unwrap(), vec![third_party.node_id().clone()]);
    assert!(clients.rebalancer().unwrap().list_peers().await.unwrap().is_empty());
    builder.teardown().await;
}

#[tokio::test]
async fn test_two_node_topology_has_one_link() {
    let config =
        HarnessConfig::simulated().with_roles([Role::Bitcoin, Role::Custody, Role::ThirdParty]);
    let (builder, _) = sim_builder("mesh-pair", config);
    builder.start_node().await.unwrap();
    assert_eq!(builder.connect_all().await.unwrap(), 1);
    builder.teardown().await;
}
