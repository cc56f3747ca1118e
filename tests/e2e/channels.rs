//! Funding and channel management.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::harness::{running, sim_builder};
use lntest_harness::{Amount, ChannelState, Error, HarnessConfig, Role};

#[tokio::test]
async fn test_prepare_ln_funds_reaches_every_wallet() {
    let (builder, network) = running("ln-funds").await;
    builder.prepare_ln_funds(Amount::from_sat(1_000_000)).await.unwrap();

    let clients = builder.get_clients().await.unwrap();
    for client in clients.iter() {
        let balance = client.wallet_balance().await.unwrap();
        assert!(
            balance.confirmed >= Amount::from_sat(1_000_000),
            "{} holds {}",
            client.role(),
            balance.confirmed
        );
    }
    assert!(network.height() >= 101);
    builder.teardown().await;
}

#[tokio::test]
async fn test_prepare_ln_funds_respects_prefund_roles() {
    let mut config = HarnessConfig::simulated();
    config.funding.prefund_roles = vec![Role::Custody];
    let (builder, _) = sim_builder("ln-funds-subset", config);
    builder.start_node().await.unwrap();
    builder.prepare_ln_funds(Amount::from_sat(250_000)).await.unwrap();

    let clients = builder.get_clients().await.unwrap();
    let custody = clients.custody().unwrap().wallet_balance().await.unwrap();
    let rebalancer = clients.rebalancer().unwrap().wallet_balance().await.unwrap();
    assert_eq!(custody.confirmed, Amount::from_sat(250_000));
    assert_eq!(rebalancer.confirmed, Amount::ZERO);
    builder.teardown().await;
}

#[tokio::test]
async fn test_small_block_budget_is_insufficient_confirmation() {
    let mut config = HarnessConfig::simulated();
    config.funding.max_confirmation_blocks = 20;
    let (builder, network) = sim_builder("budget", config);
    builder.start_node().await.unwrap();

    let err = builder.prepare_funds(Amount::from_sat(10_000)).await.unwrap_err();
    assert!(matches!(err, Error::InsufficientConfirmation(_)));
    // One block from startup plus the whole budget
    assert_eq!(network.height(), 21);
    builder.teardown().await;
}

#[tokio::test]
async fn test_identical_opens_yield_distinct_channels() {
    let (builder, _) = running("twin-channels").await;
    let capacity = Amount::from_sat(500_000);

    let first = builder
        .open_channel(Role::Rebalancer, Role::ThirdParty, capacity)
        .await
        .unwrap();
    let second = builder
        .open_channel(Role::Rebalancer, Role::ThirdParty, capacity)
        .await
        .unwrap();

    assert!(first.is_open());
    assert!(second.is_open());
    assert_ne!(first.channel_point, second.channel_point);
    assert_ne!(first.chan_id, second.chan_id);
    assert_eq!(builder.channels().await.len(), 2);

    let clients = builder.get_clients().await.unwrap();
    let listed = clients.third_party().unwrap().list_channels().await.unwrap();
    assert_eq!(listed.iter().filter(|c| c.active).count(), 2);
    builder.teardown().await;
}

#[tokio::test]
async fn test_self_channel_rejected() {
    let (builder, _) = running("self-channel").await;
    let err = builder
        .open_channel(Role::Custody, Role::Custody, Amount::from_sat(100_000))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ChannelOpen { from: Role::Custody, to: Role::Custody, .. }));
    assert!(builder.channels().await.is_empty());
    builder.teardown().await;
}

#[tokio::test]
async fn test_chain_role_cannot_hold_channels() {
    let (builder, _) = running("chain-channel").await;
    let err = builder
        .open_channel(Role::Bitcoin, Role::Custody, Amount::from_sat(100_000))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownRole(_)));
    builder.teardown().await;
}

#[tokio::test]
async fn test_open_connects_unpeered_nodes() {
    let (builder, _) = sim_builder("open-connects", HarnessConfig::simulated());
    builder.start_node().await.unwrap();

    let channel = builder
        .open_channel(Role::Custody, Role::Rebalancer, Amount::from_sat(200_000))
        .await
        .unwrap();
    assert!(channel.is_open());

    let clients = builder.get_clients().await.unwrap();
    let peers = clients.custody().unwrap().list_peers().await.unwrap();
    assert_eq!(peers, vec![clients.rebalancer().unwrap().node_id().clone()]);
    builder.teardown().await;
}

#[tokio::test]
async fn test_channel_not_active_in_time_is_recorded_as_failed() {
    let mut config = HarnessConfig::simulated();
    config.funding.channel_confirmations = 1;
    config.timeouts.channel_open_secs = 1;
    let (builder, _) = sim_builder("slow-channel", config);
    builder.start_node().await.unwrap();

    let err = builder
        .open_channel(Role::Rebalancer, Role::Custody, Amount::from_sat(200_000))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ChannelOpen { from: Role::Rebalancer, to: Role::Custody, .. }));

    let channels = builder.channels().await;
    assert_eq!(channels.len(), 1);
    assert!(matches!(channels[0].state, ChannelState::Failed(_)));
    builder.teardown().await;
}

#[tokio::test]
async fn test_open_channel_via_hub() {
    let (builder, _) = running("hub").await;
    let (inbound, outbound) = builder
        .open_channel_via(
            Role::Rebalancer,
            Role::ThirdParty,
            Role::Custody,
            Amount::from_sat(400_000),
        )
        .await
        .unwrap();

    assert_eq!((inbound.from, inbound.to), (Role::Rebalancer, Role::ThirdParty));
    assert_eq!((outbound.from, outbound.to), (Role::ThirdParty, Role::Custody));
    assert!(inbound.is_open() && outbound.is_open());

    let clients = builder.get_clients().await.unwrap();
    let custody = clients.custody().unwrap().node_id().clone();
    let routes = clients
        .rebalancer()
        .unwrap()
        .query_routes(&custody, 10_000, 5)
        .await
        .unwrap();
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].hop_count(), 2);
    builder.teardown().await;
}

#[tokio::test]
async fn test_hub_must_differ_from_endpoints() {
    let (builder, _) = running("hub-same").await;
    let err = builder
        .open_channel_via(
            Role::Rebalancer,
            Role::Rebalancer,
            Role::Custody,
            Amount::from_sat(100_000),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ChannelOpen { .. }));
    builder.teardown().await;
}

#[tokio::test]
async fn test_open_channel_with_other_funding_role_is_rejected() {
    let (builder, _) = running("funding-role").await;
    let err = builder
        .open_channel_with(
            Role::Custody,
            Role::Rebalancer,
            Role::ThirdParty,
            Amount::from_sat(100_000),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Sequencing(_)));
    builder.teardown().await;
}
