//! Invoices and route queries.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::harness::running;
use lntest_harness::backend::sim::ForwardingPolicy;
use lntest_harness::{Amount, Role};
use std::time::Duration;

#[tokio::test]
async fn test_invoice_bound_to_issuer_and_not_expired() {
    let (builder, _) = running("invoice").await;
    let clients = builder.get_clients().await.unwrap();
    let custody = clients.custody().unwrap();

    let invoice = custody
        .create_invoice(Amount::from_sat(1_000), "UnitTest1", Duration::from_secs(300))
        .await
        .unwrap();

    assert_eq!(&invoice.destination, custody.node_id());
    assert_eq!(invoice.amount_msat, 1_000_000);
    assert_eq!(invoice.memo, "UnitTest1");
    assert_eq!(invoice.expiry(), Duration::from_secs(300));
    assert!(!invoice.is_expired());
    assert!(invoice.payment_request.starts_with("lnbcrt"));

    let other = custody
        .create_invoice(Amount::from_sat(1_000), "UnitTest1", Duration::from_secs(300))
        .await
        .unwrap();
    assert_ne!(invoice.payment_hash, other.payment_hash);
    builder.teardown().await;
}

#[tokio::test]
async fn test_no_funded_path_returns_empty_routes() {
    let (builder, _) = running("no-route").await;
    let clients = builder.get_clients().await.unwrap();
    let custody = clients.custody().unwrap().node_id().clone();

    let routes = clients
        .rebalancer()
        .unwrap()
        .query_routes(&custody, 1_000, 10)
        .await
        .unwrap();
    assert!(routes.is_empty());
    builder.teardown().await;
}

#[tokio::test]
async fn test_route_through_shared_peer() {
    let (builder, _) = running("shared-peer").await;
    let capacity = Amount::from_sat(500_000);
    builder
        .open_channel(Role::Rebalancer, Role::ThirdParty, capacity)
        .await
        .unwrap();
    builder
        .open_channel(Role::Custody, Role::ThirdParty, capacity)
        .await
        .unwrap();

    let clients = builder.get_clients().await.unwrap();
    let custody = clients.custody().unwrap().node_id().clone();
    let third_party = clients.third_party().unwrap().node_id().clone();

    let routes = clients
        .rebalancer()
        .unwrap()
        .query_routes(&custody, 1_000, 10)
        .await
        .unwrap();
    assert!(!routes.is_empty());

    let route = &routes[0];
    assert_eq!(route.hop_count(), 2);
    assert_eq!(route.hops[0].pub_key, third_party);
    assert_eq!(route.destination(), Some(&custody));
    assert!(route.total_fees_msat > 0);
    assert_eq!(route.total_amt_msat, 1_000 + route.total_fees_msat);
    builder.teardown().await;
}

#[tokio::test]
async fn test_routes_ordered_by_fee_then_hops() {
    let (builder, network) = running("route-order").await;
    let capacity = Amount::from_sat(500_000);
    builder
        .open_channel(Role::Rebalancer, Role::ThirdParty, capacity)
        .await
        .unwrap();
    builder
        .open_channel(Role::Rebalancer, Role::Custody, capacity)
        .await
        .unwrap();
    builder
        .open_channel(Role::Custody, Role::ThirdParty, capacity)
        .await
        .unwrap();
    network
        .set_policy(
            Role::Custody,
            ForwardingPolicy {
                base_fee_msat: 5_000,
                fee_rate_ppm: 0,
                time_lock_delta: 40,
            },
        )
        .unwrap();

    let clients = builder.get_clients().await.unwrap();
    let third_party = clients.third_party().unwrap().node_id().clone();
    let routes = clients
        .rebalancer()
        .unwrap()
        .query_routes(&third_party, 20_000, 10)
        .await
        .unwrap();

    assert_eq!(routes.len(), 2);
    assert_eq!(routes[0].hop_count(), 1);
    assert_eq!(routes[0].total_fees_msat, 0);
    assert_eq!(routes[1].hop_count(), 2);
    assert_eq!(routes[1].total_fees_msat, 5_000);

    let capped = clients
        .rebalancer()
        .unwrap()
        .query_routes(&third_party, 20_000, 1)
        .await
        .unwrap();
    assert_eq!(capped, routes[..1].to_vec());
    builder.teardown().await;
}

#[tokio::test]
async fn test_amount_above_capacity_has_no_route() {
    let (builder, _) = running("over-capacity").await;
    builder
        .open_channel(Role::Rebalancer, Role::Custody, Amount::from_sat(100_000))
        .await
        .unwrap();

    let clients = builder.get_clients().await.unwrap();
    let custody = clients.custody().unwrap().node_id().clone();
    let routes = clients
        .rebalancer()
        .unwrap()
        .query_routes_sat(&custody, Amount::from_sat(200_000), 5)
        .await
        .unwrap();
    assert!(routes.is_empty());
    builder.teardown().await;
}
