//! Real `bitcoind` + `lnd` topologies.
//!
//! Binaries come from `PATH` or `LNTEST_BITCOIND` / `LNTEST_LND`.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::harness::unique_name;
use lntest_harness::{Amount, HarnessConfig, LightningNodeLauncher, Role};
use std::time::Duration;

fn process_config() -> HarnessConfig {
    let mut config = HarnessConfig::process();
    config.timeouts.node_startup_secs = 90;
    config
}

#[tokio::test]
#[ignore = "Requires bitcoind and lnd binaries - run with --ignored"]
async fn test_process_topology_routes_through_hub() {
    let launcher = LightningNodeLauncher::new(process_config());
    launcher
        .scoped(&unique_name("process-routes"), |builder| async move {
            builder.start_node().await?;
            let clients = builder.get_clients().await?;
            assert!(clients.bitcoin().block_height().await? >= 1);
            for client in clients.iter() {
                assert!(client.get_info().await?.synced_to_chain);
            }

            builder.connect_all().await?;
            builder.prepare_ln_funds(Amount::from_sat(2_000_000)).await?;

            let capacity = Amount::from_sat(500_000);
            builder
                .open_channel(Role::Rebalancer, Role::ThirdParty, capacity)
                .await?;
            builder
                .open_channel(Role::Custody, Role::ThirdParty, capacity)
                .await?;

            let clients = builder.get_clients().await?;
            let custody = clients.custody()?;
            let invoice = custody
                .create_invoice(Amount::from_sat(1_000), "UnitTest1", Duration::from_secs(300))
                .await?;
            assert_eq!(&invoice.destination, custody.node_id());
            assert!(!invoice.is_expired());

            let routes = clients
                .rebalancer()?
                .query_routes(custody.node_id(), 1_000, 5)
                .await?;
            assert!(!routes.is_empty());
            Ok(())
        })
        .await
        .unwrap();
}

#[tokio::test]
#[ignore = "Requires bitcoind and lnd binaries - run with --ignored"]
async fn test_two_process_topologies_side_by_side() {
    let launcher = LightningNodeLauncher::new(process_config());
    let first = launcher.create_builder(&unique_name("process-a")).unwrap();
    let second = launcher.create_builder(&unique_name("process-b")).unwrap();

    let (a, b) = tokio::join!(first.start_node(), second.start_node());
    a.unwrap();
    b.unwrap();

    let a_clients = first.get_clients().await.unwrap();
    let b_clients = second.get_clients().await.unwrap();
    assert_ne!(
        a_clients.custody().unwrap().address(),
        b_clients.custody().unwrap().address()
    );

    assert!(first.teardown().await.is_clean());
    assert!(second.teardown().await.is_clean());
}
