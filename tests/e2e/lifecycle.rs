//! Topology lifecycle: startup, sequencing, naming and teardown.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::harness::{running, sim_builder, sim_config, unique_name};
use lntest_harness::{
    Amount, Error, HarnessConfig, LightningNodeLauncher, NodeState, Role, SimConfig, TopologyState,
};

#[tokio::test]
async fn test_every_role_has_a_client_after_start() {
    let (builder, _) = running("clients").await;
    let clients = builder.get_clients().await.unwrap();

    assert_eq!(clients.roles(), Role::ALL.to_vec());
    assert_eq!(clients.rebalancer().unwrap().role(), Role::Rebalancer);
    assert_eq!(clients.custody().unwrap().role(), Role::Custody);
    assert_eq!(clients.third_party().unwrap().role(), Role::ThirdParty);
    assert_eq!(clients.bitcoin().role(), Role::Bitcoin);

    for client in clients.iter() {
        let info = client.get_info().await.unwrap();
        assert_eq!(&info.node_id, client.node_id());
        assert_eq!(info.block_height, 1);
        assert!(info.synced_to_chain);
    }
    assert_eq!(clients.bitcoin().block_height().await.unwrap(), 1);
    builder.teardown().await;
}

#[tokio::test]
async fn test_operations_before_start_are_sequencing_errors() {
    let (builder, _) = sim_builder("early", HarnessConfig::simulated());

    assert!(matches!(builder.connect_all().await, Err(Error::Sequencing(_))));
    assert!(matches!(builder.get_clients().await, Err(Error::Sequencing(_))));
    assert!(matches!(
        builder.prepare_funds(Amount::from_sat(1)).await,
        Err(Error::Sequencing(_))
    ));
    assert!(matches!(
        builder.prepare_ln_funds(Amount::from_sat(1)).await,
        Err(Error::Sequencing(_))
    ));
    assert!(matches!(
        builder
            .open_channel(Role::Custody, Role::ThirdParty, Amount::from_sat(100_000))
            .await,
        Err(Error::Sequencing(_))
    ));
    assert_eq!(builder.state().await, TopologyState::Created);
}

#[tokio::test]
async fn test_start_twice_is_rejected() {
    let (builder, _) = running("twice").await;
    assert!(matches!(builder.start_node().await, Err(Error::Sequencing(_))));
    builder.teardown().await;
}

#[tokio::test]
async fn test_operations_after_teardown_are_sequencing_errors() {
    let (builder, _) = running("after").await;
    let clients = builder.get_clients().await.unwrap();
    builder.teardown().await;

    assert_eq!(builder.state().await, TopologyState::Stopped);
    assert!(matches!(builder.get_clients().await, Err(Error::Sequencing(_))));
    assert!(matches!(
        clients.custody().unwrap().get_info().await,
        Err(Error::Sequencing(_))
    ));
    assert!(matches!(
        clients.bitcoin().block_height().await,
        Err(Error::Sequencing(_))
    ));
}

#[tokio::test]
async fn test_unconfigured_role_is_unknown() {
    let config =
        HarnessConfig::simulated().with_roles([Role::Bitcoin, Role::Custody, Role::ThirdParty]);
    let (builder, _) = sim_builder("subset", config);
    builder.start_node().await.unwrap();
    let clients = builder.get_clients().await.unwrap();

    assert!(matches!(clients.rebalancer(), Err(Error::UnknownRole(_))));
    assert!(matches!(clients.lightning(Role::Bitcoin), Err(Error::UnknownRole(_))));
    assert!(matches!(
        builder.node_state(Role::Rebalancer).await,
        Err(Error::UnknownRole(_))
    ));
    assert!(matches!(
        builder
            .open_channel(Role::Rebalancer, Role::Custody, Amount::from_sat(100_000))
            .await,
        Err(Error::UnknownRole(_))
    ));
    builder.teardown().await;
}

#[tokio::test]
async fn test_duplicate_names_rejected_while_alive() {
    let launcher = LightningNodeLauncher::new(HarnessConfig::simulated());
    let name = unique_name("dup");

    let first = launcher.create_builder(&name).unwrap();
    assert!(matches!(launcher.create_builder(&name), Err(Error::Config(_))));

    first.teardown().await;
    let second = launcher.create_builder(&name).unwrap();
    second.teardown().await;
}

#[tokio::test]
async fn test_dropping_builder_releases_name() {
    let launcher = LightningNodeLauncher::new(HarnessConfig::simulated());
    let name = unique_name("dropped");
    drop(launcher.create_builder(&name).unwrap());
    launcher.create_builder(&name).unwrap();
}

#[tokio::test]
async fn test_failed_start_then_teardown_stops_every_node() {
    let mut config = sim_config(SimConfig {
        unready_roles: vec![Role::ThirdParty],
        ..SimConfig::default()
    });
    config.timeouts.node_startup_secs = 1;
    let (builder, network) = sim_builder("failed-start", config);

    let err = builder.start_node().await.unwrap_err();
    let Error::Startup { roles, .. } = err else {
        panic!("expected startup error, got {err}");
    };
    assert_eq!(roles, vec![Role::ThirdParty]);
    assert!(matches!(builder.state().await, TopologyState::Failed(_)));
    assert!(matches!(
        builder.node_state(Role::ThirdParty).await.unwrap(),
        NodeState::Failed(_)
    ));
    assert_eq!(builder.node_state(Role::Custody).await.unwrap(), NodeState::Ready);
    assert!(network.is_online(Role::Custody));

    let report = builder.teardown().await;
    assert!(report.is_clean());
    assert_eq!(report.stopped.len(), 4);
    for role in Role::ALL {
        assert!(!network.is_online(role), "{role} still online");
        assert_eq!(builder.node_state(role).await.unwrap(), NodeState::Stopped);
    }
}

#[tokio::test]
async fn test_failed_chain_node_skips_lightning_phase() {
    let mut config = sim_config(SimConfig {
        unready_roles: vec![Role::Bitcoin],
        ..SimConfig::default()
    });
    config.timeouts.node_startup_secs = 1;
    let (builder, _) = sim_builder("failed-chain", config);

    let err = builder.start_node().await.unwrap_err();
    assert!(matches!(err, Error::Startup { ref roles, .. } if roles == &vec![Role::Bitcoin]));
    assert!(matches!(
        builder.node_state(Role::Custody).await,
        Err(Error::UnknownRole(_))
    ));
    assert_eq!(builder.teardown().await.stopped, vec![Role::Bitcoin]);
}

#[tokio::test]
async fn test_unresponsive_node_is_forced_not_fatal() {
    let mut config = sim_config(SimConfig {
        unresponsive_roles: vec![Role::Custody],
        ..SimConfig::default()
    });
    config.timeouts.node_stop_secs = 1;
    let (builder, network) = sim_builder("unresponsive", config);
    builder.start_node().await.unwrap();

    let report = builder.teardown().await;
    assert_eq!(report.forced, vec![Role::Custody]);
    assert_eq!(report.stopped.len(), 3);
    assert!(!network.is_online(Role::Custody));
}

#[tokio::test]
async fn test_scoped_tears_down_after_error() {
    let launcher = LightningNodeLauncher::new(HarnessConfig::simulated());
    let name = unique_name("scoped-err");

    let result: lntest_harness::Result<()> = launcher
        .scoped(&name, |builder| async move {
            builder.start_node().await?;
            Err(Error::Config("body failed".to_string()))
        })
        .await;

    assert!(matches!(result, Err(Error::Config(ref m)) if m == "body failed"));
    // Name released by teardown
    launcher.create_builder(&name).unwrap();
}

#[tokio::test]
async fn test_scoped_tears_down_after_panic() {
    let launcher = LightningNodeLauncher::new(HarnessConfig::simulated());
    let name = unique_name("scoped-panic");
    let (tx, rx) = tokio::sync::oneshot::channel();

    let scoped_name = name.clone();
    let outcome = tokio::spawn(async move {
        launcher
            .scoped(&scoped_name, |builder| async move {
                builder.start_node().await?;
                let clients = builder.get_clients().await?;
                let roles = clients.roles().len();
                tx.send(clients).ok();
                if roles == 4 {
                    panic!("test body panicked");
                }
                Ok(())
            })
            .await
    })
    .await;

    let panic = outcome.unwrap_err();
    assert!(panic.is_panic());

    let clients = rx.await.unwrap();
    assert!(matches!(
        clients.custody().unwrap().get_info().await,
        Err(Error::Sequencing(_))
    ));
    let launcher = LightningNodeLauncher::new(HarnessConfig::simulated());
    launcher.create_builder(&name).unwrap();
}

#[tokio::test]
async fn test_scoped_returns_body_value() {
    let launcher = LightningNodeLauncher::new(HarnessConfig::simulated());
    let height = launcher
        .scoped(&unique_name("scoped-ok"), |builder| async move {
            builder.start_node().await?;
            builder.prepare_funds(Amount::from_sat(1_000)).await?;
            builder.get_clients().await?.bitcoin().block_height().await
        })
        .await
        .unwrap();
    assert_eq!(height, 101);
}

#[tokio::test]
async fn test_stalled_rpc_times_out() {
    let mut config = sim_config(SimConfig {
        stalled_rpc_roles: vec![Role::Custody],
        ..SimConfig::default()
    });
    config.timeouts.rpc_secs = 1;
    let (builder, _) = sim_builder("stalled", config);
    builder.start_node().await.unwrap();
    let clients = builder.get_clients().await.unwrap();

    let err = clients.custody().unwrap().get_info().await.unwrap_err();
    assert!(matches!(
        err,
        Error::RpcTimeout { role: Role::Custody, method: "get_info", .. }
    ));
    clients.third_party().unwrap().get_info().await.unwrap();
    builder.teardown().await;
}

#[tokio::test]
async fn test_manifest_reflects_topology() {
    let (builder, _) = running("manifest").await;
    builder
        .open_channel(Role::Custody, Role::ThirdParty, Amount::from_sat(300_000))
        .await
        .unwrap();

    let manifest = builder.manifest().await;
    assert_eq!(manifest.name, builder.name());
    assert_eq!(manifest.backend, "simulated");
    assert_eq!(manifest.nodes.len(), 4);
    assert_eq!(manifest.channels.len(), 1);
    assert!(manifest.nodes.iter().all(|n| n.state == NodeState::Ready));
    builder.teardown().await;
}
