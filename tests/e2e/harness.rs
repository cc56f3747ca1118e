//! Shared setup for the e2e suites.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use lntest_harness::{Builder, HarnessConfig, SimBackend, SimConfig, SimNetwork};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT: AtomicU64 = AtomicU64::new(0);

/// Topology name unique within this test binary.
pub fn unique_name(prefix: &str) -> String {
    format!("{prefix}-{}", NEXT.fetch_add(1, Ordering::SeqCst))
}

/// Builder on the simulated backend, plus a handle on its network.
pub fn sim_builder(prefix: &str, config: HarnessConfig) -> (Builder, SimNetwork) {
    let name = unique_name(prefix);
    let backend = Arc::new(SimBackend::new(&name, config.sim.clone()));
    let network = backend.network();
    let builder = Builder::with_backend(&name, config, backend).expect("builder");
    (builder, network)
}

/// Simulated config with the given fault injection.
pub fn sim_config(sim: SimConfig) -> HarnessConfig {
    HarnessConfig {
        sim,
        ..HarnessConfig::simulated()
    }
}

/// Started and fully connected simulated topology.
pub async fn running(prefix: &str) -> (Builder, SimNetwork) {
    let (builder, network) = sim_builder(prefix, HarnessConfig::simulated());
    builder.start_node().await.expect("start_node");
    builder.connect_all().await.expect("connect_all");
    (builder, network)
}
