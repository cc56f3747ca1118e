//! lntest-topology CLI entry point.

mod cli;

use clap::Parser;
use cli::Cli;
use lntest_harness::{Amount, Builder, HarnessConfig, LightningNodeLauncher};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => HarnessConfig::from_file(path)?,
        None => HarnessConfig::default(),
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level(&config)));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("lntest-topology v{}", env!("CARGO_PKG_VERSION"));
    if let Some(backend) = cli.backend {
        config.backend = backend.into();
    }
    if !cli.roles.is_empty() {
        config = config.with_roles(cli.roles.iter().copied());
    }

    let launcher = LightningNodeLauncher::new(config);
    let builder = launcher.create_builder(&cli.name)?;

    let outcome = run(&builder, &cli).await;
    let report = builder.teardown().await;
    if !report.is_clean() {
        warn!("Forced to kill {:?} during teardown", report.forced);
    }
    outcome
}

async fn run(builder: &Builder, cli: &Cli) -> color_eyre::Result<()> {
    builder.start_node().await?;
    builder.connect_all().await?;

    if let Some(sats) = cli.prepare_funds_sat {
        builder.prepare_funds(Amount::from_sat(sats)).await?;
    }
    if let Some(sats) = cli.prepare_ln_funds_sat {
        builder.prepare_ln_funds(Amount::from_sat(sats)).await?;
    }
    for channel in &cli.channels {
        builder
            .open_channel(channel.from, channel.to, channel.capacity)
            .await?;
    }

    let json = serde_json::to_string_pretty(&builder.manifest().await)?;
    if let Some(path) = &cli.manifest {
        tokio::fs::write(path, &json).await?;
        info!("Wrote manifest to {}", path.display());
    } else {
        println!("{json}");
    }

    if cli.hold {
        info!("Topology {} running. Press Ctrl+C to stop.", builder.name());
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
