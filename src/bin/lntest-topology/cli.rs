//! CLI definition for lntest-topology.

use clap::{Parser, ValueEnum};
use lntest_harness::{Amount, BackendKind, HarnessConfig, Role};
use std::path::PathBuf;
use std::str::FromStr;

/// Launch a regtest Lightning topology and print its manifest.
#[derive(Parser, Debug)]
#[command(name = "lntest-topology")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Topology name.
    #[arg(long, default_value = "lntest")]
    pub name: String,

    /// Harness configuration file (TOML).
    #[arg(long, env = "LNTEST_CONFIG")]
    pub config: Option<PathBuf>,

    /// Node backend; overrides the configuration file.
    #[arg(long, value_enum)]
    pub backend: Option<Backend>,

    /// Roles to launch, comma separated.
    #[arg(long, value_delimiter = ',')]
    pub roles: Vec<Role>,

    /// Make the funding node hold at least this many sats.
    #[arg(long)]
    pub prepare_funds_sat: Option<u64>,

    /// Deposit this many sats into every prefunded Lightning wallet.
    #[arg(long)]
    pub prepare_ln_funds_sat: Option<u64>,

    /// Channel to open, as FROM:TO:SATS. Repeatable.
    #[arg(long = "channel")]
    pub channels: Vec<ChannelArg>,

    /// Path to write the topology manifest JSON.
    #[arg(long)]
    pub manifest: Option<PathBuf>,

    /// Keep the topology running until Ctrl+C.
    #[arg(long)]
    pub hold: bool,

    /// Log level; defaults to the configuration's `log_level`.
    #[arg(long)]
    pub log_level: Option<String>,
}

impl Cli {
    /// Effective log level: the flag, else the configuration's.
    pub fn log_level<'a>(&'a self, config: &'a HarnessConfig) -> &'a str {
        self.log_level.as_deref().unwrap_or(&config.log_level)
    }
}

/// Backend choice on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// In-process simulation.
    Simulated,
    /// Real bitcoind and lnd.
    Process,
}

impl From<Backend> for BackendKind {
    fn from(backend: Backend) -> Self {
        match backend {
            Backend::Simulated => Self::Simulated,
            Backend::Process => Self::Process,
        }
    }
}

/// A `FROM:TO:SATS` channel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelArg {
    pub from: Role,
    pub to: Role,
    pub capacity: Amount,
}

impl FromStr for ChannelArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        let [from, to, sats] = parts.as_slice() else {
            return Err(format!("expected FROM:TO:SATS, got {s}"));
        };
        let from = from.parse::<Role>().map_err(|e| e.to_string())?;
        let to = to.parse::<Role>().map_err(|e| e.to_string())?;
        let sats = sats
            .parse::<u64>()
            .map_err(|e| format!("invalid capacity {sats}: {e}"))?;
        Ok(Self {
            from,
            to,
            capacity: Amount::from_sat(sats),
        })
    }
}
