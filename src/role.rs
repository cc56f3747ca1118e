//! Node roles within a test topology.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The part a node plays in a test topology.
///
/// `Bitcoin` is the on-chain node that mines blocks and funds wallets. The
/// remaining roles are Lightning nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    /// Regtest chain backend and funding wallet.
    Bitcoin,
    /// Lightning node that rebalances liquidity.
    Rebalancer,
    /// Lightning node holding custodial funds.
    Custody,
    /// Independent Lightning peer, typically the routing hub.
    ThirdParty,
}

impl Role {
    /// All Lightning roles in launch order.
    pub const LIGHTNING: [Role; 3] = [Role::Rebalancer, Role::Custody, Role::ThirdParty];

    /// Every role, chain first.
    pub const ALL: [Role; 4] = [
        Role::Bitcoin,
        Role::Rebalancer,
        Role::Custody,
        Role::ThirdParty,
    ];

    /// Whether this role runs a Lightning node.
    #[must_use]
    pub fn is_lightning(self) -> bool {
        !matches!(self, Self::Bitcoin)
    }

    /// Lowercase identifier used for directories and process names.
    #[must_use]
    pub fn slug(self) -> &'static str {
        match self {
            Self::Bitcoin => "bitcoin",
            Self::Rebalancer => "rebalancer",
            Self::Custody => "custody",
            Self::ThirdParty => "third-party",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bitcoin => "Bitcoin",
            Self::Rebalancer => "Rebalancer",
            Self::Custody => "Custody",
            Self::ThirdParty => "ThirdParty",
        };
        f.write_str(name)
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| !matches!(c, '-' | '_' | ' '))
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "bitcoin" | "chain" => Ok(Self::Bitcoin),
            "rebalancer" => Ok(Self::Rebalancer),
            "custody" => Ok(Self::Custody),
            "thirdparty" => Ok(Self::ThirdParty),
            _ => Err(Error::UnknownRole(s.to_string())),
        }
    }
}
