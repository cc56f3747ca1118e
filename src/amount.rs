//! Bitcoin amounts.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Satoshis per bitcoin.
pub const SATS_PER_BTC: u64 = 100_000_000;

/// Millisatoshis per satoshi.
pub const MSATS_PER_SAT: u64 = 1_000;

/// An amount of bitcoin, stored in satoshis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Amount(u64);

impl Amount {
    /// Zero satoshis.
    pub const ZERO: Amount = Amount(0);

    /// Amount from satoshis.
    #[must_use]
    pub const fn from_sat(sats: u64) -> Self {
        Self(sats)
    }

    /// Amount from a decimal BTC value, rounded to the nearest satoshi.
    ///
    /// Negative and non-finite inputs yield `None`.
    #[must_use]
    pub fn from_btc(btc: f64) -> Option<Self> {
        if !btc.is_finite() || btc < 0.0 {
            return None;
        }
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss
        )]
        let sats = (btc * SATS_PER_BTC as f64).round() as u64;
        Some(Self(sats))
    }

    /// Value in satoshis.
    #[must_use]
    pub const fn as_sat(self) -> u64 {
        self.0
    }

    /// Value in millisatoshis (saturating).
    #[must_use]
    pub const fn as_msat(self) -> u64 {
        self.0.saturating_mul(MSATS_PER_SAT)
    }

    /// Value in BTC, for RPC interfaces that speak decimal bitcoin.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_btc(self) -> f64 {
        self.0 as f64 / SATS_PER_BTC as f64
    }

    /// Checked addition.
    #[must_use]
    pub fn checked_add(self, other: Self) -> Option<Self> {
        self.0.checked_add(other.0).map(Self)
    }

    /// Saturating subtraction.
    #[must_use]
    pub fn saturating_sub(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} sat", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_conversions() {
        let amount = Amount::from_sat(500_000);
        assert_eq!(amount.as_msat(), 500_000_000);
        assert!((amount.as_btc() - 0.005).abs() < f64::EPSILON);
    }

    #[test]
    fn test_from_btc_rounds_to_sat() {
        assert_eq!(Amount::from_btc(0.01), Some(Amount::from_sat(1_000_000)));
        assert_eq!(Amount::from_btc(50.0), Some(Amount::from_sat(5_000_000_000)));
        assert_eq!(Amount::from_btc(-1.0), None);
        assert_eq!(Amount::from_btc(f64::NAN), None);
    }

    #[test]
    fn test_checked_add_overflow() {
        assert!(Amount::from_sat(u64::MAX)
            .checked_add(Amount::from_sat(1))
            .is_none());
        assert_eq!(
            Amount::from_sat(5).saturating_sub(Amount::from_sat(9)),
            Amount::ZERO
        );
    }
}
