use serde::{Deserialize, Serialize};
use std::fmt;

pub const KB_PER_MB: u64 = 1024;
pub const KB_PER_GB: u64 = 1024 * 1024;

/// Storage capacity in integer kilobyte base units.
///
/// Balances are tracked in whole kilobytes so that conservation checks are
/// exact; fractional megabyte/gigabyte amounts from the API surface are
/// converted at the boundary.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct StorageAmount(u64);

impl StorageAmount {
    pub const ZERO: Self = Self(0);

    pub const fn from_kb(kb: u64) -> Self {
        Self(kb)
    }

    pub fn from_mb(mb: f64) -> Self {
        Self((mb * KB_PER_MB as f64) as u64)
    }

    pub fn from_gb(gb: f64) -> Self {
        Self((gb * KB_PER_GB as f64) as u64)
    }

    pub fn to_kb(&self) -> u64 {
        self.0
    }

    pub fn to_mb(&self) -> f64 {
        self.0 as f64 / KB_PER_MB as f64
    }

    pub fn to_gb(&self) -> f64 {
        self.0 as f64 / KB_PER_GB as f64
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(&self, other: Self) -> Option<Self> {
        self.0.checked_add(other.0).map(Self)
    }

    pub fn checked_sub(&self, other: Self) -> Option<Self> {
        self.0.checked_sub(other.0).map(Self)
    }

    pub fn saturating_add(&self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(&self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }
}

impl fmt::Display for StorageAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3} MB", self.to_mb())
    }
}

pub const MICRO_PER_USD: u64 = 1_000_000;

/// Money in the stable unit of account, held as integer micro-USD
/// (six decimals, stablecoin precision).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct UsdAmount(u64);

impl UsdAmount {
    pub const ZERO: Self = Self(0);

    pub const fn from_micro(micro: u64) -> Self {
        Self(micro)
    }

    pub fn from_usd(usd: f64) -> Self {
        Self((usd * MICRO_PER_USD as f64).round() as u64)
    }

    pub fn to_micro(&self) -> u64 {
        self.0
    }

    pub fn to_usd(&self) -> f64 {
        self.0 as f64 / MICRO_PER_USD as f64
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// The given percentage of this amount, rounded to the nearest micro-USD.
    pub fn percent(&self, pct: f64) -> Self {
        Self((self.0 as f64 * pct / 100.0).round() as u64)
    }

    pub fn checked_add(&self, other: Self) -> Option<Self> {
        self.0.checked_add(other.0).map(Self)
    }

    pub fn checked_sub(&self, other: Self) -> Option<Self> {
        self.0.checked_sub(other.0).map(Self)
    }

    pub fn saturating_sub(&self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }

    pub fn abs_diff(&self, other: Self) -> Self {
        Self(self.0.abs_diff(other.0))
    }
}

impl fmt::Display for UsdAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2} USD", self.to_usd())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_conversions() {
        let one_gb = StorageAmount::from_gb(1.0);
        assert_eq!(one_gb.to_kb(), KB_PER_GB);
        assert_eq!(one_gb.to_mb(), 1024.0);
        assert_eq!(StorageAmount::from_mb(1024.0), one_gb);
    }

    #[test]
    fn storage_arithmetic() {
        let a = StorageAmount::from_mb(100.0);
        let b = StorageAmount::from_mb(30.0);
        assert_eq!(a.checked_sub(b).unwrap(), StorageAmount::from_mb(70.0));
        assert!(b.checked_sub(a).is_none());
        assert_eq!(b.saturating_sub(a), StorageAmount::ZERO);
    }

    #[test]
    fn usd_percent_split_is_exact() {
        let total = UsdAmount::from_usd(2.0);
        let fee = total.percent(10.0);
        let seller = total.checked_sub(fee).unwrap();
        assert_eq!(fee, UsdAmount::from_usd(0.20));
        assert_eq!(seller, UsdAmount::from_usd(1.80));
        assert_eq!(fee.checked_add(seller).unwrap(), total);
    }

    #[test]
    fn usd_diff() {
        let quoted = UsdAmount::from_usd(4.40);
        let paid = UsdAmount::from_usd(4.41);
        assert_eq!(quoted.abs_diff(paid), UsdAmount::from_usd(0.01));
    }
}
