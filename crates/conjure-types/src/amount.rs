//! Amount types for Conjure
//!
//! Credits are the internal accounting unit: deposits mint them, generations
//! consume them. Credit arithmetic is integer-only and checked. USD values
//! (deposit valuation, quotes) use `rust_decimal` and convert to credits at
//! a published rate.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ConjureError;

/// An amount of credit units.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct CreditAmount(pub u64);

impl CreditAmount {
    pub const fn new(units: u64) -> Self {
        Self(units)
    }

    pub const fn zero() -> Self {
        Self(0)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Self) -> Option<Self> {
        self.0.checked_add(other.0).map(Self)
    }

    pub fn checked_sub(self, other: Self) -> Option<Self> {
        self.0.checked_sub(other.0).map(Self)
    }

    /// Sum with overflow detection.
    pub fn checked_sum<I: IntoIterator<Item = Self>>(amounts: I) -> Option<Self> {
        amounts
            .into_iter()
            .try_fold(Self::zero(), |acc, a| acc.checked_add(a))
    }
}

impl fmt::Display for CreditAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} credits", self.0)
    }
}

/// A USD value with decimal precision.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct UsdAmount(pub Decimal);

impl UsdAmount {
    pub fn new(value: Decimal) -> Self {
        Self(value)
    }

    pub fn zero() -> Self {
        Self(Decimal::ZERO)
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn checked_add(self, other: Self) -> Option<Self> {
        self.0.checked_add(other.0).map(Self)
    }

    pub fn checked_mul(self, factor: Decimal) -> Option<Self> {
        self.0.checked_mul(factor).map(Self)
    }
}

impl fmt::Display for UsdAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${:.4}", self.0)
    }
}

/// The published USD → credit conversion rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditRate {
    /// Credit units minted per one USD.
    pub credits_per_usd: Decimal,
}

impl CreditRate {
    pub fn new(credits_per_usd: Decimal) -> Self {
        Self { credits_per_usd }
    }

    /// Convert a USD value to whole credit units, rounding down.
    ///
    /// Rounding down keeps the ledger conservative: a deposit never mints
    /// more credits than its USD value covers.
    pub fn to_credits(&self, usd: UsdAmount) -> Result<CreditAmount, ConjureError> {
        let units = usd
            .0
            .checked_mul(self.credits_per_usd)
            .ok_or_else(|| ConjureError::internal("credit conversion overflow"))?;
        if units.is_sign_negative() {
            return Err(ConjureError::internal("negative credit conversion"));
        }
        let floored = units.floor();
        floored
            .to_u64()
            .map(CreditAmount::new)
            .ok_or_else(|| ConjureError::internal("credit conversion out of range"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    #[test]
    fn test_checked_sub_underflow() {
        let a = CreditAmount::new(5);
        let b = CreditAmount::new(10);
        assert!(a.checked_sub(b).is_none());
        assert_eq!(b.checked_sub(a), Some(CreditAmount::new(5)));
    }

    #[test]
    fn test_checked_sum() {
        let total = CreditAmount::checked_sum([
            CreditAmount::new(1),
            CreditAmount::new(2),
            CreditAmount::new(3),
        ]);
        assert_eq!(total, Some(CreditAmount::new(6)));
    }

    #[test]
    fn test_usd_to_credits_rounds_down() {
        let rate = CreditRate::new(Decimal::new(100, 0)); // 100 credits per USD
        let usd = UsdAmount::new(Decimal::new(10999, 4)); // $1.0999
        let credits = rate.to_credits(usd).unwrap();
        assert_eq!(credits, CreditAmount::new(109));
    }

    #[test]
    fn test_usd_to_credits_exact() {
        let rate = CreditRate::new(Decimal::new(100, 0));
        let usd = UsdAmount::new(Decimal::new(25, 1)); // $2.50
        assert_eq!(rate.to_credits(usd).unwrap(), CreditAmount::new(250));
    }
}
