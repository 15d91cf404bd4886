//! Fixed-precision monetary values and ownership percentages
//!
//! `Money` stores integer minor units (two decimal places), `Percentage`
//! stores basis points (hundredths of a percent). Neither type is ever
//! backed by a binary float.

use bigdecimal::{BigDecimal, ToPrimitive};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of minor units in one major unit (e.g. kobo per naira)
pub const MINOR_UNITS_PER_MAJOR: i64 = 100;

/// Decimal places carried by [`Money`]
pub const MONEY_SCALE: i64 = 2;

/// Basis points representing 100%
pub const BPS_PER_WHOLE: u32 = 10_000;

/// Errors raised by monetary arithmetic and conversion
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MoneyError {
    #[error("Arithmetic overflow")]
    Overflow,
    #[error("Value {0} has more than two decimal places")]
    Precision(String),
    #[error("Value {0} is out of range")]
    OutOfRange(String),
    #[error("Division by zero")]
    DivisionByZero,
}

/// Integer division rounding half to even (banker's rounding).
///
/// `den` must be positive.
pub(crate) fn div_round_half_even(num: i128, den: i128) -> i128 {
    let quotient = num.div_euclid(den);
    let remainder = num.rem_euclid(den);
    let twice = remainder * 2;

    if twice > den || (twice == den && quotient % 2 != 0) {
        quotient + 1
    } else {
        quotient
    }
}

/// A monetary amount in minor units
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    /// Create from minor units (e.g. 150 == 1.50)
    pub const fn from_minor(minor_units: i64) -> Self {
        Self(minor_units)
    }

    /// Create from whole major units
    pub fn from_major(major_units: i64) -> Result<Self, MoneyError> {
        major_units
            .checked_mul(MINOR_UNITS_PER_MAJOR)
            .map(Self)
            .ok_or(MoneyError::Overflow)
    }

    /// Convert an exact decimal amount. Values carrying more than two decimal
    /// places are rejected rather than rounded.
    pub fn from_decimal(value: &BigDecimal) -> Result<Self, MoneyError> {
        let scaled = value.with_scale(MONEY_SCALE);
        if &scaled != value {
            return Err(MoneyError::Precision(value.to_string()));
        }

        (scaled * BigDecimal::from(MINOR_UNITS_PER_MAJOR))
            .to_i64()
            .map(Self)
            .ok_or_else(|| MoneyError::OutOfRange(value.to_string()))
    }

    pub const fn minor_units(self) -> i64 {
        self.0
    }

    pub fn to_decimal(self) -> BigDecimal {
        BigDecimal::new(self.0.into(), MONEY_SCALE)
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn checked_add(self, other: Money) -> Result<Money, MoneyError> {
        self.0
            .checked_add(other.0)
            .map(Self)
            .ok_or(MoneyError::Overflow)
    }

    pub fn checked_sub(self, other: Money) -> Result<Money, MoneyError> {
        self.0
            .checked_sub(other.0)
            .map(Self)
            .ok_or(MoneyError::Overflow)
    }

    pub fn checked_neg(self) -> Result<Money, MoneyError> {
        self.0.checked_neg().map(Self).ok_or(MoneyError::Overflow)
    }

    /// Sum a sequence of amounts, failing on overflow
    pub fn checked_sum<I>(amounts: I) -> Result<Money, MoneyError>
    where
        I: IntoIterator<Item = Money>,
    {
        amounts
            .into_iter()
            .try_fold(Money::ZERO, |acc, amount| acc.checked_add(amount))
    }

    /// Apply a percentage, rounding half to even
    pub fn percent(self, share: Percentage) -> Result<Money, MoneyError> {
        let product = i128::from(self.0) * i128::from(share.bps());
        let rounded = div_round_half_even(product, i128::from(BPS_PER_WHOLE));
        i64::try_from(rounded)
            .map(Self)
            .map_err(|_| MoneyError::Overflow)
    }

    /// `self * part / whole`, rounded toward negative infinity.
    ///
    /// Callers are responsible for placing the remainder.
    pub fn prorate(self, part: u64, whole: u64) -> Result<Money, MoneyError> {
        if whole == 0 {
            return Err(MoneyError::DivisionByZero);
        }
        let product = i128::from(self.0) * i128::from(part);
        let share = product.div_euclid(i128::from(whole));
        i64::try_from(share)
            .map(Self)
            .map_err(|_| MoneyError::Overflow)
    }

    /// `self / whole` expressed in basis points, rounded half to even.
    /// The result is signed and unbounded above.
    pub fn ratio_bps(self, whole: Money) -> Result<i64, MoneyError> {
        if whole.0 <= 0 {
            return Err(MoneyError::DivisionByZero);
        }
        let scaled = i128::from(self.0) * i128::from(BPS_PER_WHOLE);
        let rounded = div_round_half_even(scaled, i128::from(whole.0));
        i64::try_from(rounded).map_err(|_| MoneyError::Overflow)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let per_major = MINOR_UNITS_PER_MAJOR as u64;
        write!(f, "{}{}.{:02}", sign, abs / per_major, abs % per_major)
    }
}

/// An ownership or revenue share with two-decimal precision, 0% to 100%
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "u32", into = "u32")]
pub struct Percentage(u32);

impl Percentage {
    pub const ZERO: Percentage = Percentage(0);
    pub const HUNDRED: Percentage = Percentage(BPS_PER_WHOLE);

    /// Create from basis points (1250 == 12.50%)
    pub fn from_bps(bps: u32) -> Result<Self, MoneyError> {
        if bps > BPS_PER_WHOLE {
            return Err(MoneyError::OutOfRange(format!("{} bps", bps)));
        }
        Ok(Self(bps))
    }

    /// Create from a whole percentage (25 == 25.00%)
    pub fn from_whole(percent: u32) -> Result<Self, MoneyError> {
        let bps = percent.checked_mul(100).ok_or(MoneyError::Overflow)?;
        Self::from_bps(bps)
    }

    /// Convert an exact decimal percentage such as `12.5`
    pub fn from_decimal(value: &BigDecimal) -> Result<Self, MoneyError> {
        let scaled = value.with_scale(2);
        if &scaled != value {
            return Err(MoneyError::Precision(value.to_string()));
        }

        let bps = (scaled * BigDecimal::from(100))
            .to_u32()
            .ok_or_else(|| MoneyError::OutOfRange(value.to_string()))?;
        Self::from_bps(bps)
    }

    pub const fn bps(self) -> u32 {
        self.0
    }

    pub fn to_decimal(self) -> BigDecimal {
        BigDecimal::new(i64::from(self.0).into(), 2)
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Percentage) -> Result<Percentage, MoneyError> {
        Self::from_bps(self.0 + other.0)
    }

    pub fn checked_sub(self, other: Percentage) -> Result<Percentage, MoneyError> {
        self.0
            .checked_sub(other.0)
            .map(Self)
            .ok_or_else(|| MoneyError::OutOfRange(format!("{} - {}", self, other)))
    }

    /// What is left of 100% after this share
    pub fn complement(self) -> Percentage {
        Percentage(BPS_PER_WHOLE - self.0)
    }

    /// `part / whole` as a percentage, rounded half to even
    pub fn fraction_of(part: Money, whole: Money) -> Result<Percentage, MoneyError> {
        let bps = part.ratio_bps(whole)?;
        if bps < 0 {
            return Err(MoneyError::OutOfRange(format!("{} of {}", part, whole)));
        }
        let bps = u32::try_from(bps).map_err(|_| MoneyError::OutOfRange(format!("{} of {}", part, whole)))?;
        Self::from_bps(bps)
    }

    /// True when `part / whole * 100` is exactly at most this percentage.
    /// The comparison happens before any rounding.
    pub fn admits(self, part: Money, whole: Money) -> bool {
        if whole.minor_units() <= 0 {
            return false;
        }
        i128::from(part.minor_units()) * i128::from(BPS_PER_WHOLE)
            <= i128::from(self.0) * i128::from(whole.minor_units())
    }
}

impl TryFrom<u32> for Percentage {
    type Error = MoneyError;

    fn try_from(bps: u32) -> Result<Self, Self::Error> {
        Self::from_bps(bps)
    }
}

impl From<Percentage> for u32 {
    fn from(value: Percentage) -> Self {
        value.0
    }
}

impl fmt::Display for Percentage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}%", self.0 / 100, self.0 % 100)
    }
}
