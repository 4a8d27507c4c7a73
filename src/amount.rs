//! Fixed-point USDC amounts.
//!
//! Amounts are stored as arbitrary-precision integers in minor units
//! (1 USDC = 1,000,000 minor units) so that sums across thousands of
//! agent-hours never lose precision the way an `f64` balance would.

use std::fmt;
use std::str::FromStr;

use num_bigint::BigInt;
use num_traits::{Signed, Zero};
use thiserror::Error;

const DECIMALS: usize = 6;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AmountError {
    #[error("amount must not be negative: {0:?}")]
    Negative(String),
    #[error("malformed amount: {0:?}")]
    Malformed(String),
}

/// A non-negative fixed-point decimal with exactly six fractional digits,
/// represented internally as minor units (1 USDC = 1_000_000).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UsdcAmount {
    minor_units: i128,
}

impl UsdcAmount {
    pub const ZERO: UsdcAmount = UsdcAmount { minor_units: 0 };

    pub fn from_minor_units(minor_units: i128) -> Self {
        Self { minor_units }
    }

    pub fn minor_units(&self) -> i128 {
        self.minor_units
    }

    pub fn is_zero(&self) -> bool {
        self.minor_units == 0
    }

    pub fn checked_add(&self, other: &UsdcAmount) -> Option<UsdcAmount> {
        self.minor_units
            .checked_add(other.minor_units)
            .map(Self::from_minor_units)
    }

    pub fn checked_sub(&self, other: &UsdcAmount) -> Option<UsdcAmount> {
        self.minor_units
            .checked_sub(other.minor_units)
            .map(Self::from_minor_units)
    }

    pub fn saturating_sub(&self, other: &UsdcAmount) -> UsdcAmount {
        Self::from_minor_units((self.minor_units - other.minor_units).max(0))
    }

    /// Parse a canonical or shorthand decimal string into minor units.
    ///
    /// Rejects a leading `-`, more than one `.`, or non-digit characters.
    /// Empty string parses to zero. Fractional digits beyond the sixth are
    /// truncated, not rounded; fewer than six are zero-padded.
    pub fn parse(text: &str) -> Result<UsdcAmount, AmountError> {
        if text.is_empty() {
            return Ok(UsdcAmount::ZERO);
        }
        if let Some(stripped) = text.strip_prefix('-') {
            return Err(AmountError::Negative(stripped.to_string()));
        }

        let mut parts = text.splitn(3, '.');
        let int_part = parts.next().unwrap_or("");
        let frac_part = parts.next();
        if parts.next().is_some() {
            return Err(AmountError::Malformed(text.to_string()));
        }

        if !int_part.chars().all(|c| c.is_ascii_digit()) {
            return Err(AmountError::Malformed(text.to_string()));
        }
        let frac_part = frac_part.unwrap_or("");
        if !frac_part.chars().all(|c| c.is_ascii_digit()) {
            return Err(AmountError::Malformed(text.to_string()));
        }

        let int_value: i128 = if int_part.is_empty() {
            0
        } else {
            int_part
                .parse()
                .map_err(|_| AmountError::Malformed(text.to_string()))?
        };

        let mut frac_digits: String = frac_part.chars().take(DECIMALS).collect();
        while frac_digits.len() < DECIMALS {
            frac_digits.push('0');
        }
        let frac_value: i128 = if frac_digits.is_empty() {
            0
        } else {
            frac_digits
                .parse()
                .map_err(|_| AmountError::Malformed(text.to_string()))?
        };

        let scale = 10i128.pow(DECIMALS as u32);
        Ok(UsdcAmount::from_minor_units(int_value * scale + frac_value))
    }

    /// Parse a literal known at compile time to be canonical; panics on malformed input.
    /// Intended for constants in rule tables and tests, not for untrusted input.
    pub fn dollars(text: &str) -> UsdcAmount {
        Self::parse(text).expect("dollars() literal must be a valid USDC amount")
    }

    /// Format as a canonical six-decimal string, e.g. `"12.340000"`.
    /// Negative values (which `parse` never produces, but internal diffs can)
    /// render with a leading `-`.
    pub fn format(&self) -> String {
        let scale = BigInt::from(10i64.pow(DECIMALS as u32));
        let value = BigInt::from(self.minor_units);
        let negative = value.is_negative();
        let magnitude = value.abs();
        let whole = &magnitude / &scale;
        let frac = &magnitude % &scale;
        let sign = if negative { "-" } else { "" };
        format!("{sign}{whole}.{frac:0width$}", width = DECIMALS)
    }
}

impl Default for UsdcAmount {
    fn default() -> Self {
        UsdcAmount::ZERO
    }
}

impl fmt::Display for UsdcAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format())
    }
}

impl FromStr for UsdcAmount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        UsdcAmount::parse(s)
    }
}

impl Zero for UsdcAmount {
    fn zero() -> Self {
        UsdcAmount::ZERO
    }

    fn is_zero(&self) -> bool {
        UsdcAmount::is_zero(self)
    }
}
