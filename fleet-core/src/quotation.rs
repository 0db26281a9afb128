//! Fixed-point monetary arithmetic in `(units, nano)` pairs.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Nanos per whole unit.
const NANO_FACTOR: i64 = 1_000_000_000;

/// A fixed-point number representing `units + nano * 10^-9`.
///
/// The pair is kept normalized: `nano.abs() < 10^9` and `units` and `nano`
/// never carry opposite signs.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Quotation {
    pub units: i64,
    pub nano: i32,
}

impl Quotation {
    pub const ZERO: Quotation = Quotation { units: 0, nano: 0 };

    /// Build a quotation from raw parts, normalizing carry and sign.
    #[must_use]
    pub fn new(units: i64, nano: i32) -> Self {
        Self::from_nanos(units as i128 * NANO_FACTOR as i128 + nano as i128)
    }

    /// Build a quotation from a whole number of units.
    #[must_use]
    pub fn from_units(units: i64) -> Self {
        Self { units, nano: 0 }
    }

    /// Total value expressed in nanos.
    #[must_use]
    pub fn as_nanos(self) -> i128 {
        self.units as i128 * NANO_FACTOR as i128 + self.nano as i128
    }

    /// Rebuild from a nano count, splitting into a normalized pair.
    #[must_use]
    pub fn from_nanos(total: i128) -> Self {
        Self {
            units: (total / NANO_FACTOR as i128) as i64,
            nano: (total % NANO_FACTOR as i128) as i32,
        }
    }

    /// Convert from a float, rounding to the nearest nano.
    #[must_use]
    pub fn from_f64(value: f64) -> Self {
        Self::from_nanos((value * NANO_FACTOR as f64).round() as i128)
    }

    /// Convert to a float.
    #[must_use]
    pub fn to_f64(self) -> f64 {
        self.units as f64 + self.nano as f64 / NANO_FACTOR as f64
    }

    #[must_use]
    pub fn add(self, other: Quotation) -> Self {
        Self::from_nanos(self.as_nanos() + other.as_nanos())
    }

    #[must_use]
    pub fn sub(self, other: Quotation) -> Self {
        Self::from_nanos(self.as_nanos() - other.as_nanos())
    }

    #[must_use]
    pub fn mul_int(self, factor: i64) -> Self {
        Self::from_nanos(self.as_nanos() * factor as i128)
    }

    #[must_use]
    pub fn div_int(self, divisor: i64) -> Self {
        Self::from_nanos(self.as_nanos() / divisor as i128)
    }

    #[must_use]
    pub fn mul_f64(self, factor: f64) -> Self {
        Self::from_f64(self.to_f64() * factor)
    }

    #[must_use]
    pub fn div_f64(self, divisor: f64) -> Self {
        Self::from_f64(self.to_f64() / divisor)
    }

    #[must_use]
    pub fn is_zero(self) -> bool {
        self.units == 0 && self.nano == 0
    }
}

impl PartialOrd for Quotation {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Quotation {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_nanos().cmp(&other.as_nanos())
    }
}

impl fmt::Display for Quotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total = self.as_nanos();
        let sign = if total < 0 { "-" } else { "" };
        let abs = total.unsigned_abs();
        let units = abs / NANO_FACTOR as u128;
        let nano = abs % NANO_FACTOR as u128;
        write!(f, "{sign}{units}.{nano:09}")
    }
}
