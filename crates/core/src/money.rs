//! Fixed-point money. Amounts are integer micros (1 unit = 1_000_000 micros) so
//! nothing between the provider's quote and the payment instruction goes through
//! floating point.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

const MICROS_PER_UNIT: i64 = 1_000_000;
const MICROS_PER_CENT: i64 = 10_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Money(i64);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MoneyParseError {
    #[error("amount is empty")]
    Empty,
    #[error("amount could not be parsed: '{0}'")]
    Invalid(String),
    #[error("amount has more than 6 decimal places: '{0}'")]
    TooPrecise(String),
}

impl Money {
    pub const ZERO: Money = Money(0);

    pub const fn from_micros(micros: i64) -> Self { Money(micros) }
    pub const fn from_cents(cents: i64) -> Self { Money(cents * MICROS_PER_CENT) }
    pub const fn micros(&self) -> i64 { self.0 }

    pub fn checked_add(self, other: Money) -> Option<Money> { self.0.checked_add(other.0).map(Money) }

    /// Nearest whole cent, half away from zero.
    pub fn cents(&self) -> i64 {
        // Widened so amounts near the i64 bounds round without overflow.
        let (v, unit) = (self.0 as i128, MICROS_PER_CENT as i128);
        let rounded = if v >= 0 { (v + unit / 2) / unit } else { (v - unit / 2) / unit };
        rounded as i64
    }

    pub fn as_f64(&self) -> f64 { self.cents() as f64 / 100.0 }

    pub fn from_f64(v: f64) -> Option<Money> {
        if !v.is_finite() { return None; }
        let micros = (v * MICROS_PER_UNIT as f64).round();
        if micros.abs() >= i64::MAX as f64 { return None; }
        Some(Money(micros as i64))
    }
}

impl FromStr for Money {
    type Err = MoneyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() { return Err(MoneyParseError::Empty); }
        let invalid = || MoneyParseError::Invalid(s.to_string());
        let (negative, digits) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s.strip_prefix('+').unwrap_or(s)),
        };
        let (int_part, frac_part) = digits.split_once('.').unwrap_or((digits, ""));
        if int_part.is_empty() && frac_part.is_empty() { return Err(invalid()); }
        let all_digits = |p: &str| p.chars().all(|c| c.is_ascii_digit());
        if !all_digits(int_part) || !all_digits(frac_part) { return Err(invalid()); }
        if frac_part.len() > 6 { return Err(MoneyParseError::TooPrecise(s.to_string())); }

        let int_val: i64 = if int_part.is_empty() { 0 } else { int_part.parse().map_err(|_| invalid())? };
        let frac_val: i64 = format!("{:0<6}", frac_part).parse().map_err(|_| invalid())?;
        let micros = int_val
            .checked_mul(MICROS_PER_UNIT)
            .and_then(|v| v.checked_add(frac_val))
            .ok_or_else(invalid)?;
        Ok(Money(if negative { -micros } else { micros }))
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cents = self.cents();
        let sign = if cents < 0 { "-" } else { "" };
        let abs = cents.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, abs / 100, abs % 100)
    }
}

// Provider payloads carry amounts as JSON numbers.
impl Serialize for Money {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_f64())
    }
}

impl<'de> Deserialize<'de> for Money {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw { Num(f64), Text(String) }
        match Raw::deserialize(deserializer)? {
            Raw::Num(v) => Money::from_f64(v).ok_or_else(|| serde::de::Error::custom("amount out of range")),
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}
