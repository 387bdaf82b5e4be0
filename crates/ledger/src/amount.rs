//! Fixed-point monetary/quantity amounts with two decimal places.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use ledgersync_core::DomainError;

/// An amount stored in hundredths (e.g. `12.50` is `1250`).
///
/// Ledger columns are `DECIMAL(15, 2)` in every source system, so two places
/// are kept exactly and anything finer is rounded half away from zero.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Amount(i64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub const fn from_minor_units(units: i64) -> Self {
        Self(units)
    }

    pub const fn minor_units(self) -> i64 {
        self.0
    }

    pub fn from_whole(units: i64) -> Result<Self, DomainError> {
        units
            .checked_mul(100)
            .map(Self)
            .ok_or_else(|| DomainError::validation(format!("amount out of range: {units}")))
    }

    /// Interpret a JSON value (number or numeric string).
    pub fn from_json(value: &serde_json::Value) -> Result<Self, DomainError> {
        match value {
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(whole) => Self::from_whole(whole),
                None => n.to_string().parse(),
            },
            serde_json::Value::String(s) => s.parse(),
            other => Err(DomainError::validation(format!(
                "expected an amount, got {other}"
            ))),
        }
    }
}

impl FromStr for Amount {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DomainError::validation(format!("invalid amount: {s:?}"));

        let raw = s.trim().replace(',', "");
        let (negative, digits) = match raw.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, raw.strip_prefix('+').unwrap_or(raw.as_str())),
        };
        let (whole, fraction) = digits.split_once('.').unwrap_or((digits, ""));
        if whole.is_empty() && fraction.is_empty() {
            return Err(invalid());
        }
        if !whole.chars().all(|c| c.is_ascii_digit()) || !fraction.chars().all(|c| c.is_ascii_digit())
        {
            return Err(invalid());
        }

        let whole: i64 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| invalid())?
        };
        let mut cents: i64 = 0;
        for (i, c) in fraction.chars().take(2).enumerate() {
            let digit = i64::from(c as u8 - b'0');
            cents += if i == 0 { digit * 10 } else { digit };
        }
        if fraction.chars().nth(2).is_some_and(|c| c >= '5') {
            cents += 1;
        }

        let units = whole
            .checked_mul(100)
            .and_then(|w| w.checked_add(cents))
            .ok_or_else(invalid)?;
        Ok(Self(if negative { -units } else { units }))
    }
}

impl core::fmt::Display for Amount {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_ledger_spellings() {
        assert_eq!("12.5".parse::<Amount>().unwrap().minor_units(), 1250);
        assert_eq!("1,200.05".parse::<Amount>().unwrap().minor_units(), 120_005);
        assert_eq!("-3".parse::<Amount>().unwrap().minor_units(), -300);
        assert_eq!(".75".parse::<Amount>().unwrap().minor_units(), 75);
    }

    #[test]
    fn rounds_beyond_two_places() {
        assert_eq!("0.125".parse::<Amount>().unwrap().minor_units(), 13);
        assert_eq!("0.124".parse::<Amount>().unwrap().minor_units(), 12);
    }

    #[test]
    fn rejects_garbage() {
        assert!("".parse::<Amount>().is_err());
        assert!("12.3.4".parse::<Amount>().is_err());
        assert!("abc".parse::<Amount>().is_err());
    }

    #[test]
    fn json_numbers_are_accepted() {
        let v = serde_json::json!(0.1);
        assert_eq!(Amount::from_json(&v).unwrap().minor_units(), 10);
        let v = serde_json::json!(7);
        assert_eq!(Amount::from_json(&v).unwrap().minor_units(), 700);
    }

    #[test]
    fn displays_with_two_places() {
        assert_eq!(Amount::from_minor_units(-5).to_string(), "-0.05");
        assert_eq!(Amount::from_minor_units(120_005).to_string(), "1200.05");
    }
}
