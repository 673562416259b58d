use num_bigint::BigUint;
use num_traits::Zero;
use serde::{Deserialize, Deserializer, Serializer};
use std::fmt;
use std::str::FromStr;

/// Non-negative arbitrary precision token balance.
pub type Amount = BigUint;

pub fn parse_amount(raw: &str) -> Option<Amount> {
    let raw = raw.trim();
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    BigUint::parse_bytes(raw.as_bytes(), 10)
}

/// `#[serde(with = "amount_str")]` keeps balances as decimal strings in every
/// file format, so values above `u64::MAX` survive json and yaml.
pub mod amount_str {
    use super::*;

    pub fn serialize<S: Serializer>(amount: &Amount, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&amount.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Amount, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_amount(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid amount: {raw:?}")))
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid exchange rate {raw:?}: {reason}")]
pub struct RateParseError {
    pub raw: String,
    pub reason: &'static str,
}

/// Units of the underlying denomination per unit of a derivative, kept as
/// atomics over `10^DECIMAL_PLACES`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ExchangeRate {
    atomics: BigUint,
}

impl ExchangeRate {
    pub const DECIMAL_PLACES: u32 = 18;

    fn fractional_one() -> BigUint {
        BigUint::from(10u32).pow(Self::DECIMAL_PLACES)
    }

    pub fn from_atomics(atomics: BigUint) -> Self {
        Self { atomics }
    }

    pub fn from_integer(value: u64) -> Self {
        Self {
            atomics: BigUint::from(value) * Self::fractional_one(),
        }
    }

    pub fn atomics(&self) -> &BigUint {
        &self.atomics
    }

    pub fn is_zero(&self) -> bool {
        self.atomics.is_zero()
    }

    /// `floor(rate * amount)`. Always rounds down, never over-credits.
    pub fn apply(&self, amount: &Amount) -> Amount {
        (amount * &self.atomics) / Self::fractional_one()
    }

    /// What `apply` lost to truncation, in atomics of the target denomination.
    pub fn truncation_remainder(&self, amount: &Amount) -> BigUint {
        (amount * &self.atomics) % Self::fractional_one()
    }

    /// True when `apply` never truncates, i.e. the rate is a whole number.
    pub fn is_integral(&self) -> bool {
        (&self.atomics % Self::fractional_one()).is_zero()
    }
}

impl FromStr for ExchangeRate {
    type Err = RateParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let err = |reason| RateParseError {
            raw: raw.to_string(),
            reason,
        };
        let trimmed = raw.trim();
        if trimmed.starts_with('-') {
            return Err(err("negative rate"));
        }
        let mut parts = trimmed.splitn(2, '.');
        let whole = parts.next().unwrap_or_default();
        let fraction = parts.next().unwrap_or_default();
        if whole.is_empty() && fraction.is_empty() {
            return Err(err("empty rate"));
        }
        if fraction.len() > Self::DECIMAL_PLACES as usize {
            return Err(err("too many fractional digits"));
        }
        let digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
        if !digits(whole) || !digits(fraction) {
            return Err(err("non-digit character"));
        }

        let whole = if whole.is_empty() {
            BigUint::zero()
        } else {
            parse_amount(whole).ok_or_else(|| err("bad integer part"))?
        };
        let padded = format!(
            "{fraction:0<width$}",
            width = Self::DECIMAL_PLACES as usize
        );
        let fraction = parse_amount(&padded).ok_or_else(|| err("bad fractional part"))?;

        Ok(Self {
            atomics: whole * Self::fractional_one() + fraction,
        })
    }
}

impl TryFrom<String> for ExchangeRate {
    type Error = RateParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ExchangeRate> for String {
    fn from(rate: ExchangeRate) -> Self {
        rate.to_string()
    }
}

impl fmt::Display for ExchangeRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let one = Self::fractional_one();
        let whole = &self.atomics / &one;
        let fraction = &self.atomics % &one;
        if fraction.is_zero() {
            return write!(f, "{whole}");
        }
        let fraction = format!(
            "{fraction:0>width$}",
            width = Self::DECIMAL_PLACES as usize
        );
        write!(f, "{whole}.{}", fraction.trim_end_matches('0'))
    }
}

#[cfg(test)]
mod tests {
    use crate::amount::{parse_amount, ExchangeRate};
    use num_bigint::BigUint;

    #[test]
    fn parse_rates() {
        let rate: ExchangeRate = "1.5".parse().unwrap();
        assert_eq!(rate.to_string(), "1.5");
        let rate: ExchangeRate = "0.000000000000000001".parse().unwrap();
        assert_eq!(rate.atomics(), &BigUint::from(1u32));
        let rate: ExchangeRate = "3".parse().unwrap();
        assert!(rate.is_integral());
        assert_eq!(rate, ExchangeRate::from_integer(3));
        assert!(".5".parse::<ExchangeRate>().is_ok());
    }

    #[test]
    fn reject_bad_rates() {
        for raw in ["", "-1", "1.2.3", "abc", "1.0000000000000000001", " . "] {
            assert!(raw.parse::<ExchangeRate>().is_err(), "{}", raw);
        }
        assert!("0".parse::<ExchangeRate>().unwrap().is_zero());
    }

    #[test]
    fn apply_rounds_down() {
        let rate: ExchangeRate = "1.5".parse().unwrap();
        assert_eq!(rate.apply(&BigUint::from(100u32)), BigUint::from(150u32));
        assert_eq!(rate.apply(&BigUint::from(51u32)), BigUint::from(76u32));

        let rate: ExchangeRate = "0.333333333333333333".parse().unwrap();
        assert_eq!(rate.apply(&BigUint::from(3u32)), BigUint::from(0u32));
        assert!(rate.truncation_remainder(&BigUint::from(3u32)) > BigUint::from(0u32));
    }

    #[test]
    fn amounts_beyond_u128() {
        let huge = parse_amount("340282366920938463463374607431768211457").unwrap();
        let rate = ExchangeRate::from_integer(2);
        assert_eq!(
            rate.apply(&huge).to_string(),
            "680564733841876926926749214863536422914"
        );
        assert!(parse_amount("-5").is_none());
        assert!(parse_amount("").is_none());
    }

    #[test]
    fn serde_as_string() {
        let rate: ExchangeRate = serde_json::from_str("\"1.25\"").unwrap();
        assert_eq!(serde_json::to_string(&rate).unwrap(), "\"1.25\"");
        assert!(serde_json::from_str::<ExchangeRate>("\"-1\"").is_err());
    }
}
