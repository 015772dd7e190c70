//! Resource quantities for CPU and memory
//!
//! Quantities are stored as an unsigned count of milli-units, so a CPU core
//! is 1000 and a byte of memory is 1000. Parsing follows the orchestration
//! API's quantity grammar (`500m`, `1.5`, `100Mi`, `2G`, `1e3`).

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use thiserror::Error;

/// Milli-units per whole unit
const MILLIS_PER_UNIT: u64 = 1000;

/// Maximum number of fractional digits accepted when parsing
const MAX_FRACTION_DIGITS: usize = 18;

const BINARY_SUFFIXES: &[(&str, u32)] = &[
    ("Ei", 60),
    ("Pi", 50),
    ("Ti", 40),
    ("Gi", 30),
    ("Mi", 20),
    ("Ki", 10),
];

const DECIMAL_SUFFIXES: &[(&str, u32)] = &[
    ("E", 18),
    ("P", 15),
    ("T", 12),
    ("G", 9),
    ("M", 6),
    ("k", 3),
];

/// Errors produced while parsing a quantity string
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuantityError {
    #[error("quantity is empty")]
    Empty,
    #[error("quantity {0:?} is negative")]
    Negative(String),
    #[error("quantity {0:?} is not a number")]
    Malformed(String),
    #[error("quantity {quantity:?} has unknown suffix {suffix:?}")]
    UnknownSuffix { quantity: String, suffix: String },
    #[error("quantity {0:?} has more than 18 fractional digits")]
    TooPrecise(String),
    #[error("quantity {0:?} is too large")]
    Overflow(String),
}

/// Preferred rendering of a quantity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum QuantityFormat {
    /// Powers of ten (`k`, `M`, `G`)
    #[default]
    DecimalSI,
    /// Powers of two (`Ki`, `Mi`, `Gi`)
    BinarySI,
}

/// A non-negative CPU or memory amount
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceQuantity {
    millis: u64,
    format: QuantityFormat,
}

impl ResourceQuantity {
    pub const ZERO: ResourceQuantity = ResourceQuantity {
        millis: 0,
        format: QuantityFormat::DecimalSI,
    };

    /// Quantity from milli-units (millicores for CPU)
    pub fn from_millis(millis: u64) -> Self {
        Self {
            millis,
            format: QuantityFormat::DecimalSI,
        }
    }

    /// Quantity from whole CPU cores
    pub fn from_cores(cores: u64) -> Self {
        Self::from_millis(cores.saturating_mul(MILLIS_PER_UNIT))
    }

    /// Quantity from bytes, rendered with binary suffixes
    pub fn from_bytes(bytes: u64) -> Self {
        Self {
            millis: bytes.saturating_mul(MILLIS_PER_UNIT),
            format: QuantityFormat::BinarySI,
        }
    }

    pub fn millis(&self) -> u64 {
        self.millis
    }

    /// Value in whole units, rounded up (bytes for memory)
    pub fn as_bytes(&self) -> u64 {
        self.millis.div_ceil(MILLIS_PER_UNIT)
    }

    pub fn as_cores_f64(&self) -> f64 {
        self.millis as f64 / MILLIS_PER_UNIT as f64
    }

    pub fn format(&self) -> QuantityFormat {
        self.format
    }

    pub fn is_zero(&self) -> bool {
        self.millis == 0
    }

    /// Return a new quantity increased by `delta`, keeping this quantity's format
    pub fn add(&self, delta: ResourceQuantity) -> ResourceQuantity {
        ResourceQuantity {
            millis: self.millis.saturating_add(delta.millis),
            format: self.format,
        }
    }

    /// Parse a quantity string such as `250m`, `1.5`, `512Mi` or `1e3`
    pub fn parse(input: &str) -> Result<Self, QuantityError> {
        if input.is_empty() {
            return Err(QuantityError::Empty);
        }

        let unsigned = match input.as_bytes()[0] {
            b'-' => return Err(QuantityError::Negative(input.to_string())),
            b'+' => &input[1..],
            _ => input,
        };

        let number_len = unsigned
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(unsigned.len());
        let (number, suffix) = unsigned.split_at(number_len);

        let (int_part, frac_part) = match number.split_once('.') {
            Some((int_part, frac_part)) => (int_part, frac_part),
            None => (number, ""),
        };
        if (int_part.is_empty() && frac_part.is_empty()) || frac_part.contains('.') {
            return Err(QuantityError::Malformed(input.to_string()));
        }
        if frac_part.len() > MAX_FRACTION_DIGITS {
            return Err(QuantityError::TooPrecise(input.to_string()));
        }

        let overflow = || QuantityError::Overflow(input.to_string());

        // All digits as one integer, scaled by 10^-frac_digits
        let mut mantissa: u128 = 0;
        for digit in int_part.bytes().chain(frac_part.bytes()) {
            mantissa = mantissa
                .checked_mul(10)
                .and_then(|m| m.checked_add(u128::from(digit - b'0')))
                .ok_or_else(overflow)?;
        }
        let frac_digits = frac_part.len() as i32;

        let (millis, format) = if let Some(exponent) = parse_exponent(suffix) {
            let millis = scale_decimal(mantissa, exponent + 3 - frac_digits).ok_or_else(overflow)?;
            (millis, QuantityFormat::DecimalSI)
        } else if let Some(&(_, shift)) = BINARY_SUFFIXES.iter().find(|(s, _)| *s == suffix) {
            let scaled = mantissa
                .checked_mul(1u128 << shift)
                .ok_or_else(overflow)?;
            let millis = scale_decimal(scaled, 3 - frac_digits).ok_or_else(overflow)?;
            (millis, QuantityFormat::BinarySI)
        } else {
            let power = match suffix {
                "m" => -3,
                "" => 0,
                _ => match DECIMAL_SUFFIXES.iter().find(|(s, _)| *s == suffix) {
                    Some(&(_, power)) => power as i32,
                    None => {
                        return Err(QuantityError::UnknownSuffix {
                            quantity: input.to_string(),
                            suffix: suffix.to_string(),
                        })
                    }
                },
            };
            let millis = scale_decimal(mantissa, power + 3 - frac_digits).ok_or_else(overflow)?;
            (millis, QuantityFormat::DecimalSI)
        };

        Ok(Self {
            millis: u64::try_from(millis).map_err(|_| overflow())?,
            format,
        })
    }
}

/// `e3`, `E-2` style decimal exponents; a bare `E` is the exa suffix
fn parse_exponent(suffix: &str) -> Option<i32> {
    let rest = suffix.strip_prefix(['e', 'E'])?;
    if rest.is_empty() {
        return None;
    }
    rest.parse::<i32>().ok().filter(|e| e.abs() <= 38)
}

/// Multiply by 10^exp, rounding up when exp is negative
fn scale_decimal(value: u128, exp: i32) -> Option<u128> {
    if exp >= 0 {
        value.checked_mul(10u128.checked_pow(exp as u32)?)
    } else {
        let divisor = 10u128.checked_pow(exp.unsigned_abs())?;
        Some(value.div_ceil(divisor))
    }
}

impl PartialEq for ResourceQuantity {
    fn eq(&self, other: &Self) -> bool {
        self.millis == other.millis
    }
}

impl Eq for ResourceQuantity {}

impl Hash for ResourceQuantity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.millis.hash(state);
    }
}

impl PartialOrd for ResourceQuantity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ResourceQuantity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.millis.cmp(&other.millis)
    }
}

impl fmt::Display for ResourceQuantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.millis % MILLIS_PER_UNIT != 0 {
            return write!(f, "{}m", self.millis);
        }
        let units = self.millis / MILLIS_PER_UNIT;
        if units == 0 {
            return write!(f, "0");
        }

        if self.format == QuantityFormat::BinarySI {
            for (suffix, shift) in BINARY_SUFFIXES {
                if units % (1u64 << shift) == 0 {
                    return write!(f, "{}{}", units >> shift, suffix);
                }
            }
        }

        for (suffix, power) in DECIMAL_SUFFIXES {
            let divisor = 10u64.pow(*power);
            if units % divisor == 0 {
                return write!(f, "{}{}", units / divisor, suffix);
            }
        }

        write!(f, "{}", units)
    }
}

impl FromStr for ResourceQuantity {
    type Err = QuantityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for ResourceQuantity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ResourceQuantity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(QuantityVisitor)
    }
}

struct QuantityVisitor;

impl<'de> Visitor<'de> for QuantityVisitor {
    type Value = ResourceQuantity;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a resource quantity string or a non-negative integer")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        ResourceQuantity::parse(v).map_err(E::custom)
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
        ResourceQuantity::parse(&v.to_string()).map_err(E::custom)
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
        ResourceQuantity::parse(&v.to_string()).map_err(E::custom)
    }
}
