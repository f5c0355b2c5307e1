//! Capacity Reconciler
//!
//! Parses Kubernetes capacity strings and reconciles the size range a test
//! suite wants with the size range a driver supports.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Smallest claim size considered when a range has no minimum
pub const MIN_VALID_SIZE: &str = "1Ki";

/// Largest claim size considered when a range has no maximum
pub const MAX_VALID_SIZE: &str = "10Ei";

const BINARY_SUFFIXES: [(&str, u32); 6] = [
    ("Ei", 60),
    ("Pi", 50),
    ("Ti", 40),
    ("Gi", 30),
    ("Mi", 20),
    ("Ki", 10),
];

// =============================================================================
// Quantity Parsing
// =============================================================================

/// Parse a capacity string ("5Gi", "500M", "1.5Gi", "1024") into bytes.
///
/// Fractional results round up, the same way the API server reports a
/// quantity's integer value.
pub fn parse_quantity(s: &str) -> Result<u128> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::CapacityParse("empty capacity string".into()));
    }

    // Find where the number ends and unit begins
    let mut num_end = 0;
    for (i, c) in s.char_indices() {
        if !c.is_ascii_digit() && c != '.' {
            num_end = i;
            break;
        }
        num_end = i + 1;
    }

    let num_str = &s[..num_end];
    let unit_str = &s[num_end..];

    let (int_part, frac_part) = match num_str.split_once('.') {
        Some((i, f)) => (i, f),
        None => (num_str, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return Err(Error::CapacityParse(format!("invalid number in {:?}", s)));
    }

    // Scale the mantissa to an integer numerator over 10^frac_digits
    let digits = format!("{}{}", int_part, frac_part);
    let numerator: u128 = digits
        .parse()
        .map_err(|_| Error::CapacityParse(format!("invalid number: {}", num_str)))?;
    let denominator = 10u128
        .checked_pow(frac_part.len() as u32)
        .ok_or_else(|| Error::CapacityParse(format!("too many decimals: {}", num_str)))?;

    let (mul, div): (u128, u128) = match unit_str {
        "" => (1, 1),
        "m" => (1, 1000),
        "k" => (1_000, 1),
        "M" => (1_000_000, 1),
        "G" => (1_000_000_000, 1),
        "T" => (1_000_000_000_000, 1),
        "P" => (1_000_000_000_000_000, 1),
        "E" => (1_000_000_000_000_000_000, 1),
        unit => match BINARY_SUFFIXES.iter().find(|(suffix, _)| *suffix == unit) {
            Some((_, shift)) => (1u128 << shift, 1),
            None => {
                return Err(Error::CapacityParse(format!("unknown unit: {}", unit)));
            }
        },
    };

    let scaled = numerator
        .checked_mul(mul)
        .ok_or_else(|| Error::CapacityParse(format!("capacity overflows: {}", s)))?;
    let total_div = denominator * div;
    Ok(scaled.div_ceil(total_div))
}

/// Render a byte count in canonical binary-SI form ("5Gi", "1536")
pub fn format_binary(bytes: u128) -> String {
    if bytes == 0 {
        return "0".to_string();
    }
    for (suffix, shift) in BINARY_SUFFIXES {
        let unit = 1u128 << shift;
        if bytes % unit == 0 {
            return format!("{}{}", bytes / unit, suffix);
        }
    }
    bytes.to_string()
}

/// Compare two capacity strings by numeric value
pub fn capacity_equal(a: &str, b: &str) -> Result<bool> {
    Ok(parse_quantity(a)? == parse_quantity(b)?)
}

// =============================================================================
// Size Range
// =============================================================================

/// Closed interval of capacity strings; unset bounds are open-ended
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeRange {
    #[serde(default)]
    pub min: Option<String>,
    #[serde(default)]
    pub max: Option<String>,
}

impl SizeRange {
    pub fn new(min: Option<&str>, max: Option<&str>) -> Self {
        Self {
            min: min.map(str::to_string),
            max: max.map(str::to_string),
        }
    }

    /// Lower and upper bound in bytes, with defaults for unset bounds
    pub fn bounds(&self) -> Result<(u128, u128)> {
        let min = match self.min.as_deref().filter(|m| !m.is_empty()) {
            Some(m) => parse_quantity(m)?,
            None => parse_quantity(MIN_VALID_SIZE)?,
        };
        let max = match self.max.as_deref().filter(|m| !m.is_empty()) {
            Some(m) => parse_quantity(m)?,
            None => parse_quantity(MAX_VALID_SIZE)?,
        };
        Ok((min, max))
    }

    /// Smallest size valid in both ranges, rendered in binary-SI form.
    ///
    /// Fails with a configuration error when the ranges do not overlap.
    pub fn intersection(&self, other: &SizeRange) -> Result<String> {
        let (first_min, first_max) = self.bounds()?;
        let (second_min, second_max) = other.bounds()?;

        let start = first_min.max(second_min);
        let end = first_max.min(second_max);

        if start <= end {
            Ok(format_binary(start))
        } else {
            Err(Error::Configuration(format!(
                "intersection of size ranges {}, {} is null",
                self, other
            )))
        }
    }
}

impl std::fmt::Display for SizeRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}, {}]",
            self.min.as_deref().unwrap_or(MIN_VALID_SIZE),
            self.max.as_deref().unwrap_or(MAX_VALID_SIZE)
        )
    }
}
