//! Normalizes numeric strings returned by the upstream exchange API into
//! exact, fixed-precision decimals.
//!
//! Upstream sends prices and volumes as JSON strings, occasionally in
//! scientific notation (`"5E-8"`) including the zero sentinel `"0E-8"`.
//! Everything downstream (store, broker payloads, HTTP responses) deals in
//! `rust_decimal::Decimal` and is expected to serialize it back out as a
//! plain decimal string, never exponential form.

use rust_decimal::Decimal;
use std::str::FromStr;

use crate::error::IngestError;

/// Minimum number of fractional digits a normalized decimal carries.
const MIN_SCALE: u32 = 8;

/// Parses `raw` into an exact decimal, rescaling it up (never down) so it
/// carries at least [`MIN_SCALE`] fractional digits.
///
/// Re-normalizing an already-normalized value is a no-op: its scale is
/// already `>= MIN_SCALE`, so `rescale` leaves it untouched.
pub fn normalize(raw: &str) -> Result<Decimal, IngestError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(IngestError::InvalidNumber(raw.to_string()));
    }

    let mut value = parse_any_notation(trimmed)
        .ok_or_else(|| IngestError::InvalidNumber(raw.to_string()))?;

    let target_scale = value.scale().max(MIN_SCALE);
    value.rescale(target_scale);
    Ok(value)
}

/// Same as [`normalize`], but on failure logs a warning and substitutes
/// `Decimal::ZERO`, matching the collector's "never surface InvalidNumber"
/// contract.
pub fn normalize_or_zero(raw: &str) -> Decimal {
    match normalize(raw) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(raw, error = %err, "substituting zero for unparseable numeric value");
            Decimal::ZERO
        }
    }
}

fn parse_any_notation(value: &str) -> Option<Decimal> {
    if value.contains(['e', 'E']) {
        Decimal::from_scientific(value).ok()
    } else {
        Decimal::from_str(value).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_decimal() {
        let value = normalize("123.456").unwrap();
        assert_eq!(value.to_string(), "123.45600000");
    }

    #[test]
    fn parses_scientific_notation() {
        let value = normalize("5E-8").unwrap();
        assert_eq!(value.to_string(), "0.00000005");
    }

    #[test]
    fn parses_zero_sentinel() {
        let value = normalize("0E-8").unwrap();
        assert!(value.is_zero());
        assert_eq!(value.to_string(), "0.00000000");
    }

    #[test]
    fn trims_whitespace() {
        let value = normalize("  1.5  ").unwrap();
        assert_eq!(value.to_string(), "1.50000000");
    }

    #[test]
    fn preserves_precision_beyond_minimum_scale() {
        let value = normalize("1.123456789012").unwrap();
        assert_eq!(value.to_string(), "1.123456789012");
    }

    #[test]
    fn is_idempotent() {
        let once = normalize("5E-8").unwrap();
        let twice = normalize(&once.to_string()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn rejects_garbage() {
        assert!(normalize("not-a-number").is_err());
        assert!(normalize("").is_err());
    }

    #[test]
    fn never_serializes_as_scientific_notation() {
        let value = normalize("1e2").unwrap();
        assert!(!value.to_string().contains(['e', 'E']));
        assert_eq!(value.to_string(), "100.00000000");
    }

    #[test]
    fn normalize_or_zero_substitutes_on_failure() {
        assert_eq!(normalize_or_zero("garbage"), Decimal::ZERO);
        assert_eq!(normalize_or_zero("2.5").to_string(), "2.50000000");
    }
}
