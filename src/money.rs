//! Money coercion.
//!
//! Sheet cells arrive as numbers, plain strings, or currency-formatted strings
//! (`"₹1,20,000"`, `"Rs. 4,500.50"`). Every monetary read in the crate goes
//! through [`to_money`] so the stripping rules live in one place.

use serde_json::Value;

const CURRENCY_PREFIXES: &[&str] = &["inr", "rs.", "rs", "₹", "$"];

/// Coerce a raw JSON value to an amount. Returns `None` for null, empty,
/// boolean, non-numeric or non-finite input.
pub fn to_money(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        Value::String(s) => parse_money_str(s),
        _ => None,
    }
}

/// Coerce a string to an amount using the same rules as [`to_money`].
pub fn parse_money_str(raw: &str) -> Option<f64> {
    let mut text = raw.trim().to_lowercase();
    loop {
        let before = text.len();
        for prefix in CURRENCY_PREFIXES {
            if let Some(rest) = text.strip_prefix(prefix) {
                text = rest.trim_start().to_string();
            }
        }
        if text.len() == before {
            break;
        }
    }
    let cleaned: String = text
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ',' && *c != '₹')
        .collect();
    let cleaned = cleaned.strip_suffix("/-").unwrap_or(&cleaned);
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Round to the currency's minor unit (paise).
pub fn round_money(value: f64) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    let rounded = (value * 100.0).round() / 100.0;
    // Normalise -0.0 so formatted keys and equality checks stay stable.
    if rounded == 0.0 {
        0.0
    } else {
        rounded
    }
}

/// Format an amount for use inside composite keys.
pub fn money_key(value: f64) -> String {
    format!("{:.2}", round_money(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_numbers_pass_through() {
        assert_eq!(to_money(&json!(120000)), Some(120000.0));
        assert_eq!(to_money(&json!(4500.5)), Some(4500.5));
    }

    #[test]
    fn test_currency_strings_are_stripped() {
        assert_eq!(to_money(&json!("₹1,20,000")), Some(120000.0));
        assert_eq!(to_money(&json!("Rs. 4,500.50")), Some(4500.5));
        assert_eq!(to_money(&json!(" INR 3000 ")), Some(3000.0));
        assert_eq!(to_money(&json!("$ 12")), Some(12.0));
        assert_eq!(to_money(&json!("25,000/-")), Some(25000.0));
    }

    #[test]
    fn test_absent_values() {
        assert_eq!(to_money(&json!(null)), None);
        assert_eq!(to_money(&json!("")), None);
        assert_eq!(to_money(&json!("   ")), None);
        assert_eq!(to_money(&json!("n/a")), None);
        assert_eq!(to_money(&json!(true)), None);
        assert_eq!(to_money(&json!("inf")), None);
        assert_eq!(to_money(&json!("NaN")), None);
    }

    #[test]
    fn test_round_money() {
        assert_eq!(round_money(0.1 + 0.2), 0.3);
        assert_eq!(round_money(-0.001), 0.0);
        assert_eq!(money_key(4000.0), "4000.00");
    }
}
