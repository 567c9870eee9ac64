//! Parsing and rounding helpers for user-typed quantities.
use once_cell::sync::Lazy;
use regex::Regex;

static MIXED_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([+-]?\d+)\s+(\d+)\s*/\s*(\d+)$").expect("valid mixed number regex"));
static FRACTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([+-]?\d+)\s*/\s*(\d+)$").expect("valid fraction regex"));

/// Parse a user-typed numeric string.
///
/// Accepts integers and decimals (`"1"`, `"0.75"`), simple fractions (`"3/4"`)
/// and mixed numbers (`"1 1/2"`). Returns `None` for blank, malformed or
/// non-finite input, and for a zero denominator.
pub fn parse_numberish(raw: &str) -> Option<f64> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    if let Some(caps) = MIXED_NUMBER.captures(s) {
        let whole: f64 = caps[1].parse().ok()?;
        let num: f64 = caps[2].parse().ok()?;
        let den: f64 = caps[3].parse().ok()?;
        if den == 0.0 {
            return None;
        }
        let frac = num / den;
        let n = if caps[1].starts_with('-') {
            whole - frac
        } else {
            whole + frac
        };
        return Some(n).filter(|n| n.is_finite());
    }

    if let Some(caps) = FRACTION.captures(s) {
        let num: f64 = caps[1].parse().ok()?;
        let den: f64 = caps[2].parse().ok()?;
        if den == 0.0 {
            return None;
        }
        return Some(num / den).filter(|n| n.is_finite());
    }

    s.parse::<f64>().ok().filter(|n| n.is_finite())
}

/// `parse_numberish` restricted to strictly positive values.
pub fn parse_positive_number(raw: &str) -> Option<f64> {
    parse_numberish(raw).filter(|n| *n > 0.0)
}

/// Render a quantity for the text column: `150.0` -> `"150"`, `1.5` -> `"1.5"`.
pub fn format_quantity(qty: f64) -> String {
    qty.to_string()
}

pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_fraction_forms() {
        assert_eq!(parse_numberish("1"), Some(1.0));
        assert_eq!(parse_numberish(" 0.75 "), Some(0.75));
        assert_eq!(parse_numberish("3/4"), Some(0.75));
        assert_eq!(parse_numberish("1 1/2"), Some(1.5));
        assert_eq!(parse_numberish("-1 1/2"), Some(-1.5));
        assert_eq!(parse_numberish("3 / 4"), Some(0.75));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_numberish(""), None);
        assert_eq!(parse_numberish("abc"), None);
        assert_eq!(parse_numberish("1/0"), None);
        assert_eq!(parse_numberish("inf"), None);
        assert_eq!(parse_positive_number("0"), None);
        assert_eq!(parse_positive_number("-2"), None);
    }

    #[test]
    fn formats_and_rounds() {
        assert_eq!(format_quantity(150.0), "150");
        assert_eq!(format_quantity(1.5), "1.5");
        assert_eq!(round_to(1.65 * 150.0, 2), 247.5);
        assert_eq!(round_to(165.0 / 100.0, 4), 1.65);
    }
}
