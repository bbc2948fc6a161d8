//! Literal lowering.
//!
//! Tokens reach the compiler with their raw source text; this module turns
//! them into [`Value`]s. Durations use fixed unit sizes: a year is exactly
//! 365 days, so conversion never depends on the calendar or time zone.

use chrono::Duration;
use reqwest::StatusCode;

use super::ast::{Literal, LiteralKind};
use super::value::Value;
use super::{CompileError, Result};

const MILLIS_PER_SECOND: i64 = 1_000;
const MILLIS_PER_MINUTE: i64 = 60 * MILLIS_PER_SECOND;
const MILLIS_PER_HOUR: i64 = 60 * MILLIS_PER_MINUTE;
const MILLIS_PER_DAY: i64 = 24 * MILLIS_PER_HOUR;
const MILLIS_PER_WEEK: i64 = 7 * MILLIS_PER_DAY;
const MILLIS_PER_YEAR: i64 = 365 * MILLIS_PER_DAY;

/// Units, largest first, as used by [`format_duration`].
const UNITS: &[(&str, i64)] = &[
    ("y", MILLIS_PER_YEAR),
    ("w", MILLIS_PER_WEEK),
    ("d", MILLIS_PER_DAY),
    ("h", MILLIS_PER_HOUR),
    ("m", MILLIS_PER_MINUTE),
    ("s", MILLIS_PER_SECOND),
    ("ms", 1),
];

fn unit_millis(unit: &str) -> Option<i64> {
    UNITS
        .iter()
        .find(|(name, _)| *name == unit)
        .map(|(_, millis)| *millis)
}

/// Strip the surrounding quotes of a string token.
pub fn string_text(raw: &str) -> String {
    raw.trim_matches('"').to_string()
}

/// Strip the `{"` and `"}` delimiters of a synthetic string token.
pub fn synthetic_text(raw: &str) -> String {
    raw.trim_start_matches('{')
        .trim_end_matches('}')
        .trim_matches('"')
        .to_string()
}

/// Text of a string-like literal.
pub fn text_of(literal: &Literal) -> String {
    match literal.kind {
        LiteralKind::Synthetic => synthetic_text(&literal.text),
        LiteralKind::String => string_text(&literal.text),
        _ => literal.text.clone(),
    }
}

/// Signed 32-bit integer literal.
pub fn parse_integer(text: &str) -> Result<i32> {
    text.trim()
        .parse::<i32>()
        .map_err(|_| CompileError::InvalidLiteral {
            kind: "integer",
            text: text.to_string(),
        })
}

/// Floating point literal.
pub fn parse_float(text: &str) -> Result<f64> {
    text.trim()
        .parse::<f64>()
        .map_err(|_| CompileError::InvalidLiteral {
            kind: "float",
            text: text.to_string(),
        })
}

/// Case-insensitive `true`/`false`.
pub fn parse_bool(text: &str) -> Result<bool> {
    let text = text.trim();
    if text.eq_ignore_ascii_case("true") {
        Ok(true)
    } else if text.eq_ignore_ascii_case("false") {
        Ok(false)
    } else {
        Err(CompileError::InvalidLiteral {
            kind: "boolean",
            text: text.to_string(),
        })
    }
}

/// `<number><unit>` with unit one of `ms s m h d w y`.
pub fn parse_duration(text: &str) -> Result<Duration> {
    let invalid = || CompileError::InvalidLiteral {
        kind: "duration",
        text: text.to_string(),
    };
    let trimmed = text.trim();
    let split = trimmed
        .find(|c: char| c.is_ascii_alphabetic())
        .ok_or_else(invalid)?;
    let (number, unit) = trimmed.split_at(split);
    let per_unit = unit_millis(unit).ok_or_else(invalid)?;
    if number.is_empty() {
        return Err(invalid());
    }

    let millis = if number.contains('.') {
        let value: f64 = number.parse().map_err(|_| invalid())?;
        let millis = (value * per_unit as f64).round();
        if !millis.is_finite() || millis.abs() > i64::MAX as f64 {
            return Err(invalid());
        }
        millis as i64
    } else {
        let value: i64 = number.parse().map_err(|_| invalid())?;
        value.checked_mul(per_unit).ok_or_else(invalid)?
    };
    Duration::try_milliseconds(millis).ok_or_else(invalid)
}

/// Shortest literal for `duration`, using the largest unit that divides it.
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.num_milliseconds();
    if millis == 0 {
        return "0s".to_string();
    }
    let sign = if millis < 0 { "-" } else { "" };
    let magnitude = millis.unsigned_abs();
    for (name, per_unit) in UNITS {
        let per_unit = *per_unit as u64;
        if magnitude % per_unit == 0 {
            return format!("{sign}{}{name}", magnitude / per_unit);
        }
    }
    format!("{sign}{magnitude}ms")
}

/// Convert a chrono duration into a std duration, clamping negatives to zero.
pub fn to_std(duration: Duration) -> std::time::Duration {
    duration.to_std().unwrap_or_default()
}

/// Lower a literal token into a runtime value.
pub fn lower_literal(literal: &Literal) -> Result<Value> {
    Ok(match literal.kind {
        LiteralKind::String => Value::String(string_text(&literal.text)),
        LiteralKind::Synthetic => Value::String(synthetic_text(&literal.text)),
        LiteralKind::Integer => Value::Integer(i64::from(parse_integer(&literal.text)?)),
        LiteralKind::Float => Value::Float(parse_float(&literal.text)?),
        LiteralKind::Bool => Value::Bool(parse_bool(&literal.text)?),
        LiteralKind::Duration => Value::Duration(parse_duration(&literal.text)?),
    })
}

/// Status used by `error` statements: a number or a status name such as
/// `NotFound`, matched against the standard reason phrases.
pub fn parse_status(text: &str) -> Result<i64> {
    if let Ok(code) = text.trim().parse::<i64>() {
        if (100..=999).contains(&code) {
            return Ok(code);
        }
    }
    let wanted = squash(text);
    (100..600u16)
        .find(|code| {
            StatusCode::from_u16(*code)
                .ok()
                .and_then(|status| status.canonical_reason())
                .is_some_and(|reason| squash(reason) == wanted)
        })
        .map(i64::from)
        .ok_or_else(|| CompileError::InvalidLiteral {
            kind: "status code",
            text: text.to_string(),
        })
}

fn squash(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Standard reason phrase for a status code.
pub fn reason_phrase(status: i64) -> &'static str {
    u16::try_from(status)
        .ok()
        .and_then(|code| StatusCode::from_u16(code).ok())
        .and_then(|status| status.canonical_reason())
        .unwrap_or("Unknown")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn strings_lose_their_delimiters() {
        assert_eq!(string_text("\"/health\""), "/health");
        assert_eq!(synthetic_text("{\"<h1>hi</h1>\"}"), "<h1>hi</h1>");
    }

    #[test]
    fn integers_are_32_bit() {
        assert_eq!(parse_integer("2147483647").unwrap(), i32::MAX);
        assert!(parse_integer("2147483648").is_err());
    }

    #[test]
    fn booleans_ignore_case() {
        assert!(parse_bool("TRUE").unwrap());
        assert!(!parse_bool("False").unwrap());
        assert!(parse_bool("yes").is_err());
    }

    #[test]
    fn duration_units() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::milliseconds(250));
        assert_eq!(parse_duration("5s").unwrap(), Duration::seconds(5));
        assert_eq!(parse_duration("1m").unwrap(), Duration::seconds(60));
        assert_eq!(parse_duration("2h").unwrap(), Duration::hours(2));
        assert_eq!(parse_duration("3d").unwrap(), Duration::days(3));
        assert_eq!(parse_duration("1w").unwrap(), Duration::days(7));
        assert_eq!(parse_duration("1y").unwrap(), Duration::days(365));
        assert_eq!(parse_duration("1.5m").unwrap(), Duration::seconds(90));
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("3fortnights").is_err());
    }

    #[test]
    fn formatting_picks_largest_exact_unit() {
        assert_eq!(format_duration(Duration::seconds(60)), "1m");
        assert_eq!(format_duration(Duration::seconds(90)), "90s");
        assert_eq!(format_duration(Duration::milliseconds(1500)), "1500ms");
        assert_eq!(format_duration(Duration::days(14)), "2w");
        assert_eq!(format_duration(Duration::zero()), "0s");
        assert_eq!(format_duration(Duration::seconds(-5)), "-5s");
    }

    #[test]
    fn status_names_and_numbers() {
        assert_eq!(parse_status("404").unwrap(), 404);
        assert_eq!(parse_status("ServiceUnavailable").unwrap(), 503);
        assert_eq!(parse_status("not_found").unwrap(), 404);
        assert!(parse_status("Teapot").is_err());
        assert_eq!(parse_status("InternalServerError").unwrap(), 500);
        assert_eq!(parse_status("ok").unwrap(), 200);
        assert_eq!(reason_phrase(503), "Service Unavailable");
        assert_eq!(reason_phrase(418), "I'm a teapot");
        assert_eq!(reason_phrase(799), "Unknown");
    }

    proptest! {
        #[test]
        fn duration_round_trips(n in 0i64..1_000_000, unit in prop::sample::select(vec!["ms", "s", "m", "d", "w"])) {
            let parsed = parse_duration(&format!("{n}{unit}")).unwrap();
            let reparsed = parse_duration(&format_duration(parsed)).unwrap();
            prop_assert_eq!(parsed, reparsed);
        }
    }
}
