//! Normalisation: deterministic parsing of the model's JSON reply.
//!
//! Even with a strict prompt, models wrap JSON in fences, print amounts as
//! `"$1,234.50"`, write dates as `03/15/2024`, or misread a `0` as an `O`.
//! Fixing those quirks here keeps the prompt short and makes each rule
//! independently testable.
//!
//! ## Steps
//!
//! 1. Strip outer code fences; fall back to the outermost `{…}` span
//! 2. Parse; the top level must be a JSON object, else the reply is malformed
//! 3. Per schema field: missing key or `null` → [`FieldValue::Absent`];
//!    otherwise coerce to the field's kind
//! 4. Complete bare `MM/DD` dates with the year of `invoice_date` (or of
//!    the first full date in the reply)
//! 5. Apply per-field fallbacks (`bill_date ← invoice_date`)
//! 6. Collect validation notes (unparseable values, missing required fields)
//!
//! Only step 2 can fail the document. Everything else degrades to
//! `Absent` plus a validation note that lands in the exports.

use crate::schema::{ExtractedFields, FieldKind, FieldSchema, FieldSpec, FieldValue};
use chrono::{Datelike, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use std::str::FromStr;

/// Fields plus the validation notes gathered while normalising them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedFields {
    pub fields: ExtractedFields,
    pub validation_errors: Vec<String>,
}

/// Parse a raw reply into schema fields.
///
/// Returns `Err(detail)` only when the reply is not a JSON object.
pub fn parse_response(raw: &str, schema: &FieldSchema) -> Result<NormalizedFields, String> {
    let object = parse_object(raw)?;
    let mut fields = ExtractedFields::new();
    let mut validation_errors = Vec::new();
    let mut month_day = Vec::new();

    for spec in schema.fields() {
        let value = match object.get(&spec.name) {
            None | Some(Value::Null) => FieldValue::Absent,
            Some(v) => match coerce(spec, v) {
                Ok(fv) => fv,
                Err(note) => {
                    match (spec.kind, v.as_str().and_then(parse_month_day)) {
                        (FieldKind::Date, Some(md)) => month_day.push((spec, md, note)),
                        _ => validation_errors.push(note),
                    }
                    FieldValue::Absent
                }
            },
        };
        fields.insert(spec.name.clone(), value);
    }

    let year = reference_year(schema, &fields);
    for (spec, (month, day), note) in month_day {
        match year.and_then(|y| NaiveDate::from_ymd_opt(y, month, day)) {
            Some(date) => fields.insert(spec.name.clone(), FieldValue::Date(date)),
            None => validation_errors.push(note),
        }
    }

    apply_fallbacks(schema, &mut fields);

    for spec in schema.fields().iter().filter(|s| s.required) {
        if fields.get(&spec.name).is_absent() {
            validation_errors.push(format!("missing required field '{}'", spec.name));
        }
    }

    Ok(NormalizedFields {
        fields,
        validation_errors,
    })
}

// ── Step 1–2: Locate and parse the JSON object ───────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:json|JSON)?\s*\n(.*)\n```\s*$").unwrap());

fn strip_code_fences(input: &str) -> &str {
    let trimmed = input.trim();
    match RE_OUTER_FENCES.captures(trimmed) {
        Some(caps) => caps.get(1).map_or(trimmed, |m| m.as_str()),
        None => trimmed,
    }
}

fn parse_object(raw: &str) -> Result<Map<String, Value>, String> {
    let body = strip_code_fences(raw);
    if body.is_empty() {
        return Err("empty response".into());
    }

    let parsed = serde_json::from_str::<Value>(body).or_else(|first_err| {
        // Prose around the object: retry on the outermost brace span.
        match (body.find('{'), body.rfind('}')) {
            (Some(start), Some(end)) if start < end => {
                serde_json::from_str::<Value>(&body[start..=end])
                    .map_err(|_| first_err.to_string())
            }
            _ => Err(first_err.to_string()),
        }
    })?;

    match parsed {
        Value::Object(map) => Ok(map),
        other => Err(format!("expected a JSON object, got {}", json_type(&other))),
    }
}

fn json_type(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ── Step 3: Coerce one value ─────────────────────────────────────────────────

fn coerce(spec: &FieldSpec, value: &Value) -> Result<FieldValue, String> {
    let unparseable = || format!("field '{}': unparseable value {}", spec.name, value);

    match spec.kind {
        FieldKind::Text => Ok(match value {
            Value::String(s) => FieldValue::Text(s.trim().to_string()),
            other => FieldValue::Text(other.to_string()),
        }),
        FieldKind::Date => match value {
            Value::String(s) if s.trim().is_empty() => Ok(FieldValue::Absent),
            Value::String(s) => parse_date(s).map(FieldValue::Date).ok_or_else(unparseable),
            _ => Err(unparseable()),
        },
        FieldKind::Amount => match value {
            Value::String(s) if s.trim().is_empty() => Ok(FieldValue::Absent),
            Value::String(s) => parse_amount(s).map(FieldValue::Amount).ok_or_else(unparseable),
            Value::Number(n) => number_to_decimal(n)
                .map(FieldValue::Amount)
                .ok_or_else(unparseable),
            _ => Err(unparseable()),
        },
        FieldKind::Quantity => match value {
            Value::String(s) if s.trim().is_empty() => Ok(FieldValue::Absent),
            Value::String(s) => parse_quantity(s)
                .map(FieldValue::Quantity)
                .ok_or_else(unparseable),
            Value::Number(n) => number_to_decimal(n)
                .map(FieldValue::Quantity)
                .ok_or_else(unparseable),
            _ => Err(unparseable()),
        },
    }
}

/// Date layouts seen on US utility bills, tried in order. Two-digit years
/// come before four-digit ones so `3/5/24` is not read as year 24.
const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d", "%m/%d/%y", "%m/%d/%Y", "%Y/%m/%d", "%m-%d-%Y", "%B %d, %Y", "%b %d, %Y",
    "%B %d %Y", "%b %d %Y", "%d %B %Y", "%d %b %Y",
];

/// Parse a date in any of [`DATE_FORMATS`]; ISO datetimes keep their date part.
pub fn parse_date(input: &str) -> Option<NaiveDate> {
    let s = input.trim().trim_end_matches('.');
    let s = if s.len() > 10 && s.as_bytes()[10] == b'T' {
        &s[..10]
    } else {
        s
    };
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
}

static RE_MONTH_DAY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(\d{1,2})/(\d{1,2})\s*$").unwrap());

/// `(month, day)` from a year-less `MM/DD`.
fn parse_month_day(input: &str) -> Option<(u32, u32)> {
    let caps = RE_MONTH_DAY.captures(input)?;
    Some((caps[1].parse().ok()?, caps[2].parse().ok()?))
}

/// Year for year-less dates: `invoice_date` when present, else the first
/// full date in schema order.
fn reference_year(schema: &FieldSchema, fields: &ExtractedFields) -> Option<i32> {
    let year_of = |name: &str| match fields.get(name) {
        FieldValue::Date(d) => Some(d.year()),
        _ => None,
    };
    year_of("invoice_date").or_else(|| {
        schema
            .fields()
            .iter()
            .filter(|s| s.kind == FieldKind::Date)
            .find_map(|s| year_of(&s.name))
    })
}

static RE_CURRENCY_CODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:[A-Z]{3}\s+)?(.*?)(?:\s+[A-Z]{3})?$").unwrap());

/// Parse a currency amount such as `$1,234.50`, `USD 12.00`, `(45.10)` or
/// an OCR-damaged `1O4.S0`.
pub fn parse_amount(input: &str) -> Option<Decimal> {
    let trimmed = input.trim();
    let core = RE_CURRENCY_CODE
        .captures(trimmed)
        .and_then(|c| c.get(1))
        .map_or(trimmed, |m| m.as_str());

    let (negative, core) = match core.strip_prefix('(').and_then(|c| c.strip_suffix(')')) {
        Some(inner) => (true, inner),
        None => (false, core),
    };

    let cleaned: String = core
        .chars()
        .filter(|c| !matches!(c, '$' | ',' | ' ' | '\u{a0}'))
        .map(|c| match c {
            'O' | 'o' => '0',
            'S' => '5',
            other => other,
        })
        .collect();

    let value = parse_decimal(&cleaned)?;
    Some(if negative { -value } else { value })
}

static RE_QUANTITY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([-+]?[\d,]*\.?\d+)\s*[A-Za-z]*$").unwrap());

/// Parse a quantity such as `1,234`, `845.5` or `1,234 kWh`.
pub fn parse_quantity(input: &str) -> Option<Decimal> {
    let caps = RE_QUANTITY.captures(input.trim())?;
    let digits = caps.get(1)?.as_str().replace(',', "");
    parse_decimal(&digits)
}

fn parse_decimal(s: &str) -> Option<Decimal> {
    if s.is_empty() {
        return None;
    }
    Decimal::from_str(s)
        .or_else(|_| Decimal::from_scientific(s))
        .ok()
}

/// Keep the textual precision of a JSON number rather than going via `f64`.
fn number_to_decimal(n: &serde_json::Number) -> Option<Decimal> {
    parse_decimal(&n.to_string())
}

// ── Step 4: Fallbacks ────────────────────────────────────────────────────────

fn apply_fallbacks(schema: &FieldSchema, fields: &mut ExtractedFields) {
    for spec in schema.fields() {
        let Some(ref other) = spec.fallback else {
            continue;
        };
        if fields.get(&spec.name).is_absent() {
            let replacement = fields.get(other).clone();
            if !replacement.is_absent() {
                fields.insert(spec.name.clone(), replacement);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn schema() -> FieldSchema {
        FieldSchema::default()
    }

    #[test]
    fn test_strip_fences() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n{}\n```\n"), "{}");
        assert_eq!(strip_code_fences("  {\"a\":1} "), "{\"a\":1}");
    }

    #[test]
    fn test_non_object_is_malformed() {
        assert!(parse_response("[1,2,3]", &schema()).is_err());
        assert!(parse_response("", &schema()).is_err());
        assert!(parse_response("I could not read this bill.", &schema()).is_err());
    }

    #[test]
    fn test_object_inside_prose_is_recovered() {
        let n = parse_response("Here you go: {\"vendor\": \"Duke Energy\"} Thanks!", &schema())
            .unwrap();
        assert_eq!(
            n.fields.get("vendor"),
            &FieldValue::Text("Duke Energy".into())
        );
    }

    #[test]
    fn test_missing_and_null_are_absent_empty_text_is_not() {
        let n = parse_response(r#"{"vendor": "", "due_date": null}"#, &schema()).unwrap();
        assert_eq!(n.fields.get("vendor"), &FieldValue::Text(String::new()));
        assert!(n.fields.get("due_date").is_absent());
        assert!(n.fields.get("service_to").is_absent());
        // Every schema field is present in the map, absent or not.
        assert_eq!(n.fields.len(), schema().fields().len());
    }

    #[test]
    fn test_dates_normalised_to_iso() {
        for (input, expected) in [
            ("2024-03-15", "2024-03-15"),
            ("03/15/2024", "2024-03-15"),
            ("3/5/24", "2024-03-05"),
            ("March 15, 2024", "2024-03-15"),
            ("Mar 15, 2024", "2024-03-15"),
            ("15 March 2024", "2024-03-15"),
            ("2024-03-15T00:00:00Z", "2024-03-15"),
        ] {
            let d = parse_date(input).unwrap_or_else(|| panic!("failed on {input}"));
            assert_eq!(d.format("%Y-%m-%d").to_string(), expected, "input {input}");
        }
        assert_eq!(parse_date("03/15"), None);
        assert_eq!(parse_date("soon"), None);
    }

    #[test]
    fn test_amount_cleanup() {
        assert_eq!(parse_amount("$1,234.50"), Some(dec!(1234.50)));
        assert_eq!(parse_amount("USD 12.00"), Some(dec!(12.00)));
        assert_eq!(parse_amount("12.00 USD"), Some(dec!(12.00)));
        assert_eq!(parse_amount("(45.10)"), Some(dec!(-45.10)));
        assert_eq!(parse_amount("1O4.S0"), Some(dec!(104.50)));
        assert_eq!(parse_amount("n/a"), None);
    }

    #[test]
    fn test_quantity_cleanup() {
        assert_eq!(parse_quantity("1,234"), Some(dec!(1234)));
        assert_eq!(parse_quantity("845.5 kWh"), Some(dec!(845.5)));
        assert_eq!(parse_quantity("lots"), None);
    }

    #[test]
    fn test_json_numbers_keep_precision() {
        let n = parse_response(r#"{"total": 101.12345, "usage_kwh": 912}"#, &schema()).unwrap();
        assert_eq!(n.fields.get("total"), &FieldValue::Amount(dec!(101.12345)));
        assert_eq!(n.fields.get("usage_kwh"), &FieldValue::Quantity(dec!(912)));
    }

    #[test]
    fn test_unparseable_value_becomes_absent_with_note() {
        let n = parse_response(r#"{"due_date": "next Tuesday"}"#, &schema()).unwrap();
        assert!(n.fields.get("due_date").is_absent());
        assert!(n
            .validation_errors
            .iter()
            .any(|e| e.contains("due_date") && e.contains("unparseable")));
    }

    #[test]
    fn test_fallbacks_fill_absent_fields() {
        let n = parse_response(
            r#"{"invoice_date": "2024-01-31", "total": "88.10", "total_amount_due": null}"#,
            &schema(),
        )
        .unwrap();
        assert_eq!(n.fields.get("bill_date"), n.fields.get("invoice_date"));
        assert_eq!(n.fields.get("total_amount_due"), &FieldValue::Amount(dec!(88.10)));
    }

    #[test]
    fn test_fallback_does_not_override_present_value() {
        let n = parse_response(
            r#"{"invoice_date": "2024-01-31", "bill_date": "2024-02-01"}"#,
            &schema(),
        )
        .unwrap();
        assert_eq!(
            n.fields.get("bill_date").to_raw_string(),
            "2024-02-01".to_string()
        );
    }

    #[test]
    fn test_required_fields_reported() {
        let n = parse_response(r#"{"vendor": "City Water"}"#, &schema()).unwrap();
        assert!(n
            .validation_errors
            .contains(&"missing required field 'account_number'".to_string()));
        assert!(n
            .validation_errors
            .contains(&"missing required field 'invoice_date'".to_string()));

        let ok = parse_response(
            r#"{"account_number": "12-345", "invoice_date": "2024-01-31"}"#,
            &schema(),
        )
        .unwrap();
        assert!(ok.validation_errors.is_empty());
    }

    #[test]
    fn test_month_day_takes_invoice_year() {
        let n = parse_response(
            r#"{"invoice_date": "12/28/2023", "due_date": "01/15", "service_from": "02/30"}"#,
            &schema(),
        )
        .unwrap();
        assert_eq!(
            n.fields.get("due_date"),
            &FieldValue::Date(NaiveDate::from_ymd_opt(2023, 1, 15).unwrap())
        );
        assert!(n.fields.get("service_from").is_absent());
        assert!(n.validation_errors.iter().any(|e| e.contains("service_from")));
        assert!(!n.validation_errors.iter().any(|e| e.contains("due_date")));
    }

    #[test]
    fn test_month_day_without_any_year_is_noted() {
        let n = parse_response(r#"{"due_date": "3/15"}"#, &schema()).unwrap();
        assert!(n.fields.get("due_date").is_absent());
        assert!(n.validation_errors.iter().any(|e| e.contains("due_date")));

        let n = parse_response(r#"{"service_to": "2024-05-31", "due_date": "6/20"}"#, &schema())
            .unwrap();
        assert_eq!(
            n.fields.get("due_date"),
            &FieldValue::Date(NaiveDate::from_ymd_opt(2024, 6, 20).unwrap())
        );
    }
}
