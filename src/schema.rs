//! Field schema and extracted values.
//!
//! The schema is an ordered list of [`FieldSpec`]s. Order matters: it drives
//! the prompt sent to the model and the column order of every export.
//!
//! Extracted values keep "not found" ([`FieldValue::Absent`]) distinct from
//! "found and empty" (`FieldValue::Text(String::new())`).

use chrono::NaiveDate;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The expected type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// Free text, kept verbatim (trimmed).
    Text,
    /// Calendar date, normalised to ISO `YYYY-MM-DD`.
    Date,
    /// Currency amount, exact decimal.
    Amount,
    /// Numeric quantity such as kWh.
    Quantity,
}

impl FieldKind {
    /// Hint appended to each key in the extraction prompt.
    pub fn prompt_hint(&self) -> &'static str {
        match self {
            FieldKind::Text => "text",
            FieldKind::Date => "date, YYYY-MM-DD",
            FieldKind::Amount => "number, no currency symbol",
            FieldKind::Quantity => "number",
        }
    }
}

/// One named field to extract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    /// Absent values add a validation error.
    #[serde(default)]
    pub required: bool,
    /// Copy this other field's value when this one is absent.
    #[serde(default)]
    pub fallback: Option<String>,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            fallback: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn fallback(mut self, other: impl Into<String>) -> Self {
        self.fallback = Some(other.into());
        self
    }
}

/// Ordered set of fields the extractor is asked for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldSchema {
    fields: Vec<FieldSpec>,
}

impl FieldSchema {
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn get(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Check names are unique and non-empty and fallbacks point at known
    /// fields of the same kind.
    pub fn validate(&self) -> Result<(), String> {
        if self.fields.is_empty() {
            return Err("field schema is empty".into());
        }
        let mut seen = std::collections::HashSet::new();
        for f in &self.fields {
            if f.name.trim().is_empty() {
                return Err("field name must not be empty".into());
            }
            if !seen.insert(f.name.as_str()) {
                return Err(format!("duplicate field '{}'", f.name));
            }
        }
        for f in &self.fields {
            if let Some(ref other) = f.fallback {
                match self.get(other) {
                    None => {
                        return Err(format!(
                            "field '{}' falls back to unknown field '{}'",
                            f.name, other
                        ))
                    }
                    Some(o) if o.kind != f.kind => {
                        return Err(format!(
                            "field '{}' ({:?}) cannot fall back to '{}' ({:?})",
                            f.name, f.kind, other, o.kind
                        ))
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(())
    }
}

impl Default for FieldSchema {
    /// The utility-invoice schema.
    fn default() -> Self {
        use FieldKind::*;
        Self::new(vec![
            FieldSpec::new("vendor", Text),
            FieldSpec::new("account_number", Text).required(),
            FieldSpec::new("invoice_date", Date).required(),
            FieldSpec::new("bill_date", Date).fallback("invoice_date"),
            FieldSpec::new("due_date", Date),
            FieldSpec::new("service_from", Date),
            FieldSpec::new("service_to", Date),
            FieldSpec::new("usage_kwh", Quantity),
            FieldSpec::new("currency", Text),
            FieldSpec::new("total_current_charges", Amount),
            FieldSpec::new("total", Amount),
            FieldSpec::new("total_amount_due", Amount).fallback("total"),
        ])
    }
}

/// A single extracted value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    /// The extractor could not locate the field.
    Absent,
    Text(String),
    Date(NaiveDate),
    Amount(Decimal),
    Quantity(Decimal),
}

impl FieldValue {
    pub fn is_absent(&self) -> bool {
        matches!(self, FieldValue::Absent)
    }

    /// Full-precision rendering used by the staging export.
    pub fn to_raw_string(&self) -> String {
        match self {
            FieldValue::Absent => String::new(),
            FieldValue::Text(s) => s.clone(),
            FieldValue::Date(d) => d.format("%Y-%m-%d").to_string(),
            FieldValue::Amount(a) => a.normalize().to_string(),
            FieldValue::Quantity(q) => q.normalize().to_string(),
        }
    }

    /// Human-facing rendering: amounts always carry exactly two decimals.
    pub fn to_display_string(&self) -> String {
        match self {
            FieldValue::Amount(a) => {
                let rounded = a.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
                format!("{:.2}", rounded)
            }
            other => other.to_raw_string(),
        }
    }
}

/// Field name → value for one extraction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExtractedFields(BTreeMap<String, FieldValue>);

impl ExtractedFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: FieldValue) {
        self.0.insert(name.into(), value);
    }

    /// Unknown names read as absent.
    pub fn get(&self, name: &str) -> &FieldValue {
        self.0.get(name).unwrap_or(&FieldValue::Absent)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.0.iter()
    }

    /// Number of fields that were actually found.
    pub fn present_count(&self) -> usize {
        self.0.values().filter(|v| !v.is_absent()).count()
    }
}
