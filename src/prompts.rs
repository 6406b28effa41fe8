//! Prompts for VLM-based field extraction.
//!
//! The prompt is generated from the [`FieldSchema`] so that adding a field to
//! the config is enough to have the model look for it. Callers can replace it
//! wholesale via [`crate::config::PipelineConfig::system_prompt`].

use crate::schema::FieldSchema;

/// Fixed preamble of the extraction prompt.
pub const EXTRACTION_PREAMBLE: &str = "You are a strict invoice extractor. \
Read the utility bill IMAGES (one image per page, in page order) and return ONLY a JSON object \
with exactly the keys listed below.";

/// Fixed rules appended after the key list.
pub const EXTRACTION_RULES: &str = r#"Rules:
- Use null for any key you cannot find on the bill. Never guess and never use an empty string for a missing value.
- Dates must be YYYY-MM-DD.
- Amounts and quantities are plain numbers: no currency symbols, no thousands separators.
- Copy text values exactly as printed.
- No prose, no markdown fences: output the JSON object only."#;

/// Build the extraction prompt for `schema`.
pub fn extraction_prompt(schema: &FieldSchema) -> String {
    let mut prompt = String::from(EXTRACTION_PREAMBLE);
    prompt.push_str("\n\nKeys:\n");
    for field in schema.fields() {
        prompt.push_str(&format!("- {} ({})\n", field.name, field.kind.prompt_hint()));
    }
    prompt.push('\n');
    prompt.push_str(EXTRACTION_RULES);
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldKind, FieldSpec};

    #[test]
    fn prompt_lists_every_field_in_order() {
        let schema = FieldSchema::new(vec![
            FieldSpec::new("vendor", FieldKind::Text),
            FieldSpec::new("due_date", FieldKind::Date),
        ]);
        let p = extraction_prompt(&schema);
        let vendor = p.find("- vendor (text)").expect("vendor listed");
        let due = p.find("- due_date (date, YYYY-MM-DD)").expect("due_date listed");
        assert!(vendor < due);
        assert!(p.contains("null"));
    }
}
