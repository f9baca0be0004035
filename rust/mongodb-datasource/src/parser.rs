//! Surface-language parsers that normalise query text into a JSON pipeline.
//!
//! Only the JSON and legacy `db.<collection>.aggregate(...)` forms live here;
//! evaluated scripts go through [`crate::sandbox`].

use crate::error::TranslateError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

/// `db.<collection>.aggregate(<pipeline>)`. The collection stops at the first
/// `.aggregate(` and the pipeline runs to the final `)`.
static LEGACY_CALL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^db\.(.+?)\.aggregate\((.+)\)$").expect("legacy call pattern must compile")
});

/// Parsed but not yet substituted pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalPipeline {
    /// JSON array literal of stage objects.
    pub pipeline_text: String,
    /// Collection named by the query text itself, when the language carries one.
    pub collection: Option<String>,
}

impl CanonicalPipeline {
    pub fn new(pipeline_text: impl Into<String>) -> Self {
        Self {
            pipeline_text: pipeline_text.into(),
            collection: None,
        }
    }
}

/// Checks that `text` is a JSON array. Mirrors the editor check: empty text
/// asks for input, anything else that is not an array is an invalid query.
pub fn validate_json_pipeline_text(text: &str) -> Result<(), TranslateError> {
    if text.trim().is_empty() {
        return Err(TranslateError::EmptyQuery);
    }

    match serde_json::from_str::<Value>(text) {
        Ok(Value::Array(_)) => Ok(()),
        Ok(other) => {
            debug!(kind = json_kind(&other), "query text is not a JSON array");
            Err(TranslateError::malformed(format!(
                "expected a JSON array, found {}",
                json_kind(&other)
            )))
        }
        Err(err) => {
            debug!(error = %err, "query text is not valid JSON");
            Err(TranslateError::malformed(err.to_string()))
        }
    }
}

/// JSON mode: the text is the pipeline.
pub fn parse_json(raw_text: &str) -> Result<CanonicalPipeline, TranslateError> {
    validate_json_pipeline_text(raw_text)?;
    Ok(CanonicalPipeline::new(raw_text))
}

/// Legacy mode: extracts the collection and pipeline from
/// `db.<collection>.aggregate(<pipeline>)`.
pub fn parse_legacy_js(raw_text: &str) -> Result<CanonicalPipeline, TranslateError> {
    if raw_text.trim().is_empty() {
        return Err(TranslateError::EmptyQuery);
    }

    let normalized = normalize_legacy_text(raw_text);
    let captures = LEGACY_CALL.captures(&normalized).ok_or_else(|| {
        TranslateError::malformed("expected db.<collection>.aggregate(<pipeline>)")
    })?;

    let collection = captures[1].to_string();
    let pipeline_text = captures[2].to_string();
    validate_json_pipeline_text(&pipeline_text)?;

    Ok(CanonicalPipeline {
        pipeline_text,
        collection: Some(collection),
    })
}

/// Trims, drops one trailing `;` and removes line breaks.
fn normalize_legacy_text(raw_text: &str) -> String {
    let trimmed = raw_text.trim();
    let without_semicolon = trimmed.strip_suffix(';').unwrap_or(trimmed).trim_end();
    without_semicolon
        .chars()
        .filter(|ch| *ch != '\n' && *ch != '\r')
        .collect()
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn json_mode_passes_text_through() {
        let text = "[ {\"$match\": {\"status\": \"ok\"}}, {\"$limit\": 10} ]";
        let parsed = parse_json(text).unwrap();
        assert_eq!(parsed.pipeline_text, text);
        assert_eq!(parsed.collection, None);
    }

    #[test]
    fn json_mode_empty_text_asks_for_input() {
        assert_eq!(parse_json(""), Err(TranslateError::EmptyQuery));
        assert_eq!(
            parse_json("").unwrap_err().to_string(),
            "Please enter the query text"
        );
    }

    #[test]
    fn json_mode_rejects_non_arrays() {
        for text in ["{}", "1", "\"$match\"", "null", "[{\"$match\": {}"] {
            let err = parse_json(text).unwrap_err();
            assert!(
                matches!(err, TranslateError::MalformedSyntax { .. }),
                "{text} should be malformed, got {err:?}"
            );
            assert_eq!(err.to_string(), "Invalid query");
        }
    }

    #[test]
    fn legacy_mode_extracts_collection_and_pipeline() {
        let parsed = parse_legacy_js(r#"db.orders.aggregate([{"$match":{}}])"#).unwrap();
        assert_eq!(parsed.collection.as_deref(), Some("orders"));
        assert_eq!(parsed.pipeline_text, r#"[{"$match":{}}]"#);
    }

    #[test]
    fn legacy_mode_tolerates_semicolon_and_newlines() {
        let text = "  db.sales.daily.aggregate([\n  {\"$sort\": {\"ts\": 1}},\n  {\"$limit\": 5}\n]);\n";
        let parsed = parse_legacy_js(text).unwrap();
        assert_eq!(parsed.collection.as_deref(), Some("sales.daily"));
        assert_eq!(
            parsed.pipeline_text,
            "[  {\"$sort\": {\"ts\": 1}},  {\"$limit\": 5}]"
        );
    }

    #[test]
    fn legacy_mode_collection_stops_at_first_aggregate_call() {
        let parsed =
            parse_legacy_js(r#"db.events.aggregate([{"$match":{"note":".aggregate("}}])"#).unwrap();
        assert_eq!(parsed.collection.as_deref(), Some("events"));
    }

    #[test]
    fn legacy_mode_rejects_other_shapes() {
        for text in [
            "db.orders.find({})",
            "orders.aggregate([])",
            "db..aggregate([])",
            "db.orders.aggregate()",
        ] {
            let err = parse_legacy_js(text).unwrap_err();
            assert_eq!(err.to_string(), "Invalid query", "{text}");
        }
    }

    #[test]
    fn legacy_mode_requires_json_pipeline() {
        let err = parse_legacy_js("db.orders.aggregate({\"$match\": {}})").unwrap_err();
        assert!(matches!(err, TranslateError::MalformedSyntax { .. }));

        let err = parse_legacy_js("db.orders.aggregate([{$match: {}}])").unwrap_err();
        assert!(matches!(err, TranslateError::MalformedSyntax { .. }));
    }

    #[test]
    fn legacy_mode_empty_text_asks_for_input() {
        assert_eq!(parse_legacy_js("   "), Err(TranslateError::EmptyQuery));
    }
}
