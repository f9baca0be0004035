//! Dashboard variable queries: a JSON pipeline whose rows carry a `value`.

use super::frame::{FieldType, Frame};
use crate::{
    error::TranslateError,
    models::{QueryLanguage, QueryTarget, QueryType},
    time::TimeRange,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

const VALUE_FIELD: &str = "value";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableQuery {
    pub collection: String,
    pub query_text: String,
    #[serde(default)]
    pub range: Option<TimeRange>,
    #[serde(default)]
    pub variables: HashMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricFindValue {
    pub text: String,
    pub value: Value,
}

impl VariableQuery {
    /// Single JSON table target standing in for the variable query.
    pub fn to_target(&self, id: &str) -> QueryTarget {
        QueryTarget {
            ref_id: format!("variable-query-{id}"),
            query_language: QueryLanguage::Json,
            query_text: self.query_text.clone(),
            collection: Some(self.collection.clone()),
            query_type: QueryType::Table,
            range: self.range,
            variables: self.variables.clone(),
            ..QueryTarget::default()
        }
    }
}

/// Reads `{text, value}` pairs out of the `value` column.
pub fn metric_values(frame: &Frame) -> Result<Vec<MetricFindValue>, TranslateError> {
    let field = frame
        .field(VALUE_FIELD)
        .ok_or_else(|| TranslateError::Frame("value field is missing".to_string()))?;

    match field.field_type {
        Some(kind) if kind == FieldType::String || kind.is_numeric() => {}
        None if field.values.is_empty() => return Ok(Vec::new()),
        _ => {
            return Err(TranslateError::Frame(
                "value field should have string or number type".to_string(),
            ))
        }
    }

    Ok(field
        .values
        .iter()
        .filter(|value| !value.is_null())
        .map(|value| MetricFindValue {
            text: match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            },
            value: value.clone(),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::frame::table_frame;
    use bson::doc;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn builds_json_table_target() {
        let query = VariableQuery {
            collection: "hosts".into(),
            query_text: r#"[{"$project":{"value":"$name"}}]"#.into(),
            ..VariableQuery::default()
        };
        let target = query.to_target("x1");
        assert_eq!(target.ref_id, "variable-query-x1");
        assert_eq!(target.query_language, QueryLanguage::Json);
        assert_eq!(target.query_type, QueryType::Table);
        assert_eq!(target.explicit_collection(), Some("hosts"));
        assert!(!target.is_streaming);
    }

    #[test]
    fn reads_string_and_numeric_values() {
        let frame = table_frame(&[doc! { "value": "a" }, doc! { "value": "b" }]).unwrap();
        assert_eq!(
            metric_values(&frame).unwrap(),
            vec![
                MetricFindValue { text: "a".into(), value: json!("a") },
                MetricFindValue { text: "b".into(), value: json!("b") },
            ]
        );

        let frame = table_frame(&[doc! { "value": 3_i32 }]).unwrap();
        assert_eq!(
            metric_values(&frame).unwrap(),
            vec![MetricFindValue { text: "3".into(), value: json!(3) }]
        );
    }

    #[test]
    fn requires_value_column_of_scalar_type() {
        let frame = table_frame(&[doc! { "name": "a" }]).unwrap();
        assert_eq!(metric_values(&frame).unwrap_err().to_string(), "value field is missing");

        let frame = table_frame(&[doc! { "value": true }]).unwrap();
        assert_eq!(
            metric_values(&frame).unwrap_err().to_string(),
            "value field should have string or number type"
        );
    }
}
