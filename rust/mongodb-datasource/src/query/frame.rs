//! Column-oriented frames built from aggregation result documents.

use crate::error::TranslateError;
use bson::{Bson, Document};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldType {
    Boolean,
    Int32,
    Int64,
    Double,
    String,
    Time,
    ObjectId,
    Json,
}

impl FieldType {
    pub fn as_str(self) -> &'static str {
        match self {
            FieldType::Boolean => "boolean",
            FieldType::Int32 => "int32",
            FieldType::Int64 => "int64",
            FieldType::Double => "double",
            FieldType::String => "string",
            FieldType::Time => "time",
            FieldType::ObjectId => "objectId",
            FieldType::Json => "json",
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, FieldType::Int32 | FieldType::Int64 | FieldType::Double)
    }
}

/// A named column. Time values are epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Field {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: Option<FieldType>,
    pub values: Vec<Value>,
}

impl Field {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_type: None,
            values: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ref_id: Option<String>,
    pub fields: Vec<Field>,
}

impl Frame {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ref_id: None,
            fields: Vec::new(),
        }
    }

    pub fn with_ref_id(mut self, ref_id: impl Into<String>) -> Self {
        self.ref_id = Some(ref_id.into());
        self
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn row_count(&self) -> usize {
        self.fields.first().map_or(0, |field| field.values.len())
    }
}

/// Cell value and the column type it implies. `None` for nulls.
pub(crate) fn cell(value: &Bson) -> (Option<FieldType>, Value) {
    match value {
        Bson::Null | Bson::Undefined => (None, Value::Null),
        Bson::Boolean(flag) => (Some(FieldType::Boolean), Value::Bool(*flag)),
        Bson::Int32(number) => (Some(FieldType::Int32), Value::from(*number)),
        Bson::Int64(number) => (Some(FieldType::Int64), Value::from(*number)),
        Bson::Double(number) => (
            Some(FieldType::Double),
            serde_json::Number::from_f64(*number).map_or(Value::Null, Value::Number),
        ),
        Bson::String(text) => (Some(FieldType::String), Value::String(text.clone())),
        Bson::DateTime(instant) => (
            Some(FieldType::Time),
            Value::from(instant.timestamp_millis()),
        ),
        Bson::ObjectId(id) => (Some(FieldType::ObjectId), Value::String(id.to_hex())),
        Bson::Document(_) | Bson::Array(_) => (
            Some(FieldType::Json),
            Value::String(value.clone().into_relaxed_extjson().to_string()),
        ),
        other => (
            Some(FieldType::String),
            Value::String(other.clone().into_relaxed_extjson().to_string()),
        ),
    }
}

/// Single "Table" frame. Columns appear in first-seen order and are typed by
/// their first non-null value; missing cells are null.
pub fn table_frame(rows: &[Document]) -> Result<Frame, TranslateError> {
    let mut frame = Frame::new("Table");

    for (row_index, row) in rows.iter().enumerate() {
        for (key, value) in row {
            let position = match frame.fields.iter().position(|field| &field.name == key) {
                Some(position) => position,
                None => {
                    let mut field = Field::new(key.clone());
                    field.values.resize(row_index, Value::Null);
                    frame.fields.push(field);
                    frame.fields.len() - 1
                }
            };

            let field = &mut frame.fields[position];
            let (kind, cell) = cell(value);
            match (field.field_type, kind) {
                (_, None) => {}
                (None, Some(kind)) => field.field_type = Some(kind),
                (Some(expected), Some(kind)) if expected != kind => {
                    return Err(TranslateError::Frame(format!(
                        "field \"{key}\" should have {} type",
                        expected.as_str()
                    )));
                }
                _ => {}
            }
            field.values.push(cell);
        }

        for field in &mut frame.fields {
            field.values.resize(row_index + 1, Value::Null);
        }
    }

    Ok(frame)
}
