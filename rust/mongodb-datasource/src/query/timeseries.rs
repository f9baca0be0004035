//! Time-series frames: one frame per series name, `time` + `Value` columns.

use super::frame::{cell, Field, FieldType, Frame};
use crate::error::TranslateError;
use bson::{Bson, Document};
use serde_json::Value;

const DEFAULT_SERIES: &str = "value";

struct Series {
    name: String,
    times: Vec<Value>,
    values: Vec<Value>,
    value_type: Option<FieldType>,
}

impl Series {
    fn new(name: String) -> Self {
        Self {
            name,
            times: Vec::new(),
            values: Vec::new(),
            value_type: None,
        }
    }

    fn widen(&mut self, kind: FieldType) {
        self.value_type = match (self.value_type, kind) {
            (None, kind) => Some(kind),
            (Some(FieldType::Double), _) | (_, FieldType::Double) => Some(FieldType::Double),
            (Some(FieldType::Int64), _) | (_, FieldType::Int64) => Some(FieldType::Int64),
            (current, _) => current,
        };
    }

    fn into_frame(self) -> Frame {
        let values = if self.value_type == Some(FieldType::Double) {
            self.values
                .into_iter()
                .map(|value| match value.as_f64() {
                    Some(number) => serde_json::Number::from_f64(number)
                        .map_or(Value::Null, Value::Number),
                    None => value,
                })
                .collect()
        } else {
            self.values
        };

        Frame {
            name: self.name,
            ref_id: None,
            fields: vec![
                Field {
                    name: "time".to_string(),
                    field_type: Some(FieldType::Time),
                    values: self.times,
                },
                Field {
                    name: "Value".to_string(),
                    field_type: self.value_type,
                    values,
                },
            ],
        }
    }
}

/// Groups `{ts, value, name?}` rows into frames ordered by first appearance.
pub fn timeseries_frames(rows: &[Document]) -> Result<Vec<Frame>, TranslateError> {
    let mut series: Vec<Series> = Vec::new();

    for row in rows {
        let ts = row.get("ts");
        let value = row.get("value");
        if ts.is_none() && value.is_none() {
            continue;
        }

        let Some(Bson::DateTime(instant)) = ts else {
            return Err(TranslateError::Frame("ts should be timestamp".to_string()));
        };

        let (kind, value) = match value {
            None => (None, Value::Null),
            Some(value) => match cell(value) {
                (Some(kind), value) if kind.is_numeric() => (Some(kind), value),
                (None, _) => (None, Value::Null),
                _ => return Err(TranslateError::Frame("value should be numeric".to_string())),
            },
        };

        let name = match row.get("name") {
            Some(Bson::String(name)) => name.clone(),
            _ => DEFAULT_SERIES.to_string(),
        };

        let index = match series.iter().position(|entry| entry.name == name) {
            Some(index) => index,
            None => {
                series.push(Series::new(name));
                series.len() - 1
            }
        };

        let entry = &mut series[index];
        if let Some(kind) = kind {
            entry.widen(kind);
        }
        entry.times.push(Value::from(instant.timestamp_millis()));
        entry.values.push(value);
    }

    Ok(series.into_iter().map(Series::into_frame).collect())
}
