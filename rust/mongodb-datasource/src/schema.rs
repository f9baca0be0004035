//! Pipeline shape validation against the stage operator catalog.

use crate::{catalog::StageOperatorCatalog, error::TranslateError};
use bson::{Bson, Document};
use serde::{
    de::{IgnoredAny, MapAccess, Visitor},
    Deserialize, Deserializer, Serialize,
};
use serde_json::Value;
use std::{collections::HashSet, fmt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    /// Array of stage documents, keys unchecked.
    #[default]
    Shape,
    /// Every stage has exactly one key and it is a known stage operator.
    Strict,
}

/// Pipeline ready for the database. Only [`validate_pipeline`] builds one.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedPipeline {
    pipeline_text: String,
    collection: String,
    stages: Vec<Document>,
}

impl ValidatedPipeline {
    pub fn pipeline_text(&self) -> &str {
        &self.pipeline_text
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn stages(&self) -> &[Document] {
        &self.stages
    }

    pub fn into_stages(self) -> Vec<Document> {
        self.stages
    }
}

/// Decodes `pipeline_text` as extended JSON and checks its shape. Decoder
/// messages are passed through; stage positions are zero-based.
pub fn validate(
    pipeline_text: &str,
    catalog: &StageOperatorCatalog,
    mode: ValidationMode,
) -> Result<Vec<Document>, TranslateError> {
    let value: Value = serde_json::from_str(pipeline_text)
        .map_err(|err| TranslateError::schema(err.to_string(), None))?;
    let decoded =
        Bson::try_from(value).map_err(|err| TranslateError::schema(err.to_string(), None))?;

    let Bson::Array(elements) = decoded else {
        return Err(TranslateError::schema("pipeline must be an array", None));
    };

    let stages = elements
        .into_iter()
        .enumerate()
        .map(|(index, element)| match element {
            Bson::Document(stage) => {
                if mode == ValidationMode::Strict {
                    check_stage(&stage, catalog).map_err(|msg| TranslateError::schema(msg, Some(index)))?;
                }
                Ok(stage)
            }
            other => Err(TranslateError::schema(
                format!("stage must be an object, found {}", bson_kind(&other)),
                Some(index),
            )),
        })
        .collect::<Result<Vec<_>, _>>()?;

    // Decoding keeps only the last of repeated keys, so strict mode rereads the
    // raw text for them.
    if mode == ValidationMode::Strict {
        if let Some((index, name)) = duplicate_stage_key(pipeline_text) {
            return Err(TranslateError::schema(
                format!("duplicate stage operator \"{name}\""),
                Some(index),
            ));
        }
    }

    Ok(stages)
}

/// Validates the substituted text and binds it to its collection.
pub fn validate_pipeline(
    pipeline_text: String,
    collection: Option<&str>,
    catalog: &StageOperatorCatalog,
    mode: ValidationMode,
) -> Result<ValidatedPipeline, TranslateError> {
    let stages = validate(&pipeline_text, catalog, mode)?;
    let collection = collection
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .ok_or(TranslateError::CollectionMissing)?;

    Ok(ValidatedPipeline {
        pipeline_text,
        collection: collection.to_string(),
        stages,
    })
}

fn check_stage(stage: &Document, catalog: &StageOperatorCatalog) -> Result<(), String> {
    let mut keys = stage.keys();
    match (keys.next(), keys.next()) {
        (None, _) => Err("stage must have exactly one operator, found none".to_string()),
        (Some(name), None) if catalog.is_stage(name) => Ok(()),
        (Some(name), None) => Err(format!("unknown stage operator \"{name}\"")),
        (Some(_), Some(_)) => Err(format!(
            "stage must have exactly one operator, found {}",
            stage.len()
        )),
    }
}

/// Keys of one stage object in source order, repeats included.
struct StageKeys(Vec<String>);

impl<'de> Deserialize<'de> for StageKeys {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct KeysVisitor;

        impl<'de> Visitor<'de> for KeysVisitor {
            type Value = StageKeys;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a stage object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<StageKeys, A::Error> {
                let mut keys = Vec::new();
                while let Some(key) = map.next_key::<String>()? {
                    map.next_value::<IgnoredAny>()?;
                    keys.push(key);
                }
                Ok(StageKeys(keys))
            }
        }

        deserializer.deserialize_map(KeysVisitor)
    }
}

/// First stage whose object repeats a key, with the repeated key.
fn duplicate_stage_key(pipeline_text: &str) -> Option<(usize, String)> {
    let stages: Vec<StageKeys> = serde_json::from_str(pipeline_text).ok()?;
    stages.into_iter().enumerate().find_map(|(index, StageKeys(keys))| {
        let mut seen = HashSet::new();
        keys.into_iter()
            .find(|key| !seen.insert(key.clone()))
            .map(|key| (index, key))
    })
}

fn bson_kind(value: &Bson) -> &'static str {
    match value {
        Bson::Null | Bson::Undefined => "null",
        Bson::Boolean(_) => "boolean",
        Bson::String(_) | Bson::Symbol(_) => "string",
        Bson::Array(_) => "array",
        Bson::Document(_) => "object",
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_) => "number",
        Bson::DateTime(_) => "date",
        Bson::ObjectId(_) => "objectId",
        _ => "scalar",
    }
}
