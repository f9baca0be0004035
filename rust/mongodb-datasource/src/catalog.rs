//! Aggregation operator vocabulary shared by the validator and the editor API.
//!
//! The table is parsed from embedded data exactly once at startup and is
//! read-only afterwards, so concurrent readers need no synchronisation.

use anyhow::{bail, Context, Result};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

const OPERATOR_DATA: &str = include_str!("../data/operators.json");
const DOCS_BASE_URL: &str = "https://www.mongodb.com/docs/manual/reference/operator/aggregation";

static GLOBAL: OnceCell<StageOperatorCatalog> = OnceCell::new();

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StageOperator {
    pub name: String,
    pub description: String,
    pub snippet: String,
}

#[derive(Debug, Deserialize)]
struct RawCatalog {
    stages: Vec<StageOperator>,
    expression: Vec<String>,
    accumulators: Vec<String>,
    conversion: Vec<String>,
    query: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageOperatorCatalog {
    pub stages: Vec<StageOperator>,
    pub expression: Vec<String>,
    pub accumulators: Vec<String>,
    pub conversion: Vec<String>,
    pub query: Vec<String>,
    #[serde(skip)]
    stage_names: HashSet<String>,
}

impl StageOperatorCatalog {
    /// Parses the embedded operator table.
    pub fn load() -> Result<Self> {
        Self::from_json(OPERATOR_DATA)
    }

    fn from_json(raw: &str) -> Result<Self> {
        let raw: RawCatalog =
            serde_json::from_str(raw).context("operator catalog is not valid JSON")?;

        if raw.stages.is_empty() {
            bail!("operator catalog contains no stage operators");
        }

        let mut stage_names = HashSet::with_capacity(raw.stages.len());
        for stage in &raw.stages {
            if !stage.name.starts_with('$') {
                bail!("stage operator '{}' must start with '$'", stage.name);
            }
            if !stage_names.insert(stage.name.clone()) {
                bail!("stage operator '{}' is listed twice", stage.name);
            }
        }

        Ok(Self {
            stages: raw.stages,
            expression: raw.expression,
            accumulators: raw.accumulators,
            conversion: raw.conversion,
            query: raw.query,
            stage_names,
        })
    }

    /// The process-wide catalog. `run` forces it before serving so a broken
    /// table aborts startup instead of failing individual requests.
    pub fn global() -> Result<&'static Self> {
        GLOBAL.get_or_try_init(Self::load)
    }

    pub fn is_stage(&self, name: &str) -> bool {
        self.stage_names.contains(name)
    }

    pub fn stage(&self, name: &str) -> Option<&StageOperator> {
        self.stages.iter().find(|stage| stage.name == name)
    }

    pub fn stage_names(&self) -> impl Iterator<Item = &str> {
        self.stages.iter().map(|stage| stage.name.as_str())
    }

    /// Reference documentation link for a stage, e.g. `$match` ->
    /// `.../aggregation/match`.
    pub fn docs_url(&self, name: &str) -> Option<String> {
        self.stage(name)
            .map(|stage| format!("{DOCS_BASE_URL}/{}", stage.name.trim_start_matches('$')))
    }
}
