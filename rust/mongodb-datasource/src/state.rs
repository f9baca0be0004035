use crate::{
    catalog::StageOperatorCatalog,
    config::AppConfig,
    error::{Result, ServiceError},
    query::QueryEngine,
};
use axum::http::HeaderMap;
use std::sync::Arc;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Shared handler state: configuration, the query engine and the operator
/// catalog served to editors.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub engine: QueryEngine,
    pub catalog: &'static StageOperatorCatalog,
}

impl AppState {
    pub fn new(
        config: Arc<AppConfig>,
        engine: QueryEngine,
        catalog: &'static StageOperatorCatalog,
    ) -> Self {
        Self {
            config,
            engine,
            catalog,
        }
    }

    /// Checks `x-api-key` when a key is configured; open otherwise.
    pub fn authorize(&self, headers: &HeaderMap) -> Result<()> {
        let Some(expected) = self.config.api_key.as_deref() else {
            return Ok(());
        };

        let provided = headers
            .get(API_KEY_HEADER)
            .and_then(|value| value.to_str().ok());
        if provided == Some(expected) {
            Ok(())
        } else {
            Err(ServiceError::Auth)
        }
    }
}
