pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod parser;
pub mod query;
pub mod sandbox;
pub mod schema;
pub mod server;
pub mod state;
pub mod telemetry;
pub mod time;
pub mod variables;

use crate::{catalog::StageOperatorCatalog, config::AppConfig, server::Server};

/// Bootstraps the datasource service using environment configuration.
pub async fn run() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    let catalog = StageOperatorCatalog::global()?;
    tracing::info!(stages = catalog.stages.len(), "operator catalog loaded");
    Server::new(config).await?.run().await
}
