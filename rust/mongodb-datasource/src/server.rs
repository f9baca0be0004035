use crate::{
    catalog::StageOperatorCatalog,
    config::AppConfig,
    db::{HealthStatus, MongoExecutor, PipelineExecutor},
    error::Result,
    query::{
        MetricFindValue, QueryEngine, QueryRequest, QueryResponse, TranslateRequest,
        TranslateResponse, Translator, ValidateRequest, ValidateResponse, VariableQuery,
    },
    sandbox::Sandbox,
    state::AppState,
};
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

pub struct Server {
    config: Arc<AppConfig>,
    state: AppState,
}

impl Server {
    pub async fn new(config: AppConfig) -> anyhow::Result<Self> {
        let catalog = StageOperatorCatalog::global()?;
        let executor = MongoExecutor::connect(&config.connection).await?;
        Ok(Self::with_executor(config, catalog, Arc::new(executor)))
    }

    /// Wires the service around an arbitrary database collaborator.
    pub fn with_executor(
        config: AppConfig,
        catalog: &'static StageOperatorCatalog,
        executor: Arc<dyn PipelineExecutor>,
    ) -> Self {
        let config = Arc::new(config);
        let translator = Translator::new(catalog, Sandbox::new(config.sandbox))
            .with_mode(config.validation_mode);
        let query = QueryEngine::new(translator, executor, Arc::clone(&config));
        let state = AppState::new(Arc::clone(&config), query, catalog);

        Self { config, state }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/healthz", get(Self::liveness))
            .route("/api/health", get(Self::health))
            .route("/api/query", post(Self::query))
            .route("/api/translate", post(Self::translate))
            .route("/api/validate", post(Self::validate))
            .route("/api/catalog", get(Self::catalog))
            .route("/api/collections", get(Self::collections))
            .route("/api/variable", post(Self::variable))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.config.listen_addr;
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "mongodb datasource listening");
        axum::serve(listener, self.router()).await?;
        Ok(())
    }

    async fn liveness() -> Json<serde_json::Value> {
        Json(json!({ "status": "ok" }))
    }

    async fn health(
        State(state): State<AppState>,
        headers: HeaderMap,
    ) -> Result<(StatusCode, Json<HealthStatus>)> {
        state.authorize(&headers)?;
        let health = state.engine.health().await;
        let status = if health.ok {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };
        Ok((status, Json(health)))
    }

    async fn query(
        State(state): State<AppState>,
        headers: HeaderMap,
        Json(request): Json<QueryRequest>,
    ) -> Result<Json<QueryResponse>> {
        state.authorize(&headers)?;
        let response = state.engine.execute_query(request).await?;
        Ok(Json(response))
    }

    async fn translate(
        State(state): State<AppState>,
        headers: HeaderMap,
        Json(request): Json<TranslateRequest>,
    ) -> Result<Json<TranslateResponse>> {
        state.authorize(&headers)?;
        let response = state.engine.translate(request).await?;
        Ok(Json(response))
    }

    async fn validate(
        State(state): State<AppState>,
        headers: HeaderMap,
        Json(request): Json<ValidateRequest>,
    ) -> Result<Json<ValidateResponse>> {
        state.authorize(&headers)?;
        let response = state.engine.validate(request).await?;
        Ok(Json(response))
    }

    async fn catalog(
        State(state): State<AppState>,
        headers: HeaderMap,
    ) -> Result<Json<&'static StageOperatorCatalog>> {
        state.authorize(&headers)?;
        Ok(Json(state.catalog))
    }

    async fn collections(
        State(state): State<AppState>,
        headers: HeaderMap,
    ) -> Result<Json<Vec<String>>> {
        state.authorize(&headers)?;
        let names = state.engine.collections().await?;
        Ok(Json(names))
    }

    async fn variable(
        State(state): State<AppState>,
        headers: HeaderMap,
        Json(query): Json<VariableQuery>,
    ) -> Result<Json<Vec<MetricFindValue>>> {
        state.authorize(&headers)?;
        let values = state.engine.metric_find(query).await?;
        Ok(Json(values))
    }
}
