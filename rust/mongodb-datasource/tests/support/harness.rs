use async_trait::async_trait;
use axum::{
    body::{self, Body},
    http::{self, Request, StatusCode},
    Router,
};
use bson::Document;
use mongodb_datasource::{
    catalog::StageOperatorCatalog,
    config::AppConfig,
    db::{HealthStatus, PipelineExecutor},
    models::AggregateOptions,
    schema::ValidatedPipeline,
    server::Server,
    state::API_KEY_HEADER,
};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::{Arc, Once},
};
use tower::ServiceExt;

pub const API_KEY: &str = "test-api-key";

static TRACING_INIT: Once = Once::new();

/// One aggregate call as the fake database saw it.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub collection: String,
    pub pipeline_text: String,
    pub stages: Vec<Document>,
    pub options: AggregateOptions,
}

/// In-memory database collaborator: canned rows per collection, recorded calls.
#[derive(Default)]
pub struct FakeExecutor {
    rows: Mutex<HashMap<String, Vec<Document>>>,
    failures: Mutex<HashMap<String, String>>,
    calls: Mutex<Vec<RecordedCall>>,
    unhealthy: Mutex<Option<String>>,
}

impl FakeExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_rows(self: &Arc<Self>, collection: &str, rows: Vec<Document>) -> Arc<Self> {
        self.rows.lock().insert(collection.to_string(), rows);
        Arc::clone(self)
    }

    pub fn failing(self: &Arc<Self>, collection: &str, message: &str) -> Arc<Self> {
        self.failures
            .lock()
            .insert(collection.to_string(), message.to_string());
        Arc::clone(self)
    }

    pub fn unhealthy(self: &Arc<Self>, message: &str) -> Arc<Self> {
        *self.unhealthy.lock() = Some(message.to_string());
        Arc::clone(self)
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl PipelineExecutor for FakeExecutor {
    async fn aggregate(
        &self,
        pipeline: &ValidatedPipeline,
        options: &AggregateOptions,
    ) -> anyhow::Result<Vec<Document>> {
        self.calls.lock().push(RecordedCall {
            collection: pipeline.collection().to_string(),
            pipeline_text: pipeline.pipeline_text().to_string(),
            stages: pipeline.stages().to_vec(),
            options: options.clone(),
        });

        if let Some(message) = self.failures.lock().get(pipeline.collection()) {
            anyhow::bail!("{message}");
        }
        Ok(self
            .rows
            .lock()
            .get(pipeline.collection())
            .cloned()
            .unwrap_or_default())
    }

    async fn list_collections(&self) -> anyhow::Result<Vec<String>> {
        let mut names: Vec<_> = self.rows.lock().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn check_health(&self) -> HealthStatus {
        match self.unhealthy.lock().clone() {
            Some(message) => HealthStatus::failed(message),
            None => HealthStatus::healthy(),
        }
    }
}

#[derive(Clone)]
pub struct DatasourceTestHarness {
    router: Router,
    api_key: Option<String>,
}

impl DatasourceTestHarness {
    pub fn new(executor: Arc<FakeExecutor>) -> Self {
        Self::with_config(executor, AppConfig::for_tests())
    }

    pub fn with_api_key(executor: Arc<FakeExecutor>) -> Self {
        let config = AppConfig {
            api_key: Some(API_KEY.to_string()),
            ..AppConfig::for_tests()
        };
        Self::with_config(executor, config)
    }

    pub fn with_config(executor: Arc<FakeExecutor>, config: AppConfig) -> Self {
        TRACING_INIT.call_once(|| {
            let _ = tracing_subscriber::fmt::try_init();
        });

        let api_key = config.api_key.clone();
        let catalog = StageOperatorCatalog::global().expect("embedded catalog should load");
        let server = Server::with_executor(config, catalog, executor);
        Self {
            router: server.router(),
            api_key,
        }
    }

    pub async fn post<T: Serialize>(&self, path: &str, payload: &T) -> http::Response<Body> {
        let body = serde_json::to_vec(payload).expect("request payload should serialize");
        self.send("POST", path, Body::from(body), true).await
    }

    pub async fn get(&self, path: &str) -> http::Response<Body> {
        self.send("GET", path, Body::empty(), true).await
    }

    #[allow(dead_code)]
    pub async fn post_without_api_key<T: Serialize>(
        &self,
        path: &str,
        payload: &T,
    ) -> http::Response<Body> {
        let body = serde_json::to_vec(payload).expect("request payload should serialize");
        self.send("POST", path, Body::from(body), false).await
    }

    async fn send(
        &self,
        method: &str,
        path: &str,
        body: Body,
        include_api_key: bool,
    ) -> http::Response<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header(http::header::CONTENT_TYPE, "application/json");

        if include_api_key {
            if let Some(key) = &self.api_key {
                builder = builder.header(API_KEY_HEADER, key);
            }
        }

        let request = builder
            .body(body)
            .expect("failed to build harness request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router should handle harness request")
    }
}

pub async fn read_json(response: http::Response<Body>) -> (StatusCode, Value) {
    let status = response.status();
    let bytes = body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("response body should deserialize");
    let value =
        serde_json::from_slice::<Value>(&bytes).expect("response body should be valid JSON");
    (status, value)
}
